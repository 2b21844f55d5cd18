use crate::Msr;
use bitfield_struct::bitfield;

/// `IA32_RTIT_OUTPUT_MASK_PTRS` (MSR `0x561`).
///
/// In ToPA mode this names the current write position: the entry index
/// within the table at `IA32_RTIT_OUTPUT_BASE`, and the byte offset within
/// that entry's output region.
#[bitfield(u64)]
#[derive(Eq, PartialEq)]
pub struct Ia32RtitOutputMaskPtrs {
    /// Bits 0–6, LowerMask, forced to `0x7F`.
    #[bits(7)]
    pub lower_mask: u8,
    /// Bits 7–31, MaskOrTableOffset: the current ToPA entry index.
    #[bits(25)]
    pub table_entry: u32,
    /// Bits 32–63, OutputOffset into the current output region.
    #[bits(32)]
    pub output_offset: u32,
}

impl Ia32RtitOutputMaskPtrs {
    pub const MSR: Msr = Msr::IA32_RTIT_OUTPUT_MASK_PTRS;

    /// Write position at `offset` bytes into entry `entry`.
    #[must_use]
    pub const fn at(entry: u32, offset: u32) -> Self {
        Self::new()
            .with_lower_mask(0x7F)
            .with_table_entry(entry)
            .with_output_offset(offset)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn write_position_layout() {
        let p = Ia32RtitOutputMaskPtrs::at(3, 0x80);
        assert_eq!(p.into_bits(), (0x80 << 32) | (3 << 7) | 0x7F);

        let p = Ia32RtitOutputMaskPtrs::from_bits(0x0000_1000_0000_02FF);
        assert_eq!(p.table_entry(), 5);
        assert_eq!(p.output_offset(), 0x1000);
    }
}
