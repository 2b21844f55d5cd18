//! Per-trace state: one slot per traced CPU or thread.

use crate::chunk::allocate_chunks;
use crate::config::{MAX_NUM_ADDR_RANGES, PAGE_SHIFT};
use crate::error::TraceError;
use crate::mtrace::{AddrRange, PtRegs};
use crate::platform::{Bti, DmaBuffer, PhysicalAddress};
use crate::topa::Topa;
use alloc::vec::Vec;
use core::mem;
use kernel_registers::Ia32RtitCtl;
use log::error;

/// Client-requested layout and register values of a trace buffer.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct BufferConfig {
    pub num_chunks: u32,
    /// `log2` of the pages per chunk.
    pub chunk_order: u32,
    /// Wrap around instead of stopping when the buffer is full.
    pub is_circular: bool,
    pub ctl: u64,
    pub cr3_match: u64,
    pub addr_ranges: [AddrRange; MAX_NUM_ADDR_RANGES],
}

/// An allocated trace buffer: chunks, their ToPA ring and the register mirror.
pub struct TraceBuffer<B> {
    config: BufferConfig,
    chunks: Vec<B>,
    topa: Topa<B>,
    regs: PtRegs,
    /// Set when the last retrieved write position was not found in the ring.
    inconsistent: bool,
}

impl<B: DmaBuffer> TraceBuffer<B> {
    /// Allocate chunks and tables for `config`.
    ///
    /// `config` must have been validated. Everything allocated before a
    /// failure is released again.
    ///
    /// # Errors
    /// See [`allocate_chunks`] and [`Topa::build`].
    pub fn allocate<A>(bti: &mut A, config: BufferConfig, table_entries: usize) -> Result<Self, TraceError>
    where
        A: Bti<Buffer = B>,
    {
        let chunks = allocate_chunks(bti, config.num_chunks, config.chunk_order)?;
        let topa = Topa::build(
            bti,
            &chunks,
            PAGE_SHIFT + config.chunk_order,
            table_entries,
            config.is_circular,
        )?;

        let regs = PtRegs {
            ctl: config.ctl,
            status: 0,
            output_base: topa.first_table().as_u64(),
            output_mask_ptrs: 0,
            cr3_match: config.cr3_match,
            addr_ranges: config.addr_ranges,
        };

        Ok(Self {
            config,
            chunks,
            topa,
            regs,
            inconsistent: false,
        })
    }

    #[must_use]
    pub const fn config(&self) -> &BufferConfig {
        &self.config
    }

    #[must_use]
    pub fn chunk(&self, index: usize) -> Option<&B> {
        self.chunks.get(index)
    }

    #[must_use]
    pub const fn topa(&self) -> &Topa<B> {
        &self.topa
    }

    #[must_use]
    pub const fn regs(&self) -> &PtRegs {
        &self.regs
    }

    /// Register values for the hardware: the mirror with ToPA output and
    /// tracing switched on.
    #[must_use]
    pub const fn staged_regs(&self) -> PtRegs {
        let mut regs = self.regs;
        regs.ctl |= Ia32RtitCtl::TOPA | Ia32RtitCtl::TRACE_EN;
        regs
    }

    /// Replace the mirror with values read back from the hardware.
    pub fn retrieved(&mut self, regs: PtRegs) {
        self.regs = regs;
        self.inconsistent = false;
    }

    /// Bytes captured up to the last retrieved write position.
    ///
    /// If the position lies outside the ring the mirror is corrupt; this
    /// reports `0` and marks the buffer inconsistent.
    pub fn capture_end(&mut self) -> u64 {
        let base = PhysicalAddress::new(self.regs.output_base);
        if let Some(size) = self.topa.capture_size(base, self.regs.write_position()) {
            return size;
        }
        if !self.inconsistent {
            error!(
                "write position {base} / {:#x} is outside the ToPA ring",
                self.regs.output_mask_ptrs
            );
            self.inconsistent = true;
        }
        0
    }

    #[must_use]
    pub const fn is_inconsistent(&self) -> bool {
        self.inconsistent
    }
}

/// Lifecycle of one slot. A slot can only be assigned while it holds a
/// buffer.
pub enum Slot<B> {
    Free,
    Allocated(TraceBuffer<B>),
    /// Staged into CPU `cpu`.
    Assigned { buffer: TraceBuffer<B>, cpu: u32 },
}

impl<B> Default for Slot<B> {
    fn default() -> Self {
        Self::Free
    }
}

impl<B> Slot<B> {
    #[must_use]
    pub const fn is_free(&self) -> bool {
        matches!(self, Self::Free)
    }

    #[must_use]
    pub const fn is_assigned(&self) -> bool {
        matches!(self, Self::Assigned { .. })
    }

    #[must_use]
    pub const fn buffer(&self) -> Option<&TraceBuffer<B>> {
        match self {
            Self::Free => None,
            Self::Allocated(buffer) | Self::Assigned { buffer, .. } => Some(buffer),
        }
    }

    pub fn buffer_mut(&mut self) -> Option<&mut TraceBuffer<B>> {
        match self {
            Self::Free => None,
            Self::Allocated(buffer) | Self::Assigned { buffer, .. } => Some(buffer),
        }
    }

    /// Bind an allocated buffer to `cpu`. No-op for other states.
    pub fn assign(&mut self, cpu: u32) {
        *self = match mem::take(self) {
            Self::Allocated(buffer) => Self::Assigned { buffer, cpu },
            other => other,
        };
    }

    /// Undo [`Slot::assign`]. No-op for other states.
    pub fn unassign(&mut self) {
        *self = match mem::take(self) {
            Self::Assigned { buffer, .. } => Self::Allocated(buffer),
            other => other,
        };
    }

    /// Free the buffer, releasing its memory.
    pub fn release(&mut self) {
        *self = Self::Free;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::{PAGE_SIZE, TOPA_MAX_TABLE_ENTRIES};
    use crate::testing::{FakeBti, FakeBuffer};
    use kernel_registers::Ia32RtitOutputMaskPtrs;

    fn config(num_chunks: u32) -> BufferConfig {
        BufferConfig {
            num_chunks,
            ctl: Ia32RtitCtl::OS | Ia32RtitCtl::BRANCH_EN,
            cr3_match: 0x1234_0000,
            ..BufferConfig::default()
        }
    }

    #[test]
    fn mirror_starts_at_first_table() {
        let mut bti = FakeBti::new();
        let b = TraceBuffer::allocate(&mut bti, config(4), TOPA_MAX_TABLE_ENTRIES).unwrap();
        assert_eq!(b.regs().output_base, b.topa().first_table().as_u64());
        assert_eq!(b.regs().ctl, config(4).ctl);
        assert_eq!(b.regs().cr3_match, 0x1234_0000);
        assert_eq!(b.regs().status, 0);
        assert_eq!(b.regs().output_mask_ptrs, 0);

        let staged = b.staged_regs();
        assert!(staged.ctl().trace_en() && staged.ctl().topa());
        assert!(!b.regs().ctl().trace_en());
        // 4 chunks + 1 table.
        assert_eq!(bti.live(), 5);
    }

    #[test]
    fn failed_allocation_leaves_nothing_pinned() {
        // Chunks succeed, the table allocation fails.
        let mut bti = FakeBti::new().fail_after(4);
        assert!(TraceBuffer::allocate(&mut bti, config(4), TOPA_MAX_TABLE_ENTRIES).is_err());
        assert_eq!(bti.live(), 0);
    }

    #[test]
    fn capture_end_flags_unknown_position() {
        let mut bti = FakeBti::new();
        let mut b = TraceBuffer::allocate(&mut bti, config(4), TOPA_MAX_TABLE_ENTRIES).unwrap();

        let mut regs = *b.regs();
        regs.output_mask_ptrs = Ia32RtitOutputMaskPtrs::at(2, 0x10).into_bits();
        b.retrieved(regs);
        assert_eq!(b.capture_end(), 2 * PAGE_SIZE + 0x10);
        assert!(!b.is_inconsistent());

        regs.output_base = 0x42_0000;
        b.retrieved(regs);
        assert_eq!(b.capture_end(), 0);
        assert!(b.is_inconsistent());

        regs.output_base = b.topa().first_table().as_u64();
        b.retrieved(regs);
        assert!(!b.is_inconsistent());
    }

    #[test]
    fn slot_transitions() {
        let mut bti = FakeBti::new();
        let mut slot: Slot<FakeBuffer> = Slot::Free;
        slot.assign(0);
        assert!(slot.is_free());

        slot = Slot::Allocated(TraceBuffer::allocate(&mut bti, config(1), TOPA_MAX_TABLE_ENTRIES).unwrap());
        slot.assign(3);
        assert!(matches!(slot, Slot::Assigned { cpu: 3, .. }));
        slot.unassign();
        assert!(matches!(slot, Slot::Allocated(_)));
        assert!(slot.buffer().is_some());

        slot.release();
        assert!(slot.is_free());
        assert_eq!(bti.live(), 0);
    }
}
