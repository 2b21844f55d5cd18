use crate::{CpuidRanges, CpuidResult, CpuidSource};
use bitfield_struct::bitfield;

pub const LEAF_01H: u32 = 0x01;

/// CPUID.01H: Version Information.
///
/// Only EAX is decoded; the feature flags in ECX/EDX are kept raw.
///
/// Reference: Intel SDM Vol. 2A, "CPUID: CPU Identification", leaf 01H.
#[derive(Copy, Clone, Debug)]
pub struct Leaf01h {
    pub eax: Leaf1Eax,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
}

impl Leaf01h {
    /// Query CPUID.01H; returns `None` if `ranges` says leaf 1 is absent.
    #[inline]
    pub fn read(source: &impl CpuidSource, ranges: &CpuidRanges) -> Option<Self> {
        ranges
            .has_basic(LEAF_01H)
            .then(|| Self::from(source.cpuid(LEAF_01H, 0)))
    }

    #[must_use]
    pub const fn from(r: CpuidResult) -> Self {
        Self {
            eax: Leaf1Eax::from_bits(r.eax),
            ebx: r.ebx,
            ecx: r.ecx,
            edx: r.edx,
        }
    }

    #[inline]
    #[must_use]
    pub fn family(&self) -> u16 {
        self.eax.effective_family()
    }

    #[inline]
    #[must_use]
    pub fn model(&self) -> u8 {
        self.eax.effective_model()
    }

    #[inline]
    #[must_use]
    pub const fn stepping(&self) -> u8 {
        self.eax.stepping()
    }
}

/// CPUID.01H:EAX: Version Information.
///
/// Reference: Intel SDM Vol. 2A, CPUID leaf 01H, EAX layout.
#[bitfield(u32)]
pub struct Leaf1Eax {
    /// Stepping ID (bits 3:0).
    #[bits(4)]
    pub stepping: u8,
    /// Base model (bits 7:4).
    #[bits(4)]
    pub model: u8,
    /// Base family (bits 11:8).
    #[bits(4)]
    pub family: u8,
    /// Processor type (bits 13:12).
    #[bits(2)]
    pub cpu_type: u8,
    #[bits(2)]
    __: u8,
    /// Extended model (bits 19:16).
    #[bits(4)]
    pub ext_model: u8,
    /// Extended family (bits 27:20).
    #[bits(8)]
    pub ext_family: u16,
    #[bits(4)]
    __: u8,
}

impl Leaf1Eax {
    /// Base family, plus the extended family when the base is `0x0F`.
    #[inline]
    #[must_use]
    pub fn effective_family(self) -> u16 {
        let fam = u16::from(self.family());
        if fam == 0x0F {
            fam + self.ext_family()
        } else {
            fam
        }
    }

    /// Base model, with the extended model folded in as bits 7:4 when the
    /// *effective* family is `0x06` or `0x0F`.
    #[inline]
    #[must_use]
    pub fn effective_model(self) -> u8 {
        let fam = self.effective_family();
        if fam == 0x06 || fam == 0x0F {
            self.model() | (self.ext_model() << 4)
        } else {
            self.model()
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn skylake_signature() {
        // Family 6, model 0x5E, stepping 3.
        let l = Leaf01h::from(CpuidResult {
            eax: 0x0005_06E3,
            ..CpuidResult::default()
        });
        assert_eq!(l.family(), 6);
        assert_eq!(l.model(), 0x5E);
        assert_eq!(l.stepping(), 3);
    }

    #[test]
    fn extended_family_is_added_for_family_f() {
        // Base family 0xF, extended family 1, extended model 2, model 1.
        let eax = Leaf1Eax::new()
            .with_family(0xF)
            .with_ext_family(1)
            .with_ext_model(2)
            .with_model(1);
        assert_eq!(eax.effective_family(), 0x10);
        // The effective family is no longer 6 or 0xF: no folding.
        assert_eq!(eax.effective_model(), 1);

        let eax = eax.with_ext_family(0);
        assert_eq!(eax.effective_family(), 0xF);
        assert_eq!(eax.effective_model(), 0x21);
    }

    #[test]
    fn other_families_keep_base_model() {
        let eax = Leaf1Eax::new().with_family(5).with_ext_model(3).with_model(4);
        assert_eq!(eax.effective_model(), 4);
    }
}
