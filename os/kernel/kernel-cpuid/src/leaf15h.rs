use crate::{CpuidRanges, CpuidResult, CpuidSource};

pub const LEAF_15H: u32 = 0x15;

/// CPUID.15H: Time Stamp Counter and Nominal Core Crystal Clock.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Leaf15h {
    pub denom: u32,      // EAX
    pub numer: u32,      // EBX
    pub crystal_hz: u32, // ECX (0 if unknown)
}

impl Leaf15h {
    /// Query CPUID.15H if available; None if leaf unsupported.
    pub fn read(source: &impl CpuidSource, ranges: &CpuidRanges) -> Option<Self> {
        ranges
            .has_basic(LEAF_15H)
            .then(|| Self::from(source.cpuid(LEAF_15H, 0)))
    }

    #[must_use]
    pub const fn from(r: CpuidResult) -> Self {
        Self {
            denom: r.eax,
            numer: r.ebx,
            crystal_hz: r.ecx,
        }
    }

    /// TSC / core crystal clock ratio, truncated. `None` if either term is
    /// not enumerated.
    #[must_use]
    pub const fn bus_freq_ratio(&self) -> Option<u32> {
        if self.denom != 0 && self.numer != 0 {
            Some(self.numer / self.denom)
        } else {
            None
        }
    }
}
