use crate::CpuidSource;

const LEAF_00H: u32 = 0x00;
const LEAF_MAX_EXTENDED: u32 = 0x8000_0000;

/// CPUID.00H / CPUID.8000_0000H: highest supported leaves and vendor.
#[derive(Copy, Clone, Debug)]
pub struct CpuidRanges {
    pub max_basic: u32,
    pub max_extended: u32,
    pub vendor: CpuVendor,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CpuVendor {
    Intel,
    Amd,
    Other,
}

impl CpuidRanges {
    pub fn read(source: &impl CpuidSource) -> Self {
        let b0 = source.cpuid(LEAF_00H, 0);

        // "GenuineIntel" is spelled across EBX, EDX, ECX (in that order).
        let mut id = [0u8; 12];
        id[0..4].copy_from_slice(&b0.ebx.to_le_bytes());
        id[4..8].copy_from_slice(&b0.edx.to_le_bytes());
        id[8..12].copy_from_slice(&b0.ecx.to_le_bytes());

        let vendor = match &id {
            b"GenuineIntel" => CpuVendor::Intel,
            b"AuthenticAMD" => CpuVendor::Amd,
            _ => CpuVendor::Other,
        };

        let e0 = source.cpuid(LEAF_MAX_EXTENDED, 0);

        Self {
            max_basic: b0.eax,
            max_extended: e0.eax,
            vendor,
        }
    }

    #[inline]
    #[must_use]
    pub const fn has_basic(&self, leaf: u32) -> bool {
        leaf <= self.max_basic
    }

    #[inline]
    #[must_use]
    pub const fn has_ext(&self, leaf: u32) -> bool {
        leaf >= 0x8000_0000 && leaf <= self.max_extended
    }
}

impl CpuVendor {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Intel => "Intel",
            Self::Amd => "AMD",
            Self::Other => "Other",
        }
    }
}
