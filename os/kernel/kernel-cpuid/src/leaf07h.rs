use crate::{CpuidRanges, CpuidResult, CpuidSource};
use bitfield_struct::bitfield;

pub const LEAF_07H: u32 = 0x07;

/// CPUID.(EAX=07H, ECX=0): Structured Extended Feature Flags.
///
/// Only EBX is typed; it carries the Intel PT presence bit.
#[derive(Copy, Clone, Debug)]
pub struct Leaf07h {
    /// Highest supported subleaf.
    pub max_subleaf: u32,
    pub ebx: Leaf7Ebx,
    pub ecx: u32,
    pub edx: u32,
}

impl Leaf07h {
    #[inline]
    pub fn read(source: &impl CpuidSource, ranges: &CpuidRanges) -> Option<Self> {
        ranges
            .has_basic(LEAF_07H)
            .then(|| Self::from(source.cpuid(LEAF_07H, 0)))
    }

    #[must_use]
    pub const fn from(r: CpuidResult) -> Self {
        Self {
            max_subleaf: r.eax,
            ebx: Leaf7Ebx::from_bits(r.ebx),
            ecx: r.ecx,
            edx: r.edx,
        }
    }

    #[inline]
    #[must_use]
    pub const fn has_intel_pt(&self) -> bool {
        self.ebx.intel_pt()
    }
}

/// CPUID.(EAX=07H, ECX=0):EBX.
///
/// Reference: Intel SDM Vol. 2A, Table 3-8, leaf 07H.
#[bitfield(u32)]
pub struct Leaf7Ebx {
    pub fsgsbase: bool, // 0
    pub tsc_adjust: bool, // 1
    pub sgx: bool, // 2
    pub bmi1: bool, // 3
    pub hle: bool, // 4
    pub avx2: bool, // 5
    pub fdp_excptn_only: bool, // 6
    pub smep: bool, // 7
    pub bmi2: bool, // 8
    pub erms: bool, // 9
    pub invpcid: bool, // 10
    pub rtm: bool, // 11
    pub rdt_m: bool, // 12
    pub fpu_cs_ds_deprecated: bool, // 13
    pub mpx: bool, // 14
    pub rdt_a: bool, // 15
    pub avx512f: bool, // 16
    pub avx512dq: bool, // 17
    pub rdseed: bool, // 18
    pub adx: bool, // 19
    pub smap: bool, // 20
    pub avx512_ifma: bool, // 21
    __: bool, // 22
    pub clflushopt: bool, // 23
    pub clwb: bool, // 24
    /// Intel Processor Trace.
    pub intel_pt: bool, // 25
    pub avx512pf: bool, // 26
    pub avx512er: bool, // 27
    pub avx512cd: bool, // 28
    pub sha: bool, // 29
    pub avx512bw: bool, // 30
    pub avx512vl: bool, // 31
}
