use crate::{CpuidRanges, CpuidResult, CpuidSource};
use bitfield_struct::bitfield;

pub const LEAF_14H: u32 = 0x14;

/// CPUID.(EAX=14H): Intel Processor Trace Enumeration.
///
/// Subleaf 0 lists the supported features and output schemes. Subleaf 1
/// carries the address-range count and the legal MTC/CYC/PSB encodings; it is
/// only consulted when subleaf 0 advertises configurable PSB and cycle-accurate
/// mode.
///
/// Reference: Intel SDM Vol. 2A, CPUID leaf 14H; Vol. 3C, §33.3.1.
#[derive(Copy, Clone, Debug)]
pub struct Leaf14h {
    /// Highest supported subleaf (EAX of subleaf 0).
    pub max_subleaf: u32,
    pub ebx: Leaf14hEbx,
    pub ecx: Leaf14hEcx,
    pub sub1: Option<Leaf14hSub1>,
}

impl Leaf14h {
    pub fn read(source: &impl CpuidSource, ranges: &CpuidRanges) -> Option<Self> {
        if !ranges.has_basic(LEAF_14H) {
            return None;
        }

        let mut leaf = Self::from(source.cpuid(LEAF_14H, 0));
        if leaf.ebx.psb_cyc() && leaf.max_subleaf >= 1 {
            leaf.sub1 = Some(Leaf14hSub1::from(source.cpuid(LEAF_14H, 1)));
        }
        Some(leaf)
    }

    /// Decode subleaf 0 only.
    #[must_use]
    pub const fn from(r: CpuidResult) -> Self {
        Self {
            max_subleaf: r.eax,
            ebx: Leaf14hEbx::from_bits(r.ebx),
            ecx: Leaf14hEcx::from_bits(r.ecx),
            sub1: None,
        }
    }
}

/// CPUID.(EAX=14H, ECX=0):EBX: optional trace features.
#[bitfield(u32)]
pub struct Leaf14hEbx {
    /// IA32_RTIT_CTL.CR3Filter can be set; IA32_RTIT_CR3_MATCH is accessible.
    pub cr3_filtering: bool,
    /// Configurable PSB frequency and cycle-accurate mode.
    pub psb_cyc: bool,
    /// IP filtering, TraceStop filtering, and preservation of PT MSRs across
    /// warm reset.
    pub ip_filtering: bool,
    /// MTC timing packets and suppression of COFI-based packets.
    pub mtc: bool,
    /// PTWRITE and FUP on PTWRITE.
    pub ptwrite: bool,
    /// Power event trace.
    pub power_events: bool,
    #[bits(26)]
    __: u32,
}

/// CPUID.(EAX=14H, ECX=0):ECX: output schemes.
#[bitfield(u32)]
pub struct Leaf14hEcx {
    /// ToPA output.
    pub topa: bool,
    /// ToPA tables may hold more than one output entry.
    pub topa_multi: bool,
    /// Single-range output.
    pub single_range: bool,
    /// Output to a trace transport subsystem.
    pub transport: bool,
    #[bits(27)]
    __: u32,
    /// Packets carry linear IPs (including the CS base).
    pub lip: bool,
}

/// CPUID.(EAX=14H, ECX=1).
#[derive(Copy, Clone, Debug, Default)]
pub struct Leaf14hSub1 {
    pub eax: Leaf14hSub1Eax,
    pub ebx: Leaf14hSub1Ebx,
}

impl Leaf14hSub1 {
    #[must_use]
    pub const fn from(r: CpuidResult) -> Self {
        Self {
            eax: Leaf14hSub1Eax::from_bits(r.eax),
            ebx: Leaf14hSub1Ebx::from_bits(r.ebx),
        }
    }
}

#[bitfield(u32)]
pub struct Leaf14hSub1Eax {
    /// Number of configurable address ranges for filtering.
    #[bits(3)]
    pub num_addr_ranges: u8,
    #[bits(13)]
    __: u16,
    /// Bitmap of supported MTC period encodings.
    #[bits(16)]
    pub mtc_freq_mask: u16,
}

#[bitfield(u32)]
pub struct Leaf14hSub1Ebx {
    /// Bitmap of supported cycle threshold encodings.
    #[bits(16)]
    pub cyc_thresh_mask: u16,
    /// Bitmap of supported PSB frequency encodings.
    #[bits(16)]
    pub psb_freq_mask: u16,
}
