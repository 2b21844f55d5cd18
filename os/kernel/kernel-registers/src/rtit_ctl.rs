use crate::Msr;
use bitfield_struct::bitfield;

/// `IA32_RTIT_CTL`: Trace Control Register (MSR `0x570`).
///
/// Software may only write this register while `trace_en` is clear, with
/// the exception of clearing `trace_en` itself.
#[bitfield(u64)]
#[derive(Eq, PartialEq)]
pub struct Ia32RtitCtl {
    /// Bit 0, TraceEn: enables packet generation.
    pub trace_en: bool,
    /// Bit 1, CYCEn: cycle-accurate mode.
    pub cyc_en: bool,
    /// Bit 2, OS: trace while CPL = 0.
    pub os: bool,
    /// Bit 3, User: trace while CPL > 0.
    pub user: bool,
    /// Bit 4, PwrEvtEn: power event trace.
    pub pwr_evt_en: bool,
    /// Bit 5, FUPonPTW: emit a FUP before each PTW packet.
    pub fup_on_ptw: bool,
    /// Bit 6, FabricEn: route output to the trace transport subsystem.
    pub fabric_en: bool,
    /// Bit 7, CR3Filter.
    pub cr3_filter: bool,
    /// Bit 8, ToPA: ToPA output scheme instead of single range.
    pub topa: bool,
    /// Bit 9, MTCEn.
    pub mtc_en: bool,
    /// Bit 10, TSCEn.
    pub tsc_en: bool,
    /// Bit 11, DisRETC: disable RET compression.
    pub dis_retc: bool,
    /// Bit 12, PTWEn.
    pub ptw_en: bool,
    /// Bit 13, BranchEn: COFI-based packets.
    pub branch_en: bool,
    /// Bits 14–17, MTCFreq encoding.
    #[bits(4)]
    pub mtc_freq: u8,
    #[bits(1)]
    __: u8,
    /// Bits 19–22, CycThresh encoding.
    #[bits(4)]
    pub cyc_thresh: u8,
    #[bits(1)]
    __: u8,
    /// Bits 24–27, PSBFreq encoding.
    #[bits(4)]
    pub psb_freq: u8,
    #[bits(4)]
    __: u8,
    /// Bits 32–35, ADDR0_CFG.
    #[bits(4)]
    pub addr0_cfg: u8,
    /// Bits 36–39, ADDR1_CFG.
    #[bits(4)]
    pub addr1_cfg: u8,
    /// Bits 40–43, ADDR2_CFG.
    #[bits(4)]
    pub addr2_cfg: u8,
    /// Bits 44–47, ADDR3_CFG.
    #[bits(4)]
    pub addr3_cfg: u8,
    #[bits(16)]
    __: u16,
}

impl Ia32RtitCtl {
    pub const MSR: Msr = Msr::IA32_RTIT_CTL;

    pub const TRACE_EN: u64 = 1 << 0;
    pub const CYC_EN: u64 = 1 << 1;
    pub const OS: u64 = 1 << 2;
    pub const USER: u64 = 1 << 3;
    pub const PWR_EVT_EN: u64 = 1 << 4;
    pub const FUP_ON_PTW: u64 = 1 << 5;
    pub const FABRIC_EN: u64 = 1 << 6;
    pub const CR3_FILTER: u64 = 1 << 7;
    pub const TOPA: u64 = 1 << 8;
    pub const MTC_EN: u64 = 1 << 9;
    pub const TSC_EN: u64 = 1 << 10;
    pub const DIS_RETC: u64 = 1 << 11;
    pub const PTW_EN: u64 = 1 << 12;
    pub const BRANCH_EN: u64 = 1 << 13;

    pub const MTC_FREQ_SHIFT: u32 = 14;
    pub const MTC_FREQ_MASK: u64 = 0xF << Self::MTC_FREQ_SHIFT;
    pub const CYC_THRESH_SHIFT: u32 = 19;
    pub const CYC_THRESH_MASK: u64 = 0xF << Self::CYC_THRESH_SHIFT;
    pub const PSB_FREQ_SHIFT: u32 = 24;
    pub const PSB_FREQ_MASK: u64 = 0xF << Self::PSB_FREQ_SHIFT;

    /// Number of `ADDRn_CFG` fields.
    pub const NUM_ADDR_CFG: usize = 4;

    /// Mask of the `ADDRn_CFG` field for range `n` (`n < 4`).
    #[must_use]
    pub const fn addr_cfg_mask(n: usize) -> u64 {
        0xF << (32 + 4 * n)
    }

    /// The `ADDRn_CFG` field for range `n`, or `None` if `n` is out of range.
    #[must_use]
    pub const fn addr_cfg(&self, n: usize) -> Option<u8> {
        match n {
            0 => Some(self.addr0_cfg()),
            1 => Some(self.addr1_cfg()),
            2 => Some(self.addr2_cfg()),
            3 => Some(self.addr3_cfg()),
            _ => None,
        }
    }
}
