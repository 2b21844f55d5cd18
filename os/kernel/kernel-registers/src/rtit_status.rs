use crate::Msr;
use bitfield_struct::bitfield;

/// `IA32_RTIT_STATUS`: Tracing Status Register (MSR `0x571`).
#[bitfield(u64)]
#[derive(Eq, PartialEq)]
pub struct Ia32RtitStatus {
    /// Bit 0, FilterEn: IP filtering currently allows tracing.
    pub filter_en: bool,
    /// Bit 1, ContexEn: CPL/CR3 filtering currently allows tracing.
    pub context_en: bool,
    /// Bit 2, TriggerEn: tracing is enabled and not stopped.
    pub trigger_en: bool,
    __: bool,
    /// Bit 4, Error: an operational error was hit; tracing stopped.
    pub error: bool,
    /// Bit 5, Stopped: a STOP ToPA entry or TraceStop was reached.
    pub stopped: bool,
    /// Bit 6, PendPSB.
    pub pend_psb: bool,
    /// Bit 7, PendTopaPMI.
    pub pend_topa_pmi: bool,
    #[bits(24)]
    __: u32,
    /// Bits 32–48, PacketByteCnt.
    #[bits(17)]
    pub packet_byte_cnt: u32,
    #[bits(15)]
    __: u16,
}

impl Ia32RtitStatus {
    pub const MSR: Msr = Msr::IA32_RTIT_STATUS;

    pub const ERROR: u64 = 1 << 4;
    pub const STOPPED: u64 = 1 << 5;
}
