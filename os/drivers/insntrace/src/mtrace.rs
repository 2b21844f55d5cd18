//! Argument types of the privileged trace-control call.

use crate::config::MAX_NUM_ADDR_RANGES;
use kernel_registers::{Ia32RtitCtl, Ia32RtitOutputMaskPtrs, Ia32RtitStatus};

/// Sub-operations of the insntrace trace-control call.
#[repr(u32)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum InsntraceAction {
    /// Reserve the hardware for a session. Payload: [`TraceConfig`].
    AllocTrace = 0,
    FreeTrace = 1,
    /// Load a slot's register mirror into its CPU. Payload: [`PtRegs`].
    StageTraceData = 2,
    /// Read a slot's registers back. Payload: [`PtRegs`].
    GetTraceData = 3,
    Start = 4,
    Stop = 5,
}

/// What a session traces.
#[repr(u32)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TraceMode {
    /// One slot per logical CPU.
    Cpus = 0,
    /// One slot per thread.
    Threads = 1,
}

impl TraceMode {
    #[must_use]
    pub const fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::Cpus),
            1 => Some(Self::Threads),
            _ => None,
        }
    }
}

#[repr(C)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct TraceConfig {
    pub mode: TraceMode,
    pub num_traces: u32,
}

/// An `IA32_RTIT_ADDRn_A` / `_B` pair.
#[repr(C)]
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct AddrRange {
    pub a: u64,
    pub b: u64,
}

/// Mirror of one slot's trace MSRs.
///
/// Copied into the trace-control call when staging and overwritten from it
/// on retrieval; the hardware never aliases it.
#[repr(C)]
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct PtRegs {
    pub ctl: u64,
    pub status: u64,
    pub output_base: u64,
    pub output_mask_ptrs: u64,
    pub cr3_match: u64,
    pub addr_ranges: [AddrRange; MAX_NUM_ADDR_RANGES],
}

impl PtRegs {
    #[inline]
    #[must_use]
    pub const fn ctl(&self) -> Ia32RtitCtl {
        Ia32RtitCtl::from_bits(self.ctl)
    }

    #[inline]
    #[must_use]
    pub const fn status(&self) -> Ia32RtitStatus {
        Ia32RtitStatus::from_bits(self.status)
    }

    #[inline]
    #[must_use]
    pub const fn write_position(&self) -> Ia32RtitOutputMaskPtrs {
        Ia32RtitOutputMaskPtrs::from_bits(self.output_mask_ptrs)
    }
}

/// Data passed along with an [`InsntraceAction`].
#[derive(Debug)]
pub enum MtracePayload<'a> {
    None,
    TraceConfig(&'a TraceConfig),
    Regs(&'a mut PtRegs),
}
