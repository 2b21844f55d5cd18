//! # Typed Intel PT Registers
//!
//! Bitfield views of the processor-trace MSRs. Values are built and
//! inspected here; moving them into or out of the hardware is left to the
//! privileged trace-control path.
//!
//! ## References
//! - Intel SDM Vol. 3C, §33.2.8 "Trace Configuration Registers"

#![cfg_attr(not(any(test, doctest)), no_std)]

mod rtit_ctl;
mod rtit_output_mask_ptrs;
mod rtit_status;

pub use rtit_ctl::Ia32RtitCtl;
pub use rtit_output_mask_ptrs::Ia32RtitOutputMaskPtrs;
pub use rtit_status::Ia32RtitStatus;

/// Identifies a **Model-Specific Register (MSR)** by its architectural index.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Msr(pub u32);

impl Msr {
    /// `IA32_RTIT_OUTPUT_BASE`: physical base of the first ToPA table.
    pub const IA32_RTIT_OUTPUT_BASE: Self = Self::new(0x560);
    pub const IA32_RTIT_OUTPUT_MASK_PTRS: Self = Self::new(0x561);
    pub const IA32_RTIT_CTL: Self = Self::new(0x570);
    pub const IA32_RTIT_STATUS: Self = Self::new(0x571);
    /// `IA32_RTIT_CR3_MATCH`: CR3 value compared when CR3 filtering is on.
    pub const IA32_RTIT_CR3_MATCH: Self = Self::new(0x572);

    /// Creates a new `Msr` from a raw index.
    #[inline(always)]
    #[allow(clippy::inline_always)]
    #[must_use]
    pub const fn new(index: u32) -> Self {
        Self(index)
    }

    /// Returns the underlying raw MSR index.
    #[inline(always)]
    #[allow(clippy::inline_always)]
    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }
}
