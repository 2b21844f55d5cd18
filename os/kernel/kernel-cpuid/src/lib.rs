//! # CPUID leaves
//!
//! Typed views of the CPUID leaves needed to enumerate Intel Processor Trace:
//!
//! | Leaf | Type | Used for |
//! |------|------|----------|
//! | 00H | [`CpuidRanges`] | highest basic/extended leaf, vendor |
//! | 01H | [`Leaf01h`] | family/model/stepping |
//! | 07H | [`Leaf07h`] | the `intel_pt` feature bit |
//! | 14H | [`Leaf14h`], [`Leaf14hSub1`] | trace capabilities and encodings |
//! | 15H | [`Leaf15h`] | TSC/core crystal clock ratio |
//!
//! Decoding is separated from execution: every leaf is built from a
//! [`CpuidResult`] obtained through a [`CpuidSource`]. The native source
//! executes the `cpuid` instruction (feature `asm`); tests feed canned
//! register values instead.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod leaf01h;
mod leaf07h;
mod leaf14h;
mod leaf15h;
mod ranges;

pub use leaf01h::{LEAF_01H, Leaf01h, Leaf1Eax};
pub use leaf07h::{LEAF_07H, Leaf07h, Leaf7Ebx};
pub use leaf14h::{LEAF_14H, Leaf14h, Leaf14hEbx, Leaf14hEcx, Leaf14hSub1, Leaf14hSub1Eax, Leaf14hSub1Ebx};
pub use leaf15h::{LEAF_15H, Leaf15h};
pub use ranges::{CpuVendor, CpuidRanges};

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
#[repr(C)]
pub struct CpuidResult {
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
}

/// Anything that can answer a `cpuid(leaf, subleaf)` query.
pub trait CpuidSource {
    fn cpuid(&self, leaf: u32, subleaf: u32) -> CpuidResult;
}

impl<T: CpuidSource + ?Sized> CpuidSource for &T {
    #[inline]
    fn cpuid(&self, leaf: u32, subleaf: u32) -> CpuidResult {
        (**self).cpuid(leaf, subleaf)
    }
}

/// Executes the `cpuid` instruction on the current CPU.
#[cfg(all(feature = "asm", target_arch = "x86_64"))]
#[derive(Debug, Copy, Clone, Default)]
pub struct NativeCpuid;

#[cfg(all(feature = "asm", target_arch = "x86_64"))]
impl CpuidSource for NativeCpuid {
    #[inline]
    fn cpuid(&self, leaf: u32, subleaf: u32) -> CpuidResult {
        // SAFETY: `cpuid` is unprivileged and present on every x86_64 CPU.
        unsafe { cpuid(leaf, subleaf) }
    }
}

/// Execute CPUID with the given leaf and subleaf.
///
/// # Safety
/// The CPUID instruction must be available.
#[cfg(all(feature = "asm", target_arch = "x86_64"))]
#[inline(always)]
#[allow(unused_assignments, clippy::inline_always)]
pub unsafe fn cpuid(leaf: u32, subleaf: u32) -> CpuidResult {
    let (mut eax, mut ebx, mut ecx, mut edx) = (leaf, 0u32, subleaf, 0u32);
    unsafe {
        core::arch::asm!(
            "push rbx",
            "cpuid",
            "mov {ebx_out:e}, ebx",
            "pop rbx",
            ebx_out = lateout(reg) ebx,
            inlateout("eax") eax,
            inlateout("ecx") ecx,
            lateout("edx") edx,
            options(nomem, preserves_flags),
        );
    }
    CpuidResult { eax, ebx, ecx, edx }
}
