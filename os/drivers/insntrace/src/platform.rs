//! Services the driver consumes from the host kernel.
//!
//! The driver never touches page tables, handle tables or the trace MSRs
//! directly. It asks a [`Bti`] for pinned, physically contiguous memory and
//! hands register blobs to the privileged trace-control call of
//! [`SystemCalls`].

use crate::error::TraceError;
use crate::mtrace::{InsntraceAction, MtracePayload};
use bitfield_struct::bitfield;
use core::fmt;

/// A physical memory address.
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysicalAddress(u64);

impl PhysicalAddress {
    #[inline]
    #[must_use]
    pub const fn new(v: u64) -> Self {
        Self(v)
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Whether the address is a multiple of `1 << align_log2`.
    #[inline]
    #[must_use]
    pub const fn is_aligned(self, align_log2: u32) -> bool {
        self.0 & ((1u64 << align_log2) - 1) == 0
    }
}

impl fmt::Debug for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PA({:#018x})", self.0)
    }
}

impl fmt::Display for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Kernel object handle value.
pub type RawHandle = u32;

/// Handle rights.
#[bitfield(u32)]
#[derive(Eq, PartialEq)]
pub struct Rights {
    pub duplicate: bool,
    pub transfer: bool,
    pub read: bool,
    pub write: bool,
    pub execute: bool,
    pub map: bool,
    pub get_property: bool,
    pub set_property: bool,
    pub enumerate: bool,
    pub destroy: bool,
    pub set_policy: bool,
    pub get_policy: bool,
    pub signal: bool,
    pub signal_peer: bool,
    pub wait: bool,
    pub inspect: bool,
    #[bits(16)]
    __: u16,
}

impl Rights {
    /// What a handle to captured trace data may carry: it can be read and
    /// mapped, but neither written nor duplicated again.
    pub const TRACE_EXPORT: Self = Self::new()
        .with_transfer(true)
        .with_wait(true)
        .with_inspect(true)
        .with_get_property(true)
        .with_read(true)
        .with_map(true);

    #[must_use]
    pub const fn intersect(self, other: Self) -> Self {
        Self::from_bits(self.into_bits() & other.into_bits())
    }
}

/// A pinned, physically contiguous memory region with a kernel mapping.
///
/// Dropping the value unpins and frees the region.
pub trait DmaBuffer {
    fn phys(&self) -> PhysicalAddress;

    fn size(&self) -> u64;

    /// The CPU mapping of the region.
    fn bytes(&self) -> &[u8];

    fn bytes_mut(&mut self) -> &mut [u8];

    /// Rights of the handle backing this buffer.
    fn rights(&self) -> Rights;

    /// Create a new handle to the underlying memory with `rights`.
    ///
    /// # Errors
    /// [`TraceError::NoResources`] if the handle table is full.
    fn duplicate(&self, rights: Rights) -> Result<RawHandle, TraceError>;
}

/// Bus transaction initiator: the DMA allocation context of the device.
pub trait Bti {
    type Buffer: DmaBuffer;

    /// Allocate `size` bytes of contiguous memory aligned to
    /// `1 << alignment_log2`. The memory is zeroed.
    ///
    /// # Errors
    /// [`TraceError::NoMemory`] when the allocation cannot be satisfied.
    fn alloc_contiguous(&mut self, size: u64, alignment_log2: u32) -> Result<Self::Buffer, TraceError>;
}

/// Privileged kernel calls.
pub trait SystemCalls {
    /// Number of online logical CPUs.
    fn num_cpus(&self) -> u32;

    /// The trace-control call. `options` carries the slot index for
    /// [`InsntraceAction::StageTraceData`] and
    /// [`InsntraceAction::GetTraceData`] and is zero otherwise.
    ///
    /// # Errors
    /// Whatever the kernel reports.
    fn mtrace_control(
        &mut self,
        action: InsntraceAction,
        options: u32,
        payload: MtracePayload<'_>,
    ) -> Result<(), TraceError>;

    fn handle_close(&mut self, handle: RawHandle);
}

/// The bus device the driver binds to.
pub trait PlatformDevice {
    type Bti: Bti;

    /// # Errors
    /// [`TraceError::NotSupported`] if the device has no such BTI.
    fn get_bti(&mut self, index: u32) -> Result<Self::Bti, TraceError>;
}
