//! # insntrace
//!
//! Driver for Intel Processor Trace with Table of Physical Addresses (ToPA)
//! output.
//!
//! A client opens the device and drives a trace session through fixed op
//! codes ([`Op`]):
//!
//! 1. `AllocTrace` reserves the trace hardware for one slot per CPU.
//! 2. `AllocBuffer` once per slot builds pinned, self-aligned chunks and the
//!    ToPA ring that chains them.
//! 3. `Start` stages each slot's register mirror on its CPU and enables
//!    tracing; `Stop` reads the registers back.
//! 4. `GetBufferInfo` and `GetChunkHandle` expose what was captured.
//! 5. `FreeBuffer` and `FreeTrace` give everything back.
//!
//! The driver does not program MSRs itself. Staged register values travel
//! through the privileged trace-control call of the host kernel
//! ([`SystemCalls`]); DMA memory comes from a [`Bti`].

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod capability;
pub mod chunk;
pub mod config;
mod device;
mod dispatch;
mod error;
pub mod mtrace;
pub mod platform;
mod session;
pub mod topa;
mod trace;
pub mod wire;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use capability::{Capabilities, capabilities, probe};
pub use config::DriverConfig;
pub use device::InsntraceDevice;
pub use dispatch::{IOCTL_FAMILY_INSNTRACE, Op};
pub use error::TraceError;
pub use mtrace::{AddrRange, InsntraceAction, MtracePayload, PtRegs, TraceConfig, TraceMode};
pub use platform::{Bti, DmaBuffer, PhysicalAddress, PlatformDevice, RawHandle, Rights, SystemCalls};
pub use session::Session;
pub use trace::{BufferConfig, Slot, TraceBuffer};
pub use wire::{BufferInfo, ChunkHandleRequest, ThreadBufferRequest, Wire};
