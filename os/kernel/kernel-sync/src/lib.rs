//! # Kernel synchronization primitives
//!
//! Two primitives cover the driver's needs:
//!
//! - [`SpinLock`] serializes every request against a device. Critical sections
//!   run to completion; there is no blocking and no cancellation.
//! - [`SyncOnceCell`] publishes a value computed at most once per process, with
//!   a fallible initializer that only caches success.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod spin_lock;
mod sync_once_cell;

pub use spin_lock::{SpinLock, SpinLockGuard};
pub use sync_once_cell::SyncOnceCell;
