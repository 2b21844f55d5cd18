//! The bound device: single-open guard, request entry point and teardown.

use crate::capability::{Capabilities, capabilities};
use crate::config::DriverConfig;
use crate::error::TraceError;
use crate::platform::{Bti, PlatformDevice, SystemCalls};
use crate::session::Session;
use kernel_cpuid::CpuidSource;
use kernel_sync::SpinLock;
use log::{info, trace, warn};

struct Inner<B: Bti, S> {
    opened: bool,
    session: Session<B, S>,
}

/// An insntrace device instance.
///
/// All requests run under one lock, so session operations never overlap.
pub struct InsntraceDevice<B: Bti, S> {
    inner: SpinLock<Inner<B, S>>,
}

impl<B: Bti, S: SystemCalls> InsntraceDevice<B, S> {
    /// A closed, unconfigured device.
    #[must_use]
    pub const fn new(caps: Capabilities, config: DriverConfig, bti: B, sys: S) -> Self {
        Self {
            inner: SpinLock::new(Inner {
                opened: false,
                session: Session::new(caps, config, bti, sys),
            }),
        }
    }

    /// Probe the processor (once per process) and take BTI 0 of `pdev`.
    ///
    /// # Errors
    /// - [`TraceError::NotSupported`] without processor trace support.
    /// - Whatever `pdev` reports for the BTI.
    pub fn bind<P>(cpu: &impl CpuidSource, pdev: &mut P, sys: S, config: DriverConfig) -> Result<Self, TraceError>
    where
        P: PlatformDevice<Bti = B>,
    {
        let caps = *capabilities(cpu)?;
        let bti = pdev.get_bti(0)?;
        let config = config.clamped();
        info!("insntrace: {} cpus, {} ToPA entries per table", sys.num_cpus(), config.topa_table_entries);
        Ok(Self::new(caps, config, bti, sys))
    }

    /// [`InsntraceDevice::bind`] on the executing processor.
    ///
    /// # Errors
    /// See [`InsntraceDevice::bind`].
    #[cfg(all(feature = "native", target_arch = "x86_64"))]
    pub fn bind_native<P>(pdev: &mut P, sys: S, config: DriverConfig) -> Result<Self, TraceError>
    where
        P: PlatformDevice<Bti = B>,
    {
        Self::bind(&kernel_cpuid::NativeCpuid, pdev, sys, config)
    }

    /// # Errors
    /// [`TraceError::AlreadyBound`] while another client holds the device.
    pub fn open(&self) -> Result<(), TraceError> {
        self.inner.with_lock(|inner| {
            if inner.opened {
                return Err(TraceError::AlreadyBound);
            }
            inner.opened = true;
            Ok(())
        })
    }

    /// Let the next client open the device. The session is kept.
    pub fn close(&self) {
        self.inner.with_lock(|inner| inner.opened = false);
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.inner.with_lock(|inner| inner.opened)
    }

    /// Run one device request. See [`Session::dispatch`].
    ///
    /// # Errors
    /// See [`Session::dispatch`].
    pub fn ioctl(&self, op: u32, request: &[u8], reply: &mut [u8]) -> Result<usize, TraceError> {
        let result = self.inner.with_lock(|inner| inner.session.dispatch(op, request, reply));
        trace!("ioctl {op:#06x}: status {}", TraceError::status_of(&result));
        result
    }

    /// Stop tracing, free the session and drop the device.
    ///
    /// Failures are logged and otherwise ignored. Buffers the trace unit may
    /// still write to are left pinned instead of being freed.
    pub fn release(self) {
        let mut session = self.inner.into_inner().session;
        if session.is_active()
            && let Err(e) = session.stop()
        {
            warn!("release: stop failed: {e}");
        }
        if session.is_configured()
            && !session.holds_live_buffers()
            && let Err(e) = session.free_trace()
        {
            warn!("release: unable to free trace: {e}");
        }
        if session.holds_live_buffers() {
            let count = session.abandon_buffers();
            warn!("release: trace unit may still be writing, leaving {count} buffers pinned");
        }
    }
}
