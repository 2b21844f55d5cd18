//! The trace session: slot arena, trace mode and the start/stop state machine.
//!
//! ```text
//!  Unconfigured ──AllocTrace──► Configured ──Start──► Active
//!        ▲                        │    ▲                │
//!        └──────FreeTrace─────────┘    └──────Stop──────┘
//!                                 │
//!                 FreeTrace fails └──► Defunct
//! ```
//!
//! Slots move `Free → Allocated` on AllocBuffer and `Allocated → Assigned`
//! while staged on a CPU. A session is not internally synchronized; the
//! device serializes every call.

use crate::capability::Capabilities;
use crate::chunk::validate_geometry;
use crate::config::DriverConfig;
use crate::error::TraceError;
use crate::mtrace::{InsntraceAction, MtracePayload, TraceConfig, TraceMode};
use crate::platform::{Bti, DmaBuffer, RawHandle, Rights, SystemCalls};
use crate::topa::check_layout;
use crate::trace::{BufferConfig, Slot, TraceBuffer};
use alloc::vec::Vec;
use core::mem;
use log::{debug, error, warn};

type Buffer<B> = <B as Bti>::Buffer;

enum State<D> {
    Unconfigured,
    Configured(Trace<D>),
    /// The hardware trace resource could not be released.
    Defunct,
}

struct Trace<D> {
    mode: TraceMode,
    slots: Vec<Slot<D>>,
    active: bool,
}

impl<D> State<D> {
    const fn configured(&self) -> Result<&Trace<D>, TraceError> {
        match self {
            Self::Configured(trace) => Ok(trace),
            Self::Unconfigured => Err(TraceError::BadState),
            Self::Defunct => Err(TraceError::Defunct),
        }
    }

    fn configured_mut(&mut self) -> Result<&mut Trace<D>, TraceError> {
        match self {
            Self::Configured(trace) => Ok(trace),
            Self::Unconfigured => Err(TraceError::BadState),
            Self::Defunct => Err(TraceError::Defunct),
        }
    }
}

impl<D> Trace<D> {
    fn slot(&self, descriptor: u32) -> Result<&Slot<D>, TraceError> {
        self.slots.get(descriptor as usize).ok_or(TraceError::InvalidArgs)
    }

    fn slot_mut(&mut self, descriptor: u32) -> Result<&mut Slot<D>, TraceError> {
        self.slots.get_mut(descriptor as usize).ok_or(TraceError::InvalidArgs)
    }

    fn buffer(&self, descriptor: u32) -> Result<&TraceBuffer<D>, TraceError> {
        self.slot(descriptor)?.buffer().ok_or(TraceError::InvalidArgs)
    }
}

/// A trace session bound to one DMA context and one kernel.
pub struct Session<B: Bti, S> {
    caps: Capabilities,
    config: DriverConfig,
    bti: B,
    sys: S,
    state: State<Buffer<B>>,
}

impl<B: Bti, S: SystemCalls> Session<B, S> {
    /// A fresh session. Limits in `config` beyond what the driver supports
    /// are clamped.
    #[must_use]
    pub const fn new(caps: Capabilities, config: DriverConfig, bti: B, sys: S) -> Self {
        Self {
            caps,
            config: config.clamped(),
            bti,
            sys,
            state: State::Unconfigured,
        }
    }

    #[must_use]
    pub const fn capabilities(&self) -> &Capabilities {
        &self.caps
    }

    /// Whether AllocTrace has succeeded and FreeTrace has not.
    #[must_use]
    pub const fn is_configured(&self) -> bool {
        matches!(self.state, State::Configured(_))
    }

    /// Whether tracing is running.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        matches!(self.state, State::Configured(Trace { active: true, .. }))
    }

    /// Whether the trace unit may still write into session memory: tracing
    /// is running, or a slot is staged on a CPU.
    #[must_use]
    pub fn holds_live_buffers(&self) -> bool {
        self.trace()
            .is_ok_and(|trace| trace.active || trace.slots.iter().any(Slot::is_assigned))
    }

    /// Give up every buffer without freeing it and return how many there
    /// were. The chunks and tables stay pinned for good.
    pub(crate) fn abandon_buffers(&mut self) -> usize {
        let Ok(trace) = self.trace_mut() else {
            return 0;
        };
        let slots = mem::take(&mut trace.slots);
        let count = slots.iter().filter(|slot| !slot.is_free()).count();
        mem::forget(slots);
        count
    }

    fn trace(&self) -> Result<&Trace<Buffer<B>>, TraceError> {
        self.state.configured()
    }

    fn trace_mut(&mut self) -> Result<&mut Trace<Buffer<B>>, TraceError> {
        self.state.configured_mut()
    }

    /// Fail unless the session is configured.
    ///
    /// # Errors
    /// [`TraceError::BadState`] before AllocTrace, [`TraceError::Defunct`]
    /// after a failed FreeTrace.
    pub fn require_configured(&self) -> Result<(), TraceError> {
        self.trace().map(|_| ())
    }

    /// Reserve the trace hardware and create `config.num_traces` free slots.
    ///
    /// # Errors
    /// - [`TraceError::BadState`] if already configured.
    /// - [`TraceError::NotSupported`] without ToPA output.
    /// - [`TraceError::InvalidArgs`] for a slot count the mode does not allow.
    /// - Whatever the kernel reports for the reservation; nothing is kept.
    pub fn alloc_trace(&mut self, config: TraceConfig) -> Result<(), TraceError> {
        match self.state {
            State::Unconfigured => {}
            State::Configured(_) => return Err(TraceError::BadState),
            State::Defunct => return Err(TraceError::Defunct),
        }
        if !self.caps.output_topa {
            return Err(TraceError::NotSupported);
        }
        if config.num_traces > self.config.max_num_traces {
            return Err(TraceError::InvalidArgs);
        }
        match config.mode {
            // Every CPU or none.
            TraceMode::Cpus if config.num_traces != self.sys.num_cpus() => {
                return Err(TraceError::InvalidArgs);
            }
            TraceMode::Threads if config.num_traces == 0 => return Err(TraceError::InvalidArgs),
            _ => {}
        }

        let mut slots = Vec::new();
        slots
            .try_reserve_exact(config.num_traces as usize)
            .map_err(|_| TraceError::NoMemory)?;
        slots.resize_with(config.num_traces as usize, Slot::default);

        self.sys
            .mtrace_control(InsntraceAction::AllocTrace, 0, MtracePayload::TraceConfig(&config))?;

        debug!("trace allocated: {:?}, {} slots", config.mode, config.num_traces);
        self.state = State::Configured(Trace {
            mode: config.mode,
            slots,
            active: false,
        });
        Ok(())
    }

    /// Free every buffer and release the trace hardware.
    ///
    /// # Errors
    /// - [`TraceError::BadState`] while active or with a slot assigned;
    ///   nothing is changed.
    /// - [`TraceError::Defunct`] if the hardware could not be released. The
    ///   buffers are gone and the session accepts no further requests.
    pub fn free_trace(&mut self) -> Result<(), TraceError> {
        let trace = self.trace_mut()?;
        if trace.active || trace.slots.iter().any(Slot::is_assigned) {
            return Err(TraceError::BadState);
        }

        for slot in &mut trace.slots {
            slot.release();
        }

        if let Err(e) = self.sys.mtrace_control(InsntraceAction::FreeTrace, 0, MtracePayload::None) {
            error!("unable to release trace resources: {e}");
            self.state = State::Defunct;
            return Err(TraceError::Defunct);
        }

        self.state = State::Unconfigured;
        Ok(())
    }

    /// # Errors
    /// [`TraceError::BadState`] when not configured.
    pub fn trace_config(&self) -> Result<TraceConfig, TraceError> {
        let trace = self.trace()?;
        #[allow(clippy::cast_possible_truncation)]
        Ok(TraceConfig {
            mode: trace.mode,
            num_traces: trace.slots.len() as u32,
        })
    }

    /// Allocate a buffer in the first free slot and return its descriptor.
    ///
    /// All arguments are checked before any memory is allocated.
    ///
    /// # Errors
    /// - [`TraceError::InvalidArgs`] for a bad geometry or `ctl` value.
    /// - [`TraceError::NotSupported`] if the layout needs multi-entry ToPA
    ///   tables the processor lacks.
    /// - [`TraceError::NoResources`] when every slot is taken.
    /// - [`TraceError::NoMemory`] or [`TraceError::Internal`] from the
    ///   allocator; the slot stays free.
    pub fn alloc_buffer(&mut self, config: &BufferConfig) -> Result<u32, TraceError> {
        let Self {
            caps,
            config: limits,
            bti,
            state,
            ..
        } = self;
        let trace = state.configured_mut()?;

        validate_geometry(config.num_chunks, config.chunk_order, limits)?;
        caps.validate_ctl(config.ctl)?;
        check_layout(
            config.num_chunks as usize,
            limits.topa_table_entries,
            caps.output_topa_multi,
        )?;

        let index = trace
            .slots
            .iter()
            .position(Slot::is_free)
            .ok_or(TraceError::NoResources)?;

        let buffer = TraceBuffer::allocate(bti, *config, limits.topa_table_entries)?;
        trace.slots[index] = Slot::Allocated(buffer);

        debug!("buffer {index}: {} x {} pages", config.num_chunks, 1u32 << config.chunk_order);
        #[allow(clippy::cast_possible_truncation)]
        Ok(index as u32)
    }

    /// Per-thread buffers are not implemented. `thread` is closed either way.
    ///
    /// # Errors
    /// Always; [`TraceError::NotSupported`] once configured.
    pub fn assign_thread_buffer(&mut self, descriptor: u32, thread: RawHandle) -> Result<(), TraceError> {
        self.sys.handle_close(thread);
        self.require_configured()?;
        debug!("assign thread buffer {descriptor}: not supported");
        Err(TraceError::NotSupported)
    }

    /// Per-thread buffers are not implemented. `thread` is closed either way.
    ///
    /// # Errors
    /// Always; [`TraceError::NotSupported`] once configured.
    pub fn release_thread_buffer(&mut self, descriptor: u32, thread: RawHandle) -> Result<(), TraceError> {
        self.sys.handle_close(thread);
        self.require_configured()?;
        debug!("release thread buffer {descriptor}: not supported");
        Err(TraceError::NotSupported)
    }

    /// Geometry of buffer `descriptor` with the register values of its
    /// mirror.
    ///
    /// # Errors
    /// [`TraceError::InvalidArgs`] if `descriptor` names no allocated buffer.
    pub fn buffer_config(&self, descriptor: u32) -> Result<BufferConfig, TraceError> {
        let buffer = self.trace()?.buffer(descriptor)?;
        let regs = buffer.regs();
        Ok(BufferConfig {
            ctl: regs.ctl,
            cr3_match: regs.cr3_match,
            addr_ranges: regs.addr_ranges,
            ..*buffer.config()
        })
    }

    /// Bytes captured in buffer `descriptor` up to where tracing stopped.
    ///
    /// # Errors
    /// - [`TraceError::BadState`] while tracing CPUs.
    /// - [`TraceError::InvalidArgs`] if `descriptor` names no allocated buffer.
    pub fn buffer_info(&mut self, descriptor: u32) -> Result<u64, TraceError> {
        let trace = self.trace_mut()?;
        // Thread buffers may be inspected while tracing.
        if trace.mode == TraceMode::Cpus && trace.active {
            return Err(TraceError::BadState);
        }
        let buffer = trace
            .slot_mut(descriptor)?
            .buffer_mut()
            .ok_or(TraceError::InvalidArgs)?;
        Ok(buffer.capture_end())
    }

    /// A read-only handle to chunk `chunk` of buffer `descriptor`.
    ///
    /// # Errors
    /// - [`TraceError::InvalidArgs`] for an unknown buffer or chunk.
    /// - Whatever duplicating the handle reports.
    pub fn chunk_handle(&self, descriptor: u32, chunk: u32) -> Result<RawHandle, TraceError> {
        let chunk = self
            .trace()?
            .buffer(descriptor)?
            .chunk(chunk as usize)
            .ok_or(TraceError::InvalidArgs)?;
        chunk.duplicate(chunk.rights().intersect(Rights::TRACE_EXPORT))
    }

    /// Free buffer `descriptor` and its slot.
    ///
    /// # Errors
    /// - [`TraceError::BadState`] while active or if the slot is assigned.
    /// - [`TraceError::InvalidArgs`] if `descriptor` names no allocated buffer.
    pub fn free_buffer(&mut self, descriptor: u32) -> Result<(), TraceError> {
        let trace = self.trace_mut()?;
        if trace.active {
            return Err(TraceError::BadState);
        }
        let slot = trace.slot_mut(descriptor)?;
        if slot.is_free() {
            return Err(TraceError::InvalidArgs);
        }
        if slot.is_assigned() {
            return Err(TraceError::BadState);
        }
        slot.release();
        Ok(())
    }

    /// Stage slot `i` on CPU `i` for every slot, then start tracing.
    ///
    /// If staging fails part way the slots staged so far stay assigned.
    ///
    /// # Errors
    /// - [`TraceError::BadState`] if active, not in CPU mode, or if any slot
    ///   is free or already assigned.
    /// - Whatever the kernel reports for staging or starting.
    pub fn start(&mut self) -> Result<(), TraceError> {
        let Self { sys, state, .. } = self;
        let trace = state.configured_mut()?;
        if trace.active || trace.mode != TraceMode::Cpus {
            return Err(TraceError::BadState);
        }
        if !trace.slots.iter().all(|s| matches!(s, Slot::Allocated(_))) {
            return Err(TraceError::BadState);
        }

        for (cpu, slot) in (0u32..).zip(trace.slots.iter_mut()) {
            let Some(buffer) = slot.buffer_mut() else {
                return Err(TraceError::BadState);
            };
            let mut regs = buffer.staged_regs();
            sys.mtrace_control(InsntraceAction::StageTraceData, cpu, MtracePayload::Regs(&mut regs))?;
            slot.assign(cpu);
        }

        sys.mtrace_control(InsntraceAction::Start, 0, MtracePayload::None)?;
        trace.active = true;
        Ok(())
    }

    /// Stop tracing, read every slot's registers back and unassign it.
    ///
    /// Every slot is unassigned even if reading one of them fails; the first
    /// such failure is returned.
    ///
    /// # Errors
    /// - [`TraceError::BadState`] if not active.
    /// - Whatever the kernel reports for stopping (state unchanged) or for
    ///   reading registers back.
    pub fn stop(&mut self) -> Result<(), TraceError> {
        let Self { sys, state, .. } = self;
        let trace = state.configured_mut()?;
        if !trace.active {
            return Err(TraceError::BadState);
        }

        sys.mtrace_control(InsntraceAction::Stop, 0, MtracePayload::None)?;
        trace.active = false;

        let mut result = Ok(());
        for (cpu, slot) in (0u32..).zip(trace.slots.iter_mut()) {
            if let Slot::Assigned { buffer, .. } = slot {
                let mut regs = *buffer.regs();
                match sys.mtrace_control(InsntraceAction::GetTraceData, cpu, MtracePayload::Regs(&mut regs)) {
                    Ok(()) => {
                        buffer.retrieved(regs);
                        let status = regs.status();
                        if status.error() {
                            warn!("operational error detected on cpu {cpu}, status {:#x}", regs.status);
                        }
                        if status.stopped() {
                            debug!("cpu {cpu} reached the end of its buffer");
                        }
                    }
                    Err(e) => {
                        error!("unable to read trace registers of cpu {cpu}: {e}");
                        result = result.and(Err(e));
                    }
                }
            }
            slot.unassign();
        }
        result
    }
}

#[cfg(test)]
impl<B: Bti, S> Session<B, S> {
    pub(crate) const fn bti(&self) -> &B {
        &self.bti
    }

    pub(crate) const fn sys(&self) -> &S {
        &self.sys
    }
}
