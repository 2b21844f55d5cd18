//! Device request surface: op codes and the request/reply dispatcher.

use crate::error::TraceError;
use crate::mtrace::TraceConfig;
use crate::platform::{Bti, SystemCalls};
use crate::session::Session;
use crate::trace::BufferConfig;
use crate::wire::{BufferInfo, ChunkHandleRequest, ThreadBufferRequest, Wire};
use log::trace;

/// Op code family of the insntrace device, bits 15:8 of an op code.
pub const IOCTL_FAMILY_INSNTRACE: u32 = 0x25;

/// Device requests. The discriminant is the operation number.
#[repr(u32)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Op {
    AllocTrace = 0,
    FreeTrace = 1,
    GetTraceConfig = 2,
    AllocBuffer = 3,
    AssignThreadBuffer = 4,
    ReleaseThreadBuffer = 5,
    GetBufferConfig = 6,
    GetBufferInfo = 7,
    GetChunkHandle = 8,
    FreeBuffer = 9,
    Start = 10,
    Stop = 11,
}

impl Op {
    pub const ALL: [Self; 12] = [
        Self::AllocTrace,
        Self::FreeTrace,
        Self::GetTraceConfig,
        Self::AllocBuffer,
        Self::AssignThreadBuffer,
        Self::ReleaseThreadBuffer,
        Self::GetBufferConfig,
        Self::GetBufferInfo,
        Self::GetChunkHandle,
        Self::FreeBuffer,
        Self::Start,
        Self::Stop,
    ];

    /// The full op code.
    #[inline]
    #[must_use]
    pub const fn code(self) -> u32 {
        (IOCTL_FAMILY_INSNTRACE << 8) | self as u32
    }

    #[must_use]
    pub const fn from_code(code: u32) -> Option<Self> {
        if code >> 8 != IOCTL_FAMILY_INSNTRACE {
            return None;
        }
        let number = (code & 0xFF) as usize;
        if number < Self::ALL.len() {
            Some(Self::ALL[number])
        } else {
            None
        }
    }
}

fn empty_request(request: &[u8]) -> Result<(), TraceError> {
    if request.is_empty() {
        Ok(())
    } else {
        Err(TraceError::InvalidArgs)
    }
}

fn no_reply(reply: &[u8]) -> Result<(), TraceError> {
    if reply.is_empty() {
        Ok(())
    } else {
        Err(TraceError::InvalidArgs)
    }
}

fn reply_room<T: Wire>(reply: &[u8]) -> Result<(), TraceError> {
    if reply.len() < T::SIZE {
        return Err(TraceError::BufferTooSmall);
    }
    Ok(())
}

impl<B: Bti, S: SystemCalls> Session<B, S> {
    /// Run device request `op` and return the number of reply bytes written.
    ///
    /// Request and reply lengths are validated before the operation runs.
    ///
    /// # Errors
    /// - [`TraceError::InvalidArgs`] for an unknown op code, a request of
    ///   the wrong size, or a reply buffer given to an op without reply.
    /// - [`TraceError::BufferTooSmall`] if the reply does not fit.
    /// - [`TraceError::BadState`] for any op but AllocTrace on an
    ///   unconfigured session.
    /// - Whatever the operation reports.
    pub fn dispatch(&mut self, op: u32, request: &[u8], reply: &mut [u8]) -> Result<usize, TraceError> {
        let Some(op) = Op::from_code(op) else {
            trace!("unknown op {op:#x}");
            return Err(TraceError::InvalidArgs);
        };
        trace!("{op:?}: request {} B, reply {} B", request.len(), reply.len());

        // Thread buffer requests consume their handle before the state check.
        if !matches!(op, Op::AllocTrace | Op::AssignThreadBuffer | Op::ReleaseThreadBuffer) {
            self.require_configured()?;
        }

        match op {
            Op::AllocTrace => {
                no_reply(reply)?;
                self.alloc_trace(TraceConfig::decode(request)?)?;
                Ok(0)
            }
            Op::FreeTrace => {
                empty_request(request)?;
                no_reply(reply)?;
                self.free_trace()?;
                Ok(0)
            }
            Op::GetTraceConfig => {
                empty_request(request)?;
                self.trace_config()?.encode(reply)
            }
            Op::AllocBuffer => {
                let config = BufferConfig::decode(request)?;
                reply_room::<u32>(reply)?;
                self.alloc_buffer(&config)?.encode(reply)
            }
            Op::AssignThreadBuffer => {
                let req = ThreadBufferRequest::decode(request)?;
                no_reply(reply)?;
                self.assign_thread_buffer(req.descriptor, req.thread)?;
                Ok(0)
            }
            Op::ReleaseThreadBuffer => {
                let req = ThreadBufferRequest::decode(request)?;
                no_reply(reply)?;
                self.release_thread_buffer(req.descriptor, req.thread)?;
                Ok(0)
            }
            Op::GetBufferConfig => {
                let descriptor = u32::decode(request)?;
                reply_room::<BufferConfig>(reply)?;
                self.buffer_config(descriptor)?.encode(reply)
            }
            Op::GetBufferInfo => {
                let descriptor = u32::decode(request)?;
                reply_room::<BufferInfo>(reply)?;
                let capture_end = self.buffer_info(descriptor)?;
                BufferInfo { capture_end }.encode(reply)
            }
            Op::GetChunkHandle => {
                let req = ChunkHandleRequest::decode(request)?;
                reply_room::<u32>(reply)?;
                self.chunk_handle(req.descriptor, req.chunk_num)?.encode(reply)
            }
            Op::FreeBuffer => {
                let descriptor = u32::decode(request)?;
                no_reply(reply)?;
                self.free_buffer(descriptor)?;
                Ok(0)
            }
            Op::Start => {
                empty_request(request)?;
                no_reply(reply)?;
                self.start()?;
                Ok(0)
            }
            Op::Stop => {
                empty_request(request)?;
                no_reply(reply)?;
                self.stop()?;
                Ok(0)
            }
        }
    }
}
