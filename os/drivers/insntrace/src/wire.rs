//! Little-endian, C-layout encodings of the device request and reply
//! payloads.

use crate::config::MAX_NUM_ADDR_RANGES;
use crate::error::TraceError;
use crate::mtrace::{AddrRange, TraceConfig, TraceMode};
use crate::platform::RawHandle;
use crate::trace::BufferConfig;
use core::mem;

/// Cursor over a request payload.
pub struct Reader<'a>(&'a [u8]);

impl Reader<'_> {
    fn take<const N: usize>(&mut self) -> Result<[u8; N], TraceError> {
        let (head, rest) = self.0.split_first_chunk::<N>().ok_or(TraceError::InvalidArgs)?;
        self.0 = rest;
        Ok(*head)
    }

    /// # Errors
    /// [`TraceError::InvalidArgs`] past the end.
    pub fn u8(&mut self) -> Result<u8, TraceError> {
        self.take::<1>().map(|[b]| b)
    }

    /// # Errors
    /// [`TraceError::InvalidArgs`] past the end.
    pub fn u32(&mut self) -> Result<u32, TraceError> {
        self.take().map(u32::from_le_bytes)
    }

    /// # Errors
    /// [`TraceError::InvalidArgs`] past the end.
    pub fn u64(&mut self) -> Result<u64, TraceError> {
        self.take().map(u64::from_le_bytes)
    }

    /// # Errors
    /// [`TraceError::InvalidArgs`] past the end.
    pub fn skip(&mut self, n: usize) -> Result<(), TraceError> {
        self.0 = self.0.get(n..).ok_or(TraceError::InvalidArgs)?;
        Ok(())
    }
}

/// Cursor over a reply buffer. Writes past the end are dropped; callers
/// size the buffer first.
pub struct Writer<'a>(&'a mut [u8]);

impl Writer<'_> {
    fn put<const N: usize>(&mut self, bytes: [u8; N]) {
        if let Some((head, rest)) = mem::take(&mut self.0).split_first_chunk_mut::<N>() {
            *head = bytes;
            self.0 = rest;
        }
    }

    pub fn u8(&mut self, v: u8) {
        self.put([v]);
    }

    pub fn u32(&mut self, v: u32) {
        self.put(v.to_le_bytes());
    }

    pub fn u64(&mut self, v: u64) {
        self.put(v.to_le_bytes());
    }

    pub fn zeros(&mut self, n: usize) {
        for _ in 0..n {
            self.u8(0);
        }
    }
}

/// A fixed-size payload.
pub trait Wire: Sized {
    /// Encoded size in bytes.
    const SIZE: usize;

    /// # Errors
    /// [`TraceError::InvalidArgs`] for malformed fields.
    fn read(r: &mut Reader<'_>) -> Result<Self, TraceError>;

    fn write(&self, w: &mut Writer<'_>);

    /// Decode a request that must be exactly [`Wire::SIZE`] bytes.
    ///
    /// # Errors
    /// [`TraceError::InvalidArgs`] for any other length or a malformed field.
    fn decode(bytes: &[u8]) -> Result<Self, TraceError> {
        if bytes.len() != Self::SIZE {
            return Err(TraceError::InvalidArgs);
        }
        Self::read(&mut Reader(bytes))
    }

    /// Encode into the front of `out`, returning the bytes written.
    ///
    /// # Errors
    /// [`TraceError::BufferTooSmall`] if `out` is shorter than [`Wire::SIZE`].
    fn encode(&self, out: &mut [u8]) -> Result<usize, TraceError> {
        let out = out.get_mut(..Self::SIZE).ok_or(TraceError::BufferTooSmall)?;
        self.write(&mut Writer(out));
        Ok(Self::SIZE)
    }
}

impl Wire for u32 {
    const SIZE: usize = 4;

    fn read(r: &mut Reader<'_>) -> Result<Self, TraceError> {
        r.u32()
    }

    fn write(&self, w: &mut Writer<'_>) {
        w.u32(*self);
    }
}

impl Wire for TraceConfig {
    const SIZE: usize = 8;

    fn read(r: &mut Reader<'_>) -> Result<Self, TraceError> {
        let mode = TraceMode::from_raw(r.u32()?).ok_or(TraceError::InvalidArgs)?;
        Ok(Self {
            mode,
            num_traces: r.u32()?,
        })
    }

    fn write(&self, w: &mut Writer<'_>) {
        w.u32(self.mode as u32);
        w.u32(self.num_traces);
    }
}

impl Wire for BufferConfig {
    const SIZE: usize = 96;

    fn read(r: &mut Reader<'_>) -> Result<Self, TraceError> {
        let num_chunks = r.u32()?;
        let chunk_order = r.u32()?;
        let is_circular = r.u8()? != 0;
        r.skip(7)?;
        let ctl = r.u64()?;
        let cr3_match = r.u64()?;
        let mut addr_ranges = [AddrRange::default(); MAX_NUM_ADDR_RANGES];
        for range in &mut addr_ranges {
            range.a = r.u64()?;
            range.b = r.u64()?;
        }
        Ok(Self {
            num_chunks,
            chunk_order,
            is_circular,
            ctl,
            cr3_match,
            addr_ranges,
        })
    }

    fn write(&self, w: &mut Writer<'_>) {
        w.u32(self.num_chunks);
        w.u32(self.chunk_order);
        w.u8(u8::from(self.is_circular));
        w.zeros(7);
        w.u64(self.ctl);
        w.u64(self.cr3_match);
        for range in &self.addr_ranges {
            w.u64(range.a);
            w.u64(range.b);
        }
    }
}

/// Request of AssignThreadBuffer and ReleaseThreadBuffer.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ThreadBufferRequest {
    pub descriptor: u32,
    /// Consumed by the request.
    pub thread: RawHandle,
}

impl Wire for ThreadBufferRequest {
    const SIZE: usize = 8;

    fn read(r: &mut Reader<'_>) -> Result<Self, TraceError> {
        Ok(Self {
            descriptor: r.u32()?,
            thread: r.u32()?,
        })
    }

    fn write(&self, w: &mut Writer<'_>) {
        w.u32(self.descriptor);
        w.u32(self.thread);
    }
}

/// Reply of GetBufferInfo.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct BufferInfo {
    /// Bytes captured from the start of the buffer.
    pub capture_end: u64,
}

impl Wire for BufferInfo {
    const SIZE: usize = 8;

    fn read(r: &mut Reader<'_>) -> Result<Self, TraceError> {
        Ok(Self { capture_end: r.u64()? })
    }

    fn write(&self, w: &mut Writer<'_>) {
        w.u64(self.capture_end);
    }
}

/// Request of GetChunkHandle.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ChunkHandleRequest {
    pub descriptor: u32,
    pub chunk_num: u32,
}

impl Wire for ChunkHandleRequest {
    const SIZE: usize = 8;

    fn read(r: &mut Reader<'_>) -> Result<Self, TraceError> {
        Ok(Self {
            descriptor: r.u32()?,
            chunk_num: r.u32()?,
        })
    }

    fn write(&self, w: &mut Writer<'_>) {
        w.u32(self.descriptor);
        w.u32(self.chunk_num);
    }
}
