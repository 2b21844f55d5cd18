//! Trace data chunks: contiguous runs of `1 << order` pages.

use crate::config::{DriverConfig, PAGE_SHIFT, PAGE_SIZE};
use crate::error::TraceError;
use crate::platform::{Bti, DmaBuffer};
use alloc::vec::Vec;
use log::{debug, error};

/// Check a requested buffer geometry against `config`.
///
/// Returns the size of one chunk in bytes.
///
/// # Errors
/// [`TraceError::InvalidArgs`] for zero or too many chunks, an order above
/// the limit, or a total size above the per-trace limit.
pub fn validate_geometry(num_chunks: u32, chunk_order: u32, config: &DriverConfig) -> Result<u64, TraceError> {
    debug!("num_chunks {num_chunks}, chunk_order {chunk_order}");

    if num_chunks == 0 || num_chunks > config.max_num_chunks {
        return Err(TraceError::InvalidArgs);
    }
    if chunk_order > config.max_chunk_order {
        return Err(TraceError::InvalidArgs);
    }

    let chunk_size = PAGE_SIZE << chunk_order;
    let total = u64::from(num_chunks) * chunk_size;
    if total > config.max_per_trace_space {
        return Err(TraceError::InvalidArgs);
    }
    Ok(chunk_size)
}

/// Allocate `num_chunks` chunks of `PAGE_SIZE << chunk_order` bytes, each
/// aligned to its own size.
///
/// The geometry must have passed [`validate_geometry`]. Chunks obtained
/// before a failure are released when the partial vector is dropped.
///
/// # Errors
/// - [`TraceError::NoMemory`] if the allocator runs dry.
/// - [`TraceError::Internal`] if the allocator hands out a misaligned chunk;
///   the hardware would fault on it.
pub fn allocate_chunks<B: Bti>(bti: &mut B, num_chunks: u32, chunk_order: u32) -> Result<Vec<B::Buffer>, TraceError> {
    let alignment_log2 = PAGE_SHIFT + chunk_order;
    let chunk_size = PAGE_SIZE << chunk_order;

    let mut chunks = Vec::new();
    chunks
        .try_reserve_exact(num_chunks as usize)
        .map_err(|_| TraceError::NoMemory)?;

    for i in 0..num_chunks {
        let chunk = bti.alloc_contiguous(chunk_size, alignment_log2)?;
        let pa = chunk.phys();
        if !pa.is_aligned(alignment_log2) {
            error!("chunk {i} has bad alignment: alignment {alignment_log2}, got {pa}");
            return Err(TraceError::Internal);
        }
        chunks.push(chunk);
    }
    Ok(chunks)
}
