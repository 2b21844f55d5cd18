//! Hardware and ABI limits.

pub const PAGE_SHIFT: u32 = 12;
pub const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;

/// Upper bound on trace slots per session (CPUs or threads).
pub const MAX_NUM_TRACES: u32 = 256;

pub const MAX_NUM_CHUNKS: u32 = 4096;

/// Largest chunk is `PAGE_SIZE << MAX_CHUNK_ORDER`.
pub const MAX_CHUNK_ORDER: u32 = 8;

/// Pinned trace memory allowed per slot.
pub const MAX_PER_TRACE_SPACE: u64 = 256 * 1024 * 1024;

/// Entries in one ToPA table. One table is a single page and the last entry
/// is reserved for the END link.
pub const TOPA_MAX_TABLE_ENTRIES: usize = 256;

/// Smallest and largest output region a ToPA entry can describe, as `log2`.
pub const TOPA_MIN_SHIFT: u32 = 12;
pub const TOPA_MAX_SHIFT: u32 = 27;

pub const MAX_NUM_ADDR_RANGES: usize = 4;

/// Limits a session is created with.
///
/// The defaults are the constants of this module. Tests shrink
/// `topa_table_entries` to exercise multi-table layouts with few chunks.
/// A session only ever sees [`DriverConfig::clamped`] values, so no field
/// can exceed the constant of the same name.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct DriverConfig {
    pub max_num_traces: u32,
    pub max_num_chunks: u32,
    pub max_chunk_order: u32,
    pub max_per_trace_space: u64,
    /// Clamped to `2..=TOPA_MAX_TABLE_ENTRIES`.
    pub topa_table_entries: usize,
}

impl DriverConfig {
    pub const DEFAULT: Self = Self {
        max_num_traces: MAX_NUM_TRACES,
        max_num_chunks: MAX_NUM_CHUNKS,
        max_chunk_order: MAX_CHUNK_ORDER,
        max_per_trace_space: MAX_PER_TRACE_SPACE,
        topa_table_entries: TOPA_MAX_TABLE_ENTRIES,
    };

    #[must_use]
    pub const fn with_topa_table_entries(self, entries: usize) -> Self {
        Self {
            topa_table_entries: entries,
            ..self
        }
        .clamped()
    }

    /// Pull every limit into the range the driver can handle.
    #[must_use]
    pub const fn clamped(self) -> Self {
        let topa_table_entries = if self.topa_table_entries < 2 {
            2
        } else if self.topa_table_entries > TOPA_MAX_TABLE_ENTRIES {
            TOPA_MAX_TABLE_ENTRIES
        } else {
            self.topa_table_entries
        };
        Self {
            max_num_traces: min_u32(self.max_num_traces, MAX_NUM_TRACES),
            max_num_chunks: min_u32(self.max_num_chunks, MAX_NUM_CHUNKS),
            max_chunk_order: min_u32(self.max_chunk_order, MAX_CHUNK_ORDER),
            max_per_trace_space: if self.max_per_trace_space > MAX_PER_TRACE_SPACE {
                MAX_PER_TRACE_SPACE
            } else {
                self.max_per_trace_space
            },
            topa_table_entries,
        }
    }
}

const fn min_u32(a: u32, b: u32) -> u32 {
    if a < b { a } else { b }
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}
