//! # Table of Physical Addresses
//!
//! The trace unit writes into a ring of output regions described by ToPA
//! tables. Each table is one page of 8-byte entries:
//!
//! ```text
//!  table 0                     table 1                     table k-1
//! ┌──────────────┐            ┌──────────────┐            ┌──────────────┐
//! │ chunk 0      │            │ chunk C-1    │            │ ...          │
//! │ chunk 1      │            │ ...          │            │ chunk N-1    │◄ STOP if
//! │ ...          │            │              │            │ END ─────────┼─┐ not circular
//! │ END ─────────┼──────────► │ END ─────────┼──► ...     └──────────────┘ │
//! └──────────────┘            └──────────────┘                             │
//!        ▲                                                                 │
//!        └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Chunks fill the first `C - 1` entries of each table (`C` = table
//! capacity). Full tables carry their END link in the last slot; a partially
//! filled final table carries it right after its last chunk. The final END
//! always points back at table 0.
//!
//! Reference: Intel SDM Vol. 3C, §33.2.6.2 "Table of Physical Addresses".

use crate::config::{PAGE_SHIFT, PAGE_SIZE, TOPA_MAX_SHIFT, TOPA_MAX_TABLE_ENTRIES, TOPA_MIN_SHIFT};
use crate::error::TraceError;
use crate::platform::{Bti, DmaBuffer, PhysicalAddress};
use alloc::vec::Vec;
use bitfield_struct::bitfield;
use kernel_registers::Ia32RtitOutputMaskPtrs;
use log::{debug, error, info, trace};

const ENTRY_BYTES: usize = 8;

/// One ToPA entry.
#[bitfield(u64)]
#[derive(Eq, PartialEq)]
pub struct TopaEntry {
    /// Bit 0, END: `address` is the next table, not an output region.
    pub end: bool,
    __: bool,
    /// Bit 2, INT: raise a PMI when this region fills.
    pub int: bool,
    __: bool,
    /// Bit 4, STOP: tracing stops when this region fills.
    pub stop: bool,
    __: bool,
    /// Bits 6–9, Size: region size is `1 << (size + 12)`.
    #[bits(4)]
    pub size: u8,
    #[bits(2)]
    __: u8,
    /// Bits 12–63, physical frame of the region or next table.
    #[bits(52)]
    pub frame: u64,
}

impl TopaEntry {
    /// Output region of `1 << size_shift` bytes at `pa`.
    #[must_use]
    pub fn output(pa: PhysicalAddress, size_shift: u32) -> Self {
        debug_assert!((TOPA_MIN_SHIFT..=TOPA_MAX_SHIFT).contains(&size_shift));
        #[allow(clippy::cast_possible_truncation)]
        let size = (size_shift - TOPA_MIN_SHIFT) as u8;
        Self::new().with_frame(pa.as_u64() >> PAGE_SHIFT).with_size(size)
    }

    /// END link to the table at `pa`.
    #[must_use]
    pub const fn link(pa: PhysicalAddress) -> Self {
        Self::new().with_frame(pa.as_u64() >> PAGE_SHIFT).with_end(true)
    }

    #[must_use]
    pub const fn address(self) -> PhysicalAddress {
        PhysicalAddress::new(self.frame() << PAGE_SHIFT)
    }

    #[must_use]
    pub fn size_shift(self) -> u32 {
        u32::from(self.size()) + TOPA_MIN_SHIFT
    }

    #[must_use]
    pub fn region_size(self) -> u64 {
        1 << self.size_shift()
    }
}

/// Entries needed for `num_chunks` chunks, END links included.
#[must_use]
pub const fn entry_count(num_chunks: usize, table_entries: usize) -> usize {
    num_chunks + num_chunks.div_ceil(table_entries - 1)
}

/// Tables needed to hold `entries` entries.
#[must_use]
pub const fn table_count(entries: usize, table_entries: usize) -> usize {
    entries.div_ceil(table_entries)
}

/// Check that a buffer of `num_chunks` chunks can be described at all.
///
/// # Errors
/// - [`TraceError::InvalidArgs`] if fewer than two entries would be needed,
///   or `table_entries` is outside `2..=TOPA_MAX_TABLE_ENTRIES`.
/// - [`TraceError::NotSupported`] if more than one output entry is needed
///   and the processor lacks multi-entry ToPA tables.
pub fn check_layout(num_chunks: usize, table_entries: usize, multi_entry: bool) -> Result<usize, TraceError> {
    if !(2..=TOPA_MAX_TABLE_ENTRIES).contains(&table_entries) {
        error!("unusable ToPA table capacity: {table_entries}");
        return Err(TraceError::InvalidArgs);
    }
    let entries = entry_count(num_chunks, table_entries);
    debug!(
        "ToPA for {num_chunks} chunks: {} END entries, {entries} total",
        entries - num_chunks
    );

    if entries < 2 {
        info!("invalid ToPA entry count: {entries}");
        return Err(TraceError::InvalidArgs);
    }
    // Early implementations allow a single output entry plus END.
    if !multi_entry && entries > 2 {
        return Err(TraceError::NotSupported);
    }
    Ok(table_count(entries, table_entries))
}

/// The ToPA tables of one trace buffer.
pub struct Topa<B> {
    tables: Vec<B>,
    table_entries: usize,
}

impl<B: DmaBuffer> Topa<B> {
    /// Allocate tables for `chunks` and lay out the ring.
    ///
    /// The layout must have passed [`check_layout`]. Tables allocated before
    /// a failure are released.
    ///
    /// # Errors
    /// - [`TraceError::NoMemory`] if a table cannot be allocated.
    /// - [`TraceError::Internal`] if a table is not page aligned.
    pub fn build<A>(bti: &mut A, chunks: &[B], chunk_shift: u32, table_entries: usize, circular: bool) -> Result<Self, TraceError>
    where
        A: Bti<Buffer = B>,
    {
        let count = table_count(entry_count(chunks.len(), table_entries), table_entries);

        let mut tables = Vec::new();
        tables.try_reserve_exact(count).map_err(|_| TraceError::NoMemory)?;
        for _ in 0..count {
            let table = bti.alloc_contiguous(PAGE_SIZE, PAGE_SHIFT)?;
            if !table.phys().is_aligned(PAGE_SHIFT) {
                error!("ToPA table at {} is not page aligned", table.phys());
                return Err(TraceError::Internal);
            }
            tables.push(table);
        }

        let mut topa = Self { tables, table_entries };
        topa.lay_out(chunks.iter().map(DmaBuffer::phys), chunk_shift, circular);
        Ok(topa)
    }

    fn lay_out(&mut self, chunks: impl Iterator<Item = PhysicalAddress>, chunk_shift: u32, circular: bool) {
        let cap = self.table_entries;
        let num_tables = self.tables.len();

        let mut table = 0;
        let mut index = 0;
        let mut last = None;

        for pa in chunks {
            self.set(table, index, TopaEntry::output(pa, chunk_shift));
            last = Some((table, index));

            // The last slot of every table is kept for the END link.
            if index >= cap - 2 {
                index = 0;
                table += 1;
            } else {
                index += 1;
            }
        }

        for t in 0..table {
            let next = if t == num_tables - 1 { 0 } else { t + 1 };
            let link = TopaEntry::link(self.tables[next].phys());
            self.set(t, cap - 1, link);
        }

        // A partially filled last table ends right after its last chunk.
        if table < num_tables {
            let link = TopaEntry::link(self.tables[0].phys());
            self.set(table, index, link);
        }

        if !circular && let Some((t, i)) = last {
            let entry = self.entry(t, i).with_stop(true);
            self.set(t, i, entry);
        }
    }

    fn set(&mut self, table: usize, index: usize, entry: TopaEntry) {
        let offset = index * ENTRY_BYTES;
        self.tables[table].bytes_mut()[offset..offset + ENTRY_BYTES]
            .copy_from_slice(&entry.into_bits().to_le_bytes());
    }

    /// Entry `index` of table `table`.
    ///
    /// # Panics
    /// If either index is out of range.
    #[must_use]
    pub fn entry(&self, table: usize, index: usize) -> TopaEntry {
        let offset = index * ENTRY_BYTES;
        let mut raw = [0u8; ENTRY_BYTES];
        raw.copy_from_slice(&self.tables[table].bytes()[offset..offset + ENTRY_BYTES]);
        TopaEntry::from_bits(u64::from_le_bytes(raw))
    }

    #[must_use]
    pub const fn num_tables(&self) -> usize {
        self.tables.len()
    }

    #[must_use]
    pub const fn table_entries(&self) -> usize {
        self.table_entries
    }

    /// Physical address of table `table`.
    #[must_use]
    pub fn table_address(&self, table: usize) -> Option<PhysicalAddress> {
        self.tables.get(table).map(DmaBuffer::phys)
    }

    /// The table the trace unit starts from; the initial `IA32_RTIT_OUTPUT_BASE`.
    #[must_use]
    pub fn first_table(&self) -> PhysicalAddress {
        self.tables.first().map_or_else(PhysicalAddress::default, DmaBuffer::phys)
    }

    /// Bytes written before the position given by `output_base` and
    /// `mask_ptrs`, walking the tables in allocation order.
    ///
    /// For a circular buffer this is only where tracing stopped. Returns
    /// `None` if the position is not inside the ring.
    #[must_use]
    pub fn capture_size(&self, output_base: PhysicalAddress, mask_ptrs: Ia32RtitOutputMaskPtrs) -> Option<u64> {
        let current = mask_ptrs.table_entry() as usize;
        let offset = u64::from(mask_ptrs.output_offset());
        trace!("capture position: table {output_base}, entry {current}, offset {offset:#x}");

        let mut total = 0;
        for (t, table) in self.tables.iter().enumerate() {
            let here = table.phys() == output_base;
            for index in 0..self.table_entries - 1 {
                if here && index >= current {
                    return Some(total + offset);
                }
                let entry = self.entry(t, index);
                if entry.end() {
                    break;
                }
                total += entry.region_size();
            }
        }
        None
    }
}
