#![forbid(unsafe_code)]
//! Remap storage: a sparse virtual address space over physical extents.
//!
//! A remap table is a list of [`MapEntry`] records, each mapping a virtual
//! range onto a range of one of the base storages. The table is sorted at
//! construction and must not overlap. Virtually contiguous entries are
//! grouped into [`RemapSegment`]s.
//!
//! Lookups reuse the entry that resolved the previous access when it still
//! covers the requested offset, so sequential I/O does not search. Anything
//! else is a binary search over the sorted table.

use parking_lot::Mutex;
use sfs_error::{Result, SaveError};
use sfs_ondisk::{MapEntry, RemapHeader, format_error, parse_map_entries};
use sfs_storage::{SharedStorage, Storage};
use std::ops::Range;
use tracing::{debug, trace, warn};

/// Maximal run of virtually contiguous map entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemapSegment {
    pub offset: u64,
    pub length: u64,
    /// Index of the first entry of this segment in the sorted table.
    pub first_entry: usize,
    pub entry_count: usize,
}

impl RemapSegment {
    #[must_use]
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }
}

/// Virtual address space translated through a remap table.
pub struct RemapStorage {
    entries: Vec<MapEntry>,
    segments: Vec<RemapSegment>,
    bases: Vec<SharedStorage>,
    size: u64,
    writable: bool,
    /// Index of the entry that resolved the last access.
    last_entry: Mutex<usize>,
}

impl std::fmt::Debug for RemapStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemapStorage")
            .field("entries", &self.entries.len())
            .field("segments", &self.segments.len())
            .field("size", &self.size)
            .field("writable", &self.writable)
            .finish_non_exhaustive()
    }
}

impl RemapStorage {
    /// Build a writable remap over `bases`. `storage_type` of each entry
    /// indexes into `bases`.
    pub fn new(entries: Vec<MapEntry>, bases: Vec<SharedStorage>) -> Result<Self> {
        Self::build(entries, bases, true)
    }

    /// Build a remap whose writes fail with `Unsupported`.
    pub fn new_read_only(entries: Vec<MapEntry>, bases: Vec<SharedStorage>) -> Result<Self> {
        Self::build(entries, bases, false)
    }

    /// Parse `header.map_entry_count` entries from `table` and build a remap.
    pub fn from_table(
        header: &RemapHeader,
        table: &[u8],
        bases: Vec<SharedStorage>,
        writable: bool,
    ) -> Result<Self> {
        let entries = parse_map_entries(table, header.map_entry_count).map_err(format_error)?;
        let storage = Self::build(entries, bases, writable)?;
        let segment_count = storage.segments.len();
        if usize::try_from(header.map_segment_count).ok() != Some(segment_count) {
            warn!(
                recorded = header.map_segment_count,
                computed = segment_count,
                "remap_segment_count_mismatch"
            );
        }
        Ok(storage)
    }

    fn build(mut entries: Vec<MapEntry>, bases: Vec<SharedStorage>, writable: bool) -> Result<Self> {
        entries.sort_by_key(|entry| entry.virtual_offset);

        let mut segments: Vec<RemapSegment> = Vec::new();
        let mut previous_end: Option<u64> = None;
        for (index, entry) in entries.iter().enumerate() {
            if entry.size == 0 {
                return Err(SaveError::Format(format!(
                    "remap entry at virtual {:#x} has zero size",
                    entry.virtual_offset
                )));
            }
            let end = entry.virtual_end().ok_or_else(|| {
                SaveError::Format(format!(
                    "remap entry at virtual {:#x} overflows",
                    entry.virtual_offset
                ))
            })?;
            let base = usize::try_from(entry.storage_type)
                .ok()
                .and_then(|i| bases.get(i))
                .ok_or_else(|| {
                    SaveError::Format(format!(
                        "remap entry references unknown storage type {}",
                        entry.storage_type
                    ))
                })?;
            let physical_end = entry.physical_offset.checked_add(entry.size);
            if physical_end.is_none_or(|physical_end| physical_end > base.size()) {
                return Err(SaveError::Format(format!(
                    "remap entry at virtual {:#x} maps past its base storage",
                    entry.virtual_offset
                )));
            }

            match previous_end {
                Some(prev) if entry.virtual_offset < prev => {
                    return Err(SaveError::Format(format!(
                        "remap entries overlap at virtual {:#x}",
                        entry.virtual_offset
                    )));
                }
                Some(prev) if entry.virtual_offset == prev => {
                    if let Some(segment) = segments.last_mut() {
                        segment.length += entry.size;
                        segment.entry_count += 1;
                    }
                }
                _ => segments.push(RemapSegment {
                    offset: entry.virtual_offset,
                    length: entry.size,
                    first_entry: index,
                    entry_count: 1,
                }),
            }
            previous_end = Some(end);
        }

        let size = previous_end.unwrap_or(0);
        debug!(
            entries = entries.len(),
            segments = segments.len(),
            size,
            writable,
            "remap_built"
        );
        Ok(Self {
            entries,
            segments,
            bases,
            size,
            writable,
            last_entry: Mutex::new(0),
        })
    }

    /// The sorted entry table.
    #[must_use]
    pub fn entries(&self) -> &[MapEntry] {
        &self.entries
    }

    #[must_use]
    pub fn segments(&self) -> &[RemapSegment] {
        &self.segments
    }

    #[must_use]
    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// Index of the entry covering `virtual_offset`.
    fn resolve(&self, virtual_offset: u64) -> Option<usize> {
        let mut last = self.last_entry.lock();
        if self
            .entries
            .get(*last)
            .is_some_and(|entry| entry.contains(virtual_offset))
        {
            return Some(*last);
        }
        let after = self
            .entries
            .partition_point(|entry| entry.virtual_offset <= virtual_offset);
        let index = after.checked_sub(1)?;
        if !self.entries[index].contains(virtual_offset) {
            return None;
        }
        trace!(virtual_offset, entry = index, "remap_resolve");
        *last = index;
        Some(index)
    }

    /// Split `[offset, offset + len)` into per-entry spans and hand each to
    /// `op` as `(base, physical_offset, buffer_range)`.
    fn for_each_span(
        &self,
        offset: u64,
        len: usize,
        mut op: impl FnMut(&SharedStorage, u64, Range<usize>) -> Result<()>,
    ) -> Result<()> {
        let out_of_range = |at: u64| SaveError::OutOfRange {
            offset: at,
            len: len as u64,
            size: self.size,
        };
        if len == 0 {
            return if offset <= self.size {
                Ok(())
            } else {
                Err(out_of_range(offset))
            };
        }
        let mut done = 0_usize;
        while done < len {
            let virtual_offset = offset
                .checked_add(done as u64)
                .ok_or_else(|| out_of_range(offset))?;
            let index = self
                .resolve(virtual_offset)
                .ok_or_else(|| out_of_range(virtual_offset))?;
            let entry = &self.entries[index];
            let within = virtual_offset - entry.virtual_offset;
            let available = entry.size - within;
            let step = usize::try_from(available).map_or(len - done, |a| a.min(len - done));
            let base = &self.bases[entry.storage_type as usize];
            op(base, entry.physical_offset + within, done..done + step)?;
            done += step;
        }
        Ok(())
    }
}

impl Storage for RemapStorage {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.for_each_span(offset, buf.len(), |base, physical, range| {
            base.read_at(physical, &mut buf[range])
        })
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(SaveError::Unsupported(
                "write to read-only remap storage".to_owned(),
            ));
        }
        // Resolve the whole range first so a gap never leaves a partial write.
        self.for_each_span(offset, buf.len(), |_, _, _| Ok(()))?;
        self.for_each_span(offset, buf.len(), |base, physical, range| {
            base.write_at(physical, &buf[range])
        })
    }

    fn flush(&self) -> Result<()> {
        if !self.writable {
            return Ok(());
        }
        for base in &self.bases {
            base.flush()?;
        }
        Ok(())
    }

    fn size(&self) -> u64 {
        self.size
    }
}
