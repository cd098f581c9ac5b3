#![forbid(unsafe_code)]
//! On-disk format parsing for SaveFS containers.
//!
//! Pure parsing crate with no I/O. Parses byte slices into
//! typed structures for the container header (layout, duplex, journal, save
//! and remap headers), remap map entries, allocation-table links, and
//! directory/file table entries, and serializes them back bit-exactly.

pub mod entry;
pub mod header;

pub use entry::{AllocationEntry, MapEntry, TableEntry};
pub use header::{
    AllocationTableInfo, ContainerHeader, DuplexHeader, DuplexLayerInfo, FsLayout,
    JournalHeader, JournalMapHeader, RemapHeader, SaveHeader,
};

use sfs_error::SaveError;
use sfs_types::ParseError;

/// Convert a parse failure into the runtime error surfaced to callers.
///
/// Parse errors only arise from header and record decoding, so they map to
/// `SaveError::Format`: the bytes are not a container this build understands.
#[must_use]
pub fn format_error(err: ParseError) -> SaveError {
    SaveError::Format(err.to_string())
}

/// Parse a table of `count` fixed-size map entries.
pub fn parse_map_entries(bytes: &[u8], count: u32) -> Result<Vec<MapEntry>, ParseError> {
    (0..count as usize)
        .map(|i| MapEntry::parse(bytes, i * sfs_types::MAP_ENTRY_SIZE))
        .collect()
}

/// Serialize map entries back-to-back.
#[must_use]
pub fn map_entries_to_bytes(entries: &[MapEntry]) -> Vec<u8> {
    let mut out = vec![0_u8; entries.len() * sfs_types::MAP_ENTRY_SIZE];
    for (i, entry) in entries.iter().enumerate() {
        let chunk = &mut out[i * sfs_types::MAP_ENTRY_SIZE..(i + 1) * sfs_types::MAP_ENTRY_SIZE];
        chunk.copy_from_slice(&entry.to_bytes());
    }
    out
}
