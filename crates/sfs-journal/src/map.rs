//! Logical-to-physical block map and its bitmaps.
//!
//! Persisted form, at offsets given by [`JournalMapLayout`] inside the
//! metadata storage:
//!
//! ```text
//! table              u32[main_block_count]   physical block | MAPPED_FLAG
//! physical bitmap    bit per physical block  redirected in the last commit
//! virtual bitmap     bit per logical block   redirected in the last commit
//! free bitmap        bit per physical block  unassigned
//! ```

use serde::{Deserialize, Serialize};
use sfs_error::{Result, SaveError};
use sfs_ondisk::FsLayout;
use sfs_storage::Storage;
use sfs_types::{
    bitmap_clear, bitmap_count_set, bitmap_find_set, bitmap_get, bitmap_len, bitmap_set,
    read_le_u32, u64_to_usize,
};
use tracing::{debug, warn};

/// Bit 31 of a table entry is reserved; set on write, masked on read.
pub const MAPPED_FLAG: u32 = 0x8000_0000;

/// Where the map lives in the metadata storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct JournalMapLayout {
    pub table_offset: u64,
    pub physical_bitmap_offset: u64,
    pub virtual_bitmap_offset: u64,
    pub free_bitmap_offset: u64,
}

impl JournalMapLayout {
    #[must_use]
    pub fn from_layout(layout: &FsLayout) -> Self {
        Self {
            table_offset: layout.journal_map_table_offset,
            physical_bitmap_offset: layout.journal_physical_bitmap_offset,
            virtual_bitmap_offset: layout.journal_virtual_bitmap_offset,
            free_bitmap_offset: layout.journal_free_bitmap_offset,
        }
    }
}

/// Bytes of the mapping table for `main_block_count` logical blocks.
#[must_use]
pub fn table_size(main_block_count: u32) -> u64 {
    u64::from(main_block_count) * 4
}

fn bitmap_bytes(bits: u32) -> Result<usize> {
    u64_to_usize(bitmap_len(u64::from(bits)), "journal_bitmap.len")
        .map_err(|err| SaveError::Format(err.to_string()))
}

/// In-memory journal map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalMap {
    physical: Vec<u32>,
    physical_block_count: u32,
    updated_physical: Vec<u8>,
    updated_virtual: Vec<u8>,
    unassigned: Vec<u8>,
}

impl JournalMap {
    /// Identity map: logical `i` on physical `i`, the spare blocks unassigned.
    pub fn identity(main_block_count: u32, journal_block_count: u32) -> Result<Self> {
        let physical_block_count = main_block_count
            .checked_add(journal_block_count)
            .ok_or_else(|| SaveError::Format("journal block count overflows".to_owned()))?;
        let mut unassigned = vec![0_u8; bitmap_bytes(physical_block_count)?];
        for block in main_block_count..physical_block_count {
            bitmap_set(&mut unassigned, u64::from(block));
        }
        Ok(Self {
            physical: (0..main_block_count).collect(),
            physical_block_count,
            updated_physical: vec![0_u8; bitmap_bytes(physical_block_count)?],
            updated_virtual: vec![0_u8; bitmap_bytes(main_block_count)?],
            unassigned,
        })
    }

    /// Rebuild the map from its persisted table.
    ///
    /// Every physical index must be in range and referenced at most once.
    /// The unassigned pool is recomputed as the complement of the referenced
    /// set; the persisted free bitmap is only cross-checked.
    pub fn read_mapping_entries(
        meta: &dyn Storage,
        layout: &JournalMapLayout,
        main_block_count: u32,
        journal_block_count: u32,
    ) -> Result<Self> {
        let mut map = Self::identity(main_block_count, journal_block_count)?;
        let table_len = u64_to_usize(table_size(main_block_count), "journal_table.len")
            .map_err(|err| SaveError::Format(err.to_string()))?;
        let mut table = vec![0_u8; table_len];
        meta.read_at(layout.table_offset, &mut table)?;

        let mut referenced = vec![0_u8; map.unassigned.len()];
        for (logical, slot) in (0..main_block_count).zip(map.physical.iter_mut()) {
            let offset = u64_to_usize(u64::from(logical) * 4, "journal_table.offset")
                .map_err(|err| SaveError::Format(err.to_string()))?;
            let raw = read_le_u32(&table, offset).map_err(|err| SaveError::Format(err.to_string()))?;
            let physical = raw & !MAPPED_FLAG;
            let at = layout.table_offset + offset as u64;
            if physical >= map.physical_block_count {
                return Err(SaveError::corruption(
                    at,
                    format!(
                        "journal maps logical {logical} to physical {physical}, past {}",
                        map.physical_block_count
                    ),
                ));
            }
            if bitmap_get(&referenced, u64::from(physical)) {
                return Err(SaveError::corruption(
                    at,
                    format!("journal maps physical {physical} twice"),
                ));
            }
            bitmap_set(&mut referenced, u64::from(physical));
            *slot = physical;
        }
        for block in 0..map.physical_block_count {
            if bitmap_get(&referenced, u64::from(block)) {
                bitmap_clear(&mut map.unassigned, u64::from(block));
            } else {
                bitmap_set(&mut map.unassigned, u64::from(block));
            }
        }

        let mut persisted_free = vec![0_u8; map.unassigned.len()];
        meta.read_at(layout.free_bitmap_offset, &mut persisted_free)?;
        if persisted_free != map.unassigned {
            warn!(
                target: "sfs::journal",
                "journal_free_bitmap_stale"
            );
        }
        let mut last_commit = vec![0_u8; map.updated_virtual.len()];
        meta.read_at(layout.virtual_bitmap_offset, &mut last_commit)?;
        debug!(
            target: "sfs::journal",
            main_block_count,
            journal_block_count,
            unassigned = map.unassigned_count(),
            last_commit_redirects = bitmap_count_set(&last_commit, u64::from(main_block_count)),
            "journal_map_loaded"
        );
        Ok(map)
    }

    /// Persist the table and the three bitmaps.
    pub fn write(&self, meta: &dyn Storage, layout: &JournalMapLayout) -> Result<()> {
        let mut table = Vec::with_capacity(self.physical.len() * 4);
        for physical in &self.physical {
            table.extend_from_slice(&(physical | MAPPED_FLAG).to_le_bytes());
        }
        meta.write_at(layout.table_offset, &table)?;
        meta.write_at(layout.physical_bitmap_offset, &self.updated_physical)?;
        meta.write_at(layout.virtual_bitmap_offset, &self.updated_virtual)?;
        meta.write_at(layout.free_bitmap_offset, &self.unassigned)
    }

    #[must_use]
    pub fn main_block_count(&self) -> u32 {
        u32::try_from(self.physical.len()).unwrap_or(u32::MAX)
    }

    #[must_use]
    pub fn physical_block_count(&self) -> u32 {
        self.physical_block_count
    }

    fn slot(&self, logical: u32) -> Option<usize> {
        usize::try_from(logical)
            .ok()
            .filter(|index| *index < self.physical.len())
    }

    /// Physical block backing logical block `logical`.
    #[must_use]
    pub fn physical_of(&self, logical: u32) -> Option<u32> {
        self.slot(logical).and_then(|index| self.physical.get(index)).copied()
    }

    /// Whether `logical` was already redirected this generation.
    #[must_use]
    pub fn is_updated(&self, logical: u32) -> bool {
        bitmap_get(&self.updated_virtual, u64::from(logical))
    }

    #[must_use]
    pub fn is_unassigned(&self, physical: u32) -> bool {
        bitmap_get(&self.unassigned, u64::from(physical))
    }

    #[must_use]
    pub fn unassigned_count(&self) -> u64 {
        bitmap_count_set(&self.unassigned, u64::from(self.physical_block_count))
    }

    /// Number of logical blocks redirected this generation.
    #[must_use]
    pub fn updated_count(&self) -> u64 {
        bitmap_count_set(&self.updated_virtual, u64::from(self.main_block_count()))
    }

    /// Point `logical` at a fresh unassigned block. Returns `(old, new)`.
    /// The old block is not released; the caller reclaims it after commit.
    pub(crate) fn redirect(&mut self, logical: u32) -> Result<(u32, u32)> {
        let out_of_range = SaveError::OutOfRange {
            offset: u64::from(logical),
            len: 1,
            size: u64::from(self.main_block_count()),
        };
        let index = self.slot(logical).ok_or(out_of_range)?;
        let old = self.physical[index];
        let new = bitmap_find_set(&self.unassigned, u64::from(self.physical_block_count), 0)
            .ok_or(SaveError::JournalFull)?;
        let new = u32::try_from(new).map_err(|_| SaveError::JournalFull)?;
        bitmap_clear(&mut self.unassigned, u64::from(new));
        bitmap_set(&mut self.updated_physical, u64::from(new));
        bitmap_set(&mut self.updated_virtual, u64::from(logical));
        self.physical[index] = new;
        Ok((old, new))
    }

    /// Treat `logical` as already redirected so writes go to its current
    /// physical block. Returns whether it was not claimed before.
    pub(crate) fn claim(&mut self, logical: u32) -> bool {
        if self.is_updated(logical) {
            return false;
        }
        if let Some(physical) = self.physical_of(logical) {
            bitmap_set(&mut self.updated_physical, u64::from(physical));
        }
        bitmap_set(&mut self.updated_virtual, u64::from(logical));
        true
    }

    pub(crate) fn release(&mut self, physical: u32) {
        bitmap_set(&mut self.unassigned, u64::from(physical));
    }

    pub(crate) fn clear_updated(&mut self) {
        self.updated_physical.fill(0);
        self.updated_virtual.fill(0);
    }

    /// Bytes each bitmap occupies: `(physical, virtual, free)`.
    #[must_use]
    pub fn bitmap_sizes(main_block_count: u32, journal_block_count: u32) -> (u64, u64, u64) {
        let physical = bitmap_len(u64::from(main_block_count) + u64::from(journal_block_count));
        (physical, bitmap_len(u64::from(main_block_count)), physical)
    }
}
