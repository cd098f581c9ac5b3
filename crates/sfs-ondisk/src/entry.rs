#![forbid(unsafe_code)]
//! Fixed-size records: remap map entries, allocation-table links and
//! directory/file table entries.

use serde::{Deserialize, Serialize};
use sfs_types::{
    ALLOCATION_ENTRY_SIZE, MAP_ENTRY_SIZE, ParseError, TABLE_ENTRY_SIZE, TABLE_NAME_MAX,
    ensure_slice, i64_to_u64, read_fixed, read_le_i64, read_le_u32, read_le_u64, trim_nul_padded,
};

// ── Remap map entry ─────────────────────────────────────────────────────────

/// One virtual→physical extent of a remap table.
///
/// ```text
/// [0x00] i64 virtual_offset
/// [0x08] i64 physical_offset
/// [0x10] i64 size
/// [0x18] i32 alignment
/// [0x1C] i32 storage_type
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapEntry {
    pub virtual_offset: u64,
    pub physical_offset: u64,
    pub size: u64,
    pub alignment: u32,
    pub storage_type: u32,
}

impl MapEntry {
    pub fn parse(bytes: &[u8], offset: usize) -> Result<Self, ParseError> {
        let record = ensure_slice(bytes, offset, MAP_ENTRY_SIZE)?;
        Ok(Self {
            virtual_offset: i64_to_u64(read_le_i64(record, 0x00)?, "map_entry.virtual_offset")?,
            physical_offset: i64_to_u64(read_le_i64(record, 0x08)?, "map_entry.physical_offset")?,
            size: i64_to_u64(read_le_i64(record, 0x10)?, "map_entry.size")?,
            alignment: read_le_u32(record, 0x18)?,
            storage_type: read_le_u32(record, 0x1C)?,
        })
    }

    #[must_use]
    pub fn to_bytes(&self) -> [u8; MAP_ENTRY_SIZE] {
        let mut out = [0_u8; MAP_ENTRY_SIZE];
        out[0x00..0x08].copy_from_slice(&self.virtual_offset.to_le_bytes());
        out[0x08..0x10].copy_from_slice(&self.physical_offset.to_le_bytes());
        out[0x10..0x18].copy_from_slice(&self.size.to_le_bytes());
        out[0x18..0x1C].copy_from_slice(&self.alignment.to_le_bytes());
        out[0x1C..0x20].copy_from_slice(&self.storage_type.to_le_bytes());
        out
    }

    /// Exclusive end of the virtual range. `None` on overflow.
    #[must_use]
    pub fn virtual_end(&self) -> Option<u64> {
        self.virtual_offset.checked_add(self.size)
    }

    /// Whether `virtual_offset` lies inside this entry.
    #[must_use]
    pub fn contains(&self, virtual_offset: u64) -> bool {
        virtual_offset >= self.virtual_offset
            && self
                .virtual_end()
                .is_some_and(|end| virtual_offset < end)
    }
}

// ── Allocation-table link ───────────────────────────────────────────────────

/// One allocation-table entry: doubly-linked `prev`/`next` entry indices.
///
/// Entry 0 anchors the free list; block `b` is entry `b + 1`. A link value of
/// 0 terminates a list, since entry 0 is never a chain member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AllocationEntry {
    pub prev: u32,
    pub next: u32,
}

impl AllocationEntry {
    pub fn parse(bytes: &[u8]) -> Result<Self, ParseError> {
        Ok(Self {
            prev: read_le_u32(bytes, 0)?,
            next: read_le_u32(bytes, 4)?,
        })
    }

    #[must_use]
    pub fn to_bytes(self) -> [u8; ALLOCATION_ENTRY_SIZE] {
        let mut out = [0_u8; ALLOCATION_ENTRY_SIZE];
        out[0..4].copy_from_slice(&self.prev.to_le_bytes());
        out[4..8].copy_from_slice(&self.next.to_le_bytes());
        out
    }
}

// ── Directory / file table entry ────────────────────────────────────────────

/// One directory or file table entry (0x60 bytes).
///
/// ```text
/// [0x00] i32 parent
/// [0x04] char name[0x40]          NUL-terminated when shorter than 0x40
/// [0x44] i32 next_sibling
/// [0x48] i32 block_or_first_dir   file: start block, dir: first child dir
/// [0x4C] i64 length_or_first_file file: byte length, dir: first child file
/// [0x54] i64 reserved
/// [0x5C] i32 next                 hash collision chain / free slot list
/// ```
///
/// Index fields use `u32::MAX` (i32 `-1`) for "none".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableEntry {
    pub parent: u32,
    pub name: [u8; TABLE_NAME_MAX],
    pub next_sibling: u32,
    pub block_or_first_dir: u32,
    pub length_or_first_file: u64,
    pub reserved: u64,
    pub next: u32,
}

impl Default for TableEntry {
    fn default() -> Self {
        Self {
            parent: u32::MAX,
            name: [0_u8; TABLE_NAME_MAX],
            next_sibling: u32::MAX,
            block_or_first_dir: u32::MAX,
            length_or_first_file: 0,
            reserved: 0,
            next: u32::MAX,
        }
    }
}

impl TableEntry {
    pub fn parse(bytes: &[u8]) -> Result<Self, ParseError> {
        let record = ensure_slice(bytes, 0, TABLE_ENTRY_SIZE)?;
        Ok(Self {
            parent: read_le_u32(record, 0x00)?,
            name: read_fixed::<TABLE_NAME_MAX>(record, 0x04)?,
            next_sibling: read_le_u32(record, 0x44)?,
            block_or_first_dir: read_le_u32(record, 0x48)?,
            length_or_first_file: read_le_u64(record, 0x4C)?,
            reserved: read_le_u64(record, 0x54)?,
            next: read_le_u32(record, 0x5C)?,
        })
    }

    #[must_use]
    pub fn to_bytes(&self) -> [u8; TABLE_ENTRY_SIZE] {
        let mut out = [0_u8; TABLE_ENTRY_SIZE];
        out[0x00..0x04].copy_from_slice(&self.parent.to_le_bytes());
        out[0x04..0x44].copy_from_slice(&self.name);
        out[0x44..0x48].copy_from_slice(&self.next_sibling.to_le_bytes());
        out[0x48..0x4C].copy_from_slice(&self.block_or_first_dir.to_le_bytes());
        out[0x4C..0x54].copy_from_slice(&self.length_or_first_file.to_le_bytes());
        out[0x54..0x5C].copy_from_slice(&self.reserved.to_le_bytes());
        out[0x5C..0x60].copy_from_slice(&self.next.to_le_bytes());
        out
    }

    /// The stored name without NUL padding.
    #[must_use]
    pub fn name_bytes(&self) -> &[u8] {
        trim_nul_padded(&self.name)
    }

    /// Store `name`, NUL-padding the remainder of the field.
    pub fn set_name(&mut self, name: &[u8]) -> Result<(), ParseError> {
        if name.len() > TABLE_NAME_MAX {
            return Err(ParseError::InvalidField {
                field: "table_entry.name",
                reason: "longer than 0x40 bytes",
            });
        }
        if name.contains(&0) {
            return Err(ParseError::InvalidField {
                field: "table_entry.name",
                reason: "embedded NUL",
            });
        }
        self.name = [0_u8; TABLE_NAME_MAX];
        self.name[..name.len()].copy_from_slice(name);
        Ok(())
    }
}
