#![forbid(unsafe_code)]
//! Container header structures.
//!
//! The first `HEADER_SIZE` bytes of a container hold a fixed set of
//! little-endian records at fixed offsets:
//!
//! ```text
//! 0x000  CMAC (opaque, 0x10)
//! 0x100  FsLayout      "DISF"  0x200
//! 0x300  DuplexHeader  "DPFS"  0x44
//! 0x408  JournalHeader "JNGL"  0x30
//! 0x608  SaveHeader    "SAVE"  0x48
//! 0x650  RemapHeader   "RMAP"  0x40  (file remap)
//! 0x690  RemapHeader   "RMAP"  0x40  (meta remap)
//! ```

use serde::{Deserialize, Serialize};
use sfs_types::{
    BlockSize, CMAC_OFFSET, CMAC_SIZE, DUPLEX_HEADER_OFFSET, DUPLEX_HEADER_SIZE, DUPLEX_MAGIC,
    DUPLEX_VERSION, FILE_REMAP_HEADER_OFFSET, HEADER_SIZE, JOURNAL_HEADER_OFFSET,
    JOURNAL_HEADER_SIZE, JOURNAL_MAGIC, JOURNAL_VERSION, LAYOUT_MAGIC, LAYOUT_OFFSET, LAYOUT_SIZE,
    LAYOUT_VERSION, META_REMAP_HEADER_OFFSET, ParseError, REMAP_HEADER_SIZE, REMAP_MAGIC,
    REMAP_VERSION, SAVE_HEADER_OFFSET, SAVE_HEADER_SIZE, SAVE_MAGIC, SAVE_VERSION, ensure_slice,
    ensure_slice_mut, expect_magic, read_fixed, read_le_u32, read_le_u64, write_bytes,
    write_le_u32, write_le_u64,
};

// ── FsLayout ────────────────────────────────────────────────────────────────

/// Absolute offsets and sizes of every container region.
///
/// Offsets of the remap entry tables, the remap data region and the duplex
/// master bitmaps are container-absolute. Duplex L1/data offsets are virtual
/// offsets in the meta remap. The journal data offset is a virtual offset in
/// the file remap. Journal table/bitmap and allocation-table offsets are
/// relative to the exposed duplex ("meta") storage.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FsLayout {
    pub version: u32,
    pub hash: [u8; 0x20],
    pub file_map_entry_offset: u64,
    pub file_map_entry_size: u64,
    pub meta_map_entry_offset: u64,
    pub meta_map_entry_size: u64,
    pub file_map_data_offset: u64,
    pub file_map_data_size: u64,
    pub duplex_l1_offset_a: u64,
    pub duplex_l1_offset_b: u64,
    pub duplex_l1_size: u64,
    pub duplex_data_offset_a: u64,
    pub duplex_data_offset_b: u64,
    pub duplex_data_size: u64,
    pub journal_data_offset: u64,
    pub journal_data_size_a: u64,
    pub journal_data_size_b: u64,
    pub journal_size: u64,
    pub duplex_master_offset_a: u64,
    pub duplex_master_offset_b: u64,
    pub duplex_master_size: u64,
    pub ivfc_master_hash_offset_a: u64,
    pub ivfc_master_hash_offset_b: u64,
    pub ivfc_master_hash_size: u64,
    pub journal_map_table_offset: u64,
    pub journal_map_table_size: u64,
    pub journal_physical_bitmap_offset: u64,
    pub journal_physical_bitmap_size: u64,
    pub journal_virtual_bitmap_offset: u64,
    pub journal_virtual_bitmap_size: u64,
    pub journal_free_bitmap_offset: u64,
    pub journal_free_bitmap_size: u64,
    pub ivfc_l1_offset: u64,
    pub ivfc_l1_size: u64,
    pub ivfc_l2_offset: u64,
    pub ivfc_l2_size: u64,
    pub ivfc_l3_offset: u64,
    pub ivfc_l3_size: u64,
    pub fat_offset: u64,
    pub fat_size: u64,
    pub duplex_index: u8,
}

impl FsLayout {
    pub fn parse(region: &[u8]) -> Result<Self, ParseError> {
        let region = ensure_slice(region, 0, LAYOUT_SIZE)?;
        expect_magic(region, 0x00, LAYOUT_MAGIC)?;
        let version = read_le_u32(region, 0x04)?;
        if version != LAYOUT_VERSION {
            return Err(ParseError::InvalidField {
                field: "fs_layout.version",
                reason: "unsupported version",
            });
        }
        let duplex_index = region[0x158];
        if duplex_index > 1 {
            return Err(ParseError::InvalidField {
                field: "fs_layout.duplex_index",
                reason: "must be 0 or 1",
            });
        }
        let field = |offset: usize| read_le_u64(region, offset);
        Ok(Self {
            version,
            hash: read_fixed::<0x20>(region, 0x08)?,
            file_map_entry_offset: field(0x28)?,
            file_map_entry_size: field(0x30)?,
            meta_map_entry_offset: field(0x38)?,
            meta_map_entry_size: field(0x40)?,
            file_map_data_offset: field(0x48)?,
            file_map_data_size: field(0x50)?,
            duplex_l1_offset_a: field(0x58)?,
            duplex_l1_offset_b: field(0x60)?,
            duplex_l1_size: field(0x68)?,
            duplex_data_offset_a: field(0x70)?,
            duplex_data_offset_b: field(0x78)?,
            duplex_data_size: field(0x80)?,
            journal_data_offset: field(0x88)?,
            journal_data_size_a: field(0x90)?,
            journal_data_size_b: field(0x98)?,
            journal_size: field(0xA0)?,
            duplex_master_offset_a: field(0xA8)?,
            duplex_master_offset_b: field(0xB0)?,
            duplex_master_size: field(0xB8)?,
            ivfc_master_hash_offset_a: field(0xC0)?,
            ivfc_master_hash_offset_b: field(0xC8)?,
            ivfc_master_hash_size: field(0xD0)?,
            journal_map_table_offset: field(0xD8)?,
            journal_map_table_size: field(0xE0)?,
            journal_physical_bitmap_offset: field(0xE8)?,
            journal_physical_bitmap_size: field(0xF0)?,
            journal_virtual_bitmap_offset: field(0xF8)?,
            journal_virtual_bitmap_size: field(0x100)?,
            journal_free_bitmap_offset: field(0x108)?,
            journal_free_bitmap_size: field(0x110)?,
            ivfc_l1_offset: field(0x118)?,
            ivfc_l1_size: field(0x120)?,
            ivfc_l2_offset: field(0x128)?,
            ivfc_l2_size: field(0x130)?,
            ivfc_l3_offset: field(0x138)?,
            ivfc_l3_size: field(0x140)?,
            fat_offset: field(0x148)?,
            fat_size: field(0x150)?,
            duplex_index,
        })
    }

    pub fn write_into(&self, region: &mut [u8]) -> Result<(), ParseError> {
        let region = ensure_slice_mut(region, 0, LAYOUT_SIZE)?;
        region.fill(0);
        write_le_u32(region, 0x00, LAYOUT_MAGIC)?;
        write_le_u32(region, 0x04, self.version)?;
        write_bytes(region, 0x08, &self.hash)?;
        let fields = [
            (0x28, self.file_map_entry_offset),
            (0x30, self.file_map_entry_size),
            (0x38, self.meta_map_entry_offset),
            (0x40, self.meta_map_entry_size),
            (0x48, self.file_map_data_offset),
            (0x50, self.file_map_data_size),
            (0x58, self.duplex_l1_offset_a),
            (0x60, self.duplex_l1_offset_b),
            (0x68, self.duplex_l1_size),
            (0x70, self.duplex_data_offset_a),
            (0x78, self.duplex_data_offset_b),
            (0x80, self.duplex_data_size),
            (0x88, self.journal_data_offset),
            (0x90, self.journal_data_size_a),
            (0x98, self.journal_data_size_b),
            (0xA0, self.journal_size),
            (0xA8, self.duplex_master_offset_a),
            (0xB0, self.duplex_master_offset_b),
            (0xB8, self.duplex_master_size),
            (0xC0, self.ivfc_master_hash_offset_a),
            (0xC8, self.ivfc_master_hash_offset_b),
            (0xD0, self.ivfc_master_hash_size),
            (0xD8, self.journal_map_table_offset),
            (0xE0, self.journal_map_table_size),
            (0xE8, self.journal_physical_bitmap_offset),
            (0xF0, self.journal_physical_bitmap_size),
            (0xF8, self.journal_virtual_bitmap_offset),
            (0x100, self.journal_virtual_bitmap_size),
            (0x108, self.journal_free_bitmap_offset),
            (0x110, self.journal_free_bitmap_size),
            (0x118, self.ivfc_l1_offset),
            (0x120, self.ivfc_l1_size),
            (0x128, self.ivfc_l2_offset),
            (0x130, self.ivfc_l2_size),
            (0x138, self.ivfc_l3_offset),
            (0x140, self.ivfc_l3_size),
            (0x148, self.fat_offset),
            (0x150, self.fat_size),
        ];
        for (offset, value) in fields {
            write_le_u64(region, offset, value)?;
        }
        region[0x158] = self.duplex_index;
        Ok(())
    }

    /// Container offset of the master bitmap selected by `index`.
    #[must_use]
    pub fn master_offset(&self, index: u8) -> u64 {
        if index == 0 {
            self.duplex_master_offset_a
        } else {
            self.duplex_master_offset_b
        }
    }
}

// ── DuplexHeader ────────────────────────────────────────────────────────────

/// One duplex level: region offset, size and log2 block size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DuplexLayerInfo {
    pub offset: u64,
    pub size: u64,
    pub block_size_power: u32,
}

impl DuplexLayerInfo {
    const SIZE: usize = 0x14;

    fn parse(region: &[u8], offset: usize) -> Result<Self, ParseError> {
        let record = ensure_slice(region, offset, Self::SIZE)?;
        Ok(Self {
            offset: read_le_u64(record, 0x00)?,
            size: read_le_u64(record, 0x08)?,
            block_size_power: read_le_u32(record, 0x10)?,
        })
    }

    fn write_into(&self, region: &mut [u8], offset: usize) -> Result<(), ParseError> {
        write_le_u64(region, offset, self.offset)?;
        write_le_u64(region, offset + 0x08, self.size)?;
        write_le_u32(region, offset + 0x10, self.block_size_power)
    }

    pub fn block_size(&self) -> Result<BlockSize, ParseError> {
        BlockSize::from_power(self.block_size_power)
    }
}

/// Duplex hierarchy description: master bitmap, L1 level, data level.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DuplexHeader {
    pub version: u32,
    pub master: DuplexLayerInfo,
    pub l1: DuplexLayerInfo,
    pub data: DuplexLayerInfo,
}

impl DuplexHeader {
    pub fn parse(region: &[u8]) -> Result<Self, ParseError> {
        let region = ensure_slice(region, 0, DUPLEX_HEADER_SIZE)?;
        expect_magic(region, 0x00, DUPLEX_MAGIC)?;
        let header = Self {
            version: read_le_u32(region, 0x04)?,
            master: DuplexLayerInfo::parse(region, 0x08)?,
            l1: DuplexLayerInfo::parse(region, 0x1C)?,
            data: DuplexLayerInfo::parse(region, 0x30)?,
        };
        if header.version != DUPLEX_VERSION {
            return Err(ParseError::InvalidField {
                field: "duplex_header.version",
                reason: "unsupported version",
            });
        }
        header.l1.block_size()?;
        header.data.block_size()?;
        Ok(header)
    }

    pub fn write_into(&self, region: &mut [u8]) -> Result<(), ParseError> {
        let region = ensure_slice_mut(region, 0, DUPLEX_HEADER_SIZE)?;
        region.fill(0);
        write_le_u32(region, 0x00, DUPLEX_MAGIC)?;
        write_le_u32(region, 0x04, self.version)?;
        self.master.write_into(region, 0x08)?;
        self.l1.write_into(region, 0x1C)?;
        self.data.write_into(region, 0x30)
    }
}

// ── JournalHeader ───────────────────────────────────────────────────────────

/// Journal map geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct JournalMapHeader {
    pub version: u32,
    pub main_data_block_count: u32,
    pub journal_block_count: u32,
    pub reserved: u32,
}

/// Journal sizes. `total_size - journal_size` is the logical data length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct JournalHeader {
    pub version: u32,
    pub total_size: u64,
    pub journal_size: u64,
    pub block_size: u64,
    pub map: JournalMapHeader,
}

impl JournalHeader {
    pub fn parse(region: &[u8]) -> Result<Self, ParseError> {
        let region = ensure_slice(region, 0, JOURNAL_HEADER_SIZE)?;
        expect_magic(region, 0x00, JOURNAL_MAGIC)?;
        let header = Self {
            version: read_le_u32(region, 0x04)?,
            total_size: read_le_u64(region, 0x08)?,
            journal_size: read_le_u64(region, 0x10)?,
            block_size: read_le_u64(region, 0x18)?,
            map: JournalMapHeader {
                version: read_le_u32(region, 0x20)?,
                main_data_block_count: read_le_u32(region, 0x24)?,
                journal_block_count: read_le_u32(region, 0x28)?,
                reserved: read_le_u32(region, 0x2C)?,
            },
        };
        header.validate()?;
        Ok(header)
    }

    /// Check that the byte sizes agree with the block counts.
    pub fn validate(&self) -> Result<(), ParseError> {
        if self.version != JOURNAL_VERSION {
            return Err(ParseError::InvalidField {
                field: "journal_header.version",
                reason: "unsupported version",
            });
        }
        let block_size = self.block_size()?.as_u64();
        let main = u64::from(self.map.main_data_block_count);
        let journal = u64::from(self.map.journal_block_count);
        let consistent = self.total_size.checked_sub(self.journal_size)
            == main.checked_mul(block_size)
            && journal.checked_mul(block_size) == Some(self.journal_size);
        if !consistent {
            return Err(ParseError::InvalidField {
                field: "journal_header.total_size",
                reason: "sizes disagree with block counts",
            });
        }
        Ok(())
    }

    pub fn block_size(&self) -> Result<BlockSize, ParseError> {
        let value = u32::try_from(self.block_size).map_err(|_| ParseError::IntegerConversion {
            field: "journal_header.block_size",
        })?;
        BlockSize::new(value)
    }

    /// Physical blocks backing the journal: main data plus spare.
    #[must_use]
    pub fn physical_block_count(&self) -> u64 {
        u64::from(self.map.main_data_block_count) + u64::from(self.map.journal_block_count)
    }

    pub fn write_into(&self, region: &mut [u8]) -> Result<(), ParseError> {
        let region = ensure_slice_mut(region, 0, JOURNAL_HEADER_SIZE)?;
        write_le_u32(region, 0x00, JOURNAL_MAGIC)?;
        write_le_u32(region, 0x04, self.version)?;
        write_le_u64(region, 0x08, self.total_size)?;
        write_le_u64(region, 0x10, self.journal_size)?;
        write_le_u64(region, 0x18, self.block_size)?;
        write_le_u32(region, 0x20, self.map.version)?;
        write_le_u32(region, 0x24, self.map.main_data_block_count)?;
        write_le_u32(region, 0x28, self.map.journal_block_count)?;
        write_le_u32(region, 0x2C, self.map.reserved)
    }
}

// ── SaveHeader ──────────────────────────────────────────────────────────────

/// Allocation-table geometry and the head blocks of the two entry tables.
///
/// `table_offset` is relative to the meta storage, `data_offset` to the data
/// storage. The table holds `table_block_count` entries: the free-list anchor
/// plus one entry per data block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AllocationTableInfo {
    pub block_size: u64,
    pub table_offset: u64,
    pub table_block_count: u32,
    pub data_offset: u64,
    pub data_block_count: u32,
    pub directory_table_block: u32,
    pub file_table_block: u32,
}

/// Save filesystem header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SaveHeader {
    pub version: u32,
    pub block_count: u64,
    pub block_size: u64,
    pub fat: AllocationTableInfo,
}

impl SaveHeader {
    pub fn parse(region: &[u8]) -> Result<Self, ParseError> {
        let region = ensure_slice(region, 0, SAVE_HEADER_SIZE)?;
        expect_magic(region, 0x00, SAVE_MAGIC)?;
        let header = Self {
            version: read_le_u32(region, 0x04)?,
            block_count: read_le_u64(region, 0x08)?,
            block_size: read_le_u64(region, 0x10)?,
            fat: AllocationTableInfo {
                block_size: read_le_u64(region, 0x18)?,
                table_offset: read_le_u64(region, 0x20)?,
                table_block_count: read_le_u32(region, 0x28)?,
                data_offset: read_le_u64(region, 0x30)?,
                data_block_count: read_le_u32(region, 0x38)?,
                directory_table_block: read_le_u32(region, 0x40)?,
                file_table_block: read_le_u32(region, 0x44)?,
            },
        };
        if header.version != SAVE_VERSION {
            return Err(ParseError::InvalidField {
                field: "save_header.version",
                reason: "unsupported version",
            });
        }
        if header.block_size != header.fat.block_size {
            return Err(ParseError::InvalidField {
                field: "save_header.block_size",
                reason: "disagrees with allocation table block size",
            });
        }
        if u64::from(header.fat.table_block_count) != u64::from(header.fat.data_block_count) + 1 {
            return Err(ParseError::InvalidField {
                field: "save_header.fat.table_block_count",
                reason: "must be data_block_count + 1",
            });
        }
        header.block_size_checked()?;
        Ok(header)
    }

    pub fn block_size_checked(&self) -> Result<BlockSize, ParseError> {
        let value = u32::try_from(self.block_size).map_err(|_| ParseError::IntegerConversion {
            field: "save_header.block_size",
        })?;
        BlockSize::new(value)
    }

    pub fn write_into(&self, region: &mut [u8]) -> Result<(), ParseError> {
        let region = ensure_slice_mut(region, 0, SAVE_HEADER_SIZE)?;
        region.fill(0);
        write_le_u32(region, 0x00, SAVE_MAGIC)?;
        write_le_u32(region, 0x04, self.version)?;
        write_le_u64(region, 0x08, self.block_count)?;
        write_le_u64(region, 0x10, self.block_size)?;
        write_le_u64(region, 0x18, self.fat.block_size)?;
        write_le_u64(region, 0x20, self.fat.table_offset)?;
        write_le_u32(region, 0x28, self.fat.table_block_count)?;
        write_le_u64(region, 0x30, self.fat.data_offset)?;
        write_le_u32(region, 0x38, self.fat.data_block_count)?;
        write_le_u32(region, 0x40, self.fat.directory_table_block)?;
        write_le_u32(region, 0x44, self.fat.file_table_block)
    }
}

// ── RemapHeader ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RemapHeader {
    pub version: u32,
    pub map_entry_count: u32,
    pub map_segment_count: u32,
    pub segment_bits: u32,
}

impl RemapHeader {
    pub fn parse(region: &[u8]) -> Result<Self, ParseError> {
        let region = ensure_slice(region, 0, REMAP_HEADER_SIZE)?;
        expect_magic(region, 0x00, REMAP_MAGIC)?;
        let header = Self {
            version: read_le_u32(region, 0x04)?,
            map_entry_count: read_le_u32(region, 0x08)?,
            map_segment_count: read_le_u32(region, 0x0C)?,
            segment_bits: read_le_u32(region, 0x10)?,
        };
        if header.version != REMAP_VERSION {
            return Err(ParseError::InvalidField {
                field: "remap_header.version",
                reason: "unsupported version",
            });
        }
        Ok(header)
    }

    pub fn write_into(&self, region: &mut [u8]) -> Result<(), ParseError> {
        let region = ensure_slice_mut(region, 0, REMAP_HEADER_SIZE)?;
        region.fill(0);
        write_le_u32(region, 0x00, REMAP_MAGIC)?;
        write_le_u32(region, 0x04, self.version)?;
        write_le_u32(region, 0x08, self.map_entry_count)?;
        write_le_u32(region, 0x0C, self.map_segment_count)?;
        write_le_u32(region, 0x10, self.segment_bits)
    }
}

// ── ContainerHeader ─────────────────────────────────────────────────────────

/// The complete fixed header of a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerHeader {
    pub cmac: [u8; CMAC_SIZE],
    pub layout: FsLayout,
    pub duplex: DuplexHeader,
    pub journal: JournalHeader,
    pub save: SaveHeader,
    pub file_remap: RemapHeader,
    pub meta_remap: RemapHeader,
}

impl ContainerHeader {
    /// Parse the header from the first `HEADER_SIZE` bytes of a container.
    pub fn parse(image: &[u8]) -> Result<Self, ParseError> {
        let image = ensure_slice(image, 0, HEADER_SIZE)?;
        Ok(Self {
            cmac: read_fixed::<CMAC_SIZE>(image, CMAC_OFFSET)?,
            layout: FsLayout::parse(&image[LAYOUT_OFFSET..])?,
            duplex: DuplexHeader::parse(&image[DUPLEX_HEADER_OFFSET..])?,
            journal: JournalHeader::parse(&image[JOURNAL_HEADER_OFFSET..])?,
            save: SaveHeader::parse(&image[SAVE_HEADER_OFFSET..])?,
            file_remap: RemapHeader::parse(&image[FILE_REMAP_HEADER_OFFSET..])?,
            meta_remap: RemapHeader::parse(&image[META_REMAP_HEADER_OFFSET..])?,
        })
    }

    /// Overwrite the header records inside `image`, leaving gaps untouched.
    pub fn write_into(&self, image: &mut [u8]) -> Result<(), ParseError> {
        let image = ensure_slice_mut(image, 0, HEADER_SIZE)?;
        write_bytes(image, CMAC_OFFSET, &self.cmac)?;
        self.layout.write_into(&mut image[LAYOUT_OFFSET..])?;
        self.duplex.write_into(&mut image[DUPLEX_HEADER_OFFSET..])?;
        self.journal.write_into(&mut image[JOURNAL_HEADER_OFFSET..])?;
        self.save.write_into(&mut image[SAVE_HEADER_OFFSET..])?;
        self.file_remap
            .write_into(&mut image[FILE_REMAP_HEADER_OFFSET..])?;
        self.meta_remap
            .write_into(&mut image[META_REMAP_HEADER_OFFSET..])
    }

    /// Serialize into a fresh zeroed header block.
    pub fn to_bytes(&self) -> Result<Vec<u8>, ParseError> {
        let mut out = vec![0_u8; HEADER_SIZE];
        self.write_into(&mut out)?;
        Ok(out)
    }
}
