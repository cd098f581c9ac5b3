//! Fresh container creation.
//!
//! Container layout produced by [`format_container`]:
//!
//! ```text
//! 0x0000            header (0x4000)
//! 0x4000            file map entries, meta map entries
//!                   duplex master bitmap A, B
//! file_map_data     [journal lower half][L1 A][L1 B][meta A][meta B][journal upper half]
//! ```
//!
//! The meta remap exposes `[L1 A][L1 B][meta A][meta B]` contiguously; the
//! file remap exposes the journal's physical blocks. The duplexed meta
//! storage holds the journal map table, the three journal bitmaps and the
//! allocation table.

use crate::stack::StorageStack;
use crate::{SaveContainerFileSystem, Shared, free_block_bitmap};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sfs_alloc::{AllocationTable, AllocationTableStorage, table_size};
use sfs_dir::{HierarchicalFileTable, TableGeometry, TableHeader};
use sfs_error::{Result, SaveError};
use sfs_journal::{JournalMap, JournalMapLayout, JournalStorage};
use sfs_ondisk::{
    AllocationTableInfo, ContainerHeader, DuplexHeader, DuplexLayerInfo, FsLayout, JournalHeader,
    JournalMapHeader, MapEntry, RemapHeader, SaveHeader, format_error, map_entries_to_bytes,
};
use sfs_storage::{SharedStorage, Storage, SubStorage, zero_fill};
use sfs_types::{
    BlockSize, DUPLEX_VERSION, END_OF_CHAIN, HEADER_SIZE, JOURNAL_VERSION, LAYOUT_VERSION,
    MAP_ENTRY_SIZE, REMAP_VERSION, SAVE_VERSION, align_up, bitmap_len,
};
use std::sync::Arc;
use tracing::info;

/// Geometry of a new container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormatOptions {
    /// Allocation and journal block size.
    pub block_size: u32,
    /// Blocks available to files and the two entry tables.
    pub data_block_count: u32,
    /// Spare physical blocks for copy-on-write. Bounds how many distinct
    /// blocks one commit can rewrite.
    pub journal_block_count: u32,
    /// Block size of both duplex levels.
    pub duplex_block_size: u32,
    pub tables: TableGeometry,
}

impl Default for FormatOptions {
    fn default() -> Self {
        Self {
            block_size: 0x4000,
            data_block_count: 64,
            journal_block_count: 16,
            duplex_block_size: 0x400,
            tables: TableGeometry::default(),
        }
    }
}

impl FormatOptions {
    /// Bytes a container with this geometry occupies.
    pub fn container_size(&self) -> Result<u64> {
        Ok(ContainerPlan::new(self)?.total_size)
    }
}

fn align(value: u64, alignment: u64) -> Result<u64> {
    align_up(value, alignment)
        .ok_or_else(|| SaveError::Format(format!("{value:#x} overflows when aligned")))
}

fn count_segments(entries: &[MapEntry]) -> u32 {
    let mut segments = 0_u32;
    let mut previous_end = None;
    for entry in entries {
        if previous_end != Some(entry.virtual_offset) {
            segments += 1;
        }
        previous_end = entry.virtual_end();
    }
    segments
}

/// Every offset of a container about to be written.
struct ContainerPlan {
    header: ContainerHeader,
    file_entries: Vec<MapEntry>,
    meta_entries: Vec<MapEntry>,
    total_size: u64,
}

impl ContainerPlan {
    #[allow(clippy::too_many_lines)]
    fn new(options: &FormatOptions) -> Result<Self> {
        let block_size = BlockSize::new(options.block_size).map_err(format_error)?;
        let duplex_block = BlockSize::new(options.duplex_block_size).map_err(format_error)?;
        if options.data_block_count == 0 || options.journal_block_count == 0 {
            return Err(SaveError::Format(
                "data and journal block counts must be non-zero".to_owned(),
            ));
        }
        let bs = block_size.as_u64();
        let dbs = duplex_block.as_u64();
        let main = options.data_block_count;
        let spare = options.journal_block_count;
        let physical_blocks = u64::from(main) + u64::from(spare);
        let journal_bytes = physical_blocks * bs;

        // Meta storage contents.
        let map_table_size = sfs_journal::table_size(main);
        let (physical_bitmap, virtual_bitmap, free_bitmap) = JournalMap::bitmap_sizes(main, spare);
        let physical_bitmap_offset = align(map_table_size, 8)?;
        let virtual_bitmap_offset = align(physical_bitmap_offset + physical_bitmap, 8)?;
        let free_bitmap_offset = align(virtual_bitmap_offset + virtual_bitmap, 8)?;
        let fat_offset = align(free_bitmap_offset + free_bitmap, 8)?;
        let fat_size = table_size(main);
        let duplex_data_size = align(fat_offset + fat_size, dbs)?;
        let duplex_l1_size = align(bitmap_len(duplex_data_size / dbs), dbs)?;
        let duplex_master_size = bitmap_len(duplex_l1_size / dbs);

        // Meta remap virtual space.
        let l1_a = 0;
        let l1_b = duplex_l1_size;
        let data_a = 2 * duplex_l1_size;
        let data_b = data_a + duplex_data_size;
        let meta_virtual = data_b + duplex_data_size;

        // Physical placement inside the remap data region.
        let lower = (physical_blocks / 2) * bs;
        let upper = journal_bytes - lower;
        let meta_physical = lower;
        let mut file_entries = Vec::with_capacity(2);
        if lower > 0 {
            file_entries.push(MapEntry {
                virtual_offset: 0,
                physical_offset: 0,
                size: lower,
                alignment: options.block_size,
                storage_type: 0,
            });
        }
        file_entries.push(MapEntry {
            virtual_offset: lower,
            physical_offset: meta_physical + meta_virtual,
            size: upper,
            alignment: options.block_size,
            storage_type: 0,
        });
        let meta_entries: Vec<MapEntry> = [
            (l1_a, duplex_l1_size),
            (l1_b, duplex_l1_size),
            (data_a, duplex_data_size),
            (data_b, duplex_data_size),
        ]
        .into_iter()
        .map(|(virtual_offset, size)| MapEntry {
            virtual_offset,
            physical_offset: meta_physical + virtual_offset,
            size,
            alignment: options.duplex_block_size,
            storage_type: 0,
        })
        .collect();

        // Container-absolute regions.
        let file_map_entry_offset = HEADER_SIZE as u64;
        let file_map_entry_size = (file_entries.len() * MAP_ENTRY_SIZE) as u64;
        let meta_map_entry_offset = file_map_entry_offset + file_map_entry_size;
        let meta_map_entry_size = (meta_entries.len() * MAP_ENTRY_SIZE) as u64;
        let master_a = align(meta_map_entry_offset + meta_map_entry_size, 0x10)?;
        let master_b = align(master_a + duplex_master_size, 0x10)?;
        let file_map_data_offset = align(master_b + duplex_master_size, HEADER_SIZE as u64)?;
        let file_map_data_size = journal_bytes + meta_virtual;

        let layout = FsLayout {
            version: LAYOUT_VERSION,
            file_map_entry_offset,
            file_map_entry_size,
            meta_map_entry_offset,
            meta_map_entry_size,
            file_map_data_offset,
            file_map_data_size,
            duplex_l1_offset_a: l1_a,
            duplex_l1_offset_b: l1_b,
            duplex_l1_size,
            duplex_data_offset_a: data_a,
            duplex_data_offset_b: data_b,
            duplex_data_size,
            journal_data_offset: 0,
            journal_data_size_a: journal_bytes,
            journal_data_size_b: 0,
            journal_size: u64::from(spare) * bs,
            duplex_master_offset_a: master_a,
            duplex_master_offset_b: master_b,
            duplex_master_size,
            journal_map_table_offset: 0,
            journal_map_table_size: map_table_size,
            journal_physical_bitmap_offset: physical_bitmap_offset,
            journal_physical_bitmap_size: physical_bitmap,
            journal_virtual_bitmap_offset: virtual_bitmap_offset,
            journal_virtual_bitmap_size: virtual_bitmap,
            journal_free_bitmap_offset: free_bitmap_offset,
            journal_free_bitmap_size: free_bitmap,
            fat_offset,
            fat_size,
            duplex_index: 0,
            ..FsLayout::default()
        };
        let duplex = DuplexHeader {
            version: DUPLEX_VERSION,
            master: DuplexLayerInfo {
                offset: master_a,
                size: duplex_master_size,
                block_size_power: 0,
            },
            l1: DuplexLayerInfo {
                offset: l1_a,
                size: duplex_l1_size,
                block_size_power: duplex_block.shift(),
            },
            data: DuplexLayerInfo {
                offset: data_a,
                size: duplex_data_size,
                block_size_power: duplex_block.shift(),
            },
        };
        let journal = JournalHeader {
            version: JOURNAL_VERSION,
            total_size: journal_bytes,
            journal_size: u64::from(spare) * bs,
            block_size: bs,
            map: JournalMapHeader {
                version: JOURNAL_VERSION,
                main_data_block_count: main,
                journal_block_count: spare,
                reserved: 0,
            },
        };
        let save = SaveHeader {
            version: SAVE_VERSION,
            block_count: u64::from(main),
            block_size: bs,
            fat: AllocationTableInfo {
                block_size: bs,
                table_offset: fat_offset,
                table_block_count: main + 1,
                data_offset: 0,
                data_block_count: main,
                directory_table_block: END_OF_CHAIN,
                file_table_block: END_OF_CHAIN,
            },
        };
        let remap_header = |entries: &[MapEntry]| RemapHeader {
            version: REMAP_VERSION,
            map_entry_count: u32::try_from(entries.len()).unwrap_or(u32::MAX),
            map_segment_count: count_segments(entries),
            segment_bits: 0,
        };
        let header = ContainerHeader {
            cmac: [0_u8; 0x10],
            file_remap: remap_header(&file_entries),
            meta_remap: remap_header(&meta_entries),
            layout,
            duplex,
            journal,
            save,
        };
        Ok(Self {
            header,
            file_entries,
            meta_entries,
            total_size: file_map_data_offset + file_map_data_size,
        })
    }
}

/// Write a new, empty container into `base` and return it mounted.
///
/// `base` grows to the required size when it supports resizing. The result
/// has already been committed once, so it is valid on disk on return.
pub fn format_container(
    base: SharedStorage,
    options: &FormatOptions,
) -> Result<SaveContainerFileSystem> {
    let plan = ContainerPlan::new(options)?;
    if base.size() < plan.total_size {
        base.set_size(plan.total_size)?;
    }
    zero_fill(&*base, 0, plan.total_size)?;
    base.write_at(0, &plan.header.to_bytes().map_err(format_error)?)?;
    base.write_at(
        plan.header.layout.file_map_entry_offset,
        &map_entries_to_bytes(&plan.file_entries),
    )?;
    base.write_at(
        plan.header.layout.meta_map_entry_offset,
        &map_entries_to_bytes(&plan.meta_entries),
    )?;

    let header = plan.header;
    let stack = StorageStack::assemble(&base, &header, true)?;
    let block_size = BlockSize::new(options.block_size).map_err(format_error)?;
    let meta: SharedStorage = Arc::clone(&stack.duplex) as SharedStorage;
    let journal = Arc::new(JournalStorage::format(
        Arc::clone(&stack.journal_base),
        Arc::clone(&meta),
        JournalMapLayout::from_layout(&header.layout),
        block_size,
        options.data_block_count,
        options.journal_block_count,
    )?);
    let fat = Arc::new(AllocationTable::format(
        Arc::new(SubStorage::new(
            Arc::clone(&meta),
            header.layout.fat_offset,
            header.layout.fat_size,
        )?),
        options.data_block_count,
    )?);
    let data: SharedStorage = Arc::new(SubStorage::new(
        Arc::clone(&journal) as SharedStorage,
        header.save.fat.data_offset,
        u64::from(options.data_block_count) * block_size.as_u64(),
    )?);

    let table_chain = |buckets: u32, capacity: u32| -> Result<Arc<AllocationTableStorage>> {
        let length = align(
            TableHeader::required_size(buckets, capacity.max(1)),
            block_size.as_u64(),
        )?;
        Ok(Arc::new(AllocationTableStorage::create(
            Arc::clone(&fat),
            Arc::clone(&data),
            block_size,
            length,
        )?))
    };
    let geometry = &options.tables;
    let directory_storage = table_chain(geometry.directory_buckets, geometry.directory_capacity)?;
    let file_storage = table_chain(geometry.file_buckets, geometry.file_capacity)?;
    let tables = HierarchicalFileTable::format(
        Arc::clone(&directory_storage) as SharedStorage,
        Arc::clone(&file_storage) as SharedStorage,
        geometry,
    )?;

    info!(
        block_size = options.block_size,
        data_blocks = options.data_block_count,
        journal_blocks = options.journal_block_count,
        container_size = plan.total_size,
        "container_format"
    );
    let committed_free = free_block_bitmap(&fat)?;
    let data_offset = header.save.fat.data_offset;
    let fs = SaveContainerFileSystem {
        shared: Arc::new(Shared {
            base,
            header: Mutex::new(header),
            stack,
            journal,
            data,
            fat,
            directory_storage,
            file_storage,
            committed_free: Mutex::new(committed_free),
            tables,
            block_size,
            data_offset,
            read_only: false,
        }),
    };
    fs.commit()?;
    Ok(fs)
}
