//! Storage stack assembly: container → remaps → duplex / journal base.

use sfs_alloc::table_size;
use sfs_duplex::{DuplexLevel, HierarchicalDuplexStorage};
use sfs_error::{Result, SaveError};
use sfs_ondisk::{ContainerHeader, format_error};
use sfs_remap::RemapStorage;
use sfs_storage::{SharedStorage, Storage, SubStorage};
use sfs_types::{MAP_ENTRY_SIZE, u64_to_usize};
use std::sync::Arc;
use tracing::debug;

/// The layers beneath the journal and the allocation table.
pub(crate) struct StorageStack {
    pub(crate) file_remap: Arc<RemapStorage>,
    pub(crate) meta_remap: Arc<RemapStorage>,
    /// Exposed duplex layer, i.e. the metadata storage.
    pub(crate) duplex: Arc<HierarchicalDuplexStorage>,
    /// Physical journal space inside the file remap.
    pub(crate) journal_base: SharedStorage,
}

fn check_region(name: &str, offset: u64, size: u64, limit: u64) -> Result<()> {
    match offset.checked_add(size) {
        Some(end) if end <= limit => Ok(()),
        _ => Err(SaveError::Format(format!(
            "{name} [{offset:#x}, +{size:#x}) exceeds {limit:#x}"
        ))),
    }
}

/// Cross-check the header records against each other and the container size.
pub(crate) fn validate_geometry(header: &ContainerHeader, container_size: u64) -> Result<()> {
    let layout = &header.layout;
    check_region(
        "file map table",
        layout.file_map_entry_offset,
        layout.file_map_entry_size,
        container_size,
    )?;
    check_region(
        "meta map table",
        layout.meta_map_entry_offset,
        layout.meta_map_entry_size,
        container_size,
    )?;
    check_region(
        "remap data",
        layout.file_map_data_offset,
        layout.file_map_data_size,
        container_size,
    )?;
    for index in 0..2 {
        check_region(
            "duplex master bitmap",
            layout.master_offset(index),
            layout.duplex_master_size,
            container_size,
        )?;
    }
    let entry_bytes = |count: u32| u64::from(count) * MAP_ENTRY_SIZE as u64;
    if entry_bytes(header.file_remap.map_entry_count) > layout.file_map_entry_size
        || entry_bytes(header.meta_remap.map_entry_count) > layout.meta_map_entry_size
    {
        return Err(SaveError::Format("remap entry count exceeds its table".to_owned()));
    }
    if header.duplex.l1.size != layout.duplex_l1_size
        || header.duplex.data.size != layout.duplex_data_size
    {
        return Err(SaveError::Format(
            "duplex header sizes disagree with the layout".to_owned(),
        ));
    }

    let fat = &header.save.fat;
    if fat.table_offset != layout.fat_offset {
        return Err(SaveError::Format(format!(
            "allocation table at {:#x}, layout says {:#x}",
            fat.table_offset, layout.fat_offset
        )));
    }
    check_region(
        "allocation table",
        fat.table_offset,
        table_size(fat.data_block_count),
        layout.duplex_data_size,
    )?;
    let journal_block = header.journal.block_size().map_err(format_error)?.as_u64();
    let logical = u64::from(header.journal.map.main_data_block_count) * journal_block;
    check_region(
        "allocation data",
        fat.data_offset,
        u64::from(fat.data_block_count) * fat.block_size,
        logical,
    )
}

fn read_region(base: &dyn Storage, offset: u64, size: u64) -> Result<Vec<u8>> {
    let len = u64_to_usize(size, "layout.region").map_err(format_error)?;
    let mut bytes = vec![0_u8; len];
    base.read_at(offset, &mut bytes)?;
    Ok(bytes)
}

impl StorageStack {
    pub(crate) fn assemble(
        base: &SharedStorage,
        header: &ContainerHeader,
        writable: bool,
    ) -> Result<Self> {
        validate_geometry(header, base.size())?;
        let layout = &header.layout;

        let region: SharedStorage = Arc::new(SubStorage::new(
            Arc::clone(base),
            layout.file_map_data_offset,
            layout.file_map_data_size,
        )?);
        let file_table = read_region(&**base, layout.file_map_entry_offset, layout.file_map_entry_size)?;
        let file_remap = Arc::new(RemapStorage::from_table(
            &header.file_remap,
            &file_table,
            vec![Arc::clone(&region)],
            writable,
        )?);
        let meta_table = read_region(&**base, layout.meta_map_entry_offset, layout.meta_map_entry_size)?;
        let meta_remap = Arc::new(RemapStorage::from_table(
            &header.meta_remap,
            &meta_table,
            vec![region],
            writable,
        )?);

        let meta_base: SharedStorage = Arc::clone(&meta_remap) as SharedStorage;
        let window = |offset: u64, size: u64| -> Result<SharedStorage> {
            Ok(Arc::new(SubStorage::new(Arc::clone(&meta_base), offset, size)?))
        };
        let levels = vec![
            DuplexLevel {
                data_a: window(layout.duplex_l1_offset_a, layout.duplex_l1_size)?,
                data_b: window(layout.duplex_l1_offset_b, layout.duplex_l1_size)?,
                block_size: header.duplex.l1.block_size().map_err(format_error)?,
            },
            DuplexLevel {
                data_a: window(layout.duplex_data_offset_a, layout.duplex_data_size)?,
                data_b: window(layout.duplex_data_offset_b, layout.duplex_data_size)?,
                block_size: header.duplex.data.block_size().map_err(format_error)?,
            },
        ];
        let master = |index: u8| -> Result<SharedStorage> {
            Ok(Arc::new(SubStorage::new(
                Arc::clone(base),
                layout.master_offset(index),
                layout.duplex_master_size,
            )?))
        };
        let duplex = Arc::new(HierarchicalDuplexStorage::new(
            [master(0)?, master(1)?],
            layout.duplex_index,
            levels,
        )?);

        let journal_base: SharedStorage = Arc::new(SubStorage::new(
            Arc::clone(&file_remap) as SharedStorage,
            layout.journal_data_offset,
            header.journal.total_size,
        )?);
        debug!(
            file_entries = file_remap.entries().len(),
            meta_entries = meta_remap.entries().len(),
            duplex_index = layout.duplex_index,
            writable,
            "storage_stack_assembled"
        );
        Ok(Self {
            file_remap,
            meta_remap,
            duplex,
            journal_base,
        })
    }
}
