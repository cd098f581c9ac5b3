#![forbid(unsafe_code)]
//! Save-data container filesystem.
//!
//! [`SaveContainerFileSystem`] mounts a container image and exposes a
//! hierarchical file system over it. Storage is layered bottom-up:
//!
//! ```text
//! base storage (host file or memory)
//! ├── file remap ── journal physical blocks ── JournalStorage ── data
//! └── meta remap ── HierarchicalDuplexStorage (meta)
//!                   ├── journal map table and bitmaps
//!                   └── allocation table
//! data ── AllocationTableStorage chains ── directory table, file table, files
//! ```
//!
//! Every mutation lands in uncommitted space: redirected journal blocks and
//! the inactive duplex copies. [`SaveContainerFileSystem::commit`] makes it
//! durable by flipping the duplex master index in the header; a container
//! dropped without committing reopens in its last committed state.

mod extract;
mod file;
mod format;
mod stack;

pub use extract::{ExtractSummary, extract_to_dir};
pub use file::{OpenMode, SaveDirectory, SaveFile};
pub use format::{FormatOptions, format_container};
pub use sfs_alloc::{AllocationTable, AllocationTableStorage};
pub use sfs_dir::{
    DirectoryEntry, EntryType, EnumerateMode, FileInfo, HierarchicalFileTable, ROOT_DIRECTORY,
    TableGeometry, TableStats,
};
pub use sfs_duplex::HierarchicalDuplexStorage;
pub use sfs_error::{ErrorClass, Result, SaveError};
pub use sfs_journal::JournalStorage;
pub use sfs_ondisk::{ContainerHeader, FsLayout, MapEntry};
pub use sfs_remap::RemapStorage;
pub use sfs_storage::{FileStorage, MemoryStorage, SharedStorage, Storage};

use crate::stack::StorageStack;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sfs_alloc::table_size;
use sfs_dir::path;
use sfs_journal::JournalMapLayout;
use sfs_ondisk::format_error;
use sfs_storage::{ReadOnlyStorage, SubStorage};
use sfs_types::{
    BlockSize, END_OF_CHAIN, HEADER_SIZE, bitmap_get, bitmap_len, bitmap_set, u64_to_usize,
};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Options controlling how a container is mounted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MountOptions {
    /// Reject every mutation with `ReadOnly` and never write the base.
    pub read_only: bool,
}

/// Result of [`SaveContainerFileSystem::verify`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct VerifyReport {
    /// Directories, the root included.
    pub directories: u32,
    pub files: u32,
    pub used_blocks: u32,
    pub free_blocks: u32,
}

/// State shared by the filesystem and its open file handles.
pub(crate) struct Shared {
    pub(crate) base: SharedStorage,
    /// Last written header. Its lock serializes every container operation.
    pub(crate) header: Mutex<ContainerHeader>,
    pub(crate) stack: StorageStack,
    pub(crate) journal: Arc<JournalStorage>,
    pub(crate) data: SharedStorage,
    pub(crate) fat: Arc<AllocationTable>,
    pub(crate) directory_storage: Arc<AllocationTableStorage>,
    pub(crate) file_storage: Arc<AllocationTableStorage>,
    pub(crate) tables: HierarchicalFileTable,
    pub(crate) block_size: BlockSize,
    /// Offset of allocation block 0 in the journal's logical space.
    pub(crate) data_offset: u64,
    /// Allocation blocks free at the last commit or mount, one bit each.
    pub(crate) committed_free: Mutex<Vec<u8>>,
    pub(crate) read_only: bool,
}

/// Bitmap of the blocks currently on the free list.
pub(crate) fn free_block_bitmap(fat: &AllocationTable) -> Result<Vec<u8>> {
    let len = u64_to_usize(bitmap_len(u64::from(fat.block_count())), "fat.free_bitmap")
        .map_err(format_error)?;
    let mut bitmap = vec![0_u8; len];
    for block in fat.free_blocks()? {
        bitmap_set(&mut bitmap, u64::from(block));
    }
    Ok(bitmap)
}

impl Shared {
    /// Prepare for the allocator to hand out its next `count` blocks.
    ///
    /// Blocks the last commit had free hold nothing the committed state can
    /// reach, so the journal may write them in place. Only blocks freed
    /// since then still need a redirect. Caller holds the container lock.
    pub(crate) fn claim_fresh_blocks(&self, count: u64) -> Result<()> {
        if count == 0 {
            return Ok(());
        }
        let committed_free = self.committed_free.lock();
        let take = usize::try_from(count).unwrap_or(usize::MAX);
        let block_bytes = self.block_size.as_u64();
        for block in self.fat.free_blocks()?.into_iter().take(take) {
            if bitmap_get(&committed_free, u64::from(block)) {
                self.journal.claim_unreferenced(
                    self.data_offset + u64::from(block) * block_bytes,
                    block_bytes,
                )?;
            }
        }
        Ok(())
    }
}

/// A mounted container.
///
/// Cloning shares the same mount.
///
/// ```ignore
/// let fs = SaveContainerFileSystem::open("save.bin")?;
/// for entry in fs.open_directory("/", EnumerateMode::All)? {
///     println!("{} {:?} {}", entry.name, entry.kind, entry.size);
/// }
/// ```
#[derive(Clone)]
pub struct SaveContainerFileSystem {
    pub(crate) shared: Arc<Shared>,
}

impl std::fmt::Debug for SaveContainerFileSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SaveContainerFileSystem")
            .field("block_size", &self.shared.block_size)
            .field("block_count", &self.shared.fat.block_count())
            .field("read_only", &self.shared.read_only)
            .finish_non_exhaustive()
    }
}

// ── Mount ───────────────────────────────────────────────────────────────────

impl SaveContainerFileSystem {
    /// Open the container at `path` read-write.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_options(path, &MountOptions::default())
    }

    pub fn open_with_options(path: impl AsRef<Path>, options: &MountOptions) -> Result<Self> {
        let storage = if options.read_only {
            FileStorage::open_read_only(path.as_ref())?
        } else {
            FileStorage::open(path.as_ref())?
        };
        if !options.read_only && !storage.is_writable() {
            return Err(SaveError::ReadOnly);
        }
        Self::from_storage(Arc::new(storage), options)
    }

    /// Create a host file at `path` and format a new container in it.
    pub fn create(path: impl AsRef<Path>, options: &FormatOptions) -> Result<Self> {
        let storage = FileStorage::create(path.as_ref(), options.container_size()?)?;
        format_container(Arc::new(storage), options)
    }

    /// Mount the container held by `base`.
    pub fn from_storage(base: SharedStorage, options: &MountOptions) -> Result<Self> {
        if base.size() < HEADER_SIZE as u64 {
            return Err(SaveError::Format(format!(
                "{:#x} bytes cannot hold a container header",
                base.size()
            )));
        }
        let mut image = vec![0_u8; HEADER_SIZE];
        base.read_at(0, &mut image)?;
        let header = ContainerHeader::parse(&image).map_err(format_error)?;
        let fat_info = header.save.fat;
        let block_size = header.save.block_size_checked().map_err(format_error)?;
        if fat_info.block_size != block_size.as_u64() {
            return Err(SaveError::Format(format!(
                "allocation table block size {:#x} differs from save block size {:#x}",
                fat_info.block_size,
                block_size.as_u64()
            )));
        }

        let base: SharedStorage = if options.read_only {
            Arc::new(ReadOnlyStorage::new(base))
        } else {
            base
        };
        let stack = StorageStack::assemble(&base, &header, !options.read_only)?;
        let meta: SharedStorage = Arc::clone(&stack.duplex) as SharedStorage;
        let journal = Arc::new(JournalStorage::open(
            Arc::clone(&stack.journal_base),
            Arc::clone(&meta),
            JournalMapLayout::from_layout(&header.layout),
            header.journal.block_size().map_err(format_error)?,
            header.journal.map.main_data_block_count,
            header.journal.map.journal_block_count,
        )?);
        let fat = Arc::new(AllocationTable::open(
            Arc::new(SubStorage::new(
                meta,
                fat_info.table_offset,
                table_size(fat_info.data_block_count),
            )?),
            fat_info.data_block_count,
        )?);
        let data: SharedStorage = Arc::new(SubStorage::new(
            Arc::clone(&journal) as SharedStorage,
            fat_info.data_offset,
            u64::from(fat_info.data_block_count) * block_size.as_u64(),
        )?);

        let open_chain = |head: u32| -> Result<Arc<AllocationTableStorage>> {
            let blocks = u64::from(fat.chain_length(head)?);
            Ok(Arc::new(AllocationTableStorage::open(
                Arc::clone(&fat),
                Arc::clone(&data),
                block_size,
                head,
                blocks * block_size.as_u64(),
            )?))
        };
        let directory_storage = open_chain(fat_info.directory_table_block)?;
        let file_storage = open_chain(fat_info.file_table_block)?;
        let tables = HierarchicalFileTable::open(
            Arc::clone(&directory_storage) as SharedStorage,
            Arc::clone(&file_storage) as SharedStorage,
        )?;
        let committed_free = free_block_bitmap(&fat)?;

        info!(
            block_size = block_size.get(),
            block_count = fat_info.data_block_count,
            duplex_index = header.layout.duplex_index,
            read_only = options.read_only,
            "container_mount"
        );
        Ok(Self {
            shared: Arc::new(Shared {
                base,
                header: Mutex::new(header),
                stack,
                journal,
                data,
                fat,
                directory_storage,
                file_storage,
                tables,
                block_size,
                data_offset: fat_info.data_offset,
                committed_free: Mutex::new(committed_free),
                read_only: options.read_only,
            }),
        })
    }
}

// ── Accessors ───────────────────────────────────────────────────────────────

impl SaveContainerFileSystem {
    /// The container image as mounted (read-only wrapped when applicable).
    #[must_use]
    pub fn base_storage(&self) -> &SharedStorage {
        &self.shared.base
    }

    /// Duplexed metadata storage.
    #[must_use]
    pub fn meta_storage(&self) -> &Arc<HierarchicalDuplexStorage> {
        &self.shared.stack.duplex
    }

    #[must_use]
    pub fn file_remap(&self) -> &Arc<RemapStorage> {
        &self.shared.stack.file_remap
    }

    #[must_use]
    pub fn meta_remap(&self) -> &Arc<RemapStorage> {
        &self.shared.stack.meta_remap
    }

    #[must_use]
    pub fn journal(&self) -> &Arc<JournalStorage> {
        &self.shared.journal
    }

    /// Journaled storage the allocation table hands out blocks from.
    #[must_use]
    pub fn data_storage(&self) -> &SharedStorage {
        &self.shared.data
    }

    #[must_use]
    pub fn allocation_table(&self) -> &Arc<AllocationTable> {
        &self.shared.fat
    }

    #[must_use]
    pub fn file_table(&self) -> &HierarchicalFileTable {
        &self.shared.tables
    }

    /// Header as of the last commit or mount.
    #[must_use]
    pub fn header(&self) -> ContainerHeader {
        self.shared.header.lock().clone()
    }

    #[must_use]
    pub fn layout(&self) -> FsLayout {
        self.shared.header.lock().layout.clone()
    }

    #[must_use]
    pub fn block_size(&self) -> u32 {
        self.shared.block_size.get()
    }

    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.shared.read_only
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.shared.read_only {
            Err(SaveError::ReadOnly)
        } else {
            Ok(())
        }
    }
}

// ── Files and directories ───────────────────────────────────────────────────

impl SaveContainerFileSystem {
    /// Create a zero-filled file of `size` bytes.
    pub fn create_file(&self, path: &str, size: u64) -> Result<()> {
        self.ensure_writable()?;
        let _guard = self.shared.header.lock();
        let shared = &*self.shared;
        match shared.tables.entry_type(path) {
            Ok(_) => return Err(SaveError::AlreadyExists(path.to_owned())),
            Err(SaveError::PathNotFound(_)) => {}
            Err(err) => return Err(err),
        }
        shared.claim_fresh_blocks(shared.block_size.blocks_for(size))?;
        let chain = AllocationTableStorage::create(
            Arc::clone(&shared.fat),
            Arc::clone(&shared.data),
            shared.block_size,
            size,
        )?;
        let info = FileInfo {
            start_block: chain.head(),
            length: size,
        };
        if let Err(err) = shared.tables.add_file(path, info) {
            if info.start_block != END_OF_CHAIN {
                shared.fat.free(info.start_block)?;
            }
            return Err(err);
        }
        debug!(path, size, start_block = info.start_block, "file_create");
        Ok(())
    }

    pub fn create_directory(&self, path: &str) -> Result<()> {
        self.ensure_writable()?;
        let _guard = self.shared.header.lock();
        self.shared.tables.add_directory(path)?;
        Ok(())
    }

    /// Remove a file and return its blocks to the free list.
    pub fn delete_file(&self, path: &str) -> Result<()> {
        self.ensure_writable()?;
        let _guard = self.shared.header.lock();
        self.delete_file_locked(path)
    }

    fn delete_file_locked(&self, path: &str) -> Result<()> {
        let info = self.shared.tables.delete_file(path)?;
        if info.start_block != END_OF_CHAIN {
            self.shared.fat.free(info.start_block)?;
        }
        Ok(())
    }

    /// Remove an empty directory.
    pub fn delete_directory(&self, path: &str) -> Result<()> {
        self.ensure_writable()?;
        let _guard = self.shared.header.lock();
        self.shared.tables.delete_directory(path)
    }

    /// Remove a directory and everything beneath it. The root is rejected
    /// before anything is deleted.
    pub fn delete_directory_recursively(&self, path: &str) -> Result<()> {
        self.ensure_writable()?;
        let _guard = self.shared.header.lock();
        if self.shared.tables.find_directory(path)? == ROOT_DIRECTORY {
            return Err(SaveError::InvalidPath(path.to_owned()));
        }
        self.clean_locked(path)?;
        self.shared.tables.delete_directory(path)
    }

    /// Remove everything beneath a directory, keeping the directory.
    pub fn clean_directory_recursively(&self, path: &str) -> Result<()> {
        self.ensure_writable()?;
        let _guard = self.shared.header.lock();
        self.shared.tables.find_directory(path)?;
        self.clean_locked(path)
    }

    fn clean_locked(&self, directory: &str) -> Result<()> {
        for entry in self.shared.tables.enumerate(directory, EnumerateMode::All)? {
            let child = path::join(directory, &entry.name);
            match entry.kind {
                EntryType::Directory => {
                    self.clean_locked(&child)?;
                    self.shared.tables.delete_directory(&child)?;
                }
                EntryType::File => self.delete_file_locked(&child)?,
            }
        }
        Ok(())
    }

    pub fn rename_file(&self, old_path: &str, new_path: &str) -> Result<()> {
        self.ensure_writable()?;
        let _guard = self.shared.header.lock();
        self.shared.tables.rename_file(old_path, new_path)
    }

    pub fn rename_directory(&self, old_path: &str, new_path: &str) -> Result<()> {
        self.ensure_writable()?;
        let _guard = self.shared.header.lock();
        self.shared.tables.rename_directory(old_path, new_path)
    }

    pub fn get_entry_type(&self, path: &str) -> Result<EntryType> {
        let _guard = self.shared.header.lock();
        self.shared.tables.entry_type(path)
    }

    /// Open a file handle. Writing modes need a writable mount.
    pub fn open_file(&self, path: &str, mode: OpenMode) -> Result<SaveFile> {
        mode.validate()?;
        if mode.contains(OpenMode::WRITE) {
            self.ensure_writable()?;
        }
        let _guard = self.shared.header.lock();
        let shared = &*self.shared;
        let info = shared.tables.find_file(path)?;
        let chain = AllocationTableStorage::open(
            Arc::clone(&shared.fat),
            Arc::clone(&shared.data),
            shared.block_size,
            info.start_block,
            info.length,
        )?;
        Ok(SaveFile::new(
            Arc::clone(&self.shared),
            path.to_owned(),
            mode,
            chain,
        ))
    }

    /// Snapshot the children of a directory.
    pub fn open_directory(&self, path: &str, mode: EnumerateMode) -> Result<SaveDirectory> {
        let _guard = self.shared.header.lock();
        let entries = self.shared.tables.enumerate(path, mode)?;
        Ok(SaveDirectory::new(path.to_owned(), mode, entries))
    }

    /// Bytes still available for new file data.
    pub fn get_free_space_size(&self) -> Result<u64> {
        let _guard = self.shared.header.lock();
        Ok(u64::from(self.shared.fat.free_list_length()?) * self.shared.block_size.as_u64())
    }

    #[must_use]
    pub fn get_total_space_size(&self) -> u64 {
        u64::from(self.shared.fat.block_count()) * self.shared.block_size.as_u64()
    }

    /// Every file with its chain head and length, depth first.
    pub fn walk_files(&self) -> Result<Vec<(String, FileInfo)>> {
        let _guard = self.shared.header.lock();
        let mut out = Vec::new();
        self.walk_locked("/", &mut out)?;
        Ok(out)
    }

    fn walk_locked(&self, directory: &str, out: &mut Vec<(String, FileInfo)>) -> Result<()> {
        for entry in self.shared.tables.enumerate(directory, EnumerateMode::All)? {
            let child = path::join(directory, &entry.name);
            match entry.kind {
                EntryType::Directory => self.walk_locked(&child, out)?,
                EntryType::File => {
                    let info = self.shared.tables.find_file(&child)?;
                    out.push((child, info));
                }
            }
        }
        Ok(())
    }
}

// ── Commit and verification ─────────────────────────────────────────────────

impl SaveContainerFileSystem {
    /// Make every change since the last commit durable.
    ///
    /// Journal map, allocation table and entry tables reach the inactive
    /// duplex copies first; the header rewrite with the flipped duplex
    /// index is the single step that publishes them.
    pub fn commit(&self) -> Result<()> {
        self.ensure_writable()?;
        let mut header = self.shared.header.lock();
        let shared = &*self.shared;
        let pending = shared.journal.pending_block_count();

        shared.tables.flush()?;
        shared.journal.commit()?;
        shared.fat.flush()?;
        header.save.fat.directory_table_block = shared.directory_storage.head();
        header.save.fat.file_table_block = shared.file_storage.head();
        header.layout.duplex_index = shared.stack.duplex.commit()?;

        let mut image = vec![0_u8; HEADER_SIZE];
        shared.base.read_at(0, &mut image)?;
        header.write_into(&mut image).map_err(format_error)?;
        shared.base.write_at(0, &image)?;
        shared.base.flush()?;
        *shared.committed_free.lock() = free_block_bitmap(&shared.fat)?;
        info!(
            duplex_index = header.layout.duplex_index,
            journal_blocks = pending,
            "container_commit"
        );
        Ok(())
    }

    /// Check the entry tables and that every allocation block is owned by
    /// exactly one of: the free list, a table chain, a file chain.
    pub fn verify(&self) -> Result<VerifyReport> {
        let _guard = self.shared.header.lock();
        let shared = &*self.shared;
        let stats = shared.tables.verify()?;
        let mut files = Vec::new();
        self.walk_locked("/", &mut files)?;
        let block_count = shared.fat.block_count();
        let mut owners: Vec<Option<String>> = vec![None; block_count as usize];
        let mut claim = |blocks: Vec<u32>, owner: &str| -> Result<()> {
            for block in blocks {
                let slot = owners.get_mut(block as usize).ok_or_else(|| {
                    SaveError::corruption(u64::from(block), format!("{owner} holds block {block}"))
                })?;
                if let Some(previous) = slot {
                    return Err(SaveError::corruption(
                        u64::from(block),
                        format!("block {block} owned by both {previous} and {owner}"),
                    ));
                }
                *slot = Some(owner.to_owned());
            }
            Ok(())
        };

        let free = shared.fat.free_blocks()?;
        let free_blocks = u32::try_from(free.len()).unwrap_or(u32::MAX);
        claim(free, "free list")?;
        claim(
            shared.fat.chain_blocks(shared.directory_storage.head())?,
            "directory table",
        )?;
        claim(
            shared.fat.chain_blocks(shared.file_storage.head())?,
            "file table",
        )?;
        for (file, info) in &files {
            let blocks = shared.fat.chain_blocks(info.start_block)?;
            if blocks.len() as u64 != shared.block_size.blocks_for(info.length) {
                return Err(SaveError::corruption(
                    u64::from(info.start_block),
                    format!(
                        "{file}: chain of {} blocks for {:#x} bytes",
                        blocks.len(),
                        info.length
                    ),
                ));
            }
            claim(blocks, file)?;
        }
        if let Some(leaked) = owners.iter().position(Option::is_none) {
            return Err(SaveError::corruption(
                leaked as u64,
                format!("block {leaked} is neither free nor owned"),
            ));
        }

        let report = VerifyReport {
            directories: stats.directories,
            files: stats.files,
            used_blocks: block_count - free_blocks,
            free_blocks,
        };
        debug!(?report, "container_verify");
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_options() -> FormatOptions {
        FormatOptions {
            block_size: 0x200,
            data_block_count: 32,
            journal_block_count: 32,
            duplex_block_size: 0x40,
            ..FormatOptions::default()
        }
    }

    fn formatted() -> (MemoryStorage, SaveContainerFileSystem) {
        let storage = MemoryStorage::new(0);
        let fs = format_container(Arc::new(storage.clone()), &small_options()).expect("format");
        (storage, fs)
    }

    fn remount(storage: &MemoryStorage, read_only: bool) -> SaveContainerFileSystem {
        SaveContainerFileSystem::from_storage(
            Arc::new(storage.clone()),
            &MountOptions { read_only },
        )
        .expect("mount")
    }

    #[test]
    fn fresh_container_has_only_root() {
        let (_, fs) = formatted();
        assert!(fs.open_directory("/", EnumerateMode::All).expect("root").entries().is_empty());
        assert_eq!(fs.get_entry_type("/").expect("type"), EntryType::Directory);
        let report = fs.verify().expect("verify");
        assert_eq!(report.directories, 1);
        assert_eq!(report.files, 0);
        assert_eq!(report.used_blocks + report.free_blocks, 32);
    }

    #[test]
    fn create_file_rejects_existing_entries_without_allocating() {
        let (_, fs) = formatted();
        fs.create_directory("/dir").expect("mkdir");
        fs.create_file("/file", 0x10).expect("create");
        let free = fs.get_free_space_size().expect("free");
        assert!(matches!(fs.create_file("/dir", 0x10), Err(SaveError::AlreadyExists(_))));
        assert!(matches!(fs.create_file("/file", 0x10), Err(SaveError::AlreadyExists(_))));
        assert!(matches!(
            fs.create_file("/missing/file", 0x400),
            Err(SaveError::PathNotFound(_))
        ));
        assert_eq!(fs.get_free_space_size().expect("free"), free);
    }

    #[test]
    fn delete_file_returns_blocks() {
        let (_, fs) = formatted();
        let before = fs.get_free_space_size().expect("free");
        fs.create_file("/a", 0x450).expect("create");
        assert_eq!(fs.get_free_space_size().expect("free"), before - 3 * 0x200);
        fs.delete_file("/a").expect("delete");
        assert_eq!(fs.get_free_space_size().expect("free"), before);
        assert!(matches!(fs.get_entry_type("/a"), Err(SaveError::PathNotFound(_))));
    }

    #[test]
    fn recursive_delete_and_clean() {
        let (_, fs) = formatted();
        let before = fs.get_free_space_size().expect("free");
        fs.create_directory("/a").expect("mkdir");
        fs.create_directory("/a/b").expect("mkdir");
        fs.create_file("/a/b/c", 0x300).expect("create");
        fs.create_file("/a/d", 0x10).expect("create");

        assert!(matches!(fs.delete_directory("/a"), Err(SaveError::NotEmpty(_))));
        fs.clean_directory_recursively("/a").expect("clean");
        assert!(fs.open_directory("/a", EnumerateMode::All).expect("ls").entries().is_empty());
        assert_eq!(fs.get_free_space_size().expect("free"), before);

        fs.create_file("/a/e", 0x10).expect("create");
        fs.delete_directory_recursively("/a").expect("rm -r");
        assert!(matches!(fs.get_entry_type("/a"), Err(SaveError::PathNotFound(_))));
        assert!(matches!(
            fs.delete_directory_recursively("/"),
            Err(SaveError::InvalidPath(_))
        ));
        fs.verify().expect("verify");
    }

    #[test]
    fn read_only_mount_rejects_mutation() {
        let (storage, fs) = formatted();
        fs.create_file("/f", 4).expect("create");
        fs.commit().expect("commit");
        drop(fs);

        let before = storage.to_vec();
        let fs = remount(&storage, true);
        assert!(fs.is_read_only());
        assert!(matches!(fs.create_directory("/d"), Err(SaveError::ReadOnly)));
        assert!(matches!(fs.delete_file("/f"), Err(SaveError::ReadOnly)));
        assert!(matches!(fs.commit(), Err(SaveError::ReadOnly)));
        assert!(matches!(fs.open_file("/f", OpenMode::WRITE), Err(SaveError::ReadOnly)));
        fs.open_file("/f", OpenMode::READ).expect("read handle");
        assert_eq!(storage.to_vec(), before);
    }

    #[test]
    fn commit_flips_duplex_index() {
        let (storage, fs) = formatted();
        let first = fs.layout().duplex_index;
        fs.create_directory("/x").expect("mkdir");
        fs.commit().expect("commit");
        assert_ne!(fs.layout().duplex_index, first);
        drop(fs);
        let fs = remount(&storage, false);
        assert_eq!(fs.get_entry_type("/x").expect("type"), EntryType::Directory);
    }

    #[test]
    fn raw_layers_are_consistent() {
        let (storage, fs) = formatted();
        assert_eq!(fs.base_storage().size(), storage.size());
        assert_eq!(fs.allocation_table().block_count(), 32);
        assert_eq!(fs.data_storage().size(), fs.get_total_space_size());
        let layout = fs.layout();
        assert!(fs.meta_storage().size() >= layout.fat_offset + layout.fat_size);
        assert_eq!(
            fs.file_remap().size(),
            u64::from(fs.header().journal.map.main_data_block_count
                + fs.header().journal.map.journal_block_count)
                * 0x200
        );
        assert_eq!(fs.journal().pending_block_count(), 0);
    }

    #[test]
    fn rejects_truncated_image() {
        let storage = MemoryStorage::new(0x100);
        let err = SaveContainerFileSystem::from_storage(Arc::new(storage), &MountOptions::default())
            .expect_err("too small");
        assert!(matches!(err, SaveError::Format(_)));
    }

    #[test]
    fn walk_lists_nested_files() {
        let (_, fs) = formatted();
        fs.create_directory("/save").expect("mkdir");
        fs.create_file("/save/one", 1).expect("create");
        fs.create_file("/two", 0).expect("create");
        let mut names: Vec<String> = fs.walk_files().expect("walk").into_iter().map(|(p, _)| p).collect();
        names.sort();
        assert_eq!(names, vec!["/save/one".to_owned(), "/two".to_owned()]);
    }
}
