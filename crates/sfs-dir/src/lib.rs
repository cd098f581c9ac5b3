#![forbid(unsafe_code)]
//! Hierarchical directory and file index.
//!
//! Two [`EntryTable`]s, one for directories and one for files, map
//! `(parent directory index, name)` to a table entry. Directory entry 0 is
//! the root. Each directory entry heads two sibling lists through
//! `next_sibling`: its child directories and its child files.
//!
//! Payloads share the entry's two value fields:
//!
//! ```text
//!              block_or_first_dir    length_or_first_file
//! directory    first child dir       first child file
//! file         start block           length in bytes
//! ```

pub mod path;
pub mod table;

pub use table::{EntryTable, TableHeader, hash_key};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sfs_error::{Result, SaveError};
use sfs_ondisk::TableEntry;
use sfs_storage::SharedStorage;
use sfs_types::{END_OF_CHAIN, NO_ENTRY};
use tracing::debug;

/// Directory index of the root.
pub const ROOT_DIRECTORY: u32 = 0;

/// Where a file's bytes live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    /// First allocation block, or `END_OF_CHAIN` for an empty file.
    pub start_block: u32,
    pub length: u64,
}

impl FileInfo {
    pub const EMPTY: Self = Self {
        start_block: END_OF_CHAIN,
        length: 0,
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntryType {
    Directory,
    File,
}

/// Which children [`HierarchicalFileTable::enumerate`] yields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EnumerateMode {
    Directories,
    Files,
    #[default]
    All,
}

impl EnumerateMode {
    fn directories(self) -> bool {
        matches!(self, Self::Directories | Self::All)
    }

    fn files(self) -> bool {
        matches!(self, Self::Files | Self::All)
    }
}

/// One enumerated child.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryEntry {
    pub name: String,
    pub kind: EntryType,
    /// File length; zero for directories.
    pub size: u64,
}

/// Geometry for [`HierarchicalFileTable::format`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableGeometry {
    pub directory_buckets: u32,
    pub directory_capacity: u32,
    pub file_buckets: u32,
    pub file_capacity: u32,
}

impl Default for TableGeometry {
    fn default() -> Self {
        Self {
            directory_buckets: 16,
            directory_capacity: 16,
            file_buckets: 32,
            file_capacity: 32,
        }
    }
}

/// Live entry counts found by [`HierarchicalFileTable::verify`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TableStats {
    /// Directories, the root included.
    pub directories: u32,
    pub files: u32,
}

fn first_file(entry: &TableEntry) -> u32 {
    u32::try_from(entry.length_or_first_file & u64::from(u32::MAX)).unwrap_or(NO_ENTRY)
}

fn new_directory_entry(parent: u32, name: &str) -> Result<TableEntry> {
    let mut entry = TableEntry {
        parent,
        length_or_first_file: u64::from(NO_ENTRY),
        ..TableEntry::default()
    };
    entry
        .set_name(name.as_bytes())
        .map_err(|_| SaveError::NameTooLong(name.to_owned()))?;
    Ok(entry)
}

fn file_info(entry: &TableEntry) -> FileInfo {
    FileInfo {
        start_block: entry.block_or_first_dir,
        length: entry.length_or_first_file,
    }
}

fn entry_name(entry: &TableEntry) -> String {
    String::from_utf8_lossy(entry.name_bytes()).into_owned()
}

/// Directory and file tables behind one lock.
pub struct HierarchicalFileTable {
    directories: EntryTable,
    files: EntryTable,
    lock: Mutex<()>,
}

impl std::fmt::Debug for HierarchicalFileTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HierarchicalFileTable")
            .field("directories", &self.directories)
            .field("files", &self.files)
            .finish_non_exhaustive()
    }
}

impl HierarchicalFileTable {
    /// Initialize both tables and create the root directory.
    pub fn format(
        directory_storage: SharedStorage,
        file_storage: SharedStorage,
        geometry: &TableGeometry,
    ) -> Result<Self> {
        let directories = EntryTable::format(
            directory_storage,
            "directory",
            geometry.directory_buckets,
            geometry.directory_capacity,
        )?;
        let files = EntryTable::format(
            file_storage,
            "file",
            geometry.file_buckets,
            geometry.file_capacity,
        )?;
        let root = new_directory_entry(ROOT_DIRECTORY, "")?;
        directories.insert_unlinked(&root)?;
        Ok(Self {
            directories,
            files,
            lock: Mutex::new(()),
        })
    }

    pub fn open(directory_storage: SharedStorage, file_storage: SharedStorage) -> Result<Self> {
        let directories = EntryTable::open(directory_storage, "directory")?;
        if directories.header()?.used_count == 0 {
            return Err(SaveError::corruption(0, "directory table has no root"));
        }
        Ok(Self {
            directories,
            files: EntryTable::open(file_storage, "file")?,
            lock: Mutex::new(()),
        })
    }

    #[must_use]
    pub fn directory_table(&self) -> &EntryTable {
        &self.directories
    }

    #[must_use]
    pub fn file_table(&self) -> &EntryTable {
        &self.files
    }

    // ── Resolution ──────────────────────────────────────────────────────

    fn resolve_directory(&self, parts: &[&str], path: &str) -> Result<u32> {
        let mut current = ROOT_DIRECTORY;
        for name in parts {
            current = match self.directories.find(current, name.as_bytes())? {
                Some(index) => index,
                None if self.files.find(current, name.as_bytes())?.is_some() => {
                    return Err(SaveError::NotDirectory(path.to_owned()));
                }
                None => return Err(SaveError::PathNotFound(path.to_owned())),
            };
        }
        Ok(current)
    }

    /// Resolve the parent directory of `path` and return it with the leaf name.
    fn resolve_parent<'p>(&self, path: &'p str) -> Result<(u32, &'p str)> {
        let (parents, leaf) = path::split_leaf(path)?;
        Ok((self.resolve_directory(&parents, path)?, leaf))
    }

    fn ensure_absent(&self, parent: u32, name: &str, path: &str) -> Result<()> {
        if self.directories.find(parent, name.as_bytes())?.is_some()
            || self.files.find(parent, name.as_bytes())?.is_some()
        {
            return Err(SaveError::AlreadyExists(path.to_owned()));
        }
        Ok(())
    }

    fn locate_file(&self, path: &str) -> Result<u32> {
        let (parent, name) = self.resolve_parent(path)?;
        match self.files.find(parent, name.as_bytes())? {
            Some(index) => Ok(index),
            None if self.directories.find(parent, name.as_bytes())?.is_some() => {
                Err(SaveError::IsDirectory(path.to_owned()))
            }
            None => Err(SaveError::PathNotFound(path.to_owned())),
        }
    }

    fn locate_directory(&self, path: &str) -> Result<u32> {
        let parts = path::components(path)?;
        let Some((leaf, parents)) = parts.split_last() else {
            return Ok(ROOT_DIRECTORY);
        };
        let parent = self.resolve_directory(parents, path)?;
        match self.directories.find(parent, leaf.as_bytes())? {
            Some(index) => Ok(index),
            None if self.files.find(parent, leaf.as_bytes())?.is_some() => {
                Err(SaveError::NotDirectory(path.to_owned()))
            }
            None => Err(SaveError::PathNotFound(path.to_owned())),
        }
    }

    /// Index of the directory at `path`; `/` is [`ROOT_DIRECTORY`].
    pub fn find_directory(&self, path: &str) -> Result<u32> {
        let _guard = self.lock.lock();
        self.locate_directory(path)
    }

    pub fn find_file(&self, path: &str) -> Result<FileInfo> {
        let _guard = self.lock.lock();
        let index = self.locate_file(path)?;
        Ok(file_info(&self.files.read(index)?))
    }

    pub fn entry_type(&self, path: &str) -> Result<EntryType> {
        let _guard = self.lock.lock();
        let parts = path::components(path)?;
        let Some((leaf, parents)) = parts.split_last() else {
            return Ok(EntryType::Directory);
        };
        let parent = self.resolve_directory(parents, path)?;
        if self.directories.find(parent, leaf.as_bytes())?.is_some() {
            Ok(EntryType::Directory)
        } else if self.files.find(parent, leaf.as_bytes())?.is_some() {
            Ok(EntryType::File)
        } else {
            Err(SaveError::PathNotFound(path.to_owned()))
        }
    }

    // ── Sibling lists ───────────────────────────────────────────────────

    fn link_child(&self, parent: u32, kind: EntryType, index: u32) -> Result<()> {
        let mut parent_entry = self.directories.read(parent)?;
        let (table, head) = match kind {
            EntryType::Directory => (&self.directories, parent_entry.block_or_first_dir),
            EntryType::File => (&self.files, first_file(&parent_entry)),
        };
        let mut child = table.read(index)?;
        child.next_sibling = head;
        table.write(index, &child)?;
        match kind {
            EntryType::Directory => parent_entry.block_or_first_dir = index,
            EntryType::File => parent_entry.length_or_first_file = u64::from(index),
        }
        self.directories.write(parent, &parent_entry)
    }

    fn unlink_child(&self, parent: u32, kind: EntryType, index: u32) -> Result<()> {
        let mut parent_entry = self.directories.read(parent)?;
        let (table, head) = match kind {
            EntryType::Directory => (&self.directories, parent_entry.block_or_first_dir),
            EntryType::File => (&self.files, first_file(&parent_entry)),
        };
        let next = table.read(index)?.next_sibling;
        if head == index {
            match kind {
                EntryType::Directory => parent_entry.block_or_first_dir = next,
                EntryType::File => parent_entry.length_or_first_file = u64::from(next),
            }
            return self.directories.write(parent, &parent_entry);
        }

        let limit = table.header()?.used_count;
        let mut current = head;
        let mut steps = 0_u32;
        while current != NO_ENTRY && steps <= limit {
            let mut sibling = table.read(current)?;
            if sibling.next_sibling == index {
                sibling.next_sibling = next;
                return table.write(current, &sibling);
            }
            current = sibling.next_sibling;
            steps += 1;
        }
        Err(SaveError::corruption(
            u64::from(index),
            format!("{} entry {index} missing from sibling list of {parent}", table.kind()),
        ))
    }

    fn children(&self, directory: u32, kind: EntryType) -> Result<Vec<(u32, TableEntry)>> {
        let entry = self.directories.read(directory)?;
        let (table, head) = match kind {
            EntryType::Directory => (&self.directories, entry.block_or_first_dir),
            EntryType::File => (&self.files, first_file(&entry)),
        };
        let limit = table.header()?.used_count as usize;
        let mut out = Vec::new();
        let mut current = head;
        while current != NO_ENTRY {
            if out.len() >= limit {
                return Err(SaveError::corruption(
                    u64::from(directory),
                    format!("{} sibling list of {directory} cycles", table.kind()),
                ));
            }
            let child = table.read(current)?;
            if child.parent != directory {
                return Err(SaveError::corruption(
                    u64::from(current),
                    format!(
                        "{} entry {current} listed under {directory} but parented to {}",
                        table.kind(),
                        child.parent
                    ),
                ));
            }
            let next = child.next_sibling;
            out.push((current, child));
            current = next;
        }
        Ok(out)
    }

    // ── Mutation ────────────────────────────────────────────────────────

    pub fn add_directory(&self, path: &str) -> Result<u32> {
        let _guard = self.lock.lock();
        let (parent, name) = self.resolve_parent(path)?;
        self.ensure_absent(parent, name, path)?;
        let index = self.directories.insert(new_directory_entry(parent, name)?)?;
        self.link_child(parent, EntryType::Directory, index)?;
        debug!(path, index, parent, "directory_add");
        Ok(index)
    }

    pub fn add_file(&self, path: &str, info: FileInfo) -> Result<u32> {
        let _guard = self.lock.lock();
        let (parent, name) = self.resolve_parent(path)?;
        self.ensure_absent(parent, name, path)?;
        let mut entry = TableEntry {
            parent,
            block_or_first_dir: info.start_block,
            length_or_first_file: info.length,
            ..TableEntry::default()
        };
        entry
            .set_name(name.as_bytes())
            .map_err(|_| SaveError::NameTooLong(name.to_owned()))?;
        let index = self.files.insert(entry)?;
        self.link_child(parent, EntryType::File, index)?;
        debug!(path, index, parent, start_block = info.start_block, length = info.length, "file_add");
        Ok(index)
    }

    /// Remove an empty directory. The root cannot be removed.
    pub fn delete_directory(&self, path: &str) -> Result<()> {
        let _guard = self.lock.lock();
        let index = self.locate_directory(path)?;
        if index == ROOT_DIRECTORY {
            return Err(SaveError::InvalidPath(path.to_owned()));
        }
        let entry = self.directories.read(index)?;
        if entry.block_or_first_dir != NO_ENTRY || first_file(&entry) != NO_ENTRY {
            return Err(SaveError::NotEmpty(path.to_owned()));
        }
        self.unlink_child(entry.parent, EntryType::Directory, index)?;
        self.directories.remove(index)?;
        debug!(path, index, "directory_delete");
        Ok(())
    }

    /// Remove a file entry and return where its data lived so the caller
    /// can free the chain.
    pub fn delete_file(&self, path: &str) -> Result<FileInfo> {
        let _guard = self.lock.lock();
        let index = self.locate_file(path)?;
        let entry = self.files.read(index)?;
        self.unlink_child(entry.parent, EntryType::File, index)?;
        self.files.remove(index)?;
        debug!(path, index, "file_delete");
        Ok(file_info(&entry))
    }

    pub fn update_file(&self, path: &str, info: FileInfo) -> Result<()> {
        let _guard = self.lock.lock();
        let index = self.locate_file(path)?;
        let mut entry = self.files.read(index)?;
        entry.block_or_first_dir = info.start_block;
        entry.length_or_first_file = info.length;
        self.files.write(index, &entry)
    }

    pub fn rename_file(&self, old_path: &str, new_path: &str) -> Result<()> {
        let _guard = self.lock.lock();
        let index = self.locate_file(old_path)?;
        let (new_parent, new_name) = self.resolve_parent(new_path)?;
        let entry = self.files.read(index)?;
        if entry.parent == new_parent && entry.name_bytes() == new_name.as_bytes() {
            return Ok(());
        }
        self.ensure_absent(new_parent, new_name, new_path)?;
        self.unlink_child(entry.parent, EntryType::File, index)?;
        self.files.rekey(index, new_parent, new_name.as_bytes())?;
        self.link_child(new_parent, EntryType::File, index)?;
        debug!(old_path, new_path, index, "file_rename");
        Ok(())
    }

    /// Move a directory and its subtree. Moving it beneath itself is
    /// `InvalidPath`.
    pub fn rename_directory(&self, old_path: &str, new_path: &str) -> Result<()> {
        let _guard = self.lock.lock();
        let index = self.locate_directory(old_path)?;
        if index == ROOT_DIRECTORY {
            return Err(SaveError::InvalidPath(old_path.to_owned()));
        }
        let (new_parent, new_name) = self.resolve_parent(new_path)?;
        let entry = self.directories.read(index)?;
        if entry.parent == new_parent && entry.name_bytes() == new_name.as_bytes() {
            return Ok(());
        }

        let limit = self.directories.header()?.used_count;
        let mut ancestor = new_parent;
        let mut steps = 0_u32;
        while ancestor != ROOT_DIRECTORY {
            if ancestor == index {
                return Err(SaveError::InvalidPath(new_path.to_owned()));
            }
            steps += 1;
            if steps > limit {
                return Err(SaveError::corruption(
                    u64::from(new_parent),
                    "directory parent chain cycles",
                ));
            }
            ancestor = self.directories.read(ancestor)?.parent;
        }

        self.ensure_absent(new_parent, new_name, new_path)?;
        self.unlink_child(entry.parent, EntryType::Directory, index)?;
        self.directories.rekey(index, new_parent, new_name.as_bytes())?;
        self.link_child(new_parent, EntryType::Directory, index)?;
        debug!(old_path, new_path, index, "directory_rename");
        Ok(())
    }

    // ── Enumeration ─────────────────────────────────────────────────────

    /// Live children of the directory at `path`: directories first, then
    /// files, each in sibling-list order.
    pub fn enumerate(&self, path: &str, mode: EnumerateMode) -> Result<Vec<DirectoryEntry>> {
        let _guard = self.lock.lock();
        let directory = self.locate_directory(path)?;
        self.enumerate_index(directory, mode)
    }

    fn enumerate_index(&self, directory: u32, mode: EnumerateMode) -> Result<Vec<DirectoryEntry>> {
        let mut out = Vec::new();
        if mode.directories() {
            for (_, child) in self.children(directory, EntryType::Directory)? {
                out.push(DirectoryEntry {
                    name: entry_name(&child),
                    kind: EntryType::Directory,
                    size: 0,
                });
            }
        }
        if mode.files() {
            for (_, child) in self.children(directory, EntryType::File)? {
                out.push(DirectoryEntry {
                    name: entry_name(&child),
                    kind: EntryType::File,
                    size: child.length_or_first_file,
                });
            }
        }
        Ok(out)
    }

    /// Number of children of the directory at `path`.
    pub fn child_count(&self, path: &str, mode: EnumerateMode) -> Result<usize> {
        Ok(self.enumerate(path, mode)?.len())
    }

    // ── Verification ────────────────────────────────────────────────────

    /// Check every structural invariant of both tables.
    ///
    /// Bucket chains must cover exactly the live entries. Every directory's
    /// parent chain must reach the root. Sibling lists must list each live
    /// entry exactly once under its own parent.
    pub fn verify(&self) -> Result<TableStats> {
        let _guard = self.lock.lock();
        let dir_free = self.directories.free_slots()?;
        let file_free = self.files.free_slots()?;
        if dir_free.first().copied().unwrap_or(true) {
            return Err(SaveError::corruption(0, "root directory slot is free"));
        }

        let live_dirs: Vec<u32> = (0_u32..)
            .zip(&dir_free)
            .filter_map(|(index, free)| (!free).then_some(index))
            .collect();
        let live_files: Vec<u32> = (0_u32..)
            .zip(&file_free)
            .filter_map(|(index, free)| (!free).then_some(index))
            .collect();

        let hashed_dirs = self.directories.check_buckets(&dir_free)?;
        let hashed_files = self.files.check_buckets(&file_free)?;
        // The root is never hashed.
        if hashed_dirs as usize + 1 != live_dirs.len() || hashed_files as usize != live_files.len() {
            return Err(SaveError::corruption(
                0,
                format!(
                    "hash chains hold {hashed_dirs} dirs/{hashed_files} files, tables hold {}/{}",
                    live_dirs.len() - 1,
                    live_files.len()
                ),
            ));
        }

        let limit = live_dirs.len();
        for &index in &live_dirs {
            let mut current = index;
            let mut steps = 0_usize;
            while current != ROOT_DIRECTORY {
                let parent = self.directories.read(current)?.parent;
                if parent as usize >= dir_free.len() || dir_free[parent as usize] {
                    return Err(SaveError::corruption(
                        u64::from(current),
                        format!("directory {current} has dead parent {parent}"),
                    ));
                }
                steps += 1;
                if steps > limit {
                    return Err(SaveError::corruption(
                        u64::from(index),
                        format!("directory {index} parent chain cycles"),
                    ));
                }
                current = parent;
            }
        }

        let mut listed_dirs = 1_usize;
        let mut listed_files = 0_usize;
        for &index in &live_dirs {
            listed_dirs += self.children(index, EntryType::Directory)?.len();
            listed_files += self.children(index, EntryType::File)?.len();
        }
        if listed_dirs != live_dirs.len() || listed_files != live_files.len() {
            return Err(SaveError::corruption(
                0,
                format!(
                    "sibling lists hold {listed_dirs} dirs/{listed_files} files, tables hold {}/{}",
                    live_dirs.len(),
                    live_files.len()
                ),
            ));
        }

        let stats = TableStats {
            directories: u32::try_from(live_dirs.len()).unwrap_or(u32::MAX),
            files: u32::try_from(live_files.len()).unwrap_or(u32::MAX),
        };
        debug!(directories = stats.directories, files = stats.files, "table_verify");
        Ok(stats)
    }

    pub fn flush(&self) -> Result<()> {
        self.directories.flush()?;
        self.files.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use sfs_storage::{MemoryStorage, Storage};
    use std::collections::BTreeMap;
    use std::sync::Arc;

    struct Fixture {
        dirs: MemoryStorage,
        files: MemoryStorage,
    }

    impl Fixture {
        fn format(geometry: &TableGeometry) -> (Self, HierarchicalFileTable) {
            let fixture = Self {
                dirs: MemoryStorage::new(0),
                files: MemoryStorage::new(0),
            };
            let table = HierarchicalFileTable::format(
                Arc::new(fixture.dirs.clone()),
                Arc::new(fixture.files.clone()),
                geometry,
            )
            .expect("format");
            (fixture, table)
        }

        fn reopen(&self) -> HierarchicalFileTable {
            HierarchicalFileTable::open(Arc::new(self.dirs.clone()), Arc::new(self.files.clone()))
                .expect("open")
        }
    }

    fn info(start_block: u32, length: u64) -> FileInfo {
        FileInfo { start_block, length }
    }

    fn names(entries: &[DirectoryEntry]) -> Vec<&str> {
        entries.iter().map(|entry| entry.name.as_str()).collect()
    }

    #[test]
    fn resolves_nested_paths() {
        let (_fixture, table) = Fixture::format(&TableGeometry::default());
        table.add_directory("/save").expect("dir");
        table.add_file("/save/data.bin", info(5, 0x1234)).expect("file");

        assert_eq!(table.find_file("/save/data.bin").expect("find"), info(5, 0x1234));
        assert_eq!(table.find_file("save//./data.bin").expect("find"), info(5, 0x1234));
        assert_eq!(table.find_directory("/").expect("root"), ROOT_DIRECTORY);
        assert_eq!(table.entry_type("/save").expect("type"), EntryType::Directory);
        assert_eq!(table.entry_type("/save/data.bin").expect("type"), EntryType::File);

        let listing = table.enumerate("/save", EnumerateMode::All).expect("enumerate");
        assert_eq!(
            listing,
            vec![DirectoryEntry {
                name: "data.bin".to_owned(),
                kind: EntryType::File,
                size: 0x1234,
            }]
        );
    }

    #[test]
    fn lookup_errors_are_specific() {
        let (_fixture, table) = Fixture::format(&TableGeometry::default());
        table.add_directory("/d").expect("dir");
        table.add_file("/f", FileInfo::EMPTY).expect("file");

        assert!(matches!(table.find_file("/missing"), Err(SaveError::PathNotFound(_))));
        assert!(matches!(table.find_file("/d"), Err(SaveError::IsDirectory(_))));
        assert!(matches!(table.find_directory("/f"), Err(SaveError::NotDirectory(_))));
        assert!(matches!(table.find_file("/f/x"), Err(SaveError::NotDirectory(_))));
        assert!(matches!(table.add_file("/d", FileInfo::EMPTY), Err(SaveError::AlreadyExists(_))));
        assert!(matches!(table.add_directory("/f"), Err(SaveError::AlreadyExists(_))));
        assert!(matches!(table.add_directory("/"), Err(SaveError::InvalidPath(_))));
        assert!(matches!(table.delete_directory("/"), Err(SaveError::InvalidPath(_))));
        let long = format!("/{}", "n".repeat(0x41));
        assert!(matches!(table.add_file(&long, FileInfo::EMPTY), Err(SaveError::NameTooLong(_))));
    }

    #[test]
    fn enumeration_filters_by_mode() {
        let (_fixture, table) = Fixture::format(&TableGeometry::default());
        table.add_directory("/a").expect("dir");
        table.add_directory("/b").expect("dir");
        table.add_file("/c", info(1, 10)).expect("file");

        let dirs = table.enumerate("/", EnumerateMode::Directories).expect("dirs");
        assert_eq!(names(&dirs), vec!["b", "a"]);
        let files = table.enumerate("/", EnumerateMode::Files).expect("files");
        assert_eq!(names(&files), vec!["c"]);
        assert_eq!(table.child_count("/", EnumerateMode::All).expect("all"), 3);
    }

    #[test]
    fn delete_requires_empty_directory() {
        let (_fixture, table) = Fixture::format(&TableGeometry::default());
        table.add_directory("/d").expect("dir");
        table.add_file("/d/x", info(2, 1)).expect("file");
        assert!(matches!(table.delete_directory("/d"), Err(SaveError::NotEmpty(_))));
        assert_eq!(table.delete_file("/d/x").expect("delete"), info(2, 1));
        table.delete_directory("/d").expect("now empty");
        assert!(matches!(table.find_directory("/d"), Err(SaveError::PathNotFound(_))));
        assert_eq!(table.verify().expect("verify"), TableStats { directories: 1, files: 0 });
    }

    #[test]
    fn rename_moves_between_directories() {
        let (_fixture, table) = Fixture::format(&TableGeometry::default());
        table.add_directory("/a").expect("a");
        table.add_directory("/b").expect("b");
        table.add_file("/a/f", info(3, 7)).expect("f");

        table.rename_file("/a/f", "/b/g").expect("rename file");
        assert!(table.enumerate("/a", EnumerateMode::All).expect("a").is_empty());
        assert_eq!(table.find_file("/b/g").expect("find"), info(3, 7));

        table.rename_directory("/b", "/a/b").expect("rename dir");
        assert_eq!(table.find_file("/a/b/g").expect("find"), info(3, 7));
        assert!(matches!(
            table.rename_directory("/a", "/a/b/c"),
            Err(SaveError::InvalidPath(_))
        ));
        table.rename_directory("/a/b", "/a/b").expect("same path");
        table.verify().expect("verify");
    }

    #[test]
    fn update_file_changes_payload() {
        let (fixture, table) = Fixture::format(&TableGeometry::default());
        table.add_file("/f", FileInfo::EMPTY).expect("file");
        table.update_file("/f", info(9, 0x400)).expect("update");
        drop(table);
        assert_eq!(fixture.reopen().find_file("/f").expect("find"), info(9, 0x400));
    }

    #[test]
    fn tables_grow_past_initial_capacity() {
        let geometry = TableGeometry {
            directory_buckets: 2,
            directory_capacity: 1,
            file_buckets: 2,
            file_capacity: 1,
        };
        let (fixture, table) = Fixture::format(&geometry);
        for i in 0..20 {
            table.add_directory(&format!("/d{i}")).expect("dir");
            table.add_file(&format!("/d{i}/f"), info(i, 1)).expect("file");
        }
        drop(table);
        let reopened = fixture.reopen();
        assert_eq!(reopened.verify().expect("verify"), TableStats { directories: 21, files: 20 });
        assert_eq!(reopened.find_file("/d13/f").expect("find"), info(13, 1));
        assert_eq!(reopened.directory_table().header().expect("header").used_count, 21);
        assert_eq!(reopened.file_table().header().expect("header").used_count, 20);
        assert!(fixture.files.size() > TableHeader::required_size(2, 1));
    }

    #[test]
    fn verify_detects_sibling_corruption() {
        let (_fixture, table) = Fixture::format(&TableGeometry::default());
        let a = table.add_file("/a", FileInfo::EMPTY).expect("a");
        table.add_file("/b", FileInfo::EMPTY).expect("b");
        let mut entry = table.file_table().read(a).expect("read");
        entry.parent = 5;
        table.file_table().write(a, &entry).expect("write");
        assert!(matches!(table.verify(), Err(SaveError::Corruption { .. })));
    }

    #[derive(Debug, Clone)]
    enum Op {
        Add(u8, u8),
        Delete(u8, u8),
        Rename(u8, u8, u8, u8),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0_u8..3, 0_u8..6).prop_map(|(d, f)| Op::Add(d, f)),
            (0_u8..3, 0_u8..6).prop_map(|(d, f)| Op::Delete(d, f)),
            (0_u8..3, 0_u8..6, 0_u8..3, 0_u8..6).prop_map(|(a, b, c, d)| Op::Rename(a, b, c, d)),
        ]
    }

    fn file_path(dir: u8, file: u8) -> String {
        format!("/dir{dir}/file{file}")
    }

    proptest! {
        #[test]
        fn table_matches_model(ops in proptest::collection::vec(op(), 1..40)) {
            let geometry = TableGeometry {
                directory_buckets: 2,
                directory_capacity: 2,
                file_buckets: 3,
                file_capacity: 2,
            };
            let (_fixture, table) = Fixture::format(&geometry);
            for dir in 0..3 {
                table.add_directory(&format!("/dir{dir}")).expect("dir");
            }
            let mut model: BTreeMap<String, FileInfo> = BTreeMap::new();
            let mut next_block = 0_u32;

            for op in ops {
                match op {
                    Op::Add(d, f) => {
                        let path = file_path(d, f);
                        let payload = info(next_block, u64::from(next_block) * 3);
                        next_block += 1;
                        let result = table.add_file(&path, payload);
                        if model.contains_key(&path) {
                            prop_assert!(matches!(result, Err(SaveError::AlreadyExists(_))));
                        } else {
                            result.expect("add");
                            model.insert(path, payload);
                        }
                    }
                    Op::Delete(d, f) => {
                        let path = file_path(d, f);
                        let result = table.delete_file(&path);
                        match model.remove(&path) {
                            Some(payload) => prop_assert_eq!(result.expect("delete"), payload),
                            None => prop_assert!(matches!(result, Err(SaveError::PathNotFound(_)))),
                        }
                    }
                    Op::Rename(a, b, c, d) => {
                        let from = file_path(a, b);
                        let to = file_path(c, d);
                        let result = table.rename_file(&from, &to);
                        if !model.contains_key(&from) {
                            prop_assert!(matches!(result, Err(SaveError::PathNotFound(_))));
                        } else if from != to && model.contains_key(&to) {
                            prop_assert!(matches!(result, Err(SaveError::AlreadyExists(_))));
                        } else {
                            result.expect("rename");
                            if let Some(payload) = model.remove(&from) {
                                model.insert(to, payload);
                            }
                        }
                    }
                }
            }

            for (path, payload) in &model {
                prop_assert_eq!(table.find_file(path).expect("find"), *payload);
            }
            for dir in 0..3_u8 {
                let mut listed: Vec<String> = table
                    .enumerate(&format!("/dir{dir}"), EnumerateMode::Files)
                    .expect("enumerate")
                    .into_iter()
                    .map(|entry| format!("/dir{dir}/{}", entry.name))
                    .collect();
                listed.sort();
                let expected: Vec<String> = model
                    .keys()
                    .filter(|path| path.starts_with(&format!("/dir{dir}/")))
                    .cloned()
                    .collect();
                prop_assert_eq!(listed, expected);
            }
            let stats = table.verify().expect("verify");
            prop_assert_eq!(stats.files as usize, model.len());
        }
    }
}
