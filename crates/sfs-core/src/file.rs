//! File and directory handles.

use crate::Shared;
use sfs_alloc::AllocationTableStorage;
use sfs_dir::{DirectoryEntry, EnumerateMode, FileInfo};
use sfs_error::{Result, SaveError};
use sfs_storage::Storage;
use std::ops::BitOr;
use std::sync::Arc;
use tracing::trace;

/// Access requested when opening a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OpenMode(u8);

impl OpenMode {
    pub const READ: Self = Self(1);
    pub const WRITE: Self = Self(2);
    /// Writes past the end grow the file. Requires `WRITE`.
    pub const APPEND: Self = Self(4);
    pub const READ_WRITE: Self = Self(1 | 2);
    pub const ALL: Self = Self(1 | 2 | 4);

    #[must_use]
    pub const fn bits(self) -> u8 {
        self.0
    }

    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub(crate) fn validate(self) -> Result<()> {
        if self.0 == 0 || self.0 & !Self::ALL.0 != 0 {
            return Err(SaveError::Unsupported(format!("open mode {:#x}", self.0)));
        }
        if self.contains(Self::APPEND) && !self.contains(Self::WRITE) {
            return Err(SaveError::Unsupported("append without write".to_owned()));
        }
        Ok(())
    }
}

impl BitOr for OpenMode {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// An open file.
///
/// Reads and writes stay within the current length unless the handle was
/// opened with [`OpenMode::APPEND`]. Size changes update the file's table
/// entry immediately; like every other change they become durable on
/// commit.
pub struct SaveFile {
    shared: Arc<Shared>,
    path: String,
    mode: OpenMode,
    chain: AllocationTableStorage,
}

impl std::fmt::Debug for SaveFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SaveFile")
            .field("path", &self.path)
            .field("mode", &self.mode)
            .field("chain", &self.chain)
            .finish_non_exhaustive()
    }
}

impl SaveFile {
    pub(crate) fn new(
        shared: Arc<Shared>,
        path: String,
        mode: OpenMode,
        chain: AllocationTableStorage,
    ) -> Self {
        Self {
            shared,
            path,
            mode,
            chain,
        }
    }

    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    #[must_use]
    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    fn require(&self, needed: OpenMode, action: &str) -> Result<()> {
        if self.mode.contains(needed) {
            Ok(())
        } else {
            Err(SaveError::Unsupported(format!(
                "{} not opened for {action}",
                self.path
            )))
        }
    }

    /// Resize the chain and record the result. Caller holds the container lock.
    fn resize_locked(&self, size: u64) -> Result<()> {
        let block_size = self.shared.block_size;
        let grown = block_size
            .blocks_for(size)
            .saturating_sub(block_size.blocks_for(self.chain.length()));
        self.shared.claim_fresh_blocks(grown)?;
        let old_size = self.chain.length();
        self.chain.set_size(size)?;
        let updated = self.shared.tables.update_file(
            &self.path,
            FileInfo {
                start_block: self.chain.head(),
                length: size,
            },
        );
        if updated.is_err() {
            self.chain.set_size(old_size)?;
        }
        updated
    }
}

impl Storage for SaveFile {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.require(OpenMode::READ, "reading")?;
        let _guard = self.shared.header.lock();
        self.chain.read_at(offset, buf)
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        self.require(OpenMode::WRITE, "writing")?;
        let _guard = self.shared.header.lock();
        let size = self.chain.length();
        let end = offset.checked_add(buf.len() as u64).ok_or(SaveError::OutOfRange {
            offset,
            len: buf.len() as u64,
            size,
        })?;
        if end > size {
            if !self.mode.contains(OpenMode::APPEND) {
                return Err(SaveError::OutOfRange {
                    offset,
                    len: buf.len() as u64,
                    size,
                });
            }
            trace!(path = %self.path, old = size, new = end, "file_append_grow");
            self.resize_locked(end)?;
            if let Err(err) = self.chain.write_at(offset, buf) {
                self.resize_locked(size)?;
                return Err(err);
            }
            return Ok(());
        }
        self.chain.write_at(offset, buf)
    }

    fn flush(&self) -> Result<()> {
        self.chain.flush()
    }

    fn size(&self) -> u64 {
        self.chain.length()
    }

    fn set_size(&self, size: u64) -> Result<()> {
        self.require(OpenMode::WRITE, "resizing")?;
        let _guard = self.shared.header.lock();
        self.resize_locked(size)
    }
}

/// Children of a directory as of the moment it was opened.
#[derive(Debug, Clone)]
pub struct SaveDirectory {
    path: String,
    mode: EnumerateMode,
    entries: Vec<DirectoryEntry>,
}

impl SaveDirectory {
    pub(crate) fn new(path: String, mode: EnumerateMode, entries: Vec<DirectoryEntry>) -> Self {
        Self {
            path,
            mode,
            entries,
        }
    }

    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    #[must_use]
    pub fn mode(&self) -> EnumerateMode {
        self.mode
    }

    #[must_use]
    pub fn entries(&self) -> &[DirectoryEntry] {
        &self.entries
    }

    #[must_use]
    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }
}

impl IntoIterator for SaveDirectory {
    type Item = DirectoryEntry;
    type IntoIter = std::vec::IntoIter<DirectoryEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

impl<'a> IntoIterator for &'a SaveDirectory {
    type Item = &'a DirectoryEntry;
    type IntoIter = std::slice::Iter<'a, DirectoryEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}
