#![forbid(unsafe_code)]
//! Byte-addressed storage layer.
//!
//! Provides the [`Storage`] trait every SaveFS layer is built on, plus the
//! leaf storages: an in-memory buffer, a host file, a fixed window into
//! another storage, and a read-only view.
//!
//! All methods take `&self` with explicit offsets (pread/pwrite semantics).
//! Implementations that cache state keep it behind a lock, so every storage
//! is `Send + Sync`.

use parking_lot::Mutex;
use sfs_error::{Result, SaveError};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use tracing::trace;

/// Random-access byte storage.
pub trait Storage: Send + Sync {
    /// Read exactly `buf.len()` bytes from `offset` into `buf`.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Write all bytes in `buf` to `offset`.
    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()>;

    /// Flush pending writes to stable storage.
    fn flush(&self) -> Result<()>;

    /// Total length in bytes.
    fn size(&self) -> u64;

    /// Resize the storage. Fixed-size storages reject this.
    fn set_size(&self, _size: u64) -> Result<()> {
        Err(SaveError::Unsupported(
            "storage cannot be resized".to_owned(),
        ))
    }
}

/// Shared handle used wherever one storage backs several layers.
pub type SharedStorage = Arc<dyn Storage>;

impl<S: Storage + ?Sized> Storage for Arc<S> {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        (**self).read_at(offset, buf)
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        (**self).write_at(offset, buf)
    }

    fn flush(&self) -> Result<()> {
        (**self).flush()
    }

    fn size(&self) -> u64 {
        (**self).size()
    }

    fn set_size(&self, size: u64) -> Result<()> {
        (**self).set_size(size)
    }
}

/// Validate that `[offset, offset + len)` lies inside `[0, size)`.
///
/// Returns the exclusive end offset. Ranges are never clamped.
pub fn check_range(offset: u64, len: usize, size: u64) -> Result<u64> {
    let len = u64::try_from(len).map_err(|_| SaveError::OutOfRange {
        offset,
        len: u64::MAX,
        size,
    })?;
    let out_of_range = SaveError::OutOfRange { offset, len, size };
    let end = offset.checked_add(len).ok_or(out_of_range)?;
    if end > size {
        return Err(SaveError::OutOfRange { offset, len, size });
    }
    Ok(end)
}

fn to_usize(value: u64) -> Result<usize> {
    usize::try_from(value)
        .map_err(|_| SaveError::Unsupported(format!("offset {value:#x} does not fit usize")))
}

// ── MemoryStorage ───────────────────────────────────────────────────────────

/// Growable in-memory storage.
///
/// Clones share the same buffer, which lets tests keep a handle to the raw
/// bytes underneath a layered stack.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl MemoryStorage {
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self::from_vec(vec![0_u8; len])
    }

    #[must_use]
    pub fn from_vec(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Arc::new(Mutex::new(bytes)),
        }
    }

    /// Copy out the current contents.
    #[must_use]
    pub fn to_vec(&self) -> Vec<u8> {
        self.bytes.lock().clone()
    }
}

impl Storage for MemoryStorage {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let bytes = self.bytes.lock();
        let end = check_range(offset, buf.len(), bytes.len() as u64)?;
        buf.copy_from_slice(&bytes[to_usize(offset)?..to_usize(end)?]);
        drop(bytes);
        Ok(())
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let mut bytes = self.bytes.lock();
        let end = check_range(offset, buf.len(), bytes.len() as u64)?;
        bytes[to_usize(offset)?..to_usize(end)?].copy_from_slice(buf);
        drop(bytes);
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }

    fn size(&self) -> u64 {
        self.bytes.lock().len() as u64
    }

    fn set_size(&self, size: u64) -> Result<()> {
        self.bytes.lock().resize(to_usize(size)?, 0);
        Ok(())
    }
}

// ── FileStorage ─────────────────────────────────────────────────────────────

/// Host-file storage using positional I/O.
///
/// This uses `std::os::unix::fs::FileExt`, which does not require a shared
/// seek position.
#[derive(Debug, Clone)]
pub struct FileStorage {
    file: Arc<File>,
    len: Arc<Mutex<u64>>,
    writable: bool,
}

impl FileStorage {
    /// Open read-write when permitted, falling back to read-only.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let (file, writable) = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())
            .map(|file| (file, true))
            .or_else(|_| {
                OpenOptions::new()
                    .read(true)
                    .open(path.as_ref())
                    .map(|file| (file, false))
            })?;
        Self::from_file(file, writable)
    }

    /// Open strictly read-only.
    pub fn open_read_only(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new().read(true).open(path.as_ref())?;
        Self::from_file(file, false)
    }

    /// Create (or truncate) a file of `len` zero bytes.
    pub fn create(path: impl AsRef<Path>, len: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())?;
        file.set_len(len)?;
        Self::from_file(file, true)
    }

    fn from_file(file: File, writable: bool) -> Result<Self> {
        let len = file.metadata()?.len();
        Ok(Self {
            file: Arc::new(file),
            len: Arc::new(Mutex::new(len)),
            writable,
        })
    }

    #[must_use]
    pub fn is_writable(&self) -> bool {
        self.writable
    }
}

impl Storage for FileStorage {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_range(offset, buf.len(), self.size())?;
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(SaveError::ReadOnly);
        }
        check_range(offset, buf.len(), self.size())?;
        self.file.write_all_at(buf, offset)?;
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        if self.writable {
            self.file.sync_all()?;
        }
        Ok(())
    }

    fn size(&self) -> u64 {
        *self.len.lock()
    }

    fn set_size(&self, size: u64) -> Result<()> {
        if !self.writable {
            return Err(SaveError::ReadOnly);
        }
        let mut len = self.len.lock();
        self.file.set_len(size)?;
        *len = size;
        Ok(())
    }
}

// ── SubStorage ──────────────────────────────────────────────────────────────

/// A fixed `[offset, offset + len)` window of another storage.
#[derive(Clone)]
pub struct SubStorage {
    inner: SharedStorage,
    offset: u64,
    len: u64,
}

impl std::fmt::Debug for SubStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubStorage")
            .field("offset", &self.offset)
            .field("len", &self.len)
            .finish_non_exhaustive()
    }
}

impl SubStorage {
    /// Window `inner` at `[offset, offset + len)`, which must lie inside it.
    pub fn new(inner: SharedStorage, offset: u64, len: u64) -> Result<Self> {
        let end = offset.checked_add(len).ok_or(SaveError::OutOfRange {
            offset,
            len,
            size: inner.size(),
        })?;
        if end > inner.size() {
            return Err(SaveError::OutOfRange {
                offset,
                len,
                size: inner.size(),
            });
        }
        trace!(offset, len, "sub_storage");
        Ok(Self { inner, offset, len })
    }

    #[must_use]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    #[must_use]
    pub fn inner(&self) -> &SharedStorage {
        &self.inner
    }
}

impl Storage for SubStorage {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_range(offset, buf.len(), self.len)?;
        self.inner.read_at(self.offset + offset, buf)
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        check_range(offset, buf.len(), self.len)?;
        self.inner.write_at(self.offset + offset, buf)
    }

    fn flush(&self) -> Result<()> {
        self.inner.flush()
    }

    fn size(&self) -> u64 {
        self.len
    }
}

// ── ReadOnlyStorage ─────────────────────────────────────────────────────────

/// Read-only view of another storage; writes fail with `ReadOnly`.
#[derive(Clone)]
pub struct ReadOnlyStorage {
    inner: SharedStorage,
}

impl ReadOnlyStorage {
    #[must_use]
    pub fn new(inner: SharedStorage) -> Self {
        Self { inner }
    }
}

impl Storage for ReadOnlyStorage {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.inner.read_at(offset, buf)
    }

    fn write_at(&self, _offset: u64, _buf: &[u8]) -> Result<()> {
        Err(SaveError::ReadOnly)
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }

    fn size(&self) -> u64 {
        self.inner.size()
    }
}

/// Fill `[offset, offset + len)` of `storage` with zeros in bounded chunks.
pub fn zero_fill(storage: &dyn Storage, offset: u64, len: u64) -> Result<()> {
    const CHUNK: u64 = 0x4000;
    let zeros = [0_u8; 0x4000];
    let mut done = 0_u64;
    while done < len {
        let step = (len - done).min(CHUNK);
        storage.write_at(offset + done, &zeros[..to_usize(step)?])?;
        done += step;
    }
    Ok(())
}
