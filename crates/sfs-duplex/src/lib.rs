#![forbid(unsafe_code)]
//! Duplex storage: two mirrored copies of every block, one of them live.
//!
//! A [`DuplexBitmap`] holds one bit per block: clear selects copy A, set
//! selects copy B. Writes never touch the live copy. The first write to a
//! block in a generation copies the live block into the spare copy and marks
//! the block dirty; from then on the spare copy is the pending version and
//! reads see it. [`DuplexStorage::commit`] flushes both copies, flips the bit
//! of every dirty block and persists the bitmap. A storage dropped without
//! commit leaves the persisted bitmap untouched, so reopening it reads the
//! pre-write copies.
//!
//! [`HierarchicalDuplexStorage`] stacks layers so that each layer's bitmap is
//! itself duplexed by the layer below.

pub mod hierarchical;

pub use hierarchical::{DuplexLevel, HierarchicalDuplexStorage};

use parking_lot::Mutex;
use sfs_error::{Result, SaveError};
use sfs_storage::{SharedStorage, Storage, check_range};
use sfs_types::{BlockSize, bitmap_flip, bitmap_get, bitmap_len, bitmap_set, u64_to_usize};
use tracing::{debug, trace};

// ── Bitmap ──────────────────────────────────────────────────────────────────

/// Per-block live-copy flags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuplexBitmap {
    bits: Vec<u8>,
    block_count: u64,
}

impl DuplexBitmap {
    /// All blocks select copy A.
    pub fn new(block_count: u64) -> Result<Self> {
        let len = u64_to_usize(bitmap_len(block_count), "duplex_bitmap.len")
            .map_err(|err| SaveError::Format(err.to_string()))?;
        Ok(Self {
            bits: vec![0_u8; len],
            block_count,
        })
    }

    /// Load the bitmap for `block_count` blocks from the start of `storage`.
    pub fn load(storage: &dyn Storage, block_count: u64) -> Result<Self> {
        let mut bitmap = Self::new(block_count)?;
        let needed = bitmap.bits.len() as u64;
        if storage.size() < needed {
            return Err(SaveError::Format(format!(
                "duplex bitmap needs {needed:#x} bytes, storage holds {:#x}",
                storage.size()
            )));
        }
        storage.read_at(0, &mut bitmap.bits)?;
        Ok(bitmap)
    }

    #[must_use]
    pub fn block_count(&self) -> u64 {
        self.block_count
    }

    /// Whether block `block` lives in copy B.
    #[must_use]
    pub fn get(&self, block: u64) -> bool {
        bitmap_get(&self.bits, block)
    }

    pub fn flip(&mut self, block: u64) {
        bitmap_flip(&mut self.bits, block);
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }
}

// ── DuplexStorage ───────────────────────────────────────────────────────────

struct DuplexState {
    bitmap: DuplexBitmap,
    /// Blocks written this generation; their pending copy is `!bitmap`.
    dirty: Vec<u8>,
    dirty_count: u64,
}

/// One duplex layer over two equally sized data copies.
pub struct DuplexStorage {
    data_a: SharedStorage,
    data_b: SharedStorage,
    bitmap_storage: SharedStorage,
    block_size: BlockSize,
    length: u64,
    state: Mutex<DuplexState>,
}

impl std::fmt::Debug for DuplexStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DuplexStorage")
            .field("block_size", &self.block_size)
            .field("length", &self.length)
            .field("dirty_blocks", &self.dirty_block_count())
            .finish_non_exhaustive()
    }
}

impl DuplexStorage {
    /// Open a layer whose live-copy bitmap is read from the start of
    /// `bitmap_storage`.
    pub fn new(
        bitmap_storage: SharedStorage,
        data_a: SharedStorage,
        data_b: SharedStorage,
        block_size: BlockSize,
    ) -> Result<Self> {
        let length = data_a.size();
        if data_b.size() != length {
            return Err(SaveError::Format(format!(
                "duplex copies differ in size: {length:#x} vs {:#x}",
                data_b.size()
            )));
        }
        let block_count = block_size.blocks_for(length);
        let bitmap = DuplexBitmap::load(&*bitmap_storage, block_count)?;
        let dirty = vec![0_u8; bitmap.as_bytes().len()];
        debug!(length, block_size = block_size.get(), block_count, "duplex_open");
        Ok(Self {
            data_a,
            data_b,
            bitmap_storage,
            block_size,
            length,
            state: Mutex::new(DuplexState {
                bitmap,
                dirty,
                dirty_count: 0,
            }),
        })
    }

    #[must_use]
    pub fn block_size(&self) -> BlockSize {
        self.block_size
    }

    #[must_use]
    pub fn block_count(&self) -> u64 {
        self.block_size.blocks_for(self.length)
    }

    /// Blocks written since the last commit.
    #[must_use]
    pub fn dirty_block_count(&self) -> u64 {
        self.state.lock().dirty_count
    }

    /// Copy of the committed bitmap.
    #[must_use]
    pub fn bitmap(&self) -> DuplexBitmap {
        self.state.lock().bitmap.clone()
    }

    fn copy(&self, b_side: bool) -> &SharedStorage {
        if b_side { &self.data_b } else { &self.data_a }
    }

    fn block_len(&self, block: u64) -> u64 {
        let start = block << self.block_size.shift();
        (self.length - start).min(self.block_size.as_u64())
    }

    /// Visit each block touched by `[offset, offset + len)` as
    /// `(block, offset_in_block, buffer_start, span_len)`.
    fn for_each_block(
        &self,
        offset: u64,
        len: usize,
        mut op: impl FnMut(u64, u64, usize, usize) -> Result<()>,
    ) -> Result<()> {
        check_range(offset, len, self.length)?;
        let mut done = 0_usize;
        while done < len {
            let position = offset + done as u64;
            let block = self.block_size.block_of(position);
            let within = self.block_size.offset_in_block(position);
            let room = self.block_len(block) - within;
            let step = usize::try_from(room).map_or(len - done, |room| room.min(len - done));
            op(block, within, done, step)?;
            done += step;
        }
        Ok(())
    }

    /// Commit and persist the bitmap to its own storage.
    pub fn commit(&self) -> Result<()> {
        self.commit_to(&*self.bitmap_storage)
    }

    /// Commit and persist the bitmap to `target` instead of the storage it
    /// was loaded from.
    pub fn commit_to(&self, target: &dyn Storage) -> Result<()> {
        let mut state = self.state.lock();
        self.data_a.flush()?;
        self.data_b.flush()?;

        let mut next = state.bitmap.clone();
        for block in 0..next.block_count() {
            if bitmap_get(&state.dirty, block) {
                next.flip(block);
            }
        }
        target.write_at(0, next.as_bytes())?;
        target.flush()?;

        debug!(flipped = state.dirty_count, "duplex_commit");
        state.bitmap = next;
        state.dirty.fill(0);
        state.dirty_count = 0;
        Ok(())
    }
}

impl Storage for DuplexStorage {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let state = self.state.lock();
        self.for_each_block(offset, buf.len(), |block, within, start, len| {
            let live_b = state.bitmap.get(block) ^ bitmap_get(&state.dirty, block);
            let position = (block << self.block_size.shift()) + within;
            self.copy(live_b)
                .read_at(position, &mut buf[start..start + len])
        })
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        let state = &mut *state;
        self.for_each_block(offset, buf.len(), |block, within, start, len| {
            let committed_b = state.bitmap.get(block);
            let block_start = block << self.block_size.shift();
            if !bitmap_get(&state.dirty, block) {
                let block_len = self.block_len(block);
                if (len as u64) < block_len {
                    let mut scratch = vec![0_u8; u64_to_usize(block_len, "duplex.block_len")
                        .map_err(|err| SaveError::Format(err.to_string()))?];
                    self.copy(committed_b).read_at(block_start, &mut scratch)?;
                    self.copy(!committed_b).write_at(block_start, &scratch)?;
                }
                bitmap_set(&mut state.dirty, block);
                state.dirty_count += 1;
                trace!(block, to_b = !committed_b, "duplex_redirect");
            }
            self.copy(!committed_b)
                .write_at(block_start + within, &buf[start..start + len])
        })
    }

    fn flush(&self) -> Result<()> {
        self.data_a.flush()?;
        self.data_b.flush()
    }

    fn size(&self) -> u64 {
        self.length
    }
}
