//! Stacked duplex layers.
//!
//! Layer 0 loads its bitmap from one of two master bitmaps, chosen by the
//! container's duplex index. Layer `i >= 1` uses layer `i - 1` as its bitmap
//! storage, so every bitmap update is itself a duplexed write. The last layer
//! is the one exposed to callers.
//!
//! Commit runs leaf-to-root. Each layer's commit writes its bitmap into the
//! layer below as pending data. Layer 0 finally writes its bitmap into the
//! *inactive* master, and the returned index must be recorded in the
//! container header as the last atomic step.

use crate::DuplexStorage;
use parking_lot::Mutex;
use sfs_error::{Result, SaveError};
use sfs_storage::{SharedStorage, Storage};
use sfs_types::BlockSize;
use std::sync::Arc;
use tracing::debug;

/// Geometry of one duplex layer.
#[derive(Clone)]
pub struct DuplexLevel {
    pub data_a: SharedStorage,
    pub data_b: SharedStorage,
    pub block_size: BlockSize,
}

impl std::fmt::Debug for DuplexLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DuplexLevel")
            .field("size", &self.data_a.size())
            .field("block_size", &self.block_size)
            .finish_non_exhaustive()
    }
}

pub struct HierarchicalDuplexStorage {
    masters: [SharedStorage; 2],
    active_master: Mutex<u8>,
    layers: Vec<Arc<DuplexStorage>>,
}

impl std::fmt::Debug for HierarchicalDuplexStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HierarchicalDuplexStorage")
            .field("active_master", &*self.active_master.lock())
            .field("layers", &self.layers)
            .finish_non_exhaustive()
    }
}

impl HierarchicalDuplexStorage {
    /// Compose `levels` bottom-up over the two master bitmaps.
    pub fn new(masters: [SharedStorage; 2], active_master: u8, levels: Vec<DuplexLevel>) -> Result<Self> {
        if active_master > 1 {
            return Err(SaveError::Format(format!(
                "duplex index {active_master} is not 0 or 1"
            )));
        }
        if levels.is_empty() {
            return Err(SaveError::Format("duplex hierarchy has no layers".to_owned()));
        }

        let mut layers: Vec<Arc<DuplexStorage>> = Vec::with_capacity(levels.len());
        for level in levels {
            let bitmap_storage: SharedStorage = match layers.last() {
                Some(below) => Arc::clone(below) as SharedStorage,
                None => Arc::clone(&masters[usize::from(active_master)]),
            };
            let layer = DuplexStorage::new(bitmap_storage, level.data_a, level.data_b, level.block_size)?;
            layers.push(Arc::new(layer));
        }
        debug!(layers = layers.len(), active_master, "duplex_hierarchy_open");
        Ok(Self {
            masters,
            active_master: Mutex::new(active_master),
            layers,
        })
    }

    /// Master bitmap index currently in effect.
    #[must_use]
    pub fn active_master(&self) -> u8 {
        *self.active_master.lock()
    }

    #[must_use]
    pub fn layers(&self) -> &[Arc<DuplexStorage>] {
        &self.layers
    }

    fn exposed(&self) -> &DuplexStorage {
        // `new` rejects an empty hierarchy.
        &self.layers[self.layers.len() - 1]
    }

    /// Commit every layer leaf-to-root and return the new master index.
    ///
    /// The caller persists the returned index; until it does, a reopen
    /// selects the previous master and with it the previous state of every
    /// layer.
    pub fn commit(&self) -> Result<u8> {
        let mut active = self.active_master.lock();
        for layer in self.layers.iter().skip(1).rev() {
            layer.commit()?;
        }
        let next = 1 - *active;
        self.layers[0].commit_to(&*self.masters[usize::from(next)])?;
        debug!(from = *active, to = next, "duplex_master_flip");
        *active = next;
        Ok(next)
    }
}

impl Storage for HierarchicalDuplexStorage {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.exposed().read_at(offset, buf)
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        self.exposed().write_at(offset, buf)
    }

    fn flush(&self) -> Result<()> {
        for layer in self.layers.iter().rev() {
            layer.flush()?;
        }
        Ok(())
    }

    fn size(&self) -> u64 {
        self.exposed().size()
    }
}
