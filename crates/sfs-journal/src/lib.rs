#![forbid(unsafe_code)]
//! Journal storage: copy-on-write logical block redirection.
//!
//! The logical data space of `main_block_count` blocks is backed by a
//! physical space of `main_block_count + journal_block_count` blocks. The
//! first write to a logical block in a generation moves it onto an
//! unassigned physical block (copying the old contents for partial writes),
//! so the committed version stays intact. Superseded physical blocks become
//! reusable only at [`JournalStorage::commit`], once the new map is written.

pub mod map;

pub use map::{JournalMap, JournalMapLayout, MAPPED_FLAG, table_size};

use parking_lot::Mutex;
use sfs_error::{Result, SaveError};
use sfs_storage::{SharedStorage, Storage, check_range};
use sfs_types::{BlockSize, u64_to_usize};
use tracing::{debug, trace};

struct JournalState {
    map: JournalMap,
    /// Physical blocks replaced this generation, reclaimed at commit.
    superseded: Vec<u32>,
}

/// Logical byte storage over a journaled physical block space.
pub struct JournalStorage {
    base: SharedStorage,
    meta: SharedStorage,
    map_layout: JournalMapLayout,
    block_size: BlockSize,
    state: Mutex<JournalState>,
}

impl std::fmt::Debug for JournalStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("JournalStorage")
            .field("block_size", &self.block_size)
            .field("main_blocks", &state.map.main_block_count())
            .field("physical_blocks", &state.map.physical_block_count())
            .field("pending", &state.superseded.len())
            .finish_non_exhaustive()
    }
}

impl JournalStorage {
    /// Mount: rebuild the map from `meta` and validate it against `base`.
    pub fn open(
        base: SharedStorage,
        meta: SharedStorage,
        map_layout: JournalMapLayout,
        block_size: BlockSize,
        main_block_count: u32,
        journal_block_count: u32,
    ) -> Result<Self> {
        let map = JournalMap::read_mapping_entries(
            &*meta,
            &map_layout,
            main_block_count,
            journal_block_count,
        )?;
        Self::with_map(base, meta, map_layout, block_size, map)
    }

    /// Initialize an identity map in `meta` and return the storage.
    pub fn format(
        base: SharedStorage,
        meta: SharedStorage,
        map_layout: JournalMapLayout,
        block_size: BlockSize,
        main_block_count: u32,
        journal_block_count: u32,
    ) -> Result<Self> {
        let map = JournalMap::identity(main_block_count, journal_block_count)?;
        map.write(&*meta, &map_layout)?;
        debug!(
            target: "sfs::journal",
            main_block_count,
            journal_block_count,
            "journal_format"
        );
        Self::with_map(base, meta, map_layout, block_size, map)
    }

    fn with_map(
        base: SharedStorage,
        meta: SharedStorage,
        map_layout: JournalMapLayout,
        block_size: BlockSize,
        map: JournalMap,
    ) -> Result<Self> {
        let needed = u64::from(map.physical_block_count()) * block_size.as_u64();
        if base.size() < needed {
            return Err(SaveError::Format(format!(
                "journal needs {needed:#x} physical bytes, base holds {:#x}",
                base.size()
            )));
        }
        Ok(Self {
            base,
            meta,
            map_layout,
            block_size,
            state: Mutex::new(JournalState {
                map,
                superseded: Vec::new(),
            }),
        })
    }

    #[must_use]
    pub fn block_size(&self) -> BlockSize {
        self.block_size
    }

    /// Snapshot of the current map.
    #[must_use]
    pub fn map(&self) -> JournalMap {
        self.state.lock().map.clone()
    }

    /// Logical blocks redirected since the last commit.
    #[must_use]
    pub fn pending_block_count(&self) -> usize {
        self.state.lock().superseded.len()
    }

    fn physical_offset(&self, physical: u32, within: u64) -> u64 {
        (u64::from(physical) << self.block_size.shift()) + within
    }

    fn for_each_block(
        &self,
        offset: u64,
        len: usize,
        size: u64,
        mut op: impl FnMut(u32, u64, usize, usize) -> Result<()>,
    ) -> Result<()> {
        check_range(offset, len, size)?;
        let mut done = 0_usize;
        while done < len {
            let position = offset + done as u64;
            let logical = u32::try_from(self.block_size.block_of(position)).map_err(|_| {
                SaveError::OutOfRange {
                    offset: position,
                    len: len as u64,
                    size,
                }
            })?;
            let within = self.block_size.offset_in_block(position);
            let room = self.block_size.as_u64() - within;
            let step = usize::try_from(room).map_or(len - done, |room| room.min(len - done));
            op(logical, within, done, step)?;
            done += step;
        }
        Ok(())
    }

    /// Let this generation overwrite the logical blocks covering
    /// `[offset, offset + len)` in place.
    ///
    /// Only sound when the committed state does not reference those blocks,
    /// e.g. allocation blocks that were free at the last commit. Claimed
    /// blocks cost no journal space until the next commit.
    pub fn claim_unreferenced(&self, offset: u64, len: u64) -> Result<()> {
        let mut state = self.state.lock();
        let state = &mut *state;
        let size = u64::from(state.map.main_block_count()) * self.block_size.as_u64();
        let len = u64_to_usize(len, "journal.claim_len")
            .map_err(|err| SaveError::Format(err.to_string()))?;
        let mut claimed = 0_u32;
        self.for_each_block(offset, len, size, |logical, _, _, _| {
            if state.map.claim(logical) {
                claimed += 1;
            }
            Ok(())
        })?;
        trace!(target: "sfs::journal", offset, claimed, "journal_claim");
        Ok(())
    }

    /// Flush the physical space, release superseded blocks and persist the
    /// map. The metadata storage is committed by its owner afterwards.
    pub fn commit(&self) -> Result<()> {
        let mut state = self.state.lock();
        self.base.flush()?;
        let reclaimed = state.superseded.len();
        for physical in std::mem::take(&mut state.superseded) {
            state.map.release(physical);
        }
        state.map.write(&*self.meta, &self.map_layout)?;
        state.map.clear_updated();
        debug!(
            target: "sfs::journal",
            reclaimed,
            unassigned = state.map.unassigned_count(),
            "journal_commit"
        );
        Ok(())
    }
}

impl Storage for JournalStorage {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let state = self.state.lock();
        let size = u64::from(state.map.main_block_count()) * self.block_size.as_u64();
        self.for_each_block(offset, buf.len(), size, |logical, within, start, len| {
            let physical = state
                .map
                .physical_of(logical)
                .ok_or_else(|| SaveError::corruption(u64::from(logical), "unmapped journal block"))?;
            self.base
                .read_at(self.physical_offset(physical, within), &mut buf[start..start + len])
        })
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        let state = &mut *state;
        let size = u64::from(state.map.main_block_count()) * self.block_size.as_u64();
        let mut needed = 0_u64;
        self.for_each_block(offset, buf.len(), size, |logical, _, _, _| {
            if !state.map.is_updated(logical) {
                needed += 1;
            }
            Ok(())
        })?;
        if needed > state.map.unassigned_count() {
            debug!(
                target: "sfs::journal",
                needed,
                unassigned = state.map.unassigned_count(),
                "journal_write_rejected"
            );
            return Err(SaveError::JournalFull);
        }
        self.for_each_block(offset, buf.len(), size, |logical, within, start, len| {
            if !state.map.is_updated(logical) {
                let (old, new) = state.map.redirect(logical)?;
                if (len as u64) < self.block_size.as_u64() {
                    let block_len = u64_to_usize(self.block_size.as_u64(), "journal.block_size")
                        .map_err(|err| SaveError::Format(err.to_string()))?;
                    let mut scratch = vec![0_u8; block_len];
                    self.base.read_at(self.physical_offset(old, 0), &mut scratch)?;
                    self.base.write_at(self.physical_offset(new, 0), &scratch)?;
                }
                state.superseded.push(old);
                trace!(
                    target: "sfs::journal",
                    logical,
                    old,
                    new,
                    "journal_redirect"
                );
            }
            let physical = state
                .map
                .physical_of(logical)
                .ok_or_else(|| SaveError::corruption(u64::from(logical), "unmapped journal block"))?;
            self.base
                .write_at(self.physical_offset(physical, within), &buf[start..start + len])
        })
    }

    fn flush(&self) -> Result<()> {
        self.base.flush()
    }

    fn size(&self) -> u64 {
        u64::from(self.state.lock().map.main_block_count()) * self.block_size.as_u64()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use sfs_storage::MemoryStorage;
    use std::sync::Arc;

    const BLOCK: u32 = 0x40;
    const MAIN: u32 = 4;
    const SPARE: u32 = 2;

    struct Fixture {
        base: MemoryStorage,
        meta: MemoryStorage,
    }

    fn map_layout() -> JournalMapLayout {
        JournalMapLayout {
            table_offset: 0,
            physical_bitmap_offset: 0x20,
            virtual_bitmap_offset: 0x28,
            free_bitmap_offset: 0x30,
        }
    }

    impl Fixture {
        fn format() -> (Self, JournalStorage) {
            let fixture = Self {
                base: MemoryStorage::from_vec(
                    (0..(MAIN + SPARE) * BLOCK)
                        .map(|i| (i / BLOCK) as u8)
                        .collect(),
                ),
                meta: MemoryStorage::new(0x40),
            };
            let journal = JournalStorage::format(
                Arc::new(fixture.base.clone()),
                Arc::new(fixture.meta.clone()),
                map_layout(),
                BlockSize::new(BLOCK).expect("block size"),
                MAIN,
                SPARE,
            )
            .expect("format");
            (fixture, journal)
        }

        fn reopen(&self) -> JournalStorage {
            JournalStorage::open(
                Arc::new(self.base.clone()),
                Arc::new(self.meta.clone()),
                map_layout(),
                BlockSize::new(BLOCK).expect("block size"),
                MAIN,
                SPARE,
            )
            .expect("open")
        }
    }

    fn read(storage: &dyn Storage, offset: u64, len: usize) -> Vec<u8> {
        let mut out = vec![0_u8; len];
        storage.read_at(offset, &mut out).expect("read");
        out
    }

    #[test]
    fn identity_reads_physical_blocks() {
        let (_fixture, journal) = Fixture::format();
        assert_eq!(journal.size(), u64::from(MAIN * BLOCK));
        assert_eq!(read(&journal, 0x3F, 2), vec![0, 1]);
        assert!(matches!(
            journal.read_at(u64::from(MAIN * BLOCK), &mut [0_u8; 1]),
            Err(SaveError::OutOfRange { .. })
        ));
    }

    #[test]
    fn partial_write_redirects_and_preserves_old_block() {
        let (fixture, journal) = Fixture::format();
        journal.write_at(0x42, b"xy").expect("write");
        assert_eq!(journal.map().physical_of(1), Some(MAIN));

        let raw = fixture.base.to_vec();
        // Old physical block 1 untouched, new block 4 = copy of old + write.
        assert!(raw[0x40..0x80].iter().all(|b| *b == 1));
        let new = &raw[(MAIN * BLOCK) as usize..((MAIN + 1) * BLOCK) as usize];
        assert_eq!(&new[..2], &[1, 1]);
        assert_eq!(&new[2..4], b"xy");
        assert_eq!(new[4], 1);
        assert_eq!(read(&journal, 0x41, 4), vec![1, b'x', b'y', 1]);
    }

    #[test]
    fn same_generation_writes_go_in_place() {
        let (_fixture, journal) = Fixture::format();
        journal.write_at(0, b"a").expect("first");
        journal.write_at(1, b"b").expect("second");
        assert_eq!(journal.pending_block_count(), 1);
        assert_eq!(journal.map().unassigned_count(), u64::from(SPARE) - 1);
        assert_eq!(read(&journal, 0, 2), b"ab".to_vec());
    }

    #[test]
    fn journal_full_until_commit() {
        let (_fixture, journal) = Fixture::format();
        journal.write_at(0x00, b"a").expect("block 0");
        journal.write_at(0x40, b"b").expect("block 1");
        assert!(matches!(
            journal.write_at(0x80, b"c"),
            Err(SaveError::JournalFull)
        ));
        journal.commit().expect("commit");
        assert_eq!(journal.pending_block_count(), 0);
        journal.write_at(0x80, b"c").expect("block 2 after commit");
        assert_eq!(read(&journal, 0x80, 1), b"c".to_vec());
    }

    #[test]
    fn write_beyond_capacity_changes_nothing() {
        let (fixture, journal) = Fixture::format();
        let before = fixture.base.to_vec();
        assert!(matches!(
            journal.write_at(0, &[0xEE; 3 * BLOCK as usize]),
            Err(SaveError::JournalFull)
        ));
        assert_eq!(fixture.base.to_vec(), before);
        assert_eq!(journal.pending_block_count(), 0);
        assert_eq!(journal.map().unassigned_count(), u64::from(SPARE));
        journal
            .write_at(0x40, &[0xEE; 2 * BLOCK as usize])
            .expect("two blocks fit");
    }

    #[test]
    fn claimed_blocks_are_written_in_place() {
        let (fixture, journal) = Fixture::format();
        journal
            .claim_unreferenced(0x80, u64::from(2 * BLOCK))
            .expect("claim");
        journal.write_at(0x82, b"zz").expect("partial write");
        journal.write_at(0xC0, &[0xEE; 0x40]).expect("full write");
        assert_eq!(journal.pending_block_count(), 0);
        assert_eq!(journal.map().physical_of(2), Some(2));
        assert_eq!(journal.map().unassigned_count(), u64::from(SPARE));
        assert_eq!(&fixture.base.to_vec()[0x82..0x84], b"zz");

        journal.commit().expect("commit");
        journal.write_at(0x80, b"a").expect("write after commit");
        assert_eq!(journal.map().physical_of(2), Some(MAIN));
        assert_eq!(read(&journal, 0x80, 4), vec![b'a', 2, b'z', b'z']);
    }

    #[test]
    fn uncommitted_writes_vanish_on_reopen() {
        let (fixture, journal) = Fixture::format();
        journal.write_at(0xC0, &[0xEE; 0x40]).expect("write");
        drop(journal);
        let reopened = fixture.reopen();
        assert_eq!(read(&reopened, 0xC0, 0x40), vec![3; 0x40]);
    }

    #[test]
    fn committed_writes_survive_reopen() {
        let (fixture, journal) = Fixture::format();
        journal.write_at(0xC0, &[0xEE; 0x40]).expect("write");
        journal.commit().expect("commit");
        drop(journal);
        let reopened = fixture.reopen();
        assert_eq!(read(&reopened, 0xC0, 0x40), vec![0xEE; 0x40]);
        let map = reopened.map();
        assert_eq!(map.physical_of(3), Some(MAIN));
        assert!(map.is_unassigned(3));
    }

    #[test]
    fn rejects_short_base() {
        let result = JournalStorage::format(
            Arc::new(MemoryStorage::new((MAIN * BLOCK) as usize)),
            Arc::new(MemoryStorage::new(0x40)),
            map_layout(),
            BlockSize::new(BLOCK).expect("block size"),
            MAIN,
            SPARE,
        );
        assert!(matches!(result, Err(SaveError::Format(_))));
    }

    proptest! {
        #[test]
        fn model_matches_across_commits(
            writes in proptest::collection::vec((0_u64..0x100, 1_usize..0x20, any::<u8>(), any::<bool>()), 1..16),
        ) {
            let (fixture, journal) = Fixture::format();
            let mut model: Vec<u8> = read(&journal, 0, 0x100);
            let mut committed = model.clone();
            for (offset, len, value, commit) in writes {
                let len = len.min(0x100 - offset as usize);
                match journal.write_at(offset, &vec![value; len]) {
                    Ok(()) => model[offset as usize..offset as usize + len].fill(value),
                    Err(SaveError::JournalFull) => {
                        prop_assert_eq!(read(&journal, 0, 0x100), model.clone());
                    }
                    Err(other) => return Err(TestCaseError::fail(format!("{other:?}"))),
                }
                if commit {
                    journal.commit().expect("commit");
                    committed.clone_from(&model);
                }
            }
            prop_assert_eq!(read(&journal, 0, 0x100), model);
            drop(journal);
            prop_assert_eq!(read(&fixture.reopen(), 0, 0x100), committed);
        }
    }
}
