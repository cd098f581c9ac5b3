#![forbid(unsafe_code)]
//! Linked-list block allocation.
//!
//! ## Design
//!
//! The allocation table is an array of 8-byte `{prev, next}` entries stored
//! in a byte storage:
//!
//! 1. **Entry 0** anchors the free list. Its `next` is the first free entry.
//! 2. **Entry `b + 1`** describes data block `b`.
//! 3. A link value of 0 terminates a list. Entry 0 is never a chain member,
//!    so 0 is unambiguous.
//!
//! Every chain (a file's blocks, a table's blocks, the free list) is a
//! doubly-linked list through these entries. The public API speaks block
//! indices and uses [`END_OF_CHAIN`] for "no block".
//!
//! [`AllocationTableStorage`] presents one chain as a contiguous byte range.

pub mod storage;

pub use storage::AllocationTableStorage;

use parking_lot::Mutex;
use sfs_error::{Result, SaveError};
use sfs_ondisk::{AllocationEntry, format_error};
use sfs_storage::{SharedStorage, Storage};
use sfs_types::{ALLOCATION_ENTRY_SIZE, END_OF_CHAIN};
use tracing::{debug, trace};

const FREE_LIST_ANCHOR: u32 = 0;
const LIST_END: u32 = 0;

/// On-disk allocation table.
pub struct AllocationTable {
    storage: SharedStorage,
    block_count: u32,
    /// Serializes multi-entry mutations.
    mutate: Mutex<()>,
}

impl std::fmt::Debug for AllocationTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AllocationTable")
            .field("block_count", &self.block_count)
            .finish_non_exhaustive()
    }
}

/// Bytes needed for a table describing `block_count` blocks.
#[must_use]
pub fn table_size(block_count: u32) -> u64 {
    (u64::from(block_count) + 1) * ALLOCATION_ENTRY_SIZE as u64
}

impl AllocationTable {
    /// Open a table of `block_count` blocks stored at the start of `storage`.
    pub fn open(storage: SharedStorage, block_count: u32) -> Result<Self> {
        if block_count == u32::MAX {
            return Err(SaveError::Format(
                "allocation table block count collides with END_OF_CHAIN".to_owned(),
            ));
        }
        let needed = table_size(block_count);
        if storage.size() < needed {
            return Err(SaveError::Format(format!(
                "allocation table needs {needed:#x} bytes, storage holds {:#x}",
                storage.size()
            )));
        }
        Ok(Self {
            storage,
            block_count,
            mutate: Mutex::new(()),
        })
    }

    /// Write a fresh table where every block is on the free list, in order.
    pub fn format(storage: SharedStorage, block_count: u32) -> Result<Self> {
        let table = Self::open(storage, block_count)?;
        let mut bytes = Vec::with_capacity(ALLOCATION_ENTRY_SIZE * (block_count as usize + 1));
        bytes.extend_from_slice(
            &AllocationEntry {
                prev: LIST_END,
                next: if block_count == 0 { LIST_END } else { 1 },
            }
            .to_bytes(),
        );
        for entry in 1..=block_count {
            let next = if entry == block_count { LIST_END } else { entry + 1 };
            bytes.extend_from_slice(
                &AllocationEntry {
                    prev: entry - 1,
                    next,
                }
                .to_bytes(),
            );
        }
        table.storage.write_at(0, &bytes)?;
        debug!(block_count, "allocation_table_format");
        Ok(table)
    }

    #[must_use]
    pub fn block_count(&self) -> u32 {
        self.block_count
    }

    fn read_entry(&self, index: u32) -> Result<AllocationEntry> {
        let mut raw = [0_u8; ALLOCATION_ENTRY_SIZE];
        self.storage
            .read_at(u64::from(index) * ALLOCATION_ENTRY_SIZE as u64, &mut raw)?;
        AllocationEntry::parse(&raw).map_err(format_error)
    }

    fn write_entry(&self, index: u32, entry: AllocationEntry) -> Result<()> {
        self.storage
            .write_at(u64::from(index) * ALLOCATION_ENTRY_SIZE as u64, &entry.to_bytes())
    }

    /// Entry index of block `block`, validating the range.
    fn entry_of(&self, block: u32) -> Result<u32> {
        if block >= self.block_count {
            return Err(SaveError::OutOfRange {
                offset: u64::from(block),
                len: 1,
                size: u64::from(self.block_count),
            });
        }
        Ok(block + 1)
    }

    fn check_link(&self, from: u32, link: u32) -> Result<u32> {
        if link > self.block_count {
            return Err(SaveError::corruption(
                u64::from(from) * ALLOCATION_ENTRY_SIZE as u64,
                format!("allocation entry {from} links to {link}, past {} blocks", self.block_count),
            ));
        }
        Ok(link)
    }

    /// Walk a list starting at entry `first`, calling `visit` for each entry.
    /// Bounded by the block count; a longer walk is a cycle.
    fn walk(&self, first: u32, mut visit: impl FnMut(u32, AllocationEntry) -> Result<bool>) -> Result<()> {
        let mut current = first;
        let mut previous = LIST_END;
        let mut steps = 0_u32;
        while current != LIST_END {
            if steps >= self.block_count {
                return Err(SaveError::corruption(
                    u64::from(current) * ALLOCATION_ENTRY_SIZE as u64,
                    format!("allocation chain from entry {first} exceeds {} blocks", self.block_count),
                ));
            }
            let entry = self.read_entry(current)?;
            if steps > 0 && entry.prev != previous {
                return Err(SaveError::corruption(
                    u64::from(current) * ALLOCATION_ENTRY_SIZE as u64,
                    format!(
                        "allocation entry {current} has prev {} but follows {previous}",
                        entry.prev
                    ),
                ));
            }
            if !visit(current, entry)? {
                return Ok(());
            }
            previous = current;
            current = self.check_link(current, entry.next)?;
            steps += 1;
        }
        Ok(())
    }

    /// Number of free blocks.
    pub fn free_list_length(&self) -> Result<u32> {
        let anchor = self.read_entry(FREE_LIST_ANCHOR)?;
        let first = self.check_link(FREE_LIST_ANCHOR, anchor.next)?;
        let mut count = 0_u32;
        self.walk(first, |_, _| {
            count += 1;
            Ok(true)
        })?;
        Ok(count)
    }

    /// Free blocks in free-list order.
    pub fn free_blocks(&self) -> Result<Vec<u32>> {
        let anchor = self.read_entry(FREE_LIST_ANCHOR)?;
        let first = self.check_link(FREE_LIST_ANCHOR, anchor.next)?;
        let mut blocks = Vec::new();
        self.walk(first, |index, _| {
            blocks.push(index - 1);
            Ok(true)
        })?;
        Ok(blocks)
    }

    /// Blocks of the chain starting at `start`, in order.
    pub fn chain_blocks(&self, start: u32) -> Result<Vec<u32>> {
        if start == END_OF_CHAIN {
            return Ok(Vec::new());
        }
        let first = self.entry_of(start)?;
        let head = self.read_entry(first)?;
        if head.prev != LIST_END {
            return Err(SaveError::corruption(
                u64::from(first) * ALLOCATION_ENTRY_SIZE as u64,
                format!("block {start} is not a chain head"),
            ));
        }
        let mut blocks = Vec::new();
        self.walk(first, |index, _| {
            blocks.push(index - 1);
            Ok(true)
        })?;
        Ok(blocks)
    }

    /// Number of blocks in the chain starting at `start`.
    pub fn chain_length(&self, start: u32) -> Result<u32> {
        let blocks = self.chain_blocks(start)?;
        u32::try_from(blocks.len()).map_err(|_| SaveError::corruption(0, "chain length overflow"))
    }

    /// Block at position `index` of the chain, walking from `from_block`
    /// which sits at position `from_index`.
    pub fn seek(&self, from_block: u32, from_index: u64, index: u64) -> Result<u32> {
        let mut current = self.entry_of(from_block)?;
        let mut position = from_index;
        let mut steps = 0_u64;
        while position < index {
            if steps >= u64::from(self.block_count) {
                return Err(SaveError::corruption(
                    u64::from(current) * ALLOCATION_ENTRY_SIZE as u64,
                    "allocation chain cycle during seek",
                ));
            }
            let entry = self.read_entry(current)?;
            let next = self.check_link(current, entry.next)?;
            if next == LIST_END {
                return Err(SaveError::OutOfRange {
                    offset: index,
                    len: 1,
                    size: position + 1,
                });
            }
            current = next;
            position += 1;
            steps += 1;
        }
        trace!(from_block, from_index, index, block = current - 1, "allocation_seek");
        Ok(current - 1)
    }

    /// Take the first `count` free blocks as a new chain and return its head.
    ///
    /// `count == 0` yields [`END_OF_CHAIN`]. If fewer than `count` blocks are
    /// free, fails with `AllocationTableFull` without touching the table.
    pub fn allocate(&self, count: u32) -> Result<u32> {
        if count == 0 {
            return Ok(END_OF_CHAIN);
        }
        let _guard = self.mutate.lock();
        let anchor = self.read_entry(FREE_LIST_ANCHOR)?;
        let first = self.check_link(FREE_LIST_ANCHOR, anchor.next)?;

        let mut taken = 0_u32;
        let mut last = LIST_END;
        let mut after = LIST_END;
        self.walk(first, |index, entry| {
            taken += 1;
            if taken == count {
                last = index;
                after = entry.next;
                return Ok(false);
            }
            Ok(true)
        })?;
        if taken < count {
            return Err(SaveError::AllocationTableFull {
                requested: u64::from(count),
                available: u64::from(taken),
            });
        }
        let after = self.check_link(last, after)?;

        // Detach [first, last] from the free list.
        self.write_entry(
            FREE_LIST_ANCHOR,
            AllocationEntry {
                prev: anchor.prev,
                next: after,
            },
        )?;
        if after != LIST_END {
            let mut entry = self.read_entry(after)?;
            entry.prev = LIST_END;
            self.write_entry(after, entry)?;
        }
        let mut head = self.read_entry(first)?;
        head.prev = LIST_END;
        self.write_entry(first, head)?;
        let mut tail = self.read_entry(last)?;
        tail.next = LIST_END;
        self.write_entry(last, tail)?;

        debug!(count, start_block = first - 1, "allocation_allocate");
        Ok(first - 1)
    }

    /// Return the chain starting at `start` to the front of the free list.
    pub fn free(&self, start: u32) -> Result<()> {
        if start == END_OF_CHAIN {
            return Ok(());
        }
        let _guard = self.mutate.lock();
        self.free_locked(start)
    }

    fn free_locked(&self, start: u32) -> Result<()> {
        let first = self.entry_of(start)?;
        let head = self.read_entry(first)?;
        if head.prev != LIST_END {
            return Err(SaveError::corruption(
                u64::from(first) * ALLOCATION_ENTRY_SIZE as u64,
                format!("freeing block {start} which is not a chain head"),
            ));
        }
        let mut last = first;
        let mut length = 0_u32;
        self.walk(first, |index, _| {
            last = index;
            length += 1;
            Ok(true)
        })?;

        let anchor = self.read_entry(FREE_LIST_ANCHOR)?;
        let old_first = self.check_link(FREE_LIST_ANCHOR, anchor.next)?;
        let mut tail = self.read_entry(last)?;
        tail.next = old_first;
        self.write_entry(last, tail)?;
        if old_first != LIST_END {
            let mut entry = self.read_entry(old_first)?;
            entry.prev = last;
            self.write_entry(old_first, entry)?;
        }
        self.write_entry(
            FREE_LIST_ANCHOR,
            AllocationEntry {
                prev: anchor.prev,
                next: first,
            },
        )?;
        debug!(start_block = start, length, "allocation_free");
        Ok(())
    }

    /// Append chain `back` to the end of chain `front`; returns the joined head.
    pub fn join(&self, front: u32, back: u32) -> Result<u32> {
        if front == END_OF_CHAIN {
            return Ok(back);
        }
        if back == END_OF_CHAIN {
            return Ok(front);
        }
        let _guard = self.mutate.lock();
        let front_first = self.entry_of(front)?;
        let back_first = self.entry_of(back)?;
        let mut last = front_first;
        self.walk(front_first, |index, _| {
            last = index;
            Ok(true)
        })?;
        let mut tail = self.read_entry(last)?;
        tail.next = back_first;
        self.write_entry(last, tail)?;
        let mut head = self.read_entry(back_first)?;
        head.prev = last;
        self.write_entry(back_first, head)?;
        trace!(front, back, "allocation_join");
        Ok(front)
    }

    /// Keep the first `keep` blocks of the chain at `start`, freeing the rest.
    /// Returns the new head (`END_OF_CHAIN` when `keep == 0`).
    pub fn trim(&self, start: u32, keep: u32) -> Result<u32> {
        if start == END_OF_CHAIN {
            return Ok(END_OF_CHAIN);
        }
        let _guard = self.mutate.lock();
        if keep == 0 {
            self.free_locked(start)?;
            return Ok(END_OF_CHAIN);
        }
        let first = self.entry_of(start)?;
        let mut seen = 0_u32;
        let mut new_tail = LIST_END;
        let mut rest = LIST_END;
        self.walk(first, |index, entry| {
            seen += 1;
            if seen == keep {
                new_tail = index;
                rest = entry.next;
                return Ok(false);
            }
            Ok(true)
        })?;
        if new_tail == LIST_END {
            return Err(SaveError::OutOfRange {
                offset: u64::from(keep),
                len: 0,
                size: u64::from(seen),
            });
        }
        let rest = self.check_link(new_tail, rest)?;
        if rest != LIST_END {
            let mut tail = self.read_entry(new_tail)?;
            tail.next = LIST_END;
            self.write_entry(new_tail, tail)?;
            let mut rest_head = self.read_entry(rest)?;
            rest_head.prev = LIST_END;
            self.write_entry(rest, rest_head)?;
            self.free_locked(rest - 1)?;
        }
        debug!(start_block = start, keep, "allocation_trim");
        Ok(start)
    }

    /// Flush the underlying table storage.
    pub fn flush(&self) -> Result<()> {
        self.storage.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use sfs_storage::MemoryStorage;
    use std::collections::HashSet;
    use std::sync::Arc;

    fn table(blocks: u32) -> AllocationTable {
        let storage = MemoryStorage::new(table_size(blocks) as usize);
        AllocationTable::format(Arc::new(storage), blocks).expect("format")
    }

    #[test]
    fn format_puts_every_block_on_free_list() {
        let table = table(8);
        assert_eq!(table.free_list_length().expect("len"), 8);
        assert_eq!(table.free_blocks().expect("free"), (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn entry_layout_matches_disk_format() {
        let storage = MemoryStorage::new(table_size(3) as usize);
        AllocationTable::format(Arc::new(storage.clone()), 3).expect("format");
        let raw = storage.to_vec();
        // Anchor -> entry 1; entries 1..=3 chained; entry 3 terminates.
        assert_eq!(&raw[0..8], &[0, 0, 0, 0, 1, 0, 0, 0]);
        assert_eq!(&raw[8..16], &[0, 0, 0, 0, 2, 0, 0, 0]);
        assert_eq!(&raw[24..32], &[2, 0, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn allocate_takes_front_of_free_list() {
        let table = table(8);
        let first = table.allocate(3).expect("alloc");
        assert_eq!(first, 0);
        assert_eq!(table.chain_blocks(first).expect("chain"), vec![0, 1, 2]);
        let second = table.allocate(2).expect("alloc");
        assert_eq!(table.chain_blocks(second).expect("chain"), vec![3, 4]);
        assert_eq!(table.free_list_length().expect("len"), 3);
    }

    #[test]
    fn allocate_zero_is_end_of_chain() {
        let table = table(4);
        assert_eq!(table.allocate(0).expect("alloc"), END_OF_CHAIN);
        assert_eq!(table.chain_length(END_OF_CHAIN).expect("len"), 0);
        table.free(END_OF_CHAIN).expect("free nothing");
        assert_eq!(table.free_list_length().expect("len"), 4);
    }

    #[test]
    fn allocate_failure_changes_nothing() {
        let table = table(4);
        table.allocate(3).expect("alloc");
        let before = table.free_blocks().expect("free");
        let err = table.allocate(2).expect_err("too many");
        assert!(matches!(
            err,
            SaveError::AllocationTableFull {
                requested: 2,
                available: 1
            }
        ));
        assert_eq!(table.free_blocks().expect("free"), before);
    }

    #[test]
    fn freed_blocks_are_reused_first() {
        let table = table(16);
        let a = table.allocate(4).expect("a");
        let _b = table.allocate(4).expect("b");
        let before = table.free_list_length().expect("len");
        table.free(a).expect("free a");
        assert_eq!(table.free_list_length().expect("len"), before + 4);
        let c = table.allocate(4).expect("c");
        assert_eq!(table.chain_blocks(c).expect("chain"), vec![0, 1, 2, 3]);
        assert_eq!(table.free_list_length().expect("len"), before);
    }

    #[test]
    fn join_and_trim() {
        let table = table(10);
        let a = table.allocate(2).expect("a");
        let b = table.allocate(3).expect("b");
        let joined = table.join(a, b).expect("join");
        assert_eq!(table.chain_blocks(joined).expect("chain"), vec![0, 1, 2, 3, 4]);
        assert_eq!(table.join(END_OF_CHAIN, b).expect("join"), b);

        let trimmed = table.trim(joined, 2).expect("trim");
        assert_eq!(table.chain_blocks(trimmed).expect("chain"), vec![0, 1]);
        assert_eq!(table.free_list_length().expect("len"), 8);
        assert_eq!(table.trim(trimmed, 0).expect("trim all"), END_OF_CHAIN);
        assert_eq!(table.free_list_length().expect("len"), 10);
    }

    #[test]
    fn seek_walks_forward() {
        let table = table(10);
        let a = table.allocate(2).expect("a");
        let _gap = table.allocate(1).expect("gap");
        let b = table.allocate(2).expect("b");
        let chain = table.join(a, b).expect("join");
        assert_eq!(table.seek(chain, 0, 2).expect("seek"), 3);
        assert_eq!(table.seek(1, 1, 3).expect("seek"), 4);
        assert!(matches!(
            table.seek(chain, 0, 4),
            Err(SaveError::OutOfRange { .. })
        ));
    }

    #[test]
    fn cycle_is_corruption() {
        let storage = MemoryStorage::new(table_size(4) as usize);
        let table = AllocationTable::format(Arc::new(storage.clone()), 4).expect("format");
        let head = table.allocate(2).expect("alloc");
        // Point the tail back at the head, keeping prev links plausible.
        storage
            .write_at(2 * 8, &AllocationEntry { prev: 1, next: 1 }.to_bytes())
            .expect("poke");
        storage
            .write_at(8, &AllocationEntry { prev: 0, next: 2 }.to_bytes())
            .expect("poke");
        let err = table.chain_blocks(head).expect_err("cycle");
        assert!(err.is_fatal(), "{err:?}");
    }

    #[test]
    fn dangling_link_is_corruption() {
        let storage = MemoryStorage::new(table_size(4) as usize);
        let table = AllocationTable::format(Arc::new(storage.clone()), 4).expect("format");
        storage
            .write_at(0, &AllocationEntry { prev: 0, next: 9 }.to_bytes())
            .expect("poke");
        assert!(matches!(
            table.free_list_length(),
            Err(SaveError::Corruption { .. })
        ));
    }

    #[test]
    fn freeing_mid_chain_is_rejected() {
        let table = table(4);
        let head = table.allocate(3).expect("alloc");
        assert!(table.free(head + 1).is_err());
        assert!(table.free(7).is_err());
    }

    #[derive(Debug, Clone)]
    enum Op {
        Allocate(u32),
        Free(usize),
        Grow(usize, u32),
        Trim(usize, u32),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0_u32..6).prop_map(Op::Allocate),
            any::<usize>().prop_map(Op::Free),
            (any::<usize>(), 1_u32..4).prop_map(|(i, n)| Op::Grow(i, n)),
            (any::<usize>(), 0_u32..4).prop_map(|(i, n)| Op::Trim(i, n)),
        ]
    }

    proptest! {
        #[test]
        fn chains_never_share_blocks(ops in proptest::collection::vec(op(), 1..40)) {
            const BLOCKS: u32 = 24;
            let table = table(BLOCKS);
            let mut chains: Vec<u32> = Vec::new();
            for op in ops {
                match op {
                    Op::Allocate(n) => {
                        if let Ok(head) = table.allocate(n) {
                            if head != END_OF_CHAIN {
                                chains.push(head);
                            }
                        }
                    }
                    Op::Free(i) if !chains.is_empty() => {
                        let head = chains.swap_remove(i % chains.len());
                        table.free(head).expect("free");
                    }
                    Op::Grow(i, n) if !chains.is_empty() => {
                        let i = i % chains.len();
                        if let Ok(extra) = table.allocate(n) {
                            chains[i] = table.join(chains[i], extra).expect("join");
                        }
                    }
                    Op::Trim(i, n) if !chains.is_empty() => {
                        let i = i % chains.len();
                        let len = table.chain_length(chains[i]).expect("len");
                        let head = table.trim(chains[i], n.min(len)).expect("trim");
                        if head == END_OF_CHAIN {
                            chains.swap_remove(i);
                        } else {
                            chains[i] = head;
                        }
                    }
                    _ => {}
                }

                let mut seen = HashSet::new();
                let mut live = 0_u32;
                for head in &chains {
                    for block in table.chain_blocks(*head).expect("chain") {
                        prop_assert!(seen.insert(block), "block {} in two chains", block);
                        live += 1;
                    }
                }
                for block in table.free_blocks().expect("free") {
                    prop_assert!(seen.insert(block), "free block {} also live", block);
                }
                prop_assert_eq!(table.free_list_length().expect("len") + live, BLOCKS);
            }
        }
    }
}
