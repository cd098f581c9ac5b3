//! One allocation chain presented as a contiguous byte range.

use crate::AllocationTable;
use parking_lot::Mutex;
use sfs_error::{Result, SaveError};
use sfs_storage::{SharedStorage, Storage, check_range, zero_fill};
use sfs_types::{BlockSize, END_OF_CHAIN};
use std::sync::Arc;
use tracing::{debug, trace};

struct ChainState {
    head: u32,
    length: u64,
    /// Last visited `(position in chain, block)`.
    cursor: Option<(u64, u32)>,
}

/// Byte storage over the chain starting at `head`.
///
/// Block `k` of the chain is stored at `k_block * block_size` in the data
/// storage. Resizing allocates or trims trailing blocks; the new head and
/// length are readable afterwards so the owning table entry can be updated.
pub struct AllocationTableStorage {
    table: Arc<AllocationTable>,
    data: SharedStorage,
    block_size: BlockSize,
    state: Mutex<ChainState>,
}

impl std::fmt::Debug for AllocationTableStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("AllocationTableStorage")
            .field("head", &state.head)
            .field("length", &state.length)
            .field("block_size", &self.block_size)
            .finish_non_exhaustive()
    }
}

impl AllocationTableStorage {
    /// Open the chain at `head` holding `length` bytes.
    ///
    /// The chain must have room for `length` bytes.
    pub fn open(
        table: Arc<AllocationTable>,
        data: SharedStorage,
        block_size: BlockSize,
        head: u32,
        length: u64,
    ) -> Result<Self> {
        let blocks = u64::from(table.chain_length(head)?);
        if blocks.saturating_mul(block_size.as_u64()) < length {
            return Err(SaveError::corruption(
                u64::from(head),
                format!("chain of {blocks} blocks cannot hold {length:#x} bytes"),
            ));
        }
        Ok(Self {
            table,
            data,
            block_size,
            state: Mutex::new(ChainState {
                head,
                length,
                cursor: None,
            }),
        })
    }

    /// Allocate a fresh zero-filled chain for `length` bytes.
    pub fn create(
        table: Arc<AllocationTable>,
        data: SharedStorage,
        block_size: BlockSize,
        length: u64,
    ) -> Result<Self> {
        let storage = Self::open(table, data, block_size, END_OF_CHAIN, 0)?;
        storage.set_size(length)?;
        Ok(storage)
    }

    /// Current chain head (`END_OF_CHAIN` when empty).
    #[must_use]
    pub fn head(&self) -> u32 {
        self.state.lock().head
    }

    #[must_use]
    pub fn length(&self) -> u64 {
        self.state.lock().length
    }

    #[must_use]
    pub fn block_size(&self) -> BlockSize {
        self.block_size
    }

    /// Data block holding chain position `index`.
    fn block_at(&self, state: &mut ChainState, index: u64) -> Result<u32> {
        let (from_index, from_block) = match state.cursor {
            Some((position, block)) if position <= index => (position, block),
            _ => (0, state.head),
        };
        if from_block == END_OF_CHAIN {
            return Err(SaveError::OutOfRange {
                offset: index,
                len: 1,
                size: 0,
            });
        }
        let block = self.table.seek(from_block, from_index, index)?;
        state.cursor = Some((index, block));
        Ok(block)
    }

    /// Visit each block touched by `[offset, offset + len)`, which must lie
    /// below `limit`, as `(physical_offset, buffer_start, span_len)`.
    fn for_each_block(
        &self,
        state: &mut ChainState,
        limit: u64,
        offset: u64,
        len: usize,
        mut op: impl FnMut(u64, usize, usize) -> Result<()>,
    ) -> Result<()> {
        check_range(offset, len, limit)?;
        let mut done = 0_usize;
        while done < len {
            let position = offset + done as u64;
            let index = self.block_size.block_of(position);
            let within = self.block_size.offset_in_block(position);
            let room = self.block_size.as_u64() - within;
            let step = usize::try_from(room).map_or(len - done, |room| room.min(len - done));
            let block = self.block_at(state, index)?;
            let physical = (u64::from(block) << self.block_size.shift()) + within;
            trace!(index, block, physical, "chain_block");
            op(physical, done, step)?;
            done += step;
        }
        Ok(())
    }
}

impl Storage for AllocationTableStorage {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let mut state = self.state.lock();
        let limit = state.length;
        self.for_each_block(&mut state, limit, offset, buf.len(), |physical, start, len| {
            self.data.read_at(physical, &mut buf[start..start + len])
        })
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        let limit = state.length;
        self.for_each_block(&mut state, limit, offset, buf.len(), |physical, start, len| {
            self.data.write_at(physical, &buf[start..start + len])
        })
    }

    fn flush(&self) -> Result<()> {
        self.data.flush()
    }

    fn size(&self) -> u64 {
        self.state.lock().length
    }

    /// Grow by allocating and zero-filling trailing blocks, or shrink by
    /// trimming them.
    fn set_size(&self, size: u64) -> Result<()> {
        let mut state = self.state.lock();
        let old_length = state.length;
        let current_blocks = self.block_size.blocks_for(old_length);
        let wanted_blocks = self.block_size.blocks_for(size);
        let to_u32 = |blocks: u64| {
            u32::try_from(blocks).map_err(|_| SaveError::AllocationTableFull {
                requested: blocks,
                available: u64::from(self.table.block_count()),
            })
        };

        // The last block may hold stale bytes past the old length.
        let allocated = current_blocks << self.block_size.shift();
        let tail_end = allocated.min(size);
        if tail_end > old_length {
            let zeros = vec![0_u8; usize::try_from(tail_end - old_length).unwrap_or(0)];
            self.for_each_block(&mut state, allocated, old_length, zeros.len(), |physical, start, len| {
                self.data.write_at(physical, &zeros[start..start + len])
            })?;
        }

        if wanted_blocks > current_blocks {
            let extra = self.table.allocate(to_u32(wanted_blocks - current_blocks)?)?;
            let zeroed = self.table.chain_blocks(extra).and_then(|blocks| {
                blocks.into_iter().try_for_each(|block| {
                    zero_fill(
                        &*self.data,
                        u64::from(block) << self.block_size.shift(),
                        self.block_size.as_u64(),
                    )
                })
            });
            if let Err(err) = zeroed {
                self.table.free(extra)?;
                return Err(err);
            }
            state.head = self.table.join(state.head, extra)?;
        } else if wanted_blocks < current_blocks {
            state.head = self.table.trim(state.head, to_u32(wanted_blocks)?)?;
        }

        debug!(head = state.head, old_length, new_length = size, "chain_resize");
        state.length = size;
        state.cursor = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table_size;
    use sfs_storage::MemoryStorage;

    const BLOCK: u32 = 0x40;

    struct Fixture {
        table: Arc<AllocationTable>,
        data: MemoryStorage,
    }

    impl Fixture {
        fn new(blocks: u32) -> Self {
            let table_storage = MemoryStorage::new(table_size(blocks) as usize);
            Self {
                table: Arc::new(
                    AllocationTable::format(Arc::new(table_storage), blocks).expect("format"),
                ),
                data: MemoryStorage::from_vec(vec![0xEE; (blocks * BLOCK) as usize]),
            }
        }

        fn create(&self, length: u64) -> AllocationTableStorage {
            AllocationTableStorage::create(
                Arc::clone(&self.table),
                Arc::new(self.data.clone()),
                BlockSize::new(BLOCK).expect("block size"),
                length,
            )
            .expect("create")
        }
    }

    #[test]
    fn create_zero_fills_and_reports_head() {
        let fixture = Fixture::new(8);
        let storage = fixture.create(0x50);
        assert_eq!(storage.head(), 0);
        assert_eq!(storage.size(), 0x50);
        assert_eq!(fixture.table.chain_length(0).expect("len"), 2);
        let mut buf = vec![0xFF_u8; 0x50];
        storage.read_at(0, &mut buf).expect("read");
        assert!(buf.iter().all(|b| *b == 0));
    }

    #[test]
    fn empty_chain_uses_end_of_chain() {
        let fixture = Fixture::new(4);
        let storage = fixture.create(0);
        assert_eq!(storage.head(), END_OF_CHAIN);
        assert_eq!(fixture.table.free_list_length().expect("len"), 4);
        assert!(matches!(
            storage.read_at(0, &mut [0_u8; 1]),
            Err(SaveError::OutOfRange { .. })
        ));
    }

    #[test]
    fn reads_follow_a_fragmented_chain() {
        let fixture = Fixture::new(8);
        let first = fixture.create(0x40);
        let _spacer = fixture.create(0x40);
        first.set_size(0x80).expect("grow");
        // Chain is block 0 then block 2.
        assert_eq!(fixture.table.chain_blocks(first.head()).expect("chain"), vec![0, 2]);

        first.write_at(0x3C, b"abcdefgh").expect("straddle write");
        let raw = fixture.data.to_vec();
        assert_eq!(&raw[0x3C..0x40], b"abcd");
        assert_eq!(&raw[0x80..0x84], b"efgh");

        let mut whole = [0_u8; 8];
        first.read_at(0x3C, &mut whole).expect("read");
        assert_eq!(&whole, b"abcdefgh");
    }

    #[test]
    fn shrink_returns_blocks_and_grow_zeroes_tail() {
        let fixture = Fixture::new(8);
        let storage = fixture.create(0xC0);
        storage.write_at(0, &[0x55; 0xC0]).expect("fill");
        storage.set_size(0x30).expect("shrink");
        assert_eq!(fixture.table.free_list_length().expect("len"), 7);
        assert_eq!(storage.size(), 0x30);

        storage.set_size(0x48).expect("grow");
        let mut buf = [0_u8; 0x48];
        storage.read_at(0, &mut buf).expect("read");
        assert!(buf[..0x30].iter().all(|b| *b == 0x55));
        assert!(buf[0x30..].iter().all(|b| *b == 0));

        storage.set_size(0).expect("truncate");
        assert_eq!(storage.head(), END_OF_CHAIN);
        assert_eq!(fixture.table.free_list_length().expect("len"), 8);
    }

    #[test]
    fn growth_failure_leaves_storage_intact() {
        let fixture = Fixture::new(2);
        let storage = fixture.create(0x40);
        let err = storage.set_size(0x100).expect_err("too large");
        assert!(matches!(err, SaveError::AllocationTableFull { .. }));
        assert_eq!(storage.size(), 0x40);
        assert_eq!(fixture.table.free_list_length().expect("len"), 1);
    }

    #[test]
    fn open_rejects_short_chain() {
        let fixture = Fixture::new(4);
        let head = fixture.table.allocate(1).expect("alloc");
        let result = AllocationTableStorage::open(
            Arc::clone(&fixture.table),
            Arc::new(fixture.data.clone()),
            BlockSize::new(BLOCK).expect("block size"),
            head,
            0x41,
        );
        assert!(matches!(result, Err(SaveError::Corruption { .. })));
    }

    #[test]
    fn backwards_access_restarts_from_head() {
        let fixture = Fixture::new(4);
        let storage = fixture.create(0x100);
        storage.write_at(0xF0, &[3; 0x10]).expect("tail");
        storage.write_at(0x00, &[1; 0x10]).expect("head");
        let mut buf = [0_u8; 1];
        storage.read_at(0xFF, &mut buf).expect("tail read");
        assert_eq!(buf, [3]);
        storage.read_at(0x0F, &mut buf).expect("head read");
        assert_eq!(buf, [1]);
    }
}
