//! One open-hash table of fixed-size entries.
//!
//! ```text
//! 0x00  u32 bucket_count
//! 0x04  u32 capacity       entry slots
//! 0x08  u32 used_count     slots ever handed out
//! 0x0C  u32 free_head      recycled slot list
//! 0x10  u32 bucket[bucket_count]
//! ...   TableEntry[capacity], 0x60 bytes each
//! ```
//!
//! Keys are `(parent, name)`. A key lives in bucket
//! `hash_key(parent, name) % bucket_count` and collisions chain through the
//! entry's `next` field. Freed slots chain through the same field from
//! `free_head`.

use serde::{Deserialize, Serialize};
use sfs_error::{Result, SaveError};
use sfs_ondisk::{TableEntry, format_error};
use sfs_storage::SharedStorage;
use sfs_types::{NO_ENTRY, TABLE_ENTRY_SIZE, read_le_u32};
use tracing::debug;

pub const TABLE_HEADER_SIZE: u64 = 0x10;

/// Hash of a `(parent, name)` key.
#[must_use]
pub fn hash_key(parent: u32, name: &[u8]) -> u32 {
    name.iter()
        .fold(parent ^ 123_456_789, |hash, byte| hash.rotate_right(5) ^ u32::from(*byte))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableHeader {
    pub bucket_count: u32,
    pub capacity: u32,
    pub used_count: u32,
    pub free_head: u32,
}

impl TableHeader {
    fn parse(bytes: &[u8]) -> Result<Self> {
        Ok(Self {
            bucket_count: read_le_u32(bytes, 0x0).map_err(format_error)?,
            capacity: read_le_u32(bytes, 0x4).map_err(format_error)?,
            used_count: read_le_u32(bytes, 0x8).map_err(format_error)?,
            free_head: read_le_u32(bytes, 0xC).map_err(format_error)?,
        })
    }

    fn to_bytes(self) -> [u8; 0x10] {
        let mut out = [0_u8; 0x10];
        out[0x0..0x4].copy_from_slice(&self.bucket_count.to_le_bytes());
        out[0x4..0x8].copy_from_slice(&self.capacity.to_le_bytes());
        out[0x8..0xC].copy_from_slice(&self.used_count.to_le_bytes());
        out[0xC..0x10].copy_from_slice(&self.free_head.to_le_bytes());
        out
    }

    #[must_use]
    pub fn entries_offset(&self) -> u64 {
        TABLE_HEADER_SIZE + u64::from(self.bucket_count) * 4
    }

    #[must_use]
    pub fn entry_offset(&self, index: u32) -> u64 {
        self.entries_offset() + u64::from(index) * TABLE_ENTRY_SIZE as u64
    }

    /// Bytes needed for `bucket_count` buckets and `capacity` slots.
    #[must_use]
    pub fn required_size(bucket_count: u32, capacity: u32) -> u64 {
        TABLE_HEADER_SIZE
            + u64::from(bucket_count) * 4
            + u64::from(capacity) * TABLE_ENTRY_SIZE as u64
    }

    fn capacity_for(bucket_count: u32, storage_size: u64) -> u32 {
        let entries = TABLE_HEADER_SIZE + u64::from(bucket_count) * 4;
        let slots = storage_size.saturating_sub(entries) / TABLE_ENTRY_SIZE as u64;
        u32::try_from(slots).unwrap_or(NO_ENTRY - 1).min(NO_ENTRY - 1)
    }
}

/// Hash table stored in a resizable byte storage.
pub struct EntryTable {
    storage: SharedStorage,
    kind: &'static str,
}

impl std::fmt::Debug for EntryTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntryTable")
            .field("kind", &self.kind)
            .field("size", &self.storage.size())
            .finish_non_exhaustive()
    }
}

impl EntryTable {
    /// Write an empty table. Capacity is raised to whatever the storage
    /// already holds; the storage grows when it is too small.
    pub fn format(
        storage: SharedStorage,
        kind: &'static str,
        bucket_count: u32,
        capacity: u32,
    ) -> Result<Self> {
        if bucket_count == 0 {
            return Err(SaveError::Format(format!("{kind} table needs at least one bucket")));
        }
        let required = TableHeader::required_size(bucket_count, capacity.max(1));
        if storage.size() < required {
            storage.set_size(required)?;
        }
        let header = TableHeader {
            bucket_count,
            capacity: TableHeader::capacity_for(bucket_count, storage.size()),
            used_count: 0,
            free_head: NO_ENTRY,
        };
        storage.write_at(0, &header.to_bytes())?;
        let buckets: Vec<u8> = std::iter::repeat_n(NO_ENTRY.to_le_bytes(), bucket_count as usize)
            .flatten()
            .collect();
        storage.write_at(TABLE_HEADER_SIZE, &buckets)?;
        debug!(kind, bucket_count, capacity = header.capacity, "table_format");
        Ok(Self { storage, kind })
    }

    /// Open an existing table, validating its header against the storage.
    pub fn open(storage: SharedStorage, kind: &'static str) -> Result<Self> {
        let table = Self { storage, kind };
        let header = table.header()?;
        if header.bucket_count == 0 {
            return Err(SaveError::corruption(0, format!("{kind} table has no buckets")));
        }
        if header.used_count > header.capacity {
            return Err(SaveError::corruption(
                0x8,
                format!(
                    "{kind} table uses {} of {} slots",
                    header.used_count, header.capacity
                ),
            ));
        }
        if header.free_head != NO_ENTRY && header.free_head >= header.used_count {
            return Err(SaveError::corruption(0xC, format!("{kind} table free head out of range")));
        }
        let required = TableHeader::required_size(header.bucket_count, header.capacity);
        if table.storage.size() < required {
            return Err(SaveError::corruption(
                0,
                format!(
                    "{kind} table needs {required:#x} bytes, storage holds {:#x}",
                    table.storage.size()
                ),
            ));
        }
        Ok(table)
    }

    #[must_use]
    pub fn kind(&self) -> &'static str {
        self.kind
    }

    pub fn header(&self) -> Result<TableHeader> {
        let mut bytes = [0_u8; 0x10];
        self.storage.read_at(0, &mut bytes)?;
        TableHeader::parse(&bytes)
    }

    fn write_header(&self, header: &TableHeader) -> Result<()> {
        self.storage.write_at(0, &header.to_bytes())
    }

    fn bucket_index(header: &TableHeader, parent: u32, name: &[u8]) -> u32 {
        hash_key(parent, name) % header.bucket_count
    }

    fn bucket(&self, bucket: u32) -> Result<u32> {
        let mut bytes = [0_u8; 4];
        self.storage
            .read_at(TABLE_HEADER_SIZE + u64::from(bucket) * 4, &mut bytes)?;
        Ok(u32::from_le_bytes(bytes))
    }

    fn set_bucket(&self, bucket: u32, value: u32) -> Result<()> {
        self.storage
            .write_at(TABLE_HEADER_SIZE + u64::from(bucket) * 4, &value.to_le_bytes())
    }

    fn read_slot(&self, header: &TableHeader, index: u32) -> Result<TableEntry> {
        let mut bytes = [0_u8; TABLE_ENTRY_SIZE];
        self.storage.read_at(header.entry_offset(index), &mut bytes)?;
        TableEntry::parse(&bytes).map_err(format_error)
    }

    fn write_slot(&self, header: &TableHeader, index: u32, entry: &TableEntry) -> Result<()> {
        self.storage
            .write_at(header.entry_offset(index), &entry.to_bytes())
    }

    fn check_index(&self, header: &TableHeader, index: u32, at: u64) -> Result<()> {
        if index >= header.used_count {
            return Err(SaveError::corruption(
                at,
                format!(
                    "{} table link {index} past used count {}",
                    self.kind, header.used_count
                ),
            ));
        }
        Ok(())
    }

    /// Entry at `index`, which must be a slot already handed out.
    pub fn read(&self, index: u32) -> Result<TableEntry> {
        let header = self.header()?;
        if index >= header.used_count {
            return Err(SaveError::KeyNotFound(format!("{} entry {index}", self.kind)));
        }
        self.read_slot(&header, index)
    }

    /// Overwrite the entry at `index`. Key fields must not change; use
    /// [`EntryTable::rekey`] for that.
    pub fn write(&self, index: u32, entry: &TableEntry) -> Result<()> {
        let header = self.header()?;
        if index >= header.used_count {
            return Err(SaveError::KeyNotFound(format!("{} entry {index}", self.kind)));
        }
        self.write_slot(&header, index, entry)
    }

    /// Index of the entry keyed `(parent, name)`.
    pub fn find(&self, parent: u32, name: &[u8]) -> Result<Option<u32>> {
        let header = self.header()?;
        let bucket = Self::bucket_index(&header, parent, name);
        let mut current = self.bucket(bucket)?;
        let mut steps = 0_u32;
        while current != NO_ENTRY {
            self.check_index(&header, current, TABLE_HEADER_SIZE + u64::from(bucket) * 4)?;
            let entry = self.read_slot(&header, current)?;
            if entry.parent == parent && entry.name_bytes() == name {
                return Ok(Some(current));
            }
            steps += 1;
            if steps > header.used_count {
                return Err(SaveError::corruption(
                    header.entry_offset(current),
                    format!("{} table bucket {bucket} cycles", self.kind),
                ));
            }
            current = entry.next;
        }
        Ok(None)
    }

    /// Place `entry` in slot 0 of an empty table without hashing it.
    pub fn insert_unlinked(&self, entry: &TableEntry) -> Result<u32> {
        let mut header = self.header()?;
        if header.used_count != 0 {
            return Err(SaveError::AlreadyExists(format!("{} table slot 0", self.kind)));
        }
        if header.capacity == 0 {
            self.grow(&mut header)?;
        }
        header.used_count = 1;
        self.write_slot(&header, 0, entry)?;
        self.write_header(&header)?;
        Ok(0)
    }

    /// Store `entry` and hash it in by its `(parent, name)` key. The caller
    /// has already checked that the key is absent.
    pub fn insert(&self, mut entry: TableEntry) -> Result<u32> {
        let mut header = self.header()?;
        let index = if header.free_head == NO_ENTRY {
            if header.used_count >= header.capacity {
                self.grow(&mut header)?;
            }
            header.used_count += 1;
            header.used_count - 1
        } else {
            let index = header.free_head;
            self.check_index(&header, index, 0xC)?;
            header.free_head = self.read_slot(&header, index)?.next;
            index
        };

        let bucket = Self::bucket_index(&header, entry.parent, entry.name_bytes());
        entry.next = self.bucket(bucket)?;
        self.write_slot(&header, index, &entry)?;
        self.set_bucket(bucket, index)?;
        self.write_header(&header)?;
        Ok(index)
    }

    /// Unhash `index` and put its slot on the free list.
    pub fn remove(&self, index: u32) -> Result<TableEntry> {
        let mut header = self.header()?;
        let entry = self.read(index)?;
        self.unlink(&header, index, &entry)?;
        let freed = TableEntry {
            next: header.free_head,
            ..TableEntry::default()
        };
        self.write_slot(&header, index, &freed)?;
        header.free_head = index;
        self.write_header(&header)?;
        Ok(entry)
    }

    /// Change the key of `index` and rehash it.
    pub fn rekey(&self, index: u32, parent: u32, name: &[u8]) -> Result<()> {
        let header = self.header()?;
        let mut entry = self.read(index)?;
        self.unlink(&header, index, &entry)?;
        entry.parent = parent;
        entry
            .set_name(name)
            .map_err(|_| SaveError::NameTooLong(String::from_utf8_lossy(name).into_owned()))?;
        let bucket = Self::bucket_index(&header, parent, name);
        entry.next = self.bucket(bucket)?;
        self.write_slot(&header, index, &entry)?;
        self.set_bucket(bucket, index)
    }

    fn unlink(&self, header: &TableHeader, index: u32, entry: &TableEntry) -> Result<()> {
        let bucket = Self::bucket_index(header, entry.parent, entry.name_bytes());
        let head = self.bucket(bucket)?;
        if head == index {
            return self.set_bucket(bucket, entry.next);
        }
        let mut current = head;
        let mut steps = 0_u32;
        while current != NO_ENTRY && steps <= header.used_count {
            self.check_index(header, current, TABLE_HEADER_SIZE + u64::from(bucket) * 4)?;
            let mut link = self.read_slot(header, current)?;
            if link.next == index {
                link.next = entry.next;
                return self.write_slot(header, current, &link);
            }
            current = link.next;
            steps += 1;
        }
        Err(SaveError::corruption(
            header.entry_offset(index),
            format!("{} entry {index} missing from bucket {bucket}", self.kind),
        ))
    }

    fn grow(&self, header: &mut TableHeader) -> Result<()> {
        let wanted = header
            .capacity
            .saturating_mul(2)
            .max(header.capacity.saturating_add(1));
        if wanted >= NO_ENTRY || wanted == header.capacity {
            return Err(SaveError::TableFull(self.kind));
        }
        let required = TableHeader::required_size(header.bucket_count, wanted);
        match self.storage.set_size(required) {
            Ok(()) => {}
            Err(SaveError::Unsupported(_)) => return Err(SaveError::TableFull(self.kind)),
            Err(other) => return Err(other),
        }
        let old = header.capacity;
        header.capacity = TableHeader::capacity_for(header.bucket_count, self.storage.size());
        self.write_header(header)?;
        debug!(kind = self.kind, from = old, to = header.capacity, "table_grow");
        Ok(())
    }

    /// Per-slot flags for `0..used_count`: `true` for slots on the free list.
    pub fn free_slots(&self) -> Result<Vec<bool>> {
        let header = self.header()?;
        let mut free = vec![false; header.used_count as usize];
        let mut current = header.free_head;
        while current != NO_ENTRY {
            self.check_index(&header, current, 0xC)?;
            let slot = &mut free[current as usize];
            if *slot {
                return Err(SaveError::corruption(
                    header.entry_offset(current),
                    format!("{} table free list cycles", self.kind),
                ));
            }
            *slot = true;
            current = self.read_slot(&header, current)?.next;
        }
        Ok(free)
    }

    /// Walk every bucket chain. Each member must be live, hashed to the
    /// bucket it sits in, and reached once. Returns the number of members.
    pub fn check_buckets(&self, free: &[bool]) -> Result<u32> {
        let header = self.header()?;
        let mut seen = vec![false; header.used_count as usize];
        let mut members = 0_u32;
        for bucket in 0..header.bucket_count {
            let at = TABLE_HEADER_SIZE + u64::from(bucket) * 4;
            let mut current = self.bucket(bucket)?;
            while current != NO_ENTRY {
                self.check_index(&header, current, at)?;
                let slot = current as usize;
                if free[slot] || seen[slot] {
                    return Err(SaveError::corruption(
                        header.entry_offset(current),
                        format!("{} entry {current} reached twice or while free", self.kind),
                    ));
                }
                seen[slot] = true;
                let entry = self.read_slot(&header, current)?;
                if Self::bucket_index(&header, entry.parent, entry.name_bytes()) != bucket {
                    return Err(SaveError::corruption(
                        header.entry_offset(current),
                        format!("{} entry {current} hashed into wrong bucket", self.kind),
                    ));
                }
                members += 1;
                current = entry.next;
            }
        }
        Ok(members)
    }

    pub fn flush(&self) -> Result<()> {
        self.storage.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sfs_storage::{MemoryStorage, Storage};
    use std::sync::Arc;

    fn entry(parent: u32, name: &str) -> TableEntry {
        let mut entry = TableEntry {
            parent,
            ..TableEntry::default()
        };
        entry.set_name(name.as_bytes()).expect("name");
        entry
    }

    fn table(buckets: u32, capacity: u32) -> (MemoryStorage, EntryTable) {
        let storage = MemoryStorage::new(0);
        let table = EntryTable::format(Arc::new(storage.clone()), "file", buckets, capacity)
            .expect("format");
        (storage, table)
    }

    #[test]
    fn hash_matches_reference_values() {
        assert_eq!(hash_key(0, b""), 123_456_789);
        let expected = 123_456_789_u32.rotate_right(5) ^ u32::from(b'a');
        assert_eq!(hash_key(0, b"a"), expected);
        assert_ne!(hash_key(1, b"a"), hash_key(0, b"a"));
    }

    #[test]
    fn format_writes_empty_buckets() {
        let (storage, table) = table(3, 2);
        let raw = storage.to_vec();
        assert_eq!(raw.len() as u64, TableHeader::required_size(3, 2));
        assert_eq!(&raw[0x10..0x1C], &[0xFF; 12]);
        let header = table.header().expect("header");
        assert_eq!(header.capacity, 2);
        assert_eq!(header.free_head, NO_ENTRY);
    }

    #[test]
    fn colliding_keys_chain_in_one_bucket() {
        let (_storage, table) = table(1, 4);
        let a = table.insert(entry(0, "a")).expect("a");
        let b = table.insert(entry(0, "b")).expect("b");
        let c = table.insert(entry(7, "a")).expect("c");
        assert_eq!(table.find(0, b"a").expect("find"), Some(a));
        assert_eq!(table.find(0, b"b").expect("find"), Some(b));
        assert_eq!(table.find(7, b"a").expect("find"), Some(c));
        assert_eq!(table.find(7, b"b").expect("find"), None);

        table.remove(b).expect("remove middle");
        assert_eq!(table.find(0, b"a").expect("find"), Some(a));
        assert_eq!(table.find(7, b"a").expect("find"), Some(c));
        assert_eq!(table.find(0, b"b").expect("find"), None);
    }

    #[test]
    fn removed_slots_are_recycled() {
        let (_storage, table) = table(4, 4);
        let a = table.insert(entry(0, "a")).expect("a");
        table.insert(entry(0, "b")).expect("b");
        table.remove(a).expect("remove");
        assert_eq!(table.free_slots().expect("free"), vec![true, false]);
        let c = table.insert(entry(0, "c")).expect("c");
        assert_eq!(c, a);
        assert_eq!(table.header().expect("header").used_count, 2);
    }

    #[test]
    fn full_table_grows_its_storage() {
        let (storage, table) = table(2, 1);
        for name in ["a", "b", "c", "d"] {
            table.insert(entry(0, name)).expect("insert");
        }
        let header = table.header().expect("header");
        assert!(header.capacity >= 4);
        assert!(storage.size() >= TableHeader::required_size(2, header.capacity));
        assert!(table.find(0, b"d").expect("find").is_some());
        assert_eq!(table.check_buckets(&table.free_slots().expect("free")).expect("buckets"), 4);
    }

    #[test]
    fn rekey_moves_entry_between_buckets() {
        let (_storage, table) = table(8, 4);
        let index = table.insert(entry(0, "old")).expect("insert");
        table.rekey(index, 3, b"new").expect("rekey");
        assert_eq!(table.find(0, b"old").expect("find"), None);
        assert_eq!(table.find(3, b"new").expect("find"), Some(index));
        assert_eq!(table.read(index).expect("read").parent, 3);
    }

    #[test]
    fn bucket_cycle_is_corruption() {
        let (_storage, table) = table(1, 2);
        let a = table.insert(entry(0, "a")).expect("a");
        let mut looped = table.read(a).expect("read");
        looped.next = a;
        table.write(a, &looped).expect("write");
        assert!(matches!(
            table.find(0, b"zzz"),
            Err(SaveError::Corruption { .. })
        ));
    }

    #[test]
    fn open_rejects_inconsistent_header() {
        let (storage, _table) = table(2, 2);
        storage.write_at(0x8, &5_u32.to_le_bytes()).expect("poke used");
        assert!(matches!(
            EntryTable::open(Arc::new(storage), "file"),
            Err(SaveError::Corruption { .. })
        ));
    }
}
