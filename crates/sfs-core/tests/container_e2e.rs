#![forbid(unsafe_code)]
#![allow(clippy::cast_possible_truncation)]
//! End-to-end container scenarios.
//!
//! 1. Allocation placement, enumeration and block reuse on 0x4000 blocks.
//! 2. Reads split at a block boundary match one contiguous read.
//! 3. Dropping a mount without commit discards its changes, and files
//!    larger than the journal can still be created.
//! 4. Commits survive a remount of a host file.
//! 5. Random create/delete/commit sequences match a model after remount.

use proptest::prelude::*;
use sfs_core::{
    EntryType, EnumerateMode, FileStorage, FormatOptions, MemoryStorage, MountOptions, OpenMode,
    SaveContainerFileSystem, SaveError, Storage, TableGeometry, format_container,
};
use std::collections::BTreeMap;
use std::sync::Arc;

fn mount(storage: &MemoryStorage) -> SaveContainerFileSystem {
    SaveContainerFileSystem::from_storage(Arc::new(storage.clone()), &MountOptions::default())
        .expect("mount")
}

fn read_all(fs: &SaveContainerFileSystem, path: &str) -> Vec<u8> {
    let file = fs.open_file(path, OpenMode::READ).expect("open");
    let mut buf = vec![0_u8; usize::try_from(file.size()).expect("size")];
    file.read_at(0, &mut buf).expect("read");
    buf
}

fn write_all(fs: &SaveContainerFileSystem, path: &str, offset: u64, bytes: &[u8]) {
    let file = fs.open_file(path, OpenMode::WRITE).expect("open");
    file.write_at(offset, bytes).expect("write");
}

// ---------------------------------------------------------------------------
// Scenario 1 and 2: default geometry
// ---------------------------------------------------------------------------

#[test]
fn placement_enumeration_and_reuse() {
    let storage = MemoryStorage::new(0);
    let fs = format_container(Arc::new(storage.clone()), &FormatOptions::default())
        .expect("format");
    assert_eq!(fs.block_size(), 0x4000);

    fs.create_directory("/save").expect("mkdir");
    fs.create_file("/pad", 3 * 0x4000).expect("pad");
    fs.create_file("/save/data.bin", 0x1234).expect("create");

    let files = fs.walk_files().expect("walk");
    let data = files
        .iter()
        .find(|(path, _)| path == "/save/data.bin")
        .map(|(_, info)| *info)
        .expect("data.bin");
    // Blocks 0 and 1 hold the entry tables, 2..5 the pad.
    assert_eq!(data.start_block, 5);
    assert_eq!(data.length, 0x1234);

    let listing = fs.open_directory("/save", EnumerateMode::All).expect("ls");
    assert_eq!(listing.entry_count(), 1);
    let entry = &listing.entries()[0];
    assert_eq!(entry.name, "data.bin");
    assert_eq!(entry.kind, EntryType::File);
    assert_eq!(entry.size, 0x1234);

    fs.delete_file("/save/data.bin").expect("delete");
    fs.create_file("/save/data.bin", 0x1234).expect("recreate");
    let reused = fs
        .walk_files()
        .expect("walk")
        .into_iter()
        .find(|(path, _)| path == "/save/data.bin")
        .map(|(_, info)| info.start_block);
    assert_eq!(reused, Some(5));
    fs.verify().expect("verify");
}

#[test]
fn split_read_matches_contiguous_read() {
    let storage = MemoryStorage::new(0);
    let fs = format_container(Arc::new(storage.clone()), &FormatOptions::default())
        .expect("format");
    fs.create_file("/pad", 2 * 0x4000).expect("create");
    let pattern: Vec<u8> = (0..0x40_u32).map(|i| (i * 7 + 3) as u8).collect();
    write_all(&fs, "/pad", 0x3FE0, &pattern);

    let file = fs.open_file("/pad", OpenMode::READ).expect("open");
    let mut whole = [0_u8; 0x20];
    file.read_at(0x3FF0, &mut whole).expect("whole");
    let mut low = [0_u8; 0x10];
    let mut high = [0_u8; 0x10];
    file.read_at(0x3FF0, &mut low).expect("low");
    file.read_at(0x4000, &mut high).expect("high");
    assert_eq!(&whole[..0x10], &low);
    assert_eq!(&whole[0x10..], &high);
    assert_eq!(&whole[..], &pattern[0x10..0x30]);
}

// ---------------------------------------------------------------------------
// Scenario 3: crash without commit
// ---------------------------------------------------------------------------

#[test]
fn uncommitted_changes_vanish_on_remount() {
    let storage = MemoryStorage::new(0);
    let options = FormatOptions {
        block_size: 0x200,
        data_block_count: 64,
        journal_block_count: 32,
        duplex_block_size: 0x40,
        ..FormatOptions::default()
    };
    let fs = format_container(Arc::new(storage.clone()), &options).expect("format");
    fs.create_directory("/save").expect("mkdir");
    fs.create_file("/save/kept", 0x300).expect("create");
    write_all(&fs, "/save/kept", 0, b"committed");
    fs.commit().expect("commit");
    let committed_free = fs.get_free_space_size().expect("free");

    write_all(&fs, "/save/kept", 0, b"scratched");
    fs.create_file("/save/lost", 0x200).expect("create");
    fs.delete_directory_recursively("/save").ok();
    drop(fs);

    let fs = mount(&storage);
    assert_eq!(&read_all(&fs, "/save/kept")[..9], b"committed");
    assert!(matches!(
        fs.get_entry_type("/save/lost"),
        Err(SaveError::PathNotFound(_))
    ));
    assert_eq!(fs.get_free_space_size().expect("free"), committed_free);
    fs.verify().expect("verify");
}

#[test]
fn journal_capacity_is_restored_by_commit() {
    let storage = MemoryStorage::new(0);
    let options = FormatOptions {
        block_size: 0x200,
        data_block_count: 64,
        journal_block_count: 6,
        duplex_block_size: 0x40,
        tables: TableGeometry {
            directory_buckets: 1,
            directory_capacity: 1,
            file_buckets: 1,
            file_capacity: 4,
        },
    };
    let fs = format_container(Arc::new(storage.clone()), &options).expect("format");
    // New file blocks are written in place; each create redirects only the
    // table blocks it touches.
    for path in ["/f", "/g", "/h"] {
        fs.create_file(path, 3 * 0x200).expect("create");
        fs.commit().expect("commit");
    }

    let block = [0x5A_u8; 0x200];
    let targets: Vec<(&str, u64)> = ["/f", "/g", "/h"]
        .into_iter()
        .flat_map(|path| (0..3).map(move |index| (path, index * 0x200)))
        .collect();
    let mut written = 0;
    let mut failure = None;
    for (path, offset) in &targets {
        let file = fs.open_file(path, OpenMode::WRITE).expect("open");
        match file.write_at(*offset, &block) {
            Ok(()) => written += 1,
            Err(err) => {
                failure = Some((err, *path, *offset));
                break;
            }
        }
    }
    assert_eq!(written, 6);
    let (err, path, offset) = failure.expect("journal exhausted");
    assert!(matches!(err, SaveError::JournalFull));

    fs.commit().expect("commit");
    write_all(&fs, path, offset, &block);
    fs.commit().expect("commit");
    drop(fs);
    let fs = mount(&storage);
    assert!(read_all(&fs, "/g").iter().all(|byte| *byte == 0x5A));
    assert_eq!(&read_all(&fs, "/h")[..0x200], &block[..]);
}

#[test]
fn files_larger_than_the_journal_fit() {
    let storage = MemoryStorage::new(0);
    let options = FormatOptions::default();
    let fs = format_container(Arc::new(storage.clone()), &options).expect("format");
    fs.create_file("/keep", 0x10).expect("create");
    write_all(&fs, "/keep", 0, b"committed bytes!");
    fs.commit().expect("commit");

    let size = (u64::from(options.journal_block_count) + 4) * 0x4000;
    assert!(fs.get_free_space_size().expect("free") >= size);
    fs.create_file("/big", size).expect("create past journal size");
    drop(fs);

    let fs = mount(&storage);
    assert!(matches!(fs.get_entry_type("/big"), Err(SaveError::PathNotFound(_))));
    assert_eq!(read_all(&fs, "/keep"), b"committed bytes!");
    fs.verify().expect("verify");

    fs.create_file("/big", size).expect("create after remount");
    write_all(&fs, "/big", size - 4, b"tail");
    fs.commit().expect("commit");
    drop(fs);

    let fs = mount(&storage);
    let big = read_all(&fs, "/big");
    assert_eq!(big.len() as u64, size);
    assert!(big[..big.len() - 4].iter().all(|byte| *byte == 0));
    assert_eq!(&big[big.len() - 4..], b"tail");
    assert_eq!(read_all(&fs, "/keep"), b"committed bytes!");
    fs.verify().expect("verify");
}

#[test]
fn blocks_freed_since_commit_still_use_the_journal() {
    let storage = MemoryStorage::new(0);
    let options = FormatOptions {
        block_size: 0x200,
        data_block_count: 64,
        journal_block_count: 8,
        duplex_block_size: 0x40,
        ..FormatOptions::default()
    };
    let fs = format_container(Arc::new(storage.clone()), &options).expect("format");
    fs.create_file("/old", 4 * 0x200).expect("create");
    write_all(&fs, "/old", 0, &[0x11; 4 * 0x200]);
    fs.commit().expect("commit");

    // The freed blocks head the free list and are reused by the next create.
    fs.delete_file("/old").expect("delete");
    fs.create_file("/new", 4 * 0x200).expect("create");
    write_all(&fs, "/new", 0, &[0x22; 4 * 0x200]);
    drop(fs);

    let fs = mount(&storage);
    assert_eq!(read_all(&fs, "/old"), vec![0x11; 4 * 0x200]);
    assert!(matches!(fs.get_entry_type("/new"), Err(SaveError::PathNotFound(_))));
    fs.verify().expect("verify");
}

// ---------------------------------------------------------------------------
// Scenario 4: host file persistence
// ---------------------------------------------------------------------------

#[test]
fn host_file_survives_reopen() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("save.bin");
    let options = FormatOptions {
        block_size: 0x400,
        data_block_count: 32,
        journal_block_count: 16,
        ..FormatOptions::default()
    };
    {
        let fs = SaveContainerFileSystem::create(&path, &options).expect("create");
        fs.create_directory("/a").expect("mkdir");
        fs.create_file("/a/b", 0x10).expect("create");
        write_all(&fs, "/a/b", 0, b"0123456789abcdef");
        fs.rename_directory("/a", "/renamed").expect("rename");
        fs.commit().expect("commit");
    }

    let fs = SaveContainerFileSystem::open_with_options(&path, &MountOptions { read_only: true })
        .expect("reopen");
    assert_eq!(read_all(&fs, "/renamed/b"), b"0123456789abcdef");
    assert!(matches!(fs.get_entry_type("/a"), Err(SaveError::PathNotFound(_))));
    let report = fs.verify().expect("verify");
    assert_eq!((report.directories, report.files), (2, 1));

    let size = FileStorage::open_read_only(&path).expect("raw").size();
    assert_eq!(size, options.container_size().expect("size"));
}

// ---------------------------------------------------------------------------
// Scenario 5: model check across remounts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum Op {
    Create(usize, u64),
    Delete(usize),
    Write(usize, u8),
    Commit,
}

const NAMES: [&str; 6] = ["/a", "/b", "/c", "/d/x", "/d/y", "/e"];

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (0..NAMES.len(), 0..0x600_u64).prop_map(|(name, size)| Op::Create(name, size)),
        2 => (0..NAMES.len()).prop_map(Op::Delete),
        2 => (0..NAMES.len(), any::<u8>()).prop_map(|(name, byte)| Op::Write(name, byte)),
        1 => Just(Op::Commit),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn committed_state_matches_model(ops in prop::collection::vec(op_strategy(), 1..12)) {
        let storage = MemoryStorage::new(0);
        let options = FormatOptions {
            block_size: 0x200,
            data_block_count: 64,
            journal_block_count: 64,
            duplex_block_size: 0x40,
            ..FormatOptions::default()
        };
        let fs = format_container(Arc::new(storage.clone()), &options).expect("format");
        fs.create_directory("/d").expect("mkdir");
        fs.commit().expect("commit");

        let mut live: BTreeMap<&str, Vec<u8>> = BTreeMap::new();
        let mut committed = live.clone();
        for op in ops {
            match op {
                Op::Create(name, size) => {
                    let path = NAMES[name];
                    let result = fs.create_file(path, size);
                    if live.contains_key(path) {
                        prop_assert!(matches!(result, Err(SaveError::AlreadyExists(_))));
                    } else {
                        result.expect("create");
                        live.insert(path, vec![0; usize::try_from(size).expect("size")]);
                    }
                }
                Op::Delete(name) => {
                    let path = NAMES[name];
                    let result = fs.delete_file(path);
                    if live.remove(path).is_some() {
                        result.expect("delete");
                    } else {
                        prop_assert!(matches!(result, Err(SaveError::PathNotFound(_))));
                    }
                }
                Op::Write(name, byte) => {
                    let path = NAMES[name];
                    if let Some(contents) = live.get_mut(path) {
                        if let Some(first) = contents.first_mut() {
                            *first = byte;
                            write_all(&fs, path, 0, &[byte]);
                        }
                    }
                }
                Op::Commit => {
                    fs.commit().expect("commit");
                    committed = live.clone();
                }
            }
        }
        drop(fs);

        let fs = mount(&storage);
        let mut found: Vec<String> = fs
            .walk_files()
            .expect("walk")
            .into_iter()
            .map(|(path, _)| path)
            .collect();
        found.sort();
        let expected: Vec<String> = committed.keys().map(|path| (*path).to_owned()).collect();
        prop_assert_eq!(found, expected);
        for (path, contents) in &committed {
            prop_assert_eq!(&read_all(&fs, path), contents);
        }
        fs.verify().expect("verify");
    }
}
