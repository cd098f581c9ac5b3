//! Copy a container's tree out to the host file system.

use crate::{EnumerateMode, OpenMode, SaveContainerFileSystem};
use serde::{Deserialize, Serialize};
use sfs_dir::{EntryType, path};
use sfs_error::{Result, SaveError};
use sfs_storage::Storage;
use std::fs;
use std::io::Write;
use std::path::Path;
use tracing::{debug, info};

const CHUNK: usize = 0x4000;

/// Totals reported by [`extract_to_dir`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ExtractSummary {
    pub directories: u64,
    pub files: u64,
    pub bytes: u64,
}

fn host_name(name: &str) -> Result<&str> {
    if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\']) {
        return Err(SaveError::InvalidPath(name.to_owned()));
    }
    Ok(name)
}

/// Recreate every directory and file of `fs` beneath `host_dir`.
pub fn extract_to_dir(fs: &SaveContainerFileSystem, host_dir: &Path) -> Result<ExtractSummary> {
    fs::create_dir_all(host_dir)?;
    let mut summary = ExtractSummary::default();
    extract_directory(fs, "/", host_dir, &mut summary)?;
    info!(
        directories = summary.directories,
        files = summary.files,
        bytes = summary.bytes,
        target = %host_dir.display(),
        "extract_done"
    );
    Ok(summary)
}

fn extract_directory(
    fs: &SaveContainerFileSystem,
    directory: &str,
    host_dir: &Path,
    summary: &mut ExtractSummary,
) -> Result<()> {
    for entry in fs.open_directory(directory, EnumerateMode::All)? {
        let target = host_dir.join(host_name(&entry.name)?);
        let child = path::join(directory, &entry.name);
        match entry.kind {
            EntryType::Directory => {
                fs::create_dir_all(&target)?;
                summary.directories += 1;
                extract_directory(fs, &child, &target, summary)?;
            }
            EntryType::File => {
                summary.bytes += extract_file(fs, &child, &target)?;
                summary.files += 1;
            }
        }
    }
    Ok(())
}

fn extract_file(fs: &SaveContainerFileSystem, source: &str, target: &Path) -> Result<u64> {
    let file = fs.open_file(source, OpenMode::READ)?;
    let mut out = fs::File::create(target)?;
    let size = file.size();
    let mut buf = vec![0_u8; CHUNK];
    let mut offset = 0_u64;
    while offset < size {
        let step = usize::try_from(size - offset).map_or(CHUNK, |left| left.min(CHUNK));
        file.read_at(offset, &mut buf[..step])?;
        out.write_all(&buf[..step])?;
        offset += step as u64;
    }
    out.flush()?;
    debug!(source, size, "extract_file");
    Ok(size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FormatOptions, format_container};
    use sfs_storage::MemoryStorage;
    use std::sync::Arc;

    #[test]
    fn extracts_nested_tree() {
        let options = FormatOptions {
            block_size: 0x200,
            data_block_count: 64,
            journal_block_count: 64,
            duplex_block_size: 0x40,
            ..FormatOptions::default()
        };
        let fs = format_container(Arc::new(MemoryStorage::new(0)), &options).expect("format");
        fs.create_directory("/save").expect("mkdir");
        fs.create_directory("/save/empty").expect("mkdir");
        fs.create_file("/save/big.bin", 0x4100).expect("create");
        fs.create_file("/top.txt", 5).expect("create");
        let big = fs.open_file("/save/big.bin", OpenMode::WRITE).expect("open");
        big.write_at(0x40FF, &[0xAB]).expect("write");
        let top = fs.open_file("/top.txt", OpenMode::WRITE).expect("open");
        top.write_at(0, b"hello").expect("write");

        let dir = tempfile::tempdir().expect("tempdir");
        let summary = extract_to_dir(&fs, dir.path()).expect("extract");
        assert_eq!(
            summary,
            ExtractSummary {
                directories: 2,
                files: 2,
                bytes: 0x4105,
            }
        );
        assert_eq!(fs::read(dir.path().join("top.txt")).expect("read"), b"hello");
        let big = fs::read(dir.path().join("save/big.bin")).expect("read");
        assert_eq!(big.len(), 0x4100);
        assert_eq!(big[0x40FF], 0xAB);
        assert!(big[..0x40FF].iter().all(|byte| *byte == 0));
        assert!(dir.path().join("save/empty").is_dir());
    }

    #[test]
    fn rejects_unsafe_host_names() {
        assert!(host_name("..").is_err());
        assert!(host_name("a\\b").is_err());
        assert!(host_name("ok.bin").is_ok());
    }
}
