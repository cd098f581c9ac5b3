//! Path splitting.

use sfs_error::{Result, SaveError};
use sfs_types::TABLE_NAME_MAX;

/// Split `path` into its name components.
///
/// Empty components and `.` are skipped, so `"/a//./b/"` is `["a", "b"]`
/// and `"/"` is the root. `..` is rejected.
pub fn components(path: &str) -> Result<Vec<&str>> {
    let mut out = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => return Err(SaveError::InvalidPath(path.to_owned())),
            name => {
                if name.len() > TABLE_NAME_MAX {
                    return Err(SaveError::NameTooLong(name.to_owned()));
                }
                if name.contains('\0') {
                    return Err(SaveError::InvalidPath(path.to_owned()));
                }
                out.push(name);
            }
        }
    }
    Ok(out)
}

/// Split `path` into its parent components and final name. The root has
/// no final name.
pub fn split_leaf(path: &str) -> Result<(Vec<&str>, &str)> {
    let mut parts = components(path)?;
    let leaf = parts
        .pop()
        .ok_or_else(|| SaveError::InvalidPath(path.to_owned()))?;
    Ok((parts, leaf))
}

/// Join a directory path and a child name with exactly one separator.
#[must_use]
pub fn join(directory: &str, name: &str) -> String {
    let trimmed = directory.trim_end_matches('/');
    format!("{trimmed}/{name}")
}
