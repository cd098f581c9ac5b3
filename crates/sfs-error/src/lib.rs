#![forbid(unsafe_code)]
//! Error types for SaveFS.
//!
//! # Error Taxonomy
//!
//! SaveFS uses a two-layer error model:
//!
//! | Layer | Type | Crate | Purpose |
//! |-------|------|-------|---------|
//! | Parsing | `ParseError` | `sfs-types` | Format violations detected during byte parsing |
//! | Runtime | `SaveError` | `sfs-error` (this crate) | Errors returned by storages, tables and the filesystem |
//!
//! `sfs-error` does not depend on `sfs-types`. The conversion from
//! `ParseError` to `SaveError::Format` happens in `sfs-ondisk`, the first
//! crate that sees both.
//!
//! ## Error classes
//!
//! Every variant belongs to exactly one [`ErrorClass`]:
//!
//! | Class | Variants | Retry? |
//! |-------|----------|--------|
//! | `Format` | `Format` | never: wrong key upstream or a corrupt image |
//! | `Range` | `OutOfRange` | never: caller logic error |
//! | `Exhausted` | `AllocationTableFull`, `JournalFull`, `TableFull` | after freeing space or committing |
//! | `Lookup` | `PathNotFound`, `KeyNotFound`, `AlreadyExists`, `NotDirectory`, `IsDirectory`, `NotEmpty` | caller decides |
//! | `Corruption` | `Corruption` | never |
//! | `Io` | `Io` | medium-dependent |
//! | `Usage` | `Unsupported`, `ReadOnly`, `NameTooLong`, `InvalidPath` | never |
//!
//! The mapping is exhaustive (no wildcard arms) so adding a variant is a
//! compile error until it is classified.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Unified error type for all SaveFS operations.
#[derive(Debug, Error)]
pub enum SaveError {
    /// Operating system I/O error from a host-backed storage.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid container format: bad magic, inconsistent header sizes,
    /// overlapping remap entries.
    #[error("invalid container format: {0}")]
    Format(String),

    /// A linked structure on disk violates its invariants (cycle, dangling
    /// index, duplicate mapping). Detected by bounded walks.
    #[error("container corrupt at {offset:#x}: {detail}")]
    Corruption { offset: u64, detail: String },

    /// An access falls outside the addressable range of a storage.
    #[error("out of range: offset={offset:#x} len={len:#x} size={size:#x}")]
    OutOfRange { offset: u64, len: u64, size: u64 },

    /// The storage does not support this operation (e.g. writes to a
    /// read-only remap, resizing a fixed region).
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// The container or handle was opened read-only.
    #[error("read-only container")]
    ReadOnly,

    /// The allocation table's free list is shorter than the request.
    #[error("allocation table full: requested {requested} blocks, {available} free")]
    AllocationTableFull { requested: u64, available: u64 },

    /// No unassigned physical block is left for a journal redirect.
    #[error("journal full: commit before writing more blocks")]
    JournalFull,

    /// A directory or file table cannot hold another entry.
    #[error("{0} table full")]
    TableFull(&'static str),

    /// A path failed to resolve at some component.
    #[error("path not found: {0}")]
    PathNotFound(String),

    /// An index-based lookup referenced a missing or free entry.
    #[error("key not found: {0}")]
    KeyNotFound(String),

    /// Target already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// A path component is not a directory.
    #[error("not a directory: {0}")]
    NotDirectory(String),

    /// A file operation was attempted on a directory.
    #[error("is a directory: {0}")]
    IsDirectory(String),

    /// Deleting a directory that still has children.
    #[error("directory not empty: {0}")]
    NotEmpty(String),

    /// A path component exceeds the table entry name field.
    #[error("name too long: {0}")]
    NameTooLong(String),

    /// A path is malformed (`..`, empty, or moves a directory under itself).
    #[error("invalid path: {0}")]
    InvalidPath(String),
}

/// Taxonomy bucket of a [`SaveError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorClass {
    Format,
    Range,
    Exhausted,
    Lookup,
    Corruption,
    Io,
    Usage,
}

impl SaveError {
    /// Shorthand for [`SaveError::Corruption`].
    pub fn corruption(offset: u64, detail: impl Into<String>) -> Self {
        Self::Corruption {
            offset,
            detail: detail.into(),
        }
    }

    /// Classify this error.
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Io(_) => ErrorClass::Io,
            Self::Format(_) => ErrorClass::Format,
            Self::Corruption { .. } => ErrorClass::Corruption,
            Self::OutOfRange { .. } => ErrorClass::Range,
            Self::AllocationTableFull { .. } | Self::JournalFull | Self::TableFull(_) => {
                ErrorClass::Exhausted
            }
            Self::PathNotFound(_)
            | Self::KeyNotFound(_)
            | Self::AlreadyExists(_)
            | Self::NotDirectory(_)
            | Self::IsDirectory(_)
            | Self::NotEmpty(_) => ErrorClass::Lookup,
            Self::Unsupported(_) | Self::ReadOnly | Self::NameTooLong(_) | Self::InvalidPath(_) => {
                ErrorClass::Usage
            }
        }
    }

    /// Whether the container itself is unusable after this error.
    ///
    /// Format and corruption errors mean the image (or the key used to
    /// decrypt it upstream) is bad; nothing the caller retries will help.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self.class(), ErrorClass::Format | ErrorClass::Corruption)
    }
}

/// Result alias using `SaveError`.
pub type Result<T> = std::result::Result<T, SaveError>;
