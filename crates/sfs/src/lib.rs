#![forbid(unsafe_code)]
//! SaveFS public API facade.
//!
//! Re-exports `sfs-core` through a stable external interface. The CLI and
//! other downstream consumers depend on this crate.

pub use sfs_core::*;
