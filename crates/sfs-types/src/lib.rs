#![forbid(unsafe_code)]
//! Shared primitives for the SaveFS container format.
//!
//! Pure helpers with no I/O: the parse-level error type, little-endian field
//! access, bitmap manipulation, alignment math, and the fixed offsets and
//! magics of the container header.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

// ── Container header geometry ───────────────────────────────────────────────

/// Size of the fixed container header region.
pub const HEADER_SIZE: usize = 0x4000;

pub const CMAC_OFFSET: usize = 0x000;
pub const CMAC_SIZE: usize = 0x10;

pub const LAYOUT_OFFSET: usize = 0x100;
pub const LAYOUT_SIZE: usize = 0x200;

pub const DUPLEX_HEADER_OFFSET: usize = 0x300;
pub const DUPLEX_HEADER_SIZE: usize = 0x44;

pub const JOURNAL_HEADER_OFFSET: usize = 0x408;
pub const JOURNAL_HEADER_SIZE: usize = 0x30;

pub const SAVE_HEADER_OFFSET: usize = 0x608;
pub const SAVE_HEADER_SIZE: usize = 0x48;

pub const FILE_REMAP_HEADER_OFFSET: usize = 0x650;
pub const META_REMAP_HEADER_OFFSET: usize = 0x690;
pub const REMAP_HEADER_SIZE: usize = 0x40;

/// Size of one serialized remap `MapEntry`.
pub const MAP_ENTRY_SIZE: usize = 0x20;

/// Size of one directory/file table entry.
pub const TABLE_ENTRY_SIZE: usize = 0x60;

/// Maximum name length stored in a table entry (NUL-terminated when shorter).
pub const TABLE_NAME_MAX: usize = 0x40;

/// Size of one allocation-table entry (`prev`, `next`).
pub const ALLOCATION_ENTRY_SIZE: usize = 8;

pub const LAYOUT_MAGIC: u32 = u32::from_le_bytes(*b"DISF");
pub const DUPLEX_MAGIC: u32 = u32::from_le_bytes(*b"DPFS");
pub const JOURNAL_MAGIC: u32 = u32::from_le_bytes(*b"JNGL");
pub const SAVE_MAGIC: u32 = u32::from_le_bytes(*b"SAVE");
pub const REMAP_MAGIC: u32 = u32::from_le_bytes(*b"RMAP");

pub const LAYOUT_VERSION: u32 = 0x0004_0000;
pub const DUPLEX_VERSION: u32 = 0x0001_0000;
pub const JOURNAL_VERSION: u32 = 0x0001_0000;
pub const SAVE_VERSION: u32 = 0x0006_0000;
pub const REMAP_VERSION: u32 = 0x0001_0000;

/// The "no block" sentinel for allocation-table block indices.
pub const END_OF_CHAIN: u32 = u32::MAX;

/// The "no entry" sentinel for directory/file table indices.
pub const NO_ENTRY: u32 = u32::MAX;

/// Validated block size (power of two in 64..=1 MiB).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockSize(u32);

impl BlockSize {
    pub const MIN: u32 = 0x40;
    pub const MAX: u32 = 0x10_0000;

    /// Create a `BlockSize` if `value` is a power of two in [`Self::MIN`, `Self::MAX`].
    pub fn new(value: u32) -> Result<Self, ParseError> {
        if !value.is_power_of_two() || !(Self::MIN..=Self::MAX).contains(&value) {
            return Err(ParseError::InvalidField {
                field: "block_size",
                reason: "must be power of two in 0x40..=0x100000",
            });
        }
        Ok(Self(value))
    }

    /// Create a `BlockSize` from its log2 power, as stored in duplex layer headers.
    pub fn from_power(power: u32) -> Result<Self, ParseError> {
        let value = 1_u32.checked_shl(power).ok_or(ParseError::InvalidField {
            field: "block_size_power",
            reason: "shift out of range",
        })?;
        Self::new(value)
    }

    #[must_use]
    pub fn get(self) -> u32 {
        self.0
    }

    #[must_use]
    pub fn as_u64(self) -> u64 {
        u64::from(self.0)
    }

    /// Number of bits to shift to convert between bytes and blocks.
    #[must_use]
    pub fn shift(self) -> u32 {
        self.0.trailing_zeros()
    }

    /// Block index containing `byte_offset`.
    #[must_use]
    pub fn block_of(self, byte_offset: u64) -> u64 {
        byte_offset >> self.shift()
    }

    /// Offset of `byte_offset` within its block.
    #[must_use]
    pub fn offset_in_block(self, byte_offset: u64) -> u64 {
        byte_offset & (self.as_u64() - 1)
    }

    /// Number of blocks needed to hold `bytes` (rounded up).
    #[must_use]
    pub fn blocks_for(self, bytes: u64) -> u64 {
        bytes.div_ceil(self.as_u64())
    }
}

impl fmt::Display for BlockSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid magic: expected {expected:#x}, got {actual:#x}")]
    InvalidMagic { expected: u64, actual: u64 },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("integer conversion failed: {field}")]
    IntegerConversion { field: &'static str },
}

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&data[offset..end])
}

#[inline]
pub fn ensure_slice_mut(data: &mut [u8], offset: usize, len: usize) -> Result<&mut [u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    let actual = data.len().saturating_sub(offset);
    data.get_mut(offset..end)
        .ok_or(ParseError::InsufficientData {
            needed: len,
            offset,
            actual,
        })
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    Ok(u32::from_le_bytes(read_fixed::<4>(data, offset)?))
}

#[inline]
pub fn read_le_u64(data: &[u8], offset: usize) -> Result<u64, ParseError> {
    Ok(u64::from_le_bytes(read_fixed::<8>(data, offset)?))
}

#[inline]
pub fn read_le_i64(data: &[u8], offset: usize) -> Result<i64, ParseError> {
    Ok(i64::from_le_bytes(read_fixed::<8>(data, offset)?))
}

#[inline]
pub fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> Result<[u8; N], ParseError> {
    let bytes = ensure_slice(data, offset, N)?;
    let mut out = [0_u8; N];
    out.copy_from_slice(bytes);
    Ok(out)
}

#[inline]
pub fn write_le_u32(data: &mut [u8], offset: usize, value: u32) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 4)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

#[inline]
pub fn write_le_u64(data: &mut [u8], offset: usize, value: u64) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 8)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

#[inline]
pub fn write_bytes(data: &mut [u8], offset: usize, bytes: &[u8]) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, bytes.len())?.copy_from_slice(bytes);
    Ok(())
}

/// Check a little-endian `u32` magic at `offset`.
pub fn expect_magic(data: &[u8], offset: usize, expected: u32) -> Result<(), ParseError> {
    let actual = read_le_u32(data, offset)?;
    if actual != expected {
        return Err(ParseError::InvalidMagic {
            expected: u64::from(expected),
            actual: u64::from(actual),
        });
    }
    Ok(())
}

#[must_use]
pub fn trim_nul_padded(bytes: &[u8]) -> &[u8] {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    &bytes[..end]
}

// ── Bitmap operations ───────────────────────────────────────────────────────
//
// Bit `i` lives in byte `i / 8` at position `i % 8` (LSB first).

/// Number of bytes needed to hold `bits` bits.
#[must_use]
pub fn bitmap_len(bits: u64) -> u64 {
    bits.div_ceil(8)
}

/// Get bit `idx` from a bitmap byte slice. Out-of-range bits read as clear.
#[must_use]
pub fn bitmap_get(bitmap: &[u8], idx: u64) -> bool {
    let Ok(byte_idx) = usize::try_from(idx / 8) else {
        return false;
    };
    bitmap
        .get(byte_idx)
        .is_some_and(|byte| (byte >> (idx % 8)) & 1 == 1)
}

/// Set bit `idx` in a bitmap byte slice.
pub fn bitmap_set(bitmap: &mut [u8], idx: u64) {
    if let Some(byte) = usize::try_from(idx / 8).ok().and_then(|i| bitmap.get_mut(i)) {
        *byte |= 1 << (idx % 8);
    }
}

/// Clear bit `idx` in a bitmap byte slice.
pub fn bitmap_clear(bitmap: &mut [u8], idx: u64) {
    if let Some(byte) = usize::try_from(idx / 8).ok().and_then(|i| bitmap.get_mut(i)) {
        *byte &= !(1 << (idx % 8));
    }
}

/// Toggle bit `idx` in a bitmap byte slice.
pub fn bitmap_flip(bitmap: &mut [u8], idx: u64) {
    if let Some(byte) = usize::try_from(idx / 8).ok().and_then(|i| bitmap.get_mut(i)) {
        *byte ^= 1 << (idx % 8);
    }
}

/// Find the first set bit in `[start, count)`.
#[must_use]
pub fn bitmap_find_set(bitmap: &[u8], count: u64, start: u64) -> Option<u64> {
    (start..count).find(|&idx| bitmap_get(bitmap, idx))
}

/// Count set bits among the first `count` bits.
#[must_use]
pub fn bitmap_count_set(bitmap: &[u8], count: u64) -> u64 {
    (0..count).filter(|&idx| bitmap_get(bitmap, idx)).count() as u64
}

// ── Checked arithmetic helpers ──────────────────────────────────────────────

/// Round `value` up to the nearest multiple of `alignment`.
///
/// `alignment` must be a non-zero power of two; returns `None` on overflow
/// or if `alignment` is invalid.
#[must_use]
pub fn align_up(value: u64, alignment: u64) -> Option<u64> {
    if alignment == 0 || !alignment.is_power_of_two() {
        return None;
    }
    let mask = alignment - 1;
    value.checked_add(mask).map(|v| v & !mask)
}

/// Narrow a `u64` to `usize` with an explicit error path.
pub fn u64_to_usize(value: u64, field: &'static str) -> Result<usize, ParseError> {
    usize::try_from(value).map_err(|_| ParseError::IntegerConversion { field })
}

/// Reinterpret a signed on-disk 64-bit offset as unsigned, rejecting negatives.
pub fn i64_to_u64(value: i64, field: &'static str) -> Result<u64, ParseError> {
    u64::try_from(value).map_err(|_| ParseError::IntegerConversion { field })
}
