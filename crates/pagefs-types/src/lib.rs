#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Size in bytes of one page, the storage atom.
pub const PAGE_SIZE: usize = 4096;

/// Number of 8-byte slots in one index page.
pub const SLOTS_PER_PAGE: usize = PAGE_SIZE / 8;

/// Payload slots per index page; the last slot is the forward link.
pub const PAYLOAD_SLOTS: usize = SLOTS_PER_PAGE - 1;

/// Bytes addressable through the payload of a single index page.
pub const INDEX_SPAN: u64 = (PAYLOAD_SLOTS * PAGE_SIZE) as u64;

/// Capacity of the page table.
pub const MAX_BLOCKS: usize = 1_048_576;

/// Capacity of the node-id space.
pub const MAX_NODES: u64 = 1_048_576;

/// Maximum byte length of one path component.
pub const NAME_MAX: usize = 255;

/// Stable identifier of a page within the page store.
///
/// Inside an index page a raw slot value of `0` means "empty slot" (or, in
/// the forward-link slot, "end of chain"). That encoding is sound because
/// the very first allocation, id 0, is the root inode's own page and
/// never appears as a chain entry. API surfaces carry `Option<BlockId>`
/// instead of the raw sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockId(pub u64);

impl BlockId {
    /// Decode a raw on-page slot value; `0` is the empty sentinel.
    #[must_use]
    pub fn from_slot(raw: u64) -> Option<Self> {
        (raw != 0).then_some(Self(raw))
    }

    /// Encode an optional id back into the on-page slot representation.
    #[must_use]
    pub fn to_slot(id: Option<Self>) -> u64 {
        id.map_or(0, |b| b.0)
    }
}

/// Stable identifier of an inode; `0` is the root directory.
///
/// Ids are issued monotonically and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub u64);

impl NodeId {
    pub const ROOT: Self = Self(0);
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── POSIX file mode constants ───────────────────────────────────────────────

/// File type mask (upper 4 bits of mode).
pub const S_IFMT: u32 = 0o170_000;
/// Directory.
pub const S_IFDIR: u32 = 0o040_000;
/// Regular file.
pub const S_IFREG: u32 = 0o100_000;

// ── Size / offset arithmetic ────────────────────────────────────────────────

/// Number of index pages a file of `size` bytes needs.
///
/// The head index page exists even for an empty file.
#[must_use]
pub fn index_pages_for(size: u64) -> u64 {
    if size == 0 { 1 } else { size.div_ceil(INDEX_SPAN) }
}

/// Number of data pages a file of `size` bytes needs.
#[must_use]
pub fn data_pages_for(size: u64) -> u64 {
    size.div_ceil(PAGE_SIZE as u64)
}

/// Decomposition of a byte offset within a file into chain coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilePos {
    /// Which index page along the chain (0 = head).
    pub index_ordinal: u64,
    /// Payload slot within that index page, in `[0, PAYLOAD_SLOTS)`.
    pub slot: usize,
    /// Byte offset within the data page, in `[0, PAGE_SIZE)`.
    pub byte: usize,
}

impl FilePos {
    #[must_use]
    #[allow(clippy::cast_possible_truncation)] // both moduli are < PAGE_SIZE * PAYLOAD_SLOTS
    pub fn of(offset: u64) -> Self {
        Self {
            index_ordinal: offset / INDEX_SPAN,
            slot: ((offset % INDEX_SPAN) / PAGE_SIZE as u64) as usize,
            byte: (offset % PAGE_SIZE as u64) as usize,
        }
    }
}

// ── Little-endian codec helpers ─────────────────────────────────────────────

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
}

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], CodecError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(CodecError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };
    if end > data.len() {
        return Err(CodecError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }
    Ok(&data[offset..end])
}

#[inline]
pub fn read_le_u16(data: &[u8], offset: usize) -> Result<u16, CodecError> {
    let bytes = ensure_slice(data, offset, 2)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, CodecError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_le_u64(data: &[u8], offset: usize) -> Result<u64, CodecError> {
    let bytes = ensure_slice(data, offset, 8)?;
    Ok(u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ]))
}

#[inline]
pub fn read_le_i64(data: &[u8], offset: usize) -> Result<i64, CodecError> {
    read_le_u64(data, offset).map(|v| v as i64)
}

#[inline]
pub fn write_le_u16(data: &mut [u8], offset: usize, value: u16) {
    data[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

#[inline]
pub fn write_le_u32(data: &mut [u8], offset: usize, value: u32) {
    data[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

#[inline]
pub fn write_le_u64(data: &mut [u8], offset: usize, value: u64) {
    data[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

#[inline]
pub fn write_le_i64(data: &mut [u8], offset: usize, value: i64) {
    write_le_u64(data, offset, value as u64);
}
