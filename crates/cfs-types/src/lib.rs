#![forbid(unsafe_code)]
//! Shared newtypes and on-disk codec helpers for the cinderfs extent engine.
//!
//! Everything here is dependency-free (besides serde/thiserror) so that every
//! other crate in the workspace can use these types without cycles.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// End of the reserved low region; bytes below this are never handed to the
/// allocator and the background scan starts at or above it.
pub const SUPERZONE_END: u64 = 1024 * 1024;

// ── Item types ──────────────────────────────────────────────────────────────
//
// Composite keys are ordered (objectid, item_type, offset), so these values
// fix the relative position of an extent's records: the extent item itself
// sorts first, followed by its keyed backrefs in type order.

/// Extent record: key = (bytenr, EXTENT_ITEM, num_bytes).
pub const EXTENT_ITEM_KEY: u8 = 168;
/// Keyed tree-block backref: key = (bytenr, TREE_BLOCK_REF, root).
pub const TREE_BLOCK_REF_KEY: u8 = 176;
/// Keyed data backref: key = (bytenr, EXTENT_DATA_REF, owner-hash).
pub const EXTENT_DATA_REF_KEY: u8 = 178;
/// Keyed shared tree-block backref: key = (bytenr, SHARED_BLOCK_REF, parent).
pub const SHARED_BLOCK_REF_KEY: u8 = 182;
/// Keyed shared data backref: key = (bytenr, SHARED_DATA_REF, parent).
pub const SHARED_DATA_REF_KEY: u8 = 184;
/// Block group summary record: key = (start, BLOCK_GROUP_ITEM, length).
pub const BLOCK_GROUP_ITEM_KEY: u8 = 192;

// ── Allocation class and redundancy profile flags ───────────────────────────

pub const ALLOC_DATA: u64 = 1 << 0;
pub const ALLOC_SYSTEM: u64 = 1 << 1;
pub const ALLOC_METADATA: u64 = 1 << 2;
pub const PROFILE_RAID0: u64 = 1 << 3;
pub const PROFILE_RAID1: u64 = 1 << 4;
pub const PROFILE_DUP: u64 = 1 << 5;
pub const PROFILE_RAID10: u64 = 1 << 6;

/// Mask selecting the allocation-class bits of a flags word.
pub const ALLOC_CLASS_MASK: u64 = ALLOC_DATA | ALLOC_SYSTEM | ALLOC_METADATA;
/// Mask selecting the redundancy-profile bits of a flags word.
pub const PROFILE_MASK: u64 = PROFILE_RAID0 | PROFILE_RAID1 | PROFILE_DUP | PROFILE_RAID10;

/// Render class+profile flags for logs ("metadata|raid1").
#[must_use]
pub fn flags_to_string(flags: u64) -> String {
    let mut parts = Vec::new();
    if flags & ALLOC_DATA != 0 {
        parts.push("data");
    }
    if flags & ALLOC_SYSTEM != 0 {
        parts.push("system");
    }
    if flags & ALLOC_METADATA != 0 {
        parts.push("metadata");
    }
    if flags & PROFILE_RAID0 != 0 {
        parts.push("raid0");
    }
    if flags & PROFILE_RAID1 != 0 {
        parts.push("raid1");
    }
    if flags & PROFILE_DUP != 0 {
        parts.push("dup");
    }
    if flags & PROFILE_RAID10 != 0 {
        parts.push("raid10");
    }
    if parts.is_empty() {
        parts.push("none");
    }
    parts.join("|")
}

// ── Extent record flags ─────────────────────────────────────────────────────

/// The extent holds file data.
pub const EXTENT_FLAG_DATA: u64 = 1 << 0;
/// The extent holds a tree block (carries level + key info).
pub const EXTENT_FLAG_TREE_BLOCK: u64 = 1 << 1;
/// Tree-block refs are counted through parent blocks rather than roots.
pub const EXTENT_FLAG_FULL_BACKREF: u64 = 1 << 8;

/// All extent flags this build understands; anything else fails decode.
pub const EXTENT_FLAG_KNOWN_MASK: u64 =
    EXTENT_FLAG_DATA | EXTENT_FLAG_TREE_BLOCK | EXTENT_FLAG_FULL_BACKREF;

// ── Newtypes ────────────────────────────────────────────────────────────────

/// Logical byte address within the pool.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Bytenr(pub u64);

impl Bytenr {
    pub const ZERO: Self = Self(0);

    /// Add a byte count, returning `None` on overflow.
    #[must_use]
    pub fn checked_add(self, bytes: u64) -> Option<Self> {
        self.0.checked_add(bytes).map(Self)
    }

    /// Subtract a byte count, returning `None` on underflow.
    #[must_use]
    pub fn checked_sub(self, bytes: u64) -> Option<Self> {
        self.0.checked_sub(bytes).map(Self)
    }

    /// Round up to the nearest multiple of `alignment` (non-zero power of two).
    #[must_use]
    pub fn align_up(self, alignment: u64) -> Option<Self> {
        align_up(self.0, alignment).map(Self)
    }
}

impl fmt::Display for Bytenr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of an owning tree (root) in backref records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TreeId(pub u64);

impl TreeId {
    /// The tree of trees.
    pub const ROOT: Self = Self(1);
    /// The extent tree itself.
    pub const EXTENT: Self = Self(2);
    /// The default filesystem tree.
    pub const FS: Self = Self(5);
}

impl fmt::Display for TreeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Transaction generation counter stamped into extent records.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Generation(pub u64);

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Sequence number ordering delayed references within one extent's chain.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct RefSeq(pub u64);

// ── Composite item key ──────────────────────────────────────────────────────

/// Composite key for the ordered key-value store.
///
/// Ordering is lexicographic over (objectid, item_type, offset), which the
/// derived `Ord` provides through field order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ItemKey {
    pub objectid: u64,
    pub item_type: u8,
    pub offset: u64,
}

impl ItemKey {
    #[must_use]
    pub fn new(objectid: u64, item_type: u8, offset: u64) -> Self {
        Self {
            objectid,
            item_type,
            offset,
        }
    }

    /// Key of the extent record covering `[bytenr, bytenr + num_bytes)`.
    #[must_use]
    pub fn extent_item(bytenr: Bytenr, num_bytes: u64) -> Self {
        Self::new(bytenr.0, EXTENT_ITEM_KEY, num_bytes)
    }

    /// Key of the block-group summary record for `[start, start + length)`.
    #[must_use]
    pub fn block_group_item(start: Bytenr, length: u64) -> Self {
        Self::new(start.0, BLOCK_GROUP_ITEM_KEY, length)
    }

    /// Smallest key with this objectid (start of an object's key range).
    #[must_use]
    pub fn object_start(objectid: u64) -> Self {
        Self::new(objectid, 0, 0)
    }
}

impl fmt::Display for ItemKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({} {} {})", self.objectid, self.item_type, self.offset)
    }
}

// ── Parse errors ────────────────────────────────────────────────────────────

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
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
    #[error("integer conversion failed: {field}")]
    IntegerConversion { field: &'static str },
}

// ── Little-endian codec helpers ─────────────────────────────────────────────

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
pub fn read_le_u8(data: &[u8], offset: usize) -> Result<u8, ParseError> {
    let bytes = ensure_slice(data, offset, 1)?;
    Ok(bytes[0])
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_le_u64(data: &[u8], offset: usize) -> Result<u64, ParseError> {
    let bytes = ensure_slice(data, offset, 8)?;
    Ok(u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ]))
}

#[inline]
pub fn put_le_u8(out: &mut Vec<u8>, value: u8) {
    out.push(value);
}

#[inline]
pub fn put_le_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes());
}

#[inline]
pub fn put_le_u64(out: &mut Vec<u8>, value: u64) {
    out.extend_from_slice(&value.to_le_bytes());
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn item_key_ordering_is_lexicographic() {
        let a = ItemKey::new(1, 10, 0);
        let b = ItemKey::new(1, 10, 1);
        let c = ItemKey::new(1, 11, 0);
        let d = ItemKey::new(2, 0, 0);
        assert!(a < b);
        assert!(b < c);
        assert!(c < d);
    }

    #[test]
    fn extent_records_sort_before_their_keyed_backrefs() {
        let item = ItemKey::extent_item(Bytenr(4096), 16384);
        let tree_ref = ItemKey::new(4096, TREE_BLOCK_REF_KEY, 5);
        let data_ref = ItemKey::new(4096, EXTENT_DATA_REF_KEY, 0xDEAD_BEEF);
        let shared = ItemKey::new(4096, SHARED_DATA_REF_KEY, 8192);
        assert!(item < tree_ref);
        assert!(tree_ref < data_ref);
        assert!(data_ref < shared);
    }

    #[test]
    fn read_write_helpers_round_trip() {
        let mut buf = Vec::new();
        put_le_u64(&mut buf, 0x1122_3344_5566_7788);
        put_le_u32(&mut buf, 0xAABB_CCDD);
        put_le_u8(&mut buf, 0x7F);

        assert_eq!(read_le_u64(&buf, 0).expect("u64"), 0x1122_3344_5566_7788);
        assert_eq!(read_le_u32(&buf, 8).expect("u32"), 0xAABB_CCDD);
        assert_eq!(read_le_u8(&buf, 12).expect("u8"), 0x7F);
    }

    #[test]
    fn read_helpers_reject_truncation() {
        let buf = [0_u8; 4];
        assert!(matches!(
            read_le_u64(&buf, 0),
            Err(ParseError::InsufficientData { .. })
        ));
        assert!(matches!(
            read_le_u32(&buf, 2),
            Err(ParseError::InsufficientData { .. })
        ));
    }

    #[test]
    fn bytenr_checked_ops() {
        assert_eq!(Bytenr(10).checked_add(5), Some(Bytenr(15)));
        assert_eq!(Bytenr(u64::MAX).checked_add(1), None);
        assert_eq!(Bytenr(10).checked_sub(3), Some(Bytenr(7)));
        assert_eq!(Bytenr(0).checked_sub(1), None);
    }

    #[test]
    fn align_up_boundaries() {
        assert_eq!(align_up(0, 4096), Some(0));
        assert_eq!(align_up(1, 4096), Some(4096));
        assert_eq!(align_up(4096, 4096), Some(4096));
        assert_eq!(align_up(u64::MAX, 4096), None);
        assert_eq!(align_up(100, 0), None);
        assert_eq!(align_up(100, 3), None);
    }

    #[test]
    fn flags_render_for_logs() {
        assert_eq!(
            flags_to_string(ALLOC_METADATA | PROFILE_RAID1),
            "metadata|raid1"
        );
        assert_eq!(flags_to_string(ALLOC_DATA), "data");
        assert_eq!(flags_to_string(0), "none");
    }

    #[test]
    fn class_and_profile_masks_are_disjoint() {
        assert_eq!(ALLOC_CLASS_MASK & PROFILE_MASK, 0);
        let combined = ALLOC_DATA | PROFILE_RAID10;
        assert_eq!(combined & ALLOC_CLASS_MASK, ALLOC_DATA);
        assert_eq!(combined & PROFILE_MASK, PROFILE_RAID10);
    }
}
