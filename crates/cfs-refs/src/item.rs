//! Persisted extent-engine record layouts.
//!
//! All records are little-endian and round-trip through `encode`/`parse`.
//!
//! The extent item starts with a fixed header (refs, generation, flags),
//! carries optional tree-block info when `EXTENT_FLAG_TREE_BLOCK` is set,
//! and ends with zero or more inline backref sub-records ordered by
//! (type, disambiguator) so a lookup is a single scan. When the item would
//! outgrow [`MAX_EXTENT_ITEM_SIZE`], new referencers go to separate keyed
//! records instead (see `backref`).

use cfs_types::{
    put_le_u32, put_le_u64, put_le_u8, read_le_u32, read_le_u64, read_le_u8, Bytenr, Generation,
    ItemKey, ParseError, TreeId, EXTENT_DATA_REF_KEY, EXTENT_FLAG_KNOWN_MASK,
    EXTENT_FLAG_TREE_BLOCK, SHARED_BLOCK_REF_KEY, SHARED_DATA_REF_KEY, TREE_BLOCK_REF_KEY,
};
use serde::{Deserialize, Serialize};

/// Upper bound on an encoded extent item; a backref that would push the item
/// past this escalates to a keyed record. Escalation is one-way.
pub const MAX_EXTENT_ITEM_SIZE: usize = 256;

/// Fixed extent-item header: refs + generation + flags.
const EXTENT_ITEM_HEADER: usize = 24;
/// Tree-block info: key (17) + level (1).
const TREE_BLOCK_INFO_SIZE: usize = 18;

// ── Logical owners ──────────────────────────────────────────────────────────

/// One logical owner of an extent.
///
/// Tree blocks are referenced either by owning root or, once shared, by the
/// specific parent block; data extents additionally carry the owning object
/// and file offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RefOwner {
    TreeBlock { root: TreeId },
    SharedBlock { parent: Bytenr },
    Data { root: TreeId, objectid: u64, offset: u64 },
    SharedData { parent: Bytenr },
}

impl RefOwner {
    /// Keyed-record item type for this owner.
    #[must_use]
    pub fn ref_type(&self) -> u8 {
        match self {
            Self::TreeBlock { .. } => TREE_BLOCK_REF_KEY,
            Self::SharedBlock { .. } => SHARED_BLOCK_REF_KEY,
            Self::Data { .. } => EXTENT_DATA_REF_KEY,
            Self::SharedData { .. } => SHARED_DATA_REF_KEY,
        }
    }

    /// Key-offset disambiguator: root id, parent bytenr, or owner hash.
    #[must_use]
    pub fn disambiguator(&self) -> u64 {
        match self {
            Self::TreeBlock { root } => root.0,
            Self::SharedBlock { parent } | Self::SharedData { parent } => parent.0,
            Self::Data {
                root,
                objectid,
                offset,
            } => data_ref_hash(*root, *objectid, *offset),
        }
    }

    /// Whether this owner addresses the extent through a parent block.
    #[must_use]
    pub fn is_shared(&self) -> bool {
        matches!(self, Self::SharedBlock { .. } | Self::SharedData { .. })
    }
}

/// Disambiguating hash for data-extent owners sharing one extent
/// (deduplication/clone). Collisions are resolved by linear probing at
/// keyed-record insertion.
#[must_use]
pub fn data_ref_hash(root: TreeId, objectid: u64, offset: u64) -> u64 {
    let mut buf = [0_u8; 24];
    buf[0..8].copy_from_slice(&root.0.to_le_bytes());
    buf[8..16].copy_from_slice(&objectid.to_le_bytes());
    buf[16..24].copy_from_slice(&offset.to_le_bytes());
    u64::from(crc32c::crc32c(&buf))
}

// ── Inline backref sub-records ──────────────────────────────────────────────

/// A backref embedded in the extent item.
///
/// Tree-block refs are presence-only (the extent's total refcount carries
/// the multiplicity); data refs hold an explicit count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InlineRef {
    TreeBlock {
        root: TreeId,
    },
    SharedBlock {
        parent: Bytenr,
    },
    Data {
        root: TreeId,
        objectid: u64,
        offset: u64,
        count: u32,
    },
    SharedData {
        parent: Bytenr,
        count: u32,
    },
}

impl InlineRef {
    /// Build a fresh inline record for `owner` with `count` references.
    #[must_use]
    pub fn for_owner(owner: RefOwner, count: u32) -> Self {
        match owner {
            RefOwner::TreeBlock { root } => Self::TreeBlock { root },
            RefOwner::SharedBlock { parent } => Self::SharedBlock { parent },
            RefOwner::Data {
                root,
                objectid,
                offset,
            } => Self::Data {
                root,
                objectid,
                offset,
                count,
            },
            RefOwner::SharedData { parent } => Self::SharedData { parent, count },
        }
    }

    /// The logical owner this record encodes.
    #[must_use]
    pub fn owner(&self) -> RefOwner {
        match *self {
            Self::TreeBlock { root } => RefOwner::TreeBlock { root },
            Self::SharedBlock { parent } => RefOwner::SharedBlock { parent },
            Self::Data {
                root,
                objectid,
                offset,
                ..
            } => RefOwner::Data {
                root,
                objectid,
                offset,
            },
            Self::SharedData { parent, .. } => RefOwner::SharedData { parent },
        }
    }

    /// References this record accounts for.
    #[must_use]
    pub fn count(&self) -> u64 {
        match *self {
            Self::TreeBlock { .. } | Self::SharedBlock { .. } => 1,
            Self::Data { count, .. } | Self::SharedData { count, .. } => u64::from(count),
        }
    }

    /// (type, disambiguator) sort key fixing the in-item order.
    #[must_use]
    pub fn sort_key(&self) -> (u8, u64) {
        let owner = self.owner();
        (owner.ref_type(), owner.disambiguator())
    }

    #[must_use]
    pub fn encoded_len(&self) -> usize {
        1 + match self {
            Self::TreeBlock { .. } | Self::SharedBlock { .. } => 8,
            Self::Data { .. } => 28,
            Self::SharedData { .. } => 12,
        }
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        match *self {
            Self::TreeBlock { root } => {
                put_le_u8(out, TREE_BLOCK_REF_KEY);
                put_le_u64(out, root.0);
            }
            Self::SharedBlock { parent } => {
                put_le_u8(out, SHARED_BLOCK_REF_KEY);
                put_le_u64(out, parent.0);
            }
            Self::Data {
                root,
                objectid,
                offset,
                count,
            } => {
                put_le_u8(out, EXTENT_DATA_REF_KEY);
                put_le_u64(out, root.0);
                put_le_u64(out, objectid);
                put_le_u64(out, offset);
                put_le_u32(out, count);
            }
            Self::SharedData { parent, count } => {
                put_le_u8(out, SHARED_DATA_REF_KEY);
                put_le_u64(out, parent.0);
                put_le_u32(out, count);
            }
        }
    }

    fn parse_at(data: &[u8], offset: usize) -> Result<(Self, usize), ParseError> {
        let ref_type = read_le_u8(data, offset)?;
        let body = offset + 1;
        match ref_type {
            TREE_BLOCK_REF_KEY => Ok((
                Self::TreeBlock {
                    root: TreeId(read_le_u64(data, body)?),
                },
                body + 8,
            )),
            SHARED_BLOCK_REF_KEY => Ok((
                Self::SharedBlock {
                    parent: Bytenr(read_le_u64(data, body)?),
                },
                body + 8,
            )),
            EXTENT_DATA_REF_KEY => Ok((
                Self::Data {
                    root: TreeId(read_le_u64(data, body)?),
                    objectid: read_le_u64(data, body + 8)?,
                    offset: read_le_u64(data, body + 16)?,
                    count: read_le_u32(data, body + 24)?,
                },
                body + 28,
            )),
            SHARED_DATA_REF_KEY => Ok((
                Self::SharedData {
                    parent: Bytenr(read_le_u64(data, body)?),
                    count: read_le_u32(data, body + 8)?,
                },
                body + 12,
            )),
            _ => Err(ParseError::InvalidField {
                field: "inline_ref_type",
                reason: "unknown backref type",
            }),
        }
    }
}

// ── Extent item ─────────────────────────────────────────────────────────────

/// Embedded tree-block info: the block's first key and its level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeBlockInfo {
    pub key: ItemKey,
    pub level: u8,
}

/// Persisted extent record, keyed (bytenr, EXTENT_ITEM, num_bytes).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtentItem {
    pub refs: u64,
    pub generation: Generation,
    pub flags: u64,
    pub tree_block: Option<TreeBlockInfo>,
    pub inline_refs: Vec<InlineRef>,
}

impl ExtentItem {
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        let mut len = EXTENT_ITEM_HEADER;
        if self.tree_block.is_some() {
            len += TREE_BLOCK_INFO_SIZE;
        }
        len + self
            .inline_refs
            .iter()
            .map(InlineRef::encoded_len)
            .sum::<usize>()
    }

    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        put_le_u64(&mut out, self.refs);
        put_le_u64(&mut out, self.generation.0);
        put_le_u64(&mut out, self.flags);
        if let Some(info) = &self.tree_block {
            put_le_u64(&mut out, info.key.objectid);
            put_le_u8(&mut out, info.key.item_type);
            put_le_u64(&mut out, info.key.offset);
            put_le_u8(&mut out, info.level);
        }
        for inline in &self.inline_refs {
            inline.encode_into(&mut out);
        }
        out
    }

    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        let refs = read_le_u64(data, 0)?;
        let generation = Generation(read_le_u64(data, 8)?);
        let flags = read_le_u64(data, 16)?;

        if flags & !EXTENT_FLAG_KNOWN_MASK != 0 {
            return Err(ParseError::InvalidField {
                field: "extent_flags",
                reason: "unknown flag bits set",
            });
        }

        let mut cursor = EXTENT_ITEM_HEADER;
        let tree_block = if flags & EXTENT_FLAG_TREE_BLOCK != 0 {
            let key = ItemKey::new(
                read_le_u64(data, cursor)?,
                read_le_u8(data, cursor + 8)?,
                read_le_u64(data, cursor + 9)?,
            );
            let level = read_le_u8(data, cursor + 17)?;
            cursor += TREE_BLOCK_INFO_SIZE;
            Some(TreeBlockInfo { key, level })
        } else {
            None
        };

        let mut inline_refs = Vec::new();
        while cursor < data.len() {
            let (inline, next) = InlineRef::parse_at(data, cursor)?;
            inline_refs.push(inline);
            cursor = next;
        }

        Ok(Self {
            refs,
            generation,
            flags,
            tree_block,
            inline_refs,
        })
    }

    /// Index of the inline record for `owner`, if present.
    #[must_use]
    pub fn find_inline(&self, owner: RefOwner) -> Option<usize> {
        self.inline_refs.iter().position(|r| r.owner() == owner)
    }

    /// Insert an inline record at its (type, disambiguator) position.
    pub fn insert_inline(&mut self, inline: InlineRef) {
        let key = inline.sort_key();
        let at = self
            .inline_refs
            .partition_point(|existing| existing.sort_key() < key);
        self.inline_refs.insert(at, inline);
    }

    /// Sum of per-record counts; the refcount-conservation invariant states
    /// this equals `refs` once keyed records are included.
    #[must_use]
    pub fn inline_count_sum(&self) -> u64 {
        self.inline_refs.iter().map(InlineRef::count).sum()
    }
}

// ── Block group item ────────────────────────────────────────────────────────

/// Per-block-group summary, keyed (start, BLOCK_GROUP_ITEM, length).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockGroupItem {
    pub used: u64,
    pub flags: u64,
}

impl BlockGroupItem {
    pub const ENCODED_LEN: usize = 16;

    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::ENCODED_LEN);
        put_le_u64(&mut out, self.used);
        put_le_u64(&mut out, self.flags);
        out
    }

    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        Ok(Self {
            used: read_le_u64(data, 0)?,
            flags: read_le_u64(data, 8)?,
        })
    }
}

// ── Keyed backref payloads ──────────────────────────────────────────────────

/// Payload of a keyed EXTENT_DATA_REF record. The key offset is the owner
/// hash; the payload carries the full owner triple so hash collisions are
/// detected by comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataRefPayload {
    pub root: TreeId,
    pub objectid: u64,
    pub offset: u64,
    pub count: u32,
}

impl DataRefPayload {
    pub const ENCODED_LEN: usize = 28;

    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::ENCODED_LEN);
        put_le_u64(&mut out, self.root.0);
        put_le_u64(&mut out, self.objectid);
        put_le_u64(&mut out, self.offset);
        put_le_u32(&mut out, self.count);
        out
    }

    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        Ok(Self {
            root: TreeId(read_le_u64(data, 0)?),
            objectid: read_le_u64(data, 8)?,
            offset: read_le_u64(data, 16)?,
            count: read_le_u32(data, 24)?,
        })
    }

    #[must_use]
    pub fn matches(&self, owner: RefOwner) -> bool {
        matches!(owner, RefOwner::Data { root, objectid, offset }
            if root == self.root && objectid == self.objectid && offset == self.offset)
    }
}

/// Payload of a keyed SHARED_DATA_REF record: just the count (the parent is
/// the key offset).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedDataRefPayload {
    pub count: u32,
}

impl SharedDataRefPayload {
    pub const ENCODED_LEN: usize = 4;

    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        self.count.to_le_bytes().to_vec()
    }

    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        Ok(Self {
            count: read_le_u32(data, 0)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cfs_types::EXTENT_FLAG_DATA;

    #[test]
    fn extent_item_round_trips_with_tree_block_info() {
        let item = ExtentItem {
            refs: 3,
            generation: Generation(12),
            flags: EXTENT_FLAG_TREE_BLOCK,
            tree_block: Some(TreeBlockInfo {
                key: ItemKey::new(256, 84, 0),
                level: 2,
            }),
            inline_refs: vec![
                InlineRef::TreeBlock { root: TreeId(5) },
                InlineRef::SharedBlock {
                    parent: Bytenr(65536),
                },
            ],
        };

        let bytes = item.encode();
        assert_eq!(bytes.len(), item.encoded_len());
        let parsed = ExtentItem::parse(&bytes).expect("parse");
        assert_eq!(parsed, item);
    }

    #[test]
    fn extent_item_round_trips_data_refs() {
        let item = ExtentItem {
            refs: 7,
            generation: Generation(9),
            flags: EXTENT_FLAG_DATA,
            tree_block: None,
            inline_refs: vec![
                InlineRef::Data {
                    root: TreeId(5),
                    objectid: 261,
                    offset: 0,
                    count: 4,
                },
                InlineRef::SharedData {
                    parent: Bytenr(1 << 20),
                    count: 3,
                },
            ],
        };

        let parsed = ExtentItem::parse(&item.encode()).expect("parse");
        assert_eq!(parsed, item);
        assert_eq!(parsed.inline_count_sum(), 7);
    }

    #[test]
    fn parse_rejects_unknown_flags_and_ref_types() {
        let item = ExtentItem {
            refs: 1,
            generation: Generation(1),
            flags: EXTENT_FLAG_DATA,
            tree_block: None,
            inline_refs: vec![],
        };
        let mut bytes = item.encode();
        bytes[16] |= 0x80; // undefined flag bit
        assert!(matches!(
            ExtentItem::parse(&bytes),
            Err(ParseError::InvalidField {
                field: "extent_flags",
                ..
            })
        ));

        let mut bytes = item.encode();
        bytes.push(0xFF); // bogus inline ref type
        assert!(matches!(
            ExtentItem::parse(&bytes),
            Err(ParseError::InvalidField {
                field: "inline_ref_type",
                ..
            })
        ));
    }

    #[test]
    fn parse_rejects_truncated_inline_ref() {
        let item = ExtentItem {
            refs: 1,
            generation: Generation(1),
            flags: EXTENT_FLAG_DATA,
            tree_block: None,
            inline_refs: vec![InlineRef::Data {
                root: TreeId(5),
                objectid: 100,
                offset: 0,
                count: 1,
            }],
        };
        let bytes = item.encode();
        assert!(matches!(
            ExtentItem::parse(&bytes[..bytes.len() - 4]),
            Err(ParseError::InsufficientData { .. })
        ));
    }

    #[test]
    fn inline_refs_keep_type_then_disambiguator_order() {
        let mut item = ExtentItem {
            refs: 0,
            generation: Generation(0),
            flags: EXTENT_FLAG_TREE_BLOCK,
            tree_block: None,
            inline_refs: vec![],
        };
        item.insert_inline(InlineRef::SharedBlock {
            parent: Bytenr(4096),
        });
        item.insert_inline(InlineRef::TreeBlock { root: TreeId(7) });
        item.insert_inline(InlineRef::TreeBlock { root: TreeId(3) });

        let keys: Vec<(u8, u64)> = item.inline_refs.iter().map(InlineRef::sort_key).collect();
        let mut sorted = keys.clone();
        sorted.sort_unstable();
        assert_eq!(keys, sorted);
        // Tree-block refs (type 176) precede shared-block refs (type 182).
        assert_eq!(
            item.inline_refs[0],
            InlineRef::TreeBlock { root: TreeId(3) }
        );
    }

    #[test]
    fn block_group_item_round_trips() {
        let item = BlockGroupItem {
            used: 123_456,
            flags: cfs_types::ALLOC_METADATA | cfs_types::PROFILE_DUP,
        };
        let bytes = item.encode();
        assert_eq!(bytes.len(), BlockGroupItem::ENCODED_LEN);
        assert_eq!(BlockGroupItem::parse(&bytes).expect("parse"), item);
    }

    #[test]
    fn data_ref_payload_round_trips_and_matches() {
        let payload = DataRefPayload {
            root: TreeId(5),
            objectid: 261,
            offset: 8192,
            count: 2,
        };
        let parsed = DataRefPayload::parse(&payload.encode()).expect("parse");
        assert_eq!(parsed, payload);

        assert!(parsed.matches(RefOwner::Data {
            root: TreeId(5),
            objectid: 261,
            offset: 8192
        }));
        assert!(!parsed.matches(RefOwner::Data {
            root: TreeId(5),
            objectid: 261,
            offset: 0
        }));
        assert!(!parsed.matches(RefOwner::TreeBlock { root: TreeId(5) }));
    }

    #[test]
    fn data_ref_hash_is_stable_and_owner_sensitive() {
        let a = data_ref_hash(TreeId(5), 261, 0);
        let b = data_ref_hash(TreeId(5), 261, 0);
        let c = data_ref_hash(TreeId(5), 261, 4096);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
