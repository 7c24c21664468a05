#![forbid(unsafe_code)]
//! Ordered key-value store and discard-sink contracts.
//!
//! The extent engine never owns B-tree pages itself; it consumes an ordered
//! store through [`TreeStore`] and a device trim facility through
//! [`DiscardSink`]. [`MemTreeStore`] is the reference implementation used by
//! every test harness: a `BTreeMap` behind a `parking_lot::RwLock`, with the
//! commit root modeled as an `Arc`-shared frozen clone that readers iterate
//! without contending with writers.

use cfs_error::{EngineError, Result};
use cfs_types::ItemKey;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::Arc;

// ── Ordered key-value store ─────────────────────────────────────────────────

/// Contract for the persistent ordered key-value store holding extent items.
///
/// Keys are composite `(objectid, item_type, offset)` triples ordered
/// lexicographically. Mutations act on the live tree; [`commit_root`]
/// returns a frozen point-in-time view and [`promote`] advances it to the
/// current live state at a commit boundary.
///
/// [`commit_root`]: TreeStore::commit_root
/// [`promote`]: TreeStore::promote
pub trait TreeStore: Send + Sync {
    /// Insert a new item. Fails with `Exists` if the key is already present.
    fn insert(&self, key: ItemKey, value: &[u8]) -> Result<()>;

    /// Fetch an item by exact key.
    fn search(&self, key: ItemKey) -> Option<Vec<u8>>;

    /// Fetch the first item with key >= `key`.
    fn search_at_or_after(&self, key: ItemKey) -> Option<(ItemKey, Vec<u8>)>;

    /// Replace an existing item's bytes. Fails with `NotFound` if missing.
    fn update(&self, key: ItemKey, value: &[u8]) -> Result<()>;

    /// Remove an item. Fails with `NotFound` if missing.
    fn delete(&self, key: ItemKey) -> Result<()>;

    /// Grow a stored item in place to `new_len`, zero-filling the tail.
    fn extend_item(&self, key: ItemKey, new_len: usize) -> Result<()>;

    /// Shrink a stored item in place to `new_len`.
    fn truncate_item(&self, key: ItemKey, new_len: usize) -> Result<()>;

    /// Frozen, read-only snapshot of the last promoted state.
    fn commit_root(&self) -> TreeSnapshot;

    /// Promote the current live state to be the new commit root.
    fn promote(&self);
}

/// Frozen, point-in-time view of a [`TreeStore`].
///
/// Cloning is cheap (an `Arc` bump); iteration never blocks writers.
#[derive(Debug, Clone)]
pub struct TreeSnapshot {
    map: Arc<BTreeMap<ItemKey, Vec<u8>>>,
}

impl TreeSnapshot {
    #[must_use]
    pub fn get(&self, key: ItemKey) -> Option<&[u8]> {
        self.map.get(&key).map(Vec::as_slice)
    }

    /// Iterate items with key >= `from` in ascending key order.
    pub fn iter_from(&self, from: ItemKey) -> impl Iterator<Item = (ItemKey, &[u8])> + '_ {
        self.map
            .range(from..)
            .map(|(key, value)| (*key, value.as_slice()))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

// ── In-memory reference implementation ──────────────────────────────────────

/// In-memory [`TreeStore`] used by tests and the single-node harness.
#[derive(Debug, Default)]
pub struct MemTreeStore {
    live: RwLock<BTreeMap<ItemKey, Vec<u8>>>,
    commit: RwLock<Arc<BTreeMap<ItemKey, Vec<u8>>>>,
}

impl MemTreeStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of items in the live tree.
    #[must_use]
    pub fn len(&self) -> usize {
        self.live.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.live.read().is_empty()
    }
}

impl TreeStore for MemTreeStore {
    fn insert(&self, key: ItemKey, value: &[u8]) -> Result<()> {
        let mut live = self.live.write();
        if live.contains_key(&key) {
            return Err(EngineError::Exists);
        }
        live.insert(key, value.to_vec());
        Ok(())
    }

    fn search(&self, key: ItemKey) -> Option<Vec<u8>> {
        self.live.read().get(&key).cloned()
    }

    fn search_at_or_after(&self, key: ItemKey) -> Option<(ItemKey, Vec<u8>)> {
        self.live
            .read()
            .range(key..)
            .next()
            .map(|(k, v)| (*k, v.clone()))
    }

    fn update(&self, key: ItemKey, value: &[u8]) -> Result<()> {
        let mut live = self.live.write();
        match live.get_mut(&key) {
            Some(slot) => {
                *slot = value.to_vec();
                Ok(())
            }
            None => Err(EngineError::NotFound(format!("item {key}"))),
        }
    }

    fn delete(&self, key: ItemKey) -> Result<()> {
        let mut live = self.live.write();
        match live.remove(&key) {
            Some(_) => Ok(()),
            None => Err(EngineError::NotFound(format!("item {key}"))),
        }
    }

    fn extend_item(&self, key: ItemKey, new_len: usize) -> Result<()> {
        let mut live = self.live.write();
        match live.get_mut(&key) {
            Some(slot) => {
                if new_len < slot.len() {
                    return Err(EngineError::InvalidGeometry(format!(
                        "extend_item would shrink {key}: {} -> {new_len}",
                        slot.len()
                    )));
                }
                slot.resize(new_len, 0);
                Ok(())
            }
            None => Err(EngineError::NotFound(format!("item {key}"))),
        }
    }

    fn truncate_item(&self, key: ItemKey, new_len: usize) -> Result<()> {
        let mut live = self.live.write();
        match live.get_mut(&key) {
            Some(slot) => {
                if new_len > slot.len() {
                    return Err(EngineError::InvalidGeometry(format!(
                        "truncate_item would grow {key}: {} -> {new_len}",
                        slot.len()
                    )));
                }
                slot.truncate(new_len);
                Ok(())
            }
            None => Err(EngineError::NotFound(format!("item {key}"))),
        }
    }

    fn commit_root(&self) -> TreeSnapshot {
        TreeSnapshot {
            map: Arc::clone(&self.commit.read()),
        }
    }

    fn promote(&self) {
        let frozen = Arc::new(self.live.read().clone());
        *self.commit.write() = frozen;
        tracing::debug!(target: "cfs::store", items = self.len(), "commit_root_promoted");
    }
}

// ── Discard hints ───────────────────────────────────────────────────────────

/// Best-effort physical discard (trim) sink.
///
/// The engine issues a hint per unpinned range at commit completion and
/// ignores failures; implementations must tolerate overlapping or repeated
/// ranges.
pub trait DiscardSink: Send + Sync {
    fn issue_discard(&self, offset: u64, len: u64) -> std::io::Result<()>;
}

/// Sink that drops every hint. Default for harnesses that don't care.
#[derive(Debug, Default)]
pub struct NullDiscardSink;

impl DiscardSink for NullDiscardSink {
    fn issue_discard(&self, _offset: u64, _len: u64) -> std::io::Result<()> {
        Ok(())
    }
}

/// Sink that records every hint, for asserting discard behavior in tests.
#[derive(Debug, Default)]
pub struct RecordingDiscardSink {
    ranges: Mutex<Vec<(u64, u64)>>,
}

impl RecordingDiscardSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn recorded(&self) -> Vec<(u64, u64)> {
        self.ranges.lock().clone()
    }
}

impl DiscardSink for RecordingDiscardSink {
    fn issue_discard(&self, offset: u64, len: u64) -> std::io::Result<()> {
        self.ranges.lock().push((offset, len));
        Ok(())
    }
}

/// Sink that fails every hint, for asserting the engine ignores errors.
#[derive(Debug, Default)]
pub struct FailingDiscardSink;

impl DiscardSink for FailingDiscardSink {
    fn issue_discard(&self, _offset: u64, _len: u64) -> std::io::Result<()> {
        Err(std::io::Error::other("discard unsupported"))
    }
}
