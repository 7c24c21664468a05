//! Block groups and the range-keyed group index.
//!
//! A block group is one contiguous allocation region. Its free-space cache
//! is populated asynchronously by the background scan; [`CachingState`]
//! tracks that population and never reverts once `Finished`.
//!
//! # Concurrency
//!
//! Two mutexes per group: `cache` (caching state + free ranges + unpin
//! cursor, with a condvar for allocation waiters) and `counters`
//! (used/pinned/reserved/dirty). Lock order is cache, then counters, then
//! the class `SpaceInfo`. The index's reader lock is held only long enough
//! to clone the returned `Arc` handle.

use crate::range_set::FreeSpaceCache;
use crate::space::SpaceInfo;
use cfs_error::{EngineError, Result};
use cfs_types::{flags_to_string, Bytenr};
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Population state of a group's free-space cache.
///
/// `NotStarted -> InProgress` on first lookup miss; `InProgress -> Finished`
/// when the scan reaches the group end. Once `Finished`, never reverts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachingState {
    NotStarted,
    InProgress { progress: Bytenr },
    Finished,
}

#[derive(Debug)]
struct GroupCache {
    caching: CachingState,
    free: FreeSpaceCache,
    /// Exclusive unpin cursor frozen at `prepare_commit`; bytes below it may
    /// re-enter the free cache at `finish_commit`, bytes at or above are
    /// left for the scan to discover.
    unpin_to: u64,
}

#[derive(Debug, Default)]
struct GroupCounters {
    bytes_used: u64,
    bytes_pinned: u64,
    bytes_reserved: u64,
    read_only: bool,
    dirty: bool,
}

/// One contiguous allocation region.
#[derive(Debug)]
pub struct BlockGroup {
    start: Bytenr,
    length: u64,
    flags: u64,
    space_info: Arc<SpaceInfo>,
    cache: Mutex<GroupCache>,
    cache_wake: Condvar,
    counters: Mutex<GroupCounters>,
}

impl BlockGroup {
    #[must_use]
    pub fn new(start: Bytenr, length: u64, flags: u64, space_info: Arc<SpaceInfo>) -> Self {
        Self {
            start,
            length,
            flags,
            space_info,
            cache: Mutex::new(GroupCache {
                caching: CachingState::NotStarted,
                free: FreeSpaceCache::new(),
                unpin_to: start.0,
            }),
            cache_wake: Condvar::new(),
            counters: Mutex::new(GroupCounters::default()),
        }
    }

    #[must_use]
    pub fn start(&self) -> Bytenr {
        self.start
    }

    #[must_use]
    pub fn length(&self) -> u64 {
        self.length
    }

    /// One past the last byte of this group.
    #[must_use]
    pub fn end(&self) -> Bytenr {
        Bytenr(self.start.0 + self.length)
    }

    #[must_use]
    pub fn flags(&self) -> u64 {
        self.flags
    }

    #[must_use]
    pub fn space_info(&self) -> &Arc<SpaceInfo> {
        &self.space_info
    }

    #[must_use]
    pub fn contains(&self, bytenr: Bytenr) -> bool {
        bytenr >= self.start && bytenr < self.end()
    }

    // ── Caching state ───────────────────────────────────────────────────

    #[must_use]
    pub fn caching_state(&self) -> CachingState {
        self.cache.lock().caching
    }

    /// Transition `NotStarted -> InProgress`. Returns `true` if this call
    /// performed the transition (the caller owns scheduling the scan).
    pub fn begin_caching(&self) -> bool {
        let mut cache = self.cache.lock();
        match cache.caching {
            CachingState::NotStarted => {
                cache.caching = CachingState::InProgress {
                    progress: self.start,
                };
                drop(cache);
                tracing::debug!(
                    target: "cfs::groups",
                    group = self.start.0,
                    "caching_started"
                );
                true
            }
            CachingState::InProgress { .. } | CachingState::Finished => false,
        }
    }

    /// Advance the scan's progress cursor and wake allocation waiters.
    pub fn set_scan_progress(&self, progress: Bytenr) {
        let mut cache = self.cache.lock();
        if let CachingState::InProgress { progress: cur } = &mut cache.caching {
            *cur = progress;
        }
        drop(cache);
        self.cache_wake.notify_all();
    }

    /// Transition to `Finished` and wake everything.
    pub fn finish_caching(&self) {
        let mut cache = self.cache.lock();
        cache.caching = CachingState::Finished;
        let free = cache.free.free_bytes();
        drop(cache);
        self.cache_wake.notify_all();
        tracing::debug!(
            target: "cfs::groups",
            group = self.start.0,
            free_bytes = free,
            "caching_finished"
        );
    }

    /// Block until the cache is fully populated.
    pub fn wait_cached(&self) {
        let mut cache = self.cache.lock();
        while cache.caching != CachingState::Finished {
            self.cache_wake.wait(&mut cache);
        }
    }

    /// Block until at least `min_free` bytes are cached, or the scan is done.
    pub fn wait_cached_min(&self, min_free: u64) {
        let mut cache = self.cache.lock();
        loop {
            if cache.caching == CachingState::Finished || cache.free.free_bytes() >= min_free {
                return;
            }
            self.cache_wake.wait(&mut cache);
        }
    }

    // ── Free-space cache ────────────────────────────────────────────────

    /// Record `[start, start + len)` as free and wake waiters.
    pub fn add_free(&self, start: Bytenr, len: u64) {
        let mut cache = self.cache.lock();
        cache.free.add(start.0, len);
        drop(cache);
        self.cache_wake.notify_all();
    }

    /// First-fit allocation out of the cached free ranges.
    pub fn allocate(&self, len: u64) -> Option<Bytenr> {
        self.cache.lock().free.allocate(len).map(Bytenr)
    }

    #[must_use]
    pub fn free_bytes(&self) -> u64 {
        self.cache.lock().free.free_bytes()
    }

    #[must_use]
    pub fn free_contains(&self, start: Bytenr, len: u64) -> bool {
        self.cache.lock().free.contains(start.0, len)
    }

    /// Snapshot of the cached free ranges, for tests and diagnostics.
    #[must_use]
    pub fn free_ranges(&self) -> Vec<(u64, u64)> {
        self.cache.lock().free.iter().collect()
    }

    // ── Unpin cursor ────────────────────────────────────────────────────

    /// Freeze the unpin cursor at the scan's current progress.
    ///
    /// A partially scanned group must not expose bytes the scan has not
    /// yet classified, so unpinning stops at the progress point.
    pub fn freeze_unpin_cursor(&self) {
        let mut cache = self.cache.lock();
        cache.unpin_to = match cache.caching {
            CachingState::NotStarted => self.start.0,
            CachingState::InProgress { progress } => progress.0,
            CachingState::Finished => self.end().0,
        };
    }

    #[must_use]
    pub fn unpin_cursor(&self) -> u64 {
        self.cache.lock().unpin_to
    }

    // ── Counters ────────────────────────────────────────────────────────

    /// Move `len` bytes into `reserved` (group, then class).
    pub fn reserve_bytes(&self, len: u64) {
        let mut counters = self.counters.lock();
        counters.bytes_reserved += len;
        drop(counters);
        self.space_info.add_reserved(len);
    }

    /// Drop `len` bytes from `reserved`, to `used` if the extent was
    /// materialized, otherwise back to thin air (caller re-frees the range).
    pub fn release_reserved(&self, len: u64, to_used: bool) {
        let mut counters = self.counters.lock();
        counters.bytes_reserved = counters.bytes_reserved.saturating_sub(len);
        if to_used {
            counters.bytes_used += len;
            counters.dirty = true;
        }
        drop(counters);
        self.space_info.release_reserved(len, to_used);
    }

    /// Pin bytes that were never persisted (speculative reservation freed).
    pub fn pin_bytes(&self, len: u64, was_reserved: bool) {
        let mut counters = self.counters.lock();
        counters.bytes_pinned += len;
        if was_reserved {
            counters.bytes_reserved = counters.bytes_reserved.saturating_sub(len);
        }
        drop(counters);
        self.space_info.pin(len, was_reserved);
    }

    /// Pin bytes of a persisted extent being freed: `used -> pinned`.
    pub fn pin_from_used(&self, len: u64) {
        let mut counters = self.counters.lock();
        counters.bytes_used = counters.bytes_used.saturating_sub(len);
        counters.bytes_pinned += len;
        counters.dirty = true;
        drop(counters);
        self.space_info.used_to_pinned(len);
    }

    pub fn unpin_bytes(&self, len: u64) {
        let mut counters = self.counters.lock();
        counters.bytes_pinned = counters.bytes_pinned.saturating_sub(len);
        drop(counters);
        self.space_info.unpin(len);
    }

    /// Register used bytes discovered at mount.
    pub fn add_used(&self, len: u64) {
        let mut counters = self.counters.lock();
        counters.bytes_used += len;
        drop(counters);
        self.space_info.add_used(len);
    }

    #[must_use]
    pub fn used_bytes(&self) -> u64 {
        self.counters.lock().bytes_used
    }

    #[must_use]
    pub fn pinned_bytes(&self) -> u64 {
        self.counters.lock().bytes_pinned
    }

    #[must_use]
    pub fn reserved_bytes(&self) -> u64 {
        self.counters.lock().bytes_reserved
    }

    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.counters.lock().read_only
    }

    /// Mark the group read-only; its unused capacity leaves the class's
    /// allocatable pool.
    pub fn set_read_only(&self) {
        let mut counters = self.counters.lock();
        if counters.read_only {
            return;
        }
        counters.read_only = true;
        let unavailable = self
            .length
            .saturating_sub(counters.bytes_used)
            .saturating_sub(counters.bytes_reserved)
            .saturating_sub(counters.bytes_pinned);
        drop(counters);
        self.space_info.add_readonly(unavailable);
        tracing::info!(
            target: "cfs::groups",
            group = self.start.0,
            flags = %flags_to_string(self.flags),
            "group_marked_read_only"
        );
    }

    pub fn mark_dirty(&self) {
        self.counters.lock().dirty = true;
    }

    /// Clear and return the dirty flag (commit persists dirty groups).
    pub fn take_dirty(&self) -> bool {
        let mut counters = self.counters.lock();
        std::mem::take(&mut counters.dirty)
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.counters.lock().dirty
    }
}

// ── Group index ─────────────────────────────────────────────────────────────

/// Ordered, range-keyed index from physical offset to owning block group.
///
/// Exactly one group owns any byte; insertion enforces non-overlap. Group
/// handles are `Arc`-shared so a concurrent removal cannot invalidate an
/// in-flight handle.
#[derive(Debug, Default)]
pub struct BlockGroupIndex {
    groups: RwLock<BTreeMap<u64, Arc<BlockGroup>>>,
}

impl BlockGroupIndex {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a group; fails with `Exists` on a start collision or any byte
    /// overlap with a neighbor.
    pub fn insert(&self, group: Arc<BlockGroup>) -> Result<()> {
        let start = group.start().0;
        let end = group.end().0;
        let mut groups = self.groups.write();

        if groups.contains_key(&start) {
            return Err(EngineError::Exists);
        }
        if let Some((_, prev)) = groups.range(..start).next_back() {
            if prev.end().0 > start {
                return Err(EngineError::Exists);
            }
        }
        if let Some((&next_start, _)) = groups.range(start..).next() {
            if end > next_start {
                return Err(EngineError::Exists);
            }
        }

        groups.insert(start, group);
        Ok(())
    }

    /// The group whose `[start, start + len)` contains `bytenr`.
    #[must_use]
    pub fn find_containing(&self, bytenr: Bytenr) -> Option<Arc<BlockGroup>> {
        let groups = self.groups.read();
        groups
            .range(..=bytenr.0)
            .next_back()
            .filter(|(_, g)| g.contains(bytenr))
            .map(|(_, g)| Arc::clone(g))
    }

    /// The first group starting at or after `bytenr`.
    #[must_use]
    pub fn find_first_at_or_after(&self, bytenr: Bytenr) -> Option<Arc<BlockGroup>> {
        self.groups
            .read()
            .range(bytenr.0..)
            .next()
            .map(|(_, g)| Arc::clone(g))
    }

    /// Remove by start offset (filesystem shrink; tests).
    pub fn remove(&self, start: Bytenr) -> Option<Arc<BlockGroup>> {
        self.groups.write().remove(&start.0)
    }

    /// Clone handles to every group, in ascending start order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Arc<BlockGroup>> {
        self.groups.read().values().cloned().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.groups.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.groups.read().is_empty()
    }
}
