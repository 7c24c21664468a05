//! Per-allocation-class space accounting.
//!
//! One [`SpaceInfo`] exists per class (data / metadata / system). Counters
//! follow the committed-usage identity the reservation controller enforces:
//!
//! ```text
//! used + pinned + reserved + readonly + super_reserved + may_use
//!     + delalloc_pending <= total_bytes
//! ```
//!
//! A violation of that inequality is remediated (chunk allocation, flush),
//! never treated as corruption.
//!
//! # Concurrency
//!
//! All counters live behind one `parking_lot::Mutex`; the condvar wakes
//! reservation waiters when an in-flight flush completes. Lock order across
//! the crate is group-cache, then group-counters, then class.

use cfs_types::{flags_to_string, ALLOC_CLASS_MASK};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Fraction of super-block-reserved bytes carved out of each class capacity.
const SUPER_RESERVED_BYTES: u64 = 2 * 1024 * 1024;

#[derive(Debug, Default)]
struct SpaceState {
    total_bytes: u64,
    bytes_used: u64,
    bytes_pinned: u64,
    bytes_reserved: u64,
    bytes_readonly: u64,
    bytes_super_reserved: u64,
    bytes_may_use: u64,
    bytes_delalloc_pending: u64,
    full: bool,
    chunk_alloc_in_flight: bool,
    flush_in_flight: bool,
}

impl SpaceState {
    fn committed(&self) -> u64 {
        self.bytes_used
            .saturating_add(self.bytes_pinned)
            .saturating_add(self.bytes_reserved)
            .saturating_add(self.bytes_readonly)
            .saturating_add(self.bytes_super_reserved)
            .saturating_add(self.bytes_may_use)
            .saturating_add(self.bytes_delalloc_pending)
    }
}

/// Point-in-time copy of a class's counters, for logs and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpaceSummary {
    pub flags: u64,
    pub total_bytes: u64,
    pub bytes_used: u64,
    pub bytes_pinned: u64,
    pub bytes_reserved: u64,
    pub bytes_readonly: u64,
    pub bytes_super_reserved: u64,
    pub bytes_may_use: u64,
    pub bytes_delalloc_pending: u64,
    pub full: bool,
}

impl SpaceSummary {
    /// Sum of all committed counters.
    #[must_use]
    pub fn committed(&self) -> u64 {
        self.bytes_used
            + self.bytes_pinned
            + self.bytes_reserved
            + self.bytes_readonly
            + self.bytes_super_reserved
            + self.bytes_may_use
            + self.bytes_delalloc_pending
    }
}

/// Aggregate accounting for one allocation class.
#[derive(Debug)]
pub struct SpaceInfo {
    flags: u64,
    state: Mutex<SpaceState>,
    flush_done: Condvar,
}

impl SpaceInfo {
    #[must_use]
    pub fn new(flags: u64) -> Self {
        Self {
            flags,
            state: Mutex::new(SpaceState::default()),
            flush_done: Condvar::new(),
        }
    }

    /// Full class+profile flags this class was created with.
    #[must_use]
    pub fn flags(&self) -> u64 {
        self.flags
    }

    /// The class bits alone (data/metadata/system).
    #[must_use]
    pub fn class_flags(&self) -> u64 {
        self.flags & ALLOC_CLASS_MASK
    }

    /// Grow capacity when a block group joins the class.
    ///
    /// The first capacity carries the super-reserved carve-out.
    pub fn add_capacity(&self, bytes: u64) {
        let mut state = self.state.lock();
        if state.total_bytes == 0 && bytes > SUPER_RESERVED_BYTES {
            state.bytes_super_reserved = SUPER_RESERVED_BYTES;
        }
        state.total_bytes = state.total_bytes.saturating_add(bytes);
        state.full = false;
        drop(state);
        tracing::debug!(
            target: "cfs::space",
            flags = %flags_to_string(self.flags),
            bytes,
            "capacity_added"
        );
    }

    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.state.lock().total_bytes
    }

    /// Admit `bytes` into `may_use` if the committed total stays within
    /// capacity. Returns `false` (leaving counters untouched) on overcommit.
    pub fn try_reserve(&self, bytes: u64) -> bool {
        let mut state = self.state.lock();
        let committed = state.committed();
        if committed.saturating_add(bytes) > state.total_bytes {
            return false;
        }
        state.bytes_may_use += bytes;
        true
    }

    /// Return `bytes` of reservation headroom.
    ///
    /// Releasing more than was reserved is a caller bug; the counter is
    /// clamped to zero with a diagnostic rather than corrupting accounting.
    pub fn release_may_use(&self, bytes: u64) {
        let mut state = self.state.lock();
        if bytes > state.bytes_may_use {
            tracing::warn!(
                target: "cfs::space",
                flags = %flags_to_string(self.flags),
                release = bytes,
                may_use = state.bytes_may_use,
                "over_release_clamped"
            );
            state.bytes_may_use = 0;
        } else {
            state.bytes_may_use -= bytes;
        }
    }

    pub fn add_reserved(&self, bytes: u64) {
        self.state.lock().bytes_reserved += bytes;
    }

    /// Drop `bytes` from `reserved`, optionally moving them to `used`
    /// (extent materialized) instead of back to free headroom.
    pub fn release_reserved(&self, bytes: u64, to_used: bool) {
        let mut state = self.state.lock();
        state.bytes_reserved = state.bytes_reserved.saturating_sub(bytes);
        if to_used {
            state.bytes_used += bytes;
        }
    }

    pub fn add_used(&self, bytes: u64) {
        self.state.lock().bytes_used += bytes;
    }

    /// Move `bytes` from `used` to `pinned` (extent freed, awaiting commit).
    pub fn used_to_pinned(&self, bytes: u64) {
        let mut state = self.state.lock();
        state.bytes_used = state.bytes_used.saturating_sub(bytes);
        state.bytes_pinned += bytes;
    }

    /// Pin `bytes`; if they were reserved (speculative allocation never
    /// persisted), move them out of `reserved`.
    pub fn pin(&self, bytes: u64, was_reserved: bool) {
        let mut state = self.state.lock();
        state.bytes_pinned += bytes;
        if was_reserved {
            state.bytes_reserved = state.bytes_reserved.saturating_sub(bytes);
        }
    }

    pub fn unpin(&self, bytes: u64) {
        let mut state = self.state.lock();
        state.bytes_pinned = state.bytes_pinned.saturating_sub(bytes);
    }

    pub fn add_readonly(&self, bytes: u64) {
        self.state.lock().bytes_readonly += bytes;
    }

    pub fn add_delalloc(&self, bytes: u64) {
        self.state.lock().bytes_delalloc_pending += bytes;
    }

    pub fn sub_delalloc(&self, bytes: u64) {
        let mut state = self.state.lock();
        state.bytes_delalloc_pending = state.bytes_delalloc_pending.saturating_sub(bytes);
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.state.lock().full
    }

    pub fn set_full(&self, full: bool) {
        self.state.lock().full = full;
    }

    /// Claim the single chunk-allocation slot for this class.
    ///
    /// Returns `false` if another caller is already allocating; the loser
    /// re-checks headroom instead of double-triggering.
    pub fn begin_chunk_alloc(&self) -> bool {
        let mut state = self.state.lock();
        if state.chunk_alloc_in_flight {
            return false;
        }
        state.chunk_alloc_in_flight = true;
        true
    }

    pub fn end_chunk_alloc(&self) {
        self.state.lock().chunk_alloc_in_flight = false;
    }

    /// Claim the single flush slot for this class.
    pub fn begin_flush(&self) -> bool {
        let mut state = self.state.lock();
        if state.flush_in_flight {
            return false;
        }
        state.flush_in_flight = true;
        true
    }

    pub fn end_flush(&self) {
        {
            let mut state = self.state.lock();
            state.flush_in_flight = false;
        }
        self.flush_done.notify_all();
    }

    /// Block until no flush is in flight for this class.
    pub fn wait_for_flush(&self) {
        let mut state = self.state.lock();
        while state.flush_in_flight {
            self.flush_done.wait(&mut state);
        }
    }

    #[must_use]
    pub fn summary(&self) -> SpaceSummary {
        let state = self.state.lock();
        SpaceSummary {
            flags: self.flags,
            total_bytes: state.total_bytes,
            bytes_used: state.bytes_used,
            bytes_pinned: state.bytes_pinned,
            bytes_reserved: state.bytes_reserved,
            bytes_readonly: state.bytes_readonly,
            bytes_super_reserved: state.bytes_super_reserved,
            bytes_may_use: state.bytes_may_use,
            bytes_delalloc_pending: state.bytes_delalloc_pending,
            full: state.full,
        }
    }
}

// ── Class registry ──────────────────────────────────────────────────────────

/// Registry of [`SpaceInfo`] records, one per allocation class.
#[derive(Debug, Default)]
pub struct SpaceAccounting {
    classes: parking_lot::RwLock<Vec<Arc<SpaceInfo>>>,
}

impl SpaceAccounting {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Find the class for `flags`, creating it on first use.
    ///
    /// Classes are keyed by the class bits only; the profile bits of the
    /// first creator are remembered for diagnostics.
    pub fn find_or_create(&self, flags: u64) -> Arc<SpaceInfo> {
        let class = flags & ALLOC_CLASS_MASK;
        {
            let classes = self.classes.read();
            if let Some(found) = classes.iter().find(|s| s.class_flags() == class) {
                return Arc::clone(found);
            }
        }

        let mut classes = self.classes.write();
        // Re-check under the write lock.
        if let Some(found) = classes.iter().find(|s| s.class_flags() == class) {
            return Arc::clone(found);
        }
        let created = Arc::new(SpaceInfo::new(flags));
        classes.push(Arc::clone(&created));
        tracing::info!(
            target: "cfs::space",
            flags = %flags_to_string(flags),
            "space_class_created"
        );
        created
    }

    #[must_use]
    pub fn find(&self, flags: u64) -> Option<Arc<SpaceInfo>> {
        let class = flags & ALLOC_CLASS_MASK;
        self.classes
            .read()
            .iter()
            .find(|s| s.class_flags() == class)
            .cloned()
    }

    #[must_use]
    pub fn snapshot(&self) -> Vec<Arc<SpaceInfo>> {
        self.classes.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cfs_types::{ALLOC_DATA, ALLOC_METADATA, PROFILE_DUP};

    #[test]
    fn try_reserve_respects_capacity() {
        let info = SpaceInfo::new(ALLOC_METADATA);
        info.add_capacity(SUPER_RESERVED_BYTES + 1000);

        assert!(info.try_reserve(600));
        assert!(!info.try_reserve(600), "second reserve would overcommit");
        assert!(info.try_reserve(400));

        let summary = info.summary();
        assert_eq!(summary.bytes_may_use, 1000);
        assert_eq!(summary.committed(), summary.total_bytes);
    }

    #[test]
    fn release_pairs_with_reserve() {
        let info = SpaceInfo::new(ALLOC_METADATA);
        info.add_capacity(SUPER_RESERVED_BYTES + 1000);
        assert!(info.try_reserve(500));
        info.release_may_use(500);
        assert_eq!(info.summary().bytes_may_use, 0);
    }

    #[test]
    fn over_release_is_clamped_not_wrapped() {
        let info = SpaceInfo::new(ALLOC_DATA);
        info.add_capacity(SUPER_RESERVED_BYTES + 1000);
        assert!(info.try_reserve(100));
        info.release_may_use(300);
        assert_eq!(info.summary().bytes_may_use, 0);
    }

    #[test]
    fn pin_moves_reserved_bytes() {
        let info = SpaceInfo::new(ALLOC_DATA);
        info.add_capacity(SUPER_RESERVED_BYTES + 4096);
        info.add_reserved(100);

        info.pin(100, true);
        let summary = info.summary();
        assert_eq!(summary.bytes_pinned, 100);
        assert_eq!(summary.bytes_reserved, 0);

        info.unpin(100);
        assert_eq!(info.summary().bytes_pinned, 0);
    }

    #[test]
    fn used_to_pinned_round_trip() {
        let info = SpaceInfo::new(ALLOC_DATA);
        info.add_capacity(SUPER_RESERVED_BYTES + 4096);
        info.add_used(512);
        info.used_to_pinned(512);

        let summary = info.summary();
        assert_eq!(summary.bytes_used, 0);
        assert_eq!(summary.bytes_pinned, 512);
    }

    #[test]
    fn first_capacity_carves_super_reserve() {
        let info = SpaceInfo::new(ALLOC_METADATA);
        info.add_capacity(1024 * 1024 * 1024);
        let summary = info.summary();
        assert_eq!(summary.bytes_super_reserved, SUPER_RESERVED_BYTES);

        info.add_capacity(1024 * 1024 * 1024);
        assert_eq!(info.summary().bytes_super_reserved, SUPER_RESERVED_BYTES);
    }

    #[test]
    fn chunk_alloc_slot_is_exclusive() {
        let info = SpaceInfo::new(ALLOC_METADATA);
        assert!(info.begin_chunk_alloc());
        assert!(!info.begin_chunk_alloc());
        info.end_chunk_alloc();
        assert!(info.begin_chunk_alloc());
    }

    #[test]
    fn flush_waiters_wake_on_end() {
        let info = Arc::new(SpaceInfo::new(ALLOC_DATA));
        assert!(info.begin_flush());

        let waiter = {
            let info = Arc::clone(&info);
            std::thread::spawn(move || info.wait_for_flush())
        };
        std::thread::sleep(std::time::Duration::from_millis(20));
        info.end_flush();
        waiter.join().expect("waiter returns after flush ends");
    }

    #[test]
    fn accounting_keys_classes_by_class_bits() {
        let accounting = SpaceAccounting::new();
        let a = accounting.find_or_create(ALLOC_METADATA | PROFILE_DUP);
        let b = accounting.find_or_create(ALLOC_METADATA);
        assert!(Arc::ptr_eq(&a, &b));

        let c = accounting.find_or_create(ALLOC_DATA);
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(accounting.snapshot().len(), 2);
        assert!(accounting.find(ALLOC_DATA).is_some());
        assert!(accounting.find(cfs_types::ALLOC_SYSTEM).is_none());
    }
}
