//! Freed-but-not-yet-reusable range tracking across commit boundaries.
//!
//! Two range sets alternate roles at each commit: ranges pinned during the
//! current commit window live in the *active* set; `prepare_commit` swaps
//! it into the *prior* slot, and `finish_commit` drains the prior set back
//! to free space. A range therefore survives one full swap before reuse,
//! so nothing freed in commit N is handed out before commit N is durable.

use crate::group::{BlockGroup, BlockGroupIndex};
use crate::range_set::RangeSet;
use cfs_error::structural_violation;
use cfs_store::DiscardSink;
use cfs_types::Bytenr;
use parking_lot::Mutex;
use std::sync::Arc;

#[derive(Debug, Default)]
struct PinnedSets {
    active: RangeSet,
    prior: RangeSet,
}

/// Tracker for pinned byte ranges, two generations deep.
#[derive(Debug, Default)]
pub struct PinnedExtentTracker {
    sets: Mutex<PinnedSets>,
}

impl PinnedExtentTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Pin `[start, start + len)`: dirty-but-unusable until the commit that
    /// freed it has aged out.
    ///
    /// `was_reserved` distinguishes a speculative allocation that was never
    /// persisted (bytes move `reserved -> pinned`) from a persisted extent
    /// (caller already moved `used -> pinned` via
    /// [`BlockGroup::pin_from_used`]).
    pub fn pin(&self, group: &BlockGroup, start: Bytenr, len: u64, was_reserved: bool) {
        if was_reserved {
            group.pin_bytes(len, true);
        }
        let mut sets = self.sets.lock();
        sets.active.insert(start.0, start.0 + len);
        drop(sets);
        tracing::trace!(
            target: "cfs::pinned",
            start = start.0,
            len,
            was_reserved,
            "range_pinned"
        );
    }

    /// Whether any byte of `[start, start + len)` is pinned in either
    /// generation.
    #[must_use]
    pub fn is_pinned(&self, start: Bytenr, len: u64) -> bool {
        let sets = self.sets.lock();
        sets.active.overlaps(start.0, start.0 + len) || sets.prior.overlaps(start.0, start.0 + len)
    }

    /// Subranges of `[start, end)` pinned in neither generation.
    ///
    /// The background scan uses this to exclude pinned bytes from
    /// newly-discovered free space.
    #[must_use]
    pub fn uncovered_in(&self, start: u64, end: u64) -> Vec<(u64, u64)> {
        let sets = self.sets.lock();
        sets.active
            .uncovered_in(start, end)
            .into_iter()
            .flat_map(|(s, e)| sets.prior.uncovered_in(s, e))
            .collect()
    }

    /// Total pinned bytes across both generations.
    #[must_use]
    pub fn pinned_bytes(&self) -> u64 {
        let sets = self.sets.lock();
        sets.active.total_bytes() + sets.prior.total_bytes()
    }

    /// Commit hook, first half: freeze every in-progress group's unpin
    /// cursor, then rotate the generations.
    ///
    /// Must be externally serialized against other commit-boundary calls.
    pub fn prepare_commit(&self, groups: &[Arc<BlockGroup>]) {
        for group in groups {
            group.freeze_unpin_cursor();
        }

        let mut sets = self.sets.lock();
        debug_assert!(
            sets.prior.is_empty(),
            "prior generation not drained by previous finish_commit"
        );
        let sets = &mut *sets;
        std::mem::swap(&mut sets.active, &mut sets.prior);
        let rotated = sets.prior.total_bytes();
        drop(sets);
        tracing::debug!(target: "cfs::pinned", bytes = rotated, "pinned_generation_rotated");
    }

    /// Commit hook, second half: drain the prior generation.
    ///
    /// Per range: issue a best-effort discard hint, release the pinned
    /// counters, and return bytes below the owning group's unpin cursor to
    /// its free-space cache. Bytes at or beyond the cursor are left for the
    /// ongoing background scan to discover.
    pub fn finish_commit(&self, discard: &dyn DiscardSink, index: &BlockGroupIndex) {
        let drained = self.sets.lock().prior.drain();

        for (start, end) in drained {
            if let Err(err) = discard.issue_discard(start, end - start) {
                tracing::debug!(
                    target: "cfs::pinned",
                    start,
                    len = end - start,
                    error = %err,
                    "discard_hint_failed"
                );
            }

            // Extents never span groups, but walk defensively anyway.
            let mut cursor = start;
            while cursor < end {
                let Some(group) = index.find_containing(Bytenr(cursor)) else {
                    structural_violation(&format!(
                        "pinned range [{cursor}, {end}) outside any block group"
                    ));
                };
                let piece_end = end.min(group.end().0);
                let len = piece_end - cursor;
                group.unpin_bytes(len);

                let unpin_to = group.unpin_cursor();
                let free_end = piece_end.min(unpin_to);
                if free_end > cursor {
                    group.add_free(Bytenr(cursor), free_end - cursor);
                }
                tracing::trace!(
                    target: "cfs::pinned",
                    start = cursor,
                    len,
                    returned = free_end.saturating_sub(cursor),
                    "range_unpinned"
                );
                cursor = piece_end;
            }
        }
    }
}
