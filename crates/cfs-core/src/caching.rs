//! Background population of block-group free-space caches.
//!
//! The scan walks the extent index in ascending key order over a frozen
//! commit-root snapshot, turns inter-item gaps into free space (minus
//! currently pinned ranges), and flushes in batches so allocation waiters
//! make progress before the whole group is covered.
//!
//! Commit coordination: each batch runs under the engine's commit
//! semaphore (read side) and re-acquires a fresh snapshot, so a scan never
//! interleaves a progress advance between a commit's cursor freeze and its
//! unpin pass. When a commit is flagged in progress the scan parks instead
//! of contending for the semaphore.

use crate::EngineInner;
use cfs_groups::BlockGroup;
use cfs_types::{Bytenr, ItemKey, EXTENT_ITEM_KEY, SUPERZONE_END};
use std::sync::atomic::Ordering;
use std::time::Duration;

/// Walk one group's extent range to completion.
pub(crate) fn scan_group(inner: &EngineInner, group: &BlockGroup) {
    let scan_start = group.start().0.max(SUPERZONE_END);
    let end = group.end().0;
    let mut last = scan_start;

    tracing::debug!(
        target: "cfs::caching",
        group = group.start().0,
        scan_start,
        end,
        "caching_scan_begin"
    );

    'batches: loop {
        if inner.shutdown.load(Ordering::Acquire) {
            break;
        }
        park_while_commit_in_progress(inner);

        // One batch: fresh snapshot, bounded free-space discovery.
        let _commit_guard = inner.commit_sem.read();
        let snapshot = inner.store.commit_root();
        let mut batch_bytes = 0_u64;

        for (key, _) in snapshot.iter_from(ItemKey::object_start(last)) {
            if key.objectid >= end {
                break;
            }
            if key.item_type != EXTENT_ITEM_KEY {
                continue;
            }

            let (bytenr, num_bytes) = (key.objectid, key.offset);
            if bytenr > last {
                batch_bytes += add_gap_as_free(inner, group, last, bytenr);
            }
            last = last.max(bytenr.saturating_add(num_bytes));

            if batch_bytes >= inner.config.cache_flush_batch {
                group.set_scan_progress(Bytenr(last));
                // Drop the semaphore between batches so a commit can run.
                continue 'batches;
            }
        }

        // No more extent items before the group end: the tail is one gap.
        if end > last {
            add_gap_as_free(inner, group, last, end);
            last = end;
        }
        break;
    }

    group.finish_caching();
    tracing::debug!(
        target: "cfs::caching",
        group = group.start().0,
        free_bytes = group.free_bytes(),
        "caching_scan_complete"
    );
}

/// Insert `[start, end)` minus currently pinned ranges into the group's
/// free cache. Returns the bytes inserted.
fn add_gap_as_free(inner: &EngineInner, group: &BlockGroup, start: u64, end: u64) -> u64 {
    let mut inserted = 0_u64;
    for (s, e) in inner.pinned.uncovered_in(start, end) {
        group.add_free(Bytenr(s), e - s);
        inserted += e - s;
    }
    inserted
}

/// Cooperative yield: a commit is mid-flight, so retry later instead of
/// racing it for the semaphore.
fn park_while_commit_in_progress(inner: &EngineInner) {
    let mut logged = false;
    while inner.commit_in_progress.load(Ordering::Acquire)
        && !inner.shutdown.load(Ordering::Acquire)
    {
        if !logged {
            tracing::trace!(target: "cfs::caching", "scan_yield_for_commit");
            logged = true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
}
