//! Space-reservation admission control.
//!
//! `reserve` computes a worst-case byte estimate for a batch of logical
//! items, admits it against the class's committed-usage identity, and on
//! overcommit climbs an escalating remediation ladder: allocate a chunk,
//! force write-back, wait out an in-flight flush. Every rung re-checks
//! before escalating further; only a fully exhausted ladder surfaces
//! `NoSpace` to the caller.

use crate::{Engine, FlushHook};
use cfs_error::{EngineError, Result};
use cfs_groups::SpaceInfo;
use cfs_refs::Budget;
use cfs_types::{
    flags_to_string, PROFILE_DUP, PROFILE_MASK, PROFILE_RAID0, PROFILE_RAID1, PROFILE_RAID10,
};
use std::sync::Arc;

/// Every logical item may need a primary record and a backref record.
pub const ITEMS_PER_LOGICAL: u64 = 2;
/// Each record insertion may copy-on-write up to this many sibling nodes
/// per tree level.
pub const COW_FANOUT_PER_LEVEL: u64 = 2;

/// Worst-case bytes one `reserve(num_items)` call must cover.
#[must_use]
pub fn reservation_bytes(num_items: u64, node_size: u32, max_tree_depth: u8) -> u64 {
    num_items
        * ITEMS_PER_LOGICAL
        * COW_FANOUT_PER_LEVEL
        * u64::from(node_size)
        * u64::from(max_tree_depth)
}

/// A successful reservation; pass back to [`Engine::release`] exactly once.
#[derive(Debug)]
#[must_use = "a reservation holds accounting headroom until released"]
pub struct Reservation {
    pub(crate) class_flags: u64,
    pub(crate) bytes: u64,
}

impl Reservation {
    #[must_use]
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    #[must_use]
    pub fn class_flags(&self) -> u64 {
        self.class_flags
    }
}

/// Reduce requested redundancy-profile flags to what the device population
/// supports, then resolve mutually-exclusive profiles by fixed precedence.
///
/// Evaluation order matters: duplication loses to mirroring/striping,
/// mirroring loses to striped mirroring, and plain striping loses to any
/// profile that still carries redundancy after the earlier rules ran.
#[must_use]
pub fn reduce_profile(flags: u64, num_devices: u32) -> u64 {
    let class = flags & !PROFILE_MASK;
    let mut profile = flags & PROFILE_MASK;

    if num_devices == 1 {
        profile &= !(PROFILE_RAID1 | PROFILE_RAID0);
    }
    if num_devices < 4 {
        profile &= !PROFILE_RAID10;
    }

    if profile & PROFILE_DUP != 0
        && profile & (PROFILE_RAID0 | PROFILE_RAID1 | PROFILE_RAID10) != 0
    {
        profile &= !PROFILE_DUP;
    }
    if profile & PROFILE_RAID1 != 0 && profile & PROFILE_RAID10 != 0 {
        profile &= !PROFILE_RAID1;
    }
    if profile & PROFILE_RAID0 != 0
        && profile & (PROFILE_RAID1 | PROFILE_RAID10 | PROFILE_DUP) != 0
    {
        profile &= !PROFILE_RAID0;
    }

    class | profile
}

impl Engine {
    /// Reserve accounting headroom for `num_items` logical mutations.
    ///
    /// Recoverable: `NoSpace` is returned only after chunk allocation,
    /// forced write-back, and waiting on an in-flight flush have all failed
    /// to produce headroom. Admission is an atomic check-and-add, so a
    /// failed attempt leaves the counters untouched by construction.
    pub fn reserve(&self, class_flags: u64, num_items: u64) -> Result<Reservation> {
        let bytes = reservation_bytes(
            num_items,
            self.config().node_size,
            self.config().max_tree_depth,
        );
        let class = self.inner.space.find_or_create(class_flags);

        for step in 0..=3_u8 {
            if class.try_reserve(bytes) {
                tracing::debug!(
                    target: "cfs::reserve",
                    flags = %flags_to_string(class_flags),
                    bytes,
                    step,
                    "reservation_admitted"
                );
                return Ok(Reservation { class_flags, bytes });
            }

            match step {
                0 => {
                    tracing::debug!(
                        target: "cfs::reserve",
                        flags = %flags_to_string(class_flags),
                        "ladder_step_chunk_alloc"
                    );
                    self.alloc_chunk(class_flags)?;
                }
                1 => {
                    tracing::debug!(
                        target: "cfs::reserve",
                        flags = %flags_to_string(class_flags),
                        "ladder_step_flush"
                    );
                    self.run_flush(&class)?;
                }
                2 => {
                    tracing::debug!(
                        target: "cfs::reserve",
                        flags = %flags_to_string(class_flags),
                        "ladder_step_wait_flush"
                    );
                    class.wait_for_flush();
                }
                _ => {}
            }
        }

        let summary = class.summary();
        tracing::info!(
            target: "cfs::reserve",
            flags = %flags_to_string(class_flags),
            requested = bytes,
            total = summary.total_bytes,
            used = summary.bytes_used,
            pinned = summary.bytes_pinned,
            reserved = summary.bytes_reserved,
            may_use = summary.bytes_may_use,
            delalloc = summary.bytes_delalloc_pending,
            "reservation_failed_no_space"
        );
        Err(EngineError::NoSpace)
    }

    /// Return a reservation's headroom. Must pair 1:1 with [`Engine::reserve`];
    /// over-release is clamped with a diagnostic inside the class counters.
    pub fn release(&self, reservation: Reservation) {
        let class = self.inner.space.find_or_create(reservation.class_flags);
        class.release_may_use(reservation.bytes);
        tracing::debug!(
            target: "cfs::reserve",
            flags = %flags_to_string(reservation.class_flags),
            bytes = reservation.bytes,
            "reservation_released"
        );
    }

    /// Ladder step 2: drain deferred work, then force write-back through the
    /// registered hook. The class's flush slot guarantees one flusher; losers
    /// fall through to the wait rung.
    fn run_flush(&self, class: &Arc<SpaceInfo>) -> Result<()> {
        if !class.begin_flush() {
            // Another caller is already flushing; the next rung waits on it.
            return Ok(());
        }
        let result = (|| {
            self.run_delayed_refs(Budget::All)?;
            let hook = self.inner.flush_hook.read().clone();
            if let Some(hook) = hook {
                let freed = hook.flush(class.flags());
                class.sub_delalloc(freed);
                tracing::debug!(
                    target: "cfs::reserve",
                    flags = %flags_to_string(class.flags()),
                    freed,
                    "flush_hook_completed"
                );
            }
            Ok(())
        })();
        class.end_flush();
        result
    }
}

/// Flush hook that releases nothing; the default when none is registered.
#[derive(Debug, Default)]
pub struct NoopFlushHook;

impl FlushHook for NoopFlushHook {
    fn flush(&self, _class_flags: u64) -> u64 {
        0
    }
}
