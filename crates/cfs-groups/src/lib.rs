#![forbid(unsafe_code)]
//! Block groups, space accounting, free-space caching, and pinned-extent
//! tracking for the cinderfs extent engine.
//!
//! The layering mirrors the allocator stack:
//!
//! 1. [`RangeSet`] / [`FreeSpaceCache`] — raw coalescing byte-range math.
//! 2. [`SpaceInfo`] / [`SpaceAccounting`] — per-class aggregate counters.
//! 3. [`BlockGroup`] / [`BlockGroupIndex`] — per-region state and the
//!    range-keyed concurrent index.
//! 4. [`PinnedExtentTracker`] — two-generation reuse-before-durability
//!    protection across commit boundaries.

mod group;
mod pinned;
mod range_set;
mod space;

pub use group::{BlockGroup, BlockGroupIndex, CachingState};
pub use pinned::PinnedExtentTracker;
pub use range_set::{FreeSpaceCache, RangeSet};
pub use space::{SpaceAccounting, SpaceInfo, SpaceSummary};
