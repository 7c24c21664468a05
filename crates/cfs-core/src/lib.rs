#![forbid(unsafe_code)]
//! Engine context and orchestration for the cinderfs extent engine.
//!
//! [`Engine`] is the explicitly constructed context object owning every
//! subsystem: the block-group index, per-class space accounting, the
//! delayed-reference engine, and the pinned-extent tracker. It is built at
//! mount from the block-group records in the store, torn down at drop, and
//! holds no ambient statics.
//!
//! Commit orchestration runs, in order and exactly once per commit: drain
//! the delayed-ref queue, persist dirty block-group records, rotate the
//! pinned generations (`prepare_commit`), promote the store's commit root,
//! and drain the prior pinned generation (`finish_commit`).

mod caching;
mod reserve;

pub use reserve::{
    reduce_profile, reservation_bytes, NoopFlushHook, Reservation, COW_FANOUT_PER_LEVEL,
    ITEMS_PER_LOGICAL,
};

use cfs_error::{structural_violation, EngineError, Result};
use cfs_groups::{
    BlockGroup, BlockGroupIndex, CachingState, PinnedExtentTracker, SpaceAccounting, SpaceSummary,
};
use cfs_refs::{
    BlockGroupItem, Budget, DelayedRefEngine, DelayedRefInsert, RefContext, RefOwner,
};
use cfs_store::{DiscardSink, TreeStore};
use cfs_types::{
    flags_to_string, Bytenr, Generation, ItemKey, ALLOC_CLASS_MASK, BLOCK_GROUP_ITEM_KEY,
    SUPERZONE_END,
};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

/// Write-back hook the remediation ladder calls to flush dirty data.
///
/// Returns the bytes released from the class's delalloc-pending counter.
pub trait FlushHook: Send + Sync {
    fn flush(&self, class_flags: u64) -> u64;
}

/// Static engine geometry and tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Tree node size used in reservation worst-case estimates.
    pub node_size: u32,
    /// Maximum tree depth bounding copy-on-write fan-out.
    pub max_tree_depth: u8,
    /// Backing devices available for profile reduction.
    pub device_count: u32,
    /// Physical pool capacity; chunk allocation never exceeds it.
    pub total_device_bytes: u64,
    /// Size of a newly allocated block group.
    pub chunk_size: u64,
    /// Free-space bytes the caching scan accumulates before flushing a
    /// batch and waking waiters.
    pub cache_flush_batch: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            node_size: 16384,
            max_tree_depth: 8,
            device_count: 1,
            total_device_bytes: 8 << 30,
            chunk_size: 256 << 20,
            cache_flush_batch: 2 << 20,
        }
    }
}

impl EngineConfig {
    fn validate(&self) -> Result<()> {
        if !self.node_size.is_power_of_two() || !(4096..=65536).contains(&self.node_size) {
            return Err(EngineError::InvalidGeometry(format!(
                "node_size={} (must be a power of two in 4096..=65536)",
                self.node_size
            )));
        }
        if self.max_tree_depth == 0 || self.max_tree_depth > 8 {
            return Err(EngineError::InvalidGeometry(format!(
                "max_tree_depth={} (must be 1..=8)",
                self.max_tree_depth
            )));
        }
        if self.device_count == 0 {
            return Err(EngineError::InvalidGeometry("device_count=0".to_owned()));
        }
        if self.chunk_size == 0 || self.chunk_size % u64::from(self.node_size) != 0 {
            return Err(EngineError::InvalidGeometry(format!(
                "chunk_size={} (must be a non-zero multiple of node_size)",
                self.chunk_size
            )));
        }
        if self.total_device_bytes < SUPERZONE_END + self.chunk_size {
            return Err(EngineError::InvalidGeometry(format!(
                "total_device_bytes={} too small for one chunk past the superzone",
                self.total_device_bytes
            )));
        }
        if self.cache_flush_batch == 0 {
            return Err(EngineError::InvalidGeometry("cache_flush_batch=0".to_owned()));
        }
        Ok(())
    }
}

pub(crate) struct EngineInner {
    pub(crate) config: EngineConfig,
    pub(crate) store: Arc<dyn TreeStore>,
    pub(crate) discard: Arc<dyn DiscardSink>,
    pub(crate) groups: BlockGroupIndex,
    pub(crate) space: SpaceAccounting,
    pub(crate) delayed: DelayedRefEngine,
    pub(crate) pinned: PinnedExtentTracker,
    pub(crate) flush_hook: RwLock<Option<Arc<dyn FlushHook>>>,
    /// Serializes commit boundaries against each other.
    commit_lock: Mutex<()>,
    /// Transaction-in-progress signal the caching scan yields on.
    pub(crate) commit_in_progress: AtomicBool,
    /// Write side spans cursor-freeze .. unpin; scans hold read per batch.
    pub(crate) commit_sem: RwLock<()>,
    generation: AtomicU64,
    next_chunk_offset: AtomicU64,
    pub(crate) shutdown: AtomicBool,
    scan_threads: Mutex<Vec<JoinHandle<()>>>,
}

/// The extent-allocation and reference-counting engine.
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("groups", &self.inner.groups.len())
            .field("generation", &self.inner.generation.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Mount: register every block group recorded in the store and seed the
    /// per-class accounting from their summaries.
    ///
    /// Overlapping groups on disk mean the accounting is already
    /// inconsistent, which aborts rather than mounts.
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn TreeStore>,
        discard: Arc<dyn DiscardSink>,
    ) -> Result<Self> {
        config.validate()?;

        let inner = Arc::new(EngineInner {
            config,
            store,
            discard,
            groups: BlockGroupIndex::new(),
            space: SpaceAccounting::new(),
            delayed: DelayedRefEngine::new(),
            pinned: PinnedExtentTracker::new(),
            flush_hook: RwLock::new(None),
            commit_lock: Mutex::new(()),
            commit_in_progress: AtomicBool::new(false),
            commit_sem: RwLock::new(()),
            generation: AtomicU64::new(1),
            next_chunk_offset: AtomicU64::new(SUPERZONE_END),
            shutdown: AtomicBool::new(false),
            scan_threads: Mutex::new(Vec::new()),
        });
        let engine = Self { inner };
        engine.register_groups_from_store()?;

        // The mounted state becomes the first commit root the scans read.
        engine.inner.store.promote();
        tracing::info!(
            target: "cfs::engine",
            groups = engine.inner.groups.len(),
            "engine_mounted"
        );
        Ok(engine)
    }

    fn register_groups_from_store(&self) -> Result<()> {
        let mut cursor = ItemKey::object_start(0);
        while let Some((key, bytes)) = self.inner.store.search_at_or_after(cursor) {
            if key.item_type == BLOCK_GROUP_ITEM_KEY {
                let item = BlockGroupItem::parse(&bytes)
                    .map_err(|e| EngineError::Parse(format!("block group item {key}: {e}")))?;
                if item.flags & ALLOC_CLASS_MASK == 0 {
                    return Err(EngineError::Parse(format!(
                        "block group item {key} carries no allocation class"
                    )));
                }
                let start = Bytenr(key.objectid);
                let length = key.offset;
                let class = self.inner.space.find_or_create(item.flags);
                let group = Arc::new(BlockGroup::new(start, length, item.flags, class));
                group.space_info().add_capacity(length);
                group.add_used(item.used);
                if self.inner.groups.insert(Arc::clone(&group)).is_err() {
                    structural_violation(&format!(
                        "overlapping block groups discovered at mount near {start}"
                    ));
                }
                let group_end = start.0.saturating_add(length);
                self.inner
                    .next_chunk_offset
                    .fetch_max(group_end, Ordering::AcqRel);
                tracing::debug!(
                    target: "cfs::engine",
                    start = start.0,
                    length,
                    used = item.used,
                    flags = %flags_to_string(item.flags),
                    "block_group_registered"
                );
            }
            let Some(next) = next_key(key) else { break };
            cursor = next;
        }
        Ok(())
    }

    #[must_use]
    pub(crate) fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Register the write-back hook the remediation ladder invokes.
    pub fn set_flush_hook(&self, hook: Arc<dyn FlushHook>) {
        *self.inner.flush_hook.write() = Some(hook);
    }

    // ── Group access ────────────────────────────────────────────────────

    #[must_use]
    pub fn find_group(&self, bytenr: Bytenr) -> Option<Arc<BlockGroup>> {
        self.inner.groups.find_containing(bytenr)
    }

    #[must_use]
    pub fn groups(&self) -> Vec<Arc<BlockGroup>> {
        self.inner.groups.snapshot()
    }

    #[must_use]
    pub fn space_summary(&self, class_flags: u64) -> Option<SpaceSummary> {
        self.inner.space.find(class_flags).map(|s| s.summary())
    }

    /// Record delalloc-pending bytes awaiting write-back for a class.
    pub fn note_delalloc(&self, class_flags: u64, bytes: u64) {
        self.inner.space.find_or_create(class_flags).add_delalloc(bytes);
    }

    // ── Caching ─────────────────────────────────────────────────────────

    /// Kick off the background scan for an uncached group. No-op if the
    /// scan already ran or is running.
    pub fn start_caching(&self, group: &Arc<BlockGroup>) {
        if !group.begin_caching() {
            return;
        }
        let inner = Arc::clone(&self.inner);
        let scan_target = Arc::clone(group);
        let spawned = std::thread::Builder::new()
            .name(format!("cfs-cache-{}", group.start()))
            .spawn(move || caching::scan_group(&inner, &scan_target));
        match spawned {
            Ok(handle) => self.inner.scan_threads.lock().push(handle),
            Err(err) => {
                // Out of threads: degrade to a synchronous scan so the
                // caching state machine still reaches Finished.
                tracing::warn!(
                    target: "cfs::caching",
                    error = %err,
                    "scan_thread_spawn_failed_running_inline"
                );
                caching::scan_group(&self.inner, group);
            }
        }
    }

    // ── Extent allocation ───────────────────────────────────────────────

    /// Find free space for a new extent, reserve it out of the free-space
    /// cache, and queue the delayed reference that will make it durable.
    ///
    /// Triggers caching on the first miss and chunk allocation when no
    /// cached group fits.
    pub fn alloc_extent(
        &self,
        class_flags: u64,
        num_bytes: u64,
        owner: RefOwner,
        level: u8,
    ) -> Result<Bytenr> {
        if num_bytes == 0 {
            return Err(EngineError::InvalidGeometry("alloc_extent of 0 bytes".into()));
        }
        let generation = self.current_generation();

        for attempt in 0..2 {
            for group in self.inner.groups.snapshot() {
                if group.flags() & ALLOC_CLASS_MASK != class_flags & ALLOC_CLASS_MASK
                    || group.is_read_only()
                {
                    continue;
                }
                match group.caching_state() {
                    CachingState::NotStarted => {
                        self.start_caching(&group);
                        group.wait_cached_min(num_bytes);
                    }
                    CachingState::InProgress { .. } => group.wait_cached_min(num_bytes),
                    CachingState::Finished => {}
                }

                if let Some(bytenr) = group.allocate(num_bytes) {
                    group.reserve_bytes(num_bytes);
                    let insert = match owner {
                        RefOwner::TreeBlock { .. } | RefOwner::SharedBlock { .. } => {
                            DelayedRefInsert::add_tree_ref(
                                bytenr, num_bytes, owner, level, generation,
                            )
                        }
                        RefOwner::Data { .. } | RefOwner::SharedData { .. } => {
                            DelayedRefInsert::add_data_ref(bytenr, num_bytes, owner, 1, generation)
                        }
                    }
                    .with_reserved();
                    self.inner.delayed.add_ref(insert);
                    tracing::debug!(
                        target: "cfs::engine",
                        bytenr = bytenr.0,
                        num_bytes,
                        flags = %flags_to_string(class_flags),
                        "extent_allocated"
                    );
                    return Ok(bytenr);
                }
            }

            if attempt == 0 && self.alloc_chunk(class_flags)?.is_none() {
                break;
            }
        }

        if let Some(summary) = self.space_summary(class_flags) {
            tracing::info!(
                target: "cfs::engine",
                flags = %flags_to_string(class_flags),
                requested = num_bytes,
                total = summary.total_bytes,
                used = summary.bytes_used,
                reserved = summary.bytes_reserved,
                pinned = summary.bytes_pinned,
                "alloc_extent_no_space"
            );
        }
        Err(EngineError::NoSpace)
    }

    /// Queue a drop of `owner`'s reference on an extent.
    pub fn free_extent(&self, bytenr: Bytenr, num_bytes: u64, owner: RefOwner, level: u8) {
        let generation = self.current_generation();
        let insert = match owner {
            RefOwner::TreeBlock { .. } | RefOwner::SharedBlock { .. } => {
                DelayedRefInsert::drop_tree_ref(bytenr, num_bytes, owner, level, generation)
            }
            RefOwner::Data { .. } | RefOwner::SharedData { .. } => {
                DelayedRefInsert::drop_data_ref(bytenr, num_bytes, owner, 1, generation)
            }
        };
        self.inner.delayed.add_ref(insert);
    }

    /// Queue an arbitrary reference delta (snapshot/clone paths).
    pub fn add_ref(&self, insert: DelayedRefInsert) {
        self.inner.delayed.add_ref(insert);
    }

    /// Drain queued delayed references against the store and accounting.
    pub fn run_delayed_refs(&self, budget: Budget) -> Result<usize> {
        let ctx = RefContext {
            store: self.inner.store.as_ref(),
            groups: &self.inner.groups,
            pinned: &self.inner.pinned,
        };
        self.inner.delayed.run(&ctx, budget)
    }

    /// Coalesced delayed-ref heads currently queued.
    #[must_use]
    pub fn delayed_head_count(&self) -> usize {
        self.inner.delayed.head_count()
    }

    /// Bytes covered by queued delayed-ref heads.
    #[must_use]
    pub fn delayed_queued_bytes(&self) -> u64 {
        self.inner.delayed.queued_bytes()
    }

    // ── Chunk allocation ────────────────────────────────────────────────

    /// Allocate a new block group for a class if capacity policy allows.
    ///
    /// Returns `Ok(None)` when the policy refuses (class full, device
    /// exhausted) or another caller already holds the class's allocation
    /// slot; the reservation ladder treats both as "re-check and escalate".
    pub fn alloc_chunk(&self, class_flags: u64) -> Result<Option<Arc<BlockGroup>>> {
        let class = self.inner.space.find_or_create(class_flags);
        if class.is_full() {
            return Ok(None);
        }
        if !class.begin_chunk_alloc() {
            return Ok(None);
        }
        let result = self.alloc_chunk_locked(class_flags, &class);
        class.end_chunk_alloc();
        result
    }

    fn alloc_chunk_locked(
        &self,
        class_flags: u64,
        class: &Arc<cfs_groups::SpaceInfo>,
    ) -> Result<Option<Arc<BlockGroup>>> {
        let chunk = self.inner.config.chunk_size;
        let capacity = self.inner.config.total_device_bytes;

        // One class may own at most three quarters of the pool.
        let class_limit = capacity / 4 * 3;
        if class.total_bytes().saturating_add(chunk) > class_limit {
            class.set_full(true);
            tracing::debug!(
                target: "cfs::engine",
                flags = %flags_to_string(class_flags),
                "chunk_alloc_refused_class_share"
            );
            return Ok(None);
        }

        let offset = self.inner.next_chunk_offset.fetch_add(chunk, Ordering::AcqRel);
        if offset.checked_add(chunk).map_or(true, |end| end > capacity) {
            self.inner.next_chunk_offset.fetch_sub(chunk, Ordering::AcqRel);
            class.set_full(true);
            tracing::debug!(
                target: "cfs::engine",
                flags = %flags_to_string(class_flags),
                offset,
                "chunk_alloc_refused_device_exhausted"
            );
            return Ok(None);
        }

        let flags = reduce_profile(class_flags, self.inner.config.device_count);
        let group = Arc::new(BlockGroup::new(
            Bytenr(offset),
            chunk,
            flags,
            Arc::clone(class),
        ));

        let item = BlockGroupItem { used: 0, flags };
        let key = ItemKey::block_group_item(group.start(), group.length());
        match self.inner.store.insert(key, &item.encode()) {
            Ok(()) => {}
            Err(EngineError::Exists) => {
                structural_violation(&format!("chunk collides with existing record {key}"));
            }
            Err(other) => return Err(other),
        }
        if self.inner.groups.insert(Arc::clone(&group)).is_err() {
            structural_violation(&format!(
                "new chunk at {offset} overlaps an indexed block group"
            ));
        }

        // A fresh chunk is known empty, so its cache is authoritative
        // immediately; no scan needed.
        group.begin_caching();
        group.add_free(group.start(), chunk);
        group.finish_caching();

        class.add_capacity(chunk);
        tracing::info!(
            target: "cfs::engine",
            offset,
            length = chunk,
            flags = %flags_to_string(flags),
            "chunk_allocated"
        );
        Ok(Some(group))
    }

    // ── Transaction boundary ────────────────────────────────────────────

    /// Join the current transaction; returns its generation.
    #[must_use]
    pub fn begin_transaction(&self) -> Generation {
        self.current_generation()
    }

    #[must_use]
    pub fn current_generation(&self) -> Generation {
        Generation(self.inner.generation.load(Ordering::Acquire))
    }

    /// Commit: drain delayed refs, persist dirty block groups, rotate the
    /// pinned generations around the commit-root promotion, and release the
    /// prior generation. Each hook runs exactly once, in that order.
    ///
    /// Commit boundaries are serialized against each other; ordinary
    /// `reserve`/`add_ref` traffic runs concurrently.
    pub fn commit_transaction(&self) -> Result<()> {
        let _boundary = self.inner.commit_lock.lock();
        self.inner.commit_in_progress.store(true, Ordering::Release);
        let result = self.commit_locked();
        self.inner.commit_in_progress.store(false, Ordering::Release);

        match &result {
            Ok(()) => {
                let generation = self.inner.generation.fetch_add(1, Ordering::AcqRel) + 1;
                tracing::info!(target: "cfs::engine", generation, "transaction_committed");
            }
            Err(err) => {
                tracing::error!(target: "cfs::engine", error = %err, "commit_failed");
            }
        }
        result
    }

    fn commit_locked(&self) -> Result<()> {
        self.run_delayed_refs(Budget::All)?;

        for group in self.inner.groups.snapshot() {
            if group.take_dirty() {
                let key = ItemKey::block_group_item(group.start(), group.length());
                let item = BlockGroupItem {
                    used: group.used_bytes(),
                    flags: group.flags(),
                };
                self.inner.store.update(key, &item.encode())?;
            }
        }

        let groups = self.inner.groups.snapshot();
        // Scans pause per batch while this write guard is held, so no
        // progress advances between the cursor freeze and the unpin pass.
        let _sem = self.inner.commit_sem.write();
        self.inner.pinned.prepare_commit(&groups);
        self.inner.store.promote();
        self.inner
            .pinned
            .finish_commit(self.inner.discard.as_ref(), &self.inner.groups);
        Ok(())
    }

    /// Total bytes pinned across both generations.
    #[must_use]
    pub fn pinned_bytes(&self) -> u64 {
        self.inner.pinned.pinned_bytes()
    }

    /// Pin a range directly (tree-log replay and relocation paths).
    ///
    /// With `was_reserved` the bytes move `reserved -> pinned`; otherwise
    /// they move `used -> pinned`.
    pub fn pin_extent(&self, bytenr: Bytenr, num_bytes: u64, was_reserved: bool) {
        let Some(group) = self.inner.groups.find_containing(bytenr) else {
            structural_violation(&format!("pin of range {} outside any block group", bytenr.0));
        };
        if was_reserved {
            self.inner.pinned.pin(&group, bytenr, num_bytes, true);
        } else {
            group.pin_from_used(num_bytes);
            self.inner.pinned.pin(&group, bytenr, num_bytes, false);
        }
    }

    /// The ordered store this engine mutates.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn TreeStore> {
        &self.inner.store
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.inner.shutdown.store(true, Ordering::Release);
        let handles = std::mem::take(&mut *self.inner.scan_threads.lock());
        for handle in handles {
            let _ = handle.join();
        }
    }
}

/// Successor of `key` in the total key order, if any.
fn next_key(key: ItemKey) -> Option<ItemKey> {
    if let Some(offset) = key.offset.checked_add(1) {
        return Some(ItemKey::new(key.objectid, key.item_type, offset));
    }
    if let Some(item_type) = key.item_type.checked_add(1) {
        return Some(ItemKey::new(key.objectid, item_type, 0));
    }
    key.objectid
        .checked_add(1)
        .map(|objectid| ItemKey::new(objectid, 0, 0))
}
