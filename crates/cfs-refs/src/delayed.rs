//! Write-combining log of pending reference-count deltas.
//!
//! Every logical allocation or free queues a delta here instead of mutating
//! the extent tree inline. Deltas for the same extent coalesce under one
//! [`RefHead`]; opposite actions for the same owner cancel pairwise, and
//! whatever survives is applied adds-before-drops so the count never
//! transiently hits zero while same-generation adds are still pending.
//!
//! # Concurrency
//!
//! The queue mutex orders head discovery; each head carries its own mutex
//! so exactly one worker drains a given extent's chain while unrelated
//! extents drain in parallel. `run` releases the queue lock between heads
//! to bound hold time. Lock order is queue, then head.

use crate::backref;
use crate::item::{RefOwner, TreeBlockInfo};
use cfs_error::{structural_violation, Result};
use cfs_groups::{BlockGroupIndex, PinnedExtentTracker};
use cfs_store::TreeStore;
use cfs_types::{
    Bytenr, Generation, ItemKey, EXTENT_FLAG_DATA, EXTENT_FLAG_TREE_BLOCK,
};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Direction of a reference delta.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefAction {
    Add,
    Drop,
}

/// How much of the queue one `run` call drains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Budget {
    /// Everything queued at entry; entries added during the drain stay
    /// queued for the next run.
    All,
    /// At most this many coalesced heads.
    Heads(usize),
}

/// Idempotent extent-record update applied once when the head is processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtentOp {
    /// Flag bits OR-ed into the record.
    pub flags: u64,
    /// Replacement tree-block level, if any.
    pub level: Option<u8>,
}

/// One queued reference delta.
#[derive(Debug, Clone)]
pub struct DelayedRefInsert {
    pub bytenr: Bytenr,
    pub num_bytes: u64,
    pub owner: RefOwner,
    pub action: RefAction,
    pub delta: u64,
    pub is_tree_block: bool,
    pub level: u8,
    pub generation: Generation,
    /// The extent was speculatively reserved and has no persistent record
    /// yet; processing this head is what makes it durable.
    pub must_insert_reserved: bool,
    pub metadata_op: Option<ExtentOp>,
    /// First key of the tree block, stamped into the record on materialize.
    pub first_key: Option<ItemKey>,
}

impl DelayedRefInsert {
    /// Add one tree-block reference.
    #[must_use]
    pub fn add_tree_ref(
        bytenr: Bytenr,
        num_bytes: u64,
        owner: RefOwner,
        level: u8,
        generation: Generation,
    ) -> Self {
        Self {
            bytenr,
            num_bytes,
            owner,
            action: RefAction::Add,
            delta: 1,
            is_tree_block: true,
            level,
            generation,
            must_insert_reserved: false,
            metadata_op: None,
            first_key: None,
        }
    }

    /// Drop one tree-block reference.
    #[must_use]
    pub fn drop_tree_ref(
        bytenr: Bytenr,
        num_bytes: u64,
        owner: RefOwner,
        level: u8,
        generation: Generation,
    ) -> Self {
        Self {
            action: RefAction::Drop,
            ..Self::add_tree_ref(bytenr, num_bytes, owner, level, generation)
        }
    }

    /// Add `delta` data references.
    #[must_use]
    pub fn add_data_ref(
        bytenr: Bytenr,
        num_bytes: u64,
        owner: RefOwner,
        delta: u64,
        generation: Generation,
    ) -> Self {
        Self {
            bytenr,
            num_bytes,
            owner,
            action: RefAction::Add,
            delta,
            is_tree_block: false,
            level: 0,
            generation,
            must_insert_reserved: false,
            metadata_op: None,
            first_key: None,
        }
    }

    /// Drop `delta` data references.
    #[must_use]
    pub fn drop_data_ref(
        bytenr: Bytenr,
        num_bytes: u64,
        owner: RefOwner,
        delta: u64,
        generation: Generation,
    ) -> Self {
        Self {
            action: RefAction::Drop,
            ..Self::add_data_ref(bytenr, num_bytes, owner, delta, generation)
        }
    }

    /// Mark this insert as the first reference to a freshly reserved extent.
    #[must_use]
    pub fn with_reserved(mut self) -> Self {
        self.must_insert_reserved = true;
        self
    }

    #[must_use]
    pub fn with_metadata_op(mut self, op: ExtentOp) -> Self {
        self.metadata_op = Some(op);
        self
    }

    #[must_use]
    pub fn with_first_key(mut self, key: ItemKey) -> Self {
        self.first_key = Some(key);
        self
    }
}

// ── Queue internals ─────────────────────────────────────────────────────────

#[derive(Debug)]
struct PendingRef {
    seq: u64,
    owner: RefOwner,
    action: RefAction,
    delta: u64,
}

#[derive(Debug)]
struct HeadState {
    ref_mod: i64,
    must_insert_reserved: bool,
    is_tree_block: bool,
    level: u8,
    generation: Generation,
    metadata_op: Option<ExtentOp>,
    first_key: Option<ItemKey>,
    pending: Vec<PendingRef>,
    /// Set under both locks when the head detaches from the queue; a head
    /// that reaches `done` never receives new refs.
    done: bool,
}

#[derive(Debug)]
struct RefHead {
    bytenr: Bytenr,
    num_bytes: u64,
    state: Mutex<HeadState>,
}

#[derive(Debug, Default)]
struct RefQueue {
    heads: BTreeMap<u64, Arc<RefHead>>,
    next_seq: u64,
}

/// Everything head processing needs from the rest of the engine.
pub struct RefContext<'a> {
    pub store: &'a dyn TreeStore,
    pub groups: &'a BlockGroupIndex,
    pub pinned: &'a PinnedExtentTracker,
}

/// The delayed reference engine.
#[derive(Debug, Default)]
pub struct DelayedRefEngine {
    queue: Mutex<RefQueue>,
}

impl DelayedRefEngine {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a reference delta, coalescing under the extent's head.
    pub fn add_ref(&self, insert: DelayedRefInsert) {
        let mut queue = self.queue.lock();
        let seq = queue.next_seq;
        queue.next_seq += 1;

        let head = Arc::clone(queue.heads.entry(insert.bytenr.0).or_insert_with(|| {
            Arc::new(RefHead {
                bytenr: insert.bytenr,
                num_bytes: insert.num_bytes,
                state: Mutex::new(HeadState {
                    ref_mod: 0,
                    must_insert_reserved: false,
                    is_tree_block: insert.is_tree_block,
                    level: insert.level,
                    generation: insert.generation,
                    metadata_op: None,
                    first_key: None,
                    pending: Vec::new(),
                    done: false,
                }),
            })
        }));

        if head.num_bytes != insert.num_bytes {
            structural_violation(&format!(
                "delayed ref length mismatch at {}: head {} vs insert {}",
                insert.bytenr.0, head.num_bytes, insert.num_bytes
            ));
        }

        // Queue lock stays held: add_ref serializes against a drain that is
        // detaching this head, so a ref can never land on a dead head.
        let mut state = head.state.lock();
        debug_assert!(!state.done, "ref appended to detached head");

        state.must_insert_reserved |= insert.must_insert_reserved;
        if let Some(op) = insert.metadata_op {
            state.metadata_op = Some(op);
        }
        if insert.first_key.is_some() {
            state.first_key = insert.first_key;
        }
        match insert.action {
            RefAction::Add => {
                state.ref_mod += i64::try_from(insert.delta).unwrap_or(i64::MAX);
            }
            RefAction::Drop => {
                state.ref_mod -= i64::try_from(insert.delta).unwrap_or(i64::MAX);
            }
        }

        // Cancel against queued refs of the opposite action for the same
        // owner; only the surviving net delta is ever applied.
        let mut delta = insert.delta;
        while delta > 0 {
            let Some(idx) = state
                .pending
                .iter()
                .position(|p| p.owner == insert.owner && p.action != insert.action)
            else {
                break;
            };
            let queued = &mut state.pending[idx];
            if queued.delta > delta {
                queued.delta -= delta;
                delta = 0;
            } else {
                delta -= queued.delta;
                state.pending.remove(idx);
            }
        }
        if delta > 0 {
            state.pending.push(PendingRef {
                seq,
                owner: insert.owner,
                action: insert.action,
                delta,
            });
        }

        tracing::trace!(
            target: "cfs::delayed",
            bytenr = insert.bytenr.0,
            seq,
            action = ?insert.action,
            delta = insert.delta,
            ref_mod = state.ref_mod,
            "delayed_ref_queued"
        );
    }

    /// Coalesced heads currently queued.
    #[must_use]
    pub fn head_count(&self) -> usize {
        self.queue.lock().heads.len()
    }

    /// Total bytes covered by queued heads, consumed by admission control
    /// to size the outstanding deferred work.
    #[must_use]
    pub fn queued_bytes(&self) -> u64 {
        self.queue
            .lock()
            .heads
            .values()
            .map(|h| h.num_bytes)
            .sum()
    }

    /// Process queued heads against the store and accounting.
    ///
    /// `Budget::All` drains exactly what was queued at entry; refs added
    /// while the drain runs wait for the next call. Returns the number of
    /// heads processed.
    pub fn run(&self, ctx: &RefContext<'_>, budget: Budget) -> Result<usize> {
        let (fence, heads) = {
            let queue = self.queue.lock();
            let fence = queue.next_seq;
            let heads: Vec<Arc<RefHead>> = match budget {
                Budget::All => queue.heads.values().cloned().collect(),
                Budget::Heads(n) => queue.heads.values().take(n).cloned().collect(),
            };
            (fence, heads)
        };

        let mut processed = 0_usize;
        for head in heads {
            self.process_head(ctx, &head, fence)?;
            processed += 1;
        }

        tracing::debug!(
            target: "cfs::delayed",
            processed,
            remaining = self.head_count(),
            "delayed_refs_ran"
        );
        Ok(processed)
    }

    fn process_head(&self, ctx: &RefContext<'_>, head: &Arc<RefHead>, fence: u64) -> Result<()> {
        let mut state = head.state.lock();
        if state.done {
            return Ok(());
        }

        // Individual refs first: adds before drops, bounded by the fence.
        loop {
            let next = state
                .pending
                .iter()
                .position(|p| p.action == RefAction::Add && p.seq < fence)
                .or_else(|| {
                    state
                        .pending
                        .iter()
                        .position(|p| p.action == RefAction::Drop && p.seq < fence)
                });
            let Some(idx) = next else { break };
            let pending = state.pending.remove(idx);
            match pending.action {
                RefAction::Add => Self::apply_add(ctx, head, &mut state, &pending)?,
                RefAction::Drop => Self::apply_drop(ctx, head, &pending)?,
            }
        }

        if !state.pending.is_empty() {
            // Refs beyond the fence stay queued; the head survives this run.
            return Ok(());
        }

        // The bare head is the unit: flush the metadata op, and settle a
        // reservation that never produced a persistent record.
        if let Some(op) = state.metadata_op.take() {
            Self::apply_metadata_op(ctx, head, op)?;
        }
        if state.must_insert_reserved {
            state.must_insert_reserved = false;
            Self::return_unused_reservation(ctx, head);
        }
        state.ref_mod = 0;

        // Detach under queue-then-head order so add_ref cannot race a ref
        // onto a dead head: release, retake both, re-check.
        drop(state);
        let mut queue = self.queue.lock();
        let mut state = head.state.lock();
        if state.pending.is_empty() && state.metadata_op.is_none() && !state.must_insert_reserved {
            state.done = true;
            queue.heads.remove(&head.bytenr.0);
        }
        Ok(())
    }

    fn apply_add(
        ctx: &RefContext<'_>,
        head: &RefHead,
        state: &mut HeadState,
        pending: &PendingRef,
    ) -> Result<()> {
        let existing = backref::read_extent_item(ctx.store, head.bytenr, head.num_bytes)?;
        if existing.is_some() {
            return backref::insert_or_bump(
                ctx.store,
                head.bytenr,
                head.num_bytes,
                pending.owner,
                pending.delta,
            );
        }

        if !state.must_insert_reserved {
            structural_violation(&format!(
                "ref add for missing extent item at {} without reservation",
                head.bytenr.0
            ));
        }

        // First reference to a reserved extent: this is where it becomes
        // durable. Flags from any queued metadata op land now so the op is
        // a no-op when the head itself is processed.
        let mut flags = if state.is_tree_block {
            EXTENT_FLAG_TREE_BLOCK
        } else {
            EXTENT_FLAG_DATA
        };
        if let Some(op) = state.metadata_op {
            flags |= op.flags;
        }
        let tree_block = state.is_tree_block.then(|| TreeBlockInfo {
            key: state.first_key.unwrap_or_else(|| ItemKey::object_start(0)),
            level: state.metadata_op.and_then(|op| op.level).unwrap_or(state.level),
        });
        backref::materialize_extent(
            ctx.store,
            head.bytenr,
            head.num_bytes,
            state.generation,
            flags,
            tree_block,
            pending.owner,
            pending.delta,
        )?;
        state.must_insert_reserved = false;

        let Some(group) = ctx.groups.find_containing(head.bytenr) else {
            structural_violation(&format!(
                "materialized extent {} outside any block group",
                head.bytenr.0
            ));
        };
        group.release_reserved(head.num_bytes, true);
        tracing::debug!(
            target: "cfs::delayed",
            bytenr = head.bytenr.0,
            num_bytes = head.num_bytes,
            "reserved_extent_materialized"
        );
        Ok(())
    }

    fn apply_drop(ctx: &RefContext<'_>, head: &RefHead, pending: &PendingRef) -> Result<()> {
        let remaining = backref::remove_or_decrement(
            ctx.store,
            head.bytenr,
            head.num_bytes,
            pending.owner,
            pending.delta,
        )?;
        if remaining == 0 {
            // Last reference gone: the range is freed but not reusable until
            // the commit that freed it ages out. Pinned, never direct-to-free.
            let Some(group) = ctx.groups.find_containing(head.bytenr) else {
                structural_violation(&format!(
                    "freed extent {} outside any block group",
                    head.bytenr.0
                ));
            };
            group.pin_from_used(head.num_bytes);
            ctx.pinned.pin(&group, head.bytenr, head.num_bytes, false);
        }
        Ok(())
    }

    fn apply_metadata_op(ctx: &RefContext<'_>, head: &RefHead, op: ExtentOp) -> Result<()> {
        let Some(mut item) = backref::read_extent_item(ctx.store, head.bytenr, head.num_bytes)?
        else {
            // The extent never materialized (or is already gone); the op has
            // nothing to update.
            return Ok(());
        };
        item.flags |= op.flags;
        if let (Some(info), Some(level)) = (item.tree_block.as_mut(), op.level) {
            info.level = level;
        }
        let key = ItemKey::extent_item(head.bytenr, head.num_bytes);
        ctx.store.update(key, &item.encode())
    }

    fn return_unused_reservation(ctx: &RefContext<'_>, head: &RefHead) {
        // Reserved, never persisted, net refs zero: hand the range straight
        // back to the free-space cache.
        let Some(group) = ctx.groups.find_containing(head.bytenr) else {
            structural_violation(&format!(
                "reserved extent {} outside any block group",
                head.bytenr.0
            ));
        };
        group.release_reserved(head.num_bytes, false);
        group.add_free(head.bytenr, head.num_bytes);
        tracing::debug!(
            target: "cfs::delayed",
            bytenr = head.bytenr.0,
            num_bytes = head.num_bytes,
            "unused_reservation_returned"
        );
    }
}
