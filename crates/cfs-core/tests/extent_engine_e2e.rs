#![forbid(unsafe_code)]
//! Cross-component scenarios for the extent engine: reservation accounting,
//! delayed-ref replay, pin-then-free safety, and the remediation ladder.

use cfs_core::{reservation_bytes, Engine, EngineConfig, FlushHook};
use cfs_error::EngineError;
use cfs_refs::{backref, BlockGroupItem, Budget, DelayedRefInsert, RefOwner};
use cfs_store::{DiscardSink, MemTreeStore, NullDiscardSink, RecordingDiscardSink, TreeStore};
use cfs_types::{
    Bytenr, Generation, ItemKey, TreeId, ALLOC_METADATA, PROFILE_DUP, SUPERZONE_END,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

const GIB: u64 = 1 << 30;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn test_config() -> EngineConfig {
    EngineConfig {
        node_size: 16384,
        max_tree_depth: 3,
        device_count: 1,
        total_device_bytes: 8 * GIB,
        chunk_size: 16 << 20,
        cache_flush_batch: 2 << 20,
    }
}

/// Store pre-seeded with one metadata block group [0, 1 GiB).
fn seeded_store() -> Arc<MemTreeStore> {
    let store = Arc::new(MemTreeStore::new());
    let item = BlockGroupItem {
        used: 0,
        flags: ALLOC_METADATA,
    };
    store
        .insert(
            ItemKey::block_group_item(Bytenr(0), GIB),
            &item.encode(),
        )
        .expect("seed block group");
    store
}

fn mount(store: &Arc<MemTreeStore>) -> Engine {
    init_tracing();
    Engine::new(
        test_config(),
        Arc::clone(store) as Arc<dyn TreeStore>,
        Arc::new(NullDiscardSink),
    )
    .expect("mount")
}

fn root_a() -> RefOwner {
    RefOwner::TreeBlock { root: TreeId(5) }
}

// ── Scenario 1: reservation formula and balance ─────────────────────────────

#[test]
fn reservation_matches_worst_case_formula_and_balances() {
    let store = seeded_store();
    let engine = mount(&store);

    let baseline = engine
        .space_summary(ALLOC_METADATA)
        .expect("class exists")
        .bytes_may_use;
    assert_eq!(baseline, 0);

    let reservation = engine.reserve(ALLOC_METADATA, 10).expect("reserve");
    // Every item may insert a primary and a backref record, each CoW-ing up
    // to two siblings per level, bounded by the 3-level depth budget.
    let expected = 10 * 2 * 2 * 16384 * 3;
    assert_eq!(reservation.bytes(), expected);
    assert_eq!(reservation.bytes(), reservation_bytes(10, 16384, 3));
    assert_eq!(
        engine
            .space_summary(ALLOC_METADATA)
            .expect("summary")
            .bytes_may_use,
        expected
    );

    engine.release(reservation);
    assert_eq!(
        engine
            .space_summary(ALLOC_METADATA)
            .expect("summary")
            .bytes_may_use,
        0
    );
}

#[test]
fn paired_reserve_release_sequences_return_to_baseline() {
    let store = seeded_store();
    let engine = mount(&store);

    let mut held = Vec::new();
    for items in [1_u64, 4, 16, 2, 9] {
        held.push(engine.reserve(ALLOC_METADATA, items).expect("reserve"));
    }
    for reservation in held {
        engine.release(reservation);
    }
    assert_eq!(
        engine
            .space_summary(ALLOC_METADATA)
            .expect("summary")
            .bytes_may_use,
        0
    );
}

// ── Scenario 2: coalesced delayed refs ──────────────────────────────────────

#[test]
fn three_refs_one_extent_leave_refcount_one_and_one_backref() {
    let store = seeded_store();
    let engine = mount(&store);

    let bytenr = engine
        .alloc_extent(ALLOC_METADATA, 16384, root_a(), 0)
        .expect("alloc");
    engine.add_ref(DelayedRefInsert::add_tree_ref(
        bytenr,
        16384,
        root_a(),
        0,
        Generation(1),
    ));
    engine.free_extent(bytenr, 16384, root_a(), 0);

    engine.run_delayed_refs(Budget::All).expect("run");

    let item = backref::read_extent_item(engine.store().as_ref(), bytenr, 16384)
        .expect("read")
        .expect("extent item");
    assert_eq!(item.refs, 1);
    assert_eq!(item.inline_refs.len(), 1);

    let (refs, sum) = backref::refcount_sums(engine.store().as_ref(), bytenr, 16384)
        .expect("sums")
        .expect("item");
    assert_eq!(refs, sum);
}

// ── Scenario 3: pin accounting and two commits ──────────────────────────────

#[test]
fn pinning_reserved_range_moves_counters_then_frees_after_commits() {
    let store = seeded_store();
    let engine = mount(&store);
    let group = engine.find_group(Bytenr(0)).expect("group");
    engine.start_caching(&group);
    group.wait_cached();

    // Reserve [start, start+100) out of the cache, then pin it as reserved.
    let start = group.allocate(100).expect("allocate");
    group.reserve_bytes(100);
    let before = engine.space_summary(ALLOC_METADATA).expect("summary");

    engine.pin_extent(start, 100, true);
    let after = engine.space_summary(ALLOC_METADATA).expect("summary");
    assert_eq!(after.bytes_pinned, before.bytes_pinned + 100);
    assert_eq!(after.bytes_reserved, before.bytes_reserved - 100);

    engine.commit_transaction().expect("commit 1");
    engine.commit_transaction().expect("commit 2");

    assert!(group.free_contains(start, 100));
    assert_eq!(
        engine
            .space_summary(ALLOC_METADATA)
            .expect("summary")
            .bytes_pinned,
        0
    );
}

// ── Pin-then-free safety across the full alloc/free cycle ───────────────────

#[test]
fn freed_extent_stays_pinned_until_the_commit_that_freed_it_is_durable() {
    let store = seeded_store();
    let sink = Arc::new(RecordingDiscardSink::new());
    let engine = Engine::new(
        test_config(),
        Arc::clone(&store) as Arc<dyn TreeStore>,
        Arc::clone(&sink) as Arc<dyn DiscardSink>,
    )
    .expect("mount");

    let bytenr = engine
        .alloc_extent(ALLOC_METADATA, 16384, root_a(), 0)
        .expect("alloc");
    engine.commit_transaction().expect("commit alloc");

    let group = engine.find_group(bytenr).expect("group");
    assert_eq!(group.used_bytes(), 16384);
    // The block-group summary was persisted with the new used bytes.
    let persisted = store
        .search(ItemKey::block_group_item(Bytenr(0), GIB))
        .expect("group item");
    assert_eq!(
        BlockGroupItem::parse(&persisted).expect("parse").used,
        16384
    );

    engine.free_extent(bytenr, 16384, root_a(), 0);
    engine.run_delayed_refs(Budget::All).expect("run drop");

    // Freed but not yet durable: pinned, not free, not discarded.
    assert_eq!(group.pinned_bytes(), 16384);
    assert!(!group.free_contains(bytenr, 16384));
    assert!(sink.recorded().is_empty());

    engine.commit_transaction().expect("commit free");

    // The commit that freed it is durable; the range is reusable and the
    // device got its discard hint.
    assert!(group.free_contains(bytenr, 16384));
    assert_eq!(group.pinned_bytes(), 0);
    assert!(sink.recorded().contains(&(bytenr.0, 16384)));

    // And it is genuinely allocatable again.
    let again = engine
        .alloc_extent(ALLOC_METADATA, 16384, root_a(), 0)
        .expect("realloc");
    assert_eq!(again, bytenr);
}

// ── Refcount conservation between drains ────────────────────────────────────

#[test]
fn refcount_conservation_holds_between_drains() {
    let store = seeded_store();
    let engine = mount(&store);

    let bytenr = engine
        .alloc_extent(ALLOC_METADATA, 16384, root_a(), 0)
        .expect("alloc");
    engine.run_delayed_refs(Budget::All).expect("drain");

    for root in 10..30_u64 {
        engine.add_ref(DelayedRefInsert::add_tree_ref(
            bytenr,
            16384,
            RefOwner::TreeBlock { root: TreeId(root) },
            0,
            Generation(1),
        ));
        engine.run_delayed_refs(Budget::All).expect("drain");

        let (refs, sum) = backref::refcount_sums(engine.store().as_ref(), bytenr, 16384)
            .expect("sums")
            .expect("item");
        assert_eq!(refs, sum, "conservation after adding root {root}");
    }

    for root in 10..30_u64 {
        engine.free_extent(
            bytenr,
            16384,
            RefOwner::TreeBlock { root: TreeId(root) },
            0,
        );
        engine.run_delayed_refs(Budget::All).expect("drain");

        let (refs, sum) = backref::refcount_sums(engine.store().as_ref(), bytenr, 16384)
            .expect("sums")
            .expect("item");
        assert_eq!(refs, sum, "conservation after dropping root {root}");
    }
}

// ── Remediation ladder ──────────────────────────────────────────────────────

struct CountingFlushHook {
    delalloc: AtomicU64,
    calls: AtomicU64,
}

impl FlushHook for CountingFlushHook {
    fn flush(&self, _class_flags: u64) -> u64 {
        self.calls.fetch_add(1, Ordering::AcqRel);
        self.delalloc.swap(0, Ordering::AcqRel)
    }
}

#[test]
fn ladder_allocates_a_chunk_before_failing() {
    // Empty pool: the first reserve has no capacity at all and must chunk-
    // allocate its way to headroom.
    let store = Arc::new(MemTreeStore::new());
    let engine = mount(&store);

    let reservation = engine.reserve(ALLOC_METADATA, 1).expect("reserve");
    assert!(
        engine
            .space_summary(ALLOC_METADATA)
            .expect("summary")
            .total_bytes
            > 0,
        "a chunk was allocated to satisfy the reservation"
    );
    engine.release(reservation);
}

#[test]
fn ladder_flushes_delalloc_before_failing() {
    let config = EngineConfig {
        total_device_bytes: 24 << 20,
        ..test_config()
    };
    let store = Arc::new(MemTreeStore::new());
    let engine = Engine::new(
        config,
        Arc::clone(&store) as Arc<dyn TreeStore>,
        Arc::new(NullDiscardSink),
    )
    .expect("mount");

    // One 16 MiB chunk fits the 18 MiB class share; a second does not.
    assert!(engine.alloc_chunk(ALLOC_METADATA).expect("chunk").is_some());
    assert!(engine.alloc_chunk(ALLOC_METADATA).expect("chunk").is_none());

    // Fill the class with pending write-back so only a flush can help.
    let delalloc = 14 << 20;
    engine.note_delalloc(ALLOC_METADATA, delalloc);
    let hook = Arc::new(CountingFlushHook {
        delalloc: AtomicU64::new(delalloc),
        calls: AtomicU64::new(0),
    });
    engine.set_flush_hook(Arc::clone(&hook) as Arc<dyn FlushHook>);

    let reservation = engine.reserve(ALLOC_METADATA, 1).expect("reserve");
    assert_eq!(hook.calls.load(Ordering::Acquire), 1);
    assert_eq!(
        engine
            .space_summary(ALLOC_METADATA)
            .expect("summary")
            .bytes_delalloc_pending,
        0
    );
    engine.release(reservation);
}

#[test]
fn exhausted_ladder_returns_no_space_with_counters_rolled_back() {
    let config = EngineConfig {
        total_device_bytes: 24 << 20,
        ..test_config()
    };
    let store = Arc::new(MemTreeStore::new());
    let engine = Engine::new(
        config,
        Arc::clone(&store) as Arc<dyn TreeStore>,
        Arc::new(NullDiscardSink),
    )
    .expect("mount");

    assert!(engine.alloc_chunk(ALLOC_METADATA).expect("chunk").is_some());
    // Unflushable pending bytes: no hook is registered.
    engine.note_delalloc(ALLOC_METADATA, 14 << 20);

    let err = engine.reserve(ALLOC_METADATA, 1).expect_err("no space");
    assert!(matches!(err, EngineError::NoSpace));

    let summary = engine.space_summary(ALLOC_METADATA).expect("summary");
    assert_eq!(summary.bytes_may_use, 0, "failed reserve left no residue");
}

// ── Chunk allocation and profile reduction through the engine ───────────────

#[test]
fn chunk_allocation_applies_profile_reduction() {
    let store = Arc::new(MemTreeStore::new());
    let engine = mount(&store); // one device
    let group = engine
        .alloc_chunk(ALLOC_METADATA | PROFILE_DUP | cfs_types::PROFILE_RAID1)
        .expect("chunk")
        .expect("group");

    // One device: RAID1 stripped, DUP survives.
    assert_eq!(group.flags(), ALLOC_METADATA | PROFILE_DUP);

    // The persisted record carries the reduced flags too.
    let bytes = store
        .search(ItemKey::block_group_item(group.start(), group.length()))
        .expect("item");
    assert_eq!(
        BlockGroupItem::parse(&bytes).expect("parse").flags,
        ALLOC_METADATA | PROFILE_DUP
    );
}

// ── Concurrency smoke: parallel writers against commits ─────────────────────

#[test]
fn concurrent_allocs_and_commits_keep_accounting_consistent() {
    let store = seeded_store();
    let engine = Arc::new(mount(&store));

    let writers: Vec<_> = (0..4_u64)
        .map(|t| {
            let engine = Arc::clone(&engine);
            std::thread::spawn(move || {
                let mut allocated = Vec::new();
                for _ in 0..10 {
                    let reservation = engine.reserve(ALLOC_METADATA, 1).expect("reserve");
                    let bytenr = engine
                        .alloc_extent(
                            ALLOC_METADATA,
                            16384,
                            RefOwner::TreeBlock { root: TreeId(t) },
                            0,
                        )
                        .expect("alloc");
                    allocated.push(bytenr);
                    engine.release(reservation);
                }
                allocated
            })
        })
        .collect();

    let committer = {
        let engine = Arc::clone(&engine);
        std::thread::spawn(move || {
            for _ in 0..5 {
                engine.commit_transaction().expect("commit");
                std::thread::sleep(std::time::Duration::from_millis(2));
            }
        })
    };

    let mut all: Vec<Bytenr> = Vec::new();
    for writer in writers {
        all.extend(writer.join().expect("writer"));
    }
    committer.join().expect("committer");
    engine.commit_transaction().expect("final commit");

    // Every allocation is distinct and durable with a conserved refcount.
    let mut sorted = all.clone();
    sorted.sort_unstable();
    sorted.dedup();
    assert_eq!(sorted.len(), all.len(), "no double allocation");

    for bytenr in &all {
        let (refs, sum) = backref::refcount_sums(engine.store().as_ref(), *bytenr, 16384)
            .expect("sums")
            .expect("item");
        assert_eq!(refs, 1);
        assert_eq!(sum, 1);
    }

    let summary = engine.space_summary(ALLOC_METADATA).expect("summary");
    assert_eq!(summary.bytes_used, 16384 * 40);
    assert_eq!(summary.bytes_reserved, 0);
    assert_eq!(summary.bytes_may_use, 0);
}

#[test]
fn engine_never_allocates_below_the_superzone() {
    let store = seeded_store();
    let engine = mount(&store);

    // Group [0, 1 GiB) covers the superzone; the scan must not offer it.
    let bytenr = engine
        .alloc_extent(ALLOC_METADATA, 16384, root_a(), 0)
        .expect("alloc");
    assert!(bytenr.0 >= SUPERZONE_END);

    let group = engine.find_group(Bytenr(0)).expect("group");
    group.wait_cached();
    assert!(!group.free_contains(Bytenr(0), 1));
}
