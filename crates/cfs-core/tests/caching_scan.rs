#![forbid(unsafe_code)]
//! Background caching-scan behavior: gap discovery from the commit root,
//! pinned-range exclusion, batching, and idempotency.

use cfs_core::{Engine, EngineConfig};
use cfs_refs::{BlockGroupItem, ExtentItem, InlineRef, RefOwner};
use cfs_store::{MemTreeStore, NullDiscardSink, TreeStore};
use cfs_types::{
    Bytenr, Generation, ItemKey, TreeId, ALLOC_DATA, EXTENT_FLAG_DATA, SUPERZONE_END,
};
use std::sync::Arc;

const MIB: u64 = 1 << 20;
const GROUP_LEN: u64 = 64 * MIB;

fn config() -> EngineConfig {
    EngineConfig {
        node_size: 16384,
        max_tree_depth: 8,
        device_count: 1,
        total_device_bytes: 1 << 30,
        chunk_size: 16 * MIB,
        // Small batches force the scan through many snapshot/yield rounds.
        cache_flush_batch: 64 * 1024,
    }
}

fn seed_extent(store: &MemTreeStore, bytenr: u64, len: u64) {
    let item = ExtentItem {
        refs: 1,
        generation: Generation(1),
        flags: EXTENT_FLAG_DATA,
        tree_block: None,
        inline_refs: vec![InlineRef::for_owner(
            RefOwner::Data {
                root: TreeId::FS,
                objectid: 300,
                offset: bytenr,
            },
            1,
        )],
    };
    store
        .insert(ItemKey::extent_item(Bytenr(bytenr), len), &item.encode())
        .expect("seed extent");
}

/// Store with one data group [0, 64 MiB) and a fixed static extent set.
fn seeded_store() -> Arc<MemTreeStore> {
    let store = Arc::new(MemTreeStore::new());
    let used = 16 * 1024 + 16 * 1024 + MIB;
    store
        .insert(
            ItemKey::block_group_item(Bytenr(0), GROUP_LEN),
            &BlockGroupItem {
                used,
                flags: ALLOC_DATA,
            }
            .encode(),
        )
        .expect("seed group");

    // Two adjacent extents and one large one.
    seed_extent(&store, 2 * MIB, 16 * 1024);
    seed_extent(&store, 2 * MIB + 16 * 1024, 16 * 1024);
    seed_extent(&store, 10 * MIB, MIB);
    store
}

fn mount_and_scan(store: &Arc<MemTreeStore>) -> (Engine, Vec<(u64, u64)>) {
    let engine = Engine::new(
        config(),
        Arc::clone(store) as Arc<dyn TreeStore>,
        Arc::new(NullDiscardSink),
    )
    .expect("mount");
    let group = engine.find_group(Bytenr(0)).expect("group");
    engine.start_caching(&group);
    group.wait_cached();
    let ranges = group.free_ranges();
    (engine, ranges)
}

#[test]
fn scan_discovers_gaps_between_extents() {
    let store = seeded_store();
    let (_engine, ranges) = mount_and_scan(&store);

    // Free space is the group range past the superzone, minus the extents;
    // the two adjacent extents leave no gap between them.
    assert_eq!(
        ranges,
        vec![
            (SUPERZONE_END, 2 * MIB),
            (2 * MIB + 32 * 1024, 10 * MIB),
            (11 * MIB, GROUP_LEN),
        ]
    );
}

#[test]
fn scan_is_idempotent_over_a_static_extent_set() {
    let store = seeded_store();
    let (engine_a, first) = mount_and_scan(&store);
    drop(engine_a);
    let (_engine_b, second) = mount_and_scan(&store);
    assert_eq!(first, second);
}

#[test]
fn scan_excludes_pinned_ranges_until_commit() {
    let store = seeded_store();
    let engine = Engine::new(
        config(),
        Arc::clone(&store) as Arc<dyn TreeStore>,
        Arc::new(NullDiscardSink),
    )
    .expect("mount");
    let group = engine.find_group(Bytenr(0)).expect("group");

    // A range freed just before the scan runs: still pinned, so the scan
    // must not hand it out even though no extent item covers it.
    let pinned_start = Bytenr(5 * MIB);
    let pinned_len = 64 * 1024;
    engine.pin_extent(pinned_start, pinned_len, false);

    engine.start_caching(&group);
    group.wait_cached();
    assert!(!group.free_contains(pinned_start, pinned_len));
    // Neighboring bytes on both sides are free.
    assert!(group.free_contains(Bytenr(5 * MIB - 4096), 4096));
    assert!(group.free_contains(pinned_start.checked_add(pinned_len).expect("end"), 4096));

    // After the commit that ages the pin out, the range joins the cache.
    engine.commit_transaction().expect("commit");
    assert!(group.free_contains(pinned_start, pinned_len));
}

#[test]
fn batched_scan_makes_partial_progress_visible() {
    let store = seeded_store();
    let engine = Engine::new(
        config(),
        Arc::clone(&store) as Arc<dyn TreeStore>,
        Arc::new(NullDiscardSink),
    )
    .expect("mount");
    let group = engine.find_group(Bytenr(0)).expect("group");

    engine.start_caching(&group);
    // Waiters are released as soon as one batch lands, well before the
    // whole 64 MiB group is covered.
    group.wait_cached_min(64 * 1024);
    assert!(group.free_bytes() >= 64 * 1024);

    group.wait_cached();
    let total_free = GROUP_LEN - SUPERZONE_END - 32 * 1024 - MIB;
    assert_eq!(group.free_bytes(), total_free);
}
