//! Backref bookkeeping over the ordered store.
//!
//! One logical contract, two physical encodings: referencers live inline in
//! the extent item until the item would outgrow [`MAX_EXTENT_ITEM_SIZE`],
//! then escalate to separate keyed records. Escalation is never undone.
//!
//! Every mutation also maintains the extent item's total refcount, so the
//! conservation invariant (total == sum of per-record counts) holds at
//! every store-visible point.
//!
//! Missing-backref and refcount-underflow conditions here are structural
//! invariant violations: they indicate extent leakage or double-free, and
//! abort rather than propagate.

use crate::item::{
    DataRefPayload, ExtentItem, InlineRef, RefOwner, SharedDataRefPayload, TreeBlockInfo,
    MAX_EXTENT_ITEM_SIZE,
};
use cfs_error::{structural_violation, EngineError, Result};
use cfs_store::TreeStore;
use cfs_types::{
    Bytenr, Generation, ItemKey, ParseError, EXTENT_DATA_REF_KEY, EXTENT_ITEM_KEY,
    SHARED_DATA_REF_KEY,
};

/// Linear-probe window for keyed data-ref insertion on hash collision.
const MAX_HASH_PROBES: u64 = 64;

fn parse_to_engine(bytenr: Bytenr, err: &ParseError) -> EngineError {
    EngineError::Corruption {
        bytenr: bytenr.0,
        detail: err.to_string(),
    }
}

/// Load and decode the extent item covering `[bytenr, bytenr + num_bytes)`.
pub fn read_extent_item(
    store: &dyn TreeStore,
    bytenr: Bytenr,
    num_bytes: u64,
) -> Result<Option<ExtentItem>> {
    let key = ItemKey::extent_item(bytenr, num_bytes);
    match store.search(key) {
        Some(bytes) => ExtentItem::parse(&bytes)
            .map(Some)
            .map_err(|e| parse_to_engine(bytenr, &e)),
        None => Ok(None),
    }
}

/// Rewrite a stored item, resizing in place first so the store can keep its
/// in-page room accounting accurate.
fn write_item(store: &dyn TreeStore, key: ItemKey, bytes: &[u8]) -> Result<()> {
    if let Some(old) = store.search(key) {
        match bytes.len().cmp(&old.len()) {
            std::cmp::Ordering::Greater => store.extend_item(key, bytes.len())?,
            std::cmp::Ordering::Less => store.truncate_item(key, bytes.len())?,
            std::cmp::Ordering::Equal => {}
        }
    }
    store.update(key, bytes)
}

/// Create the extent item for a reserved extent becoming durable.
pub fn materialize_extent(
    store: &dyn TreeStore,
    bytenr: Bytenr,
    num_bytes: u64,
    generation: Generation,
    flags: u64,
    tree_block: Option<TreeBlockInfo>,
    owner: RefOwner,
    count: u64,
) -> Result<()> {
    let count32 = u32::try_from(count).unwrap_or_else(|_| {
        structural_violation(&format!("initial refcount {count} exceeds record width"))
    });
    let item = ExtentItem {
        refs: count,
        generation,
        flags,
        tree_block,
        inline_refs: vec![InlineRef::for_owner(owner, count32)],
    };
    let key = ItemKey::extent_item(bytenr, num_bytes);
    match store.insert(key, &item.encode()) {
        Ok(()) => Ok(()),
        Err(EngineError::Exists) => {
            structural_violation(&format!("materialize over existing extent item {key}"))
        }
        Err(other) => Err(other),
    }
}

// ── Keyed record helpers ────────────────────────────────────────────────────

fn keyed_tree_key(bytenr: Bytenr, owner: RefOwner) -> ItemKey {
    ItemKey::new(bytenr.0, owner.ref_type(), owner.disambiguator())
}

/// Scan this extent's keyed EXTENT_DATA_REF records for `owner`.
///
/// Lookup walks every data-ref record of the extent and matches the payload,
/// so probe-chain holes left by deletions cannot hide a record.
fn find_keyed_data(
    store: &dyn TreeStore,
    bytenr: Bytenr,
    owner: RefOwner,
) -> Result<Option<(ItemKey, DataRefPayload)>> {
    let mut cursor = ItemKey::new(bytenr.0, EXTENT_DATA_REF_KEY, 0);
    while let Some((key, bytes)) = store.search_at_or_after(cursor) {
        if key.objectid != bytenr.0 || key.item_type != EXTENT_DATA_REF_KEY {
            break;
        }
        let payload = DataRefPayload::parse(&bytes).map_err(|e| parse_to_engine(bytenr, &e))?;
        if payload.matches(owner) {
            return Ok(Some((key, payload)));
        }
        let Some(next) = key.offset.checked_add(1) else {
            break;
        };
        cursor = ItemKey::new(key.objectid, key.item_type, next);
    }
    Ok(None)
}

/// Insert a keyed data-ref record, linear-probing past hash collisions.
fn insert_keyed_data(
    store: &dyn TreeStore,
    bytenr: Bytenr,
    owner: RefOwner,
    count: u32,
) -> Result<()> {
    let RefOwner::Data {
        root,
        objectid,
        offset,
    } = owner
    else {
        structural_violation("insert_keyed_data called with non-data owner");
    };
    let payload = DataRefPayload {
        root,
        objectid,
        offset,
        count,
    };
    let hash = owner.disambiguator();
    for probe in 0..MAX_HASH_PROBES {
        let Some(slot) = hash.checked_add(probe) else {
            break;
        };
        let key = ItemKey::new(bytenr.0, EXTENT_DATA_REF_KEY, slot);
        match store.insert(key, &payload.encode()) {
            Ok(()) => return Ok(()),
            Err(EngineError::Exists) => continue,
            Err(other) => return Err(other),
        }
    }
    Err(EngineError::Corruption {
        bytenr: bytenr.0,
        detail: format!("keyed data-ref probe window exhausted at hash {hash:#x}"),
    })
}

/// Look up the keyed record for `owner`, returning (key, count).
fn find_keyed(
    store: &dyn TreeStore,
    bytenr: Bytenr,
    owner: RefOwner,
) -> Result<Option<(ItemKey, u64)>> {
    match owner {
        RefOwner::TreeBlock { .. } | RefOwner::SharedBlock { .. } => {
            let key = keyed_tree_key(bytenr, owner);
            Ok(store.search(key).map(|_| (key, 1)))
        }
        RefOwner::Data { .. } => Ok(find_keyed_data(store, bytenr, owner)?
            .map(|(key, payload)| (key, u64::from(payload.count)))),
        RefOwner::SharedData { .. } => {
            let key = keyed_tree_key(bytenr, owner);
            match store.search(key) {
                Some(bytes) => {
                    let payload = SharedDataRefPayload::parse(&bytes)
                        .map_err(|e| parse_to_engine(bytenr, &e))?;
                    Ok(Some((key, u64::from(payload.count))))
                }
                None => Ok(None),
            }
        }
    }
}

fn bump_keyed(
    store: &dyn TreeStore,
    bytenr: Bytenr,
    owner: RefOwner,
    key: ItemKey,
    delta: u64,
) -> Result<()> {
    match owner {
        RefOwner::TreeBlock { .. } | RefOwner::SharedBlock { .. } => Ok(()),
        RefOwner::Data { .. } => {
            let bytes = store.search(key).unwrap_or_else(|| {
                structural_violation(&format!("keyed data ref vanished at {key}"))
            });
            let mut payload =
                DataRefPayload::parse(&bytes).map_err(|e| parse_to_engine(bytenr, &e))?;
            payload.count = checked_count_add(payload.count, delta);
            store.update(key, &payload.encode())
        }
        RefOwner::SharedData { .. } => {
            let bytes = store.search(key).unwrap_or_else(|| {
                structural_violation(&format!("keyed shared-data ref vanished at {key}"))
            });
            let mut payload =
                SharedDataRefPayload::parse(&bytes).map_err(|e| parse_to_engine(bytenr, &e))?;
            payload.count = checked_count_add(payload.count, delta);
            store.update(key, &payload.encode())
        }
    }
}

fn checked_count_add(count: u32, delta: u64) -> u32 {
    u64::from(count)
        .checked_add(delta)
        .and_then(|v| u32::try_from(v).ok())
        .unwrap_or_else(|| structural_violation("backref count overflow"))
}

// ── Logical contract ────────────────────────────────────────────────────────

/// References `owner` holds on the extent, or `None` if it holds none.
pub fn lookup_ref(
    store: &dyn TreeStore,
    bytenr: Bytenr,
    num_bytes: u64,
    owner: RefOwner,
) -> Result<Option<u64>> {
    let Some(item) = read_extent_item(store, bytenr, num_bytes)? else {
        return Ok(None);
    };
    if let Some(idx) = item.find_inline(owner) {
        return Ok(Some(item.inline_refs[idx].count()));
    }
    Ok(find_keyed(store, bytenr, owner)?.map(|(_, count)| count))
}

/// Add `delta` references from `owner`, inline first, escalating to a keyed
/// record when the item is out of room.
///
/// Fails with `NotFound` if the extent item does not exist; the delayed-ref
/// engine decides whether that means "materialize now" or a violation.
pub fn insert_or_bump(
    store: &dyn TreeStore,
    bytenr: Bytenr,
    num_bytes: u64,
    owner: RefOwner,
    delta: u64,
) -> Result<()> {
    let item_key = ItemKey::extent_item(bytenr, num_bytes);
    let Some(mut item) = read_extent_item(store, bytenr, num_bytes)? else {
        return Err(EngineError::NotFound(format!("extent item {item_key}")));
    };

    let tree_like = matches!(
        owner,
        RefOwner::TreeBlock { .. } | RefOwner::SharedBlock { .. }
    );

    if let Some(idx) = item.find_inline(owner) {
        if !tree_like {
            let inline = &mut item.inline_refs[idx];
            match inline {
                InlineRef::Data { count, .. } | InlineRef::SharedData { count, .. } => {
                    *count = checked_count_add(*count, delta);
                }
                InlineRef::TreeBlock { .. } | InlineRef::SharedBlock { .. } => {}
            }
        }
        // Tree-block records are presence-only; the total below carries the
        // multiplicity.
    } else if let Some((key, _)) = find_keyed(store, bytenr, owner)? {
        bump_keyed(store, bytenr, owner, key, delta)?;
    } else {
        let count32 = u32::try_from(delta)
            .unwrap_or_else(|_| structural_violation("backref count overflow"));
        let inline = InlineRef::for_owner(owner, count32);
        if item.encoded_len() + inline.encoded_len() <= MAX_EXTENT_ITEM_SIZE {
            item.insert_inline(inline);
        } else {
            tracing::debug!(
                target: "cfs::backref",
                bytenr = bytenr.0,
                ref_type = owner.ref_type(),
                "inline_capacity_exhausted_escalating_to_keyed"
            );
            match owner {
                RefOwner::TreeBlock { .. } | RefOwner::SharedBlock { .. } => {
                    store.insert(keyed_tree_key(bytenr, owner), &[])?;
                }
                RefOwner::Data { .. } => insert_keyed_data(store, bytenr, owner, count32)?,
                RefOwner::SharedData { .. } => {
                    let payload = SharedDataRefPayload { count: count32 };
                    store.insert(keyed_tree_key(bytenr, owner), &payload.encode())?;
                }
            }
        }
    }

    item.refs = item
        .refs
        .checked_add(delta)
        .unwrap_or_else(|| structural_violation("extent refcount overflow"));
    write_item(store, item_key, &item.encode())
}

/// Drop `delta` references from `owner`.
///
/// Deletes the backref record when its count reaches zero, deletes the
/// extent item when it was the last record, and returns the remaining total
/// refcount (0 means the item is gone).
pub fn remove_or_decrement(
    store: &dyn TreeStore,
    bytenr: Bytenr,
    num_bytes: u64,
    owner: RefOwner,
    delta: u64,
) -> Result<u64> {
    let item_key = ItemKey::extent_item(bytenr, num_bytes);
    let Some(mut item) = read_extent_item(store, bytenr, num_bytes)? else {
        structural_violation(&format!("ref drop for missing extent item {item_key}"));
    };

    if let Some(idx) = item.find_inline(owner) {
        let remove = match &mut item.inline_refs[idx] {
            InlineRef::TreeBlock { .. } | InlineRef::SharedBlock { .. } => true,
            InlineRef::Data { count, .. } | InlineRef::SharedData { count, .. } => {
                let have = u64::from(*count);
                if have < delta {
                    structural_violation(&format!(
                        "backref count underflow on extent {}: have {have}, dropping {delta}",
                        bytenr.0
                    ));
                }
                let remaining = have - delta;
                *count = u32::try_from(remaining)
                    .unwrap_or_else(|_| structural_violation("backref count overflow"));
                remaining == 0
            }
        };
        if remove {
            item.inline_refs.remove(idx);
        }
    } else if let Some((key, count)) = find_keyed(store, bytenr, owner)? {
        if count < delta {
            structural_violation(&format!(
                "backref count underflow on extent {}: have {count}, dropping {delta}",
                bytenr.0
            ));
        }
        let remaining = count - delta;
        let tree_like = matches!(
            owner,
            RefOwner::TreeBlock { .. } | RefOwner::SharedBlock { .. }
        );
        if tree_like || remaining == 0 {
            store.delete(key)?;
        } else {
            match owner {
                RefOwner::Data { .. } => {
                    let bytes = store.search(key).unwrap_or_else(|| {
                        structural_violation(&format!("keyed data ref vanished at {key}"))
                    });
                    let mut payload =
                        DataRefPayload::parse(&bytes).map_err(|e| parse_to_engine(bytenr, &e))?;
                    payload.count = u32::try_from(remaining)
                        .unwrap_or_else(|_| structural_violation("backref count overflow"));
                    store.update(key, &payload.encode())?;
                }
                RefOwner::SharedData { .. } => {
                    let payload = SharedDataRefPayload {
                        count: u32::try_from(remaining)
                            .unwrap_or_else(|_| structural_violation("backref count overflow")),
                    };
                    store.update(key, &payload.encode())?;
                }
                RefOwner::TreeBlock { .. } | RefOwner::SharedBlock { .. } => {}
            }
        }
    } else {
        structural_violation(&format!(
            "missing backref for extent {} (owner type {})",
            bytenr.0,
            owner.ref_type()
        ));
    }

    if item.refs < delta {
        structural_violation(&format!(
            "extent refcount underflow at {}: refs {}, dropping {delta}",
            bytenr.0, item.refs
        ));
    }
    item.refs -= delta;

    if item.refs == 0 {
        if !item.inline_refs.is_empty() || has_keyed_refs(store, bytenr) {
            structural_violation(&format!(
                "extent {} refcount reached zero with live backrefs",
                bytenr.0
            ));
        }
        store.delete(item_key)?;
        tracing::debug!(
            target: "cfs::backref",
            bytenr = bytenr.0,
            num_bytes,
            "extent_item_deleted"
        );
        Ok(0)
    } else {
        write_item(store, item_key, &item.encode())?;
        Ok(item.refs)
    }
}

fn has_keyed_refs(store: &dyn TreeStore, bytenr: Bytenr) -> bool {
    // Keyed ref types all sort after EXTENT_ITEM for the same objectid.
    let cursor = ItemKey::new(bytenr.0, EXTENT_ITEM_KEY + 1, 0);
    matches!(
        store.search_at_or_after(cursor),
        Some((key, _)) if key.objectid == bytenr.0
    )
}

/// (stored total, sum of per-record counts) for conservation checks.
///
/// Returns `None` if the extent item does not exist.
pub fn refcount_sums(
    store: &dyn TreeStore,
    bytenr: Bytenr,
    num_bytes: u64,
) -> Result<Option<(u64, u64)>> {
    let Some(item) = read_extent_item(store, bytenr, num_bytes)? else {
        return Ok(None);
    };

    let mut sum = item.inline_count_sum();
    let mut cursor = ItemKey::new(bytenr.0, EXTENT_ITEM_KEY + 1, 0);
    while let Some((key, bytes)) = store.search_at_or_after(cursor) {
        if key.objectid != bytenr.0 {
            break;
        }
        sum += match key.item_type {
            EXTENT_DATA_REF_KEY => u64::from(
                DataRefPayload::parse(&bytes)
                    .map_err(|e| parse_to_engine(bytenr, &e))?
                    .count,
            ),
            SHARED_DATA_REF_KEY => u64::from(
                SharedDataRefPayload::parse(&bytes)
                    .map_err(|e| parse_to_engine(bytenr, &e))?
                    .count,
            ),
            _ => 1,
        };
        let Some(next) = key.offset.checked_add(1) else {
            break;
        };
        cursor = ItemKey::new(key.objectid, key.item_type, next);
    }

    Ok(Some((item.refs, sum)))
}
