#![forbid(unsafe_code)]
//! Extent items, backref encodings, and the delayed reference engine.
//!
//! The persisted model: every allocated extent has one extent item carrying
//! its total refcount plus inline backref sub-records; referencers that no
//! longer fit inline escalate to keyed records (`item`, `backref`).
//! Mutations arrive through the write-combining delayed-ref log and are
//! replayed in a refcount-safe order (`delayed`).

pub mod backref;
mod delayed;
mod item;

pub use delayed::{
    Budget, DelayedRefEngine, DelayedRefInsert, ExtentOp, RefAction, RefContext,
};
pub use item::{
    data_ref_hash, BlockGroupItem, DataRefPayload, ExtentItem, InlineRef, RefOwner,
    SharedDataRefPayload, TreeBlockInfo, MAX_EXTENT_ITEM_SIZE,
};
