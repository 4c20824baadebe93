//! Storage layer for Ferry
//!
//! This crate implements the node-local document storage:
//! - DocumentStore: per-collection ordered maps behind DashMap + RwLock
//! - WriteJournal: bounded per-collection change log used by migration catch-up
//! - WriteOp::ApplyOps: atomic multi-op unit for key-changing updates
//! - Batched, predicate-guarded range deletion
//!
//! Ownership is not enforced here; callers in the engine decide which keys
//! a node may serve or delete.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod document_store;
pub mod journal;

pub use document_store::{
    CollectionWriteView, DocumentStore, RangeSnapshot, DEFAULT_JOURNAL_RETENTION,
};
pub use journal::{JournalEntry, WriteJournal, WriteOp};
