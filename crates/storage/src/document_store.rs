//! Node-local document storage
//!
//! # Design
//!
//! - DashMap keyed by CollectionId: collections never contend with each other
//! - Per-collection RwLock over an ordered BTreeMap: range scans and range
//!   deletes walk keys in shard-key order
//! - The write journal lives under the same lock as the documents, so a
//!   snapshot taken under the read lock is consistent with the journal
//!   sequence it reports
//!
//! This layer knows nothing about ownership. Reads here are the "direct"
//! reads of the underlying storage; ownership filtering happens in the
//! engine.

use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;
use ferry_core::{CollectionId, Document, FerryResult, KeyRange, ShardKey};
use parking_lot::RwLock;

use crate::journal::{JournalEntry, WriteJournal, WriteOp};

/// Default number of journal entries retained per collection
pub const DEFAULT_JOURNAL_RETENTION: usize = 100_000;

#[derive(Debug)]
struct CollectionData {
    docs: BTreeMap<ShardKey, Document>,
    journal: WriteJournal,
}

impl CollectionData {
    fn new(retention: usize) -> Self {
        Self {
            docs: BTreeMap::new(),
            journal: WriteJournal::new(retention),
        }
    }

    fn apply(&mut self, op: &WriteOp) {
        match op {
            WriteOp::Insert(doc) | WriteOp::Update(doc) => {
                self.docs.insert(doc.key.clone(), doc.clone());
            }
            WriteOp::Delete(key) => {
                self.docs.remove(key);
            }
            WriteOp::ApplyOps(ops) => {
                for op in ops {
                    self.apply(op);
                }
            }
        }
    }
}

/// Documents of a range plus the journal position they are consistent with
#[derive(Debug, Clone)]
pub struct RangeSnapshot {
    /// Documents inside the range, in key order
    pub docs: Vec<Document>,
    /// Last journal sequence reflected in `docs`
    pub seq: u64,
}

/// Node-local document store
#[derive(Debug)]
pub struct DocumentStore {
    collections: DashMap<CollectionId, Arc<RwLock<CollectionData>>>,
    journal_retention: usize,
}

impl Default for DocumentStore {
    fn default() -> Self {
        Self::new()
    }
}

impl DocumentStore {
    /// Create an empty store with the default journal retention
    pub fn new() -> Self {
        Self::with_journal_retention(DEFAULT_JOURNAL_RETENTION)
    }

    /// Create an empty store keeping `retention` journal entries per collection
    pub fn with_journal_retention(retention: usize) -> Self {
        Self {
            collections: DashMap::new(),
            journal_retention: retention,
        }
    }

    fn collection(&self, collection: &CollectionId) -> Arc<RwLock<CollectionData>> {
        self.collections
            .entry(*collection)
            .or_insert_with(|| Arc::new(RwLock::new(CollectionData::new(self.journal_retention))))
            .clone()
    }

    fn existing(&self, collection: &CollectionId) -> Option<Arc<RwLock<CollectionData>>> {
        self.collections.get(collection).map(|c| c.clone())
    }

    /// Read a document by key
    pub fn get(&self, collection: &CollectionId, key: &ShardKey) -> Option<Document> {
        let data = self.existing(collection)?;
        let guard = data.read();
        guard.docs.get(key).cloned()
    }

    /// Insert or replace a document, journaling it as `Insert` or `Update`
    pub fn put(&self, collection: &CollectionId, doc: Document) -> u64 {
        let data = self.collection(collection);
        let mut guard = data.write();
        let op = if guard.docs.contains_key(&doc.key) {
            WriteOp::Update(doc)
        } else {
            WriteOp::Insert(doc)
        };
        guard.apply(&op);
        guard.journal.append(op)
    }

    /// Remove a document, returning it if it existed
    pub fn remove(&self, collection: &CollectionId, key: &ShardKey) -> Option<Document> {
        let data = self.existing(collection)?;
        let mut guard = data.write();
        let removed = guard.docs.remove(key)?;
        guard.journal.append(WriteOp::Delete(key.clone()));
        Some(removed)
    }

    /// Apply one op atomically and journal it as a single entry
    pub fn apply(&self, collection: &CollectionId, op: WriteOp) -> u64 {
        let data = self.collection(collection);
        let mut guard = data.write();
        guard.apply(&op);
        guard.journal.append(op)
    }

    /// Apply an op only if `check` passes for every key it writes
    ///
    /// The check runs under the collection write lock, so no concurrent
    /// writer can slip in between validation and application.
    pub fn apply_if<F>(&self, collection: &CollectionId, op: WriteOp, check: F) -> FerryResult<u64>
    where
        F: Fn(&CollectionWriteView<'_>) -> FerryResult<()>,
    {
        let data = self.collection(collection);
        let mut guard = data.write();
        check(&CollectionWriteView { docs: &guard.docs })?;
        guard.apply(&op);
        Ok(guard.journal.append(op))
    }

    /// Documents of `range` in key order
    pub fn scan_range(&self, collection: &CollectionId, range: &KeyRange) -> Vec<Document> {
        self.snapshot_range(collection, range).docs
    }

    /// Consistent snapshot of a range with its journal position
    pub fn snapshot_range(&self, collection: &CollectionId, range: &KeyRange) -> RangeSnapshot {
        let Some(data) = self.existing(collection) else {
            return RangeSnapshot {
                docs: Vec::new(),
                seq: 0,
            };
        };
        let guard = data.read();
        let docs = guard
            .docs
            .range(range.start().clone()..range.end().clone())
            .map(|(_, d)| d.clone())
            .collect();
        RangeSnapshot {
            docs,
            seq: guard.journal.last_seq(),
        }
    }

    /// Number of documents inside `range`
    pub fn count_in_range(&self, collection: &CollectionId, range: &KeyRange) -> usize {
        let Some(data) = self.existing(collection) else {
            return 0;
        };
        let guard = data.read();
        guard
            .docs
            .range(range.start().clone()..range.end().clone())
            .count()
    }

    /// Total number of documents in a collection
    pub fn len(&self, collection: &CollectionId) -> usize {
        self.existing(collection)
            .map(|d| d.read().docs.len())
            .unwrap_or(0)
    }

    /// True if the collection holds no documents
    pub fn is_empty(&self, collection: &CollectionId) -> bool {
        self.len(collection) == 0
    }

    /// Last journal sequence of a collection
    pub fn journal_head(&self, collection: &CollectionId) -> u64 {
        self.existing(collection)
            .map(|d| d.read().journal.last_seq())
            .unwrap_or(0)
    }

    /// Journal entries after `after` touching `range`
    pub fn entries_since(
        &self,
        collection: &CollectionId,
        after: u64,
        range: &KeyRange,
    ) -> FerryResult<Vec<JournalEntry>> {
        match self.existing(collection) {
            Some(data) => data.read().journal.entries_since(after, range),
            None => Ok(Vec::new()),
        }
    }

    /// Count of journal entries after `after` touching `range`
    pub fn pending_entries(&self, collection: &CollectionId, after: u64, range: &KeyRange) -> usize {
        self.existing(collection)
            .map(|d| d.read().journal.pending_count(after, range))
            .unwrap_or(0)
    }

    /// Delete up to `limit` documents strictly inside `range`
    ///
    /// `keep` is evaluated per key under the collection write lock; keys for
    /// which it returns true are left alone. Returns the number deleted.
    pub fn delete_range_batch<F>(
        &self,
        collection: &CollectionId,
        range: &KeyRange,
        limit: usize,
        keep: F,
    ) -> usize
    where
        F: Fn(&ShardKey) -> bool,
    {
        let Some(data) = self.existing(collection) else {
            return 0;
        };
        let mut guard = data.write();
        let victims: Vec<ShardKey> = guard
            .docs
            .range(range.start().clone()..range.end().clone())
            .map(|(k, _)| k)
            .filter(|k| !keep(*k))
            .take(limit)
            .cloned()
            .collect();
        for key in &victims {
            guard.docs.remove(key);
            guard.journal.append(WriteOp::Delete(key.clone()));
        }
        victims.len()
    }

    /// Collections that currently have storage allocated
    pub fn collections(&self) -> Vec<CollectionId> {
        self.collections.iter().map(|e| *e.key()).collect()
    }
}

/// Read-only view of a collection handed to `apply_if` checks
pub struct CollectionWriteView<'a> {
    docs: &'a BTreeMap<ShardKey, Document>,
}

impl CollectionWriteView<'_> {
    /// True if a document with `key` exists
    pub fn contains(&self, key: &ShardKey) -> bool {
        self.docs.contains_key(key)
    }
}
