//! Per-collection write journal
//!
//! Every mutation applied to a collection is appended here with a
//! monotonically increasing sequence number. The migration catch-up step
//! reads the journal after its clone snapshot to forward concurrent writes
//! to the recipient.
//!
//! A key-changing update is journaled as one `ApplyOps` entry holding the
//! delete of the old key and the insert of the new one, so a consumer can
//! never replay half of it.
//!
//! The journal is bounded; once an entry falls off the front, readers that
//! still needed it get `JournalRolledOver`.

use std::collections::VecDeque;

use ferry_core::{Document, FerryError, FerryResult, KeyRange, ShardKey};
use serde::{Deserialize, Serialize};

/// A single journaled mutation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WriteOp {
    /// Document inserted under a new key
    Insert(Document),
    /// Document replaced in place (same key)
    Update(Document),
    /// Document removed
    Delete(ShardKey),
    /// Mutations that must be applied (and replicated) as one unit
    ApplyOps(Vec<WriteOp>),
}

impl WriteOp {
    /// True if any part of this op addresses a key inside `range`
    pub fn touches(&self, range: &KeyRange) -> bool {
        match self {
            WriteOp::Insert(doc) | WriteOp::Update(doc) => range.contains(&doc.key),
            WriteOp::Delete(key) => range.contains(key),
            WriteOp::ApplyOps(ops) => ops.iter().any(|op| op.touches(range)),
        }
    }

    /// Keep only the parts of this op that address `range`
    ///
    /// An `ApplyOps` stays a single unit containing its in-range members.
    pub fn restrict_to(&self, range: &KeyRange) -> Option<WriteOp> {
        match self {
            WriteOp::ApplyOps(ops) => {
                let kept: Vec<WriteOp> = ops.iter().filter_map(|op| op.restrict_to(range)).collect();
                if kept.is_empty() {
                    None
                } else {
                    Some(WriteOp::ApplyOps(kept))
                }
            }
            other if other.touches(range) => Some(other.clone()),
            _ => None,
        }
    }
}

/// Journaled mutation with its sequence number
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    /// Sequence number, starting at 1
    pub seq: u64,
    /// The mutation
    pub op: WriteOp,
}

/// Bounded, ordered journal of one collection's writes
#[derive(Debug)]
pub struct WriteJournal {
    entries: VecDeque<JournalEntry>,
    last_seq: u64,
    retention: usize,
}

impl WriteJournal {
    /// Create an empty journal keeping at most `retention` entries
    pub fn new(retention: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            last_seq: 0,
            retention: retention.max(1),
        }
    }

    /// Sequence number of the most recent entry (0 if none)
    pub fn last_seq(&self) -> u64 {
        self.last_seq
    }

    /// Append an op, returning its sequence number
    pub fn append(&mut self, op: WriteOp) -> u64 {
        self.last_seq += 1;
        self.entries.push_back(JournalEntry {
            seq: self.last_seq,
            op,
        });
        while self.entries.len() > self.retention {
            self.entries.pop_front();
        }
        self.last_seq
    }

    /// Entries with `seq > after` that touch `range`, restricted to it
    pub fn entries_since(&self, after: u64, range: &KeyRange) -> FerryResult<Vec<JournalEntry>> {
        if let Some(front) = self.entries.front() {
            if after + 1 < front.seq {
                return Err(FerryError::JournalRolledOver { seq: after + 1 });
            }
        } else if after < self.last_seq {
            return Err(FerryError::JournalRolledOver { seq: after + 1 });
        }

        Ok(self
            .entries
            .iter()
            .filter(|e| e.seq > after)
            .filter_map(|e| {
                e.op.restrict_to(range).map(|op| JournalEntry { seq: e.seq, op })
            })
            .collect())
    }

    /// Number of entries with `seq > after` that touch `range`
    pub fn pending_count(&self, after: u64, range: &KeyRange) -> usize {
        self.entries
            .iter()
            .filter(|e| e.seq > after && e.op.touches(range))
            .count()
    }
}
