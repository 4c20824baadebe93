//! In-process metadata authority
//!
//! Holds every collection's chunk map behind one lock, so each request is
//! linearizable. Fault injection lets tests model an authority that is
//! unreachable, or one that applied a commit but whose response was lost.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use ferry_core::{
    CollectionId, FerryError, FerryResult, KeyRange, NodeId, PlacementVersion, ShardKey,
};
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::authority::{EnsureOutcome, EnsureOwnership, MetadataAuthority};
use crate::routing::{Chunk, RoutingTable};

#[derive(Debug, Default)]
struct CollectionEntry {
    /// Chunks keyed by their lower bound
    chunks: BTreeMap<ShardKey, Chunk>,
}

impl CollectionEntry {
    fn version(&self) -> PlacementVersion {
        self.chunks
            .values()
            .map(|c| c.version)
            .max()
            .unwrap_or(PlacementVersion::INITIAL)
    }

    fn containing(&self, range: &KeyRange) -> Option<&Chunk> {
        self.chunks
            .range(..=range.start().clone())
            .next_back()
            .map(|(_, c)| c)
            .filter(|c| c.range.covers(range))
    }

    fn table(&self, collection: CollectionId) -> RoutingTable {
        RoutingTable {
            collection,
            version: self.version(),
            chunks: self.chunks.values().cloned().collect(),
        }
    }
}

/// In-memory `MetadataAuthority`
#[derive(Debug, Default)]
pub struct InMemoryCatalog {
    collections: RwLock<HashMap<CollectionId, CollectionEntry>>,
    failures: AtomicUsize,
    lost_responses: AtomicUsize,
    commit_calls: AtomicU64,
}

impl InMemoryCatalog {
    /// Create an empty catalog
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a collection with one chunk covering the whole key space
    pub fn shard_collection(&self, collection: CollectionId, owner: NodeId) -> FerryResult<()> {
        let mut collections = self.collections.write();
        if collections.contains_key(&collection) {
            return Err(FerryError::invalid_input(format!(
                "collection {} is already sharded",
                collection
            )));
        }
        let mut entry = CollectionEntry::default();
        entry.chunks.insert(
            ShardKey::MinKey,
            Chunk {
                range: KeyRange::full(),
                owner: owner.clone(),
                version: PlacementVersion::INITIAL,
            },
        );
        collections.insert(collection, entry);
        info!(target: "ferry::catalog", collection = %collection, owner = %owner, "Sharded collection");
        Ok(())
    }

    /// Split the chunk holding `at` into `[min, at)` and `[at, max)`
    ///
    /// Both halves keep the owner and take the next two minor versions.
    /// Splitting at an existing chunk boundary is a no-op.
    pub fn split_chunk(&self, collection: &CollectionId, at: impl Into<ShardKey>) -> FerryResult<()> {
        let at = at.into();
        if at.is_sentinel() {
            return Err(FerryError::invalid_input("cannot split at a key-space bound"));
        }
        let mut collections = self.collections.write();
        let entry = collections
            .get_mut(collection)
            .ok_or_else(|| FerryError::not_found(format!("collection {}", collection)))?;
        let Some((lower, chunk)) = entry
            .chunks
            .range(..=at.clone())
            .next_back()
            .map(|(k, c)| (k.clone(), c.clone()))
        else {
            return Err(FerryError::corruption("chunk map does not start at MinKey"));
        };
        if lower == at {
            return Ok(());
        }

        let base = entry.version().next_minor();
        let left = Chunk {
            range: KeyRange::new(chunk.range.start().clone(), at.clone())?,
            owner: chunk.owner.clone(),
            version: base,
        };
        let right = Chunk {
            range: KeyRange::new(at.clone(), chunk.range.end().clone())?,
            owner: chunk.owner,
            version: base.next_minor(),
        };
        entry.chunks.insert(lower, left);
        entry.chunks.insert(at.clone(), right);
        debug!(target: "ferry::catalog", collection = %collection, at = %at, "Split chunk");
        Ok(())
    }

    /// Make the next `n` commit calls fail with `Transient` and no effect
    pub fn inject_failures(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` commit calls apply, then report `Transient`
    pub fn inject_lost_responses(&self, n: usize) {
        self.lost_responses.store(n, Ordering::SeqCst);
    }

    /// Number of commit calls received so far
    pub fn commit_calls(&self) -> u64 {
        self.commit_calls.load(Ordering::SeqCst)
    }

    fn take_one(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn apply(&self, request: &EnsureOwnership) -> FerryResult<EnsureOutcome> {
        let mut collections = self.collections.write();
        let entry = collections
            .get_mut(&request.collection)
            .ok_or_else(|| FerryError::not_found(format!("collection {}", request.collection)))?;

        let chunk = entry.containing(&request.range).cloned().ok_or_else(|| {
            FerryError::conflict(format!(
                "range {} does not lie within a single chunk",
                request.range
            ))
        })?;

        if chunk.owner == request.recipient {
            if chunk.version >= request.version {
                return Ok(EnsureOutcome::AlreadySatisfied);
            }
            return Err(FerryError::conflict(format!(
                "recipient {} owns {} at older version {}",
                request.recipient, chunk.range, chunk.version
            )));
        }
        if chunk.owner != request.donor {
            return Err(FerryError::conflict(format!(
                "range {} is owned by {}, neither donor nor recipient",
                request.range, chunk.owner
            )));
        }
        if chunk.version >= request.version {
            return Err(FerryError::conflict(format!(
                "donor chunk {} is already at version {} (requested {})",
                chunk.range, chunk.version, request.version
            )));
        }

        // The moved range never goes backwards relative to the collection.
        let moved_version = std::cmp::max(request.version, entry.version().next_major());
        let mut remainder_version = moved_version.next_minor();

        entry.chunks.remove(chunk.range.start());
        if chunk.range.start() < request.range.start() {
            let left = KeyRange::new(chunk.range.start().clone(), request.range.start().clone())?;
            entry.chunks.insert(
                left.start().clone(),
                Chunk {
                    range: left,
                    owner: request.donor.clone(),
                    version: remainder_version,
                },
            );
            remainder_version = remainder_version.next_minor();
        }
        entry.chunks.insert(
            request.range.start().clone(),
            Chunk {
                range: request.range.clone(),
                owner: request.recipient.clone(),
                version: moved_version,
            },
        );
        if request.range.end() < chunk.range.end() {
            let right = KeyRange::new(request.range.end().clone(), chunk.range.end().clone())?;
            entry.chunks.insert(
                right.start().clone(),
                Chunk {
                    range: right,
                    owner: request.donor.clone(),
                    version: remainder_version,
                },
            );
        }

        info!(
            target: "ferry::catalog",
            collection = %request.collection,
            range = %request.range,
            donor = %request.donor,
            recipient = %request.recipient,
            version = %moved_version,
            "Committed ownership change"
        );
        Ok(EnsureOutcome::Applied)
    }
}

impl MetadataAuthority for InMemoryCatalog {
    fn routing_table(&self, collection: &CollectionId) -> FerryResult<RoutingTable> {
        self.collections
            .read()
            .get(collection)
            .map(|entry| entry.table(*collection))
            .ok_or_else(|| FerryError::not_found(format!("collection {}", collection)))
    }

    fn ensure_ownership_at_least(&self, request: &EnsureOwnership) -> FerryResult<EnsureOutcome> {
        self.commit_calls.fetch_add(1, Ordering::SeqCst);

        if Self::take_one(&self.failures) {
            warn!(target: "ferry::catalog", range = %request.range, "Injected authority failure");
            return Err(FerryError::transient("metadata authority unreachable"));
        }

        let outcome = self.apply(request)?;

        if Self::take_one(&self.lost_responses) {
            warn!(target: "ferry::catalog", range = %request.range, "Injected lost commit response");
            return Err(FerryError::transient("commit response lost"));
        }
        Ok(outcome)
    }
}
