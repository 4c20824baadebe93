//! Node-local ownership cache
//!
//! For every collection the node has looked at, the cache keeps the latest
//! routing table it observed plus the ranges currently mid-transfer:
//!
//! - pending-outgoing: ranges this node is donating (still owned)
//! - pending-incoming: ranges this node is receiving (not yet owned)
//!
//! Every key is classified as exactly one of [`Classification`]. Orphan
//! classification is conservative: a collection whose routing is unknown
//! classifies as `Unknown`, and nothing deletes `Unknown` data.
//!
//! Routing tables are installed compare-and-swap style: a table older than
//! the one already cached is ignored.

use std::collections::HashMap;

use ferry_catalog::{MetadataAuthority, RoutingTable};
use ferry_core::{
    CollectionId, FerryError, FerryResult, KeyRange, MigrationId, NodeId, PlacementVersion,
    ShardKey,
};
use parking_lot::RwLock;
use tracing::{debug, error};

/// How this node relates to a key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Owned and not being donated
    Owned,
    /// Being received by an in-flight migration
    PendingIncoming,
    /// Being donated by an in-flight migration; served only while still owned
    PendingOutgoing,
    /// Not owned and not mid-transfer
    Orphaned,
    /// No routing information loaded
    Unknown,
}

#[derive(Debug, Default)]
struct CollectionOwnership {
    table: Option<RoutingTable>,
    owned: Vec<KeyRange>,
    incoming: Vec<(MigrationId, KeyRange)>,
    outgoing: Vec<(MigrationId, KeyRange)>,
    quarantined: bool,
}

impl CollectionOwnership {
    fn classify(&self, key: &ShardKey) -> Classification {
        if self.outgoing.iter().any(|(_, r)| r.contains(key)) {
            return Classification::PendingOutgoing;
        }
        if self.incoming.iter().any(|(_, r)| r.contains(key)) {
            return Classification::PendingIncoming;
        }
        if self.table.is_none() {
            return Classification::Unknown;
        }
        if self.owned.iter().any(|r| r.contains(key)) {
            Classification::Owned
        } else {
            Classification::Orphaned
        }
    }

    fn serves(&self, key: &ShardKey) -> bool {
        self.table.is_some()
            && self.owned.iter().any(|r| r.contains(key))
            && !self.incoming.iter().any(|(_, r)| r.contains(key))
    }
}

/// Ownership state of one node, per collection
#[derive(Debug)]
pub struct OwnershipCache {
    node: NodeId,
    collections: RwLock<HashMap<CollectionId, CollectionOwnership>>,
}

impl OwnershipCache {
    /// Create an empty cache for `node`
    pub fn new(node: NodeId) -> Self {
        Self {
            node,
            collections: RwLock::new(HashMap::new()),
        }
    }

    /// Install a routing table unless a newer one is already cached
    ///
    /// Returns true if the table was installed.
    pub fn install(&self, table: RoutingTable) -> bool {
        let mut collections = self.collections.write();
        let entry = collections.entry(table.collection).or_default();
        if let Some(current) = &entry.table {
            if current.version > table.version {
                debug!(
                    target: "ferry::node",
                    collection = %table.collection,
                    cached = %current.version,
                    offered = %table.version,
                    "Ignoring stale routing table"
                );
                return false;
            }
        }
        entry.owned = table
            .owned_by(&self.node)
            .map(|c| c.range.clone())
            .collect();
        debug!(
            target: "ferry::node",
            collection = %table.collection,
            version = %table.version,
            owned = entry.owned.len(),
            "Installed routing table"
        );
        entry.table = Some(table);
        true
    }

    /// Fetch and install the authority's current routing table
    pub fn refresh(
        &self,
        authority: &dyn MetadataAuthority,
        collection: &CollectionId,
    ) -> FerryResult<PlacementVersion> {
        let table = authority.routing_table(collection)?;
        let version = table.version;
        self.install(table);
        Ok(version)
    }

    /// Load routing for `collection` if nothing is cached yet
    pub fn ensure_loaded(
        &self,
        authority: &dyn MetadataAuthority,
        collection: &CollectionId,
    ) -> FerryResult<()> {
        if self.is_loaded(collection) {
            return Ok(());
        }
        self.refresh(authority, collection).map(|_| ())
    }

    /// True if a routing table is cached for `collection`
    pub fn is_loaded(&self, collection: &CollectionId) -> bool {
        self.collections
            .read()
            .get(collection)
            .map(|c| c.table.is_some())
            .unwrap_or(false)
    }

    /// Cached routing table
    pub fn routing_table(&self, collection: &CollectionId) -> Option<RoutingTable> {
        self.collections
            .read()
            .get(collection)
            .and_then(|c| c.table.clone())
    }

    /// Classify `key`
    pub fn classify(&self, collection: &CollectionId, key: &ShardKey) -> Classification {
        self.collections
            .read()
            .get(collection)
            .map(|c| c.classify(key))
            .unwrap_or(Classification::Unknown)
    }

    /// True if reads and writes of `key` are served by this node
    ///
    /// A pending-outgoing key is served until the commit is applied locally.
    pub fn serves(&self, collection: &CollectionId, key: &ShardKey) -> bool {
        self.collections
            .read()
            .get(collection)
            .map(|c| c.serves(key))
            .unwrap_or(false)
    }

    /// Stop owning `range` locally once its commit is known to have landed
    ///
    /// Bridges the gap until the next routing refresh; the pending-outgoing
    /// marker stays so the range is still excluded from cleanup.
    pub fn apply_commit(&self, collection: &CollectionId, range: &KeyRange) {
        if let Some(entry) = self.collections.write().get_mut(collection) {
            let owned = std::mem::take(&mut entry.owned);
            entry.owned = owned
                .iter()
                .flat_map(|r| r.subtract(std::slice::from_ref(range)))
                .collect();
        }
    }

    /// Ranges this node owns, in key order
    pub fn owned_ranges(&self, collection: &CollectionId) -> Vec<KeyRange> {
        self.collections
            .read()
            .get(collection)
            .map(|c| c.owned.clone())
            .unwrap_or_default()
    }

    /// Gaps between owned ranges across the whole key space
    ///
    /// `None` if routing is unknown: nothing can be called unowned then.
    pub fn unowned_ranges(&self, collection: &CollectionId) -> Option<Vec<KeyRange>> {
        let collections = self.collections.read();
        let entry = collections.get(collection)?;
        entry.table.as_ref()?;
        Some(KeyRange::full().subtract(&entry.owned))
    }

    /// Every pending range, incoming and outgoing
    pub fn pending_ranges(&self, collection: &CollectionId) -> Vec<KeyRange> {
        self.collections
            .read()
            .get(collection)
            .map(|c| {
                c.incoming
                    .iter()
                    .chain(c.outgoing.iter())
                    .map(|(_, r)| r.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Mark a range as being received by `migration`
    pub fn mark_pending_incoming(
        &self,
        collection: &CollectionId,
        migration: &MigrationId,
        range: &KeyRange,
    ) -> FerryResult<()> {
        let mut collections = self.collections.write();
        let entry = collections.entry(*collection).or_default();
        Self::add_pending(&mut entry.incoming, &entry.outgoing, migration, range)
    }

    /// Mark a range as being donated by `migration`
    pub fn mark_pending_outgoing(
        &self,
        collection: &CollectionId,
        migration: &MigrationId,
        range: &KeyRange,
    ) -> FerryResult<()> {
        let mut collections = self.collections.write();
        let entry = collections.entry(*collection).or_default();
        Self::add_pending(&mut entry.outgoing, &entry.incoming, migration, range)
    }

    fn add_pending(
        target: &mut Vec<(MigrationId, KeyRange)>,
        other: &[(MigrationId, KeyRange)],
        migration: &MigrationId,
        range: &KeyRange,
    ) -> FerryResult<()> {
        if target.iter().any(|(m, _)| m == migration) {
            return Ok(());
        }
        if let Some((m, r)) = target
            .iter()
            .chain(other.iter())
            .find(|(_, r)| r.overlaps(range))
        {
            return Err(FerryError::conflict(format!(
                "range {} overlaps pending range {} of migration {}",
                range, r, m
            )));
        }
        target.push((*migration, range.clone()));
        Ok(())
    }

    /// Clear the pending-incoming marker of `migration`
    pub fn clear_pending_incoming(&self, collection: &CollectionId, migration: &MigrationId) {
        if let Some(entry) = self.collections.write().get_mut(collection) {
            entry.incoming.retain(|(m, _)| m != migration);
        }
    }

    /// Clear the pending-outgoing marker of `migration`
    pub fn clear_pending_outgoing(&self, collection: &CollectionId, migration: &MigrationId) {
        if let Some(entry) = self.collections.write().get_mut(collection) {
            entry.outgoing.retain(|(m, _)| m != migration);
        }
    }

    /// Stop serving a collection whose coordination state is unreadable
    pub fn quarantine(&self, collection: &CollectionId) {
        let mut collections = self.collections.write();
        collections.entry(*collection).or_default().quarantined = true;
        error!(
            target: "ferry::node",
            collection = %collection,
            "Collection quarantined; reads, writes and cleanup refused"
        );
    }

    /// True if the collection is quarantined
    pub fn is_quarantined(&self, collection: &CollectionId) -> bool {
        self.collections
            .read()
            .get(collection)
            .map(|c| c.quarantined)
            .unwrap_or(false)
    }

    /// Fail with `Quarantined` if the collection must not be served
    pub fn check_serving(&self, collection: &CollectionId) -> FerryResult<()> {
        if self.is_quarantined(collection) {
            return Err(FerryError::Quarantined {
                collection: *collection,
            });
        }
        Ok(())
    }
}
