//! Shared state of one running node

use std::collections::HashMap;
use std::sync::Arc;

use ferry_catalog::MetadataAuthority;
use ferry_core::{FerryError, FerryResult, MigrationId, NodeId};
use ferry_durability::RecordStore;
use ferry_storage::DocumentStore;
use parking_lot::Mutex;

use crate::config::FerryConfig;
use crate::critical_section::CriticalSections;
use crate::directory::ClusterDirectory;
use crate::fail_points::FailPoints;
use crate::migration::{MigrationDescriptor, MigrationRecord, MigrationRegistry, RecipientEndpoint};
use crate::ownership::OwnershipCache;
use crate::parameters::NodeParameters;
use crate::range_deleter::RangeDeleter;

/// Everything the node's components share
///
/// Coordinator threads hold an `Arc` of it; the cluster directory holds a
/// `Weak`, so the context goes away once the node and its threads do.
pub(crate) struct NodeContext {
    pub(crate) id: NodeId,
    pub(crate) config: FerryConfig,
    pub(crate) params: Arc<NodeParameters>,
    pub(crate) store: Arc<DocumentStore>,
    pub(crate) authority: Arc<dyn MetadataAuthority>,
    pub(crate) directory: Arc<ClusterDirectory>,
    pub(crate) ownership: Arc<OwnershipCache>,
    pub(crate) critical: CriticalSections,
    pub(crate) fail_points: FailPoints,
    pub(crate) records: Arc<RecordStore<MigrationRecord>>,
    pub(crate) deleter: RangeDeleter,
    pub(crate) migrations: MigrationRegistry,
    /// Receiving sessions, by migration
    pub(crate) sessions: Mutex<HashMap<MigrationId, MigrationDescriptor>>,
}

impl NodeContext {
    /// Resolve a peer's recipient endpoint
    pub(crate) fn recipient(&self, node: &NodeId) -> FerryResult<Arc<dyn RecipientEndpoint>> {
        self.directory.endpoint(node)
    }

    /// Apply `f` to a persisted coordination record and return the result
    pub(crate) fn update_record<F>(&self, key: &str, f: F) -> FerryResult<MigrationRecord>
    where
        F: FnOnce(&mut MigrationRecord) -> FerryResult<()>,
    {
        self.records
            .update(key, f)?
            .ok_or_else(|| FerryError::not_found(format!("coordination record {}", key)))
    }
}
