//! In-process cluster directory
//!
//! Maps node ids to their recipient endpoints. Endpoints are held weakly: a
//! node that shut down simply becomes unreachable, and a restarted node
//! re-registers under the same id. Partitions are simulated by hiding a
//! node without unregistering it.

use std::collections::HashSet;
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use ferry_core::{FerryError, FerryResult, NodeId};
use parking_lot::RwLock;
use tracing::{debug, info};

use crate::migration::RecipientEndpoint;

/// Registry of reachable nodes
#[derive(Default)]
pub struct ClusterDirectory {
    endpoints: DashMap<NodeId, Weak<dyn RecipientEndpoint>>,
    partitioned: RwLock<HashSet<NodeId>>,
}

impl ClusterDirectory {
    /// Create an empty directory
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the endpoint of `node`
    pub fn register(&self, node: NodeId, endpoint: Weak<dyn RecipientEndpoint>) {
        debug!(target: "ferry::cluster", node = %node, "Registered node endpoint");
        self.endpoints.insert(node, endpoint);
    }

    /// Remove `node`
    pub fn unregister(&self, node: &NodeId) {
        self.endpoints.remove(node);
    }

    /// Resolve `node`, failing with `NodeUnreachable` if it is gone or cut off
    pub fn endpoint(&self, node: &NodeId) -> FerryResult<Arc<dyn RecipientEndpoint>> {
        if self.partitioned.read().contains(node) {
            return Err(FerryError::NodeUnreachable { node: node.clone() });
        }
        self.endpoints
            .get(node)
            .and_then(|weak| weak.upgrade())
            .ok_or_else(|| FerryError::NodeUnreachable { node: node.clone() })
    }

    /// Make `node` unreachable until `heal`
    pub fn partition(&self, node: &NodeId) {
        info!(target: "ferry::cluster", node = %node, "Node partitioned");
        self.partitioned.write().insert(node.clone());
    }

    /// Undo `partition`
    pub fn heal(&self, node: &NodeId) {
        if self.partitioned.write().remove(node) {
            info!(target: "ferry::cluster", node = %node, "Node reachable again");
        }
    }
}

impl std::fmt::Debug for ClusterDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterDirectory")
            .field("nodes", &self.endpoints.len())
            .field("partitioned", &self.partitioned.read().len())
            .finish()
    }
}
