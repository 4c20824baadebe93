//! The metadata authority seam

use ferry_core::{CollectionId, FerryResult, KeyRange, NodeId, PlacementVersion};
use serde::{Deserialize, Serialize};

use crate::routing::RoutingTable;

/// Fenced ownership-change request
///
/// "Make `recipient` the owner of `range` at version `version` or higher,
/// provided `donor` still owns it below that version."
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnsureOwnership {
    /// Collection
    pub collection: CollectionId,
    /// Range changing hands
    pub range: KeyRange,
    /// Current owner
    pub donor: NodeId,
    /// New owner
    pub recipient: NodeId,
    /// Minimum version the moved range must end up at
    pub version: PlacementVersion,
}

/// Successful result of an ownership-change request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnsureOutcome {
    /// This call changed the routing table
    Applied,
    /// The recipient already owned the range at or above the version
    AlreadySatisfied,
}

/// Durable source of truth for range ownership
pub trait MetadataAuthority: Send + Sync {
    /// Current routing table of a collection
    fn routing_table(&self, collection: &CollectionId) -> FerryResult<RoutingTable>;

    /// Idempotent fenced commit of an ownership change
    ///
    /// Replaying a request that already succeeded returns
    /// `AlreadySatisfied`. A newer competing change of the range fails with
    /// `ConflictingOperation`. Transient failures may or may not have been
    /// applied; callers retry and the comparison on `>=` makes that safe.
    fn ensure_ownership_at_least(&self, request: &EnsureOwnership) -> FerryResult<EnsureOutcome>;
}
