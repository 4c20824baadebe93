//! Routing tables

use ferry_core::{CollectionId, KeyRange, NodeId, PlacementVersion, ShardKey};
use serde::{Deserialize, Serialize};

/// One contiguous range of a collection and its owner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    /// Half-open key range
    pub range: KeyRange,
    /// Owning node
    pub owner: NodeId,
    /// Version at which this chunk was last changed
    pub version: PlacementVersion,
}

/// All chunks of a collection, sorted by range, plus the collection version
///
/// The chunks tile the whole key space `[MinKey, MaxKey)` without gaps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingTable {
    /// Collection the table describes
    pub collection: CollectionId,
    /// Highest chunk version
    pub version: PlacementVersion,
    /// Chunks in key order
    pub chunks: Vec<Chunk>,
}

impl RoutingTable {
    /// Chunk holding `key`
    pub fn chunk_for(&self, key: &ShardKey) -> Option<&Chunk> {
        self.chunks.iter().find(|c| c.range.contains(key))
    }

    /// Single chunk that covers all of `range`, if there is one
    pub fn chunk_covering(&self, range: &KeyRange) -> Option<&Chunk> {
        self.chunks.iter().find(|c| c.range.covers(range))
    }

    /// Chunks owned by `node`, in key order
    pub fn owned_by<'a>(&'a self, node: &'a NodeId) -> impl Iterator<Item = &'a Chunk> + 'a {
        self.chunks.iter().filter(move |c| &c.owner == node)
    }

    /// Highest version among the chunks owned by `node`
    ///
    /// This is the "shard version" a node fences its own writes with.
    pub fn node_version(&self, node: &NodeId) -> Option<PlacementVersion> {
        self.owned_by(node).map(|c| c.version).max()
    }
}
