//! Ferry - crash-resumable range migration for a partitioned document store
//!
//! Ferry moves contiguous shard-key ranges of a collection between nodes
//! and removes the data a node no longer owns, without losing or
//! resurrecting documents when any participant crashes part-way.
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use std::time::Duration;
//! use ferry::{ClusterDirectory, CollectionId, InMemoryCatalog, KeyRange, NodeId, NodeOptions, ShardNode};
//!
//! let catalog = Arc::new(InMemoryCatalog::new());
//! let directory = Arc::new(ClusterDirectory::new());
//! let coll = CollectionId::new();
//! catalog.shard_collection(coll, NodeId::new("a"))?;
//!
//! let a = ShardNode::open(NodeOptions::new(NodeId::new("a"), catalog.clone(), directory.clone()))?;
//! let b = ShardNode::open(NodeOptions::new(NodeId::new("b"), catalog.clone(), directory.clone()))?;
//! a.move_range(&coll, KeyRange::ints(50, 100)?, b.id(), Duration::from_secs(30))?;
//! ```
//!
//! # Architecture
//!
//! - `ferry-core`: keys, ranges, ids, versions, errors
//! - `ferry-storage`: node-local documents and the write journal
//! - `ferry-durability`: crash-safe record files
//! - `ferry-catalog`: the metadata authority interface and an in-memory one
//! - `ferry-engine`: nodes, migrations, range deletion, recovery

pub use ferry_catalog::{
    Chunk, EnsureOutcome, EnsureOwnership, InMemoryCatalog, MetadataAuthority, RoutingTable,
};
pub use ferry_core::{
    CollectionId, Document, ErrorKind, FerryError, FerryResult, KeyRange, MigrationId, NodeId,
    PlacementVersion, ShardKey, TaskId,
};
pub use ferry_engine::*;
pub use ferry_storage::{DocumentStore, JournalEntry, WriteOp};
