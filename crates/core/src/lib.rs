//! Core types for Ferry
//!
//! This crate defines the foundational types used throughout the system:
//! - ShardKey / KeyRange: Ordered shard keys and half-open chunk ranges
//! - CollectionId, MigrationId, TaskId, NodeId: Identifiers
//! - PlacementVersion: Monotonic fencing token of the routing table
//! - Document: Stored document (shard key + body)
//! - FerryError / ErrorKind: Error taxonomy shared by all layers

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod document;
pub mod error;
pub mod key;
pub mod types;
pub mod version;

pub use document::Document;
pub use error::{ErrorKind, FerryError, FerryResult};
pub use key::{KeyRange, ShardKey};
pub use types::{CollectionId, MigrationId, NodeId, TaskId};
pub use version::PlacementVersion;
