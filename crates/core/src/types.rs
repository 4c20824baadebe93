//! Identifier types for Ferry
//!
//! This module defines the identifiers shared by every layer:
//! - CollectionId: Unique identifier for a partitioned collection
//! - MigrationId: Unique token for one ownership transfer
//! - TaskId: Unique identifier for a range deletion task
//! - NodeId: Name of a storage node (donor or recipient)

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(Uuid);

        impl $name {
            /// Create a new random identifier using UUID v4
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Create an identifier from raw bytes
            pub fn from_bytes(bytes: [u8; 16]) -> Self {
                Self(Uuid::from_bytes(bytes))
            }

            /// Parse an identifier from its string representation
            ///
            /// Returns None if the string is not a valid UUID.
            pub fn from_string(s: &str) -> Option<Self> {
                Uuid::parse_str(s).ok().map(Self)
            }

            /// Get the raw bytes of this identifier
            pub fn as_bytes(&self) -> &[u8; 16] {
                self.0.as_bytes()
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

uuid_id!(
    /// Unique identifier for a partitioned collection
    ///
    /// Stable across renames; a dropped and recreated collection gets a new id.
    CollectionId
);

uuid_id!(
    /// Unique token identifying one migration of a range between two nodes
    MigrationId
);

uuid_id!(
    /// Unique identifier for a range deletion task
    TaskId
);

/// Name of a storage node
///
/// Node names are opaque strings (e.g. `"shard0"`). They are compared
/// byte-wise and never empty.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(String);

impl NodeId {
    /// Create a node id
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Borrow the node name
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}
