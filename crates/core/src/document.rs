//! Documents stored in a partitioned collection

use serde::{Deserialize, Serialize};

use crate::key::ShardKey;

/// A stored document: its shard key plus an opaque JSON body
///
/// The body is never interpreted by the migration machinery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Shard key value; decides which range (and node) owns the document
    pub key: ShardKey,
    /// Document body
    pub body: serde_json::Value,
}

impl Document {
    /// Create a document
    pub fn new(key: impl Into<ShardKey>, body: serde_json::Value) -> Self {
        Self {
            key: key.into(),
            body,
        }
    }
}
