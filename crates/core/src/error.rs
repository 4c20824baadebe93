//! Error types for Ferry
//!
//! This module defines the error type shared by every layer above storage.
//! We use `thiserror` for automatic `Display` and `Error` trait implementations.
//!
//! Every variant maps onto one [`ErrorKind`]:
//!
//! | Kind | Meaning | Handling |
//! |------|---------|----------|
//! | Transient | partition, unreachable authority, killed operation | retried from persisted state |
//! | Conflict | disabled deleter, newer competing migration, stale owner | fails fast, no ownership change |
//! | Fatal | unreadable coordination state | surfaced; affected range not served |
//! | InvalidInput | malformed request | surfaced to the caller |

use crate::key::ShardKey;
use crate::types::{CollectionId, NodeId};
use std::io;
use thiserror::Error;

/// Result type alias for Ferry operations
pub type FerryResult<T> = std::result::Result<T, FerryError>;

/// Error classification used for retry and propagation decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Retry from persisted state; never data loss
    Transient,
    /// Definitive failure before any ownership change
    Conflict,
    /// Unrecoverable; requires an operator
    Fatal,
    /// Caller error
    InvalidInput,
}

/// Error types for Ferry
#[derive(Debug, Clone, Error)]
pub enum FerryError {
    /// Temporary failure (network partition, authority unreachable)
    #[error("Transient failure: {reason}")]
    Transient {
        /// What failed
        reason: String,
    },

    /// Operation was killed (operator interrupt, fail point, shutdown)
    #[error("Operation interrupted: {reason}")]
    Interrupted {
        /// Interruption source
        reason: String,
    },

    /// A bounded wait expired
    #[error("Timed out waiting for {what}")]
    Timeout {
        /// What was being waited on
        what: String,
    },

    /// Peer node not reachable through the cluster directory
    #[error("Node {node} is unreachable")]
    NodeUnreachable {
        /// Unreachable node
        node: NodeId,
    },

    /// Another operation holds or has changed the range
    #[error("Conflicting operation in progress: {reason}")]
    ConflictingOperation {
        /// Conflict description
        reason: String,
    },

    /// Durable range deletion is disabled on a node that needs it
    #[error("Resumable range deleter is disabled on node {node}")]
    ResumableRangeDeleterDisabled {
        /// Node with the toggle set
        node: NodeId,
    },

    /// This node does not (or no longer) own the key
    #[error("Node does not own key {key} of collection {collection}")]
    StaleOwnership {
        /// Collection
        collection: CollectionId,
        /// Key that was addressed
        key: ShardKey,
    },

    /// A shard-key update would move the document to another node
    #[error("Updating key {from} to {to} would move the document to another node")]
    KeyChangeAcrossNodes {
        /// Current key
        from: ShardKey,
        /// Requested key
        to: ShardKey,
    },

    /// Catch-up fell behind the retained write journal
    #[error("Write journal rolled over past sequence {seq}")]
    JournalRolledOver {
        /// First sequence that was needed
        seq: u64,
    },

    /// Persisted coordination state is unreadable or inconsistent
    #[error("Data corruption: {reason}")]
    Corruption {
        /// Corruption description
        reason: String,
    },

    /// Collection is not served because its coordination state is unreadable
    #[error("Collection {collection} is quarantined after unrecoverable coordination state")]
    Quarantined {
        /// Quarantined collection
        collection: CollectionId,
    },

    /// Requested entity does not exist
    #[error("Not found: {what}")]
    NotFound {
        /// Missing entity
        what: String,
    },

    /// Malformed request
    #[error("Invalid input: {reason}")]
    InvalidInput {
        /// What was wrong
        reason: String,
    },

    /// I/O error
    #[error("I/O error: {reason}")]
    Io {
        /// Underlying error text
        reason: String,
    },

    /// Serialization/deserialization error
    #[error("Serialization error: {reason}")]
    Serialization {
        /// Underlying error text
        reason: String,
    },
}

impl FerryError {
    /// Build a `Transient` error
    pub fn transient(reason: impl Into<String>) -> Self {
        FerryError::Transient {
            reason: reason.into(),
        }
    }

    /// Build an `Interrupted` error
    pub fn interrupted(reason: impl Into<String>) -> Self {
        FerryError::Interrupted {
            reason: reason.into(),
        }
    }

    /// Build a `Timeout` error
    pub fn timeout(what: impl Into<String>) -> Self {
        FerryError::Timeout { what: what.into() }
    }

    /// Build a `ConflictingOperation` error
    pub fn conflict(reason: impl Into<String>) -> Self {
        FerryError::ConflictingOperation {
            reason: reason.into(),
        }
    }

    /// Build a `Corruption` error
    pub fn corruption(reason: impl Into<String>) -> Self {
        FerryError::Corruption {
            reason: reason.into(),
        }
    }

    /// Build a `NotFound` error
    pub fn not_found(what: impl Into<String>) -> Self {
        FerryError::NotFound { what: what.into() }
    }

    /// Build an `InvalidInput` error
    pub fn invalid_input(reason: impl Into<String>) -> Self {
        FerryError::InvalidInput {
            reason: reason.into(),
        }
    }

    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            FerryError::Transient { .. }
            | FerryError::Interrupted { .. }
            | FerryError::Timeout { .. }
            | FerryError::NodeUnreachable { .. }
            | FerryError::Io { .. } => ErrorKind::Transient,
            FerryError::ConflictingOperation { .. }
            | FerryError::ResumableRangeDeleterDisabled { .. }
            | FerryError::StaleOwnership { .. }
            | FerryError::KeyChangeAcrossNodes { .. }
            | FerryError::JournalRolledOver { .. } => ErrorKind::Conflict,
            FerryError::Corruption { .. }
            | FerryError::Quarantined { .. }
            | FerryError::Serialization { .. } => ErrorKind::Fatal,
            FerryError::NotFound { .. } | FerryError::InvalidInput { .. } => {
                ErrorKind::InvalidInput
            }
        }
    }

    /// True if retrying the same step may succeed
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    /// True for operator or fail-point interruptions
    pub fn is_interrupted(&self) -> bool {
        matches!(self, FerryError::Interrupted { .. })
    }
}

impl From<io::Error> for FerryError {
    fn from(e: io::Error) -> Self {
        FerryError::Io {
            reason: e.to_string(),
        }
    }
}

impl From<serde_json::Error> for FerryError {
    fn from(e: serde_json::Error) -> Self {
        FerryError::Serialization {
            reason: e.to_string(),
        }
    }
}
