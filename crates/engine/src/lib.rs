//! Migration engine for Ferry
//!
//! This crate runs one shard node:
//! - ShardNode: document reads and writes filtered by ownership
//! - Chunk migration: clone, catch-up, critical section, fenced commit
//! - Range deleter: durable, resumable deletion of ranges a node gave away
//! - Recovery: drives persisted migrations to a decision after a crash
//! - Orphan cleanup: manual purge of documents in unowned ranges
//!
//! The engine is the only component that knows about:
//! - Which node may serve which key
//! - Cross-node coordination (donor, recipient, metadata authority)
//! - Ordering of durable state changes across a migration

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub(crate) mod context;
pub mod critical_section;
pub mod directory;
pub mod fail_points;
pub mod migration;
pub mod node;
pub mod orphan;
pub mod ownership;
pub mod parameters;
pub mod range_deleter;
pub mod recovery;
pub mod retry;

pub use config::{FerryConfig, CONFIG_FILE_NAME};
pub use critical_section::CriticalSections;
pub use directory::ClusterDirectory;
pub use fail_points::{Checkpoint, FailAction, FailPoints};
pub use migration::{
    MigrationDecision, MigrationDescriptor, MigrationHandle, MigrationPhase, MigrationRecord,
    MigrationStatus, RecipientEndpoint,
};
pub use node::{NodeOptions, ShardNode};
pub use orphan::CleanupOrphanedResponse;
pub use ownership::{Classification, OwnershipCache};
pub use parameters::NodeParameters;
pub use range_deleter::{
    CleanWhen, DeletionProgress, RangeDeleter, RangeDeletionQueue, RangeDeletionTask, TaskRole,
    TaskState,
};
pub use recovery::RecoveryReport;
pub use retry::RetryConfig;
