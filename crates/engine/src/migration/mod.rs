//! Chunk migration
//!
//! The donor coordinates; the recipient answers through
//! [`RecipientEndpoint`]. The donor's coordination record is the single
//! source of truth for a migration's decision.

pub(crate) mod coordinator;
pub mod locks;
pub mod recipient;
pub mod record;
pub mod status;
pub(crate) mod steps;

pub(crate) use coordinator::MigrationRegistry;
pub use locks::{MigrationLockGuard, MigrationLocks};
pub use recipient::{MigrationDescriptor, RecipientEndpoint};
pub use record::{next_step, MigrationDecision, MigrationRecord, Step};
pub use status::{MigrationHandle, MigrationPhase, MigrationStatus};
