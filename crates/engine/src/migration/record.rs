//! Migration coordination record
//!
//! One record per in-flight or recovering migration, owned by the donor.
//! The record is the only thing recovery looks at: `next_step` derives the
//! next action from it without consulting anything else.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use ferry_core::{
    CollectionId, FerryError, FerryResult, KeyRange, MigrationId, NodeId, PlacementVersion,
    TaskId,
};
use ferry_durability::DurableRecord;

/// Outcome of a migration; set once, never reverts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MigrationDecision {
    /// Not decided; the range is owned-but-contested
    Pending,
    /// Ownership moved to the recipient
    Committed,
    /// Ownership stays with the donor
    Aborted,
}

impl MigrationDecision {
    /// True for `Committed` and `Aborted`
    pub fn is_terminal(self) -> bool {
        !matches!(self, MigrationDecision::Pending)
    }
}

/// Persisted state of one migration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationRecord {
    /// Migration token
    pub migration_id: MigrationId,
    /// Collection
    pub collection: CollectionId,
    /// Range being moved
    pub range: KeyRange,
    /// Donor (this node)
    pub donor: NodeId,
    /// Recipient
    pub recipient: NodeId,
    /// Decision
    pub decision: MigrationDecision,
    /// Version the fenced commit asks for
    pub target_version: PlacementVersion,
    /// Donor-side range deletion task created with the record
    pub donor_task: TaskId,
    /// Donor-side follow-up done: task made ready (commit) or dropped (abort)
    pub donor_deletion_scheduled: bool,
    /// Recipient-side follow-up done: task forgotten (commit) or made ready (abort)
    pub recipient_cleanup_scheduled: bool,
    /// When the migration started
    pub created_at: DateTime<Utc>,
}

/// Next action for a record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Decision unknown: hold the critical section and ask the authority
    ReconcileDecision,
    /// Committed: tell the recipient to drop its pending deletion task
    ForgetRecipientTask,
    /// Committed: make the donor's deletion task runnable
    ScheduleSourceDeletion,
    /// Aborted: drop the donor's deletion task and pending-outgoing marker
    DropSourceTask,
    /// Aborted: tell the recipient to delete what it cloned
    ScheduleRecipientCleanup,
    /// Nothing left but deleting the record once no local task remains
    Finish,
}

/// Derive the next step purely from persisted state
pub fn next_step(record: &MigrationRecord) -> Step {
    match record.decision {
        MigrationDecision::Pending => Step::ReconcileDecision,
        MigrationDecision::Committed if !record.recipient_cleanup_scheduled => {
            Step::ForgetRecipientTask
        }
        MigrationDecision::Committed if !record.donor_deletion_scheduled => {
            Step::ScheduleSourceDeletion
        }
        // The donor's own range comes back first; the recipient may be away.
        MigrationDecision::Aborted if !record.donor_deletion_scheduled => Step::DropSourceTask,
        MigrationDecision::Aborted if !record.recipient_cleanup_scheduled => {
            Step::ScheduleRecipientCleanup
        }
        _ => Step::Finish,
    }
}

impl MigrationRecord {
    /// Fresh record with a pending decision
    pub fn new(
        migration_id: MigrationId,
        collection: CollectionId,
        range: KeyRange,
        donor: NodeId,
        recipient: NodeId,
        target_version: PlacementVersion,
        donor_task: TaskId,
    ) -> Self {
        Self {
            migration_id,
            collection,
            range,
            donor,
            recipient,
            decision: MigrationDecision::Pending,
            target_version,
            donor_task,
            donor_deletion_scheduled: false,
            recipient_cleanup_scheduled: false,
            created_at: Utc::now(),
        }
    }

    /// Set the decision; re-setting the same value is a no-op
    pub fn set_decision(&mut self, decision: MigrationDecision) -> FerryResult<()> {
        if self.decision == decision {
            return Ok(());
        }
        if self.decision.is_terminal() {
            return Err(FerryError::corruption(format!(
                "migration {} already decided {:?}, refusing {:?}",
                self.migration_id, self.decision, decision
            )));
        }
        self.decision = decision;
        Ok(())
    }

    /// True once both follow-ups of a terminal decision are done
    pub fn is_settled(&self) -> bool {
        self.decision.is_terminal()
            && self.donor_deletion_scheduled
            && self.recipient_cleanup_scheduled
    }
}

impl DurableRecord for MigrationRecord {
    const KIND: &'static str = "migration_coordination";

    fn record_key(&self) -> String {
        scoped_key(&self.collection, &self.migration_id)
    }
}

/// Record key carrying the collection, so an unreadable file still names it
pub(crate) fn scoped_key(collection: &CollectionId, id: &impl std::fmt::Display) -> String {
    format!("{}.{}", collection, id)
}

/// Collection encoded in a record key
pub(crate) fn collection_of_key(key: &str) -> Option<CollectionId> {
    key.split_once('.')
        .and_then(|(collection, _)| CollectionId::from_string(collection))
}
