//! Recipient side of a migration
//!
//! The donor drives a migration by calling a [`RecipientEndpoint`] on the
//! recipient node. Every call is idempotent for a given migration id, so a
//! donor may repeat any of them after a timeout or a restart.
//!
//! Recipient state per migration:
//!
//! - a pending-incoming marker on the range (in memory; rebuilt from the
//!   recipient's deletion task on restart)
//! - a range deletion task, awaiting the decision, that deletes everything
//!   cloned if the migration aborts

use std::time::Instant;

use ferry_core::{
    CollectionId, Document, FerryError, FerryResult, KeyRange, MigrationId, NodeId,
};
use ferry_storage::JournalEntry;
use tracing::{debug, info, warn};

use super::record::{MigrationDecision, MigrationRecord};
use crate::context::NodeContext;
use crate::fail_points::Checkpoint;
use crate::range_deleter::task::now_ms;
use crate::range_deleter::{CleanWhen, NewTask, TaskRole};

/// What a recipient needs to know about a migration
#[derive(Debug, Clone, PartialEq)]
pub struct MigrationDescriptor {
    /// Migration token
    pub migration_id: MigrationId,
    /// Collection
    pub collection: CollectionId,
    /// Range being moved
    pub range: KeyRange,
    /// Donor node
    pub donor: NodeId,
}

impl From<&MigrationRecord> for MigrationDescriptor {
    fn from(record: &MigrationRecord) -> Self {
        Self {
            migration_id: record.migration_id,
            collection: record.collection,
            range: record.range.clone(),
            donor: record.donor.clone(),
        }
    }
}

/// Calls a donor makes on a recipient
pub trait RecipientEndpoint: Send + Sync {
    /// Prepare to receive `desc.range`
    ///
    /// Waits for overlapping range deletions to drain, then marks the range
    /// pending-incoming and persists the cleanup task.
    fn recv_start(&self, desc: &MigrationDescriptor) -> FerryResult<()>;

    /// Store one batch of the clone
    fn recv_clone_batch(&self, migration: &MigrationId, docs: Vec<Document>) -> FerryResult<()>;

    /// Replay journal entries forwarded during catch-up
    fn recv_mods(&self, migration: &MigrationId, entries: Vec<JournalEntry>) -> FerryResult<()>;

    /// Apply the final entries while the donor holds its critical section
    ///
    /// Fails with `Timeout` if `deadline` passed before the entries were
    /// applied; the donor then retries or aborts.
    fn recv_commit_start(
        &self,
        migration: &MigrationId,
        final_mods: Vec<JournalEntry>,
        deadline: Instant,
    ) -> FerryResult<()>;

    /// Learn the decision and settle the recipient's deletion task
    fn recv_commit_finish(
        &self,
        desc: &MigrationDescriptor,
        decision: MigrationDecision,
    ) -> FerryResult<()>;
}

impl NodeContext {
    fn session(&self, migration: &MigrationId) -> FerryResult<MigrationDescriptor> {
        self.sessions.lock().get(migration).cloned().ok_or_else(|| {
            FerryError::conflict(format!(
                "no receiving session for migration {} on node {}",
                migration, self.id
            ))
        })
    }

    fn apply_forwarded(&self, desc: &MigrationDescriptor, entries: Vec<JournalEntry>) -> usize {
        let n = entries.len();
        for entry in entries {
            if let Some(op) = entry.op.restrict_to(&desc.range) {
                self.store.apply(&desc.collection, op);
            }
        }
        n
    }

    /// Drop the recipient task of a committed migration
    fn forget_incoming_task(&self, migration: &MigrationId) -> FerryResult<()> {
        for task in self.deleter.queue().for_migration(migration) {
            if task.role == TaskRole::Recipient {
                self.deleter.queue().remove(&task.task_id)?;
                debug!(target: "ferry::migration", migration_id = %migration, task_id = %task.task_id, "Forgot incoming range deletion task");
            }
        }
        Ok(())
    }

    /// Make the recipient task of an aborted migration runnable
    ///
    /// Without a task (durable deletion off when the migration started),
    /// the cloned documents are deleted synchronously, best effort.
    fn schedule_incoming_cleanup(&self, desc: &MigrationDescriptor) -> FerryResult<()> {
        let tasks: Vec<_> = self
            .deleter
            .queue()
            .for_migration(&desc.migration_id)
            .into_iter()
            .filter(|t| t.role == TaskRole::Recipient)
            .collect();
        if tasks.is_empty() {
            self.ownership
                .refresh(self.authority.as_ref(), &desc.collection)?;
            let deleted = self.deleter.delete_now(&desc.collection, &desc.range);
            info!(
                target: "ferry::migration",
                migration_id = %desc.migration_id,
                deleted,
                "Deleted cloned documents of aborted migration without a task"
            );
            return Ok(());
        }
        let now = now_ms();
        for task in tasks {
            self.deleter.queue().mark_ready(&task.task_id, now)?;
        }
        Ok(())
    }
}

impl RecipientEndpoint for NodeContext {
    fn recv_start(&self, desc: &MigrationDescriptor) -> FerryResult<()> {
        self.ownership.check_serving(&desc.collection)?;
        if self.sessions.lock().contains_key(&desc.migration_id) {
            return Ok(());
        }
        self.ownership
            .refresh(self.authority.as_ref(), &desc.collection)?;

        let queue = self.deleter.queue();
        let own_task = queue
            .for_migration(&desc.migration_id)
            .into_iter()
            .find(|t| t.role == TaskRole::Recipient);
        let disabled = self.params.disable_resumable_range_deleter();

        if own_task.is_none() {
            let overlapping = queue.overlapping(&desc.collection, &desc.range);
            if !overlapping.is_empty() {
                if disabled {
                    return Err(FerryError::ResumableRangeDeleterDisabled {
                        node: self.id.clone(),
                    });
                }
                info!(
                    target: "ferry::migration",
                    migration_id = %desc.migration_id,
                    overlapping = overlapping.len(),
                    "Waiting for overlapping range deletions before receiving"
                );
                self.deleter.wait_for_clean(
                    &desc.collection,
                    &desc.range,
                    self.config.drain_timeout(),
                )?;
            }

            // Leftovers of an earlier, unfinished cleanup of the same range.
            let purged = self.deleter.delete_now(&desc.collection, &desc.range);
            if purged > 0 {
                info!(target: "ferry::migration", migration_id = %desc.migration_id, purged, "Purged orphaned documents before receiving");
            }

            if disabled {
                warn!(
                    target: "ferry::migration",
                    migration_id = %desc.migration_id,
                    "Receiving without a durable cleanup task; durable range deletion is off"
                );
            } else {
                queue.enqueue(
                    NewTask {
                        migration_id: Some(desc.migration_id),
                        role: TaskRole::Recipient,
                        collection: desc.collection,
                        range: desc.range.clone(),
                        when_to_clean: CleanWhen::Now,
                        awaiting_decision: true,
                    },
                    now_ms(),
                )?;
            }
        }

        self.ownership
            .mark_pending_incoming(&desc.collection, &desc.migration_id, &desc.range)?;
        self.sessions.lock().insert(desc.migration_id, desc.clone());
        info!(
            target: "ferry::migration",
            migration_id = %desc.migration_id,
            collection = %desc.collection,
            range = %desc.range,
            donor = %desc.donor,
            "Receiving range"
        );
        Ok(())
    }

    fn recv_clone_batch(&self, migration: &MigrationId, docs: Vec<Document>) -> FerryResult<()> {
        let desc = self.session(migration)?;
        if let Some(stray) = docs.iter().find(|d| !desc.range.contains(&d.key)) {
            return Err(FerryError::invalid_input(format!(
                "cloned key {} outside range {}",
                stray.key, desc.range
            )));
        }
        for doc in docs {
            self.store.put(&desc.collection, doc);
        }
        Ok(())
    }

    fn recv_mods(&self, migration: &MigrationId, entries: Vec<JournalEntry>) -> FerryResult<()> {
        let desc = self.session(migration)?;
        let n = self.apply_forwarded(&desc, entries);
        debug!(target: "ferry::migration", migration_id = %migration, entries = n, "Applied catch-up entries");
        Ok(())
    }

    fn recv_commit_start(
        &self,
        migration: &MigrationId,
        final_mods: Vec<JournalEntry>,
        deadline: Instant,
    ) -> FerryResult<()> {
        self.fail_points.hit(Checkpoint::RecipientCommitStart, migration)?;
        let desc = self.session(migration)?;
        let n = self.apply_forwarded(&desc, final_mods);
        if Instant::now() > deadline {
            return Err(FerryError::timeout(format!(
                "recipient {} acknowledging migration {}",
                self.id, migration
            )));
        }
        debug!(target: "ferry::migration", migration_id = %migration, entries = n, "Applied final entries");
        Ok(())
    }

    fn recv_commit_finish(
        &self,
        desc: &MigrationDescriptor,
        decision: MigrationDecision,
    ) -> FerryResult<()> {
        match decision {
            MigrationDecision::Committed => {
                // Install the new routing before dropping the marker, so the
                // received range never classifies as orphaned in between.
                self.ownership
                    .refresh(self.authority.as_ref(), &desc.collection)?;
                self.ownership
                    .clear_pending_incoming(&desc.collection, &desc.migration_id);
                self.forget_incoming_task(&desc.migration_id)?;
            }
            MigrationDecision::Aborted => {
                self.ownership
                    .clear_pending_incoming(&desc.collection, &desc.migration_id);
                self.schedule_incoming_cleanup(desc)?;
            }
            MigrationDecision::Pending => {
                return Err(FerryError::invalid_input(format!(
                    "migration {} has no decision",
                    desc.migration_id
                )))
            }
        }
        self.sessions.lock().remove(&desc.migration_id);
        info!(
            target: "ferry::migration",
            migration_id = %desc.migration_id,
            decision = ?decision,
            "Recipient settled migration"
        );
        Ok(())
    }
}
