//! Migration recovery
//!
//! Runs on node startup, on step-up and on demand. Recovery only reads
//! persisted state: coordination records and range deletion tasks. It
//! never depends on a coordinator thread having been alive.
//!
//! Per pass:
//!
//! 1. Re-mark pending-incoming ranges of recipient tasks still awaiting a
//!    decision (the markers are in memory only)
//! 2. Drop donor tasks whose record was never written
//! 3. For every record not claimed by a live coordinator: reconcile a
//!    missing decision, then drive the remaining follow-up steps

use std::sync::Arc;

use ferry_core::{CollectionId, FerryError, MigrationId};
use ferry_durability::DurableRecord;
use tracing::{error, info, warn};

use crate::context::NodeContext;
use crate::migration::steps::{drive_to_completion, resolve_pending, Settled};
use crate::migration::{MigrationDecision, MigrationRecord};
use crate::range_deleter::TaskRole;

/// Outcome of one recovery pass
#[derive(Debug, Default)]
pub struct RecoveryReport {
    /// Records picked up
    pub resumed: usize,
    /// Records that ended committed
    pub committed: usize,
    /// Records that ended aborted
    pub aborted: usize,
    /// Records deleted during the pass
    pub forgotten: usize,
    /// Records skipped because a live coordinator owns them
    pub busy: usize,
    /// Pending-incoming markers rebuilt from recipient tasks
    pub incoming_restored: usize,
    /// Donor tasks dropped because their record never made it to disk
    pub stray_tasks_removed: usize,
    /// Collections refused service because of unreadable records
    pub quarantined: Vec<CollectionId>,
    /// Records whose steps failed; retried on the next pass
    pub failed: Vec<(MigrationId, FerryError)>,
}

impl RecoveryReport {
    /// True if nothing failed and nothing was skipped
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.busy == 0 && self.quarantined.is_empty()
    }
}

/// Drives persisted migrations of one node to completion
pub(crate) struct RecoveryDriver<'a> {
    ctx: &'a Arc<NodeContext>,
}

impl<'a> RecoveryDriver<'a> {
    pub(crate) fn new(ctx: &'a Arc<NodeContext>) -> Self {
        Self { ctx }
    }

    /// Run one pass; `quarantined` lists collections with unreadable records
    pub(crate) fn run(&self, quarantined: &[CollectionId]) -> RecoveryReport {
        let ctx = self.ctx;
        let mut report = RecoveryReport {
            quarantined: quarantined.to_vec(),
            ..RecoveryReport::default()
        };
        for collection in quarantined {
            ctx.ownership.quarantine(collection);
        }

        self.restore_incoming(&mut report);
        self.remove_stray_tasks(&mut report);

        for record in ctx.records.list() {
            if ctx.ownership.is_quarantined(&record.collection) {
                continue;
            }
            let Some(_guard) = ctx.migrations.locks.try_claim(&record.migration_id) else {
                report.busy += 1;
                continue;
            };
            report.resumed += 1;
            let id = record.migration_id;
            match self.recover_record(record) {
                Ok((decision, settled)) => {
                    match decision {
                        MigrationDecision::Committed => report.committed += 1,
                        MigrationDecision::Aborted => report.aborted += 1,
                        MigrationDecision::Pending => {}
                    }
                    if settled == Settled::Forgotten {
                        report.forgotten += 1;
                    }
                }
                Err(e) => {
                    warn!(target: "ferry::recovery", migration_id = %id, error = %e, "Recovery of migration failed");
                    report.failed.push((id, e));
                }
            }
        }

        info!(
            target: "ferry::recovery",
            node = %ctx.id,
            resumed = report.resumed,
            committed = report.committed,
            aborted = report.aborted,
            forgotten = report.forgotten,
            busy = report.busy,
            failed = report.failed.len(),
            quarantined = report.quarantined.len(),
            "Recovery pass complete"
        );
        report
    }

    fn restore_incoming(&self, report: &mut RecoveryReport) {
        let ctx = self.ctx;
        for task in ctx.deleter.queue().all() {
            if task.role != TaskRole::Recipient || !task.awaiting_decision {
                continue;
            }
            let Some(migration) = task.migration_id else {
                continue;
            };
            match ctx
                .ownership
                .mark_pending_incoming(&task.collection, &migration, &task.range)
            {
                Ok(()) => report.incoming_restored += 1,
                Err(e) => {
                    error!(target: "ferry::recovery", migration_id = %migration, error = %e, "Could not restore pending-incoming range")
                }
            }
        }
    }

    fn remove_stray_tasks(&self, report: &mut RecoveryReport) {
        let ctx = self.ctx;
        let queue = ctx.deleter.queue();
        for task in queue.all() {
            if task.role != TaskRole::Donor || !task.awaiting_decision {
                continue;
            }
            let Some(migration) = task.migration_id else {
                continue;
            };
            if ctx.ownership.is_quarantined(&task.collection) {
                continue;
            }
            // A live start holds the claim until its record is written.
            let Some(_guard) = ctx.migrations.locks.try_claim(&migration) else {
                continue;
            };
            if !ctx.records.filter(|r| r.migration_id == migration).is_empty() {
                continue;
            }
            match queue.remove(&task.task_id) {
                Ok(_) => {
                    report.stray_tasks_removed += 1;
                    info!(target: "ferry::recovery", migration_id = %migration, task_id = %task.task_id, "Removed donor task without a coordination record");
                }
                Err(e) => {
                    warn!(target: "ferry::recovery", task_id = %task.task_id, error = %e, "Could not remove stray donor task")
                }
            }
        }
    }

    fn recover_record(
        &self,
        record: MigrationRecord,
    ) -> Result<(MigrationDecision, Settled), FerryError> {
        let ctx = self.ctx;
        let key = record.record_key();
        ctx.config.recovery_retry.run("recover migration", || {
            let Some(current) = ctx.records.get(&key) else {
                return Ok((record.decision, Settled::Forgotten));
            };
            let current = if current.decision.is_terminal() {
                // Idempotent: a critical section left held by a killed
                // coordinator ends once the decision is durable.
                ctx.critical
                    .release(&current.collection, &current.migration_id);
                if current.decision == MigrationDecision::Committed
                    && !current.donor_deletion_scheduled
                {
                    ctx.ownership
                        .apply_commit(&current.collection, &current.range);
                }
                current
            } else {
                resolve_pending(ctx, &current)?
            };
            let decision = current.decision;
            let settled = drive_to_completion(ctx, current)?;
            Ok((decision, settled))
        })
    }
}
