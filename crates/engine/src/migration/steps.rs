//! Decision reconciliation and post-decision steps
//!
//! Shared by the coordinator and the recovery driver. Each step reads the
//! record, does one idempotent thing and persists a flag; `next_step`
//! picks up wherever the last driver stopped.

use ferry_core::FerryResult;
use ferry_durability::DurableRecord;
use tracing::{info, warn};

use super::recipient::MigrationDescriptor;
use super::record::{next_step, MigrationDecision, MigrationRecord, Step};
use crate::context::NodeContext;
use crate::fail_points::Checkpoint;
use crate::range_deleter::task::now_ms;
use crate::range_deleter::{CleanWhen, NewTask, TaskRole};

/// Where a record ended up after driving its steps
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Settled {
    /// Record deleted
    Forgotten,
    /// All steps done; the record waits for the donor's deletion task
    AwaitingDeletion,
}

/// Ask the authority which side owns the migrated range
///
/// The recipient owning the chunk that covers the range means the fenced
/// commit landed; anything else means it did not.
pub(crate) fn reconcile_decision(
    ctx: &NodeContext,
    record: &MigrationRecord,
) -> FerryResult<MigrationDecision> {
    let table = ctx.authority.routing_table(&record.collection)?;
    let committed = table
        .chunk_covering(&record.range)
        .map_or(false, |chunk| chunk.owner == record.recipient);
    let decision = if committed {
        MigrationDecision::Committed
    } else {
        MigrationDecision::Aborted
    };
    info!(
        target: "ferry::migration",
        migration_id = %record.migration_id,
        routing_version = %table.version,
        decision = ?decision,
        "Reconciled decision with metadata authority"
    );
    Ok(decision)
}

/// Settle a record with no decision, holding the critical section meanwhile
pub(crate) fn resolve_pending(
    ctx: &NodeContext,
    record: &MigrationRecord,
) -> FerryResult<MigrationRecord> {
    let collection = &record.collection;
    let id = &record.migration_id;
    if let Err(e) = ctx
        .ownership
        .mark_pending_outgoing(collection, id, &record.range)
    {
        warn!(target: "ferry::migration", migration_id = %id, error = %e, "Could not re-mark range pending-outgoing");
    }
    ctx.critical.enter(collection, id, &record.range)?;
    let decision = reconcile_decision(ctx, record)?;
    persist_decision(ctx, record, decision)
}

/// Apply a decision locally, persist it and end the critical section
///
/// Local effects come first: once the decision is durable nothing revisits
/// them, and the critical section only ends after it is durable.
pub(crate) fn persist_decision(
    ctx: &NodeContext,
    record: &MigrationRecord,
    decision: MigrationDecision,
) -> FerryResult<MigrationRecord> {
    let id = &record.migration_id;
    if decision == MigrationDecision::Committed {
        ctx.ownership.apply_commit(&record.collection, &record.range);
    }
    if let Err(e) = ctx
        .ownership
        .refresh(ctx.authority.as_ref(), &record.collection)
    {
        warn!(target: "ferry::migration", migration_id = %id, error = %e, "Routing refresh after decision failed");
    }
    ctx.fail_points.hit(Checkpoint::AfterAuthorityRefresh, id)?;

    let updated = ctx.update_record(&record.record_key(), |r| r.set_decision(decision))?;
    info!(
        target: "ferry::migration",
        migration_id = %id,
        decision = ?decision,
        "Migration decision persisted"
    );
    ctx.fail_points.hit(Checkpoint::AfterDecisionPersist, id)?;

    ctx.critical.release(&record.collection, id);
    Ok(updated)
}

/// Run the remaining post-decision steps of `record`
pub(crate) fn drive_to_completion(
    ctx: &NodeContext,
    mut record: MigrationRecord,
) -> FerryResult<Settled> {
    let key = record.record_key();
    let id = record.migration_id;
    let desc = MigrationDescriptor::from(&record);
    loop {
        match next_step(&record) {
            Step::ReconcileDecision => {
                record = resolve_pending(ctx, &record)?;
            }
            Step::ForgetRecipientTask => {
                ctx.recipient(&record.recipient)?
                    .recv_commit_finish(&desc, MigrationDecision::Committed)?;
                ctx.fail_points
                    .hit(Checkpoint::AfterRecipientTaskRemoval, &id)?;
                record = ctx.update_record(&key, |r| {
                    r.recipient_cleanup_scheduled = true;
                    Ok(())
                })?;
            }
            Step::ScheduleSourceDeletion => {
                // A pending-outgoing key is never deleted, so the marker goes first.
                ctx.ownership
                    .clear_pending_outgoing(&record.collection, &id);
                schedule_source_deletion(ctx, &record)?;
                ctx.fail_points.hit(Checkpoint::AfterLocalTaskReady, &id)?;
                record = ctx.update_record(&key, |r| {
                    r.donor_deletion_scheduled = true;
                    Ok(())
                })?;
            }
            Step::DropSourceTask => {
                ctx.deleter.queue().remove(&record.donor_task)?;
                ctx.ownership
                    .clear_pending_outgoing(&record.collection, &id);
                record = ctx.update_record(&key, |r| {
                    r.donor_deletion_scheduled = true;
                    Ok(())
                })?;
            }
            Step::ScheduleRecipientCleanup => {
                ctx.recipient(&record.recipient)?
                    .recv_commit_finish(&desc, MigrationDecision::Aborted)?;
                record = ctx.update_record(&key, |r| {
                    r.recipient_cleanup_scheduled = true;
                    Ok(())
                })?;
            }
            Step::Finish => {
                if !ctx.deleter.queue().for_migration(&id).is_empty() {
                    return Ok(Settled::AwaitingDeletion);
                }
                ctx.records.remove(&key)?;
                info!(target: "ferry::migration", migration_id = %id, "Coordination record removed");
                return Ok(Settled::Forgotten);
            }
        }
    }
}

/// Make the donor's deletion task runnable, re-creating it if it was lost
fn schedule_source_deletion(ctx: &NodeContext, record: &MigrationRecord) -> FerryResult<()> {
    let queue = ctx.deleter.queue();
    let now = now_ms();
    if queue.mark_ready(&record.donor_task, now)? {
        return Ok(());
    }
    let already_scheduled = queue
        .for_migration(&record.migration_id)
        .iter()
        .any(|t| t.role == TaskRole::Donor && !t.awaiting_decision);
    if already_scheduled {
        return Ok(());
    }
    warn!(
        target: "ferry::migration",
        migration_id = %record.migration_id,
        task_id = %record.donor_task,
        "Donor range deletion task missing; enqueueing a replacement"
    );
    queue
        .enqueue(
            NewTask {
                migration_id: Some(record.migration_id),
                role: TaskRole::Donor,
                collection: record.collection,
                range: record.range.clone(),
                when_to_clean: CleanWhen::Delayed,
                awaiting_decision: false,
            },
            now,
        )
        .map(|_| ())
}
