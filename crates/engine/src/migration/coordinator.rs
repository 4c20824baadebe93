//! Donor-side migration coordinator
//!
//! A migration runs on its own thread `ferry-migration-<id>`:
//!
//! 1. Clone: snapshot the range and send it to the recipient in batches
//! 2. Catch-up: forward journal entries written since the snapshot
//! 3. Critical section: block writes to the range, send the final entries
//!    and wait (bounded) for the recipient to acknowledge
//! 4. Commit: fenced ownership change at the metadata authority, retried
//!    until the authority answers
//! 5. Decision: persist it, end the critical section, then drive the
//!    follow-up steps shared with recovery
//!
//! The coordination record and the donor's deletion task are persisted
//! before the thread starts. From then on an interruption (cancel,
//! shutdown, fail point) leaves persisted state exactly as it is, and the
//! recovery driver settles the migration. Any other failure before the
//! commit aborts the migration on the spot.
//!
//! Once a decision is durable the caller learns it right away. Follow-up
//! steps that failed on an unreachable peer keep retrying on the same
//! thread until they succeed or the node shuts down.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use ferry_catalog::EnsureOwnership;
use ferry_core::{
    CollectionId, ErrorKind, FerryError, FerryResult, KeyRange, MigrationId, NodeId,
};
use ferry_durability::DurableRecord;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use super::locks::{MigrationLockGuard, MigrationLocks};
use super::recipient::MigrationDescriptor;
use super::record::{MigrationDecision, MigrationRecord};
use super::status::{MigrationHandle, MigrationPhase, MigrationShared};
use super::steps::{drive_to_completion, persist_decision};
use crate::context::NodeContext;
use crate::fail_points::Checkpoint;
use crate::range_deleter::task::now_ms;
use crate::range_deleter::{CleanWhen, NewTask, TaskRole};

/// How long a finished migration stays visible through its handle id
const FINISHED_RETENTION: Duration = Duration::from_secs(600);

/// Migrations started on this node
#[derive(Default)]
pub(crate) struct MigrationRegistry {
    handles: Mutex<HashMap<MigrationId, MigrationHandle>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    shutting_down: AtomicBool,
    pub(crate) locks: MigrationLocks,
}

impl MigrationRegistry {
    /// Track a new migration; at most one runs per collection
    fn register(&self, collection: &CollectionId, handle: &MigrationHandle) -> FerryResult<()> {
        if let Some(cutoff) = Instant::now().checked_sub(FINISHED_RETENTION) {
            self.prune(cutoff);
        }
        let mut handles = self.handles.lock();
        if let Some(active) = handles
            .values()
            .find(|h| !h.is_finished() && &h.status().collection == collection)
        {
            return Err(FerryError::conflict(format!(
                "migration {} is already running in collection {}",
                active.id(),
                collection
            )));
        }
        handles.insert(handle.id(), handle.clone());
        Ok(())
    }

    /// Forget handles of migrations that finished before `cutoff`
    fn prune(&self, cutoff: Instant) {
        self.handles.lock().retain(|_, h| !h.finished_before(cutoff));
    }

    /// Keep `thread` for shutdown, dropping threads that already exited
    fn track(&self, thread: JoinHandle<()>) {
        let mut threads = self.threads.lock();
        threads.retain(|t| !t.is_finished());
        threads.push(thread);
    }

    pub(crate) fn get(&self, migration: &MigrationId) -> Option<MigrationHandle> {
        self.handles.lock().get(migration).cloned()
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Cancel every coordinator, including ones still retrying follow-ups,
    /// and wait for their threads
    pub(crate) fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        for handle in self.handles.lock().values() {
            handle.cancel();
        }
        let threads: Vec<_> = self.threads.lock().drain(..).collect();
        for thread in threads {
            let _ = thread.join();
        }
    }
}

/// Validate, persist and launch a migration of `range` to `recipient`
pub(crate) fn start(
    ctx: &Arc<NodeContext>,
    collection: CollectionId,
    range: KeyRange,
    recipient: NodeId,
) -> FerryResult<MigrationHandle> {
    ctx.ownership.check_serving(&collection)?;
    if recipient == ctx.id {
        return Err(FerryError::invalid_input(format!(
            "node {} cannot migrate a range to itself",
            ctx.id
        )));
    }
    if ctx.params.disable_resumable_range_deleter() {
        return Err(FerryError::ResumableRangeDeleterDisabled {
            node: ctx.id.clone(),
        });
    }

    ctx.ownership.refresh(ctx.authority.as_ref(), &collection)?;
    let table = ctx
        .ownership
        .routing_table(&collection)
        .ok_or_else(|| FerryError::not_found(format!("routing of collection {}", collection)))?;
    let chunk = table.chunk_covering(&range).ok_or_else(|| {
        FerryError::invalid_input(format!("range {} does not fit inside one chunk", range))
    })?;
    if chunk.owner != ctx.id {
        return Err(FerryError::StaleOwnership {
            collection,
            key: range.start().clone(),
        });
    }
    ctx.recipient(&recipient)?;

    let migration_id = MigrationId::new();
    let shared = MigrationShared::new(migration_id, collection, range.clone(), recipient.clone());
    let handle = MigrationHandle::new(Arc::clone(&shared));
    ctx.migrations.register(&collection, &handle)?;
    let Some(guard) = ctx.migrations.locks.try_claim(&migration_id) else {
        let err = FerryError::conflict(format!("migration {} already claimed", migration_id));
        shared.finish(Err(err.clone()));
        return Err(err);
    };

    let record = match persist_start(ctx, migration_id, collection, range, recipient, table.version.next_major()) {
        Ok(record) => record,
        Err(e) => {
            shared.finish(Err(e.clone()));
            return Err(e);
        }
    };

    let thread_ctx = Arc::clone(ctx);
    let thread_shared = Arc::clone(&shared);
    let spawned = std::thread::Builder::new()
        .name(format!("ferry-migration-{}", migration_id))
        .spawn(move || run(&thread_ctx, &thread_shared, record, guard));
    match spawned {
        Ok(thread) => ctx.migrations.track(thread),
        Err(e) => {
            // Record and task are durable; recovery settles them.
            let err = FerryError::Io {
                reason: format!("failed to spawn migration thread: {}", e),
            };
            shared.finish(Err(err.clone()));
            return Err(err);
        }
    }
    Ok(handle)
}

/// Persist the donor task, then the record pointing at it
fn persist_start(
    ctx: &NodeContext,
    migration_id: MigrationId,
    collection: CollectionId,
    range: KeyRange,
    recipient: NodeId,
    target_version: ferry_core::PlacementVersion,
) -> FerryResult<MigrationRecord> {
    let task = ctx.deleter.queue().enqueue(
        NewTask {
            migration_id: Some(migration_id),
            role: TaskRole::Donor,
            collection,
            range: range.clone(),
            when_to_clean: CleanWhen::Delayed,
            awaiting_decision: true,
        },
        now_ms(),
    )?;
    let record = MigrationRecord::new(
        migration_id,
        collection,
        range,
        ctx.id.clone(),
        recipient,
        target_version,
        task.task_id,
    );
    ctx.records.put(&record)?;
    info!(
        target: "ferry::migration",
        migration_id = %migration_id,
        collection = %collection,
        range = %record.range,
        recipient = %record.recipient,
        target_version = %target_version,
        "Migration started"
    );
    Ok(record)
}

fn run(
    ctx: &NodeContext,
    shared: &MigrationShared,
    record: MigrationRecord,
    guard: MigrationLockGuard,
) {
    let id = record.migration_id;
    let mut unsettled = None;
    let result = drive(ctx, shared, record, &mut unsettled);
    match &result {
        Ok(decision) => {
            info!(target: "ferry::migration", migration_id = %id, decision = ?decision, "Migration finished")
        }
        Err(e) if e.is_interrupted() => {
            warn!(target: "ferry::migration", migration_id = %id, error = %e, "Migration interrupted; left for recovery")
        }
        Err(e) if e.kind() == ErrorKind::Fatal => {
            error!(target: "ferry::migration", migration_id = %id, error = %e, "Migration failed")
        }
        Err(e) => {
            warn!(target: "ferry::migration", migration_id = %id, error = %e, "Migration failed")
        }
    }
    match unsettled {
        None => {
            // Released before waiters wake, so a recovery pass they start can claim it.
            drop(guard);
            shared.finish(result);
        }
        Some(record) => {
            shared.finish(result);
            retry_follow_ups(ctx, shared, record);
            drop(guard);
        }
    }
}

/// Fail with `Interrupted` once the migration is canceled or the node stops
fn check_running(ctx: &NodeContext, shared: &MigrationShared) -> FerryResult<()> {
    shared.check_cancel()?;
    if ctx.migrations.is_shutting_down() {
        return Err(FerryError::interrupted(format!("node {} shutting down", ctx.id)));
    }
    Ok(())
}

/// Run the migration; a decided record whose follow-ups failed lands in
/// `unsettled`
fn drive(
    ctx: &NodeContext,
    shared: &MigrationShared,
    record: MigrationRecord,
    unsettled: &mut Option<MigrationRecord>,
) -> FerryResult<MigrationDecision> {
    if let Err(e) =
        ctx.ownership
            .mark_pending_outgoing(&record.collection, &record.migration_id, &record.range)
    {
        return abort(ctx, shared, record, e, unsettled);
    }

    let caught_up = match clone_and_catch_up(ctx, shared, &record) {
        Ok(seq) => seq,
        Err(e) if e.is_interrupted() => return Err(e),
        Err(e) => return abort(ctx, shared, record, e, unsettled),
    };

    match critical_section(ctx, shared, &record, caught_up) {
        Ok(()) => {}
        Err(e) if e.is_interrupted() => return Err(e),
        Err(e) => return abort(ctx, shared, record, e, unsettled),
    }

    shared.set_phase(MigrationPhase::Committing);
    let (decision, commit_error) = commit(ctx, shared, &record)?;
    ctx.fail_points
        .hit(Checkpoint::AfterFencingCommit, &record.migration_id)?;
    let record = persist_decision(ctx, &record, decision)?;
    shared.update(|s| s.decision = Some(decision));

    shared.set_phase(if decision == MigrationDecision::Committed {
        MigrationPhase::DeletingSource
    } else {
        MigrationPhase::Aborting
    });
    follow_up(ctx, record, unsettled)?;

    match commit_error {
        Some(e) => Err(e),
        None => Ok(decision),
    }
}

/// Drive the follow-up steps of a decided record once
///
/// An interruption propagates and leaves the record for recovery. Any other
/// failure parks the latest persisted record in `unsettled`.
fn follow_up(
    ctx: &NodeContext,
    record: MigrationRecord,
    unsettled: &mut Option<MigrationRecord>,
) -> FerryResult<()> {
    let id = record.migration_id;
    let key = record.record_key();
    match drive_to_completion(ctx, record) {
        Ok(settled) => {
            debug!(target: "ferry::migration", migration_id = %id, settled = ?settled, "Follow-up steps done");
            Ok(())
        }
        Err(e) if e.is_interrupted() => Err(e),
        Err(e) => {
            warn!(target: "ferry::migration", migration_id = %id, error = %e, "Follow-up steps incomplete; retrying");
            *unsettled = ctx.records.get(&key);
            Ok(())
        }
    }
}

/// Keep driving a decided record until it settles
///
/// Stops on cancel, shutdown or a failure that is not transient; the
/// record then waits for the next recovery pass.
fn retry_follow_ups(ctx: &NodeContext, shared: &MigrationShared, record: MigrationRecord) {
    let id = record.migration_id;
    let key = record.record_key();
    let policy = &ctx.config.recovery_retry;
    let mut attempt = 0;
    loop {
        std::thread::sleep(policy.backoff(attempt));
        attempt += 1;
        if let Err(e) = check_running(ctx, shared) {
            info!(target: "ferry::migration", migration_id = %id, error = %e, "Follow-up retries stopped; left for recovery");
            return;
        }
        let Some(current) = ctx.records.get(&key) else {
            return;
        };
        match drive_to_completion(ctx, current) {
            Ok(settled) => {
                info!(target: "ferry::migration", migration_id = %id, attempt, settled = ?settled, "Follow-up steps done after retrying");
                return;
            }
            Err(e) if e.is_retryable() && !e.is_interrupted() => {
                debug!(target: "ferry::migration", migration_id = %id, attempt, error = %e, "Follow-up steps still failing");
            }
            Err(e) => {
                warn!(target: "ferry::migration", migration_id = %id, error = %e, "Follow-up retries stopped; left for recovery");
                return;
            }
        }
    }
}

/// Clone the range, then forward writes until the lag is small
///
/// Returns the journal sequence the recipient has caught up to.
fn clone_and_catch_up(
    ctx: &NodeContext,
    shared: &MigrationShared,
    record: &MigrationRecord,
) -> FerryResult<u64> {
    let id = &record.migration_id;
    let desc = MigrationDescriptor::from(record);
    shared.check_cancel()?;
    ctx.recipient(&record.recipient)?.recv_start(&desc)?;

    let snapshot = ctx.store.snapshot_range(&record.collection, &record.range);
    debug!(
        target: "ferry::migration",
        migration_id = %id,
        docs = snapshot.docs.len(),
        seq = snapshot.seq,
        "Cloning snapshot"
    );
    for batch in snapshot.docs.chunks(ctx.config.clone_batch_size.max(1)) {
        shared.check_cancel()?;
        ctx.recipient(&record.recipient)?
            .recv_clone_batch(id, batch.to_vec())?;
        shared.update(|s| s.docs_cloned += batch.len() as u64);
    }
    ctx.fail_points.hit(Checkpoint::AfterClone, id)?;

    shared.set_phase(MigrationPhase::CatchUp);
    let mut caught_up = snapshot.seq;
    for round in 1..=ctx.config.catchup_max_rounds {
        shared.check_cancel()?;
        let entries = ctx
            .store
            .entries_since(&record.collection, caught_up, &record.range)?;
        if entries.len() <= ctx.config.catchup_max_lag {
            break;
        }
        let Some(last) = entries.last().map(|e| e.seq) else {
            break;
        };
        let n = entries.len() as u64;
        ctx.recipient(&record.recipient)?.recv_mods(id, entries)?;
        caught_up = last;
        shared.update(|s| {
            s.mods_forwarded += n;
            s.catchup_rounds = round;
        });
    }

    if ctx.params.disable_resumable_range_deleter() {
        return Err(FerryError::ResumableRangeDeleterDisabled {
            node: ctx.id.clone(),
        });
    }
    ctx.fail_points.hit(Checkpoint::BeforeCriticalSection, id)?;
    Ok(caught_up)
}

/// Block writes and get the recipient's acknowledgment of the final entries
///
/// A late or failed acknowledgment releases the section and retries; after
/// the last attempt the error is returned and the migration aborts.
fn critical_section(
    ctx: &NodeContext,
    shared: &MigrationShared,
    record: &MigrationRecord,
    caught_up: u64,
) -> FerryResult<()> {
    shared.set_phase(MigrationPhase::CriticalSection);
    let id = &record.migration_id;
    let attempts = ctx.config.critical_section_max_attempts.max(1);
    let mut last_error = None;
    for attempt in 1..=attempts {
        shared.check_cancel()?;
        shared.update(|s| s.critical_section_attempts = attempt);
        ctx.critical.enter(&record.collection, id, &record.range)?;

        let final_mods = match ctx
            .store
            .entries_since(&record.collection, caught_up, &record.range)
        {
            Ok(entries) => entries,
            Err(e) => {
                ctx.critical.release(&record.collection, id);
                return Err(e);
            }
        };
        let n = final_mods.len() as u64;
        let deadline = Instant::now() + ctx.config.critical_section_timeout();
        let acked = ctx
            .recipient(&record.recipient)
            .and_then(|r| r.recv_commit_start(id, final_mods, deadline));
        match acked {
            Ok(()) => {
                shared.update(|s| s.mods_forwarded += n);
                return Ok(());
            }
            Err(e) if e.is_retryable() => {
                ctx.critical.release(&record.collection, id);
                warn!(
                    target: "ferry::migration",
                    migration_id = %id,
                    attempt,
                    error = %e,
                    "Recipient did not acknowledge critical section"
                );
                std::thread::sleep(ctx.config.commit_retry.backoff(attempt - 1));
                last_error = Some(e);
            }
            Err(e) => {
                ctx.critical.release(&record.collection, id);
                return Err(e);
            }
        }
    }
    Err(last_error.unwrap_or_else(|| FerryError::timeout("critical section acknowledgment")))
}

/// Fenced commit; returns the decision and, for an abort, the reason
///
/// An unanswered call may still land, so transient failures are retried in
/// rounds of `commit_retry` until the authority answers. Only a refusal
/// aborts. Cancel or shutdown leaves the record pending for recovery with
/// the critical section held.
fn commit(
    ctx: &NodeContext,
    shared: &MigrationShared,
    record: &MigrationRecord,
) -> FerryResult<(MigrationDecision, Option<FerryError>)> {
    let request = EnsureOwnership {
        collection: record.collection,
        range: record.range.clone(),
        donor: ctx.id.clone(),
        recipient: record.recipient.clone(),
        version: record.target_version,
    };
    let policy = &ctx.config.commit_retry;
    let mut round = 0u64;
    loop {
        check_running(ctx, shared)?;
        round += 1;
        let result = policy.run("ensure_ownership_at_least", || {
            ctx.authority.ensure_ownership_at_least(&request)
        });
        match result {
            Ok(outcome) => {
                info!(
                    target: "ferry::migration",
                    migration_id = %record.migration_id,
                    outcome = ?outcome,
                    round,
                    "Fenced commit accepted"
                );
                return Ok((MigrationDecision::Committed, None));
            }
            Err(e) if !e.is_retryable() => {
                warn!(
                    target: "ferry::migration",
                    migration_id = %record.migration_id,
                    error = %e,
                    "Fenced commit refused"
                );
                return Ok((MigrationDecision::Aborted, Some(e)));
            }
            Err(e) if e.is_interrupted() => return Err(e),
            Err(e) => {
                warn!(
                    target: "ferry::migration",
                    migration_id = %record.migration_id,
                    round,
                    error = %e,
                    "Fenced commit outcome unknown; retrying"
                );
                std::thread::sleep(Duration::from_millis(policy.max_delay_ms));
            }
        }
    }
}

/// Abort before any commit was attempted and return `cause`
fn abort(
    ctx: &NodeContext,
    shared: &MigrationShared,
    record: MigrationRecord,
    cause: FerryError,
    unsettled: &mut Option<MigrationRecord>,
) -> FerryResult<MigrationDecision> {
    shared.set_phase(MigrationPhase::Aborting);
    warn!(
        target: "ferry::migration",
        migration_id = %record.migration_id,
        error = %cause,
        "Aborting migration"
    );
    ctx.critical.release(&record.collection, &record.migration_id);
    let key = record.record_key();
    let aborted = match ctx.update_record(&key, |r| r.set_decision(MigrationDecision::Aborted)) {
        Ok(r) => r,
        Err(e) => {
            error!(target: "ferry::migration", migration_id = %record.migration_id, error = %e, "Could not persist abort; left for recovery");
            return Err(cause);
        }
    };
    shared.update(|s| s.decision = Some(MigrationDecision::Aborted));
    if let Err(e) = follow_up(ctx, aborted, unsettled) {
        warn!(target: "ferry::migration", migration_id = %record.migration_id, error = %e, "Abort follow-ups interrupted; left for recovery");
    }
    Err(cause)
}
