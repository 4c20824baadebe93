//! Range deletion processor
//!
//! One background thread per node drains the queue:
//!
//! 1. Pick the oldest pending task whose clean time has passed
//! 2. Mark it processing and delete its documents in bounded batches,
//!    checking between batches that the task still exists
//! 3. Remove the task, and the coordination record that spawned it once
//!    nothing else depends on that record
//!
//! Deletion only ever removes documents whose key is inside the task range
//! and currently classifies as orphaned on this node; the classification is
//! re-checked per document under the storage lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use ferry_catalog::MetadataAuthority;
use ferry_core::{
    CollectionId, ErrorKind, FerryError, FerryResult, KeyRange, MigrationId, NodeId, TaskId,
};
use ferry_durability::{DurableRecord, RecordStore};
use ferry_storage::DocumentStore;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use super::queue::{NewTask, RangeDeletionQueue};
use super::task::{now_ms, CleanWhen, RangeDeletionTask, TaskRole, TaskState};
use crate::migration::record::MigrationRecord;
use crate::ownership::{Classification, OwnershipCache};
use crate::parameters::NodeParameters;

/// Snapshot of one task's progress
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletionProgress {
    /// Task
    pub task_id: TaskId,
    /// Collection
    pub collection: CollectionId,
    /// Range
    pub range: KeyRange,
    /// Documents deleted so far
    pub docs_deleted: u64,
    /// Last observed state
    pub state: TaskState,
    /// True if the task disappeared while being processed
    pub canceled: bool,
}

/// Tuning of the processor
#[derive(Debug, Clone)]
pub struct DeleterSettings {
    /// Documents per batch
    pub batch_size: usize,
    /// Pause between batches
    pub batch_delay: Duration,
    /// Idle poll interval
    pub poll_interval: Duration,
    /// Safe-time delay applied to `CleanWhen::Delayed` tasks
    pub delay_ms: u64,
    /// How long progress of a finished task is kept
    pub progress_retention: Duration,
}

/// Latest progress per task; finished entries expire after the retention
struct ProgressLog {
    entries: HashMap<TaskId, (DeletionProgress, Instant)>,
    retention: Duration,
}

impl ProgressLog {
    fn new(retention: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            retention,
        }
    }

    fn record(&mut self, progress: DeletionProgress, now: Instant) {
        let retention = self.retention;
        self.entries.retain(|_, (p, at)| {
            p.state != TaskState::Done || now.saturating_duration_since(*at) < retention
        });
        self.entries.insert(progress.task_id, (progress, now));
    }

    fn get(&self, task_id: &TaskId) -> Option<DeletionProgress> {
        self.entries.get(task_id).map(|(p, _)| p.clone())
    }

    fn all(&self) -> Vec<DeletionProgress> {
        self.entries.values().map(|(p, _)| p.clone()).collect()
    }
}

struct DeleterShared {
    node: NodeId,
    queue: RangeDeletionQueue,
    store: Arc<DocumentStore>,
    ownership: Arc<OwnershipCache>,
    authority: Arc<dyn MetadataAuthority>,
    params: Arc<NodeParameters>,
    records: Arc<RecordStore<MigrationRecord>>,
    settings: DeleterSettings,
    progress: Mutex<ProgressLog>,
    shutdown: AtomicBool,
}

/// Node-local range deleter: the durable queue plus its processor thread
pub struct RangeDeleter {
    shared: Arc<DeleterShared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

/// Everything a `RangeDeleter` works against
pub struct DeleterParts {
    /// Node name, for errors and logs
    pub node: NodeId,
    /// Opened queue
    pub queue: RangeDeletionQueue,
    /// Documents
    pub store: Arc<DocumentStore>,
    /// Ownership used for the per-document orphan check
    pub ownership: Arc<OwnershipCache>,
    /// Source of routing refreshes
    pub authority: Arc<dyn MetadataAuthority>,
    /// Live switches
    pub params: Arc<NodeParameters>,
    /// Coordination records, deleted once their last task is done
    pub records: Arc<RecordStore<MigrationRecord>>,
    /// Tuning
    pub settings: DeleterSettings,
}

impl RangeDeleter {
    /// Create a deleter; the processor thread is not started
    pub fn new(parts: DeleterParts) -> Self {
        Self {
            shared: Arc::new(DeleterShared {
                node: parts.node,
                queue: parts.queue,
                store: parts.store,
                ownership: parts.ownership,
                authority: parts.authority,
                params: parts.params,
                records: parts.records,
                progress: Mutex::new(ProgressLog::new(parts.settings.progress_retention)),
                settings: parts.settings,
                shutdown: AtomicBool::new(false),
            }),
            handle: Mutex::new(None),
        }
    }

    /// Start the processor thread `ferry-range-deleter`
    ///
    /// Tasks left `Processing` by a previous process are reset first.
    pub fn start(&self) -> FerryResult<()> {
        let mut handle = self.handle.lock();
        if handle.is_some() {
            return Ok(());
        }
        let reset = self.shared.queue.reset_processing()?;
        if reset > 0 {
            info!(target: "ferry::range_deleter", node = %self.shared.node, reset, "Reset interrupted range deletion tasks");
        }
        let shared = Arc::clone(&self.shared);
        let spawned = std::thread::Builder::new()
            .name("ferry-range-deleter".to_string())
            .spawn(move || processor_loop(&shared))
            .map_err(|e| FerryError::Io {
                reason: format!("failed to spawn range deleter thread: {}", e),
            })?;
        *handle = Some(spawned);
        Ok(())
    }

    /// Stop the processor thread and wait for it
    ///
    /// A task interrupted mid-way stays `Processing` on disk and is reset on
    /// the next start.
    pub fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        self.shared.queue.notify();
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }

    /// The durable queue
    pub fn queue(&self) -> &RangeDeletionQueue {
        &self.shared.queue
    }

    /// Enqueue a standalone deletion of `range`
    pub fn schedule_range(
        &self,
        collection: CollectionId,
        range: KeyRange,
        when_to_clean: CleanWhen,
    ) -> FerryResult<TaskId> {
        let task = self.shared.queue.enqueue(
            NewTask {
                migration_id: None,
                role: TaskRole::Manual,
                collection,
                range,
                when_to_clean,
                awaiting_decision: false,
            },
            now_ms(),
        )?;
        Ok(task.task_id)
    }

    /// Block until no queued task overlaps `range`
    pub fn wait_for_clean(
        &self,
        collection: &CollectionId,
        range: &KeyRange,
        timeout: Duration,
    ) -> FerryResult<()> {
        let deadline = Instant::now() + timeout;
        let queue = &self.shared.queue;
        let mut guard = queue.lock_signal();
        loop {
            if queue.overlapping(collection, range).is_empty() {
                return Ok(());
            }
            if queue.wait_until(&mut guard, deadline)
                && !queue.overlapping(collection, range).is_empty()
            {
                return Err(FerryError::timeout(format!(
                    "range deletions overlapping {} in collection {}",
                    range, collection
                )));
            }
        }
    }

    /// Latest progress of a task
    pub fn progress(&self, task_id: &TaskId) -> Option<DeletionProgress> {
        self.shared.progress.lock().get(task_id)
    }

    /// Latest progress of every task seen by this processor
    ///
    /// Finished tasks drop out once `progress_retention` has passed.
    pub fn all_progress(&self) -> Vec<DeletionProgress> {
        self.shared.progress.lock().all()
    }

    /// Delete orphaned documents in `range` right now, in batches
    ///
    /// Best-effort path used when durable deletion is switched off.
    pub fn delete_now(&self, collection: &CollectionId, range: &KeyRange) -> u64 {
        let shared = &self.shared;
        let mut deleted = 0u64;
        loop {
            let n = delete_batch(shared, collection, range);
            deleted += n as u64;
            if n < shared.settings.batch_size {
                return deleted;
            }
        }
    }
}

impl Drop for RangeDeleter {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn delete_batch(shared: &DeleterShared, collection: &CollectionId, range: &KeyRange) -> usize {
    let ownership = &shared.ownership;
    shared
        .store
        .delete_range_batch(collection, range, shared.settings.batch_size, |key| {
            ownership.classify(collection, key) != Classification::Orphaned
        })
}

fn processor_loop(shared: &DeleterShared) {
    let poll = shared.settings.poll_interval;
    while !shared.shutdown.load(Ordering::SeqCst) {
        let next = if shared.params.disable_resumable_range_deleter() {
            None
        } else {
            shared
                .queue
                .next_runnable_where(now_ms(), shared.settings.delay_ms, |t| {
                    !shared.ownership.is_quarantined(&t.collection)
                })
        };

        match next {
            Some(task) => {
                if let Err(e) = process(shared, &task) {
                    if e.kind() == ErrorKind::Fatal {
                        error!(
                            target: "ferry::range_deleter",
                            task_id = %task.task_id,
                            error = %e,
                            "Range deletion hit unreadable state; will retry"
                        );
                    } else {
                        warn!(
                            target: "ferry::range_deleter",
                            task_id = %task.task_id,
                            error = %e,
                            "Range deletion failed; will retry"
                        );
                    }
                    if let Err(e) = shared.queue.set_state(&task.task_id, TaskState::Pending) {
                        warn!(
                            target: "ferry::range_deleter",
                            task_id = %task.task_id,
                            error = %e,
                            "Could not reset failed range deletion task"
                        );
                    }
                    sleep_on_queue(shared, poll);
                }
            }
            None => {
                let wait = shared
                    .queue
                    .next_eligible_at(shared.settings.delay_ms)
                    .map(|at| Duration::from_millis(at.saturating_sub(now_ms())))
                    .filter(|until| !until.is_zero())
                    .map_or(poll, |until| until.min(poll));
                sleep_on_queue(shared, wait);
            }
        }
    }
    debug!(target: "ferry::range_deleter", node = %shared.node, "Range deleter stopped");
}

fn sleep_on_queue(shared: &DeleterShared, wait: Duration) {
    let deadline = Instant::now() + wait;
    let mut guard = shared.queue.lock_signal();
    if shared.shutdown.load(Ordering::SeqCst) {
        return;
    }
    shared.queue.wait_until(&mut guard, deadline);
}

fn publish(shared: &DeleterShared, task: &RangeDeletionTask, docs: u64, state: TaskState, canceled: bool) {
    shared.progress.lock().record(
        DeletionProgress {
            task_id: task.task_id,
            collection: task.collection,
            range: task.range.clone(),
            docs_deleted: docs,
            state,
            canceled,
        },
        Instant::now(),
    );
    shared.queue.notify();
}

fn process(shared: &DeleterShared, task: &RangeDeletionTask) -> FerryResult<()> {
    // Fresh routing, so a range that came back to this node is not purged.
    shared
        .ownership
        .refresh(shared.authority.as_ref(), &task.collection)?;

    if !shared.queue.set_state(&task.task_id, TaskState::Processing)? {
        return Ok(());
    }
    info!(
        target: "ferry::range_deleter",
        task_id = %task.task_id,
        collection = %task.collection,
        range = %task.range,
        "Processing range deletion task"
    );

    let mut deleted = 0u64;
    loop {
        publish(shared, task, deleted, TaskState::Processing, false);

        let current = shared.queue.get(&task.task_id);
        if current.map_or(true, |t| t.awaiting_decision) {
            info!(target: "ferry::range_deleter", task_id = %task.task_id, deleted, "Range deletion task canceled");
            publish(shared, task, deleted, TaskState::Done, true);
            return Ok(());
        }
        if shared.shutdown.load(Ordering::SeqCst) {
            return Ok(());
        }
        if shared.params.disable_resumable_range_deleter() {
            shared.queue.set_state(&task.task_id, TaskState::Pending)?;
            publish(shared, task, deleted, TaskState::Pending, false);
            return Ok(());
        }

        let n = delete_batch(shared, &task.collection, &task.range);
        deleted += n as u64;
        if n < shared.settings.batch_size {
            break;
        }
        debug!(target: "ferry::range_deleter", task_id = %task.task_id, deleted, "Deleted batch");
        sleep_on_queue(shared, shared.settings.batch_delay);
    }

    publish(shared, task, deleted, TaskState::Done, false);
    shared.queue.remove(&task.task_id)?;
    info!(
        target: "ferry::range_deleter",
        task_id = %task.task_id,
        collection = %task.collection,
        range = %task.range,
        deleted,
        "Range deletion task done"
    );

    if let Some(migration) = task.migration_id {
        release_record(shared, &migration)?;
    }
    Ok(())
}

/// Delete a settled coordination record once no local task refers to it
fn release_record(shared: &DeleterShared, migration: &MigrationId) -> FerryResult<()> {
    if !shared.queue.for_migration(migration).is_empty() {
        return Ok(());
    }
    for record in shared
        .records
        .filter(|r| &r.migration_id == migration && r.is_settled())
    {
        if shared.records.remove(&record.record_key())? {
            info!(
                target: "ferry::range_deleter",
                migration_id = %migration,
                "Coordination record removed after last range deletion"
            );
        }
    }
    Ok(())
}

impl std::fmt::Debug for RangeDeleter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RangeDeleter")
            .field("node", &self.shared.node)
            .field("queued", &self.shared.queue.len())
            .finish()
    }
}
