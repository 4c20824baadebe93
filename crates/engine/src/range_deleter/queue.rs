//! Durable range deletion queue
//!
//! Tasks live in a `RecordStore`, one file each. Every change is signalled
//! on a condvar that the processor thread and `wait_for_clean` callers
//! sleep on; the signal mutex is taken around every notify so a waiter that
//! checked the queue and is about to sleep cannot miss it.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use ferry_core::{CollectionId, FerryResult, KeyRange, MigrationId, TaskId};
use ferry_durability::{CorruptRecord, DurableRecord, RecordStore};
use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::info;

use super::task::{CleanWhen, RangeDeletionTask, TaskRole, TaskState};

/// Fields of a task to enqueue
#[derive(Debug, Clone)]
pub struct NewTask {
    /// Migration that creates the task, if any
    pub migration_id: Option<MigrationId>,
    /// Creating side
    pub role: TaskRole,
    /// Collection
    pub collection: CollectionId,
    /// Range to purge
    pub range: KeyRange,
    /// Immediate or delayed
    pub when_to_clean: CleanWhen,
    /// Created before the owning migration is decided
    pub awaiting_decision: bool,
}

/// FIFO queue of range deletion tasks
pub struct RangeDeletionQueue {
    store: RecordStore<RangeDeletionTask>,
    next_sequence: AtomicU64,
    signal: Mutex<()>,
    changed: Condvar,
}

impl RangeDeletionQueue {
    /// Open the queue under `dir`, or in memory if `dir` is `None`
    pub fn open(dir: Option<&Path>) -> FerryResult<(Self, Vec<CorruptRecord>)> {
        let (store, corrupt): (RecordStore<RangeDeletionTask>, _) = match dir {
            Some(dir) => RecordStore::open(dir)?,
            None => (RecordStore::ephemeral(), Vec::new()),
        };
        let next = store.list().iter().map(|t| t.sequence).max().unwrap_or(0) + 1;
        Ok((
            Self {
                store,
                next_sequence: AtomicU64::new(next),
                signal: Mutex::new(()),
                changed: Condvar::new(),
            },
            corrupt,
        ))
    }

    /// Persist a new task
    pub fn enqueue(&self, new: NewTask, now_ms: u64) -> FerryResult<RangeDeletionTask> {
        let task = RangeDeletionTask {
            task_id: TaskId::new(),
            migration_id: new.migration_id,
            role: new.role,
            collection: new.collection,
            range: new.range,
            when_to_clean: new.when_to_clean,
            awaiting_decision: new.awaiting_decision,
            state: TaskState::Pending,
            sequence: self.next_sequence.fetch_add(1, Ordering::SeqCst),
            ready_at_ms: if new.awaiting_decision {
                None
            } else {
                Some(now_ms)
            },
        };
        self.store.put(&task)?;
        info!(
            target: "ferry::range_deleter",
            task_id = %task.task_id,
            collection = %task.collection,
            range = %task.range,
            role = ?task.role,
            awaiting = task.awaiting_decision,
            "Enqueued range deletion task"
        );
        self.notify();
        Ok(task)
    }

    /// Task by id
    pub fn get(&self, task_id: &TaskId) -> Option<RangeDeletionTask> {
        self.store
            .filter(|t| &t.task_id == task_id)
            .into_iter()
            .next()
    }

    /// Every task, in FIFO order
    pub fn all(&self) -> Vec<RangeDeletionTask> {
        let mut tasks = self.store.list();
        tasks.sort_by_key(|t| t.sequence);
        tasks
    }

    /// Tasks of one collection, in FIFO order
    pub fn tasks(&self, collection: &CollectionId) -> Vec<RangeDeletionTask> {
        let mut tasks = self.store.filter(|t| &t.collection == collection);
        tasks.sort_by_key(|t| t.sequence);
        tasks
    }

    /// Tasks of `collection` overlapping `range`
    pub fn overlapping(&self, collection: &CollectionId, range: &KeyRange) -> Vec<RangeDeletionTask> {
        let mut tasks = self
            .store
            .filter(|t| &t.collection == collection && t.range.overlaps(range));
        tasks.sort_by_key(|t| t.sequence);
        tasks
    }

    /// Tasks created by `migration`
    pub fn for_migration(&self, migration: &MigrationId) -> Vec<RangeDeletionTask> {
        self.store.filter(|t| t.migration_id.as_ref() == Some(migration))
    }

    /// Number of queued tasks
    pub fn len(&self) -> usize {
        self.store.len()
    }

    /// True if no task is queued
    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    /// Make a task runnable; idempotent, keeps the first ready time
    ///
    /// Returns false if the task does not exist.
    pub fn mark_ready(&self, task_id: &TaskId, now_ms: u64) -> FerryResult<bool> {
        let Some(task) = self.get(task_id) else {
            return Ok(false);
        };
        if !task.awaiting_decision && task.ready_at_ms.is_some() {
            return Ok(true);
        }
        let updated = self.store.update(&task.record_key(), |t| {
            t.awaiting_decision = false;
            t.ready_at_ms.get_or_insert(now_ms);
            Ok::<(), ferry_core::FerryError>(())
        })?;
        if let Some(t) = &updated {
            info!(
                target: "ferry::range_deleter",
                task_id = %t.task_id,
                range = %t.range,
                when = ?t.when_to_clean,
                "Range deletion task ready"
            );
        }
        self.notify();
        Ok(updated.is_some())
    }

    /// Change a task's state; false if it no longer exists
    pub fn set_state(&self, task_id: &TaskId, state: TaskState) -> FerryResult<bool> {
        let Some(task) = self.get(task_id) else {
            return Ok(false);
        };
        let updated = self.store.update(&task.record_key(), |t| {
            t.state = state;
            Ok::<(), ferry_core::FerryError>(())
        })?;
        self.notify();
        Ok(updated.is_some())
    }

    /// Delete a task; false if it did not exist
    pub fn remove(&self, task_id: &TaskId) -> FerryResult<bool> {
        let Some(task) = self.get(task_id) else {
            return Ok(false);
        };
        let removed = self.store.remove(&task.record_key())?;
        self.notify();
        Ok(removed)
    }

    /// Put every `Processing` task back to `Pending`
    pub fn reset_processing(&self) -> FerryResult<usize> {
        let stuck = self.store.filter(|t| t.state == TaskState::Processing);
        for task in &stuck {
            self.set_state(&task.task_id, TaskState::Pending)?;
        }
        Ok(stuck.len())
    }

    /// Oldest pending task that may run at `now_ms`
    pub fn next_runnable(&self, now_ms: u64, delay_ms: u64) -> Option<RangeDeletionTask> {
        self.next_runnable_where(now_ms, delay_ms, |_| true)
    }

    /// Oldest pending task that may run at `now_ms` and passes `pred`
    pub fn next_runnable_where<P>(
        &self,
        now_ms: u64,
        delay_ms: u64,
        pred: P,
    ) -> Option<RangeDeletionTask>
    where
        P: Fn(&RangeDeletionTask) -> bool,
    {
        self.store
            .filter(|t| {
                t.state == TaskState::Pending
                    && t.eligible_at_ms(delay_ms).map_or(false, |at| at <= now_ms)
                    && pred(t)
            })
            .into_iter()
            .min_by_key(|t| t.sequence)
    }

    /// Earliest time any pending task becomes runnable
    pub fn next_eligible_at(&self, delay_ms: u64) -> Option<u64> {
        self.store
            .filter(|t| t.state == TaskState::Pending)
            .iter()
            .filter_map(|t| t.eligible_at_ms(delay_ms))
            .min()
    }

    /// Wake everything sleeping on the queue
    pub(crate) fn notify(&self) {
        let _guard = self.signal.lock();
        self.changed.notify_all();
    }

    /// Lock the signal mutex; check state, then `wait_until` with the guard
    pub(crate) fn lock_signal(&self) -> MutexGuard<'_, ()> {
        self.signal.lock()
    }

    /// Sleep until notified or `deadline`; true if the deadline passed
    pub(crate) fn wait_until(&self, guard: &mut MutexGuard<'_, ()>, deadline: Instant) -> bool {
        self.changed.wait_until(guard, deadline).timed_out()
    }
}
