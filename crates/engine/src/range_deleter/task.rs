//! Range deletion tasks

use serde::{Deserialize, Serialize};

use ferry_core::{CollectionId, KeyRange, MigrationId, TaskId};
use ferry_durability::DurableRecord;

use crate::migration::record::scoped_key;

/// When a ready task may run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CleanWhen {
    /// As soon as it is ready
    Now,
    /// After the configured safe-time delay has elapsed since it became ready
    Delayed,
}

/// Lifecycle state of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    /// Waiting to run
    Pending,
    /// Picked up by the processor
    Processing,
    /// Finished (only ever observed in progress reports; done tasks are removed)
    Done,
}

/// Which side created a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskRole {
    /// Donor deleting the range it gave away
    Donor,
    /// Recipient deleting what it cloned for an aborted migration
    Recipient,
    /// Scheduled directly, outside any migration
    Manual,
}

/// A durable request to purge one range of one collection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RangeDeletionTask {
    /// Task id
    pub task_id: TaskId,
    /// Migration that created the task, if any
    pub migration_id: Option<MigrationId>,
    /// Creating side
    pub role: TaskRole,
    /// Collection
    pub collection: CollectionId,
    /// Range to purge; documents outside it are never touched
    pub range: KeyRange,
    /// Immediate or delayed
    pub when_to_clean: CleanWhen,
    /// True while the owning migration has no decision yet; never runnable then
    pub awaiting_decision: bool,
    /// Lifecycle state
    pub state: TaskState,
    /// Enqueue order, for FIFO processing
    pub sequence: u64,
    /// Epoch millis at which the task became ready
    pub ready_at_ms: Option<u64>,
}

impl RangeDeletionTask {
    /// Epoch millis from which the task may run, or `None` if it may not yet
    pub fn eligible_at_ms(&self, delay_ms: u64) -> Option<u64> {
        if self.awaiting_decision || self.state == TaskState::Done {
            return None;
        }
        let ready = self.ready_at_ms?;
        Some(match self.when_to_clean {
            CleanWhen::Now => ready,
            CleanWhen::Delayed => ready.saturating_add(delay_ms),
        })
    }
}

impl DurableRecord for RangeDeletionTask {
    const KIND: &'static str = "range_deletion";

    fn record_key(&self) -> String {
        scoped_key(&self.collection, &self.task_id)
    }
}

/// Current wall clock in epoch millis
pub(crate) fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}
