//! Range deletion queue and processor
//!
//! - `task`: the persisted task and its eligibility rules
//! - `queue`: durable FIFO queue with change notification
//! - `processor`: background thread that drains the queue in batches

pub mod processor;
pub mod queue;
pub mod task;

pub use processor::{DeleterParts, DeleterSettings, DeletionProgress, RangeDeleter};
pub use queue::{NewTask, RangeDeletionQueue};
pub use task::{CleanWhen, RangeDeletionTask, TaskRole, TaskState};
