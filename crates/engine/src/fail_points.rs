//! Deterministic interruption points
//!
//! A fail point names a step boundary of the migration protocol. Arming it
//! makes the next pass through that boundary either fail with
//! `Interrupted` (as if the operation had been killed there) or stall for a
//! while. Persisted state is never touched by a fail point, so whatever was
//! durable at the boundary is exactly what recovery sees.

use std::collections::HashMap;
use std::time::Duration;

use ferry_core::{FerryError, FerryResult, MigrationId};
use parking_lot::Mutex;
use tracing::warn;

/// Step boundaries that can be armed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Checkpoint {
    /// Clone finished, catch-up not started
    AfterClone,
    /// Catch-up finished, critical section not entered
    BeforeCriticalSection,
    /// Fenced commit call returned
    AfterFencingCommit,
    /// Donor ownership refreshed after the commit call
    AfterAuthorityRefresh,
    /// Decision persisted in the coordination record
    AfterDecisionPersist,
    /// Recipient told to drop its pending task
    AfterRecipientTaskRemoval,
    /// Donor range deletion task made ready
    AfterLocalTaskReady,
    /// Recipient received the critical section request
    RecipientCommitStart,
}

/// What an armed checkpoint does
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailAction {
    /// Fail the operation with `Interrupted`
    Interrupt,
    /// Sleep before continuing
    Pause(Duration),
}

#[derive(Debug, Clone, Copy)]
struct Armed {
    action: FailAction,
    remaining: Option<usize>,
}

/// Per-node set of armed checkpoints
#[derive(Debug, Default)]
pub struct FailPoints {
    armed: Mutex<HashMap<Checkpoint, Armed>>,
}

impl FailPoints {
    /// Create with nothing armed
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm a checkpoint
    ///
    /// `Interrupt` fires once. `Pause` fires until disabled.
    pub fn enable(&self, checkpoint: Checkpoint, action: FailAction) {
        let remaining = match action {
            FailAction::Interrupt => Some(1),
            FailAction::Pause(_) => None,
        };
        self.armed
            .lock()
            .insert(checkpoint, Armed { action, remaining });
    }

    /// Arm a checkpoint for exactly `times` passes
    pub fn enable_times(&self, checkpoint: Checkpoint, action: FailAction, times: usize) {
        self.armed.lock().insert(
            checkpoint,
            Armed {
                action,
                remaining: Some(times),
            },
        );
    }

    /// Disarm a checkpoint
    pub fn disable(&self, checkpoint: Checkpoint) {
        self.armed.lock().remove(&checkpoint);
    }

    /// True if the checkpoint is armed
    pub fn is_armed(&self, checkpoint: Checkpoint) -> bool {
        self.armed.lock().contains_key(&checkpoint)
    }

    /// Pass through a checkpoint
    pub(crate) fn hit(&self, checkpoint: Checkpoint, migration: &MigrationId) -> FerryResult<()> {
        let action = {
            let mut armed = self.armed.lock();
            let Some(entry) = armed.get_mut(&checkpoint) else {
                return Ok(());
            };
            let action = entry.action;
            if let Some(remaining) = entry.remaining.as_mut() {
                *remaining = remaining.saturating_sub(1);
                if *remaining == 0 {
                    armed.remove(&checkpoint);
                }
            }
            action
        };

        match action {
            FailAction::Interrupt => {
                warn!(
                    target: "ferry::migration",
                    migration_id = %migration,
                    checkpoint = ?checkpoint,
                    "Fail point interrupted migration"
                );
                Err(FerryError::interrupted(format!("fail point {:?}", checkpoint)))
            }
            FailAction::Pause(duration) => {
                std::thread::sleep(duration);
                Ok(())
            }
        }
    }
}
