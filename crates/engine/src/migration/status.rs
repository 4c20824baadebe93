//! Observable state of a running migration

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ferry_core::{CollectionId, FerryError, FerryResult, KeyRange, MigrationId, NodeId};
use parking_lot::{Condvar, Mutex};

use super::record::MigrationDecision;

/// Coarse phase of a migration as seen by the donor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationPhase {
    /// Copying the range snapshot
    Cloning,
    /// Forwarding writes made since the snapshot
    CatchUp,
    /// Writes blocked, waiting for the recipient
    CriticalSection,
    /// Fenced commit with the metadata authority
    Committing,
    /// Committed; scheduling follow-up deletions
    DeletingSource,
    /// Abort follow-ups in progress
    Aborting,
    /// Coordinator finished
    Done,
}

/// Snapshot of a migration's progress
#[derive(Debug, Clone)]
pub struct MigrationStatus {
    /// Migration token
    pub migration_id: MigrationId,
    /// Collection
    pub collection: CollectionId,
    /// Range being moved
    pub range: KeyRange,
    /// Recipient
    pub recipient: NodeId,
    /// Current phase
    pub phase: MigrationPhase,
    /// Documents sent during the clone
    pub docs_cloned: u64,
    /// Journal entries forwarded during catch-up
    pub mods_forwarded: u64,
    /// Catch-up rounds run
    pub catchup_rounds: usize,
    /// Critical section attempts made
    pub critical_section_attempts: usize,
    /// Decision, once known
    pub decision: Option<MigrationDecision>,
    /// Error that ended the migration
    pub error: Option<FerryError>,
    /// True once the coordinator returned
    pub finished: bool,
}

pub(crate) struct MigrationShared {
    status: Mutex<MigrationStatus>,
    finished: Condvar,
    finished_at: Mutex<Option<Instant>>,
    canceled: AtomicBool,
}

impl MigrationShared {
    pub(crate) fn new(
        migration_id: MigrationId,
        collection: CollectionId,
        range: KeyRange,
        recipient: NodeId,
    ) -> Arc<Self> {
        Arc::new(Self {
            status: Mutex::new(MigrationStatus {
                migration_id,
                collection,
                range,
                recipient,
                phase: MigrationPhase::Cloning,
                docs_cloned: 0,
                mods_forwarded: 0,
                catchup_rounds: 0,
                critical_section_attempts: 0,
                decision: None,
                error: None,
                finished: false,
            }),
            finished: Condvar::new(),
            finished_at: Mutex::new(None),
            canceled: AtomicBool::new(false),
        })
    }

    pub(crate) fn update(&self, f: impl FnOnce(&mut MigrationStatus)) {
        f(&mut self.status.lock());
    }

    pub(crate) fn set_phase(&self, phase: MigrationPhase) {
        self.update(|s| s.phase = phase);
    }

    /// Fail with `Interrupted` once the operator canceled the migration
    pub(crate) fn check_cancel(&self) -> FerryResult<()> {
        if self.canceled.load(Ordering::SeqCst) {
            let id = self.status.lock().migration_id;
            return Err(FerryError::interrupted(format!("migration {} canceled", id)));
        }
        Ok(())
    }

    pub(crate) fn finish(&self, result: FerryResult<MigrationDecision>) {
        let mut status = self.status.lock();
        match result {
            Ok(decision) => status.decision = Some(decision),
            Err(e) => status.error = Some(e),
        }
        status.phase = MigrationPhase::Done;
        status.finished = true;
        *self.finished_at.lock() = Some(Instant::now());
        self.finished.notify_all();
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.status.lock().finished
    }

    /// True if the coordinator returned before `cutoff`
    pub(crate) fn finished_before(&self, cutoff: Instant) -> bool {
        self.finished_at.lock().map_or(false, |at| at < cutoff)
    }
}

/// Handle to a migration started on this node
///
/// Cloning the handle is cheap; all clones observe the same migration.
#[derive(Clone)]
pub struct MigrationHandle {
    shared: Arc<MigrationShared>,
}

impl MigrationHandle {
    pub(crate) fn new(shared: Arc<MigrationShared>) -> Self {
        Self { shared }
    }

    /// Migration token
    pub fn id(&self) -> MigrationId {
        self.shared.status.lock().migration_id
    }

    /// Current progress
    pub fn status(&self) -> MigrationStatus {
        self.shared.status.lock().clone()
    }

    /// Ask the coordinator to stop at its next step boundary
    ///
    /// A canceled migration keeps its persisted state; recovery settles it.
    pub fn cancel(&self) {
        self.shared.canceled.store(true, Ordering::SeqCst);
    }

    /// True once the coordinator returned
    pub fn is_finished(&self) -> bool {
        self.shared.is_finished()
    }

    pub(crate) fn finished_before(&self, cutoff: Instant) -> bool {
        self.shared.finished_before(cutoff)
    }

    /// Block until the coordinator returns
    ///
    /// `Ok` carries the decision of a migration that committed; an aborted
    /// or interrupted migration returns the error that stopped it.
    pub fn wait(&self, timeout: Duration) -> FerryResult<MigrationDecision> {
        let deadline = Instant::now() + timeout;
        let mut status = self.shared.status.lock();
        while !status.finished {
            if self
                .shared
                .finished
                .wait_until(&mut status, deadline)
                .timed_out()
                && !status.finished
            {
                return Err(FerryError::timeout(format!(
                    "migration {}",
                    status.migration_id
                )));
            }
        }
        match (&status.error, status.decision) {
            (Some(e), _) => Err(e.clone()),
            (None, Some(decision)) => Ok(decision),
            (None, None) => Err(FerryError::corruption(format!(
                "migration {} finished without a decision",
                status.migration_id
            ))),
        }
    }
}

impl std::fmt::Debug for MigrationHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let status = self.shared.status.lock();
        f.debug_struct("MigrationHandle")
            .field("migration_id", &status.migration_id)
            .field("phase", &status.phase)
            .finish()
    }
}
