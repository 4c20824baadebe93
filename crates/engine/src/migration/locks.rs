//! Per-migration exclusion
//!
//! Exactly one driver (a coordinator thread or a recovery pass) may work on
//! a migration at a time. The guard is owned, so a claim made on the
//! caller's thread can be handed to the coordinator thread.

use std::collections::HashSet;
use std::sync::Arc;

use ferry_core::MigrationId;
use parking_lot::Mutex;

/// Set of claimed migrations
#[derive(Debug, Default, Clone)]
pub struct MigrationLocks {
    claimed: Arc<Mutex<HashSet<MigrationId>>>,
}

/// Claim on one migration; released on drop
#[derive(Debug)]
pub struct MigrationLockGuard {
    claimed: Arc<Mutex<HashSet<MigrationId>>>,
    migration: MigrationId,
}

impl MigrationLocks {
    /// Create with nothing claimed
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `migration`, or `None` if someone else holds it
    pub fn try_claim(&self, migration: &MigrationId) -> Option<MigrationLockGuard> {
        if !self.claimed.lock().insert(*migration) {
            return None;
        }
        Some(MigrationLockGuard {
            claimed: Arc::clone(&self.claimed),
            migration: *migration,
        })
    }

    /// True if `migration` is claimed
    pub fn is_claimed(&self, migration: &MigrationId) -> bool {
        self.claimed.lock().contains(migration)
    }
}

impl Drop for MigrationLockGuard {
    fn drop(&mut self) {
        self.claimed.lock().remove(&self.migration);
    }
}
