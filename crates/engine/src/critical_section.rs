//! Migration critical sections
//!
//! While a migration holds the critical section for its range, new writes
//! to that range wait (reads are never blocked). Writers re-check the
//! section under the collection's storage lock, so once `enter` returns,
//! every write that was not blocked is already in the write journal.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use ferry_core::{CollectionId, FerryError, FerryResult, KeyRange, MigrationId, ShardKey};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, info};

#[derive(Debug, Clone)]
struct Held {
    migration: MigrationId,
    range: KeyRange,
}

/// Critical sections held on one node
#[derive(Debug, Default)]
pub struct CriticalSections {
    held: Mutex<HashMap<CollectionId, Vec<Held>>>,
    released: Condvar,
}

impl CriticalSections {
    /// Create with nothing held
    pub fn new() -> Self {
        Self::default()
    }

    /// Block writes to `range` on behalf of `migration`
    ///
    /// Re-entering for the same migration is a no-op. An overlapping
    /// section of another migration is a conflict.
    pub fn enter(
        &self,
        collection: &CollectionId,
        migration: &MigrationId,
        range: &KeyRange,
    ) -> FerryResult<()> {
        let mut held = self.held.lock();
        let sections = held.entry(*collection).or_default();
        if let Some(other) = sections
            .iter()
            .find(|h| h.range.overlaps(range) && &h.migration != migration)
        {
            return Err(FerryError::conflict(format!(
                "range {} overlaps critical section of migration {}",
                range, other.migration
            )));
        }
        if sections.iter().any(|h| &h.migration == migration) {
            return Ok(());
        }
        sections.push(Held {
            migration: *migration,
            range: range.clone(),
        });
        info!(
            target: "ferry::migration",
            migration_id = %migration,
            collection = %collection,
            range = %range,
            "Entered critical section"
        );
        Ok(())
    }

    /// Unblock writes held by `migration`; no-op if not held
    pub fn release(&self, collection: &CollectionId, migration: &MigrationId) {
        let mut held = self.held.lock();
        let Some(sections) = held.get_mut(collection) else {
            return;
        };
        let before = sections.len();
        sections.retain(|h| &h.migration != migration);
        if sections.len() != before {
            info!(
                target: "ferry::migration",
                migration_id = %migration,
                collection = %collection,
                "Released critical section"
            );
            self.released.notify_all();
        }
        if sections.is_empty() {
            held.remove(collection);
        }
    }

    /// True if `migration` holds a section
    pub fn is_held(&self, collection: &CollectionId, migration: &MigrationId) -> bool {
        self.held
            .lock()
            .get(collection)
            .map(|s| s.iter().any(|h| &h.migration == migration))
            .unwrap_or(false)
    }

    /// True if a write to `key` must wait
    pub fn blocks(&self, collection: &CollectionId, key: &ShardKey) -> bool {
        self.held
            .lock()
            .get(collection)
            .map(|s| s.iter().any(|h| h.range.contains(key)))
            .unwrap_or(false)
    }

    /// Wait until no section covers `key`, or fail with `Timeout` at `deadline`
    pub fn wait_until_writable(
        &self,
        collection: &CollectionId,
        key: &ShardKey,
        deadline: Instant,
    ) -> FerryResult<()> {
        let mut held = self.held.lock();
        loop {
            let blocked = held
                .get(collection)
                .map(|s| s.iter().any(|h| h.range.contains(key)))
                .unwrap_or(false);
            if !blocked {
                return Ok(());
            }
            debug!(target: "ferry::node", collection = %collection, key = %key, "Write waiting on critical section");
            if self.released.wait_until(&mut held, deadline).timed_out() {
                return Err(FerryError::timeout(format!(
                    "critical section on key {} of collection {}",
                    key, collection
                )));
            }
        }
    }

    /// Convenience for a relative timeout
    pub fn wait_for(
        &self,
        collection: &CollectionId,
        key: &ShardKey,
        timeout: Duration,
    ) -> FerryResult<()> {
        self.wait_until_writable(collection, key, Instant::now() + timeout)
    }
}
