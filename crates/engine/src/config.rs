//! Node configuration via `ferry.toml`
//!
//! On first open a default `ferry.toml` is created in the node's data
//! directory. To change settings, edit the file and restart the node.
//!
//! The resumable range deleter toggle read from here is only the initial
//! value; the live switch is `NodeParameters` and is never written back.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use ferry_core::{FerryError, FerryResult};

use crate::retry::RetryConfig;

/// Config file name placed in the node data directory.
pub const CONFIG_FILE_NAME: &str = "ferry.toml";

/// Node configuration loaded from `ferry.toml`.
///
/// # Example
///
/// ```toml
/// orphan_cleanup_delay_ms = 900000
/// range_deleter_batch_size = 128
/// critical_section_timeout_ms = 6000
///
/// [commit_retry]
/// max_retries = 5
/// base_delay_ms = 10
/// max_delay_ms = 500
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FerryConfig {
    /// How long a donor waits after commit before deleting the moved range.
    /// Upper bound on the lifetime of a snapshot read started before commit.
    pub orphan_cleanup_delay_ms: u64,
    /// Documents deleted per range deleter batch.
    pub range_deleter_batch_size: usize,
    /// Pause between range deleter batches.
    pub range_deleter_batch_delay_ms: u64,
    /// Idle poll interval of the range deleter thread.
    pub range_deleter_poll_interval_ms: u64,
    /// How long progress of a finished range deletion task stays queryable.
    pub range_deleter_progress_retention_ms: u64,
    /// Documents per clone batch sent to the recipient.
    pub clone_batch_size: usize,
    /// Catch-up ends once at most this many journal entries are outstanding.
    pub catchup_max_lag: usize,
    /// Upper bound on catch-up rounds before entering the critical section.
    pub catchup_max_rounds: usize,
    /// Bound on the recipient acknowledgment inside the critical section,
    /// and on how long a blocked write waits for the section to end.
    pub critical_section_timeout_ms: u64,
    /// Critical section attempts before the migration is aborted.
    pub critical_section_max_attempts: usize,
    /// Bound on a recipient's wait for overlapping range deletions.
    pub drain_overlapping_deletions_timeout_ms: u64,
    /// Journal entries retained per collection.
    pub journal_retention: usize,
    /// Retry policy of the fenced commit call.
    pub commit_retry: RetryConfig,
    /// Retry policy of the recovery driver per record.
    pub recovery_retry: RetryConfig,
    /// Initial value of the node-local resumable range deleter switch.
    pub disable_resumable_range_deleter: bool,
}

impl Default for FerryConfig {
    fn default() -> Self {
        Self {
            orphan_cleanup_delay_ms: 900_000,
            range_deleter_batch_size: 128,
            range_deleter_batch_delay_ms: 20,
            range_deleter_poll_interval_ms: 100,
            range_deleter_progress_retention_ms: 600_000,
            clone_batch_size: 256,
            catchup_max_lag: 0,
            catchup_max_rounds: 50,
            critical_section_timeout_ms: 6_000,
            critical_section_max_attempts: 3,
            drain_overlapping_deletions_timeout_ms: 60_000,
            journal_retention: ferry_storage::DEFAULT_JOURNAL_RETENTION,
            commit_retry: RetryConfig::default().with_max_retries(5),
            recovery_retry: RetryConfig::default(),
            disable_resumable_range_deleter: false,
        }
    }
}

impl FerryConfig {
    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> FerryResult<()> {
        if self.range_deleter_batch_size == 0 {
            return Err(FerryError::invalid_input(
                "range_deleter_batch_size must be at least 1",
            ));
        }
        if self.clone_batch_size == 0 {
            return Err(FerryError::invalid_input("clone_batch_size must be at least 1"));
        }
        if self.critical_section_max_attempts == 0 {
            return Err(FerryError::invalid_input(
                "critical_section_max_attempts must be at least 1",
            ));
        }
        if self.journal_retention == 0 {
            return Err(FerryError::invalid_input("journal_retention must be at least 1"));
        }
        Ok(())
    }

    /// Safe-time delay before donor source deletion.
    pub fn orphan_cleanup_delay(&self) -> Duration {
        Duration::from_millis(self.orphan_cleanup_delay_ms)
    }

    /// Bound on the critical section acknowledgment.
    pub fn critical_section_timeout(&self) -> Duration {
        Duration::from_millis(self.critical_section_timeout_ms)
    }

    /// Bound on draining overlapping deletions before a clone.
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_overlapping_deletions_timeout_ms)
    }

    /// Returns the default config file content with comments.
    pub fn default_toml() -> &'static str {
        r#"# Ferry node configuration
#
# Delay between a committed migration and deletion of the moved range on
# the donor. Must exceed the longest snapshot read you expect to run.
orphan_cleanup_delay_ms = 900000

# Range deleter: documents per batch, pause between batches, idle poll.
range_deleter_batch_size = 128
range_deleter_batch_delay_ms = 20
range_deleter_poll_interval_ms = 100

# How long progress of a finished deletion task stays queryable.
range_deleter_progress_retention_ms = 600000

# Migration: clone batch size and catch-up bounds.
clone_batch_size = 256
catchup_max_lag = 0
catchup_max_rounds = 50

# Critical section: recipient ack timeout and attempts before aborting.
critical_section_timeout_ms = 6000
critical_section_max_attempts = 3

# How long a recipient waits for overlapping range deletions to finish.
drain_overlapping_deletions_timeout_ms = 60000

# Write journal entries kept per collection for catch-up.
journal_retention = 100000

# Initial value of the runtime switch. Set to true to fall back to
# best-effort, in-memory range deletion (migrations off this node fail).
disable_resumable_range_deleter = false

[commit_retry]
max_retries = 5
base_delay_ms = 10
max_delay_ms = 100

[recovery_retry]
max_retries = 3
base_delay_ms = 10
max_delay_ms = 100
"#
    }

    /// Read and parse config from a file path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: &Path) -> FerryResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| FerryError::Io {
            reason: format!("Failed to read config file '{}': {}", path.display(), e),
        })?;
        let config: FerryConfig = toml::from_str(&content).map_err(|e| {
            FerryError::invalid_input(format!(
                "Failed to parse config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Write the default config file if it does not already exist.
    pub fn write_default_if_missing(path: &Path) -> FerryResult<()> {
        if !path.exists() {
            std::fs::write(path, Self::default_toml()).map_err(|e| FerryError::Io {
                reason: format!(
                    "Failed to write default config file '{}': {}",
                    path.display(),
                    e
                ),
            })?;
        }
        Ok(())
    }

    /// Serialize this config to TOML and write it to the given path.
    pub fn write_to_file(&self, path: &Path) -> FerryResult<()> {
        let content = toml::to_string_pretty(self).map_err(|e| FerryError::Serialization {
            reason: format!("Failed to serialize config: {}", e),
        })?;
        std::fs::write(path, content).map_err(|e| FerryError::Io {
            reason: format!("Failed to write config file '{}': {}", path.display(), e),
        })
    }
}
