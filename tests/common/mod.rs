//! Shared test utilities for all integration test suites.
//!
//! Import via `#[path = "../common/mod.rs"] mod common;` from a suite's main.rs.

#![allow(dead_code)]
#![allow(unused_imports)]

use std::path::PathBuf;
use std::sync::{Arc, Once};
use std::time::{Duration, Instant};

pub use ferry::{
    Checkpoint, ClusterDirectory, CollectionId, Document, FailAction, FerryConfig, FerryError,
    InMemoryCatalog, KeyRange, MigrationDecision, NodeId, NodeOptions, RetryConfig, ShardKey,
    ShardNode,
};
use serde_json::json;
use tempfile::TempDir;

// ============================================================================
// Initialization
// ============================================================================

static INIT_TRACING: Once = Once::new();

/// Route engine logs to the test harness (shown for failing tests only).
pub fn init_tracing() {
    INIT_TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .try_init();
    });
}

/// Config with short timeouts and no safe-time delay.
pub fn fast_config() -> FerryConfig {
    FerryConfig {
        orphan_cleanup_delay_ms: 0,
        range_deleter_batch_size: 16,
        range_deleter_batch_delay_ms: 0,
        range_deleter_poll_interval_ms: 10,
        clone_batch_size: 16,
        catchup_max_lag: 0,
        catchup_max_rounds: 20,
        critical_section_timeout_ms: 500,
        critical_section_max_attempts: 2,
        drain_overlapping_deletions_timeout_ms: 2_000,
        commit_retry: RetryConfig::default()
            .with_max_retries(3)
            .with_base_delay_ms(1)
            .with_max_delay_ms(5),
        recovery_retry: RetryConfig::no_retry(),
        ..FerryConfig::default()
    }
}

pub const WAIT: Duration = Duration::from_secs(10);

// ============================================================================
// TestCluster - catalog, directory and per-node data directories
// ============================================================================

/// An in-process cluster with one sharded collection.
///
/// Nodes are returned to the test by value so they can be restarted with
/// `ShardNode::restart`.
pub struct TestCluster {
    pub catalog: Arc<InMemoryCatalog>,
    pub directory: Arc<ClusterDirectory>,
    pub collection: CollectionId,
    pub dir: TempDir,
}

impl TestCluster {
    /// Collection sharded with one chunk owned by `owner`.
    pub fn new(owner: &str) -> Self {
        init_tracing();
        let catalog = Arc::new(InMemoryCatalog::new());
        let collection = CollectionId::new();
        catalog
            .shard_collection(collection, NodeId::new(owner))
            .expect("shard collection");
        TestCluster {
            catalog,
            directory: Arc::new(ClusterDirectory::new()),
            collection,
            dir: tempfile::tempdir().expect("Failed to create temp dir"),
        }
    }

    pub fn node_dir(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    pub fn options(&self, name: &str) -> NodeOptions {
        NodeOptions::new(
            NodeId::new(name),
            self.catalog.clone(),
            self.directory.clone(),
        )
        .with_data_dir(self.node_dir(name))
    }

    /// Open a persistent node with `fast_config`.
    pub fn open(&self, name: &str) -> ShardNode {
        self.open_with(name, fast_config())
    }

    pub fn open_with(&self, name: &str, config: FerryConfig) -> ShardNode {
        ShardNode::open(self.options(name).with_config(config)).expect("open node")
    }

    /// Donor "a" and recipient "b" on a collection owned by "a".
    pub fn pair() -> (Self, ShardNode, ShardNode) {
        let cluster = TestCluster::new("a");
        let a = cluster.open("a");
        let b = cluster.open("b");
        (cluster, a, b)
    }

    pub fn owner_of(&self, key: i64) -> NodeId {
        use ferry::MetadataAuthority;
        let table = self
            .catalog
            .routing_table(&self.collection)
            .expect("routing table");
        table
            .chunk_for(&ShardKey::Int(key))
            .expect("chunk for key")
            .owner
            .clone()
    }
}

// ============================================================================
// Helpers
// ============================================================================

pub fn doc(k: i64) -> Document {
    Document::new(k, json!({ "k": k, "payload": format!("doc-{}", k) }))
}

pub fn range(min: i64, max: i64) -> KeyRange {
    KeyRange::ints(min, max).expect("valid range")
}

pub fn key(k: i64) -> ShardKey {
    ShardKey::Int(k)
}

/// Insert `doc(k)` for every k in `[min, max)` through the node's write path.
pub fn seed(node: &ShardNode, collection: &CollectionId, min: i64, max: i64) {
    for k in min..max {
        node.insert(collection, doc(k)).expect("seed insert");
    }
}

/// Raw document count in `[min, max)`, ignoring ownership.
pub fn raw_count(node: &ShardNode, collection: &CollectionId, min: i64, max: i64) -> usize {
    node.storage().count_in_range(collection, &range(min, max))
}

/// Poll `cond` until it holds or `timeout` expires.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    cond()
}
