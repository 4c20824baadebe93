//! Shard node
//!
//! A `ShardNode` is one member of the cluster: its document storage, its
//! ownership view, the migrations it donates, the ranges it receives and
//! its range deleter.
//!
//! # Data directory
//!
//! ```text
//! <data_dir>/
//!   ferry.toml          node configuration
//!   migrations/         coordination records, one file each
//!   range_deletions/    range deletion tasks, one file each
//! ```
//!
//! Without a data directory everything is in memory and a restart forgets
//! all coordination state.
//!
//! # Opening
//!
//! Open loads persisted records, quarantines collections whose records are
//! unreadable, registers the node in the cluster directory, runs a recovery
//! pass and then starts the range deleter.

use std::cell::Cell;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ferry_catalog::MetadataAuthority;
use ferry_core::{
    CollectionId, Document, FerryError, FerryResult, KeyRange, MigrationId, NodeId,
    PlacementVersion, ShardKey,
};
use ferry_durability::{CorruptRecord, RecordStore};
use ferry_storage::{CollectionWriteView, DocumentStore, WriteOp};
use parking_lot::Mutex;
use tracing::{debug, error, info};

use crate::config::{FerryConfig, CONFIG_FILE_NAME};
use crate::context::NodeContext;
use crate::critical_section::CriticalSections;
use crate::directory::ClusterDirectory;
use crate::fail_points::FailPoints;
use crate::migration::record::collection_of_key;
use crate::migration::{
    coordinator, MigrationDecision, MigrationHandle, MigrationRegistry, MigrationStatus,
    RecipientEndpoint,
};
use crate::orphan::{cleanup_orphaned, CleanupOrphanedResponse};
use crate::ownership::{Classification, OwnershipCache};
use crate::parameters::NodeParameters;
use crate::range_deleter::{DeleterParts, DeleterSettings, RangeDeleter, RangeDeletionQueue};
use crate::recovery::{RecoveryDriver, RecoveryReport};

/// Subdirectory holding coordination records
pub const MIGRATIONS_DIR: &str = "migrations";
/// Subdirectory holding range deletion tasks
pub const RANGE_DELETIONS_DIR: &str = "range_deletions";

/// How to open a node
#[derive(Clone)]
pub struct NodeOptions {
    /// Node id, unique in the cluster
    pub id: NodeId,
    /// Persistent state location; `None` keeps everything in memory
    pub data_dir: Option<PathBuf>,
    /// Metadata authority
    pub authority: Arc<dyn MetadataAuthority>,
    /// Cluster directory the node registers in
    pub directory: Arc<ClusterDirectory>,
    /// Explicit configuration, written to `ferry.toml`; otherwise loaded from it
    pub config: Option<FerryConfig>,
    /// Existing document storage to serve from
    pub store: Option<Arc<DocumentStore>>,
}

impl NodeOptions {
    /// In-memory node with default configuration
    pub fn new(
        id: NodeId,
        authority: Arc<dyn MetadataAuthority>,
        directory: Arc<ClusterDirectory>,
    ) -> Self {
        Self {
            id,
            data_dir: None,
            authority,
            directory,
            config: None,
            store: None,
        }
    }

    /// Persist state under `dir`
    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(dir.into());
        self
    }

    /// Use `config` instead of the one on disk
    pub fn with_config(mut self, config: FerryConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Serve documents from `store`
    pub fn with_store(mut self, store: Arc<DocumentStore>) -> Self {
        self.store = Some(store);
        self
    }
}

/// One running node
pub struct ShardNode {
    ctx: Arc<NodeContext>,
    data_dir: Option<PathBuf>,
    quarantined: Vec<CollectionId>,
    startup_report: RecoveryReport,
    shut_down: AtomicBool,
}

impl ShardNode {
    /// Open a node, recover its persisted migrations and start its deleter
    pub fn open(options: NodeOptions) -> FerryResult<Self> {
        let NodeOptions {
            id,
            data_dir,
            authority,
            directory,
            config,
            store,
        } = options;

        let config = load_config(config, data_dir.as_deref())?;
        config.validate()?;

        let (records, corrupt_records) = match &data_dir {
            Some(dir) => RecordStore::open(dir.join(MIGRATIONS_DIR))?,
            None => (RecordStore::ephemeral(), Vec::new()),
        };
        let task_dir = data_dir.as_ref().map(|d| d.join(RANGE_DELETIONS_DIR));
        let (queue, corrupt_tasks) = RangeDeletionQueue::open(task_dir.as_deref())?;
        let quarantined = quarantine_targets(corrupt_records.iter().chain(corrupt_tasks.iter()))?;

        let store = store.unwrap_or_else(|| {
            Arc::new(DocumentStore::with_journal_retention(config.journal_retention))
        });
        let ownership = Arc::new(OwnershipCache::new(id.clone()));
        let params = Arc::new(NodeParameters::new(config.disable_resumable_range_deleter));
        let records = Arc::new(records);
        let deleter = RangeDeleter::new(DeleterParts {
            node: id.clone(),
            queue,
            store: Arc::clone(&store),
            ownership: Arc::clone(&ownership),
            authority: Arc::clone(&authority),
            params: Arc::clone(&params),
            records: Arc::clone(&records),
            settings: DeleterSettings {
                batch_size: config.range_deleter_batch_size,
                batch_delay: Duration::from_millis(config.range_deleter_batch_delay_ms),
                poll_interval: Duration::from_millis(config.range_deleter_poll_interval_ms),
                progress_retention: Duration::from_millis(
                    config.range_deleter_progress_retention_ms,
                ),
                delay_ms: config.orphan_cleanup_delay_ms,
            },
        });

        let ctx = Arc::new(NodeContext {
            id: id.clone(),
            config,
            params,
            store,
            authority,
            directory: Arc::clone(&directory),
            ownership,
            critical: CriticalSections::new(),
            fail_points: FailPoints::new(),
            records,
            deleter,
            migrations: MigrationRegistry::default(),
            sessions: Mutex::new(Default::default()),
        });
        let endpoint: Arc<dyn RecipientEndpoint> = ctx.clone();
        directory.register(id.clone(), Arc::downgrade(&endpoint));

        let startup_report = RecoveryDriver::new(&ctx).run(&quarantined);
        ctx.deleter.start()?;
        let node = Self {
            ctx,
            data_dir,
            quarantined,
            startup_report,
            shut_down: AtomicBool::new(false),
        };

        info!(
            target: "ferry::node",
            node = %id,
            data_dir = ?node.data_dir,
            records = node.ctx.records.len(),
            queued_deletions = node.ctx.deleter.queue().len(),
            "Node open"
        );
        Ok(node)
    }

    /// Node id
    pub fn id(&self) -> &NodeId {
        &self.ctx.id
    }

    /// Configuration in effect
    pub fn config(&self) -> &FerryConfig {
        &self.ctx.config
    }

    /// Data directory, if persistent
    pub fn data_dir(&self) -> Option<&Path> {
        self.data_dir.as_deref()
    }

    /// Underlying storage, bypassing ownership filtering
    pub fn storage(&self) -> &Arc<DocumentStore> {
        &self.ctx.store
    }

    /// Live node parameters
    pub fn parameters(&self) -> &NodeParameters {
        &self.ctx.params
    }

    /// Fail points of this node
    pub fn fail_points(&self) -> &FailPoints {
        &self.ctx.fail_points
    }

    /// Range deleter of this node
    pub fn range_deleter(&self) -> &RangeDeleter {
        &self.ctx.deleter
    }

    /// Ownership view of this node
    pub fn ownership(&self) -> &OwnershipCache {
        &self.ctx.ownership
    }

    /// Report of the recovery pass run while opening
    pub fn startup_report(&self) -> &RecoveryReport {
        &self.startup_report
    }

    /// Classify `key` against the cached routing
    pub fn classify(&self, collection: &CollectionId, key: &ShardKey) -> Classification {
        self.ctx.ownership.classify(collection, key)
    }

    /// Reload routing from the metadata authority
    pub fn refresh_ownership(&self, collection: &CollectionId) -> FerryResult<PlacementVersion> {
        self.ctx
            .ownership
            .refresh(self.ctx.authority.as_ref(), collection)
    }

    // ========================================================================
    // Documents
    // ========================================================================

    /// Insert a new document; an existing key is rejected
    pub fn insert(&self, collection: &CollectionId, doc: Document) -> FerryResult<u64> {
        let key = doc.key.clone();
        self.guarded_write(collection, WriteOp::Insert(doc), |view| {
            if view.contains(&key) {
                return Err(FerryError::invalid_input(format!(
                    "document {} already exists in collection {}",
                    key, collection
                )));
            }
            Ok(())
        })
    }

    /// Replace the document at `key` with `doc`
    ///
    /// If `doc.key` differs from `key`, the delete of the old key and the
    /// insert of the new one are applied and journaled as one unit. The new
    /// key must be served by this node, otherwise `KeyChangeAcrossNodes`.
    pub fn update(&self, collection: &CollectionId, key: &ShardKey, doc: Document) -> FerryResult<u64> {
        if &doc.key == key {
            return self.guarded_write(collection, WriteOp::Update(doc), |view| {
                if !view.contains(key) {
                    return Err(FerryError::not_found(format!("document {}", key)));
                }
                Ok(())
            });
        }

        let new_key = doc.key.clone();
        let op = WriteOp::ApplyOps(vec![WriteOp::Delete(key.clone()), WriteOp::Insert(doc)]);
        let result = self.guarded_write(collection, op, |view| {
            if !view.contains(key) {
                return Err(FerryError::not_found(format!("document {}", key)));
            }
            if view.contains(&new_key) {
                return Err(FerryError::invalid_input(format!(
                    "document {} already exists in collection {}",
                    new_key, collection
                )));
            }
            Ok(())
        });
        match result {
            Err(FerryError::StaleOwnership { key: stale, .. }) if stale == new_key => {
                Err(FerryError::KeyChangeAcrossNodes {
                    from: key.clone(),
                    to: new_key,
                })
            }
            other => other,
        }
    }

    /// Remove the document at `key`, returning it
    pub fn remove(&self, collection: &CollectionId, key: &ShardKey) -> FerryResult<Option<Document>> {
        let existing = self.ctx.store.get(collection, key);
        let result = self.guarded_write(collection, WriteOp::Delete(key.clone()), |view| {
            if !view.contains(key) {
                return Err(FerryError::not_found(format!("document {}", key)));
            }
            Ok(())
        });
        match result {
            Ok(_) => Ok(existing),
            Err(FerryError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Read a document this node serves
    pub fn find(&self, collection: &CollectionId, key: &ShardKey) -> FerryResult<Option<Document>> {
        self.ctx.ownership.check_serving(collection)?;
        self.ctx
            .ownership
            .ensure_loaded(self.ctx.authority.as_ref(), collection)?;
        if !self.ctx.ownership.serves(collection, key) {
            return Ok(None);
        }
        Ok(self.ctx.store.get(collection, key))
    }

    /// Served documents of `range`, in key order
    ///
    /// Orphaned and pending-incoming documents are never returned.
    pub fn scan(&self, collection: &CollectionId, range: &KeyRange) -> FerryResult<Vec<Document>> {
        self.ctx.ownership.check_serving(collection)?;
        self.ctx
            .ownership
            .ensure_loaded(self.ctx.authority.as_ref(), collection)?;
        let ownership = &self.ctx.ownership;
        Ok(self
            .ctx
            .store
            .scan_range(collection, range)
            .into_iter()
            .filter(|d| ownership.serves(collection, &d.key))
            .collect())
    }

    /// Apply `op` once every key it writes is served and not in a critical
    /// section
    ///
    /// Both conditions are re-checked under the collection lock. A stale
    /// ownership answer gets one routing refresh before it is returned.
    fn guarded_write<F>(&self, collection: &CollectionId, op: WriteOp, check: F) -> FerryResult<u64>
    where
        F: Fn(&CollectionWriteView<'_>) -> FerryResult<()>,
    {
        let ctx = &self.ctx;
        ctx.ownership.check_serving(collection)?;
        ctx.ownership
            .ensure_loaded(ctx.authority.as_ref(), collection)?;

        let mut keys = Vec::new();
        collect_keys(&op, &mut keys);
        let deadline = Instant::now() + ctx.config.critical_section_timeout();
        let mut refreshed = false;
        loop {
            for key in &keys {
                ctx.critical.wait_until_writable(collection, key, deadline)?;
            }
            let blocked = Cell::new(false);
            let result = ctx.store.apply_if(collection, op.clone(), |view| {
                if keys.iter().any(|k| ctx.critical.blocks(collection, k)) {
                    blocked.set(true);
                    return Err(FerryError::conflict("critical section entered"));
                }
                if let Some(key) = keys.iter().find(|k| !ctx.ownership.serves(collection, k)) {
                    return Err(FerryError::StaleOwnership {
                        collection: *collection,
                        key: key.clone(),
                    });
                }
                check(view)
            });
            match result {
                Ok(seq) => return Ok(seq),
                Err(_) if blocked.get() => continue,
                Err(FerryError::StaleOwnership { .. }) if !refreshed => {
                    refreshed = true;
                    debug!(target: "ferry::node", collection = %collection, "Write hit stale ownership; refreshing routing");
                    ctx.ownership.refresh(ctx.authority.as_ref(), collection)?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    // ========================================================================
    // Migrations
    // ========================================================================

    /// Start moving `range` to `recipient`
    ///
    /// Validation errors (disabled deleter, foreign range, unknown
    /// recipient, another migration in the collection) are returned here;
    /// everything after is reported through the handle.
    pub fn start_migration(
        &self,
        collection: &CollectionId,
        range: KeyRange,
        recipient: &NodeId,
    ) -> FerryResult<MigrationHandle> {
        coordinator::start(&self.ctx, *collection, range, recipient.clone())
    }

    /// Move `range` to `recipient` and wait for the outcome
    pub fn move_range(
        &self,
        collection: &CollectionId,
        range: KeyRange,
        recipient: &NodeId,
        timeout: Duration,
    ) -> FerryResult<MigrationDecision> {
        self.start_migration(collection, range, recipient)?.wait(timeout)
    }

    /// Progress of a migration started on this node since it opened
    pub fn migration_status(&self, migration: &MigrationId) -> Option<MigrationStatus> {
        self.ctx.migrations.get(migration).map(|h| h.status())
    }

    /// Purge one orphaned gap of `collection`
    pub fn cleanup_orphaned(&self, collection: &CollectionId) -> FerryResult<CleanupOrphanedResponse> {
        cleanup_orphaned(&self.ctx, collection)
    }

    // ========================================================================
    // Recovery and lifecycle
    // ========================================================================

    /// Run a recovery pass over persisted migrations
    pub fn recover(&self) -> RecoveryReport {
        RecoveryDriver::new(&self.ctx).run(&self.quarantined)
    }

    /// Take over as the serving node after a failover; runs recovery
    pub fn step_up(&self) -> RecoveryReport {
        info!(target: "ferry::node", node = %self.ctx.id, "Stepping up");
        self.recover()
    }

    /// Stop background work and leave the cluster directory
    ///
    /// Running migrations are interrupted and keep their persisted state.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.ctx.directory.unregister(&self.ctx.id);
        self.ctx.migrations.shutdown();
        self.ctx.deleter.shutdown();
        info!(target: "ferry::node", node = %self.ctx.id, "Node shut down");
    }

    /// Shut down and open again over the same storage and data directory
    ///
    /// Models a process restart: in-memory markers, sessions and critical
    /// sections are gone; persisted records and tasks are recovered.
    pub fn restart(self) -> FerryResult<ShardNode> {
        let options = NodeOptions {
            id: self.ctx.id.clone(),
            data_dir: self.data_dir.clone(),
            authority: Arc::clone(&self.ctx.authority),
            directory: Arc::clone(&self.ctx.directory),
            config: match self.data_dir {
                Some(_) => None,
                None => Some(self.ctx.config.clone()),
            },
            store: Some(Arc::clone(&self.ctx.store)),
        };
        drop(self);
        ShardNode::open(options)
    }
}

impl Drop for ShardNode {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for ShardNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardNode")
            .field("id", &self.ctx.id)
            .field("data_dir", &self.data_dir)
            .field("quarantined", &self.quarantined)
            .finish()
    }
}

fn load_config(explicit: Option<FerryConfig>, data_dir: Option<&Path>) -> FerryResult<FerryConfig> {
    match (explicit, data_dir) {
        (Some(config), Some(dir)) => {
            std::fs::create_dir_all(dir)?;
            config.write_to_file(&dir.join(CONFIG_FILE_NAME))?;
            Ok(config)
        }
        (Some(config), None) => Ok(config),
        (None, Some(dir)) => {
            std::fs::create_dir_all(dir)?;
            let path = dir.join(CONFIG_FILE_NAME);
            FerryConfig::write_default_if_missing(&path)?;
            FerryConfig::from_file(&path)
        }
        (None, None) => Ok(FerryConfig::default()),
    }
}

/// Collections named by unreadable records
///
/// A record whose key does not name a collection cannot be confined to one,
/// so the node refuses to open.
fn quarantine_targets<'a>(
    corrupt: impl Iterator<Item = &'a CorruptRecord>,
) -> FerryResult<Vec<CollectionId>> {
    let mut collections = Vec::new();
    for record in corrupt {
        let Some(collection) = collection_of_key(&record.key) else {
            error!(target: "ferry::node", path = ?record.path, error = %record.error, "Unreadable record names no collection");
            return Err(FerryError::corruption(format!(
                "unreadable record {} names no collection",
                record.path.display()
            )));
        };
        error!(
            target: "ferry::node",
            collection = %collection,
            path = ?record.path,
            error = %record.error,
            "Unreadable coordination state"
        );
        if !collections.contains(&collection) {
            collections.push(collection);
        }
    }
    Ok(collections)
}

fn collect_keys(op: &WriteOp, keys: &mut Vec<ShardKey>) {
    match op {
        WriteOp::Insert(doc) | WriteOp::Update(doc) => keys.push(doc.key.clone()),
        WriteOp::Delete(key) => keys.push(key.clone()),
        WriteOp::ApplyOps(ops) => ops.iter().for_each(|op| collect_keys(op, keys)),
    }
}
