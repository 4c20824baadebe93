//! Crash-safe keyed record store
//!
//! A `RecordStore<T>` keeps one file per record under a directory and a
//! write-through in-memory copy for reads. Every mutation is persisted with
//! the write-fsync-rename pattern before the in-memory copy changes, so a
//! crash at any point leaves either the old or the new record on disk.
//!
//! Opening a store never fails because of a single bad file: records that
//! fail to decode are returned to the caller as [`CorruptRecord`]s and left
//! on disk untouched for an operator to inspect.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

use crate::format::{decode_record, encode_record, RecordFormatError};

/// File extension of persisted records
pub const RECORD_EXTENSION: &str = "rec";

/// A value that can be persisted in a [`RecordStore`]
pub trait DurableRecord: Serialize + DeserializeOwned + Clone + Send + Sync {
    /// Kind tag written into every frame
    const KIND: &'static str;

    /// Stable key; also the file stem, so it must be filesystem safe
    fn record_key(&self) -> String;
}

/// Errors from the record store
#[derive(Debug, thiserror::Error)]
pub enum DurabilityError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Record could not be encoded
    #[error("record format error: {0}")]
    Format(#[from] RecordFormatError),

    /// Key contains characters that are not filesystem safe
    #[error("invalid record key {0:?}")]
    InvalidKey(String),
}

/// Result alias for record store operations
pub type DurabilityResult<T> = Result<T, DurabilityError>;

/// A record file that could not be decoded on open
#[derive(Debug)]
pub struct CorruptRecord {
    /// File stem (the record key it was written under)
    pub key: String,
    /// Full path of the file
    pub path: PathBuf,
    /// Decode failure
    pub error: RecordFormatError,
}

/// Keyed, crash-safe store of records of one kind
pub struct RecordStore<T: DurableRecord> {
    dir: Option<PathBuf>,
    records: RwLock<BTreeMap<String, T>>,
    _kind: PhantomData<T>,
}

impl<T: DurableRecord> RecordStore<T> {
    /// Create a store that never touches disk
    pub fn ephemeral() -> Self {
        Self {
            dir: None,
            records: RwLock::new(BTreeMap::new()),
            _kind: PhantomData,
        }
    }

    /// Open (or create) a store rooted at `dir`
    ///
    /// Returns the store plus every record file that failed to decode.
    /// Leftover temp files from an interrupted write are removed.
    pub fn open(dir: impl Into<PathBuf>) -> DurabilityResult<(Self, Vec<CorruptRecord>)> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let mut records = BTreeMap::new();
        let mut corrupt = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            match path.extension().and_then(|e| e.to_str()) {
                Some(RECORD_EXTENSION) => {}
                Some("tmp") => {
                    fs::remove_file(&path)?;
                    continue;
                }
                _ => continue,
            }
            let Some(key) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string) else {
                continue;
            };
            let bytes = fs::read(&path)?;
            match decode_record::<T>(T::KIND, &bytes) {
                Ok(record) => {
                    records.insert(key, record);
                }
                Err(error) => {
                    warn!(
                        target: "ferry::durability",
                        kind = T::KIND,
                        path = %path.display(),
                        error = %error,
                        "Unreadable record left on disk"
                    );
                    corrupt.push(CorruptRecord { key, path, error });
                }
            }
        }

        Ok((
            Self {
                dir: Some(dir),
                records: RwLock::new(records),
                _kind: PhantomData,
            },
            corrupt,
        ))
    }

    /// Directory backing this store, if any
    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    /// Insert or replace a record durably
    pub fn put(&self, record: &T) -> DurabilityResult<()> {
        let key = record.record_key();
        let mut records = self.records.write();
        self.persist(&key, record)?;
        records.insert(key, record.clone());
        Ok(())
    }

    /// Read-modify-write one record under the store lock
    ///
    /// Returns the updated record, or `None` if no record has `key`.
    /// If `f` returns an error nothing is persisted.
    pub fn update<F, E>(&self, key: &str, f: F) -> Result<Option<T>, E>
    where
        F: FnOnce(&mut T) -> Result<(), E>,
        E: From<DurabilityError>,
    {
        let mut records = self.records.write();
        let Some(current) = records.get(key) else {
            return Ok(None);
        };
        let mut next = current.clone();
        f(&mut next)?;
        self.persist(key, &next)?;
        records.insert(key.to_string(), next.clone());
        Ok(Some(next))
    }

    /// Fetch a record by key
    pub fn get(&self, key: &str) -> Option<T> {
        self.records.read().get(key).cloned()
    }

    /// Remove a record durably; returns whether it existed
    pub fn remove(&self, key: &str) -> DurabilityResult<bool> {
        let mut records = self.records.write();
        if records.remove(key).is_none() {
            return Ok(false);
        }
        if let Some(dir) = &self.dir {
            let path = record_path(dir, key)?;
            match fs::remove_file(&path) {
                Ok(()) => sync_dir(dir)?,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(true)
    }

    /// All records in key order
    pub fn list(&self) -> Vec<T> {
        self.records.read().values().cloned().collect()
    }

    /// Records matching `pred`, in key order
    pub fn filter<P>(&self, pred: P) -> Vec<T>
    where
        P: Fn(&T) -> bool,
    {
        self.records
            .read()
            .values()
            .filter(|r| pred(r))
            .cloned()
            .collect()
    }

    /// Number of records
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// True if the store holds no records
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    fn persist(&self, key: &str, record: &T) -> DurabilityResult<()> {
        let Some(dir) = &self.dir else {
            return Ok(());
        };
        let path = record_path(dir, key)?;
        let temp_path = path.with_extension("tmp");
        let bytes = encode_record(T::KIND, record)?;

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&temp_path)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        drop(file);

        fs::rename(&temp_path, &path)?;
        sync_dir(dir)
    }
}

fn record_path(dir: &Path, key: &str) -> DurabilityResult<PathBuf> {
    let safe = !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
        && !key.starts_with('.');
    if !safe {
        return Err(DurabilityError::InvalidKey(key.to_string()));
    }
    Ok(dir.join(format!("{}.{}", key, RECORD_EXTENSION)))
}

fn sync_dir(dir: &Path) -> DurabilityResult<()> {
    if dir.exists() {
        File::open(dir)?.sync_all()?;
    }
    Ok(())
}
