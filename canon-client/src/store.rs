//! Durable key-value storage backing the session cache
//!
//! The cache never talks to the filesystem directly; it reads and writes
//! JSON values through a [`KvStore`], so it stays usable while the backend
//! is unreachable and tests can swap in [`MemoryStore`].

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tracing::debug;

use canon_utils::{paths, CanonError, Result};

/// Host-local durable key-value store
pub trait KvStore: Send {
    /// Read a value
    fn get(&self, key: &str) -> Result<Option<Value>>;

    /// Write a batch of values in one durable step
    fn put_all(&mut self, entries: Vec<(String, Value)>) -> Result<()>;

    /// Write a single value
    fn put(&mut self, key: &str, value: Value) -> Result<()> {
        self.put_all(vec![(key.to_string(), value)])
    }

    /// Remove a value; removing a missing key is not an error
    fn delete(&mut self, key: &str) -> Result<()>;
}

/// A store persisted as one JSON document on disk
///
/// Writes go to a temporary file that is synced and atomically renamed
/// over the previous document.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    entries: BTreeMap<String, Value>,
}

impl FileStore {
    /// Open the store at `path`, reading any existing document
    ///
    /// A missing file is an empty store. An unreadable or corrupt file is an
    /// error; callers decide whether to start fresh.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let entries = if path.exists() {
            let content = fs::read_to_string(&path).map_err(|e| CanonError::FileRead {
                path: path.clone(),
                source: e,
            })?;
            if content.trim().is_empty() {
                BTreeMap::new()
            } else {
                serde_json::from_str(&content).map_err(|e| {
                    CanonError::persistence(format!("Corrupt store {}: {}", path.display(), e))
                })?
            }
        } else {
            BTreeMap::new()
        };

        Ok(Self { path, entries })
    }

    /// Open an empty store at `path`, ignoring whatever is on disk
    pub fn fresh(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            entries: BTreeMap::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn flush(&self) -> Result<()> {
        paths::ensure_parent(&self.path).map_err(|e| CanonError::FileWrite {
            path: self.path.clone(),
            source: e,
        })?;

        let temp_path = self.path.with_extension("tmp");
        let write_err = |e| CanonError::FileWrite {
            path: temp_path.clone(),
            source: e,
        };

        let file = File::create(&temp_path).map_err(write_err)?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, &self.entries)?;
        writer.flush().map_err(write_err)?;
        writer
            .into_inner()
            .map_err(|e| write_err(e.into_error()))?
            .sync_all()
            .map_err(write_err)?;

        fs::rename(&temp_path, &self.path).map_err(|e| CanonError::FileWrite {
            path: self.path.clone(),
            source: e,
        })?;

        debug!("Wrote store to {}", self.path.display());
        Ok(())
    }
}

impl KvStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.entries.get(key).cloned())
    }

    fn put_all(&mut self, entries: Vec<(String, Value)>) -> Result<()> {
        for (key, value) in entries {
            self.entries.insert(key, value);
        }
        self.flush()
    }

    fn delete(&mut self, key: &str) -> Result<()> {
        if self.entries.remove(key).is_some() {
            self.flush()?;
        }
        Ok(())
    }
}

/// In-memory store
///
/// Clones share the same map, so a clone handed to a second cache behaves
/// like the same store reopened after a restart.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    entries: Arc<Mutex<BTreeMap<String, Value>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Value>> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        Ok(entries.get(key).cloned())
    }

    fn put_all(&mut self, batch: Vec<(String, Value)>) -> Result<()> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.extend(batch);
        Ok(())
    }

    fn delete(&mut self, key: &str) -> Result<()> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.remove(key);
        Ok(())
    }
}
