//! Durable persistence for the pending queue

use crate::queue::QueueEntry;
use crate::{Result, SyncError};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

/// Durable key-value storage contract
///
/// Models the on-device storage collaborator. A `set` must be visible to a
/// subsequent `get` once it returns.
pub trait StorageBackend: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    fn set(&self, key: &str, bytes: &[u8]) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
}

/// File-backed storage: one file per key under a base directory
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        // Keys may contain separators; flatten to a single file name
        let name: String = key
            .chars()
            .map(|c| if c.is_alphanumeric() { c } else { '_' })
            .collect();
        self.dir.join(format!("{}.json", name))
    }
}

impl StorageBackend for FileStorage {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(key);
        if !path.exists() {
            return Ok(None);
        }
        let bytes = std::fs::read(&path)
            .map_err(|e| SyncError::Storage(format!("read {}: {}", path.display(), e)))?;
        Ok(Some(bytes))
    }

    fn set(&self, key: &str, bytes: &[u8]) -> Result<()> {
        std::fs::create_dir_all(&self.dir)
            .map_err(|e| SyncError::Storage(format!("create {}: {}", self.dir.display(), e)))?;
        let path = self.path_for(key);
        // Write-then-rename so a crash never leaves a torn file behind
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, bytes)
            .map_err(|e| SyncError::Storage(format!("write {}: {}", tmp.display(), e)))?;
        std::fs::rename(&tmp, &path)
            .map_err(|e| SyncError::Storage(format!("rename {}: {}", path.display(), e)))?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let path = self.path_for(key);
        if path.exists() {
            std::fs::remove_file(&path)
                .map_err(|e| SyncError::Storage(format!("remove {}: {}", path.display(), e)))?;
        }
        Ok(())
    }
}

/// In-memory storage for tests and ephemeral runs
#[derive(Default)]
pub struct MemoryStorage {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StorageBackend for MemoryStorage {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.remove(key);
        Ok(())
    }
}

/// Durable queue persistence
///
/// Whole-collection load/save plus read-modify-write helpers. The store does
/// no locking of its own; the sync manager is its only caller and serializes
/// access.
pub struct QueueStore {
    storage: Arc<dyn StorageBackend>,
    key: String,
}

impl QueueStore {
    pub fn new(storage: Arc<dyn StorageBackend>, key: impl Into<String>) -> Self {
        Self {
            storage,
            key: key.into(),
        }
    }

    /// Load all persisted entries; empty when nothing was stored yet
    pub fn load(&self) -> Result<Vec<QueueEntry>> {
        match self.storage.get(&self.key)? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Ok(Vec::new()),
        }
    }

    /// Replace the entire durable representation
    pub fn save(&self, entries: &[QueueEntry]) -> Result<()> {
        let bytes = serde_json::to_vec(entries)?;
        self.storage.set(&self.key, &bytes)
    }

    /// Upsert a single entry by id
    pub fn add_or_replace(&self, entry: &QueueEntry) -> Result<()> {
        let mut entries = self.load()?;
        match entries.iter_mut().find(|e| e.id == entry.id) {
            Some(existing) => *existing = entry.clone(),
            None => entries.push(entry.clone()),
        }
        self.save(&entries)
    }

    /// Remove a single entry by id; returns whether it existed
    pub fn remove_by_id(&self, id: &str) -> Result<bool> {
        let mut entries = self.load()?;
        let before = entries.len();
        entries.retain(|e| e.id != id);
        if entries.len() == before {
            return Ok(false);
        }
        self.save(&entries)?;
        Ok(true)
    }
}
