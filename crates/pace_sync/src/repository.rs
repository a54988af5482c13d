//! Repository facade and the locally-cached materialized view

use crate::backend::RemoteBackend;
use crate::config::SyncOptions;
use crate::conflict::ConflictLog;
use crate::feed::RealtimeReconciler;
use crate::manager::{ProcessReport, SyncManager, SyncStatus};
use crate::network::NetworkMonitor;
use crate::queue::{Operation, Priority, QueueEntry, QueueStatus};
use crate::store::{QueueStore, StorageBackend};
use crate::{new_id, Result, SyncError};
use chrono::Utc;
use pace_common::Record;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::mpsc;

/// What happened to a cached record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Updated,
    Removed,
}

/// A single cache change pushed to subscribers
///
/// Locally-originated and remotely-reconciled changes arrive through the
/// same stream; subscribers cannot (and need not) tell them apart.
#[derive(Debug, Clone)]
pub struct RecordChange {
    pub kind: ChangeKind,
    pub record: Record,
}

type SubscriberMap = HashMap<u64, mpsc::UnboundedSender<RecordChange>>;

/// Live subscription to cache changes
///
/// Dropping the handle detaches it; `unsubscribe` does so explicitly.
pub struct RecordStream {
    id: u64,
    rx: mpsc::UnboundedReceiver<RecordChange>,
    subscribers: Weak<Mutex<SubscriberMap>>,
}

impl RecordStream {
    /// Next change, waiting if none is queued; `None` once detached
    pub async fn next(&mut self) -> Option<RecordChange> {
        self.rx.recv().await
    }

    /// Next change if one is already queued
    pub fn try_next(&mut self) -> Option<RecordChange> {
        self.rx.try_recv().ok()
    }

    /// Explicitly detach from the cache
    pub fn unsubscribe(self) {
        // Drop does the work
    }
}

impl Drop for RecordStream {
    fn drop(&mut self) {
        if let Some(subscribers) = self.subscribers.upgrade() {
            subscribers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&self.id);
        }
    }
}

/// Locally-cached domain records (the materialized view)
///
/// The facade owns the only instance and is its single writer: optimistic
/// local mutations and reconciled remote events all land through the
/// crate-private mutators below, which also notify subscribers.
#[derive(Default)]
pub struct RecordCache {
    records: Mutex<HashMap<String, Record>>,
    subscribers: Arc<Mutex<SubscriberMap>>,
    next_subscriber: AtomicU64,
}

impl RecordCache {
    pub fn get(&self, id: &str) -> Option<Record> {
        self.lock_records().get(id).cloned()
    }

    /// Snapshot of all cached records, most recently modified first
    pub fn all(&self) -> Vec<Record> {
        let mut records: Vec<Record> = self.lock_records().values().cloned().collect();
        records.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(a.id.cmp(&b.id)));
        records
    }

    pub fn len(&self) -> usize {
        self.lock_records().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock_records().is_empty()
    }

    /// Register a live stream of cache changes
    pub fn subscribe(&self) -> RecordStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_subscriber.fetch_add(1, Ordering::SeqCst);
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, tx);
        RecordStream {
            id,
            rx,
            subscribers: Arc::downgrade(&self.subscribers),
        }
    }

    pub(crate) fn upsert(&self, record: Record) {
        let kind = {
            let mut records = self.lock_records();
            let kind = if records.contains_key(&record.id) {
                ChangeKind::Updated
            } else {
                ChangeKind::Added
            };
            records.insert(record.id.clone(), record.clone());
            kind
        };
        self.notify(RecordChange { kind, record });
    }

    /// Insert only when the id is not cached yet; returns whether it was
    pub(crate) fn insert_if_absent(&self, record: Record) -> bool {
        {
            let mut records = self.lock_records();
            if records.contains_key(&record.id) {
                return false;
            }
            records.insert(record.id.clone(), record.clone());
        }
        self.notify(RecordChange {
            kind: ChangeKind::Added,
            record,
        });
        true
    }

    pub(crate) fn remove(&self, id: &str) -> Option<Record> {
        let removed = self.lock_records().remove(id);
        if let Some(record) = &removed {
            self.notify(RecordChange {
                kind: ChangeKind::Removed,
                record: record.clone(),
            });
        }
        removed
    }

    fn notify(&self, change: RecordChange) {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        // Prune subscribers whose receiving half is gone
        subscribers.retain(|_, tx| tx.send(change.clone()).is_ok());
    }

    fn lock_records(&self) -> MutexGuard<'_, HashMap<String, Record>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Single entry point for the rest of the application
///
/// Constructed once at application start with the backend adapter chosen by
/// configuration, then passed down. Writes are optimistic local mutations
/// plus durably queued remote mutations; reads come from the local cache.
pub struct Repository {
    table: String,
    principal: String,
    backend: Arc<dyn RemoteBackend>,
    cache: Arc<RecordCache>,
    manager: SyncManager,
    reconciler: Arc<RealtimeReconciler>,
    conflicts: Arc<ConflictLog>,
}

impl Repository {
    pub fn new(
        options: SyncOptions,
        backend: Arc<dyn RemoteBackend>,
        storage: Arc<dyn StorageBackend>,
        network: Arc<NetworkMonitor>,
    ) -> Result<Self> {
        let store = QueueStore::new(Arc::clone(&storage), options.queue_key.clone());
        let failed_store = QueueStore::new(storage, options.failed_key.clone());
        let manager = SyncManager::new(
            options.clone(),
            store,
            failed_store,
            Arc::clone(&backend),
            network,
        )?;

        let cache = Arc::new(RecordCache::default());
        let conflicts = Arc::new(ConflictLog::new());
        let reconciler = Arc::new(RealtimeReconciler::new(
            options.principal.clone(),
            Arc::clone(&cache),
            manager.clone(),
            Arc::clone(&conflicts),
        ));

        Ok(Self {
            table: options.table,
            principal: options.principal,
            backend,
            cache,
            manager,
            reconciler,
            conflicts,
        })
    }

    /// Start background work: connectivity watcher and change-feed task
    pub async fn start(&self) -> Result<()> {
        self.manager.start();
        self.reconciler
            .start(Arc::clone(&self.backend), &self.table)
            .await
    }

    /// Create a record: optimistic local insert plus queued remote create
    pub fn add(&self, mut data: serde_json::Value, priority: Priority) -> Result<Record> {
        let record_id = new_id(12);
        let serde_json::Value::Object(map) = &mut data else {
            return Err(SyncError::Validation(
                "record payload must be a JSON object".to_string(),
            ));
        };
        map.insert("id".to_string(), serde_json::Value::String(record_id.clone()));
        map.insert(
            "owner_id".to_string(),
            serde_json::Value::String(self.principal.clone()),
        );
        map.entry("updated_at".to_string())
            .or_insert_with(|| serde_json::Value::String(Utc::now().to_rfc3339()));

        self.manager.add_to_queue(QueueEntry::new(
            new_id(10),
            Operation::Create,
            &self.table,
            &record_id,
            Some(data.clone()),
            priority,
        ))?;

        let record = Record::new(record_id, self.principal.clone(), data);
        self.cache.upsert(record.clone());
        Ok(record)
    }

    /// Update a record: optimistic merge plus queued remote update
    pub fn update(&self, id: &str, patch: serde_json::Value, priority: Priority) -> Result<Record> {
        let Some(existing) = self.cache.get(id) else {
            return Err(SyncError::Validation(format!("unknown record: {}", id)));
        };
        let serde_json::Value::Object(patch) = patch else {
            return Err(SyncError::Validation(
                "record patch must be a JSON object".to_string(),
            ));
        };

        let mut data = existing.data.clone();
        if let serde_json::Value::Object(map) = &mut data {
            for (key, value) in patch {
                map.insert(key, value);
            }
            map.insert(
                "updated_at".to_string(),
                serde_json::Value::String(Utc::now().to_rfc3339()),
            );
        }

        self.manager.add_to_queue(QueueEntry::new(
            new_id(10),
            Operation::Update,
            &self.table,
            id,
            Some(data.clone()),
            priority,
        ))?;

        let record = Record::new(id, self.principal.clone(), data);
        self.cache.upsert(record.clone());
        Ok(record)
    }

    /// Delete a record: optimistic removal plus queued remote delete
    pub fn delete(&self, id: &str, priority: Priority) -> Result<()> {
        if self.cache.get(id).is_none() {
            return Err(SyncError::Validation(format!("unknown record: {}", id)));
        }
        self.manager.add_to_queue(QueueEntry::new(
            new_id(10),
            Operation::Delete,
            &self.table,
            id,
            None,
            priority,
        ))?;
        self.cache.remove(id);
        Ok(())
    }

    /// Snapshot of the materialized view
    pub fn get_all(&self) -> Vec<Record> {
        self.cache.all()
    }

    pub fn get_by_id(&self, id: &str) -> Option<Record> {
        self.cache.get(id)
    }

    /// Live stream of cache changes, local and remote alike
    pub fn subscribe(&self) -> RecordStream {
        self.cache.subscribe()
    }

    pub fn queue_status(&self) -> QueueStatus {
        self.manager.get_queue_status()
    }

    pub fn sync_status(&self) -> SyncStatus {
        self.manager.get_sync_status()
    }

    /// User-initiated drain; always safe to call
    pub async fn process_now(&self) -> Result<ProcessReport> {
        self.manager.process_queue().await
    }

    pub fn conflicts(&self) -> &Arc<ConflictLog> {
        &self.conflicts
    }

    pub fn manager(&self) -> &SyncManager {
        &self.manager
    }

    /// Handle used by the reconciler and by diagnostics; read-only for callers
    pub fn cache(&self) -> &Arc<RecordCache> {
        &self.cache
    }

    /// Tear down background tasks; idempotent
    pub fn shutdown(&self) {
        self.manager.destroy();
        self.reconciler.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str) -> Record {
        Record::new(
            id,
            "user-1",
            serde_json::json!({"exercise": "run", "updated_at": "2024-05-01T10:00:00Z"}),
        )
    }

    #[test]
    fn test_cache_upsert_and_remove_notify() {
        let cache = RecordCache::default();
        let mut stream = cache.subscribe();

        cache.upsert(record("w1"));
        cache.upsert(record("w1"));
        cache.remove("w1");

        assert_eq!(stream.try_next().unwrap().kind, ChangeKind::Added);
        assert_eq!(stream.try_next().unwrap().kind, ChangeKind::Updated);
        assert_eq!(stream.try_next().unwrap().kind, ChangeKind::Removed);
        assert!(stream.try_next().is_none());
    }

    #[test]
    fn test_cache_insert_if_absent_dedupes() {
        let cache = RecordCache::default();
        assert!(cache.insert_if_absent(record("w1")));
        assert!(!cache.insert_if_absent(record("w1")));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_unsubscribe_detaches() {
        let cache = RecordCache::default();
        let stream = cache.subscribe();
        stream.unsubscribe();

        // No subscriber left to notify
        cache.upsert(record("w1"));
        assert!(cache
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty());
    }

    #[test]
    fn test_all_sorts_newest_first() {
        let cache = RecordCache::default();
        cache.upsert(Record::new(
            "old",
            "user-1",
            serde_json::json!({"updated_at": "2024-05-01T10:00:00Z"}),
        ));
        cache.upsert(Record::new(
            "new",
            "user-1",
            serde_json::json!({"updated_at": "2024-05-02T10:00:00Z"}),
        ));

        let all = cache.all();
        assert_eq!(all[0].id, "new");
        assert_eq!(all[1].id, "old");
    }
}
