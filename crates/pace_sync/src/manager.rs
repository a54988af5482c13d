//! Sync manager: owns the pending queue and drains it against the backend

use crate::backend::{BackendError, RemoteBackend};
use crate::config::SyncOptions;
use crate::network::NetworkMonitor;
use crate::queue::{sort_for_drain, Operation, QueueEntry, QueueStatus, RecordKey};
use crate::store::QueueStore;
use crate::{Result, SyncError};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::task::JoinHandle;

/// One failed attempt surfaced by a drain
#[derive(Debug, Clone)]
pub struct SyncFailure {
    pub entry_id: String,
    pub table: String,
    pub record_id: String,
    pub message: String,
    /// Permanent failures moved the entry to the failed set
    pub permanent: bool,
}

/// Outcome of one `process_queue` run
#[derive(Debug, Clone, Default)]
pub struct ProcessReport {
    pub success: bool,
    pub processed: usize,
    pub remaining: usize,
    pub errors: Vec<SyncFailure>,
}

impl ProcessReport {
    /// Report for runs that never started: offline, already draining, destroyed
    fn noop() -> Self {
        Self {
            success: true,
            ..Self::default()
        }
    }
}

/// Read-only snapshot of the sync runtime
#[derive(Debug, Clone)]
pub struct SyncStatus {
    pub is_online: bool,
    pub is_processing: bool,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub total_pending: usize,
    pub total_failed: usize,
    pub last_errors: Vec<String>,
}

struct ManagerState {
    /// Pending entries keyed per record; at most one entry per key
    queue: HashMap<RecordKey, QueueEntry>,

    /// Entries that hit a permanent error or exhausted their retries
    failed: Vec<QueueEntry>,

    last_sync_at: Option<DateTime<Utc>>,
    last_errors: Vec<String>,
}

struct ManagerInner {
    options: SyncOptions,
    store: QueueStore,
    failed_store: QueueStore,
    backend: Arc<dyn RemoteBackend>,
    network: Arc<NetworkMonitor>,
    state: Mutex<ManagerState>,

    /// Drain exclusion: `try_lock` failure means a run is active
    drain: tokio::sync::Mutex<()>,

    /// Reporting flag only; never used for exclusion
    processing: AtomicBool,

    destroyed: AtomicBool,
    retry_timer: Mutex<Option<JoinHandle<()>>>,
    watch_task: Mutex<Option<JoinHandle<()>>>,
}

/// Owns the in-memory queue and orchestrates processing
///
/// Cheap to clone; all clones share one state.
#[derive(Clone)]
pub struct SyncManager {
    inner: Arc<ManagerInner>,
}

impl SyncManager {
    /// Build a manager, hydrating the queue from durable storage
    pub fn new(
        options: SyncOptions,
        store: QueueStore,
        failed_store: QueueStore,
        backend: Arc<dyn RemoteBackend>,
        network: Arc<NetworkMonitor>,
    ) -> Result<Self> {
        options.validate()?;
        let queue = Self::hydrate(&store)?;
        let failed = failed_store.load()?;

        tracing::info!(
            pending = queue.len(),
            failed = failed.len(),
            "sync manager initialized"
        );

        Ok(Self {
            inner: Arc::new(ManagerInner {
                options,
                store,
                failed_store,
                backend,
                network,
                state: Mutex::new(ManagerState {
                    queue,
                    failed,
                    last_sync_at: None,
                    last_errors: Vec::new(),
                }),
                drain: tokio::sync::Mutex::new(()),
                processing: AtomicBool::new(false),
                destroyed: AtomicBool::new(false),
                retry_timer: Mutex::new(None),
                watch_task: Mutex::new(None),
            }),
        })
    }

    fn hydrate(store: &QueueStore) -> Result<HashMap<RecordKey, QueueEntry>> {
        Ok(store
            .load()?
            .into_iter()
            .map(|e| (e.record_key(), e))
            .collect())
    }

    /// Spawn the connectivity watcher; offline-to-online transitions drain
    pub fn start(&self) {
        let mut rx = self.inner.network.watch();
        let manager = self.clone();
        let handle = tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let online = *rx.borrow_and_update();
                if online {
                    tracing::info!("back online, draining pending queue");
                    if let Err(err) = manager.process_queue().await {
                        tracing::error!("queue drain after reconnect failed: {}", err);
                    }
                }
            }
        });
        let mut slot = lock(&self.inner.watch_task);
        if let Some(old) = slot.replace(handle) {
            old.abort();
        }
    }

    /// Validate, coalesce, and durably persist a pending mutation
    ///
    /// Returns once the entry is stored; performs no network I/O.
    pub fn add_to_queue(&self, entry: QueueEntry) -> Result<()> {
        if self.inner.destroyed.load(Ordering::SeqCst) {
            return Err(SyncError::Destroyed);
        }
        entry.validate()?;

        let mut state = self.lock_state();
        if state
            .queue
            .values()
            .any(|e| e.id == entry.id && e.record_key() != entry.record_key())
        {
            return Err(SyncError::Validation(format!(
                "duplicate queue entry id: {}",
                entry.id
            )));
        }

        // Build the coalesced queue first, persist it, then commit in memory,
        // so a storage failure leaves both copies untouched.
        let key = entry.record_key();
        let mut next = state.queue.clone();
        let existing = next.remove(&key);
        match coalesce(existing, entry) {
            Some(merged) => {
                tracing::debug!(
                    record = %merged.record_id,
                    op = ?merged.operation,
                    "queued mutation"
                );
                next.insert(key, merged);
            }
            None => {
                tracing::debug!(record = %key.record_id, "create and delete cancelled out");
            }
        }

        self.inner.store.save(&entries_of(&next))?;
        state.queue = next;
        Ok(())
    }

    /// Drain the pending queue against the remote backend
    ///
    /// No-op while offline, while another drain runs, or after `destroy`.
    pub async fn process_queue(&self) -> Result<ProcessReport> {
        if self.inner.destroyed.load(Ordering::SeqCst) {
            return Ok(ProcessReport::noop());
        }
        if !self.inner.network.is_online() {
            tracing::debug!("offline, skipping queue processing");
            return Ok(ProcessReport::noop());
        }
        let Ok(_guard) = self.inner.drain.try_lock() else {
            tracing::debug!("drain already in progress");
            return Ok(ProcessReport::noop());
        };

        self.inner.processing.store(true, Ordering::SeqCst);
        let report = self.drain_once().await;
        self.inner.processing.store(false, Ordering::SeqCst);

        if let Ok(report) = &report {
            if report.remaining > 0 {
                self.schedule_retry();
            }
        }
        report
    }

    async fn drain_once(&self) -> Result<ProcessReport> {
        let mut snapshot: Vec<QueueEntry> =
            self.lock_state().queue.values().cloned().collect();
        sort_for_drain(&mut snapshot);

        let now = Utc::now();
        let base = self.inner.options.backoff_base;
        let cap = self.inner.options.backoff_cap;
        let mut processed = 0;
        let mut errors: Vec<SyncFailure> = Vec::new();

        for entry in snapshot {
            if self.inner.destroyed.load(Ordering::SeqCst) {
                tracing::warn!("manager destroyed mid-drain, abandoning run");
                break;
            }
            if !entry.is_eligible(now, base, cap) {
                // Still backing off; stays queued for a later drain
                continue;
            }

            match self.attempt(&entry).await {
                Ok(()) => {
                    if self.inner.destroyed.load(Ordering::SeqCst) {
                        break;
                    }
                    let mut state = self.lock_state();
                    // A newer mutation may have coalesced over this entry
                    // while the write was in flight; keep it for the next
                    // drain instead of dropping it with the old one.
                    let superseded = state
                        .queue
                        .get(&entry.record_key())
                        .map_or(true, |current| {
                            current.operation != entry.operation
                                || current.payload != entry.payload
                        });
                    if superseded {
                        tracing::debug!(
                            record = %entry.record_id,
                            "entry superseded mid-flight, keeping newer mutation"
                        );
                        continue;
                    }
                    state.queue.remove(&entry.record_key());
                    // Durable removal happens per entry, not batched: a crash
                    // here never replays an already-applied mutation.
                    self.inner.store.save(&entries_of(&state.queue))?;
                    processed += 1;
                }
                Err(err) => {
                    if self.inner.destroyed.load(Ordering::SeqCst) {
                        break;
                    }
                    let permanent = err.is_permanent();
                    tracing::warn!(
                        record = %entry.record_id,
                        permanent,
                        "remote write failed: {}",
                        err
                    );
                    errors.push(SyncFailure {
                        entry_id: entry.id.clone(),
                        table: entry.table.clone(),
                        record_id: entry.record_id.clone(),
                        message: err.to_string(),
                        permanent,
                    });

                    let mut state = self.lock_state();
                    let key = entry.record_key();
                    let Some(current) = state.queue.get(&key) else {
                        continue;
                    };
                    if current.operation != entry.operation || current.payload != entry.payload
                    {
                        // The failure belongs to a mutation that no longer
                        // exists; the replacement has not been attempted yet.
                        continue;
                    }
                    let Some(mut updated) = state.queue.remove(&key) else {
                        continue;
                    };
                    updated.attempts += 1;
                    updated.last_attempt_at = Some(Utc::now());

                    if permanent || updated.attempts >= self.inner.options.max_attempts {
                        tracing::warn!(
                            record = %updated.record_id,
                            attempts = updated.attempts,
                            "moving entry to failed set"
                        );
                        state.failed.push(updated);
                        self.inner.failed_store.save(&state.failed)?;
                    } else {
                        state.queue.insert(key, updated);
                    }
                    self.inner.store.save(&entries_of(&state.queue))?;
                }
            }
        }

        let (remaining, success) = {
            let mut state = self.lock_state();
            state.last_errors = errors.iter().map(|e| e.message.clone()).collect();
            let success = errors.is_empty();
            if success {
                state.last_sync_at = Some(Utc::now());
            }
            (state.queue.len(), success)
        };

        tracing::info!(
            processed,
            remaining,
            errors = errors.len(),
            "queue drain finished"
        );
        Ok(ProcessReport {
            success,
            processed,
            remaining,
            errors,
        })
    }

    async fn attempt(&self, entry: &QueueEntry) -> std::result::Result<(), BackendError> {
        tracing::debug!(
            entry = %entry.id,
            op = ?entry.operation,
            table = %entry.table,
            "attempting remote write"
        );
        let backend = &self.inner.backend;
        match (entry.operation, &entry.payload) {
            (Operation::Create, Some(payload)) => backend
                .create(&entry.table, payload)
                .await
                .map(|_id| ()),
            (Operation::Update, Some(payload)) => {
                backend.update(&entry.table, &entry.record_id, payload).await
            }
            (Operation::Delete, _) => backend.delete(&entry.table, &entry.record_id).await,
            // Validated away at enqueue; permanent if it ever slips through
            _ => Err(BackendError::Rejected(
                "create/update entry without payload".to_string(),
            )),
        }
    }

    /// Schedule a re-drain when the earliest backed-off entry becomes eligible
    fn schedule_retry(&self) {
        if self.inner.destroyed.load(Ordering::SeqCst) {
            return;
        }
        let base = self.inner.options.backoff_base;
        let cap = self.inner.options.backoff_cap;
        let earliest = {
            let state = self.lock_state();
            state
                .queue
                .values()
                .filter_map(|e| e.next_eligible_at(base, cap))
                .min()
        };
        let delay = earliest
            .and_then(|at| (at - Utc::now()).to_std().ok())
            .unwrap_or(base)
            // Floor at the base delay so a hot entry cannot spin
            .max(base);

        tracing::debug!(delay_ms = delay.as_millis() as u64, "scheduling retry drain");
        let manager = self.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(err) = manager.process_queue().await {
                tracing::error!("scheduled retry drain failed: {}", err);
            }
        });
        let mut slot = lock(&self.inner.retry_timer);
        if let Some(old) = slot.replace(handle) {
            old.abort();
        }
    }

    /// Pure read-side projection of the pending queue
    pub fn get_queue_status(&self) -> QueueStatus {
        QueueStatus::from_entries(self.lock_state().queue.values())
    }

    /// Pure read-side projection of the sync runtime
    pub fn get_sync_status(&self) -> SyncStatus {
        let state = self.lock_state();
        SyncStatus {
            is_online: self.inner.network.is_online(),
            is_processing: self.inner.processing.load(Ordering::SeqCst),
            last_sync_at: state.last_sync_at,
            total_pending: state.queue.len(),
            total_failed: state.failed.len(),
            last_errors: state.last_errors.clone(),
        }
    }

    /// Whether a mutation is still queued for the given record
    pub fn has_pending(&self, table: &str, record_id: &str) -> bool {
        self.pending_entry(table, record_id).is_some()
    }

    pub fn pending_entry(&self, table: &str, record_id: &str) -> Option<QueueEntry> {
        let key = RecordKey {
            table: table.to_string(),
            record_id: record_id.to_string(),
        };
        self.lock_state().queue.get(&key).cloned()
    }

    /// Drop the pending mutation for a record, in memory and durably
    ///
    /// Used when a conflict resolves server-wins: the stale local mutation
    /// must not replay over the accepted server version.
    pub fn remove_pending(&self, table: &str, record_id: &str) -> Result<bool> {
        let key = RecordKey {
            table: table.to_string(),
            record_id: record_id.to_string(),
        };
        let mut state = self.lock_state();
        if state.queue.remove(&key).is_none() {
            return Ok(false);
        }
        self.inner.store.save(&entries_of(&state.queue))?;
        Ok(true)
    }

    /// Entries that hit a permanent error or ran out of retries
    pub fn failed_entries(&self) -> Vec<QueueEntry> {
        self.lock_state().failed.clone()
    }

    /// Explicitly discard a failed entry; the only way one is destroyed
    pub fn discard_failed(&self, id: &str) -> Result<bool> {
        let mut state = self.lock_state();
        let before = state.failed.len();
        state.failed.retain(|e| e.id != id);
        if state.failed.len() == before {
            return Ok(false);
        }
        self.inner.failed_store.save(&state.failed)?;
        Ok(true)
    }

    /// Re-derive in-memory state strictly from durable storage
    ///
    /// Models an application restart: nothing in the durable queue is lost.
    pub fn reset(&self) -> Result<()> {
        let queue = Self::hydrate(&self.inner.store)?;
        let failed = self.inner.failed_store.load()?;

        let mut state = self.lock_state();
        state.queue = queue;
        state.failed = failed;
        tracing::info!(
            pending = state.queue.len(),
            "manager state reloaded from storage"
        );
        Ok(())
    }

    /// Detach from the network monitor and cancel pending timers; idempotent
    pub fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = lock(&self.inner.retry_timer).take() {
            handle.abort();
        }
        if let Some(handle) = lock(&self.inner.watch_task).take() {
            handle.abort();
        }
        tracing::info!("sync manager destroyed");
    }

    fn lock_state(&self) -> MutexGuard<'_, ManagerState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Durable representation, ordered by age
fn entries_of(queue: &HashMap<RecordKey, QueueEntry>) -> Vec<QueueEntry> {
    let mut entries: Vec<QueueEntry> = queue.values().cloned().collect();
    entries.sort_by_key(|e| e.created_at);
    entries
}

/// Merge a new mutation into the pending entry for the same record
///
/// Returns `None` when the operations cancel out (create then delete for a
/// record the backend never saw). The survivor keeps the original entry's
/// id, earliest `created_at`, attempt history, and the higher priority.
fn coalesce(existing: Option<QueueEntry>, incoming: QueueEntry) -> Option<QueueEntry> {
    let Some(existing) = existing else {
        return Some(incoming);
    };

    use Operation::*;
    let operation = match (existing.operation, incoming.operation) {
        (Create, Delete) => return None,
        (Create, _) => Create,
        (Update, Delete) | (Delete, Delete) => Delete,
        // The remote row still exists until the queued delete ships, so a
        // re-create (or update) nets out to an update of that row.
        (Delete, Create) | (Delete, Update) => Update,
        (Update, _) => Update,
    };

    Some(QueueEntry {
        id: existing.id,
        operation,
        table: existing.table,
        record_id: existing.record_id,
        payload: if operation == Delete {
            None
        } else {
            incoming.payload
        },
        priority: existing.priority.min(incoming.priority),
        attempts: existing.attempts,
        created_at: existing.created_at,
        last_attempt_at: existing.last_attempt_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::Priority;
    use serde_json::json;

    fn entry(op: Operation, priority: Priority) -> QueueEntry {
        let payload = match op {
            Operation::Delete => None,
            _ => Some(json!({"exercise": "run"})),
        };
        QueueEntry::new("e1", op, "workouts", "w1", payload, priority)
    }

    #[test]
    fn test_coalesce_create_then_update_stays_create() {
        let create = entry(Operation::Create, Priority::Medium);
        let mut update = entry(Operation::Update, Priority::Medium);
        update.id = "e2".to_string();
        update.payload = Some(json!({"exercise": "row"}));

        let merged = coalesce(Some(create), update).unwrap();
        assert_eq!(merged.operation, Operation::Create);
        assert_eq!(merged.id, "e1");
        assert_eq!(merged.payload, Some(json!({"exercise": "row"})));
    }

    #[test]
    fn test_coalesce_create_then_delete_cancels() {
        let create = entry(Operation::Create, Priority::Medium);
        let delete = entry(Operation::Delete, Priority::Medium);
        assert!(coalesce(Some(create), delete).is_none());
    }

    #[test]
    fn test_coalesce_update_then_delete_becomes_delete() {
        let update = entry(Operation::Update, Priority::Medium);
        let delete = entry(Operation::Delete, Priority::Medium);

        let merged = coalesce(Some(update), delete).unwrap();
        assert_eq!(merged.operation, Operation::Delete);
        assert!(merged.payload.is_none());
    }

    #[test]
    fn test_coalesce_delete_then_create_becomes_update() {
        let delete = entry(Operation::Delete, Priority::Medium);
        let mut create = entry(Operation::Create, Priority::Medium);
        create.payload = Some(json!({"exercise": "swim"}));

        let merged = coalesce(Some(delete), create).unwrap();
        assert_eq!(merged.operation, Operation::Update);
        assert_eq!(merged.payload, Some(json!({"exercise": "swim"})));
    }

    #[test]
    fn test_coalesce_keeps_age_and_raises_priority() {
        let mut first = entry(Operation::Update, Priority::Low);
        first.created_at = Utc::now() - chrono::Duration::seconds(60);
        first.attempts = 2;
        let second = entry(Operation::Update, Priority::Critical);

        let merged = coalesce(Some(first.clone()), second).unwrap();
        assert_eq!(merged.priority, Priority::Critical);
        assert_eq!(merged.created_at, first.created_at);
        // Attempt history carries over so backoff is not defeated
        assert_eq!(merged.attempts, 2);
    }
}
