//! Realtime reconciler: merges the remote change feed into local state

use crate::backend::RemoteBackend;
use crate::conflict::{ConflictLog, ConflictRecord, ConflictResolver, ConflictType, Resolution};
use crate::manager::SyncManager;
use crate::repository::RecordCache;
use pace_common::{ChangeEvent, ChangeEventType, Record};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinHandle;

/// Consumes the backend change feed for one principal
///
/// Externally-sourced changes are requested against the facade-owned cache;
/// events that collide with a still-queued local mutation go through the
/// conflict resolver instead of being applied blindly.
pub struct RealtimeReconciler {
    principal: String,
    cache: Arc<RecordCache>,
    manager: SyncManager,
    resolver: ConflictResolver,
    conflicts: Arc<ConflictLog>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RealtimeReconciler {
    pub fn new(
        principal: impl Into<String>,
        cache: Arc<RecordCache>,
        manager: SyncManager,
        conflicts: Arc<ConflictLog>,
    ) -> Self {
        Self {
            principal: principal.into(),
            cache,
            manager,
            resolver: ConflictResolver::new(),
            conflicts,
            task: Mutex::new(None),
        }
    }

    /// Subscribe to the change feed and spawn the draining task
    pub async fn start(
        self: &Arc<Self>,
        backend: Arc<dyn RemoteBackend>,
        table: &str,
    ) -> crate::Result<()> {
        let mut rx = backend.subscribe(table, &self.principal).await?;
        tracing::info!(table, principal = %self.principal, "change feed attached");

        let reconciler = Arc::clone(self);
        let handle = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                reconciler.handle_event(event);
            }
            tracing::info!("change feed closed");
        });

        let mut slot = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(old) = slot.replace(handle) {
            old.abort();
        }
        Ok(())
    }

    /// Apply one change-feed event to local state
    pub fn handle_event(&self, event: ChangeEvent) {
        if event.owner_id != self.principal {
            // Cross-tenant isolation: another user's rows must never reach
            // the cache, even transiently.
            tracing::warn!(
                record = %event.record_id,
                "dropping change event for foreign principal"
            );
            return;
        }
        match event.event_type {
            ChangeEventType::Insert => self.apply_insert(event),
            ChangeEventType::Update => self.apply_update(event),
            ChangeEventType::Delete => self.apply_delete(event),
        }
    }

    fn apply_insert(&self, event: ChangeEvent) {
        let Some(payload) = event.payload else {
            tracing::warn!(record = %event.record_id, "insert event without payload");
            return;
        };
        let record = Record::new(event.record_id.clone(), event.owner_id, payload);
        // Dedupe against optimistic local inserts
        if !self.cache.insert_if_absent(record) {
            tracing::debug!(record = %event.record_id, "insert already cached");
        }
    }

    fn apply_update(&self, event: ChangeEvent) {
        let Some(payload) = event.payload else {
            tracing::warn!(record = %event.record_id, "update event without payload");
            return;
        };

        if !self.manager.has_pending(&event.table, &event.record_id) {
            self.cache
                .upsert(Record::new(event.record_id, event.owner_id, payload));
            return;
        }

        // A local mutation is still queued for this record: conflict candidate
        let local = self.cache.get(&event.record_id).map(|r| r.data);
        let Some(kind) = self.resolver.detect(local.as_ref(), Some(&payload), None) else {
            self.cache
                .upsert(Record::new(event.record_id, event.owner_id, payload));
            return;
        };

        let mut conflict = ConflictRecord::new(
            event.table.clone(),
            event.record_id.clone(),
            local,
            Some(payload.clone()),
            kind,
        );
        match self.resolver.auto_resolve(&mut conflict) {
            Some(Resolution::ServerWins) => {
                // The stale local mutation must not replay over the accepted
                // server version on the next drain.
                if let Err(err) = self.manager.remove_pending(&event.table, &event.record_id) {
                    tracing::error!(
                        record = %event.record_id,
                        "failed to drop pending mutation: {}",
                        err
                    );
                }
                self.cache
                    .upsert(Record::new(event.record_id, event.owner_id, payload));
            }
            Some(_) => {
                // Local wins: cache and pending entry both stay
            }
            None => {
                tracing::info!(
                    record = %event.record_id,
                    "conflict requires manual resolution"
                );
            }
        }
        self.conflicts.record(conflict);
    }

    fn apply_delete(&self, event: ChangeEvent) {
        if self.manager.has_pending(&event.table, &event.record_id) {
            // Remote deleted while a local update is queued; keep local state
            // until someone resolves the conflict.
            let local = self.cache.get(&event.record_id).map(|r| r.data);
            self.conflicts.record(ConflictRecord::new(
                event.table,
                event.record_id,
                local,
                None,
                ConflictType::DeleteConflict,
            ));
            return;
        }
        self.cache.remove(&event.record_id);
    }

    /// Detach from the change feed; idempotent
    pub fn stop(&self) {
        let mut slot = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(handle) = slot.take() {
            handle.abort();
        }
    }
}
