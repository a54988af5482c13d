//! Change-feed reconciliation: isolation, dedupe, and conflict routing

use pace_sync::conflict::ConflictLog;
use pace_sync::{
    ConflictType, NetworkMonitor, Operation, Priority, QueueStore, RealtimeReconciler,
    RecordCache, Repository, Resolution, SyncManager, SyncOptions,
};
use pace_test_helpers::prelude::*;
use std::sync::Arc;
use std::time::Duration;

struct Harness {
    reconciler: RealtimeReconciler,
    cache: Arc<RecordCache>,
    manager: SyncManager,
    conflicts: Arc<ConflictLog>,
}

impl Harness {
    fn new() -> Self {
        let options = SyncOptions {
            principal: "user-1".to_string(),
            table: "workouts".to_string(),
            ..Default::default()
        };
        let storage = memory_storage();
        let store = QueueStore::new(storage.clone(), options.queue_key.clone());
        let failed_store = QueueStore::new(storage, options.failed_key.clone());
        let network = Arc::new(NetworkMonitor::new(false));
        let manager = SyncManager::new(
            options,
            store,
            failed_store,
            Arc::new(MockBackend::new()),
            network,
        )
        .expect("manager construction");

        let cache = Arc::new(RecordCache::default());
        let conflicts = Arc::new(ConflictLog::new());
        let reconciler = RealtimeReconciler::new(
            "user-1",
            Arc::clone(&cache),
            manager.clone(),
            Arc::clone(&conflicts),
        );
        Self {
            reconciler,
            cache,
            manager,
            conflicts,
        }
    }

    /// Seed the cache through the feed, then queue a local edit for the row
    fn seed_with_pending_edit(&self, payload: serde_json::Value) {
        self.reconciler
            .handle_event(insert_event("w1", "user-1", payload.clone()));
        let mut entry = queue_entry("e1", Operation::Update, "w1", Priority::Medium);
        entry.payload = Some(payload);
        self.manager.add_to_queue(entry).unwrap();
    }
}

#[tokio::test]
async fn foreign_principal_events_never_reach_the_cache() {
    suppress_logs();
    let h = Harness::new();

    let payload = workout_payload("w1", "mallory", "run", "2024-05-01T10:00:00Z");
    h.reconciler
        .handle_event(insert_event("w1", "mallory", payload.clone()));
    h.reconciler
        .handle_event(update_event("w1", "mallory", payload));
    h.reconciler.handle_event(delete_event("w1", "mallory"));

    assert!(h.cache.is_empty());
    assert!(h.conflicts.is_empty());
    h.manager.destroy();
}

#[tokio::test]
async fn insert_dedupes_against_already_cached_rows() {
    suppress_logs();
    let h = Harness::new();

    h.reconciler.handle_event(insert_event(
        "w1",
        "user-1",
        workout_payload("w1", "user-1", "run", "2024-05-01T10:00:00Z"),
    ));
    // A second insert for the same id (e.g. echo of an optimistic create)
    h.reconciler.handle_event(insert_event(
        "w1",
        "user-1",
        workout_payload("w1", "user-1", "row", "2024-05-01T11:00:00Z"),
    ));

    assert_eq!(h.cache.len(), 1);
    assert_eq!(h.cache.get("w1").unwrap().data["exercise"], "run");
    h.manager.destroy();
}

#[tokio::test]
async fn update_without_pending_mutation_fast_forwards() {
    suppress_logs();
    let h = Harness::new();

    h.reconciler.handle_event(insert_event(
        "w1",
        "user-1",
        workout_payload("w1", "user-1", "run", "2024-05-01T10:00:00Z"),
    ));
    h.reconciler.handle_event(update_event(
        "w1",
        "user-1",
        workout_payload("w1", "user-1", "row", "2024-05-01T11:00:00Z"),
    ));

    assert_eq!(h.cache.get("w1").unwrap().data["exercise"], "row");
    assert!(h.conflicts.is_empty());
    h.manager.destroy();
}

#[tokio::test]
async fn update_against_pending_mutation_becomes_a_conflict() {
    suppress_logs();
    let h = Harness::new();

    h.seed_with_pending_edit(workout_payload("w1", "user-1", "run", "2024-05-01T10:00:00Z"));

    // Server version carries no comparable timestamp: nothing auto-resolves
    h.reconciler.handle_event(update_event(
        "w1",
        "user-1",
        serde_json::json!({"id": "w1", "owner_id": "user-1", "exercise": "row"}),
    ));

    // Not silently overwritten: local stays, conflict is materialized
    assert_eq!(h.cache.get("w1").unwrap().data["exercise"], "run");
    assert!(h.manager.has_pending("workouts", "w1"));
    let unresolved = h.conflicts.unresolved();
    assert_eq!(unresolved.len(), 1);
    assert_eq!(unresolved[0].conflict_type, ConflictType::ConcurrentUpdate);
    h.manager.destroy();
}

#[tokio::test]
async fn newer_server_version_wins_and_drops_the_pending_edit() {
    suppress_logs();
    let h = Harness::new();

    h.seed_with_pending_edit(workout_payload("w1", "user-1", "run", "2024-05-01T10:00:00Z"));

    let server = workout_payload("w1", "user-1", "row", "2024-05-01T12:00:00Z");
    h.reconciler
        .handle_event(update_event("w1", "user-1", server));

    assert_eq!(h.cache.get("w1").unwrap().data["exercise"], "row");
    assert!(!h.manager.has_pending("workouts", "w1"));

    let all = h.conflicts.all();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].resolution, Some(Resolution::ServerWins));
    h.manager.destroy();
}

#[tokio::test]
async fn older_server_version_loses_to_the_local_edit() {
    suppress_logs();
    let h = Harness::new();

    h.seed_with_pending_edit(workout_payload("w1", "user-1", "run", "2024-05-01T12:00:00Z"));

    let server = workout_payload("w1", "user-1", "row", "2024-05-01T10:00:00Z");
    h.reconciler
        .handle_event(update_event("w1", "user-1", server));

    // Local wins: cache untouched, pending edit still ships later
    assert_eq!(h.cache.get("w1").unwrap().data["exercise"], "run");
    assert!(h.manager.has_pending("workouts", "w1"));
    assert_eq!(h.conflicts.all()[0].resolution, Some(Resolution::LocalWins));
    h.manager.destroy();
}

#[tokio::test]
async fn remote_delete_with_pending_edit_is_a_delete_conflict() {
    suppress_logs();
    let h = Harness::new();

    h.seed_with_pending_edit(workout_payload("w1", "user-1", "run", "2024-05-01T10:00:00Z"));

    h.reconciler.handle_event(delete_event("w1", "user-1"));

    // Local data is kept until someone resolves the conflict
    assert!(h.cache.get("w1").is_some());
    let unresolved = h.conflicts.unresolved();
    assert_eq!(unresolved.len(), 1);
    assert_eq!(unresolved[0].conflict_type, ConflictType::DeleteConflict);
    h.manager.destroy();
}

#[tokio::test]
async fn remote_delete_without_pending_edit_removes_the_row() {
    suppress_logs();
    let h = Harness::new();

    h.reconciler.handle_event(insert_event(
        "w1",
        "user-1",
        workout_payload("w1", "user-1", "run", "2024-05-01T10:00:00Z"),
    ));
    h.reconciler.handle_event(delete_event("w1", "user-1"));

    assert!(h.cache.is_empty());
    assert!(h.conflicts.is_empty());
    h.manager.destroy();
}

#[tokio::test]
async fn events_flow_through_a_started_repository() {
    suppress_logs();
    let backend = Arc::new(MockBackend::new());
    let options = SyncOptions {
        principal: "user-1".to_string(),
        table: "workouts".to_string(),
        ..Default::default()
    };
    let repository = Repository::new(
        options,
        backend.clone(),
        memory_storage(),
        Arc::new(NetworkMonitor::new(false)),
    )
    .unwrap();
    repository.start().await.unwrap();
    assert_eq!(backend.subscriber_count(), 1);

    let mut stream = repository.subscribe();
    backend.emit(insert_event(
        "w1",
        "user-1",
        workout_payload("w1", "user-1", "run", "2024-05-01T10:00:00Z"),
    ));
    // Feed delivery is asynchronous
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(repository.get_all().len(), 1);
    assert!(stream.try_next().is_some());

    // A foreign-principal event changes nothing
    backend.emit(insert_event(
        "w2",
        "mallory",
        workout_payload("w2", "mallory", "run", "2024-05-01T10:00:00Z"),
    ));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(repository.get_all().len(), 1);

    repository.shutdown();
}
