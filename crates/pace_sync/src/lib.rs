//! # PaceLog Sync Engine
//!
//! Offline-first synchronization between the local record cache and a
//! remote backend.
//!
//! ## Architecture
//!
//! - **Queue**: durable pending-mutation queue, coalesced per record
//! - **Manager**: drains the queue in priority order with retry backoff
//! - **Reconciler**: merges the remote change feed into the local cache
//! - **Conflicts**: divergences become records, auto-resolved by
//!   last-write-wins where timestamps allow, manual otherwise
//! - **Facade**: single entry point owning the materialized view
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use pace_sync::{NetworkMonitor, Repository, SyncOptions};
//! use pace_sync::store::FileStorage;
//!
//! # async fn wire(backend: Arc<dyn pace_sync::RemoteBackend>) -> pace_sync::Result<()> {
//! let options = SyncOptions {
//!     principal: "user-123".to_string(),
//!     table: "workouts".to_string(),
//!     ..Default::default()
//! };
//!
//! let storage = Arc::new(FileStorage::new(".pacelog/storage"));
//! let network = Arc::new(NetworkMonitor::new(false));
//! let repository = Repository::new(options, backend, storage, network)?;
//! repository.start().await?;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod config;
pub mod conflict;
pub mod feed;
pub mod manager;
pub mod network;
pub mod queue;
pub mod repository;
pub mod store;

pub use backend::{BackendError, RemoteBackend};
pub use config::SyncOptions;
pub use conflict::{ConflictLog, ConflictRecord, ConflictResolver, ConflictType, Resolution};
pub use feed::RealtimeReconciler;
pub use manager::{ProcessReport, SyncFailure, SyncManager, SyncStatus};
pub use network::NetworkMonitor;
pub use queue::{Operation, Priority, QueueEntry, QueueStatus};
pub use repository::{ChangeKind, RecordCache, RecordChange, RecordStream, Repository};
pub use store::{FileStorage, MemoryStorage, QueueStore, StorageBackend};

/// Common result type for sync operations
pub type Result<T> = std::result::Result<T, SyncError>;

/// Errors that can occur during sync operations
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Backend error: {0}")]
    Backend(#[from] backend::BackendError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Sync manager destroyed")]
    Destroyed,

    #[error("Configuration error: {0}")]
    Config(#[from] anyhow::Error),
}

/// Generate a random alphanumeric identifier
pub fn new_id(len: usize) -> String {
    use rand::Rng;
    rand::thread_rng()
        .sample_iter(&rand::distributions::Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}
