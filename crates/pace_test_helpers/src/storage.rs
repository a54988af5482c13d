//! Durable storage fixtures for tests
//!
//! Provides temporary directories and pre-wired storage backends so tests
//! exercise the same file layout the application uses.

use assert_fs::TempDir;
use pace_sync::store::{FileStorage, MemoryStorage};
use std::sync::Arc;

/// Create a temporary directory for testing
///
/// The directory is cleaned up when the `TempDir` is dropped.
pub fn temp_dir() -> TempDir {
    TempDir::new().expect("Failed to create temp directory")
}

/// File-backed storage rooted in a fresh temp directory
///
/// Keep the returned `TempDir` alive for the duration of the test.
pub fn temp_storage() -> (TempDir, Arc<FileStorage>) {
    let temp = temp_dir();
    let storage = Arc::new(FileStorage::new(temp.path().join("storage")));
    (temp, storage)
}

/// In-memory storage for tests that do not care about the filesystem
pub fn memory_storage() -> Arc<MemoryStorage> {
    Arc::new(MemoryStorage::new())
}
