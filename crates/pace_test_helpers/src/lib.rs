//! Shared test utilities for PaceLog test suites
//!
//! This crate provides common testing utilities to eliminate code duplication
//! across test suites and ensure consistent test environments.
//!
//! # Modules
//!
//! - [`backend`]: Scripted mock of the remote backend contract
//! - [`fixtures`]: Queue entry, payload, and change-event builders
//! - [`logging`]: Test logging configuration
//! - [`assertions`]: Domain-specific assertion helpers
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use pace_test_helpers::prelude::*;
//!
//! fn my_test() {
//!     suppress_logs();
//!
//!     let backend = Arc::new(MockBackend::new());
//!     backend.fail_next("w1", pace_sync::BackendError::Timeout);
//!     // Wire the backend into a SyncManager or Repository under test
//! }
//! ```

pub mod assertions;
pub mod backend;
pub mod fixtures;
pub mod logging;
pub mod storage;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::assertions::*;
    pub use crate::backend::{BackendCall, MockBackend};
    pub use crate::fixtures::{
        delete_event, insert_event, queue_entry, update_event, workout_payload,
    };
    pub use crate::logging::{init_test_logging, suppress_logs};
    pub use crate::storage::{memory_storage, temp_dir, temp_storage};
}
