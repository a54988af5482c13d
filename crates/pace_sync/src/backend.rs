//! Remote backend adapter contract

use async_trait::async_trait;
use pace_common::ChangeEvent;
use serde_json::Value;
use tokio::sync::mpsc;

/// Errors surfaced by a remote backend adapter
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("Backend unreachable: {0}")]
    Unreachable(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Server error: {0}")]
    Server(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Payload rejected: {0}")]
    Rejected(String),

    #[error("Subscription closed")]
    SubscriptionClosed,
}

impl BackendError {
    /// Permanent failures are never retried; the entry moves to the failed set
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            BackendError::Unauthorized(_) | BackendError::Rejected(_)
        )
    }
}

/// Uniform contract over the interchangeable remote backends
///
/// Adapters authenticate on construction and act on named collections on
/// behalf of the signed-in principal. Timeouts are the adapter's concern;
/// the sync manager treats a timeout like any other transient failure.
#[async_trait]
pub trait RemoteBackend: Send + Sync {
    /// Create a record; returns the id the backend stored it under
    async fn create(&self, table: &str, record: &Value) -> Result<String, BackendError>;

    /// Apply a patch to an existing record
    async fn update(&self, table: &str, record_id: &str, patch: &Value)
        -> Result<(), BackendError>;

    /// Delete a record
    async fn delete(&self, table: &str, record_id: &str) -> Result<(), BackendError>;

    /// Live change feed for one collection, scoped to a principal
    async fn subscribe(
        &self,
        table: &str,
        principal: &str,
    ) -> Result<mpsc::UnboundedReceiver<ChangeEvent>, BackendError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permanent_classification() {
        assert!(BackendError::Unauthorized("expired token".to_string()).is_permanent());
        assert!(BackendError::Rejected("missing field".to_string()).is_permanent());

        assert!(!BackendError::Timeout.is_permanent());
        assert!(!BackendError::Unreachable("dns".to_string()).is_permanent());
        assert!(!BackendError::Server("503".to_string()).is_permanent());
    }
}
