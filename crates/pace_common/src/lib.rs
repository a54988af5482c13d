//! Common types and errors for PaceLog
//!
//! This crate provides shared data structures used across all PaceLog components.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Core error types for PaceLog operations
#[derive(Error, Debug)]
pub enum PaceError {
    #[error("Invalid input: {0}")]
    ValidationError(String),

    #[error("Invalid configuration: {0}")]
    ConfigError(String),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, PaceError>;

/// One cached domain record of the materialized view
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Record {
    /// Record identifier within its collection
    pub id: String,

    /// Owning principal (authenticated user id)
    pub owner_id: String,

    /// Opaque payload as stored by the backend
    pub data: serde_json::Value,

    /// Modification timestamp extracted from the payload, if present
    pub updated_at: Option<DateTime<Utc>>,
}

impl Record {
    /// Build a record from its parts, extracting `updated_at` from the payload
    pub fn new(
        id: impl Into<String>,
        owner_id: impl Into<String>,
        data: serde_json::Value,
    ) -> Self {
        let updated_at = modified_at(&data);
        Self {
            id: id.into(),
            owner_id: owner_id.into(),
            data,
            updated_at,
        }
    }
}

/// Change-feed event kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeEventType {
    Insert,
    Update,
    Delete,
}

/// A single change-feed event pushed by the remote backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub event_type: ChangeEventType,

    /// Collection the affected row lives in
    pub table: String,

    pub record_id: String,

    /// Principal that owns the affected row
    pub owner_id: String,

    /// New row contents; absent for deletes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

/// Extract the modification timestamp carried inside a payload.
///
/// Both backends stamp rows with `updated_at`, one as an RFC 3339 string,
/// the other as unix epoch milliseconds.
pub fn modified_at(payload: &serde_json::Value) -> Option<DateTime<Utc>> {
    match payload.get("updated_at")? {
        serde_json::Value::String(raw) => DateTime::parse_from_rfc3339(raw)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        serde_json::Value::Number(raw) => {
            let millis = raw.as_i64()?;
            Utc.timestamp_millis_opt(millis).single()
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_modified_at_rfc3339() {
        let payload = serde_json::json!({"updated_at": "2024-05-01T10:30:00Z"});
        let ts = modified_at(&payload).unwrap();
        assert_eq!(ts.timestamp(), 1_714_559_400);
    }

    #[test]
    fn test_modified_at_epoch_millis() {
        let payload = serde_json::json!({"updated_at": 1_714_559_400_000i64});
        let ts = modified_at(&payload).unwrap();
        assert_eq!(ts.timestamp(), 1_714_559_400);
    }

    #[test]
    fn test_modified_at_missing_or_malformed() {
        assert!(modified_at(&serde_json::json!({})).is_none());
        assert!(modified_at(&serde_json::json!({"updated_at": true})).is_none());
        assert!(modified_at(&serde_json::json!({"updated_at": "yesterday"})).is_none());
    }

    #[test]
    fn test_record_extracts_timestamp() {
        let record = Record::new(
            "w1",
            "user-1",
            serde_json::json!({"exercise": "run", "updated_at": "2024-05-01T10:30:00Z"}),
        );
        assert!(record.updated_at.is_some());

        let record = Record::new("w2", "user-1", serde_json::json!({"exercise": "row"}));
        assert!(record.updated_at.is_none());
    }
}
