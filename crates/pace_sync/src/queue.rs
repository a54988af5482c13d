//! Pending mutation queue model

use crate::{Result, SyncError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Remote operation a queued mutation performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

/// Processing priority; declaration order is drain order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Critical,
    High,
    Medium,
    Low,
}

/// Identifies the record a mutation targets within its collection
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordKey {
    pub table: String,
    pub record_id: String,
}

/// One pending mutation awaiting remote application
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    /// Unique within the queue, caller-assigned
    pub id: String,

    pub operation: Operation,

    /// Collection the mutation targets
    pub table: String,

    /// Domain entity identifier
    pub record_id: String,

    /// Required for create/update, absent for delete
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,

    pub priority: Priority,

    /// Mutated only by the sync manager; only ever increases
    pub attempts: u32,

    pub created_at: DateTime<Utc>,

    pub last_attempt_at: Option<DateTime<Utc>>,
}

impl QueueEntry {
    pub fn new(
        id: impl Into<String>,
        operation: Operation,
        table: impl Into<String>,
        record_id: impl Into<String>,
        payload: Option<serde_json::Value>,
        priority: Priority,
    ) -> Self {
        Self {
            id: id.into(),
            operation,
            table: table.into(),
            record_id: record_id.into(),
            payload,
            priority,
            attempts: 0,
            created_at: Utc::now(),
            last_attempt_at: None,
        }
    }

    /// Check the entry against the validation rules
    ///
    /// Rejected entries never reach the durable queue.
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(SyncError::Validation(
                "queue entry id must not be empty".to_string(),
            ));
        }
        if self.table.trim().is_empty() {
            return Err(SyncError::Validation(
                "queue entry table must not be empty".to_string(),
            ));
        }
        if self.record_id.trim().is_empty() {
            return Err(SyncError::Validation(
                "queue entry record id must not be empty".to_string(),
            ));
        }
        match self.operation {
            Operation::Create | Operation::Update if self.payload.is_none() => {
                Err(SyncError::Validation(
                    "payload is required for create and update".to_string(),
                ))
            }
            Operation::Delete if self.payload.is_some() => Err(SyncError::Validation(
                "delete entries must not carry a payload".to_string(),
            )),
            _ => Ok(()),
        }
    }

    /// The coalescing key: at most one pending entry exists per record
    pub fn record_key(&self) -> RecordKey {
        RecordKey {
            table: self.table.clone(),
            record_id: self.record_id.clone(),
        }
    }

    /// Whether the entry may be attempted now, given its backoff state
    pub fn is_eligible(&self, now: DateTime<Utc>, base: Duration, cap: Duration) -> bool {
        match self.next_eligible_at(base, cap) {
            Some(at) => at <= now,
            None => true,
        }
    }

    /// Earliest instant the entry becomes attemptable again
    ///
    /// `None` means immediately (never attempted).
    pub fn next_eligible_at(&self, base: Duration, cap: Duration) -> Option<DateTime<Utc>> {
        let last = self.last_attempt_at?;
        let delay = backoff_delay(self.attempts, base, cap);
        let delay = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX);
        last.checked_add_signed(delay)
            .or(Some(DateTime::<Utc>::MAX_UTC))
    }
}

/// Exponential backoff delay after `attempts` failed tries, capped
pub fn backoff_delay(attempts: u32, base: Duration, cap: Duration) -> Duration {
    if attempts == 0 {
        return Duration::ZERO;
    }
    let exponent = (attempts - 1).min(20);
    base.saturating_mul(2u32.saturating_pow(exponent)).min(cap)
}

/// Order entries for a drain: priority first, oldest first within a tier
pub fn sort_for_drain(entries: &mut [QueueEntry]) {
    entries.sort_by(|a, b| {
        a.priority
            .cmp(&b.priority)
            .then(a.created_at.cmp(&b.created_at))
    });
}

/// Read-only snapshot of the pending queue
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueStatus {
    pub total_pending: usize,
    pub critical: usize,
    pub high: usize,
    pub medium: usize,
    pub low: usize,
    pub oldest_pending: Option<DateTime<Utc>>,
}

impl QueueStatus {
    pub fn from_entries<'a>(entries: impl Iterator<Item = &'a QueueEntry>) -> Self {
        let mut status = Self::default();
        for entry in entries {
            status.total_pending += 1;
            match entry.priority {
                Priority::Critical => status.critical += 1,
                Priority::High => status.high += 1,
                Priority::Medium => status.medium += 1,
                Priority::Low => status.low += 1,
            }
            status.oldest_pending = match status.oldest_pending {
                Some(oldest) => Some(oldest.min(entry.created_at)),
                None => Some(entry.created_at),
            };
        }
        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str, operation: Operation, priority: Priority) -> QueueEntry {
        let payload = match operation {
            Operation::Delete => None,
            _ => Some(serde_json::json!({"exercise": "run"})),
        };
        QueueEntry::new(id, operation, "workouts", id, payload, priority)
    }

    #[test]
    fn test_validation_rejects_blank_fields() {
        let mut e = entry("w1", Operation::Create, Priority::Medium);
        e.id = "  ".to_string();
        assert!(e.validate().is_err());

        let mut e = entry("w1", Operation::Create, Priority::Medium);
        e.table = String::new();
        assert!(e.validate().is_err());

        let mut e = entry("w1", Operation::Create, Priority::Medium);
        e.record_id = String::new();
        assert!(e.validate().is_err());
    }

    #[test]
    fn test_validation_requires_payload_for_update() {
        let mut e = entry("w1", Operation::Update, Priority::Medium);
        e.payload = None;
        assert!(e.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_payload_on_delete() {
        let mut e = entry("w1", Operation::Delete, Priority::Medium);
        e.payload = Some(serde_json::json!({}));
        assert!(e.validate().is_err());

        let e = entry("w1", Operation::Delete, Priority::Medium);
        assert!(e.validate().is_ok());
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let base = Duration::from_secs(1);
        let cap = Duration::from_secs(60);

        assert_eq!(backoff_delay(0, base, cap), Duration::ZERO);
        assert_eq!(backoff_delay(1, base, cap), Duration::from_secs(1));
        assert_eq!(backoff_delay(2, base, cap), Duration::from_secs(2));
        assert_eq!(backoff_delay(4, base, cap), Duration::from_secs(8));
        assert_eq!(backoff_delay(10, base, cap), cap);
        assert_eq!(backoff_delay(u32::MAX, base, cap), cap);
    }

    #[test]
    fn test_eligibility_follows_backoff() {
        let base = Duration::from_secs(10);
        let cap = Duration::from_secs(600);
        let now = Utc::now();

        let mut e = entry("w1", Operation::Create, Priority::Medium);
        assert!(e.is_eligible(now, base, cap));

        e.attempts = 1;
        e.last_attempt_at = Some(now);
        assert!(!e.is_eligible(now, base, cap));
        assert!(e.is_eligible(now + chrono::Duration::seconds(11), base, cap));
    }

    #[test]
    fn test_drain_order_priority_then_age() {
        let mut a = entry("a", Operation::Create, Priority::High);
        let mut b = entry("b", Operation::Create, Priority::Critical);
        let mut c = entry("c", Operation::Create, Priority::High);
        a.created_at = Utc::now() - chrono::Duration::seconds(30);
        b.created_at = Utc::now() - chrono::Duration::seconds(20);
        c.created_at = Utc::now() - chrono::Duration::seconds(10);

        let mut entries = vec![a, b, c];
        sort_for_drain(&mut entries);

        let ids: Vec<&str> = entries.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a", "c"]);
    }

    #[test]
    fn test_status_counts_by_priority() {
        let entries = vec![
            entry("a", Operation::Create, Priority::Critical),
            entry("b", Operation::Update, Priority::Low),
            entry("c", Operation::Delete, Priority::Low),
        ];
        let status = QueueStatus::from_entries(entries.iter());

        assert_eq!(status.total_pending, 3);
        assert_eq!(status.critical, 1);
        assert_eq!(status.low, 2);
        assert_eq!(status.high, 0);
        assert!(status.oldest_pending.is_some());
    }
}
