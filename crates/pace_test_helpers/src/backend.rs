//! Scripted mock of the remote backend contract
//!
//! Records every call, serves scripted failures per record id, and lets
//! tests push change-feed events to whatever subscribed.

use async_trait::async_trait;
use pace_common::ChangeEvent;
use pace_sync::{BackendError, RemoteBackend};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};
use tokio::sync::mpsc;

/// One recorded backend call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendCall {
    pub op: String,
    pub table: String,
    pub record_id: String,
}

/// In-memory backend double with scripted failures
#[derive(Default)]
pub struct MockBackend {
    calls: Mutex<Vec<BackendCall>>,
    failures: Mutex<HashMap<String, VecDeque<BackendError>>>,
    feeds: Mutex<Vec<mpsc::UnboundedSender<ChangeEvent>>>,
    latency: Mutex<Option<std::time::Duration>>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the next call touching `record_id` to fail with `error`
    ///
    /// Multiple scripted failures for the same record are served in order;
    /// once the script is exhausted, calls succeed.
    pub fn fail_next(&self, record_id: &str, error: BackendError) {
        self.lock_failures()
            .entry(record_id.to_string())
            .or_default()
            .push_back(error);
    }

    /// Script `count` consecutive transient failures for `record_id`
    pub fn fail_times(&self, record_id: &str, count: usize) {
        for _ in 0..count {
            self.fail_next(record_id, BackendError::Unreachable("scripted".to_string()));
        }
    }

    /// Every call recorded so far, in order
    pub fn calls(&self) -> Vec<BackendCall> {
        self.lock_calls().clone()
    }

    /// Record ids in the order they were attempted
    pub fn attempted_ids(&self) -> Vec<String> {
        self.lock_calls()
            .iter()
            .map(|c| c.record_id.clone())
            .collect()
    }

    /// How many calls touched `record_id`
    pub fn attempt_count(&self, record_id: &str) -> usize {
        self.lock_calls()
            .iter()
            .filter(|c| c.record_id == record_id)
            .count()
    }

    /// Make every write call sleep first, so drains overlap in tests
    pub fn set_latency(&self, latency: std::time::Duration) {
        *self.latency.lock().unwrap_or_else(PoisonError::into_inner) = Some(latency);
    }

    async fn simulate_latency(&self) {
        let latency = *self.latency.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }

    /// Push a change-feed event to every live subscriber
    pub fn emit(&self, event: ChangeEvent) {
        let mut feeds = self.lock_feeds();
        feeds.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock_feeds().len()
    }

    fn record_call(&self, op: &str, table: &str, record_id: &str) {
        self.lock_calls().push(BackendCall {
            op: op.to_string(),
            table: table.to_string(),
            record_id: record_id.to_string(),
        });
    }

    fn next_failure(&self, record_id: &str) -> Option<BackendError> {
        self.lock_failures()
            .get_mut(record_id)
            .and_then(VecDeque::pop_front)
    }

    fn lock_calls(&self) -> std::sync::MutexGuard<'_, Vec<BackendCall>> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_failures(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<String, VecDeque<BackendError>>> {
        self.failures.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_feeds(&self) -> std::sync::MutexGuard<'_, Vec<mpsc::UnboundedSender<ChangeEvent>>> {
        self.feeds.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl RemoteBackend for MockBackend {
    async fn create(&self, table: &str, record: &Value) -> Result<String, BackendError> {
        let record_id = record
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();
        self.record_call("create", table, &record_id);
        self.simulate_latency().await;
        match self.next_failure(&record_id) {
            Some(error) => Err(error),
            None => Ok(record_id),
        }
    }

    async fn update(
        &self,
        table: &str,
        record_id: &str,
        _patch: &Value,
    ) -> Result<(), BackendError> {
        self.record_call("update", table, record_id);
        self.simulate_latency().await;
        match self.next_failure(record_id) {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn delete(&self, table: &str, record_id: &str) -> Result<(), BackendError> {
        self.record_call("delete", table, record_id);
        self.simulate_latency().await;
        match self.next_failure(record_id) {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn subscribe(
        &self,
        _table: &str,
        _principal: &str,
    ) -> Result<mpsc::UnboundedReceiver<ChangeEvent>, BackendError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock_feeds().push(tx);
        Ok(rx)
    }
}
