//! Engine options

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Options for one repository's sync engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncOptions {
    /// Authenticated principal whose data this engine syncs
    pub principal: String,

    /// Collection this repository manages
    pub table: String,

    /// Attempts before an entry moves to the failed set
    pub max_attempts: u32,

    /// Base delay for exponential retry backoff
    pub backoff_base: Duration,

    /// Upper bound on the retry backoff delay
    pub backoff_cap: Duration,

    /// Storage key for the pending queue
    pub queue_key: String,

    /// Storage key for the failed set
    pub failed_key: String,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            principal: String::new(),
            table: String::new(),
            max_attempts: 5,
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(300),
            queue_key: "sync/pending".to_string(),
            failed_key: "sync/failed".to_string(),
        }
    }
}

impl SyncOptions {
    /// Build engine options from the application config
    pub fn from_config(config: &pace_config::Config, principal: &str, table: &str) -> Self {
        Self {
            principal: principal.to_string(),
            table: table.to_string(),
            max_attempts: config.sync.max_attempts,
            backoff_base: Duration::from_millis(config.sync.backoff_base_ms),
            backoff_cap: Duration::from_millis(config.sync.backoff_cap_ms),
            queue_key: config.storage.queue_key.clone(),
            failed_key: config.storage.failed_key.clone(),
        }
    }

    /// Validate options
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.principal.is_empty() {
            anyhow::bail!("principal cannot be empty");
        }
        if self.table.is_empty() {
            anyhow::bail!("table cannot be empty");
        }
        if self.max_attempts == 0 {
            anyhow::bail!("max_attempts must be at least 1");
        }
        if self.backoff_base.is_zero() {
            anyhow::bail!("backoff_base must be non-zero");
        }
        if self.queue_key.is_empty() || self.failed_key.is_empty() {
            anyhow::bail!("storage keys cannot be empty");
        }
        if self.queue_key == self.failed_key {
            anyhow::bail!("queue_key and failed_key must differ");
        }
        Ok(())
    }
}
