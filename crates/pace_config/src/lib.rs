//! Configuration management for PaceLog
//!
//! This crate handles loading and validating `.pacelog/config.toml`

use pace_common::{PaceError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Application data root (set programmatically, not in TOML)
    #[serde(skip)]
    pub root: PathBuf,

    /// Remote backend settings
    #[serde(default)]
    pub backend: BackendConfig,

    /// Sync engine settings
    #[serde(default)]
    pub sync: SyncConfig,

    /// Durable storage settings
    #[serde(default)]
    pub storage: StorageConfig,
}

/// Backend configuration ([backend])
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Which remote adapter to use: "cloud" or "edge"
    #[serde(default = "default_provider")]
    pub provider: String,

    /// Base URL of the remote API
    #[serde(default = "default_backend_url")]
    pub url: String,
}

fn default_provider() -> String {
    "cloud".to_string()
}
fn default_backend_url() -> String {
    "https://api.pacelog.dev".to_string()
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            url: default_backend_url(),
        }
    }
}

/// Sync configuration ([sync])
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Attempts before a queued mutation moves to the failed set
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Base delay for exponential retry backoff
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Upper bound on the retry backoff delay
    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,
}

fn default_max_attempts() -> u32 {
    5
}
fn default_backoff_base_ms() -> u64 {
    1_000
}
fn default_backoff_cap_ms() -> u64 {
    300_000
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
        }
    }
}

/// Storage configuration ([storage])
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Key under which the pending queue is stored
    #[serde(default = "default_queue_key")]
    pub queue_key: String,

    /// Key under which failed entries are stored
    #[serde(default = "default_failed_key")]
    pub failed_key: String,
}

fn default_queue_key() -> String {
    "sync/pending".to_string()
}
fn default_failed_key() -> String {
    "sync/failed".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            queue_key: default_queue_key(),
            failed_key: default_failed_key(),
        }
    }
}

impl Config {
    /// Load configuration from the application root
    pub fn load(root: &Path) -> Result<Self> {
        let config_path = root.join(".pacelog/config.toml");

        if !config_path.exists() {
            // Return default config
            return Ok(Self {
                root: root.to_path_buf(),
                backend: BackendConfig::default(),
                sync: SyncConfig::default(),
                storage: StorageConfig::default(),
            });
        }

        let content = std::fs::read_to_string(&config_path)
            .map_err(|e| PaceError::ConfigError(format!("Failed to read config: {}", e)))?;

        let mut config: Config = toml::from_str(&content)
            .map_err(|e| PaceError::ConfigError(format!("Failed to parse config: {}", e)))?;

        config.root = root.to_path_buf();
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.backend.provider != "cloud" && self.backend.provider != "edge" {
            anyhow::bail!("backend.provider must be \"cloud\" or \"edge\"");
        }
        if !self.backend.url.starts_with("http://") && !self.backend.url.starts_with("https://") {
            anyhow::bail!("backend.url must start with http:// or https://");
        }
        if self.sync.max_attempts == 0 {
            anyhow::bail!("sync.max_attempts must be at least 1");
        }
        if self.sync.backoff_base_ms == 0 {
            anyhow::bail!("sync.backoff_base_ms must be non-zero");
        }
        Ok(())
    }
}
