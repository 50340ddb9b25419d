//! Configuration management

use serde::{Deserialize, Serialize};

/// Engine configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database: DatabaseConfig,
    pub sync: SyncConfig,
    pub reconciliation: ReconciliationConfig,
    pub remote: RemoteConfig,
    pub logging: LoggingConfig,
}

/// Local SQLite store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: String,
    pub pool_size: u32,
    pub busy_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { path: "tillsync.db".to_string(), pool_size: 8, busy_timeout_ms: 5_000 }
    }
}

/// Drain scheduling and retry policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Distinct records dispatched concurrently within one drain.
    pub max_workers: usize,
    pub remote_timeout_ms: u64,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Used until the device's metadata carries its own preference.
    pub default_max_retries: u32,
    /// Scheduled drain interval when no metadata exists yet.
    pub poll_interval_secs: u64,
    /// Capacity of the remote change notification channel.
    pub stats_channel_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_workers: 4,
            remote_timeout_ms: 10_000,
            backoff_base_ms: 1_000,
            backoff_max_ms: 300_000,
            default_max_retries: 3,
            poll_interval_secs: 300,
            stats_channel_capacity: 64,
        }
    }
}

/// Comparator policy and file ingestion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconciliationConfig {
    /// Absolute difference under which two numbers are considered equal.
    pub numeric_tolerance: f64,
    pub case_sensitive: bool,
    pub trim_whitespace: bool,
    /// Directory uploaded files are read from.
    pub upload_dir: String,
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            numeric_tolerance: 1e-9,
            case_sensitive: true,
            trim_whitespace: true,
            upload_dir: "uploads".to_string(),
        }
    }
}

/// Remote system of record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub base_url: String,
    #[serde(skip_serializing)]
    pub api_token: Option<String>,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self { base_url: "http://localhost:8080/api".to_string(), api_token: None }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive; `RUST_LOG` takes precedence.
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string(), json: false }
    }
}
