//! Configuration loader
//!
//! Loads engine configuration from environment variables or files.
//!
//! ## Loading Strategy
//! 1. Loads a `.env` file into the process environment when one exists
//! 2. Attempts to load from environment variables
//! 3. If required variables are missing, falls back to loading from file
//! 4. Searches the working directory and its parents for config files
//! 5. Supports JSON and TOML formats
//!
//! ## Environment Variables
//! Required:
//! - `TILLSYNC_DB_PATH`: Database file path
//! - `TILLSYNC_REMOTE_BASE_URL`: Remote system of record base URL
//!
//! Optional (defaults from [`Config::default`]):
//! - `TILLSYNC_DB_POOL_SIZE`: Connection pool size
//! - `TILLSYNC_DB_BUSY_TIMEOUT_MS`: SQLite busy timeout
//! - `TILLSYNC_API_TOKEN`: Bearer token for the remote
//! - `TILLSYNC_SYNC_MAX_WORKERS`: Records dispatched concurrently per drain
//! - `TILLSYNC_SYNC_REMOTE_TIMEOUT_MS`: Per-request remote deadline
//! - `TILLSYNC_SYNC_MAX_RETRIES`: Default retry bound
//! - `TILLSYNC_SYNC_POLL_INTERVAL`: Scheduled drain interval in seconds
//! - `TILLSYNC_UPLOAD_DIR`: Directory reconciliation uploads are read from
//! - `TILLSYNC_RECON_CASE_SENSITIVE`: Comparator case sensitivity (true/false)
//! - `TILLSYNC_LOG_LEVEL`: Default log filter
//! - `TILLSYNC_LOG_JSON`: JSON log output (true/false)
//!
//! ## File Locations
//! The loader looks for, in order, `config.json`, `config.toml`,
//! `tillsync.json` and `tillsync.toml` in the current working directory and
//! then in up to two parent directories.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use tillsync_domain::{Config, Result, TillSyncError};

const CONFIG_FILE_NAMES: [&str; 4] = ["config.json", "config.toml", "tillsync.json", "tillsync.toml"];
const PARENT_SEARCH_DEPTH: usize = 2;

/// Load configuration with automatic fallback strategy
///
/// # Errors
/// Returns `TillSyncError::Config` if neither the environment nor any
/// config file yields a valid configuration.
pub fn load() -> Result<Config> {
    match dotenvy::dotenv() {
        Ok(path) => tracing::debug!(path = %path.display(), "Loaded .env file"),
        Err(e) if e.not_found() => {}
        Err(e) => tracing::warn!(error = %e, "Ignoring unreadable .env file"),
    }

    match load_from_env() {
        Ok(config) => {
            tracing::info!("Configuration loaded from environment variables");
            Ok(config)
        }
        Err(e) => {
            tracing::debug!(error = ?e, "Failed to load from environment, trying file");
            load_from_file(None)
        }
    }
}

/// Load configuration from environment variables
///
/// # Errors
/// Returns `TillSyncError::Config` if a required variable is missing or any
/// variable has an invalid value.
pub fn load_from_env() -> Result<Config> {
    let mut config = Config::default();

    config.database.path = env_var("TILLSYNC_DB_PATH")?;
    config.remote.base_url = env_var("TILLSYNC_REMOTE_BASE_URL")?;

    if let Some(pool_size) = env_parse("TILLSYNC_DB_POOL_SIZE")? {
        config.database.pool_size = pool_size;
    }
    if let Some(busy_timeout) = env_parse("TILLSYNC_DB_BUSY_TIMEOUT_MS")? {
        config.database.busy_timeout_ms = busy_timeout;
    }
    config.remote.api_token = std::env::var("TILLSYNC_API_TOKEN").ok().filter(|t| !t.is_empty());

    if let Some(max_workers) = env_parse("TILLSYNC_SYNC_MAX_WORKERS")? {
        config.sync.max_workers = max_workers;
    }
    if let Some(timeout) = env_parse("TILLSYNC_SYNC_REMOTE_TIMEOUT_MS")? {
        config.sync.remote_timeout_ms = timeout;
    }
    if let Some(max_retries) = env_parse("TILLSYNC_SYNC_MAX_RETRIES")? {
        config.sync.default_max_retries = max_retries;
    }
    if let Some(interval) = env_parse("TILLSYNC_SYNC_POLL_INTERVAL")? {
        config.sync.poll_interval_secs = interval;
    }

    if let Ok(upload_dir) = std::env::var("TILLSYNC_UPLOAD_DIR") {
        config.reconciliation.upload_dir = upload_dir;
    }
    config.reconciliation.case_sensitive =
        env_bool("TILLSYNC_RECON_CASE_SENSITIVE", config.reconciliation.case_sensitive);

    if let Ok(level) = std::env::var("TILLSYNC_LOG_LEVEL") {
        config.logging.level = level;
    }
    config.logging.json = env_bool("TILLSYNC_LOG_JSON", config.logging.json);

    Ok(config)
}

/// Load configuration from a file
///
/// If `path` is `None`, searches the standard locations via
/// [`find_config_path`]. Format is detected by file extension.
///
/// # Errors
/// Returns `TillSyncError::Config` if the file is missing, unreadable or
/// not valid JSON/TOML.
pub fn load_from_file(path: Option<PathBuf>) -> Result<Config> {
    let config_path = match path {
        Some(p) => {
            if !p.exists() {
                return Err(TillSyncError::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            p
        }
        None => find_config_path().ok_or_else(|| {
            TillSyncError::Config("No config file found in any of the standard locations".into())
        })?,
    };

    tracing::info!(path = %config_path.display(), "Loading configuration from file");

    let contents = std::fs::read_to_string(&config_path)
        .map_err(|e| TillSyncError::Config(format!("Failed to read config file: {e}")))?;

    parse_config(&contents, &config_path)
}

fn parse_config(contents: &str, path: &Path) -> Result<Config> {
    let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("json");

    match extension {
        "toml" => toml::from_str(contents)
            .map_err(|e| TillSyncError::Config(format!("Invalid TOML format: {e}"))),
        "json" => serde_json::from_str(contents)
            .map_err(|e| TillSyncError::Config(format!("Invalid JSON format: {e}"))),
        _ => Err(TillSyncError::Config(format!("Unsupported config format: {extension}"))),
    }
}

/// Search the working directory and its parents for a config file
///
/// Returns the first existing candidate, or `None`.
pub fn find_config_path() -> Option<PathBuf> {
    let cwd = std::env::current_dir().ok()?;
    find_from(&cwd)
}

fn find_from(start: &Path) -> Option<PathBuf> {
    start
        .ancestors()
        .take(PARENT_SEARCH_DEPTH + 1)
        .flat_map(|dir| CONFIG_FILE_NAMES.iter().map(move |name| dir.join(name)))
        .find(|path| path.is_file())
}

/// Get required environment variable
fn env_var(key: &str) -> Result<String> {
    std::env::var(key)
        .map_err(|_| TillSyncError::Config(format!("Missing required environment variable: {key}")))
}

/// Parse an optional numeric environment variable
fn env_parse<T>(key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| TillSyncError::Config(format!("Invalid value for {key}: {e}"))),
        Err(_) => Ok(None),
    }
}

/// Parse boolean from environment variable
///
/// Accepts: `1`/`0`, `true`/`false`, `yes`/`no`, `on`/`off` (case-insensitive)
fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .map_or(default, |s| matches!(s.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
}
