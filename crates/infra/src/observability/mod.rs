//! Tracing subscriber setup
//!
//! `RUST_LOG` takes precedence over the configured level. Installing twice
//! is not an error: the first subscriber stays and later calls report
//! `false`.

use tillsync_domain::{LoggingConfig, Result, TillSyncError};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Install the global subscriber.
///
/// Returns `true` when this call installed it.
///
/// # Errors
/// Returns `TillSyncError::Config` when the configured level is not a valid
/// filter directive.
pub fn init_tracing(config: &LoggingConfig) -> Result<bool> {
    let filter = build_filter(config)?;
    let registry = tracing_subscriber::registry().with(filter);

    let installed = if config.json {
        registry.with(fmt::layer().json().with_target(true)).try_init().is_ok()
    } else {
        registry.with(fmt::layer().with_target(true)).try_init().is_ok()
    };

    if installed {
        tracing::debug!(level = %config.level, json = config.json, "Tracing initialized");
    }
    Ok(installed)
}

fn build_filter(config: &LoggingConfig) -> Result<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(&config.level).map_err(|e| {
            TillSyncError::Config(format!("Invalid log level '{}': {e}", config.level))
        }),
    }
}
