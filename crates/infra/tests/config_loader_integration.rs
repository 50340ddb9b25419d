//! Configuration files feeding the infrastructure constructors.

use std::time::Duration;

use tempfile::TempDir;
use tillsync_domain::TillSyncError;
use tillsync_infra::config::load_from_file;
use tillsync_infra::database::DbManager;
use tillsync_infra::{HttpRemoteStore, LocalFileStore, RemoteClientConfig, SyncWorkerConfig};

#[test]
fn json_config_builds_every_adapter() {
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("till.db");
    let config_path = dir.path().join("config.json");
    std::fs::write(
        &config_path,
        serde_json::json!({
            "database": { "path": db_path, "pool_size": 2, "busy_timeout_ms": 1000 },
            "sync": { "remote_timeout_ms": 2500, "poll_interval_secs": 120 },
            "reconciliation": { "upload_dir": dir.path().join("uploads") },
            "remote": { "base_url": "https://hq.example.com/api", "api_token": "t-1" },
            "logging": { "level": "debug", "json": true }
        })
        .to_string(),
    )
    .unwrap();

    let config = load_from_file(Some(config_path)).unwrap();
    assert_eq!(config.remote.api_token.as_deref(), Some("t-1"));
    assert!(config.logging.json);

    let manager = DbManager::from_config(&config.database).unwrap();
    manager.run_migrations().unwrap();
    assert!(manager.health_check().is_ok());
    assert!(db_path.exists());

    let remote = RemoteClientConfig::from_config(&config.remote, &config.sync);
    assert_eq!(remote.timeout, Duration::from_millis(2500));
    HttpRemoteStore::new(remote).unwrap();

    let files = LocalFileStore::from_config(&config.reconciliation);
    assert_eq!(files.root(), dir.path().join("uploads"));

    let worker = SyncWorkerConfig::from_config(&config.sync);
    assert_eq!(worker.fallback_interval, Duration::from_secs(120));
}

#[test]
fn invalid_remote_url_is_a_config_error() {
    let dir = TempDir::new().unwrap();
    let config_path = dir.path().join("tillsync.toml");
    std::fs::write(&config_path, "[remote]\nbase_url = \"ftp://hq.example.com\"\n").unwrap();

    let config = load_from_file(Some(config_path)).unwrap();
    let err = HttpRemoteStore::new(RemoteClientConfig::from_config(&config.remote, &config.sync))
        .unwrap_err();
    assert!(matches!(err, TillSyncError::Config(_)));
}
