//! Shared fixtures for infra integration tests.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tempfile::TempDir;
use tillsync_infra::database::DbManager;

/// Temporary database with migrations applied. The directory lives as long
/// as the value.
pub struct TestDatabase {
    pub manager: Arc<DbManager>,
    path: PathBuf,
    temp_dir: TempDir,
}

impl TestDatabase {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("temp dir should be created");
        let path = temp_dir.path().join("tillsync.db");
        let manager = Arc::new(DbManager::new(&path, 4).expect("db manager should be created"));
        manager.run_migrations().expect("schema migrations should apply");
        Self { manager, path, temp_dir }
    }

    /// A second manager on the same file, as a restarted process would open.
    pub fn reopen(&self) -> Arc<DbManager> {
        let manager = Arc::new(DbManager::new(&self.path, 4).expect("db should reopen"));
        manager.run_migrations().expect("migrations are idempotent");
        manager
    }

    pub fn dir(&self) -> &Path {
        self.temp_dir.path()
    }
}

impl Default for TestDatabase {
    fn default() -> Self {
        Self::new()
    }
}
