//! SQLite connection pool
//!
//! r2d2 pool over `r2d2_sqlite`, with per-connection pragmas applied in the
//! init hook so every pooled connection behaves the same.

use std::path::Path;
use std::time::Duration;

use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;
use tillsync_domain::{Result, TillSyncError};
use tracing::{info, instrument, warn};

pub type SqlitePool = Pool<SqliteConnectionManager>;
pub type SqliteConnection = PooledConnection<SqliteConnectionManager>;

/// Pool sizing and lock handling.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_size: u32,
    pub busy_timeout: Duration,
    pub connection_timeout: Duration,
    pub enable_wal: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: 8,
            busy_timeout: Duration::from_millis(5_000),
            connection_timeout: Duration::from_secs(30),
            enable_wal: true,
        }
    }
}

/// Open (creating if needed) the database at `path` behind a pool.
#[instrument(skip(config), fields(db_path = ?path, pool_size = config.max_size))]
pub fn create_pool(path: &Path, config: &PoolConfig) -> Result<SqlitePool> {
    let pragmas = config.clone();
    let manager = SqliteConnectionManager::file(path)
        .with_init(move |conn| apply_connection_pragmas(conn, &pragmas));

    let pool = Pool::builder()
        .max_size(config.max_size.max(1))
        .connection_timeout(config.connection_timeout)
        .build(manager)
        .map_err(|e| {
            warn!(error = %e, "failed to create connection pool");
            TillSyncError::Database(format!("failed to create pool: {e}"))
        })?;

    info!("sqlite pool created");
    Ok(pool)
}

/// WAL for concurrent readers during a drain, `synchronous=FULL` so a
/// committed enqueue survives power loss, enforced foreign keys, and a busy
/// timeout so writers wait instead of failing on lock contention.
pub fn apply_connection_pragmas(conn: &mut Connection, config: &PoolConfig) -> rusqlite::Result<()> {
    let mut pragma_sql = String::new();
    if config.enable_wal {
        pragma_sql.push_str("PRAGMA journal_mode=WAL;\n");
    }
    pragma_sql.push_str("PRAGMA synchronous=FULL;\n");
    pragma_sql.push_str("PRAGMA foreign_keys=ON;\n");
    conn.execute_batch(&pragma_sql)?;
    conn.busy_timeout(config.busy_timeout)
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn pooled_connections_carry_pragmas() {
        let temp_dir = TempDir::new().unwrap();
        let pool = create_pool(&temp_dir.path().join("test.db"), &PoolConfig::default()).unwrap();

        let conn = pool.get().unwrap();
        let journal_mode: String =
            conn.pragma_query_value(None, "journal_mode", |row| row.get(0)).unwrap();
        assert_eq!(journal_mode.to_lowercase(), "wal");
        let foreign_keys: i64 =
            conn.pragma_query_value(None, "foreign_keys", |row| row.get(0)).unwrap();
        assert_eq!(foreign_keys, 1);
        let synchronous: i64 =
            conn.pragma_query_value(None, "synchronous", |row| row.get(0)).unwrap();
        assert_eq!(synchronous, 2, "commits must be fsynced before returning");
    }
}
