//! Per user/device sync metadata.

use std::sync::Arc;

use async_trait::async_trait;
use rusqlite::{params, OptionalExtension, Row};
use tillsync_core::MetadataRepository;
use tillsync_domain::{DeviceInfo, Result, SyncMetadata, SyncPreferences};
use tokio::task;

use super::manager::DbManager;
use super::support::{
    get_opt_timestamp, get_timestamp, get_u64, map_sql_error, opt_millis, to_millis, u64_to_i64,
};
use crate::errors::map_join_error;

pub struct SqliteMetadataRepository {
    db: Arc<DbManager>,
}

impl SqliteMetadataRepository {
    pub fn new(db: Arc<DbManager>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl MetadataRepository for SqliteMetadataRepository {
    async fn load(&self, user_id: &str, device_id: &str) -> Result<Option<SyncMetadata>> {
        let db = Arc::clone(&self.db);
        let (user_id, device_id) = (user_id.to_string(), device_id.to_string());

        task::spawn_blocking(move || -> Result<Option<SyncMetadata>> {
            let conn = db.get_connection()?;
            conn.query_row(METADATA_SELECT_SQL, params![user_id, device_id], map_metadata_row)
                .optional()
                .map_err(map_sql_error)
        })
        .await
        .map_err(map_join_error)?
    }

    async fn save(&self, metadata: &SyncMetadata) -> Result<()> {
        let db = Arc::clone(&self.db);
        let m = metadata.clone();

        task::spawn_blocking(move || -> Result<()> {
            let conn = db.get_connection()?;
            conn.execute(
                METADATA_UPSERT_SQL,
                params![
                    m.user_id,
                    m.device_info.device_id,
                    opt_millis(m.last_sync_at),
                    opt_millis(m.last_successful_sync_at),
                    u64_to_i64(m.sync_frequency_secs),
                    m.sync_preferences.auto_sync,
                    m.sync_preferences.sync_on_metered_connection,
                    m.sync_preferences.max_retries,
                    m.device_info.platform,
                    m.device_info.browser,
                    to_millis(m.device_info.last_active),
                ],
            )
            .map_err(map_sql_error)?;
            Ok(())
        })
        .await
        .map_err(map_join_error)?
    }
}

const METADATA_SELECT_SQL: &str = "SELECT user_id, device_id, last_sync_at,
        last_successful_sync_at, sync_frequency_secs, auto_sync, sync_on_metered_connection,
        max_retries, platform, browser, last_active
    FROM sync_metadata
    WHERE user_id = ?1 AND device_id = ?2";

const METADATA_UPSERT_SQL: &str = "INSERT INTO sync_metadata (
        user_id, device_id, last_sync_at, last_successful_sync_at, sync_frequency_secs,
        auto_sync, sync_on_metered_connection, max_retries, platform, browser, last_active
    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
    ON CONFLICT (user_id, device_id) DO UPDATE SET
        last_sync_at = excluded.last_sync_at,
        last_successful_sync_at = excluded.last_successful_sync_at,
        sync_frequency_secs = excluded.sync_frequency_secs,
        auto_sync = excluded.auto_sync,
        sync_on_metered_connection = excluded.sync_on_metered_connection,
        max_retries = excluded.max_retries,
        platform = excluded.platform,
        browser = excluded.browser,
        last_active = excluded.last_active";

fn map_metadata_row(row: &Row<'_>) -> rusqlite::Result<SyncMetadata> {
    Ok(SyncMetadata {
        user_id: row.get(0)?,
        device_info: DeviceInfo {
            device_id: row.get(1)?,
            platform: row.get(8)?,
            browser: row.get(9)?,
            last_active: get_timestamp(row, 10)?,
        },
        last_sync_at: get_opt_timestamp(row, 2)?,
        last_successful_sync_at: get_opt_timestamp(row, 3)?,
        sync_frequency_secs: get_u64(row, 4)?,
        sync_preferences: SyncPreferences {
            auto_sync: row.get(5)?,
            sync_on_metered_connection: row.get(6)?,
            max_retries: row.get(7)?,
        },
    })
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use tempfile::TempDir;

    use super::*;

    #[tokio::test(flavor = "multi_thread")]
    async fn save_is_an_upsert_per_device() {
        let temp_dir = TempDir::new().unwrap();
        let manager = Arc::new(DbManager::new(temp_dir.path().join("meta.db"), 2).unwrap());
        manager.run_migrations().unwrap();
        let repo = SqliteMetadataRepository::new(manager);

        let now = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        assert!(repo.load("u-1", "d-1").await.unwrap().is_none());

        let mut metadata = SyncMetadata::new("u-1", "d-1", now);
        repo.save(&metadata).await.unwrap();

        metadata.last_sync_at = Some(now);
        metadata.sync_preferences.sync_on_metered_connection = true;
        metadata.sync_frequency_secs = 60;
        repo.save(&metadata).await.unwrap();
        repo.save(&SyncMetadata::new("u-1", "d-2", now)).await.unwrap();

        assert_eq!(repo.load("u-1", "d-1").await.unwrap(), Some(metadata));
        assert_eq!(repo.load("u-1", "d-2").await.unwrap().unwrap().last_sync_at, None);
    }
}
