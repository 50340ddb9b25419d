//! Append-only sync analytics.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Row};
use tillsync_core::AnalyticsRepository;
use tillsync_domain::{Result, SyncAnalytics};
use tokio::task;

use super::manager::DbManager;
use super::support::{
    get_enum, get_json, get_timestamp, get_u64, map_sql_error, to_json_text, to_millis,
    u64_to_i64,
};
use crate::errors::map_join_error;

pub struct SqliteAnalyticsRepository {
    db: Arc<DbManager>,
}

impl SqliteAnalyticsRepository {
    pub fn new(db: Arc<DbManager>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl AnalyticsRepository for SqliteAnalyticsRepository {
    async fn append(&self, record: &SyncAnalytics) -> Result<()> {
        let db = Arc::clone(&self.db);
        let r = record.clone();

        task::spawn_blocking(move || -> Result<()> {
            let network_info = to_json_text(&r.network_info)?;
            let error_details = to_json_text(&r.error_details)?;
            let conn = db.get_connection()?;
            conn.execute(
                ANALYTICS_INSERT_SQL,
                params![
                    r.id,
                    r.sync_type.as_str(),
                    r.operation_count,
                    r.success_count,
                    r.error_count,
                    u64_to_i64(r.total_time_ms),
                    r.avg_operation_time_ms,
                    network_info,
                    error_details,
                    r.interrupted,
                    to_millis(r.recorded_at),
                ],
            )
            .map_err(map_sql_error)?;
            Ok(())
        })
        .await
        .map_err(map_join_error)?
    }

    async fn list_since(&self, since: DateTime<Utc>) -> Result<Vec<SyncAnalytics>> {
        let db = Arc::clone(&self.db);

        task::spawn_blocking(move || -> Result<Vec<SyncAnalytics>> {
            let conn = db.get_connection()?;
            let mut stmt = conn.prepare(ANALYTICS_SINCE_SQL).map_err(map_sql_error)?;
            let rows = stmt
                .query_map(params![to_millis(since)], map_analytics_row)
                .map_err(map_sql_error)?;
            rows.collect::<rusqlite::Result<Vec<_>>>().map_err(map_sql_error)
        })
        .await
        .map_err(map_join_error)?
    }
}

const ANALYTICS_INSERT_SQL: &str = "INSERT INTO sync_analytics (
        id, sync_type, operation_count, success_count, error_count, total_time_ms,
        avg_operation_time_ms, network_info, error_details, interrupted, recorded_at
    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)";

const ANALYTICS_SINCE_SQL: &str = "SELECT id, sync_type, operation_count, success_count,
        error_count, total_time_ms, avg_operation_time_ms, network_info, error_details,
        interrupted, recorded_at
    FROM sync_analytics
    WHERE recorded_at >= ?1
    ORDER BY recorded_at ASC, id ASC";

fn map_analytics_row(row: &Row<'_>) -> rusqlite::Result<SyncAnalytics> {
    Ok(SyncAnalytics {
        id: row.get(0)?,
        sync_type: get_enum(row, 1)?,
        operation_count: row.get(2)?,
        success_count: row.get(3)?,
        error_count: row.get(4)?,
        total_time_ms: get_u64(row, 5)?,
        avg_operation_time_ms: row.get(6)?,
        network_info: get_json(row, 7)?,
        error_details: get_json(row, 8)?,
        interrupted: row.get(9)?,
        recorded_at: get_timestamp(row, 10)?,
    })
}
