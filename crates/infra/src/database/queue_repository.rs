//! SQLite-backed implementation of the durable local queue port.
//!
//! Every status transition is a compare-and-swap on the current status inside
//! an immediate transaction, so two writers can never move the same item.

use std::sync::Arc;

use async_trait::async_trait;
use rusqlite::{params, OptionalExtension, Row, TransactionBehavior};
use tillsync_core::SyncQueueRepository;
use tillsync_domain::{
    QueueCursor, QueueItemStatus, QueueStats, Result, StatusChange, SyncQueueItem, TillSyncError,
};
use tokio::task;
use tracing::debug;

use super::manager::DbManager;
use super::pool::SqliteConnection;
use super::support::{
    get_enum, get_json, get_opt_timestamp, get_timestamp, get_u64, map_sql_error, opt_millis,
    to_json_text, to_millis, usize_to_i64,
};
use crate::errors::map_join_error;

pub struct SqliteQueueRepository {
    db: Arc<DbManager>,
}

impl SqliteQueueRepository {
    pub fn new(db: Arc<DbManager>) -> Self {
        Self { db }
    }

    fn insert_item(conn: &SqliteConnection, item: &SyncQueueItem) -> Result<()> {
        let payload = to_json_text(&item.payload)?;
        conn.execute(
            QUEUE_INSERT_SQL,
            params![
                item.client_id,
                item.operation.as_str(),
                item.target_entity,
                item.record_key,
                payload,
                item.status.as_str(),
                item.retry_count,
                to_millis(item.created_at),
                opt_millis(item.last_attempt_at),
                opt_millis(item.next_attempt_at),
                item.error_detail,
            ],
        )
        .map_err(map_sql_error)?;
        Ok(())
    }

    fn fetch_one(conn: &SqliteConnection, client_id: &str) -> Result<Option<SyncQueueItem>> {
        conn.query_row(
            &format!("SELECT {QUEUE_COLUMNS} FROM sync_queue WHERE client_id = ?1"),
            params![client_id],
            map_queue_row,
        )
        .optional()
        .map_err(map_sql_error)
    }

    fn fetch_page(
        conn: &SqliteConnection,
        status: QueueItemStatus,
        after: Option<&QueueCursor>,
        limit: usize,
    ) -> Result<Vec<SyncQueueItem>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut stmt = conn.prepare(QUEUE_PAGE_SQL).map_err(map_sql_error)?;
        let rows = stmt
            .query_map(
                params![
                    status.as_str(),
                    after.map(|c| to_millis(c.created_at)),
                    after.map(|c| c.client_id.as_str()),
                    usize_to_i64(limit),
                ],
                map_queue_row,
            )
            .map_err(map_sql_error)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(map_sql_error)
    }

    fn swap_status(
        conn: &mut SqliteConnection,
        client_id: &str,
        expected: QueueItemStatus,
        change: &StatusChange,
    ) -> Result<SyncQueueItem> {
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(map_sql_error)?;

        let changed = tx
            .execute(
                &format!("{QUEUE_APPLY_CHANGE_SQL} WHERE client_id = ?6 AND status = ?7"),
                params![
                    change.status.as_str(),
                    change.retry_count,
                    opt_millis(change.last_attempt_at),
                    change.error_detail,
                    opt_millis(change.next_attempt_at),
                    client_id,
                    expected.as_str(),
                ],
            )
            .map_err(map_sql_error)?;

        if changed == 0 {
            let current: Option<String> = tx
                .query_row(
                    "SELECT status FROM sync_queue WHERE client_id = ?1",
                    params![client_id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(map_sql_error)?;
            return Err(match current {
                None => TillSyncError::NotFound(format!("queue item {client_id}")),
                Some(status) => TillSyncError::Conflict(format!(
                    "queue item {client_id} is {status}, expected {expected}"
                )),
            });
        }

        let item = tx
            .query_row(
                &format!("SELECT {QUEUE_COLUMNS} FROM sync_queue WHERE client_id = ?1"),
                params![client_id],
                map_queue_row,
            )
            .map_err(map_sql_error)?;
        tx.commit().map_err(map_sql_error)?;
        Ok(item)
    }

    fn delete_completed(conn: &SqliteConnection, client_id: &str) -> Result<()> {
        let deleted = conn
            .execute(
                "DELETE FROM sync_queue WHERE client_id = ?1 AND status = 'completed'",
                params![client_id],
            )
            .map_err(map_sql_error)?;
        if deleted == 1 {
            return Ok(());
        }

        match Self::fetch_one(conn, client_id)? {
            None => Err(TillSyncError::NotFound(format!("queue item {client_id}"))),
            Some(item) => Err(TillSyncError::Conflict(format!(
                "queue item {client_id} is {}, only completed items can be removed",
                item.status
            ))),
        }
    }

    fn reset_all_processing(conn: &SqliteConnection, error_detail: &str) -> Result<u64> {
        let change = StatusChange::rolled_back(error_detail);
        let reset = conn
            .execute(
                &format!("{QUEUE_APPLY_CHANGE_SQL} WHERE status = 'processing'"),
                params![
                    change.status.as_str(),
                    change.retry_count,
                    opt_millis(change.last_attempt_at),
                    change.error_detail,
                    opt_millis(change.next_attempt_at),
                ],
            )
            .map_err(map_sql_error)?;
        Ok(reset as u64)
    }

    fn count_by_status(conn: &SqliteConnection) -> Result<QueueStats> {
        let mut stats = QueueStats::default();
        let mut stmt = conn.prepare(QUEUE_STATS_SQL).map_err(map_sql_error)?;
        let rows = stmt
            .query_map([], |row| {
                Ok((get_enum::<QueueItemStatus>(row, 0)?, get_u64(row, 1)?, get_opt_timestamp(row, 2)?))
            })
            .map_err(map_sql_error)?;

        for row in rows {
            let (status, count, oldest) = row.map_err(map_sql_error)?;
            match status {
                QueueItemStatus::Pending => {
                    stats.pending = count;
                    stats.oldest_pending_at = oldest;
                }
                QueueItemStatus::Processing => stats.processing = count,
                QueueItemStatus::Completed => stats.completed = count,
                QueueItemStatus::Failed => stats.failed = count,
            }
        }
        Ok(stats)
    }
}

#[async_trait]
impl SyncQueueRepository for SqliteQueueRepository {
    async fn enqueue(&self, item: &SyncQueueItem) -> Result<()> {
        let db = Arc::clone(&self.db);
        let item = item.clone();

        task::spawn_blocking(move || -> Result<()> {
            let conn = db.get_connection()?;
            Self::insert_item(&conn, &item)
        })
        .await
        .map_err(map_join_error)?
    }

    async fn get(&self, client_id: &str) -> Result<Option<SyncQueueItem>> {
        let db = Arc::clone(&self.db);
        let client_id = client_id.to_string();

        task::spawn_blocking(move || -> Result<Option<SyncQueueItem>> {
            let conn = db.get_connection()?;
            Self::fetch_one(&conn, &client_id)
        })
        .await
        .map_err(map_join_error)?
    }

    async fn list_by_status(
        &self,
        status: QueueItemStatus,
        after: Option<&QueueCursor>,
        limit: usize,
    ) -> Result<Vec<SyncQueueItem>> {
        let db = Arc::clone(&self.db);
        let after = after.cloned();

        task::spawn_blocking(move || -> Result<Vec<SyncQueueItem>> {
            let conn = db.get_connection()?;
            Self::fetch_page(&conn, status, after.as_ref(), limit)
        })
        .await
        .map_err(map_join_error)?
    }

    async fn update_status(
        &self,
        client_id: &str,
        expected: QueueItemStatus,
        change: &StatusChange,
    ) -> Result<SyncQueueItem> {
        let db = Arc::clone(&self.db);
        let client_id = client_id.to_string();
        let change = change.clone();

        task::spawn_blocking(move || -> Result<SyncQueueItem> {
            let mut conn = db.get_connection()?;
            let item = Self::swap_status(&mut conn, &client_id, expected, &change)?;
            debug!(client_id = %client_id, from = %expected, to = %item.status, "queue item transitioned");
            Ok(item)
        })
        .await
        .map_err(map_join_error)?
    }

    async fn remove(&self, client_id: &str) -> Result<()> {
        let db = Arc::clone(&self.db);
        let client_id = client_id.to_string();

        task::spawn_blocking(move || -> Result<()> {
            let conn = db.get_connection()?;
            Self::delete_completed(&conn, &client_id)
        })
        .await
        .map_err(map_join_error)?
    }

    async fn reset_processing(&self, error_detail: &str) -> Result<u64> {
        let db = Arc::clone(&self.db);
        let error_detail = error_detail.to_string();

        task::spawn_blocking(move || -> Result<u64> {
            let conn = db.get_connection()?;
            Self::reset_all_processing(&conn, &error_detail)
        })
        .await
        .map_err(map_join_error)?
    }

    async fn stats(&self) -> Result<QueueStats> {
        let db = Arc::clone(&self.db);

        task::spawn_blocking(move || -> Result<QueueStats> {
            let conn = db.get_connection()?;
            Self::count_by_status(&conn)
        })
        .await
        .map_err(map_join_error)?
    }
}

const QUEUE_COLUMNS: &str = "client_id, operation, target_entity, record_key, payload, status,
        retry_count, created_at, last_attempt_at, next_attempt_at, error_detail";

const QUEUE_INSERT_SQL: &str = "INSERT INTO sync_queue (
        client_id, operation, target_entity, record_key, payload, status,
        retry_count, created_at, last_attempt_at, next_attempt_at, error_detail
    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)";

const QUEUE_PAGE_SQL: &str = "SELECT client_id, operation, target_entity, record_key, payload,
        status, retry_count, created_at, last_attempt_at, next_attempt_at, error_detail
    FROM sync_queue
    WHERE status = ?1
      AND (?2 IS NULL OR created_at > ?2 OR (created_at = ?2 AND client_id > ?3))
    ORDER BY created_at ASC, client_id ASC
    LIMIT ?4";

/// Mirrors `SyncQueueItem::apply_change`: retry count and last attempt are
/// kept when the change leaves them unset.
const QUEUE_APPLY_CHANGE_SQL: &str = "UPDATE sync_queue SET
        status = ?1,
        retry_count = COALESCE(?2, retry_count),
        last_attempt_at = COALESCE(?3, last_attempt_at),
        error_detail = ?4,
        next_attempt_at = ?5";

const QUEUE_STATS_SQL: &str = "SELECT status, COUNT(*), MIN(created_at)
    FROM sync_queue
    GROUP BY status";

fn map_queue_row(row: &Row<'_>) -> rusqlite::Result<SyncQueueItem> {
    Ok(SyncQueueItem {
        client_id: row.get(0)?,
        operation: get_enum(row, 1)?,
        target_entity: row.get(2)?,
        record_key: row.get(3)?,
        payload: get_json(row, 4)?,
        status: get_enum(row, 5)?,
        retry_count: row.get(6)?,
        created_at: get_timestamp(row, 7)?,
        last_attempt_at: get_opt_timestamp(row, 8)?,
        next_attempt_at: get_opt_timestamp(row, 9)?,
        error_detail: row.get(10)?,
    })
}
