//! Reconciliation jobs, items and the append-only history ledger.
//!
//! Versioned writes compare the stored `version` inside an immediate
//! transaction. An item change and its history row commit together or not
//! at all.

use std::sync::Arc;

use async_trait::async_trait;
use rusqlite::{params, OptionalExtension, Row, TransactionBehavior};
use tillsync_core::ReconciliationRepository;
use tillsync_domain::{
    JobStatus, ReconciliationHistory, ReconciliationItem, ReconciliationItemStatus, ReconciliationJob,
    Result, TillSyncError,
};
use tokio::task;

use super::manager::DbManager;
use super::pool::SqliteConnection;
use super::support::{
    get_enum, get_json, get_opt_enum, get_opt_json, get_opt_timestamp, get_timestamp,
    map_sql_error, opt_json_text, opt_millis, to_json_text, to_millis,
};
use crate::errors::map_join_error;

pub struct SqliteReconciliationRepository {
    db: Arc<DbManager>,
}

impl SqliteReconciliationRepository {
    pub fn new(db: Arc<DbManager>) -> Self {
        Self { db }
    }

    async fn run_blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut SqliteConnection) -> Result<T> + Send + 'static,
    {
        let db = Arc::clone(&self.db);
        task::spawn_blocking(move || -> Result<T> {
            let mut conn = db.get_connection()?;
            f(&mut conn)
        })
        .await
        .map_err(map_join_error)?
    }
}

#[async_trait]
impl ReconciliationRepository for SqliteReconciliationRepository {
    async fn insert_job(&self, job: &ReconciliationJob) -> Result<()> {
        let job = job.clone();
        self.run_blocking(move |conn| {
            conn.execute(
                JOB_INSERT_SQL,
                params![
                    job.id,
                    job.job_type.as_str(),
                    job.status.as_str(),
                    job.file_upload_id,
                    to_millis(job.created_at),
                    opt_millis(job.completed_at),
                    job.created_by,
                    job.store_id,
                    to_json_text(&job.metadata)?,
                    job.version,
                ],
            )
            .map_err(map_sql_error)?;
            Ok(())
        })
        .await
    }

    async fn get_job(&self, id: &str) -> Result<Option<ReconciliationJob>> {
        let id = id.to_string();
        self.run_blocking(move |conn| {
            conn.query_row(
                &format!("SELECT {JOB_COLUMNS} FROM reconciliation_jobs WHERE id = ?1"),
                params![id],
                map_job_row,
            )
            .optional()
            .map_err(map_sql_error)
        })
        .await
    }

    async fn update_job(&self, job: &ReconciliationJob, expected_version: i64) -> Result<()> {
        let job = job.clone();
        self.run_blocking(move |conn| {
            let metadata = to_json_text(&job.metadata)?;
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(map_sql_error)?;
            let changed = tx
                .execute(
                    JOB_UPDATE_SQL,
                    params![
                        job.status.as_str(),
                        opt_millis(job.completed_at),
                        metadata,
                        job.version,
                        job.id,
                        expected_version,
                    ],
                )
                .map_err(map_sql_error)?;
            if changed == 0 {
                let stored = stored_version(&tx, "reconciliation_jobs", &job.id)?;
                return Err(version_error("job", &job.id, stored, expected_version));
            }
            tx.commit().map_err(map_sql_error)
        })
        .await
    }

    async fn list_jobs(&self, status: JobStatus) -> Result<Vec<ReconciliationJob>> {
        self.run_blocking(move |conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {JOB_COLUMNS} FROM reconciliation_jobs
                     WHERE status = ?1
                     ORDER BY created_at ASC, id ASC"
                ))
                .map_err(map_sql_error)?;
            let rows = stmt.query_map(params![status.as_str()], map_job_row).map_err(map_sql_error)?;
            rows.collect::<rusqlite::Result<Vec<_>>>().map_err(map_sql_error)
        })
        .await
    }

    async fn insert_item(&self, item: &ReconciliationItem) -> Result<()> {
        let item = item.clone();
        self.run_blocking(move |conn| {
            conn.execute(
                ITEM_INSERT_SQL,
                params![
                    item.id,
                    item.job_id,
                    item.table_name,
                    item.record_id,
                    opt_json_text(item.system_value.as_ref())?,
                    opt_json_text(item.uploaded_value.as_ref())?,
                    item.status.as_str(),
                    item.resolution.map(|r| r.as_str()),
                    opt_millis(item.resolved_at),
                    item.resolved_by,
                    item.notes,
                    item.version,
                ],
            )
            .map_err(map_sql_error)?;
            Ok(())
        })
        .await
    }

    async fn get_item(&self, id: &str) -> Result<Option<ReconciliationItem>> {
        let id = id.to_string();
        self.run_blocking(move |conn| {
            conn.query_row(
                &format!("SELECT {ITEM_COLUMNS} FROM reconciliation_items WHERE id = ?1"),
                params![id],
                map_item_row,
            )
            .optional()
            .map_err(map_sql_error)
        })
        .await
    }

    async fn list_items(
        &self,
        job_id: &str,
        status: Option<ReconciliationItemStatus>,
    ) -> Result<Vec<ReconciliationItem>> {
        let job_id = job_id.to_string();
        self.run_blocking(move |conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {ITEM_COLUMNS} FROM reconciliation_items
                     WHERE job_id = ?1 AND (?2 IS NULL OR status = ?2)
                     ORDER BY seq ASC"
                ))
                .map_err(map_sql_error)?;
            let rows = stmt
                .query_map(params![job_id, status.map(|s| s.as_str())], map_item_row)
                .map_err(map_sql_error)?;
            rows.collect::<rusqlite::Result<Vec<_>>>().map_err(map_sql_error)
        })
        .await
    }

    async fn commit_item_change(
        &self,
        item: &ReconciliationItem,
        expected_version: i64,
        history: &ReconciliationHistory,
    ) -> Result<()> {
        let item = item.clone();
        let history = history.clone();
        self.run_blocking(move |conn| {
            let previous_value = opt_json_text(history.previous_value.as_ref())?;
            let new_value = opt_json_text(history.new_value.as_ref())?;
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(map_sql_error)?;

            let changed = tx
                .execute(
                    ITEM_UPDATE_SQL,
                    params![
                        item.status.as_str(),
                        item.resolution.map(|r| r.as_str()),
                        opt_millis(item.resolved_at),
                        item.resolved_by,
                        item.notes,
                        item.version,
                        item.id,
                        expected_version,
                    ],
                )
                .map_err(map_sql_error)?;
            if changed == 0 {
                let stored = stored_version(&tx, "reconciliation_items", &item.id)?;
                return Err(version_error("item", &item.id, stored, expected_version));
            }

            tx.execute(
                HISTORY_INSERT_SQL,
                params![
                    history.id,
                    history.item_id,
                    history.action.as_str(),
                    previous_value,
                    new_value,
                    to_millis(history.performed_at),
                    history.performed_by,
                    history.store_id,
                    history.version,
                ],
            )
            .map_err(map_sql_error)?;
            tx.commit().map_err(map_sql_error)
        })
        .await
    }

    async fn list_history(&self, item_id: &str) -> Result<Vec<ReconciliationHistory>> {
        let item_id = item_id.to_string();
        self.run_blocking(move |conn| {
            let mut stmt = conn.prepare(HISTORY_SELECT_SQL).map_err(map_sql_error)?;
            let rows = stmt.query_map(params![item_id], map_history_row).map_err(map_sql_error)?;
            rows.collect::<rusqlite::Result<Vec<_>>>().map_err(map_sql_error)
        })
        .await
    }
}

fn stored_version(conn: &rusqlite::Connection, table: &str, id: &str) -> Result<Option<i64>> {
    conn.query_row(&format!("SELECT version FROM {table} WHERE id = ?1"), params![id], |row| {
        row.get(0)
    })
    .optional()
    .map_err(map_sql_error)
}

fn version_error(kind: &str, id: &str, stored: Option<i64>, expected: i64) -> TillSyncError {
    match stored {
        None => TillSyncError::NotFound(format!("{kind} {id}")),
        Some(version) => TillSyncError::Conflict(format!(
            "{kind} {id} version is {version}, expected {expected}"
        )),
    }
}

const JOB_COLUMNS: &str = "id, type, status, file_upload_id, created_at, completed_at,
        created_by, store_id, metadata, version";

const JOB_INSERT_SQL: &str = "INSERT INTO reconciliation_jobs (
        id, type, status, file_upload_id, created_at, completed_at, created_by, store_id,
        metadata, version
    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)";

const JOB_UPDATE_SQL: &str = "UPDATE reconciliation_jobs
    SET status = ?1, completed_at = ?2, metadata = ?3, version = ?4
    WHERE id = ?5 AND version = ?6";

const ITEM_COLUMNS: &str = "id, job_id, table_name, record_id, system_value, uploaded_value,
        status, resolution, resolved_at, resolved_by, notes, version";

const ITEM_INSERT_SQL: &str = "INSERT INTO reconciliation_items (
        id, job_id, table_name, record_id, system_value, uploaded_value, status, resolution,
        resolved_at, resolved_by, notes, version
    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)";

const ITEM_UPDATE_SQL: &str = "UPDATE reconciliation_items
    SET status = ?1, resolution = ?2, resolved_at = ?3, resolved_by = ?4, notes = ?5,
        version = ?6
    WHERE id = ?7 AND version = ?8";

const HISTORY_INSERT_SQL: &str = "INSERT INTO reconciliation_history (
        id, item_id, action, previous_value, new_value, performed_at, performed_by, store_id,
        version
    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)";

const HISTORY_SELECT_SQL: &str = "SELECT id, item_id, action, previous_value, new_value,
        performed_at, performed_by, store_id, version
    FROM reconciliation_history
    WHERE item_id = ?1
    ORDER BY seq ASC";

fn map_job_row(row: &Row<'_>) -> rusqlite::Result<ReconciliationJob> {
    Ok(ReconciliationJob {
        id: row.get(0)?,
        job_type: get_enum(row, 1)?,
        status: get_enum(row, 2)?,
        file_upload_id: row.get(3)?,
        created_at: get_timestamp(row, 4)?,
        completed_at: get_opt_timestamp(row, 5)?,
        created_by: row.get(6)?,
        store_id: row.get(7)?,
        metadata: get_json(row, 8)?,
        version: row.get(9)?,
    })
}

fn map_item_row(row: &Row<'_>) -> rusqlite::Result<ReconciliationItem> {
    Ok(ReconciliationItem {
        id: row.get(0)?,
        job_id: row.get(1)?,
        table_name: row.get(2)?,
        record_id: row.get(3)?,
        system_value: get_opt_json(row, 4)?,
        uploaded_value: get_opt_json(row, 5)?,
        status: get_enum(row, 6)?,
        resolution: get_opt_enum(row, 7)?,
        resolved_at: get_opt_timestamp(row, 8)?,
        resolved_by: row.get(9)?,
        notes: row.get(10)?,
        version: row.get(11)?,
    })
}

fn map_history_row(row: &Row<'_>) -> rusqlite::Result<ReconciliationHistory> {
    Ok(ReconciliationHistory {
        id: row.get(0)?,
        item_id: row.get(1)?,
        action: get_enum(row, 2)?,
        previous_value: get_opt_json(row, 3)?,
        new_value: get_opt_json(row, 4)?,
        performed_at: get_timestamp(row, 5)?,
        performed_by: row.get(6)?,
        store_id: row.get(7)?,
        version: row.get(8)?,
    })
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use serde_json::json;
    use tempfile::TempDir;
    use tillsync_domain::{HistoryAction, JobType, Resolution};

    use super::*;

    async fn setup() -> (SqliteReconciliationRepository, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let manager = Arc::new(DbManager::new(temp_dir.path().join("recon.db"), 2).unwrap());
        manager.run_migrations().unwrap();
        (SqliteReconciliationRepository::new(manager), temp_dir)
    }

    fn now() -> chrono::DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn job_updates_check_the_version() {
        let (repo, _dir) = setup().await;
        let job = ReconciliationJob::new(JobType::Inventory, "f-1", "u-1", "s-1", json!({}), now());
        repo.insert_job(&job).await.unwrap();

        let mut started = job.clone();
        started.transition(JobStatus::InProgress, now()).unwrap();
        repo.update_job(&started, 1).await.unwrap();

        let err = repo.update_job(&started, 1).await.unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(repo.get_job(&job.id).await.unwrap(), Some(started));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn item_change_and_history_commit_together() {
        let (repo, _dir) = setup().await;
        let job = ReconciliationJob::new(JobType::Inventory, "f-1", "u-1", "s-1", json!({}), now());
        repo.insert_job(&job).await.unwrap();

        let item = ReconciliationItem::new(
            job.id.clone(),
            "products",
            Some("A-1".into()),
            Some(json!({"stock": 10})),
            Some(json!({"stock": "7"})),
        );
        repo.insert_item(&item).await.unwrap();

        let mut resolved = item.clone();
        resolved.resolve(Resolution::Uploaded, "u-1", None, now()).unwrap();
        let history = ReconciliationHistory::record(
            &resolved,
            HistoryAction::Resolved,
            item.system_value.clone(),
            Some(json!({"stock": "7"})),
            "u-1",
            "s-1",
            now(),
        );
        repo.commit_item_change(&resolved, 1, &history).await.unwrap();

        let stale = ReconciliationHistory::record(
            &resolved,
            HistoryAction::Ignored,
            None,
            None,
            "u-2",
            "s-1",
            now(),
        );
        assert!(repo.commit_item_change(&resolved, 1, &stale).await.unwrap_err().is_conflict());

        assert_eq!(repo.get_item(&item.id).await.unwrap(), Some(resolved));
        assert_eq!(repo.list_history(&item.id).await.unwrap(), vec![history]);
        assert_eq!(
            repo.list_items(&job.id, Some(ReconciliationItemStatus::Pending)).await.unwrap(),
            vec![]
        );
        assert_eq!(repo.list_items(&job.id, None).await.unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn history_rows_outlive_attempts_to_delete_them() {
        let (repo, _dir) = setup().await;
        let job = ReconciliationJob::new(JobType::Inventory, "f-1", "u-1", "s-1", json!({}), now());
        repo.insert_job(&job).await.unwrap();
        let item = ReconciliationItem::new(job.id.clone(), "products", Some("A-1".into()), None, None);
        repo.insert_item(&item).await.unwrap();

        let mut ignored = item.clone();
        ignored.ignore("u-1", None, now()).unwrap();
        let history =
            ReconciliationHistory::record(&ignored, HistoryAction::Ignored, None, None, "u-1", "s-1", now());
        repo.commit_item_change(&ignored, item.version, &history).await.unwrap();

        let conn = repo.db.get_connection().unwrap();
        let refused = |sql: &str| conn.execute(sql, []).map_err(map_sql_error).unwrap_err();
        assert!(refused("DELETE FROM reconciliation_jobs").is_conflict());
        assert!(refused("DELETE FROM reconciliation_items").is_conflict());
        assert!(refused("DELETE FROM reconciliation_history").is_conflict());
        assert!(refused("UPDATE reconciliation_history SET performed_by = 'someone-else'").is_conflict());
        drop(conn);

        assert_eq!(repo.list_history(&item.id).await.unwrap(), vec![history]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn lists_jobs_by_status_oldest_first() {
        let (repo, _dir) = setup().await;
        let later = now() + chrono::Duration::minutes(5);
        let second = ReconciliationJob::new(JobType::Sales, "f-2", "u-1", "s-1", json!({}), later);
        let first = ReconciliationJob::new(JobType::Inventory, "f-1", "u-1", "s-1", json!({}), now());
        repo.insert_job(&second).await.unwrap();
        repo.insert_job(&first).await.unwrap();

        let mut running = first.clone();
        running.transition(JobStatus::InProgress, now()).unwrap();
        repo.update_job(&running, first.version).await.unwrap();

        let pending = repo.list_jobs(JobStatus::Pending).await.unwrap();
        assert_eq!(pending.iter().map(|j| j.id.as_str()).collect::<Vec<_>>(), vec![second.id.as_str()]);
        assert_eq!(repo.list_jobs(JobStatus::InProgress).await.unwrap(), vec![running]);
    }
}
