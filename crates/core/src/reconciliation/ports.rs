//! Port interfaces for reconciliation

use async_trait::async_trait;
use serde_json::Value;
use tillsync_domain::{
    JobStatus, ReconciliationHistory, ReconciliationItem, ReconciliationItemStatus, ReconciliationJob, Result,
};

/// Job, item and history tables
///
/// Versioned writes are compare-and-swap: the stored row must still carry
/// `expected_version`, otherwise the call fails with `Conflict` and nothing
/// is written.
#[async_trait]
pub trait ReconciliationRepository: Send + Sync {
    async fn insert_job(&self, job: &ReconciliationJob) -> Result<()>;

    async fn get_job(&self, id: &str) -> Result<Option<ReconciliationJob>>;

    async fn update_job(&self, job: &ReconciliationJob, expected_version: i64) -> Result<()>;

    /// Jobs in `status`, oldest first.
    async fn list_jobs(&self, status: JobStatus) -> Result<Vec<ReconciliationJob>>;

    async fn insert_item(&self, item: &ReconciliationItem) -> Result<()>;

    async fn get_item(&self, id: &str) -> Result<Option<ReconciliationItem>>;

    /// Items of a job in discovery order, optionally filtered by status.
    async fn list_items(
        &self,
        job_id: &str,
        status: Option<ReconciliationItemStatus>,
    ) -> Result<Vec<ReconciliationItem>>;

    /// Write the item and append its history row in one transaction.
    async fn commit_item_change(
        &self,
        item: &ReconciliationItem,
        expected_version: i64,
        history: &ReconciliationHistory,
    ) -> Result<()>;

    /// History of an item, oldest first.
    async fn list_history(&self, item_id: &str) -> Result<Vec<ReconciliationHistory>>;
}

/// Raw bytes of uploaded files
#[async_trait]
pub trait FileStore: Send + Sync {
    /// `NotFound` when the upload does not exist.
    async fn fetch(&self, file_upload_id: &str) -> Result<Vec<u8>>;
}

/// Live system values compared against uploads
#[async_trait]
pub trait SystemOfRecord: Send + Sync {
    /// Current record, or `None` when absent.
    async fn fetch(&self, table: &str, key: &str) -> Result<Option<Value>>;

    /// Make `value` the new system value of the record.
    async fn apply(&self, table: &str, key: &str, value: &Value) -> Result<()>;
}
