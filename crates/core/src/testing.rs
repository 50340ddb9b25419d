//! In-memory port implementations for tests
//!
//! Every storage and remote seam has a fake here so engine and processor
//! tests run without SQLite or HTTP. Enabled for downstream crates through
//! the `test-utils` feature.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use tillsync_domain::{
    IdentityContext, JobStatus, QueueCursor, QueueItemStatus, QueueOperation, QueueStats,
    ReconciliationHistory, ReconciliationItem, ReconciliationItemStatus, ReconciliationJob, Result,
    StatusChange, SyncAnalytics, SyncMetadata, SyncQueueItem, TillSyncError,
};
use tokio::sync::Semaphore;

use crate::reconciliation::ports::{FileStore, ReconciliationRepository, SystemOfRecord};
use crate::sync::errors::SyncError;
use crate::sync::ports::{
    AnalyticsRepository, MetadataRepository, RemoteAck, RemoteStore, RemoteWrite,
    SyncQueueRepository,
};

fn storage_failure() -> TillSyncError {
    TillSyncError::Database("simulated storage failure".into())
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct InMemoryQueue {
    items: Mutex<BTreeMap<String, SyncQueueItem>>,
    failing: AtomicBool,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail with a database error.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Insert a row verbatim, bypassing `enqueue` validation.
    pub fn insert_raw(&self, item: SyncQueueItem) {
        self.items.lock().insert(item.client_id.clone(), item);
    }

    pub fn snapshot(&self) -> Vec<SyncQueueItem> {
        let mut items: Vec<_> = self.items.lock().values().cloned().collect();
        items.sort_by(|a, b| {
            a.created_at.cmp(&b.created_at).then_with(|| a.client_id.cmp(&b.client_id))
        });
        items
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    fn check_writable(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            Err(storage_failure())
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl SyncQueueRepository for InMemoryQueue {
    async fn enqueue(&self, item: &SyncQueueItem) -> Result<()> {
        self.check_writable()?;
        let mut items = self.items.lock();
        if items.contains_key(&item.client_id) {
            return Err(TillSyncError::Conflict(format!("duplicate client id {}", item.client_id)));
        }
        items.insert(item.client_id.clone(), item.clone());
        Ok(())
    }

    async fn get(&self, client_id: &str) -> Result<Option<SyncQueueItem>> {
        Ok(self.items.lock().get(client_id).cloned())
    }

    async fn list_by_status(
        &self,
        status: QueueItemStatus,
        after: Option<&QueueCursor>,
        limit: usize,
    ) -> Result<Vec<SyncQueueItem>> {
        Ok(self
            .snapshot()
            .into_iter()
            .filter(|item| item.status == status)
            .filter(|item| {
                after.map_or(true, |cursor| {
                    (item.created_at, item.client_id.as_str())
                        > (cursor.created_at, cursor.client_id.as_str())
                })
            })
            .take(limit)
            .collect())
    }

    async fn update_status(
        &self,
        client_id: &str,
        expected: QueueItemStatus,
        change: &StatusChange,
    ) -> Result<SyncQueueItem> {
        self.check_writable()?;
        let mut items = self.items.lock();
        let item = items
            .get_mut(client_id)
            .ok_or_else(|| TillSyncError::NotFound(format!("queue item {client_id}")))?;
        if item.status != expected {
            return Err(TillSyncError::Conflict(format!(
                "queue item {client_id} is {}, expected {expected}",
                item.status
            )));
        }
        item.apply_change(change);
        Ok(item.clone())
    }

    async fn remove(&self, client_id: &str) -> Result<()> {
        self.check_writable()?;
        let mut items = self.items.lock();
        match items.get(client_id).map(|item| item.status) {
            None => Err(TillSyncError::NotFound(format!("queue item {client_id}"))),
            Some(QueueItemStatus::Completed) => {
                items.remove(client_id);
                Ok(())
            }
            Some(status) => Err(TillSyncError::Conflict(format!(
                "queue item {client_id} is {status}, only completed items can be removed"
            ))),
        }
    }

    async fn reset_processing(&self, error_detail: &str) -> Result<u64> {
        self.check_writable()?;
        let mut reset = 0;
        for item in self.items.lock().values_mut() {
            if item.status == QueueItemStatus::Processing {
                item.apply_change(&StatusChange::rolled_back(error_detail));
                reset += 1;
            }
        }
        Ok(reset)
    }

    async fn stats(&self) -> Result<QueueStats> {
        let mut stats = QueueStats::default();
        for item in self.items.lock().values() {
            match item.status {
                QueueItemStatus::Pending => {
                    stats.pending += 1;
                    if stats.oldest_pending_at.map_or(true, |at| item.created_at < at) {
                        stats.oldest_pending_at = Some(item.created_at);
                    }
                }
                QueueItemStatus::Processing => stats.processing += 1,
                QueueItemStatus::Completed => stats.completed += 1,
                QueueItemStatus::Failed => stats.failed += 1,
            }
        }
        Ok(stats)
    }
}

// ---------------------------------------------------------------------------
// Remote store
// ---------------------------------------------------------------------------

/// Idempotent remote store with scripted failures and an optional gate that
/// holds calls until released.
#[derive(Debug, Default)]
pub struct ScriptedRemote {
    records: Mutex<HashMap<(String, String), Value>>,
    applied_keys: Mutex<HashSet<String>>,
    applied_order: Mutex<Vec<String>>,
    calls: Mutex<Vec<RemoteWrite>>,
    scripted: Mutex<HashMap<String, VecDeque<SyncError>>>,
    always: Mutex<Option<SyncError>>,
    gate: Mutex<Option<Arc<Semaphore>>>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl ScriptedRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next calls for `client_id` with `errors`, in order.
    pub fn fail_next(&self, client_id: &str, errors: impl IntoIterator<Item = SyncError>) {
        self.scripted.lock().entry(client_id.to_string()).or_default().extend(errors);
    }

    /// Fail every call with `error` until cleared with `None`.
    pub fn fail_always(&self, error: Option<SyncError>) {
        *self.always.lock() = error;
    }

    /// Hold every call until [`ScriptedRemote::release`] hands out permits.
    pub fn hold(&self) {
        *self.gate.lock() = Some(Arc::new(Semaphore::new(0)));
    }

    pub fn release(&self, calls: usize) {
        if let Some(gate) = self.gate.lock().as_ref() {
            gate.add_permits(calls);
        }
    }

    /// Remove the gate and let everything through.
    pub fn open(&self) {
        if let Some(gate) = self.gate.lock().take() {
            gate.add_permits(Semaphore::MAX_PERMITS / 2);
        }
    }

    pub fn record(&self, entity: &str, key: &str) -> Option<Value> {
        self.records.lock().get(&(entity.to_string(), key.to_string())).cloned()
    }

    pub fn record_count(&self) -> usize {
        self.records.lock().len()
    }

    pub fn calls(&self) -> Vec<RemoteWrite> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Client ids in the order they were applied (replays excluded).
    pub fn applied_order(&self) -> Vec<String> {
        self.applied_order.lock().clone()
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    /// Yield until at least `count` calls have arrived.
    pub async fn wait_for_calls(&self, count: usize) {
        while self.call_count() < count {
            tokio::task::yield_now().await;
        }
    }

    fn apply(&self, write: &RemoteWrite) -> RemoteAck {
        if !self.applied_keys.lock().insert(write.client_id.clone()) {
            return RemoteAck { applied: false };
        }
        self.applied_order.lock().push(write.client_id.clone());

        let key = (write.target_entity.clone(), write.record_key.clone());
        let mut records = self.records.lock();
        match write.operation {
            QueueOperation::Delete => {
                records.remove(&key);
            }
            QueueOperation::Create => {
                records.insert(key, write.payload.clone());
            }
            QueueOperation::Update => {
                let record = records.entry(key).or_insert_with(|| Value::Object(Default::default()));
                match (record, &write.payload) {
                    (Value::Object(current), Value::Object(patch)) => {
                        for (field, value) in patch {
                            current.insert(field.clone(), value.clone());
                        }
                    }
                    (record, payload) => *record = payload.clone(),
                }
            }
        }
        RemoteAck { applied: true }
    }
}

#[async_trait]
impl RemoteStore for ScriptedRemote {
    async fn upsert(
        &self,
        _identity: &IdentityContext,
        write: &RemoteWrite,
    ) -> std::result::Result<RemoteAck, SyncError> {
        self.calls.lock().push(write.clone());
        let now_in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now_in_flight, Ordering::SeqCst);

        let gate = self.gate.lock().clone();
        if let Some(gate) = gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }

        let scripted = self.scripted.lock().get_mut(&write.client_id).and_then(VecDeque::pop_front);
        let always = self.always.lock().clone();
        let result = match scripted.or(always) {
            Some(error) => Err(error),
            None => Ok(self.apply(write)),
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

// ---------------------------------------------------------------------------
// Metadata and analytics
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct InMemoryMetadata {
    rows: Mutex<HashMap<(String, String), SyncMetadata>>,
}

impl InMemoryMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, user_id: &str, device_id: &str) -> Option<SyncMetadata> {
        self.rows.lock().get(&(user_id.to_string(), device_id.to_string())).cloned()
    }
}

#[async_trait]
impl MetadataRepository for InMemoryMetadata {
    async fn load(&self, user_id: &str, device_id: &str) -> Result<Option<SyncMetadata>> {
        Ok(self.get(user_id, device_id))
    }

    async fn save(&self, metadata: &SyncMetadata) -> Result<()> {
        self.rows.lock().insert(
            (metadata.user_id.clone(), metadata.device_info.device_id.clone()),
            metadata.clone(),
        );
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct InMemoryAnalytics {
    rows: Mutex<Vec<SyncAnalytics>>,
}

impl InMemoryAnalytics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rows(&self) -> Vec<SyncAnalytics> {
        self.rows.lock().clone()
    }
}

#[async_trait]
impl AnalyticsRepository for InMemoryAnalytics {
    async fn append(&self, record: &SyncAnalytics) -> Result<()> {
        self.rows.lock().push(record.clone());
        Ok(())
    }

    async fn list_since(&self, since: DateTime<Utc>) -> Result<Vec<SyncAnalytics>> {
        Ok(self.rows.lock().iter().filter(|r| r.recorded_at >= since).cloned().collect())
    }
}

// ---------------------------------------------------------------------------
// Reconciliation
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct InMemoryReconciliation {
    jobs: Mutex<HashMap<String, ReconciliationJob>>,
    items: Mutex<Vec<ReconciliationItem>>,
    history: Mutex<Vec<ReconciliationHistory>>,
}

impl InMemoryReconciliation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all_history(&self) -> Vec<ReconciliationHistory> {
        self.history.lock().clone()
    }
}

#[async_trait]
impl ReconciliationRepository for InMemoryReconciliation {
    async fn insert_job(&self, job: &ReconciliationJob) -> Result<()> {
        self.jobs.lock().insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn get_job(&self, id: &str) -> Result<Option<ReconciliationJob>> {
        Ok(self.jobs.lock().get(id).cloned())
    }

    async fn update_job(&self, job: &ReconciliationJob, expected_version: i64) -> Result<()> {
        let mut jobs = self.jobs.lock();
        let stored = jobs
            .get_mut(&job.id)
            .ok_or_else(|| TillSyncError::NotFound(format!("job {}", job.id)))?;
        if stored.version != expected_version {
            return Err(TillSyncError::Conflict(format!(
                "job {} version is {}, expected {expected_version}",
                job.id, stored.version
            )));
        }
        *stored = job.clone();
        Ok(())
    }

    async fn list_jobs(&self, status: JobStatus) -> Result<Vec<ReconciliationJob>> {
        let mut jobs: Vec<_> =
            self.jobs.lock().values().filter(|job| job.status == status).cloned().collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(jobs)
    }

    async fn insert_item(&self, item: &ReconciliationItem) -> Result<()> {
        self.items.lock().push(item.clone());
        Ok(())
    }

    async fn get_item(&self, id: &str) -> Result<Option<ReconciliationItem>> {
        Ok(self.items.lock().iter().find(|item| item.id == id).cloned())
    }

    async fn list_items(
        &self,
        job_id: &str,
        status: Option<ReconciliationItemStatus>,
    ) -> Result<Vec<ReconciliationItem>> {
        Ok(self
            .items
            .lock()
            .iter()
            .filter(|item| item.job_id == job_id && status.map_or(true, |s| item.status == s))
            .cloned()
            .collect())
    }

    async fn commit_item_change(
        &self,
        item: &ReconciliationItem,
        expected_version: i64,
        history: &ReconciliationHistory,
    ) -> Result<()> {
        let mut items = self.items.lock();
        let stored = items
            .iter_mut()
            .find(|stored| stored.id == item.id)
            .ok_or_else(|| TillSyncError::NotFound(format!("item {}", item.id)))?;
        if stored.version != expected_version {
            return Err(TillSyncError::Conflict(format!(
                "item {} version is {}, expected {expected_version}",
                item.id, stored.version
            )));
        }
        *stored = item.clone();
        self.history.lock().push(history.clone());
        Ok(())
    }

    async fn list_history(&self, item_id: &str) -> Result<Vec<ReconciliationHistory>> {
        Ok(self.history.lock().iter().filter(|h| h.item_id == item_id).cloned().collect())
    }
}

#[derive(Debug, Default)]
pub struct InMemoryFileStore {
    files: Mutex<HashMap<String, Vec<u8>>>,
}

impl InMemoryFileStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, file_upload_id: &str, bytes: impl Into<Vec<u8>>) {
        self.files.lock().insert(file_upload_id.to_string(), bytes.into());
    }
}

#[async_trait]
impl FileStore for InMemoryFileStore {
    async fn fetch(&self, file_upload_id: &str) -> Result<Vec<u8>> {
        self.files
            .lock()
            .get(file_upload_id)
            .cloned()
            .ok_or_else(|| TillSyncError::NotFound(format!("upload {file_upload_id}")))
    }
}

#[derive(Debug, Default)]
pub struct InMemorySystemOfRecord {
    records: Mutex<HashMap<(String, String), Value>>,
    failing_applies: AtomicBool,
    failing_fetches: Mutex<HashSet<String>>,
}

impl InMemorySystemOfRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, table: &str, key: &str, value: Value) {
        self.records.lock().insert((table.to_string(), key.to_string()), value);
    }

    pub fn get(&self, table: &str, key: &str) -> Option<Value> {
        self.records.lock().get(&(table.to_string(), key.to_string())).cloned()
    }

    pub fn set_failing_applies(&self, failing: bool) {
        self.failing_applies.store(failing, Ordering::SeqCst);
    }

    /// Make fetches of `key` fail, in any table.
    pub fn fail_fetch(&self, key: &str) {
        self.failing_fetches.lock().insert(key.to_string());
    }
}

#[async_trait]
impl SystemOfRecord for InMemorySystemOfRecord {
    async fn fetch(&self, table: &str, key: &str) -> Result<Option<Value>> {
        if self.failing_fetches.lock().contains(key) {
            return Err(TillSyncError::Network(format!("system of record unavailable for {key}")));
        }
        Ok(self.get(table, key))
    }

    async fn apply(&self, table: &str, key: &str, value: &Value) -> Result<()> {
        if self.failing_applies.load(Ordering::SeqCst) {
            return Err(TillSyncError::Network("system of record unavailable".into()));
        }
        self.put(table, key, value.clone());
        Ok(())
    }
}
