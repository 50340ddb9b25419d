//! Reconciliation Processor
//!
//! Runs a job over its uploaded dataset and produces one pending
//! [`ReconciliationItem`] per divergent record, then drives item resolution
//! with an audit row per state change.

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tillsync_domain::{
    HistoryAction, IdentityContext, JobStatus, JobType, ReconciliationConfig,
    ReconciliationHistory, ReconciliationItem, ReconciliationItemStatus, ReconciliationJob,
    Resolution, Result, TillSyncError,
};
use tracing::{debug, error, info, instrument, warn};

use super::comparator::FieldComparator;
use super::dataset::{parse_csv, Dataset};
use super::mapping::TableMapping;
use super::ports::{FileStore, ReconciliationRepository, SystemOfRecord};
use crate::time::Clock;

/// Outcome of [`ReconciliationProcessor::process_job`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobReport {
    pub job_id: String,
    pub status: JobStatus,
    pub rows: usize,
    pub items_created: usize,
    /// Malformed, keyless or duplicate-key rows.
    pub skipped_rows: usize,
    pub error: Option<String>,
}

/// Operator request to settle a divergent item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveRequest {
    pub item_id: String,
    /// Version the caller read; the write is rejected if it has advanced.
    pub expected_version: i64,
    pub resolution: Resolution,
    /// Operator value, required for [`Resolution::Manual`].
    pub applied_value: Option<Value>,
    pub notes: Option<String>,
    pub resolved_by: String,
}

#[derive(Debug, Default)]
struct RunProgress {
    rows: usize,
    items_created: usize,
    skipped_rows: usize,
}

pub struct ReconciliationProcessor {
    repo: Arc<dyn ReconciliationRepository>,
    files: Arc<dyn FileStore>,
    system: Arc<dyn SystemOfRecord>,
    clock: Arc<dyn Clock>,
    config: ReconciliationConfig,
}

impl ReconciliationProcessor {
    pub fn new(
        repo: Arc<dyn ReconciliationRepository>,
        files: Arc<dyn FileStore>,
        system: Arc<dyn SystemOfRecord>,
        clock: Arc<dyn Clock>,
        config: ReconciliationConfig,
    ) -> Self {
        Self { repo, files, system, clock, config }
    }

    /// Register a job for an uploaded file.
    pub async fn create_job(
        &self,
        job_type: JobType,
        file_upload_id: &str,
        identity: &IdentityContext,
        metadata: Value,
    ) -> Result<ReconciliationJob> {
        if file_upload_id.trim().is_empty() {
            return Err(TillSyncError::InvalidInput("file upload id must not be empty".into()));
        }
        let metadata = if metadata.is_null() { json!({}) } else { metadata };
        if !metadata.is_object() {
            return Err(TillSyncError::InvalidInput("job metadata must be an object".into()));
        }

        let job = ReconciliationJob::new(
            job_type,
            file_upload_id,
            identity.user_id.clone(),
            identity.store_id.clone(),
            metadata,
            self.clock.now(),
        );
        self.repo.insert_job(&job).await?;
        info!(job_id = %job.id, job_type = %job_type, "reconciliation job created");
        Ok(job)
    }

    pub async fn get_job(&self, job_id: &str) -> Result<ReconciliationJob> {
        self.repo
            .get_job(job_id)
            .await?
            .ok_or_else(|| TillSyncError::NotFound(format!("reconciliation job {job_id}")))
    }

    pub async fn list_items(
        &self,
        job_id: &str,
        status: Option<ReconciliationItemStatus>,
    ) -> Result<Vec<ReconciliationItem>> {
        self.repo.list_items(job_id, status).await
    }

    pub async fn history(&self, item_id: &str) -> Result<Vec<ReconciliationHistory>> {
        self.repo.list_history(item_id).await
    }

    /// Run a pending job to a terminal state.
    ///
    /// Dataset or system-of-record failures mark the job `failed` and are
    /// reported in the returned [`JobReport`]; items found before the failure
    /// stay actionable. Errors writing the job tables are returned.
    #[instrument(skip(self))]
    pub async fn process_job(&self, job_id: &str) -> Result<JobReport> {
        let mut job = self.get_job(job_id).await?;
        self.advance(&mut job, JobStatus::InProgress, None).await?;

        let mut progress = RunProgress::default();
        let run = self.run(&job, &mut progress).await;

        let error = match run {
            Ok(()) => {
                let summary = json!({
                    "rows": progress.rows,
                    "items_created": progress.items_created,
                    "skipped_rows": progress.skipped_rows,
                });
                self.advance(&mut job, JobStatus::Completed, Some(("summary", summary))).await?;
                info!(
                    rows = progress.rows,
                    items_created = progress.items_created,
                    skipped_rows = progress.skipped_rows,
                    "reconciliation job completed"
                );
                None
            }
            Err(e) => {
                error!(error = %e, items_created = progress.items_created, "reconciliation job failed");
                let detail = json!({
                    "message": e.to_string(),
                    "rows": progress.rows,
                    "items_created": progress.items_created,
                });
                self.advance(&mut job, JobStatus::Failed, Some(("error", detail))).await?;
                Some(e.to_string())
            }
        };

        Ok(JobReport {
            job_id: job.id,
            status: job.status,
            rows: progress.rows,
            items_created: progress.items_created,
            skipped_rows: progress.skipped_rows,
            error,
        })
    }

    async fn run(&self, job: &ReconciliationJob, progress: &mut RunProgress) -> Result<()> {
        let mapping = TableMapping::for_job(job)?;
        let bytes = self.files.fetch(&job.file_upload_id).await?;
        let dataset = parse_csv(&bytes)?;
        let comparator = self.comparator_for(&mapping, &dataset)?;

        progress.skipped_rows = dataset.malformed_rows.len();
        if !dataset.malformed_rows.is_empty() {
            warn!(lines = ?dataset.malformed_rows, "skipping malformed rows");
        }

        let mut seen = HashSet::new();
        for row in &dataset.rows {
            progress.rows += 1;
            let Some(key) = mapping.record_key(&row.values) else {
                debug!(line = row.line, "row has no record key");
                progress.skipped_rows += 1;
                continue;
            };
            if !seen.insert(key.clone()) {
                warn!(line = row.line, key = %key, "duplicate record key in upload");
                progress.skipped_rows += 1;
                continue;
            }

            let uploaded = mapping.project(&row.values);
            let system = self.system.fetch(&mapping.table_name, &key).await?;
            if !comparator.diverges(system.as_ref(), Some(&uploaded)) {
                continue;
            }

            let item = ReconciliationItem::new(
                job.id.clone(),
                mapping.table_name.clone(),
                Some(key),
                system,
                Some(uploaded),
            );
            self.repo.insert_item(&item).await?;
            progress.items_created += 1;
        }
        Ok(())
    }

    fn comparator_for(&self, mapping: &TableMapping, dataset: &Dataset) -> Result<FieldComparator> {
        if !dataset.has_column(&mapping.key_column) {
            return Err(TillSyncError::InvalidInput(format!(
                "upload has no {:?} column",
                mapping.key_column
            )));
        }
        let fields = mapping.fields_in(&dataset.headers);
        if fields.is_empty() {
            return Err(TillSyncError::InvalidInput(format!(
                "upload carries none of the tracked fields {:?}",
                mapping.fields
            )));
        }
        Ok(FieldComparator::from_config(fields, &self.config)
            .with_numeric_fields(mapping.numeric_fields.iter().cloned()))
    }

    /// Fail every job a previous process left `in_progress`.
    ///
    /// Items the interrupted run already found stay actionable. Run once at
    /// startup, before jobs are processed.
    #[instrument(skip(self))]
    pub async fn recover_interrupted_jobs(&self) -> Result<usize> {
        let interrupted = self.repo.list_jobs(JobStatus::InProgress).await?;
        let count = interrupted.len();
        for mut job in interrupted {
            let detail = json!({"message": "interrupted: the process stopped while the job was running"});
            self.advance(&mut job, JobStatus::Failed, Some(("error", detail))).await?;
            warn!(job_id = %job.id, "interrupted reconciliation job marked failed");
        }
        Ok(count)
    }

    /// Transition the job and persist it with a compare-and-swap on the
    /// version it was loaded at.
    async fn advance(
        &self,
        job: &mut ReconciliationJob,
        next: JobStatus,
        annotation: Option<(&str, Value)>,
    ) -> Result<()> {
        let expected = job.version;
        let mut updated = job.clone();
        updated.transition(next, self.clock.now())?;
        if let Some((key, value)) = annotation {
            let mut metadata = match std::mem::take(&mut updated.metadata) {
                Value::Object(map) => map,
                _ => Map::new(),
            };
            metadata.insert(key.to_string(), value);
            updated.metadata = Value::Object(metadata);
        }
        self.repo.update_job(&updated, expected).await?;
        *job = updated;
        Ok(())
    }

    /// Settle a pending item and write the chosen value to the system of
    /// record.
    ///
    /// The live record is read at resolution time: it becomes the history
    /// row's previous value, and only the tracked fields (or the operator's
    /// fields for a manual resolution) are written over it. The item update
    /// and its history row are committed together, guarded by
    /// `expected_version`. If applying the value then fails, the item is
    /// reopened with a `reopened` history row and the error is returned.
    #[instrument(skip(self, request), fields(item_id = %request.item_id, resolution = %request.resolution))]
    pub async fn resolve_item(&self, request: ResolveRequest) -> Result<ReconciliationItem> {
        let mut item = self.load_item(&request.item_id, request.expected_version).await?;
        let job = self.get_job(&item.job_id).await?;
        let mapping = TableMapping::for_job(&job)?;

        let live = match item.record_id.as_deref() {
            Some(record_id) => self.system.fetch(&item.table_name, record_id).await?,
            None => item.system_value.clone(),
        };
        let patch = match request.resolution {
            Resolution::System => None,
            Resolution::Uploaded => {
                let uploaded = item.uploaded_value.as_ref().ok_or_else(|| {
                    TillSyncError::InvalidInput(format!("item {} has no uploaded value", item.id))
                })?;
                Some(mapping.patch_from(uploaded, live.as_ref()))
            }
            Resolution::Manual => Some(request.applied_value.clone().ok_or_else(|| {
                TillSyncError::InvalidInput("manual resolution requires a value".into())
            })?),
        };
        let target = match (patch.is_some(), item.record_id.clone()) {
            (false, _) => None,
            (true, Some(record_id)) => Some(record_id),
            (true, None) => {
                return Err(TillSyncError::InvalidInput(format!(
                    "item {} has no record id to apply a value to",
                    item.id
                )))
            }
        };
        let applied = match patch {
            None => live.clone(),
            Some(patch) => Some(merge_onto(live.as_ref(), patch)),
        };

        let now = self.clock.now();
        item.resolve(request.resolution, request.resolved_by.clone(), request.notes, now)?;
        let history = ReconciliationHistory::record(
            &item,
            HistoryAction::Resolved,
            live.clone(),
            applied.clone(),
            request.resolved_by.clone(),
            job.store_id.clone(),
            now,
        );
        self.repo.commit_item_change(&item, request.expected_version, &history).await?;

        if let (Some(record_id), Some(value)) = (target, applied.as_ref()) {
            if let Err(e) = self.system.apply(&item.table_name, &record_id, value).await {
                warn!(error = %e, "applying resolution failed, reopening item");
                self.reopen(&mut item, &request.resolved_by, &job.store_id, applied.clone(), live)
                    .await?;
                return Err(e);
            }
        }

        info!(version = item.version, "reconciliation item resolved");
        Ok(item)
    }

    /// Dismiss a pending item without touching the system of record.
    #[instrument(skip(self, notes))]
    pub async fn ignore_item(
        &self,
        item_id: &str,
        expected_version: i64,
        ignored_by: &str,
        notes: Option<String>,
    ) -> Result<ReconciliationItem> {
        let mut item = self.load_item(item_id, expected_version).await?;
        let store_id = self.get_job(&item.job_id).await?.store_id;

        let now = self.clock.now();
        item.ignore(ignored_by, notes, now)?;
        let history = ReconciliationHistory::record(
            &item,
            HistoryAction::Ignored,
            item.system_value.clone(),
            None,
            ignored_by,
            store_id,
            now,
        );
        self.repo.commit_item_change(&item, expected_version, &history).await?;
        info!("reconciliation item ignored");
        Ok(item)
    }

    async fn load_item(&self, item_id: &str, expected_version: i64) -> Result<ReconciliationItem> {
        let item = self
            .repo
            .get_item(item_id)
            .await?
            .ok_or_else(|| TillSyncError::NotFound(format!("reconciliation item {item_id}")))?;
        if item.version != expected_version {
            return Err(TillSyncError::Conflict(format!(
                "item {item_id} is at version {}, expected {expected_version}; reload and retry",
                item.version
            )));
        }
        Ok(item)
    }

    async fn reopen(
        &self,
        item: &mut ReconciliationItem,
        performed_by: &str,
        store_id: &str,
        attempted: Option<Value>,
        restored: Option<Value>,
    ) -> Result<()> {
        let expected = item.version;
        item.reopen();
        let history = ReconciliationHistory::record(
            item,
            HistoryAction::Reopened,
            attempted,
            restored,
            performed_by,
            store_id,
            self.clock.now(),
        );
        self.repo.commit_item_change(item, expected, &history).await
    }
}

/// Overlay `patch` object fields on `base`; non-object values replace it.
fn merge_onto(base: Option<&Value>, patch: Value) -> Value {
    match (base, patch) {
        (Some(Value::Object(base)), Value::Object(patch)) => {
            let mut merged = base.clone();
            merged.extend(patch);
            Value::Object(merged)
        }
        (_, patch) => patch,
    }
}
