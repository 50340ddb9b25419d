//! Reconciliation jobs, discovered items and their audit ledger

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::{Result, TillSyncError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobType {
    Inventory,
    Sales,
    Customers,
    Orders,
    Financial,
}

crate::impl_status_strings!(JobType {
    Inventory => "inventory",
    Sales => "sales",
    Customers => "customers",
    Orders => "orders",
    Financial => "financial",
});

/// Job state machine: `pending -> in_progress -> {completed | failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

crate::impl_status_strings!(JobStatus {
    Pending => "pending",
    InProgress => "in_progress",
    Completed => "completed",
    Failed => "failed",
});

impl JobStatus {
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// A pending job may also fail outright when it cannot be started.
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::InProgress)
                | (Self::Pending, Self::Failed)
                | (Self::InProgress, Self::Completed)
                | (Self::InProgress, Self::Failed)
        )
    }
}

/// One bulk-comparison run over an uploaded file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconciliationJob {
    pub id: String,
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub status: JobStatus,
    pub file_upload_id: String,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_by: String,
    pub store_id: String,
    pub metadata: Value,
    pub version: i64,
}

impl ReconciliationJob {
    pub fn new(
        job_type: JobType,
        file_upload_id: impl Into<String>,
        created_by: impl Into<String>,
        store_id: impl Into<String>,
        metadata: Value,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            job_type,
            status: JobStatus::Pending,
            file_upload_id: file_upload_id.into(),
            created_at: now,
            completed_at: None,
            created_by: created_by.into(),
            store_id: store_id.into(),
            metadata,
            version: 1,
        }
    }

    /// Move to `next`, stamping `completed_at` on terminal states and bumping
    /// the version. Persisting the result is a compare-and-swap on the old
    /// version.
    pub fn transition(&mut self, next: JobStatus, now: DateTime<Utc>) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(TillSyncError::Conflict(format!(
                "job {} cannot move from {} to {}",
                self.id, self.status, next
            )));
        }
        self.status = next;
        if next.is_terminal() {
            self.completed_at = Some(now);
        }
        self.version += 1;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReconciliationItemStatus {
    Pending,
    Resolved,
    Ignored,
}

crate::impl_status_strings!(ReconciliationItemStatus {
    Pending => "pending",
    Resolved => "resolved",
    Ignored => "ignored",
});

/// Which side wins a resolved divergence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resolution {
    /// Keep the system value; the upload is acknowledged as wrong.
    System,
    /// Apply the uploaded value to the system of record.
    Uploaded,
    /// Apply an operator-supplied value. Requires notes.
    Manual,
}

crate::impl_status_strings!(Resolution {
    System => "system",
    Uploaded => "uploaded",
    Manual => "manual",
});

/// One divergent record discovered by a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconciliationItem {
    pub id: String,
    pub job_id: String,
    pub table_name: String,
    pub record_id: Option<String>,
    pub system_value: Option<Value>,
    pub uploaded_value: Option<Value>,
    pub status: ReconciliationItemStatus,
    pub resolution: Option<Resolution>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<String>,
    pub notes: Option<String>,
    pub version: i64,
}

impl ReconciliationItem {
    pub fn new(
        job_id: impl Into<String>,
        table_name: impl Into<String>,
        record_id: Option<String>,
        system_value: Option<Value>,
        uploaded_value: Option<Value>,
    ) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            job_id: job_id.into(),
            table_name: table_name.into(),
            record_id,
            system_value,
            uploaded_value,
            status: ReconciliationItemStatus::Pending,
            resolution: None,
            resolved_at: None,
            resolved_by: None,
            notes: None,
            version: 1,
        }
    }

    /// Mark resolved. Only pending items can be resolved, and a manual
    /// override must carry non-blank notes.
    pub fn resolve(
        &mut self,
        resolution: Resolution,
        resolved_by: impl Into<String>,
        notes: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.ensure_pending()?;
        let notes = notes.filter(|n| !n.trim().is_empty());
        if resolution == Resolution::Manual && notes.is_none() {
            return Err(TillSyncError::InvalidInput(
                "manual resolution requires notes explaining the override".into(),
            ));
        }
        self.status = ReconciliationItemStatus::Resolved;
        self.resolution = Some(resolution);
        self.resolved_at = Some(now);
        self.resolved_by = Some(resolved_by.into());
        self.notes = notes;
        self.version += 1;
        Ok(())
    }

    pub fn ignore(
        &mut self,
        ignored_by: impl Into<String>,
        notes: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.ensure_pending()?;
        self.status = ReconciliationItemStatus::Ignored;
        self.resolved_at = Some(now);
        self.resolved_by = Some(ignored_by.into());
        self.notes = notes;
        self.version += 1;
        Ok(())
    }

    /// Return a resolved item to `pending` after its value could not be applied.
    pub fn reopen(&mut self) {
        self.status = ReconciliationItemStatus::Pending;
        self.resolution = None;
        self.resolved_at = None;
        self.resolved_by = None;
        self.version += 1;
    }

    fn ensure_pending(&self) -> Result<()> {
        if self.status == ReconciliationItemStatus::Pending {
            Ok(())
        } else {
            Err(TillSyncError::Conflict(format!("item {} is already {}", self.id, self.status)))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryAction {
    Resolved,
    Ignored,
    Reopened,
}

crate::impl_status_strings!(HistoryAction {
    Resolved => "resolved",
    Ignored => "ignored",
    Reopened => "reopened",
});

/// Append-only audit row; one per state change on an item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconciliationHistory {
    pub id: String,
    pub item_id: String,
    pub action: HistoryAction,
    pub previous_value: Option<Value>,
    pub new_value: Option<Value>,
    pub performed_at: DateTime<Utc>,
    pub performed_by: String,
    pub store_id: String,
    /// Item version after the change.
    pub version: i64,
}

impl ReconciliationHistory {
    pub fn record(
        item: &ReconciliationItem,
        action: HistoryAction,
        previous_value: Option<Value>,
        new_value: Option<Value>,
        performed_by: impl Into<String>,
        store_id: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            item_id: item.id.clone(),
            action,
            previous_value,
            new_value,
            performed_at: now,
            performed_by: performed_by.into(),
            store_id: store_id.into(),
            version: item.version,
        }
    }
}
