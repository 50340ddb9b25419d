//! Durable local queue records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Kind of mutation a queued item replays against the remote store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueOperation {
    Create,
    Update,
    Delete,
}

crate::impl_status_strings!(QueueOperation {
    Create => "create",
    Update => "update",
    Delete => "delete",
});

/// Lifecycle of a queued item.
///
/// `Processing` is never a resting state: any row left in it without an
/// active worker is rolled back to `Pending`. `Failed` is the dead-letter
/// state and only an explicit retry re-arms it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueItemStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

crate::impl_status_strings!(QueueItemStatus {
    Pending => "pending",
    Processing => "processing",
    Completed => "completed",
    Failed => "failed",
});

/// One attempted local mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncQueueItem {
    /// Client-generated idempotency key, stable across retries.
    pub client_id: String,
    pub operation: QueueOperation,
    /// Remote collection the mutation addresses.
    pub target_entity: String,
    /// Identity of the logical record inside `target_entity`, when known.
    pub record_key: Option<String>,
    pub payload: Value,
    pub status: QueueItemStatus,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    /// Earliest instant a retry may be dispatched.
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub error_detail: Option<String>,
}

impl SyncQueueItem {
    /// Build a fresh pending item with a time-ordered client id.
    pub fn new(
        operation: QueueOperation,
        target_entity: impl Into<String>,
        payload: Value,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            client_id: Uuid::now_v7().to_string(),
            operation,
            target_entity: target_entity.into(),
            record_key: None,
            payload,
            status: QueueItemStatus::Pending,
            retry_count: 0,
            created_at,
            last_attempt_at: None,
            next_attempt_at: None,
            error_detail: None,
        }
    }

    #[must_use]
    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self
    }

    #[must_use]
    pub fn with_record_key(mut self, record_key: impl Into<String>) -> Self {
        self.record_key = Some(record_key.into());
        self
    }

    /// Logical record this item mutates.
    ///
    /// Resolution order: explicit `record_key`, then `payload.id` (string or
    /// number), then the item's own `client_id` so unkeyed items never share
    /// an ordering group.
    pub fn record_identity(&self) -> RecordIdentity {
        let key = self
            .record_key
            .clone()
            .or_else(|| match self.payload.get("id") {
                Some(Value::String(id)) if !id.is_empty() => Some(id.clone()),
                Some(Value::Number(id)) => Some(id.to_string()),
                _ => None,
            })
            .unwrap_or_else(|| self.client_id.clone());

        RecordIdentity { entity: self.target_entity.clone(), key }
    }

    /// Apply a status transition in place, following [`StatusChange`]'s
    /// overwrite rules.
    pub fn apply_change(&mut self, change: &StatusChange) {
        self.status = change.status;
        if let Some(retry_count) = change.retry_count {
            self.retry_count = retry_count;
        }
        if change.last_attempt_at.is_some() {
            self.last_attempt_at = change.last_attempt_at;
        }
        self.error_detail.clone_from(&change.error_detail);
        self.next_attempt_at = change.next_attempt_at;
    }

    /// Whether a pending item may be dispatched at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_attempt_at.map_or(true, |at| at <= now)
    }
}

/// `(target_entity, record key)` pair that defines causal ordering.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordIdentity {
    pub entity: String,
    pub key: String,
}

impl std::fmt::Display for RecordIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.entity, self.key)
    }
}

/// Position in a `created_at` ordered listing; pages resume strictly after it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCursor {
    pub created_at: DateTime<Utc>,
    pub client_id: String,
}

impl QueueCursor {
    pub fn after(item: &SyncQueueItem) -> Self {
        Self { created_at: item.created_at, client_id: item.client_id.clone() }
    }
}

/// Field updates applied together with a status transition.
///
/// `retry_count` and `last_attempt_at` are left untouched when `None`;
/// `error_detail` and `next_attempt_at` are always overwritten.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusChange {
    pub status: QueueItemStatus,
    pub retry_count: Option<u32>,
    pub error_detail: Option<String>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub next_attempt_at: Option<DateTime<Utc>>,
}

impl StatusChange {
    pub const fn to(status: QueueItemStatus) -> Self {
        Self {
            status,
            retry_count: None,
            error_detail: None,
            last_attempt_at: None,
            next_attempt_at: None,
        }
    }

    /// Claim for dispatch.
    pub fn processing(at: DateTime<Utc>) -> Self {
        Self { last_attempt_at: Some(at), ..Self::to(QueueItemStatus::Processing) }
    }

    pub const fn completed() -> Self {
        Self::to(QueueItemStatus::Completed)
    }

    /// Transient failure with a scheduled retry.
    pub fn retry_scheduled(
        retry_count: u32,
        next_attempt_at: DateTime<Utc>,
        error_detail: impl Into<String>,
    ) -> Self {
        Self {
            retry_count: Some(retry_count),
            error_detail: Some(error_detail.into()),
            next_attempt_at: Some(next_attempt_at),
            ..Self::to(QueueItemStatus::Pending)
        }
    }

    /// Dead-letter the item.
    pub fn failed(retry_count: u32, error_detail: impl Into<String>) -> Self {
        Self {
            retry_count: Some(retry_count),
            error_detail: Some(error_detail.into()),
            ..Self::to(QueueItemStatus::Failed)
        }
    }

    /// Operator re-arm of a failed item; retry count is preserved.
    pub const fn rearmed() -> Self {
        Self::to(QueueItemStatus::Pending)
    }

    /// Undo a claim whose worker went away.
    pub fn rolled_back(error_detail: impl Into<String>) -> Self {
        Self { error_detail: Some(error_detail.into()), ..Self::to(QueueItemStatus::Pending) }
    }
}

/// Per-status counts over the local queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    pub oldest_pending_at: Option<DateTime<Utc>>,
}

impl QueueStats {
    /// Items still owed to the remote store after a run.
    pub const fn residual(&self) -> u64 {
        self.pending + self.failed
    }
}
