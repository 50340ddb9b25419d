//! Port interfaces for sync operations

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tillsync_domain::{
    IdentityContext, QueueCursor, QueueItemStatus, QueueOperation, QueueStats, Result,
    StatusChange, SyncAnalytics, SyncMetadata, SyncQueueItem,
};

use super::errors::SyncError;

/// Durable local write queue
///
/// Every write must be durable before the call returns. Implementations
/// serialize status transitions per item.
#[async_trait]
pub trait SyncQueueRepository: Send + Sync {
    /// Persist a new item. Fails with `Conflict` if the `client_id` exists.
    async fn enqueue(&self, item: &SyncQueueItem) -> Result<()>;

    async fn get(&self, client_id: &str) -> Result<Option<SyncQueueItem>>;

    /// One page of items in `status`, ordered by `(created_at, client_id)`
    /// ascending, strictly after `after` when given.
    async fn list_by_status(
        &self,
        status: QueueItemStatus,
        after: Option<&QueueCursor>,
        limit: usize,
    ) -> Result<Vec<SyncQueueItem>>;

    /// Compare-and-swap transition from `expected` to `change.status`.
    ///
    /// Returns the updated item, `NotFound` if the item is gone, or
    /// `Conflict` if its current status is not `expected`.
    async fn update_status(
        &self,
        client_id: &str,
        expected: QueueItemStatus,
        change: &StatusChange,
    ) -> Result<SyncQueueItem>;

    /// Delete a `completed` item. Any other status is a `Conflict`.
    async fn remove(&self, client_id: &str) -> Result<()>;

    /// Roll every `processing` item back to `pending`; returns how many moved.
    async fn reset_processing(&self, error_detail: &str) -> Result<u64>;

    async fn stats(&self) -> Result<QueueStats>;
}

/// One mutation as sent to the remote store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteWrite {
    /// Idempotency key; replays of an applied key are no-ops remotely.
    pub client_id: String,
    pub operation: QueueOperation,
    pub target_entity: String,
    pub record_key: String,
    pub payload: Value,
}

impl RemoteWrite {
    pub fn from_item(item: &SyncQueueItem) -> Self {
        Self {
            client_id: item.client_id.clone(),
            operation: item.operation,
            target_entity: item.target_entity.clone(),
            record_key: item.record_identity().key,
            payload: item.payload.clone(),
        }
    }
}

/// Remote acknowledgement of a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RemoteAck {
    /// `false` when the remote recognised the idempotency key as a replay.
    pub applied: bool,
}

/// Remote system of record, upsert-by-key per entity
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn upsert(
        &self,
        identity: &IdentityContext,
        write: &RemoteWrite,
    ) -> std::result::Result<RemoteAck, SyncError>;
}

/// Per user/device metadata persistence
#[async_trait]
pub trait MetadataRepository: Send + Sync {
    async fn load(&self, user_id: &str, device_id: &str) -> Result<Option<SyncMetadata>>;

    async fn save(&self, metadata: &SyncMetadata) -> Result<()>;
}

/// Append-only analytics sink
#[async_trait]
pub trait AnalyticsRepository: Send + Sync {
    async fn append(&self, record: &SyncAnalytics) -> Result<()>;

    /// Rows recorded at or after `since`, oldest first.
    async fn list_since(&self, since: DateTime<Utc>) -> Result<Vec<SyncAnalytics>>;
}
