//! Queue statistics and remote change invalidation
//!
//! An external watcher on the remote queue-mirroring collection pushes
//! [`RemoteQueueChange`]s into a bounded channel. The refresher drains it and
//! republishes [`QueueStats`]; it never re-runs business logic.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use tillsync_domain::{QueueStats, Result};

use super::ports::SyncQueueRepository;

/// Change notification from the remote queue mirror.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteQueueChange {
    pub table: String,
    pub client_id: Option<String>,
    /// `insert`, `update` or `delete` as reported by the remote.
    pub kind: String,
}

/// Bounded channel for remote change notifications.
pub fn change_channel(
    capacity: usize,
) -> (mpsc::Sender<RemoteQueueChange>, mpsc::Receiver<RemoteQueueChange>) {
    mpsc::channel(capacity.max(1))
}

/// Latest queue statistics for UI-facing consumers.
#[derive(Debug, Clone)]
pub struct QueueStatsPublisher {
    tx: Arc<watch::Sender<QueueStats>>,
}

impl QueueStatsPublisher {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(QueueStats::default());
        Self { tx: Arc::new(tx) }
    }

    pub fn subscribe(&self) -> watch::Receiver<QueueStats> {
        self.tx.subscribe()
    }

    pub fn current(&self) -> QueueStats {
        self.tx.borrow().clone()
    }

    /// Re-read counts from the queue and publish them if they changed.
    pub async fn refresh(&self, queue: &dyn SyncQueueRepository) -> Result<QueueStats> {
        let stats = queue.stats().await?;
        self.tx.send_if_modified(|current| {
            if *current == stats {
                return false;
            }
            *current = stats.clone();
            true
        });
        Ok(stats)
    }
}

impl Default for QueueStatsPublisher {
    fn default() -> Self {
        Self::new()
    }
}

/// Consume change notifications until the channel closes or `cancel` fires.
///
/// Bursts are coalesced: everything already buffered is drained before a
/// single refresh.
pub async fn run_stats_refresher(
    queue: Arc<dyn SyncQueueRepository>,
    publisher: QueueStatsPublisher,
    mut changes: mpsc::Receiver<RemoteQueueChange>,
    cancel: CancellationToken,
) {
    loop {
        let first = tokio::select! {
            () = cancel.cancelled() => break,
            change = changes.recv() => change,
        };
        let Some(first) = first else { break };

        let mut coalesced = 1_usize;
        while changes.try_recv().is_ok() {
            coalesced += 1;
        }
        debug!(table = %first.table, kind = %first.kind, coalesced, "remote queue change");

        if let Err(e) = publisher.refresh(queue.as_ref()).await {
            warn!(error = %e, "queue stats refresh failed");
        }
    }
    debug!("stats refresher stopped");
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tillsync_domain::{QueueOperation, SyncQueueItem};

    use super::*;
    use crate::testing::InMemoryQueue;

    #[tokio::test]
    async fn remote_changes_refresh_stats() {
        let queue = Arc::new(InMemoryQueue::new());
        let publisher = QueueStatsPublisher::new();
        let mut stats_rx = publisher.subscribe();
        let (tx, rx) = change_channel(4);
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(run_stats_refresher(
            queue.clone(),
            publisher.clone(),
            rx,
            cancel.clone(),
        ));

        let item = SyncQueueItem::new(QueueOperation::Create, "products", json!({}), chrono::Utc::now());
        queue.enqueue(&item).await.unwrap();
        tx.send(RemoteQueueChange { table: "sync_queue".into(), client_id: None, kind: "insert".into() })
            .await
            .unwrap();

        stats_rx.changed().await.unwrap();
        assert_eq!(stats_rx.borrow().pending, 1);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn refresher_stops_when_senders_drop() {
        let queue = Arc::new(InMemoryQueue::new());
        let (tx, rx) = change_channel(1);
        drop(tx);
        run_stats_refresher(queue, QueueStatsPublisher::new(), rx, CancellationToken::new()).await;
    }
}
