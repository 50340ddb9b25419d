//! Sync Engine
//!
//! Drains the durable local queue against the remote store:
//!
//! 1. Single-flight: a [`DrainCoordinator`] permit is held for the whole run.
//! 2. Pending items are grouped by record identity (see [`plan`]); groups run
//!    concurrently up to `max_workers`, items inside a group run in
//!    `created_at` order and stop at the first item that does not succeed.
//! 3. Each attempt claims the item (`pending -> processing`), calls the
//!    remote with a timeout, and settles it: completed and removed, retried
//!    with backoff, or dead-lettered.
//! 4. Going offline cancels the run; in-flight items roll back to `pending`.
//! 5. Queue stats, metadata and analytics are refreshed once per run.

mod plan;
#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tillsync_domain::{
    IdentityContext, NetworkInfo, QueueItemStatus, QueueOperation, QueueStats, RecordIdentity,
    Result, StatusChange, SyncConfig, SyncEvent, SyncQueueItem, SyncType, TillSyncError,
};
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use self::plan::plan_drain;
use super::backoff::{BackoffPolicy, RetryDecision};
use super::connectivity::ConnectivityMonitor;
use super::coordinator::DrainCoordinator;
use super::errors::{ErrorDisposition, SyncError};
use super::invalidation::QueueStatsPublisher;
use super::ports::{
    AnalyticsRepository, MetadataRepository, RemoteStore, RemoteWrite, SyncQueueRepository,
};
use super::stream::queue_stream;
use crate::analytics::AnalyticsRecorder;
use crate::metadata::MetadataStore;
use crate::time::Clock;

/// What started a drain; recorded as the run's `syncType`.
pub type SyncTrigger = SyncType;

const INTERRUPTED_DETAIL: &str = "interrupted: drain cancelled before the remote acknowledged";
const ORPHANED_DETAIL: &str = "interrupted: no active worker";
const RECOVERED_DETAIL: &str = "interrupted: recovered after restart";

/// Storage and remote collaborators of the engine.
#[derive(Clone)]
pub struct SyncEnginePorts {
    pub queue: Arc<dyn SyncQueueRepository>,
    pub remote: Arc<dyn RemoteStore>,
    pub metadata: Arc<dyn MetadataRepository>,
    pub analytics: Arc<dyn AnalyticsRepository>,
}

#[derive(Debug, Clone)]
pub struct SyncEngineConfig {
    pub max_workers: usize,
    pub remote_timeout: Duration,
    pub backoff: BackoffPolicy,
    /// Retry ceiling until the device metadata carries its own.
    pub default_max_retries: u32,
    /// Rows fetched per queue page while planning.
    pub page_size: usize,
    pub event_capacity: usize,
}

impl Default for SyncEngineConfig {
    fn default() -> Self {
        Self::from(&SyncConfig::default())
    }
}

impl From<&SyncConfig> for SyncEngineConfig {
    fn from(config: &SyncConfig) -> Self {
        Self {
            max_workers: config.max_workers.max(1),
            remote_timeout: Duration::from_millis(config.remote_timeout_ms),
            backoff: BackoffPolicy::new(
                Duration::from_millis(config.backoff_base_ms),
                Duration::from_millis(config.backoff_max_ms),
            ),
            default_max_retries: config.default_max_retries,
            page_size: 200,
            event_capacity: 64,
        }
    }
}

/// Result of a `sync_pending_items` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Another drain holds the slot; nothing was started.
    AlreadySyncing,
    /// The monitor reports offline; nothing was started.
    Offline,
    Ran(DrainReport),
}

impl DrainOutcome {
    pub const fn report(&self) -> Option<&DrainReport> {
        match self {
            Self::Ran(report) => Some(report),
            _ => None,
        }
    }
}

/// Counters for one drain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DrainReport {
    pub run_id: String,
    pub trigger: SyncTrigger,
    /// Items whose remote call completed, successfully or not.
    pub attempted: u32,
    pub succeeded: u32,
    /// Retryable failures rescheduled with backoff.
    pub rescheduled: u32,
    /// Items moved to `failed` this run.
    pub dead_lettered: u32,
    /// Pending items not dispatched this run.
    pub deferred: u32,
    /// Items rolled back from `processing` to `pending`.
    pub rolled_back: u32,
    pub interrupted: bool,
    pub errors: Vec<String>,
    pub duration: Duration,
    /// Pending plus failed items left after the run.
    pub residual: u64,
}

impl DrainReport {
    fn new(run_id: String, trigger: SyncTrigger) -> Self {
        Self {
            run_id,
            trigger,
            attempted: 0,
            succeeded: 0,
            rescheduled: 0,
            dead_lettered: 0,
            deferred: 0,
            rolled_back: 0,
            interrupted: false,
            errors: Vec::new(),
            duration: Duration::ZERO,
            residual: 0,
        }
    }

    fn absorb(&mut self, outcome: &ItemOutcome) {
        match outcome {
            ItemOutcome::Succeeded => {
                self.attempted += 1;
                self.succeeded += 1;
            }
            ItemOutcome::Rescheduled(detail) => {
                self.attempted += 1;
                self.rescheduled += 1;
                self.errors.push(detail.clone());
            }
            ItemOutcome::DeadLettered(detail) => {
                self.attempted += 1;
                self.dead_lettered += 1;
                self.errors.push(detail.clone());
            }
            ItemOutcome::RolledBack => self.rolled_back += 1,
            ItemOutcome::Skipped => {}
        }
    }
}

/// How a single attempt ended.
#[derive(Debug, Clone, PartialEq, Eq)]
enum ItemOutcome {
    Succeeded,
    Rescheduled(String),
    DeadLettered(String),
    RolledBack,
    /// The item changed state before it could be claimed.
    Skipped,
}

pub struct SyncEngine {
    ports: SyncEnginePorts,
    identity: IdentityContext,
    config: SyncEngineConfig,
    clock: Arc<dyn Clock>,
    coordinator: DrainCoordinator,
    connectivity: Arc<ConnectivityMonitor>,
    stats: QueueStatsPublisher,
    events: broadcast::Sender<SyncEvent>,
    metadata: MetadataStore,
    analytics: AnalyticsRecorder,
}

impl SyncEngine {
    /// Build an engine that starts offline; the host reports connectivity
    /// through [`SyncEngine::connectivity`].
    pub fn new(
        ports: SyncEnginePorts,
        identity: IdentityContext,
        config: SyncEngineConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let metadata = MetadataStore::new(
            Arc::clone(&ports.metadata),
            identity.clone(),
            Arc::clone(&clock),
            config.default_max_retries,
        );
        let analytics = AnalyticsRecorder::new(Arc::clone(&ports.analytics), Arc::clone(&clock));

        Self {
            ports,
            identity,
            config,
            clock,
            coordinator: DrainCoordinator::new(),
            connectivity: Arc::new(ConnectivityMonitor::offline()),
            stats: QueueStatsPublisher::new(),
            events,
            metadata,
            analytics,
        }
    }

    pub fn connectivity(&self) -> &Arc<ConnectivityMonitor> {
        &self.connectivity
    }

    pub fn metadata(&self) -> &MetadataStore {
        &self.metadata
    }

    pub fn analytics(&self) -> &AnalyticsRecorder {
        &self.analytics
    }

    pub fn queue(&self) -> &Arc<dyn SyncQueueRepository> {
        &self.ports.queue
    }

    pub fn stats_publisher(&self) -> &QueueStatsPublisher {
        &self.stats
    }

    pub fn stats(&self) -> watch::Receiver<QueueStats> {
        self.stats.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn is_syncing(&self) -> bool {
        self.coordinator.is_active()
    }

    /// Durably persist a local mutation. A successful return only means the
    /// item is queued, not that the remote store has it.
    #[instrument(skip(self, item), fields(client_id = %item.client_id, entity = %item.target_entity))]
    pub async fn enqueue(&self, item: SyncQueueItem) -> Result<SyncQueueItem> {
        if item.target_entity.trim().is_empty() {
            return Err(TillSyncError::InvalidInput("target entity must not be empty".into()));
        }
        if item.client_id.trim().is_empty() {
            return Err(TillSyncError::InvalidInput("client id must not be empty".into()));
        }
        if item.status != QueueItemStatus::Pending {
            return Err(TillSyncError::InvalidInput(format!(
                "new queue items must be pending, got {}",
                item.status
            )));
        }

        self.ports.queue.enqueue(&item).await?;
        debug!("mutation queued");
        self.refresh_stats().await;
        Ok(item)
    }

    /// Queue a mutation stamped with the engine clock and a fresh client id.
    pub async fn enqueue_mutation(
        &self,
        operation: QueueOperation,
        target_entity: &str,
        payload: Value,
    ) -> Result<SyncQueueItem> {
        let item = SyncQueueItem::new(operation, target_entity, payload, self.clock.now());
        self.enqueue(item).await
    }

    /// Operator entry point: drain now regardless of auto-sync preferences.
    pub async fn force_sync_now(&self) -> Result<DrainOutcome> {
        self.sync_pending_items(SyncTrigger::Manual).await
    }

    /// Whether reconnect and scheduled drains are allowed right now.
    pub async fn should_auto_sync(&self) -> Result<bool> {
        self.metadata.should_auto_sync(&self.connectivity.current()).await
    }

    /// Re-arm a dead-lettered item (retry count unchanged) and drain.
    #[instrument(skip(self))]
    pub async fn retry_failed_operation(&self, client_id: &str) -> Result<DrainOutcome> {
        self.ports
            .queue
            .update_status(client_id, QueueItemStatus::Failed, &StatusChange::rearmed())
            .await?;
        info!("failed item re-armed");
        self.refresh_stats().await;
        self.sync_pending_items(SyncTrigger::Retry).await
    }

    pub async fn retry_operation(&self, client_id: &str) -> Result<DrainOutcome> {
        self.retry_failed_operation(client_id).await
    }

    /// Signal the active drain, if any, to stop and roll back.
    pub fn cancel_active_drain(&self) -> bool {
        self.coordinator.cancel_active()
    }

    /// Roll back items left `processing` by a previous process.
    #[instrument(skip(self))]
    pub async fn recover(&self) -> Result<u64> {
        let recovered = self.ports.queue.reset_processing(RECOVERED_DETAIL).await?;
        if recovered > 0 {
            warn!(recovered, "rolled back items left processing");
        }
        self.stats.refresh(self.ports.queue.as_ref()).await?;
        Ok(recovered)
    }

    /// Drain the queue once. Concurrent callers observe
    /// [`DrainOutcome::AlreadySyncing`]. Local storage errors are returned;
    /// remote errors are absorbed into item status.
    #[instrument(skip(self, trigger), fields(trigger = %trigger))]
    pub async fn sync_pending_items(&self, trigger: SyncTrigger) -> Result<DrainOutcome> {
        let Some(permit) = self.coordinator.try_acquire() else {
            debug!("drain already active");
            return Ok(DrainOutcome::AlreadySyncing);
        };

        // subscribe before reading so a transition after the check is seen
        let mut network_rx = self.connectivity.subscribe();
        let network = network_rx.borrow_and_update().clone();
        if !network.online {
            debug!("offline, drain skipped");
            return Ok(DrainOutcome::Offline);
        }

        let run_id = Uuid::now_v7().to_string();
        self.emit(SyncEvent::SyncStarted { run_id: run_id.clone(), sync_type: trigger });
        let started = Instant::now();

        let token = permit.token().clone();
        let result = self.drain_with_offline_watch(&run_id, trigger, &token, network_rx).await;
        let mut report = match result {
            Ok(report) => report,
            Err(e) => {
                error!(error = %e, run_id = %run_id, "drain failed");
                if let Err(reset) = self.ports.queue.reset_processing(ORPHANED_DETAIL).await {
                    error!(error = %reset, "rollback after failed drain also failed");
                }
                self.refresh_stats().await;
                self.emit(SyncEvent::SyncFailed {
                    run_id,
                    sync_type: trigger,
                    error: e.to_string(),
                });
                return Err(e);
            }
        };
        report.duration = started.elapsed();

        let stats = self.stats.refresh(self.ports.queue.as_ref()).await?;
        report.residual = stats.residual();
        self.metadata.record_sync_attempt(report.residual == 0).await?;
        self.analytics.record_run(&report, network).await?;

        if report.interrupted {
            self.emit(SyncEvent::SyncInterrupted {
                run_id: report.run_id.clone(),
                sync_type: trigger,
                rolled_back: report.rolled_back,
            });
        } else {
            self.emit(SyncEvent::SyncCompleted {
                run_id: report.run_id.clone(),
                sync_type: trigger,
                succeeded: report.succeeded,
                failed: report.dead_lettered,
                deferred: report.deferred + report.rescheduled,
            });
        }

        info!(
            run_id = %report.run_id,
            attempted = report.attempted,
            succeeded = report.succeeded,
            rescheduled = report.rescheduled,
            dead_lettered = report.dead_lettered,
            deferred = report.deferred,
            interrupted = report.interrupted,
            duration_ms = u64::try_from(report.duration.as_millis()).unwrap_or(u64::MAX),
            "drain finished"
        );
        drop(permit);
        Ok(DrainOutcome::Ran(report))
    }

    /// Run the drain while watching for an offline transition, which cancels
    /// `token`.
    async fn drain_with_offline_watch(
        &self,
        run_id: &str,
        trigger: SyncTrigger,
        token: &CancellationToken,
        network: watch::Receiver<NetworkInfo>,
    ) -> Result<DrainReport> {
        let work = self.drain(run_id, trigger, token);
        tokio::pin!(work);
        tokio::select! {
            report = &mut work => report,
            () = cancel_when_offline(network, token) => work.await,
        }
    }

    async fn drain(
        &self,
        run_id: &str,
        trigger: SyncTrigger,
        token: &CancellationToken,
    ) -> Result<DrainReport> {
        let mut report = DrainReport::new(run_id.to_string(), trigger);
        let max_retries = self.metadata.max_retries().await?;
        let now = self.clock.now();

        let pending: Vec<SyncQueueItem> = queue_stream(
            Arc::clone(&self.ports.queue),
            QueueItemStatus::Pending,
            None,
            self.config.page_size,
        )
        .try_collect()
        .await?;
        let failed_since = self.failed_records().await?;

        let plan = plan_drain(pending, &failed_since, now);
        report.deferred = plan.deferred;
        debug!(ready = plan.ready(), deferred = plan.deferred, groups = plan.groups.len(), "drain planned");

        let group_results: Vec<(Vec<ItemOutcome>, u32)> = futures::stream::iter(plan.groups)
            .map(|group| self.process_group(group, max_retries, token))
            .buffer_unordered(self.config.max_workers.max(1))
            .try_collect()
            .await?;

        for (outcomes, blocked) in group_results {
            for outcome in &outcomes {
                report.absorb(outcome);
            }
            report.deferred += blocked;
        }

        let orphaned = self.ports.queue.reset_processing(ORPHANED_DETAIL).await?;
        report.rolled_back += u32::try_from(orphaned).unwrap_or(u32::MAX);
        report.interrupted = token.is_cancelled();
        Ok(report)
    }

    /// Oldest dead-lettered `created_at` per record.
    async fn failed_records(&self) -> Result<HashMap<RecordIdentity, chrono::DateTime<chrono::Utc>>> {
        let failed: Vec<SyncQueueItem> = queue_stream(
            Arc::clone(&self.ports.queue),
            QueueItemStatus::Failed,
            None,
            self.config.page_size,
        )
        .try_collect()
        .await?;

        let mut failed_since = HashMap::new();
        for item in failed {
            failed_since
                .entry(item.record_identity())
                .and_modify(|at| {
                    if item.created_at < *at {
                        *at = item.created_at;
                    }
                })
                .or_insert(item.created_at);
        }
        Ok(failed_since)
    }

    /// Run one record's items in order. Returns the outcomes of the items
    /// that ran and how many were left untouched behind a non-success.
    async fn process_group(
        &self,
        group: Vec<SyncQueueItem>,
        max_retries: u32,
        token: &CancellationToken,
    ) -> Result<(Vec<ItemOutcome>, u32)> {
        let total = group.len();
        let mut outcomes = Vec::with_capacity(total);

        for item in group {
            if token.is_cancelled() {
                break;
            }
            let outcome = self.process_item(item, max_retries, token).await?;
            let proceed = outcome == ItemOutcome::Succeeded;
            outcomes.push(outcome);
            if !proceed {
                break;
            }
        }

        let untouched = u32::try_from(total - outcomes.len()).unwrap_or(u32::MAX);
        Ok((outcomes, untouched))
    }

    #[instrument(skip_all, fields(client_id = %item.client_id, entity = %item.target_entity))]
    async fn process_item(
        &self,
        item: SyncQueueItem,
        max_retries: u32,
        token: &CancellationToken,
    ) -> Result<ItemOutcome> {
        let claimed = match self
            .ports
            .queue
            .update_status(
                &item.client_id,
                QueueItemStatus::Pending,
                &StatusChange::processing(self.clock.now()),
            )
            .await
        {
            Ok(claimed) => claimed,
            Err(TillSyncError::Conflict(_) | TillSyncError::NotFound(_)) => {
                debug!("item changed before claim, skipping");
                return Ok(ItemOutcome::Skipped);
            }
            Err(e) => return Err(e),
        };

        let write = RemoteWrite::from_item(&claimed);
        let timeout = self.config.remote_timeout;
        let call = tokio::time::timeout(timeout, self.ports.remote.upsert(&self.identity, &write));

        let result = tokio::select! {
            biased;
            () = token.cancelled() => None,
            outcome = call => Some(outcome.unwrap_or(Err(SyncError::Timeout(timeout)))),
        };

        match result {
            None => {
                self.settle(&claimed, &StatusChange::rolled_back(INTERRUPTED_DETAIL)).await?;
                debug!("attempt cancelled, rolled back to pending");
                Ok(ItemOutcome::RolledBack)
            }
            Some(Ok(ack)) => {
                self.settle(&claimed, &StatusChange::completed()).await?;
                self.ports.queue.remove(&claimed.client_id).await?;
                debug!(applied = ack.applied, "remote acknowledged");
                Ok(ItemOutcome::Succeeded)
            }
            Some(Err(e)) => self.handle_failure(&claimed, &e, max_retries).await,
        }
    }

    async fn handle_failure(
        &self,
        item: &SyncQueueItem,
        err: &SyncError,
        max_retries: u32,
    ) -> Result<ItemOutcome> {
        let detail = err.detail();

        match err.disposition() {
            ErrorDisposition::Retryable => {
                match self.config.backoff.decide(item.retry_count, max_retries, self.clock.now()) {
                    RetryDecision::Reschedule { retry_count, next_attempt_at } => {
                        self.settle(
                            item,
                            &StatusChange::retry_scheduled(retry_count, next_attempt_at, &*detail),
                        )
                        .await?;
                        warn!(retry_count, %next_attempt_at, error = %detail, "attempt failed, retry scheduled");
                        Ok(ItemOutcome::Rescheduled(detail))
                    }
                    RetryDecision::Exhausted { retry_count } => {
                        self.settle(item, &StatusChange::failed(retry_count, &*detail)).await?;
                        warn!(retry_count, error = %detail, "retries exhausted, item dead-lettered");
                        self.emit(SyncEvent::ItemRetryExhausted {
                            client_id: item.client_id.clone(),
                            target_entity: item.target_entity.clone(),
                            retry_count,
                            error: detail.clone(),
                        });
                        Ok(ItemOutcome::DeadLettered(detail))
                    }
                }
            }
            ErrorDisposition::Permanent => {
                self.settle(item, &StatusChange::failed(item.retry_count, &*detail)).await?;
                warn!(error = %detail, "remote rejected item, dead-lettered");
                Ok(ItemOutcome::DeadLettered(detail))
            }
            ErrorDisposition::Conflict => {
                self.settle(item, &StatusChange::failed(item.retry_count, &*detail)).await?;
                warn!(error = %detail, "remote conflict, item dead-lettered");
                self.emit(SyncEvent::ItemConflict {
                    client_id: item.client_id.clone(),
                    target_entity: item.target_entity.clone(),
                    error: detail.clone(),
                });
                Ok(ItemOutcome::DeadLettered(detail))
            }
        }
    }

    /// Transition a claimed item out of `processing`.
    async fn settle(&self, item: &SyncQueueItem, change: &StatusChange) -> Result<()> {
        self.ports
            .queue
            .update_status(&item.client_id, QueueItemStatus::Processing, change)
            .await
            .map(|_| ())
    }

    async fn refresh_stats(&self) {
        if let Err(e) = self.stats.refresh(self.ports.queue.as_ref()).await {
            warn!(error = %e, "queue stats refresh failed");
        }
    }

    fn emit(&self, event: SyncEvent) {
        debug!(event = event.name(), "sync event");
        // no subscribers is fine
        let _ = self.events.send(event);
    }
}

/// Cancel `token` on the first offline state `network` reports, including
/// one published before this future is first polled.
async fn cancel_when_offline(mut network: watch::Receiver<NetworkInfo>, token: &CancellationToken) {
    while network.changed().await.is_ok() {
        if !network.borrow_and_update().online {
            info!("went offline, cancelling drain");
            token.cancel();
            return;
        }
    }
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("identity", &self.identity)
            .field("config", &self.config)
            .field("syncing", &self.coordinator.is_active())
            .field("online", &self.connectivity.is_online())
            .finish_non_exhaustive()
    }
}
