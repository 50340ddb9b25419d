//! Sync worker with explicit lifecycle management.
//!
//! On start the worker rolls back items a previous process left
//! `processing`, then spawns:
//! - a scheduled loop draining every `syncFrequency` seconds, re-read from
//!   metadata before each wait so preference changes apply on the next tick
//! - a connectivity bridge that drains on an offline → online edge and
//!   cancels the active drain when the device goes offline
//! - a queue-stats refresher fed by remote change notifications, when a
//!   receiver was supplied
//!
//! Scheduled and reconnect drains only run when the device's auto-sync
//! policy allows it for the current network.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use tillsync_core::SyncEngine;
//! use tillsync_infra::sync::{SyncWorker, SyncWorkerConfig};
//!
//! # async fn example(engine: Arc<SyncEngine>) -> Result<(), tillsync_infra::WorkerError> {
//! let mut worker = SyncWorker::new(engine, SyncWorkerConfig::default());
//! worker.start().await?;
//! // ... application runs ...
//! worker.stop().await?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tillsync_core::sync::run_stats_refresher;
use tillsync_core::{DrainOutcome, RemoteQueueChange, SyncEngine, SyncTrigger};
use tillsync_domain::{SyncConfig, TillSyncError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Configuration for the sync worker.
#[derive(Debug, Clone)]
pub struct SyncWorkerConfig {
    /// Scheduled interval used when metadata cannot be read.
    pub fallback_interval: Duration,
    /// How long `stop` waits for the background tasks.
    pub join_timeout: Duration,
}

impl SyncWorkerConfig {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            fallback_interval: Duration::from_secs(config.poll_interval_secs.max(1)),
            ..Self::default()
        }
    }
}

impl Default for SyncWorkerConfig {
    fn default() -> Self {
        Self { fallback_interval: Duration::from_secs(300), join_timeout: Duration::from_secs(5) }
    }
}

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Worker already running")]
    AlreadyRunning,

    #[error("Worker not running")]
    NotRunning,

    #[error("Crash recovery failed: {0}")]
    Recovery(#[source] TillSyncError),

    #[error("Worker task panicked: {0}")]
    Panicked(String),

    #[error("Worker tasks did not stop within {0:?}")]
    JoinTimeout(Duration),
}

pub struct SyncWorker {
    engine: Arc<SyncEngine>,
    config: SyncWorkerConfig,
    cancellation: CancellationToken,
    handles: Vec<JoinHandle<()>>,
    remote_changes: Option<mpsc::Receiver<RemoteQueueChange>>,
}

impl SyncWorker {
    pub fn new(engine: Arc<SyncEngine>, config: SyncWorkerConfig) -> Self {
        Self {
            engine,
            config,
            cancellation: CancellationToken::new(),
            handles: Vec::new(),
            remote_changes: None,
        }
    }

    /// Feed remote queue change notifications to the stats refresher.
    ///
    /// The receiver is consumed by the next `start`.
    #[must_use]
    pub fn with_remote_changes(mut self, changes: mpsc::Receiver<RemoteQueueChange>) -> Self {
        self.remote_changes = Some(changes);
        self
    }

    pub fn is_running(&self) -> bool {
        !self.handles.is_empty()
    }

    /// Recover interrupted items and spawn the background tasks.
    ///
    /// Returns how many items were rolled back to `pending`.
    #[instrument(skip(self))]
    pub async fn start(&mut self) -> Result<u64, WorkerError> {
        if self.is_running() {
            return Err(WorkerError::AlreadyRunning);
        }

        info!("Starting sync worker");
        let recovered = self.engine.recover().await.map_err(WorkerError::Recovery)?;

        self.cancellation = CancellationToken::new();

        self.handles.push(tokio::spawn(scheduled_loop(
            Arc::clone(&self.engine),
            self.config.fallback_interval,
            self.cancellation.clone(),
        )));
        self.handles.push(tokio::spawn(connectivity_bridge(
            Arc::clone(&self.engine),
            self.cancellation.clone(),
        )));
        if let Some(changes) = self.remote_changes.take() {
            self.handles.push(tokio::spawn(run_stats_refresher(
                Arc::clone(self.engine.queue()),
                self.engine.stats_publisher().clone(),
                changes,
                self.cancellation.clone(),
            )));
        }

        info!(recovered, tasks = self.handles.len(), "Sync worker started");
        Ok(recovered)
    }

    /// Cancel the background tasks and the active drain, then wait for the
    /// tasks to finish.
    #[instrument(skip(self))]
    pub async fn stop(&mut self) -> Result<(), WorkerError> {
        if !self.is_running() {
            return Err(WorkerError::NotRunning);
        }

        info!("Stopping sync worker");
        self.cancellation.cancel();
        if self.engine.cancel_active_drain() {
            debug!("Active drain cancelled");
        }

        let deadline = Instant::now() + self.config.join_timeout;
        let mut result = Ok(());
        for handle in self.handles.drain(..) {
            match tokio::time::timeout_at(deadline, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(error = %e, "Worker task panicked");
                    result = Err(WorkerError::Panicked(e.to_string()));
                }
                Err(_) => {
                    warn!("Worker task did not complete within timeout");
                    result = Err(WorkerError::JoinTimeout(self.config.join_timeout));
                }
            }
        }

        self.cancellation = CancellationToken::new();
        info!("Sync worker stopped");
        result
    }
}

impl Drop for SyncWorker {
    fn drop(&mut self) {
        if self.is_running() {
            warn!("SyncWorker dropped while running; cancelling tasks");
            self.cancellation.cancel();
            self.engine.cancel_active_drain();
        }
    }
}

async fn scheduled_loop(engine: Arc<SyncEngine>, fallback: Duration, cancel: CancellationToken) {
    loop {
        let interval = match engine.metadata().sync_frequency().await {
            Ok(interval) => interval,
            Err(e) => {
                warn!(error = %e, "Failed to read sync frequency, using fallback");
                fallback
            }
        };

        tokio::select! {
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(interval) => {
                auto_drain(&engine, SyncTrigger::Scheduled).await;
            }
        }
    }
    debug!("Scheduled sync loop stopped");
}

async fn connectivity_bridge(engine: Arc<SyncEngine>, cancel: CancellationToken) {
    let mut network = engine.connectivity().subscribe();
    let mut online = network.borrow_and_update().online;

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            changed = network.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }

        let now_online = network.borrow_and_update().online;
        match (online, now_online) {
            (false, true) => {
                debug!("Connectivity restored");
                auto_drain(&engine, SyncTrigger::Reconnect).await;
            }
            (true, false) => {
                if engine.cancel_active_drain() {
                    info!("Went offline, active drain cancelled");
                }
            }
            _ => {}
        }
        online = now_online;
    }
    debug!("Connectivity bridge stopped");
}

/// Drain if the auto-sync policy allows it. Errors are logged; the next
/// trigger retries.
async fn auto_drain(engine: &SyncEngine, trigger: SyncTrigger) {
    match engine.should_auto_sync().await {
        Ok(true) => {}
        Ok(false) => {
            debug!(%trigger, "Auto-sync not allowed on current network");
            return;
        }
        Err(e) => {
            warn!(%trigger, error = %e, "Failed to evaluate auto-sync policy");
            return;
        }
    }

    match engine.sync_pending_items(trigger).await {
        Ok(DrainOutcome::Ran(report)) => {
            debug!(%trigger, run_id = %report.run_id, residual = report.residual, "Drain finished");
        }
        Ok(outcome) => debug!(%trigger, ?outcome, "Drain not started"),
        Err(e) => error!(%trigger, error = %e, "Drain failed"),
    }
}
