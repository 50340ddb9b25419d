//! Background sync lifecycle
//!
//! [`SyncWorker`] owns the long-running tasks around a
//! [`SyncEngine`](tillsync_core::SyncEngine): scheduled drains, the
//! connectivity bridge and the queue-stats refresher.

pub mod worker;

pub use worker::{SyncWorker, SyncWorkerConfig, WorkerError};
