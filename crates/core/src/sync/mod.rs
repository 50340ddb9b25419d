//! Offline queue replay
//!
//! Ports, error classification and the drain machinery used by
//! [`SyncEngine`].

pub mod backoff;
pub mod connectivity;
pub mod coordinator;
pub mod engine;
pub mod errors;
pub mod invalidation;
pub mod ports;
pub mod stream;

pub use backoff::{BackoffPolicy, RetryDecision};
pub use connectivity::{ConnectivityMonitor, Transition};
pub use coordinator::{DrainCoordinator, DrainPermit};
pub use engine::{
    DrainOutcome, DrainReport, SyncEngine, SyncEngineConfig, SyncEnginePorts, SyncTrigger,
};
pub use invalidation::{change_channel, run_stats_refresher, QueueStatsPublisher, RemoteQueueChange};
pub use stream::queue_stream;
