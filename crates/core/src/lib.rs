//! # TillSync Core
//!
//! Pure business logic layer - no infrastructure dependencies.
//!
//! This crate contains:
//! - Port/adapter interfaces (traits) for storage, the remote store and file
//!   ingestion
//! - The sync engine: single-flight drain, per-record ordering, retry with
//!   backoff, connectivity handling and queue statistics
//! - The reconciliation processor and its field comparator
//! - Metadata and analytics services
//!
//! ## Architecture Principles
//! - Only depends on `tillsync-domain`
//! - No database, HTTP, or platform code
//! - All external dependencies via traits
//! - Time is injected through [`Clock`] so backoff is testable without sleeping

pub mod analytics;
pub mod metadata;
pub mod reconciliation;
pub mod sync;
pub mod time;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

// Re-export specific items to avoid ambiguity
pub use analytics::AnalyticsRecorder;
pub use metadata::MetadataStore;
pub use reconciliation::ports::{FileStore, ReconciliationRepository, SystemOfRecord};
pub use reconciliation::{
    FieldComparator, JobReport, ReconciliationProcessor, ResolveRequest, TableMapping,
};
pub use sync::errors::{ErrorDisposition, SyncError, SyncErrorCategory};
pub use sync::ports::{
    AnalyticsRepository, MetadataRepository, RemoteAck, RemoteStore, RemoteWrite,
    SyncQueueRepository,
};
pub use sync::{
    BackoffPolicy, ConnectivityMonitor, DrainCoordinator, DrainOutcome, DrainReport,
    QueueStatsPublisher, RemoteQueueChange, SyncEngine, SyncEngineConfig, SyncEnginePorts,
    SyncTrigger,
};
pub use time::{Clock, SystemClock};
