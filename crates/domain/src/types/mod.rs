//! Domain types and models
//!
//! Grouped by the engine component that owns them:
//! - [`queue`]: durable local write queue
//! - [`metadata`]: per user/device sync metadata
//! - [`analytics`]: append-only per-run statistics
//! - [`reconciliation`]: bulk comparison jobs, items and their audit ledger

pub mod analytics;
pub mod identity;
pub mod metadata;
pub mod queue;
pub mod reconciliation;

pub use analytics::{NetworkInfo, PerformanceSummary, SyncAnalytics, SyncType};
pub use identity::IdentityContext;
pub use metadata::{DeviceInfo, SyncMetadata, SyncPreferences};
pub use queue::{
    QueueCursor, QueueItemStatus, QueueOperation, QueueStats, RecordIdentity, StatusChange,
    SyncQueueItem,
};
pub use reconciliation::{
    HistoryAction, JobStatus, JobType, ReconciliationHistory, ReconciliationItem,
    ReconciliationItemStatus, ReconciliationJob, Resolution,
};
