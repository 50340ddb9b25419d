//! Structured engine events
//!
//! Emitted on a broadcast channel for notification layers to render. The
//! engine never formats user-facing text itself.

use serde::{Deserialize, Serialize};

use crate::types::SyncType;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SyncEvent {
    SyncStarted {
        run_id: String,
        sync_type: SyncType,
    },
    SyncCompleted {
        run_id: String,
        sync_type: SyncType,
        succeeded: u32,
        failed: u32,
        deferred: u32,
    },
    /// The run could not finish because local storage failed.
    SyncFailed {
        run_id: String,
        sync_type: SyncType,
        error: String,
    },
    /// Connectivity dropped or the run was cancelled mid-drain.
    SyncInterrupted {
        run_id: String,
        sync_type: SyncType,
        rolled_back: u32,
    },
    ItemRetryExhausted {
        client_id: String,
        target_entity: String,
        retry_count: u32,
        error: String,
    },
    ItemConflict {
        client_id: String,
        target_entity: String,
        error: String,
    },
}

impl SyncEvent {
    pub const fn name(&self) -> &'static str {
        match self {
            Self::SyncStarted { .. } => "sync_started",
            Self::SyncCompleted { .. } => "sync_completed",
            Self::SyncFailed { .. } => "sync_failed",
            Self::SyncInterrupted { .. } => "sync_interrupted",
            Self::ItemRetryExhausted { .. } => "item_retry_exhausted",
            Self::ItemConflict { .. } => "item_conflict",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_tag_matches_name() {
        let event = SyncEvent::SyncStarted { run_id: "r".into(), sync_type: SyncType::Manual };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], event.name());
        assert_eq!(json["sync_type"], "manual");
    }
}
