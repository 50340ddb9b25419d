//! Per-run sync statistics

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What started a drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncType {
    Manual,
    Reconnect,
    Scheduled,
    Retry,
}

crate::impl_status_strings!(SyncType {
    Manual => "manual",
    Reconnect => "reconnect",
    Scheduled => "scheduled",
    Retry => "retry",
});

/// Network context reported by the host.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkInfo {
    pub online: bool,
    pub metered: bool,
    pub connection_type: Option<String>,
}

impl NetworkInfo {
    pub const fn offline() -> Self {
        Self { online: false, metered: false, connection_type: None }
    }

    pub const fn online() -> Self {
        Self { online: true, metered: false, connection_type: None }
    }
}

/// Append-only record of one drain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncAnalytics {
    pub id: String,
    pub sync_type: SyncType,
    pub operation_count: u32,
    pub success_count: u32,
    pub error_count: u32,
    pub total_time_ms: u64,
    pub avg_operation_time_ms: f64,
    pub network_info: NetworkInfo,
    pub error_details: Vec<String>,
    /// The run was cut short by a connectivity loss or cancellation.
    pub interrupted: bool,
    pub recorded_at: DateTime<Utc>,
}

/// Aggregate over a window of [`SyncAnalytics`] rows.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceSummary {
    pub runs: u32,
    pub operation_count: u64,
    /// `success / operations` in `[0, 1]`; `1.0` when nothing ran.
    pub success_rate: f64,
    pub avg_sync_time_ms: f64,
    pub most_frequent_error: Option<String>,
}
