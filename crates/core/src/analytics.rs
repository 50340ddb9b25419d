//! Analytics Recorder
//!
//! Append-only sink for per-run statistics plus one derived read,
//! [`AnalyticsRecorder::performance_over`].

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tillsync_domain::{NetworkInfo, PerformanceSummary, Result, SyncAnalytics};
use uuid::Uuid;

use crate::sync::ports::AnalyticsRepository;
use crate::sync::DrainReport;
use crate::time::Clock;

#[derive(Clone)]
pub struct AnalyticsRecorder {
    repo: Arc<dyn AnalyticsRepository>,
    clock: Arc<dyn Clock>,
}

impl AnalyticsRecorder {
    pub fn new(repo: Arc<dyn AnalyticsRepository>, clock: Arc<dyn Clock>) -> Self {
        Self { repo, clock }
    }

    /// Append the record for one finished drain.
    pub async fn record_run(
        &self,
        report: &DrainReport,
        network: NetworkInfo,
    ) -> Result<SyncAnalytics> {
        let total_time_ms = u64::try_from(report.duration.as_millis()).unwrap_or(u64::MAX);
        let avg_operation_time_ms = if report.attempted == 0 {
            0.0
        } else {
            total_time_ms as f64 / f64::from(report.attempted)
        };

        let record = SyncAnalytics {
            id: Uuid::now_v7().to_string(),
            sync_type: report.trigger,
            operation_count: report.attempted,
            success_count: report.succeeded,
            error_count: report.attempted.saturating_sub(report.succeeded),
            total_time_ms,
            avg_operation_time_ms,
            network_info: network,
            error_details: report.errors.clone(),
            interrupted: report.interrupted,
            recorded_at: self.clock.now(),
        };
        self.repo.append(&record).await?;
        Ok(record)
    }

    /// Aggregate every run recorded within `window` of now.
    pub async fn performance_over(&self, window: Duration) -> Result<PerformanceSummary> {
        let window = chrono::Duration::from_std(window).unwrap_or(chrono::Duration::MAX);
        let since = self.clock.now().checked_sub_signed(window).unwrap_or(chrono::DateTime::<chrono::Utc>::MIN_UTC);
        let rows = self.repo.list_since(since).await?;
        Ok(summarize(&rows))
    }
}

/// Pure aggregation over analytics rows.
pub fn summarize(rows: &[SyncAnalytics]) -> PerformanceSummary {
    if rows.is_empty() {
        return PerformanceSummary { success_rate: 1.0, ..Default::default() };
    }

    let operation_count: u64 = rows.iter().map(|r| u64::from(r.operation_count)).sum();
    let success_count: u64 = rows.iter().map(|r| u64::from(r.success_count)).sum();
    let total_time: u64 = rows.iter().map(|r| r.total_time_ms).sum();

    let mut error_counts: BTreeMap<&str, usize> = BTreeMap::new();
    for detail in rows.iter().flat_map(|r| r.error_details.iter()) {
        *error_counts.entry(detail.as_str()).or_default() += 1;
    }
    // ties go to the lexicographically smallest message
    let most_frequent_error =
        error_counts.into_iter().rev().max_by_key(|(_, count)| *count).map(|(e, _)| e.to_string());

    PerformanceSummary {
        runs: u32::try_from(rows.len()).unwrap_or(u32::MAX),
        operation_count,
        success_rate: if operation_count == 0 {
            1.0
        } else {
            success_count as f64 / operation_count as f64
        },
        avg_sync_time_ms: total_time as f64 / rows.len() as f64,
        most_frequent_error,
    }
}
