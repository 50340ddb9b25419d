use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tillsync_domain::{
    IdentityContext, QueueItemStatus, QueueOperation, SyncEvent, SyncPreferences, SyncQueueItem,
};

use super::*;
use crate::testing::{InMemoryAnalytics, InMemoryMetadata, InMemoryQueue, ScriptedRemote};
use crate::time::MockClock;

struct Harness {
    engine: Arc<SyncEngine>,
    queue: Arc<InMemoryQueue>,
    remote: Arc<ScriptedRemote>,
    metadata: Arc<InMemoryMetadata>,
    analytics: Arc<InMemoryAnalytics>,
    clock: MockClock,
}

fn config() -> SyncEngineConfig {
    SyncEngineConfig {
        max_workers: 4,
        remote_timeout: Duration::from_secs(5),
        backoff: BackoffPolicy::new(Duration::from_millis(100), Duration::from_secs(1)),
        default_max_retries: 3,
        page_size: 2,
        event_capacity: 64,
    }
}

fn harness() -> Harness {
    harness_with(config())
}

fn harness_with(config: SyncEngineConfig) -> Harness {
    let queue = Arc::new(InMemoryQueue::new());
    let remote = Arc::new(ScriptedRemote::new());
    let metadata = Arc::new(InMemoryMetadata::new());
    let analytics = Arc::new(InMemoryAnalytics::new());
    let clock = MockClock::new();

    let engine = SyncEngine::new(
        SyncEnginePorts {
            queue: queue.clone(),
            remote: remote.clone(),
            metadata: metadata.clone(),
            analytics: analytics.clone(),
        },
        IdentityContext::new("user-1", "store-1", "device-1"),
        config,
        Arc::new(clock.clone()),
    );

    Harness { engine: Arc::new(engine), queue, remote, metadata, analytics, clock }
}

impl Harness {
    async fn enqueue(&self, client_id: &str, op: QueueOperation, key: &str, payload: serde_json::Value) {
        // distinct, increasing created_at per item
        self.clock.advance(Duration::from_millis(1));
        let item = SyncQueueItem::new(op, "products", payload, self.clock.now())
            .with_client_id(client_id)
            .with_record_key(key);
        self.engine.enqueue(item).await.unwrap();
    }

    async fn drain(&self) -> DrainReport {
        match self.engine.sync_pending_items(SyncTrigger::Manual).await.unwrap() {
            DrainOutcome::Ran(report) => report,
            other => panic!("expected a drain to run, got {other:?}"),
        }
    }

    async fn item(&self, client_id: &str) -> SyncQueueItem {
        self.queue.get(client_id).await.unwrap().unwrap()
    }

    async fn set_max_retries(&self, max_retries: u32) {
        self.engine
            .metadata()
            .update_preferences(SyncPreferences { max_retries, ..Default::default() })
            .await
            .unwrap();
    }
}

fn drain_events(rx: &mut broadcast::Receiver<SyncEvent>) -> Vec<SyncEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn offline_then_online_replays_create_and_update_in_order() {
    let h = harness();
    h.enqueue("c1", QueueOperation::Create, "widget-1", json!({"name": "Widget"})).await;
    h.enqueue("c2", QueueOperation::Update, "widget-1", json!({"name": "Widget v2"})).await;

    assert_eq!(
        h.engine.sync_pending_items(SyncTrigger::Manual).await.unwrap(),
        DrainOutcome::Offline
    );
    assert_eq!(h.remote.call_count(), 0);

    h.engine.connectivity().set_online(true);
    let report = h.drain().await;

    assert_eq!(report.attempted, 2);
    assert_eq!(report.succeeded, 2);
    assert_eq!(report.residual, 0);
    assert!(h.queue.is_empty());
    assert_eq!(h.remote.applied_order(), vec!["c1", "c2"]);
    assert_eq!(h.remote.record("products", "widget-1").unwrap()["name"], "Widget v2");

    let rows = h.analytics.rows();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].operation_count, 2);
    assert_eq!(rows[0].success_count, 2);
    assert_eq!(rows[0].error_count, 0);
    assert_eq!(rows[0].sync_type, SyncType::Manual);

    let metadata = h.metadata.get("user-1", "device-1").unwrap();
    assert_eq!(metadata.last_successful_sync_at, metadata.last_sync_at);
    assert!(metadata.last_sync_at.is_some());
}

#[tokio::test]
async fn concurrent_callers_get_a_single_drain() {
    let h = harness();
    h.engine.connectivity().set_online(true);
    h.enqueue("c1", QueueOperation::Create, "a", json!({})).await;
    h.remote.hold();

    let engine = h.engine.clone();
    let first = tokio::spawn(async move { engine.sync_pending_items(SyncTrigger::Manual).await });
    h.remote.wait_for_calls(1).await;

    assert!(h.engine.is_syncing());
    assert_eq!(
        h.engine.sync_pending_items(SyncTrigger::Manual).await.unwrap(),
        DrainOutcome::AlreadySyncing
    );

    h.remote.open();
    let outcome = first.await.unwrap().unwrap();
    assert_eq!(outcome.report().map(|r| r.succeeded), Some(1));
    assert_eq!(h.analytics.rows().len(), 1);
    assert!(!h.engine.is_syncing());
}

#[tokio::test]
async fn transient_failures_dead_letter_after_exactly_max_retries() {
    let h = harness();
    h.engine.connectivity().set_online(true);
    h.remote.fail_always(Some(SyncError::Network("connection reset".into())));
    h.enqueue("c1", QueueOperation::Create, "a", json!({})).await;
    let mut events = h.engine.subscribe_events();

    for attempt in 1..=3_u32 {
        let report = h.drain().await;
        assert_eq!(report.attempted, 1, "attempt {attempt}");
        let item = h.item("c1").await;
        assert_eq!(item.retry_count, attempt);
        if attempt < 3 {
            assert_eq!(item.status, QueueItemStatus::Pending);
            assert!(item.next_attempt_at.is_some());

            // not yet due: nothing is dispatched
            let idle = h.drain().await;
            assert_eq!(idle.attempted, 0);
            assert_eq!(idle.deferred, 1);
            h.clock.advance(Duration::from_secs(1));
        } else {
            assert_eq!(item.status, QueueItemStatus::Failed);
            assert_eq!(item.error_detail.as_deref(), Some("Network error: connection reset"));
        }
    }

    assert_eq!(h.remote.call_count(), 3);
    h.clock.advance(Duration::from_secs(60));
    assert_eq!(h.drain().await.attempted, 0);
    assert_eq!(h.remote.call_count(), 3);

    assert!(drain_events(&mut events)
        .iter()
        .any(|e| matches!(e, SyncEvent::ItemRetryExhausted { client_id, retry_count: 3, .. } if client_id == "c1")));
}

#[tokio::test]
async fn zero_max_retries_fails_on_first_attempt() {
    let h = harness();
    h.engine.connectivity().set_online(true);
    h.set_max_retries(0).await;
    h.remote.fail_always(Some(SyncError::Server("503".into())));
    h.enqueue("c1", QueueOperation::Create, "a", json!({})).await;

    let report = h.drain().await;
    assert_eq!(report.dead_lettered, 1);
    assert_eq!(h.item("c1").await.status, QueueItemStatus::Failed);
    assert_eq!(h.remote.call_count(), 1);
}

#[tokio::test]
async fn backoff_doubles_between_attempts() {
    let h = harness();
    h.engine.connectivity().set_online(true);
    h.set_max_retries(5).await;
    h.remote.fail_always(Some(SyncError::Network("down".into())));
    h.enqueue("c1", QueueOperation::Create, "a", json!({})).await;

    h.drain().await;
    let first = h.item("c1").await;
    assert_eq!(first.next_attempt_at.unwrap() - h.clock.now(), chrono::Duration::milliseconds(100));

    h.clock.advance(Duration::from_millis(100));
    h.drain().await;
    let second = h.item("c1").await;
    assert_eq!(second.next_attempt_at.unwrap() - h.clock.now(), chrono::Duration::milliseconds(200));
}

#[tokio::test]
async fn validation_failure_dead_letters_and_blocks_the_record() {
    let h = harness();
    h.engine.connectivity().set_online(true);
    h.remote.fail_next("c1", [SyncError::Validation("sku missing".into())]);
    h.enqueue("c1", QueueOperation::Create, "a", json!({})).await;
    h.enqueue("c2", QueueOperation::Update, "a", json!({"stock": 3})).await;
    h.enqueue("c3", QueueOperation::Create, "b", json!({})).await;

    let report = h.drain().await;
    assert_eq!(report.attempted, 2);
    assert_eq!(report.succeeded, 1);
    assert_eq!(report.dead_lettered, 1);
    assert_eq!(report.deferred, 1);
    assert_eq!(report.residual, 2);

    let failed = h.item("c1").await;
    assert_eq!(failed.status, QueueItemStatus::Failed);
    assert_eq!(failed.retry_count, 0);
    assert_eq!(h.item("c2").await.status, QueueItemStatus::Pending);

    // c2 stays behind the dead-lettered create on later runs too
    let again = h.drain().await;
    assert_eq!(again.attempted, 0);
    assert_eq!(again.deferred, 1);
    assert!(h.remote.calls().iter().all(|call| call.client_id != "c2"));

    let metadata = h.metadata.get("user-1", "device-1").unwrap();
    assert!(metadata.last_successful_sync_at.is_none());
}

#[tokio::test]
async fn conflicts_are_dead_lettered_with_conflict_detail() {
    let h = harness();
    h.engine.connectivity().set_online(true);
    h.remote.fail_next("c1", [SyncError::Conflict("remote version 7, expected 6".into())]);
    h.enqueue("c1", QueueOperation::Update, "a", json!({})).await;
    let mut events = h.engine.subscribe_events();

    h.drain().await;
    let item = h.item("c1").await;
    assert_eq!(item.status, QueueItemStatus::Failed);
    assert_eq!(item.retry_count, 0);
    assert!(item.error_detail.unwrap().starts_with("conflict: "));
    assert_eq!(h.remote.call_count(), 1);
    assert!(drain_events(&mut events).iter().any(|e| matches!(e, SyncEvent::ItemConflict { .. })));
}

#[tokio::test]
async fn retry_failed_operation_rearms_without_resetting_count() {
    let h = harness();
    h.engine.connectivity().set_online(true);
    h.remote.fail_next(
        "c1",
        [SyncError::Server("HTTP 503".into()), SyncError::Validation("bad".into())],
    );
    h.enqueue("c1", QueueOperation::Create, "a", json!({})).await;
    h.enqueue("c2", QueueOperation::Update, "a", json!({"n": 1})).await;
    h.drain().await;
    assert_eq!(h.item("c1").await.retry_count, 1);

    // the permanent rejection dead-letters without spending another retry
    h.clock.advance(Duration::from_secs(1));
    h.drain().await;
    let failed = h.item("c1").await;
    assert_eq!(failed.status, QueueItemStatus::Failed);
    assert_eq!(failed.retry_count, 1);

    let outcome = h.engine.retry_failed_operation("c1").await.unwrap();
    let report = outcome.report().unwrap();
    assert_eq!(report.trigger, SyncTrigger::Retry);
    assert_eq!(report.succeeded, 2);
    assert!(h.queue.is_empty());
    assert_eq!(h.remote.applied_order(), vec!["c1", "c2"]);
}

#[tokio::test]
async fn retry_of_non_failed_item_is_a_conflict() {
    let h = harness();
    h.enqueue("c1", QueueOperation::Create, "a", json!({})).await;
    let err = h.engine.retry_operation("c1").await.unwrap_err();
    assert!(err.is_conflict());
}

#[tokio::test]
async fn distinct_records_run_concurrently_but_each_record_stays_ordered() {
    let h = harness();
    h.engine.connectivity().set_online(true);
    for record in ["a", "b", "c"] {
        h.enqueue(&format!("{record}1"), QueueOperation::Create, record, json!({"v": 1})).await;
        h.enqueue(&format!("{record}2"), QueueOperation::Update, record, json!({"v": 2})).await;
        h.enqueue(&format!("{record}3"), QueueOperation::Update, record, json!({"v": 3})).await;
    }

    h.remote.hold();
    let engine = h.engine.clone();
    let drain = tokio::spawn(async move { engine.sync_pending_items(SyncTrigger::Manual).await });
    h.remote.wait_for_calls(3).await;
    assert_eq!(h.remote.peak_in_flight(), 3);
    h.remote.open();

    let outcome = drain.await.unwrap().unwrap();
    assert_eq!(outcome.report().unwrap().succeeded, 9);

    let order = h.remote.applied_order();
    for record in ["a", "b", "c"] {
        let positions: Vec<usize> = (1..=3)
            .map(|n| order.iter().position(|id| *id == format!("{record}{n}")).unwrap())
            .collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]), "{record}: {order:?}");
        assert_eq!(h.remote.record("products", record).unwrap()["v"], 3);
    }
}

#[tokio::test]
async fn going_offline_cancels_and_rolls_back_in_flight_items() {
    let h = harness();
    h.engine.connectivity().set_online(true);
    h.enqueue("c1", QueueOperation::Create, "a", json!({})).await;
    h.enqueue("c2", QueueOperation::Update, "a", json!({})).await;
    let mut events = h.engine.subscribe_events();
    h.remote.hold();

    let engine = h.engine.clone();
    let drain = tokio::spawn(async move { engine.sync_pending_items(SyncTrigger::Reconnect).await });
    h.remote.wait_for_calls(1).await;
    assert_eq!(h.item("c1").await.status, QueueItemStatus::Processing);

    h.engine.connectivity().set_online(false);
    let report = drain.await.unwrap().unwrap().report().cloned().unwrap();

    assert!(report.interrupted);
    assert_eq!(report.rolled_back, 1);
    assert_eq!(report.attempted, 0);
    let item = h.item("c1").await;
    assert_eq!(item.status, QueueItemStatus::Pending);
    assert_eq!(item.retry_count, 0);
    assert_eq!(h.item("c2").await.status, QueueItemStatus::Pending);

    let rows = h.analytics.rows();
    assert_eq!(rows.len(), 1);
    assert!(rows[0].interrupted);
    assert!(drain_events(&mut events)
        .iter()
        .any(|e| matches!(e, SyncEvent::SyncInterrupted { rolled_back: 1, .. })));
}

#[tokio::test]
async fn operator_cancel_rolls_back() {
    let h = harness();
    h.engine.connectivity().set_online(true);
    h.enqueue("c1", QueueOperation::Create, "a", json!({})).await;
    h.remote.hold();

    let engine = h.engine.clone();
    let drain = tokio::spawn(async move { engine.force_sync_now().await });
    h.remote.wait_for_calls(1).await;
    assert!(h.engine.cancel_active_drain());

    let report = drain.await.unwrap().unwrap().report().cloned().unwrap();
    assert!(report.interrupted);
    assert_eq!(h.item("c1").await.status, QueueItemStatus::Pending);
    assert!(!h.engine.cancel_active_drain());
}

#[tokio::test(start_paused = true)]
async fn remote_timeout_is_a_retryable_failure() {
    let h = harness();
    h.engine.connectivity().set_online(true);
    h.enqueue("c1", QueueOperation::Create, "a", json!({})).await;
    h.remote.hold();

    let report = h.drain().await;
    assert_eq!(report.rescheduled, 1);
    let item = h.item("c1").await;
    assert_eq!(item.status, QueueItemStatus::Pending);
    assert_eq!(item.retry_count, 1);
    assert_eq!(item.error_detail.as_deref(), Some("Timeout after 5s"));
}

#[tokio::test]
async fn replaying_an_applied_client_id_does_not_duplicate() {
    let h = harness();
    h.engine.connectivity().set_online(true);
    h.enqueue("c1", QueueOperation::Create, "a", json!({"name": "Widget"})).await;
    let original = h.item("c1").await;
    h.drain().await;

    // local completion lost: the same item shows up pending again
    h.queue.insert_raw(original);
    let report = h.drain().await;

    assert_eq!(report.succeeded, 1);
    assert_eq!(h.remote.call_count(), 2);
    assert_eq!(h.remote.applied_order(), vec!["c1"]);
    assert_eq!(h.remote.record_count(), 1);
}

#[tokio::test]
async fn recover_resets_processing_rows() {
    let h = harness();
    let mut stuck = SyncQueueItem::new(QueueOperation::Create, "products", json!({}), h.clock.now())
        .with_client_id("c1");
    stuck.status = QueueItemStatus::Processing;
    h.queue.insert_raw(stuck);

    assert_eq!(h.engine.recover().await.unwrap(), 1);
    assert_eq!(h.item("c1").await.status, QueueItemStatus::Pending);
    assert_eq!(h.engine.stats().borrow().pending, 1);
}

#[tokio::test]
async fn storage_errors_propagate_and_release_the_slot() {
    let h = harness();
    h.engine.connectivity().set_online(true);
    h.enqueue("c1", QueueOperation::Create, "a", json!({})).await;
    let mut events = h.engine.subscribe_events();
    h.queue.set_failing(true);

    let err = h.engine.sync_pending_items(SyncTrigger::Manual).await.unwrap_err();
    assert!(matches!(err, tillsync_domain::TillSyncError::Database(_)));
    assert!(!h.engine.is_syncing());
    assert!(drain_events(&mut events).iter().any(|e| matches!(e, SyncEvent::SyncFailed { .. })));

    h.queue.set_failing(false);
    assert_eq!(h.drain().await.succeeded, 1);
}

#[tokio::test]
async fn idle_runs_record_a_zero_count_analytics_row() {
    let h = harness();
    h.engine.connectivity().set_online(true);
    let report = h.drain().await;

    assert_eq!(report.attempted, 0);
    let rows = h.analytics.rows();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].operation_count, 0);
    assert_eq!(rows[0].error_count, 0);
    assert_eq!(rows[0].avg_operation_time_ms, 0.0);
    assert!(h.metadata.get("user-1", "device-1").unwrap().last_successful_sync_at.is_some());
}

#[tokio::test]
async fn enqueue_validates_and_publishes_stats() {
    let h = harness();
    let stats = h.engine.stats();

    let err = h.engine.enqueue_mutation(QueueOperation::Create, " ", json!({})).await.unwrap_err();
    assert!(matches!(err, tillsync_domain::TillSyncError::InvalidInput(_)));

    let item = h.engine.enqueue_mutation(QueueOperation::Create, "orders", json!({"id": 7})).await.unwrap();
    assert_eq!(item.record_identity().key, "7");
    assert_eq!(stats.borrow().pending, 1);

    let duplicate = h.engine.enqueue(item).await.unwrap_err();
    assert!(duplicate.is_conflict());
}

#[tokio::test]
async fn paging_covers_queues_larger_than_a_page() {
    let h = harness_with(SyncEngineConfig { page_size: 1, max_workers: 2, ..config() });
    h.engine.connectivity().set_online(true);
    for i in 0..5 {
        h.enqueue(&format!("c{i}"), QueueOperation::Create, &format!("r{i}"), json!({})).await;
    }

    assert_eq!(h.drain().await.succeeded, 5);
    assert!(h.queue.is_empty());
}

#[tokio::test]
async fn going_offline_before_the_watch_starts_still_cancels() {
    let monitor = ConnectivityMonitor::new(NetworkInfo::online());
    let mut network = monitor.subscribe();
    assert!(network.borrow_and_update().online);

    // the drop lands after the subscription but before anyone awaits it
    monitor.set_online(false);
    let token = CancellationToken::new();
    tokio::time::timeout(Duration::from_secs(1), cancel_when_offline(network, &token))
        .await
        .expect("offline transition should be observed");
    assert!(token.is_cancelled());
}
