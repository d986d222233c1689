//! Scheduler loops and lifecycle over the in-memory fakes.
//!
//! Timer-driven tests run on a paused clock, so loop intervals elapse
//! instantly once every task is idle.

use chrono::Utc;
use outbox_engine_core::{
    DlqAlertHandler, EventStatus, FnDlqAlertHandler, FnDlqHandler, InMemoryMetricsCollector,
    OutboxError, OutboxEvent, OutboxRepository, OutboxScheduler, PublisherConfig,
    SchedulerBuilder, SchedulerConfig, SchedulerError,
};
use outbox_engine_testing::{AckMode, ChannelEventPublisher, InMemoryOutboxRepository};
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

struct Harness {
    repository: Arc<InMemoryOutboxRepository>,
    transport: Arc<ChannelEventPublisher>,
    collector: Arc<InMemoryMetricsCollector>,
    scheduler: OutboxScheduler,
}

fn builder(
    repository: &Arc<InMemoryOutboxRepository>,
    transport: &Arc<ChannelEventPublisher>,
    collector: &Arc<InMemoryMetricsCollector>,
    config: SchedulerConfig,
) -> SchedulerBuilder {
    SchedulerBuilder::new()
        .repository(repository.clone())
        .event_publisher(transport.clone())
        .scheduler_config(config)
        .publisher_config(PublisherConfig::default().with_retry_delay(Duration::ZERO))
        .metrics_collector(collector.clone())
}

fn harness(config: SchedulerConfig) -> Harness {
    let repository = Arc::new(InMemoryOutboxRepository::new());
    let transport = Arc::new(ChannelEventPublisher::new().with_ack_mode(AckMode::Manual));
    let collector = Arc::new(InMemoryMetricsCollector::new());
    let scheduler = builder(&repository, &transport, &collector, config)
        .build()
        .unwrap();
    Harness {
        repository,
        transport,
        collector,
        scheduler,
    }
}

fn fast_config() -> SchedulerConfig {
    SchedulerConfig::default()
        .with_poll_interval(Duration::from_secs(1))
        .with_shutdown_timeout(Duration::from_secs(5))
}

fn order_event(tenant: &str) -> OutboxEvent {
    OutboxEvent::new(tenant, "Order", "order-123", "OrderCreated", &json!({"n": 1})).unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_start_and_stop_are_guarded() {
    let h = harness(fast_config());
    let cancel = CancellationToken::new();

    assert!(matches!(h.scheduler.stop().await, Err(SchedulerError::NotRunning)));

    h.scheduler.start(cancel.clone()).unwrap();
    assert!(h.scheduler.is_running());
    assert!(matches!(
        h.scheduler.start(cancel.clone()),
        Err(SchedulerError::AlreadyRunning)
    ));

    h.scheduler.stop().await.unwrap();
    assert!(!h.scheduler.is_running());
    assert!(matches!(h.scheduler.stop().await, Err(SchedulerError::NotRunning)));

    // A stopped scheduler can be started again.
    h.scheduler.start(cancel).unwrap();
    h.scheduler.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_poll_loop_publishes_pending_events() {
    let h = harness(fast_config());
    let events: Vec<_> = (0..3).map(|_| order_event("t1")).collect();
    h.repository.save_batch(&events).await.unwrap();

    h.scheduler.start(CancellationToken::new()).unwrap();
    tokio::time::sleep(Duration::from_millis(1500)).await;
    h.scheduler.stop().await.unwrap();

    assert_eq!(h.transport.submission_count(), 3);
    let metrics = h.scheduler.metrics().unwrap();
    assert_eq!(metrics.poll_count, 1);
    assert_eq!(metrics.processed_count, 3);
    assert!(metrics.last_poll_at.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_cleanup_tick_removes_expired_published_rows() {
    let h = harness(
        fast_config()
            .with_cleanup_interval(Duration::from_secs(60))
            .with_cleanup_retention(Duration::from_secs(3600)),
    );
    let mut expired = order_event("t1");
    expired.mark_as_published();
    expired.published_at = Some(Utc::now() - chrono::Duration::hours(2));
    let mut recent = order_event("t1");
    recent.mark_as_published();
    h.repository.save_batch(&[expired.clone(), recent.clone()]).await.unwrap();

    h.scheduler.start(CancellationToken::new()).unwrap();
    tokio::time::sleep(Duration::from_secs(61)).await;
    h.scheduler.stop().await.unwrap();

    assert!(h.repository.get(expired.id).is_none());
    assert!(h.repository.get(recent.id).is_some());
    let metrics = h.scheduler.metrics().unwrap();
    assert_eq!(metrics.cleaned_count, 1);
    assert!(metrics.last_cleanup_at.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_stop_times_out_on_long_running_tick() {
    let h = harness(fast_config().with_shutdown_timeout(Duration::from_secs(1)));
    h.repository.save(&order_event("t1")).await.unwrap();
    h.repository.set_delay(Duration::from_secs(10));

    h.scheduler.start(CancellationToken::new()).unwrap();
    tokio::time::sleep(Duration::from_millis(1500)).await;

    let err = h.scheduler.stop().await.unwrap_err();
    assert!(matches!(err, SchedulerError::ShutdownTimeout(d) if d == Duration::from_secs(1)));
    assert!(!h.scheduler.is_running());
}

#[tokio::test(start_paused = true)]
async fn test_stop_waits_for_in_flight_tick() {
    let h = harness(fast_config());
    let event = order_event("t1");
    h.repository.save(&event).await.unwrap();
    h.repository.set_delay(Duration::from_secs(2));

    h.scheduler.start(CancellationToken::new()).unwrap();
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(h.transport.submission_count(), 0);

    h.scheduler.stop().await.unwrap();

    assert_eq!(h.transport.submissions_for(event.id), 1);
}

#[tokio::test(start_paused = true)]
async fn test_tick_errors_are_recorded_and_loop_continues() {
    let h = harness(fast_config());
    h.repository.fail_with("connection reset");

    h.scheduler.start(CancellationToken::new()).unwrap();
    tokio::time::sleep(Duration::from_millis(2500)).await;

    let metrics = h.scheduler.metrics().unwrap();
    assert_eq!(metrics.poll_count, 2);
    assert_eq!(metrics.error_count, 2);
    assert_eq!(
        metrics.last_error.as_deref(),
        Some("Repository error: connection reset")
    );

    h.repository.clear_failure();
    h.repository.save(&order_event("t1")).await.unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(h.scheduler.is_running());
    assert_eq!(h.transport.submission_count(), 1);
    h.scheduler.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_token_stops_loops() {
    let h = harness(fast_config());
    let cancel = CancellationToken::new();
    h.scheduler.start(cancel.clone()).unwrap();
    tokio::time::sleep(Duration::from_millis(1500)).await;

    cancel.cancel();
    tokio::time::sleep(Duration::from_secs(5)).await;
    let polls = h.scheduler.metrics().unwrap().poll_count;
    assert_eq!(polls, 1);

    h.scheduler.stop().await.unwrap();
}

#[tokio::test]
async fn test_repeated_failures_end_in_dead_letter_state() {
    let h = harness(SchedulerConfig::default());
    let event = order_event("t1");
    h.repository.save(&event).await.unwrap();
    h.transport.fail_submissions("broker down");

    assert!(h.scheduler.publisher().publish_event(&event).await.is_err());
    let first = h.repository.get(event.id).unwrap();
    let mut history = vec![(first.status, first.retry_count)];

    for _ in 0..3 {
        h.scheduler.retry_once().await.unwrap();
        let stored = h.repository.get(event.id).unwrap();
        history.push((stored.status, stored.retry_count));
    }

    assert_eq!(
        history,
        vec![
            (EventStatus::Failed, 1),
            (EventStatus::Failed, 2),
            (EventStatus::Failed, 3),
            (EventStatus::MaxRetry, 3),
        ]
    );
    assert_eq!(h.collector.dlq_for_tenant("t1"), 1);
    assert_eq!(h.transport.submission_count(), 0);
}

#[tokio::test]
async fn test_retry_tick_resubmits_and_promotes() {
    let h = harness(SchedulerConfig::default());
    let mut retryable = order_event("t1");
    retryable.mark_as_failed("broker down");
    let mut exhausted = order_event("t1");
    for _ in 0..3 {
        exhausted.mark_as_failed("broker down");
    }
    let mut beyond = order_event("t1");
    for _ in 0..4 {
        beyond.mark_as_failed("broker down");
    }
    h.repository
        .save_batch(&[retryable.clone(), exhausted.clone(), beyond.clone()])
        .await
        .unwrap();

    let report = h.scheduler.retry_once().await.unwrap();

    assert_eq!(report.scanned, 3);
    assert_eq!(report.retried, 1);
    assert_eq!(report.dead_lettered, 2);
    assert!(h.repository.get(retryable.id).unwrap().is_pending());
    assert_eq!(h.transport.submissions_for(retryable.id), 1);
    let promoted = h.repository.get(exhausted.id).unwrap();
    assert!(promoted.is_max_retry());
    assert_eq!(promoted.last_error.as_deref(), Some("broker down"));
    let overshot = h.repository.get(beyond.id).unwrap();
    assert!(overshot.is_max_retry());
    assert_eq!(overshot.retry_count, 4);
    assert_eq!(h.transport.submissions_for(beyond.id), 0);

    let metrics = h.scheduler.metrics().unwrap();
    assert_eq!(metrics.retry_count, 1);
    assert_eq!(metrics.retried_count, 1);
}

#[tokio::test]
async fn test_lower_scheduler_ceiling_still_dead_letters() {
    let h = harness(SchedulerConfig::default().with_max_retries(1));
    let event = order_event("t1");
    h.repository.save(&event).await.unwrap();
    h.transport.fail_submissions("broker down");

    assert!(h.scheduler.publisher().publish_event(&event).await.is_err());
    assert_eq!(h.repository.get(event.id).unwrap().retry_count, 1);

    let report = h.scheduler.retry_once().await.unwrap();
    assert_eq!(report.scanned, 1);
    assert_eq!(report.retried, 0);
    assert_eq!(report.dead_lettered, 1);

    let stored = h.repository.get(event.id).unwrap();
    assert!(stored.is_max_retry());
    assert_eq!(stored.retry_count, 1);
    assert_eq!(h.collector.dlq_for_tenant("t1"), 1);

    for _ in 0..3 {
        let report = h.scheduler.retry_once().await.unwrap();
        assert_eq!(report.scanned, 0);
    }
}

#[tokio::test]
async fn test_lower_publisher_ceiling_still_dead_letters() {
    let repository = Arc::new(InMemoryOutboxRepository::new());
    let transport = Arc::new(ChannelEventPublisher::new().with_ack_mode(AckMode::Manual));
    let collector = Arc::new(InMemoryMetricsCollector::new());
    let scheduler = builder(
        &repository,
        &transport,
        &collector,
        SchedulerConfig::default().with_max_retries(5),
    )
    .publisher_config(
        PublisherConfig::default()
            .with_max_retries(2)
            .with_retry_delay(Duration::ZERO),
    )
    .build()
    .unwrap();

    let event = order_event("t1").with_max_retries(5);
    repository.save(&event).await.unwrap();
    transport.fail_submissions("broker down");

    assert!(scheduler.publisher().publish_event(&event).await.is_err());
    let mut history = Vec::new();
    for _ in 0..3 {
        scheduler.retry_once().await.unwrap();
        let stored = repository.get(event.id).unwrap();
        history.push((stored.status, stored.retry_count));
    }

    assert_eq!(
        history,
        vec![
            (EventStatus::Failed, 2),
            (EventStatus::MaxRetry, 2),
            (EventStatus::MaxRetry, 2),
        ]
    );
    assert_eq!(collector.dlq_for_tenant("t1"), 1);
}

#[tokio::test]
async fn test_dlq_isolates_failures_and_alerts_once() {
    let repository = Arc::new(InMemoryOutboxRepository::new());
    let transport = Arc::new(ChannelEventPublisher::new());
    let collector = Arc::new(InMemoryMetricsCollector::new());

    let mut broken = order_event("t1");
    broken.mark_as_max_retry("exhausted");
    let mut healthy = order_event("t1");
    healthy.mark_as_max_retry("exhausted");
    repository
        .save_batch(&[broken.clone(), healthy.clone()])
        .await
        .unwrap();

    let broken_id = broken.id;
    let handled = Arc::new(parking_lot::Mutex::new(Vec::<Uuid>::new()));
    let handled_clone = Arc::clone(&handled);
    let alerts = Arc::new(AtomicUsize::new(0));
    let alerts_clone = Arc::clone(&alerts);
    let alert: Arc<dyn DlqAlertHandler> =
        Arc::new(FnDlqAlertHandler::new(move |_event: OutboxEvent| {
            let alerts = Arc::clone(&alerts_clone);
            async move {
                alerts.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }));

    let scheduler = builder(&repository, &transport, &collector, SchedulerConfig::default())
        .dlq_handler(Arc::new(FnDlqHandler::new(move |event: OutboxEvent| {
            let handled = Arc::clone(&handled_clone);
            async move {
                if event.id == broken_id {
                    return Err(OutboxError::DlqHandler("archive unavailable".to_string()));
                }
                handled.lock().push(event.id);
                Ok(())
            }
        })))
        .dlq_alert_handler(alert)
        .build()
        .unwrap();

    let first = scheduler.process_dlq_once().await.unwrap();
    assert_eq!(first.scanned, 2);
    assert_eq!(first.handled, 1);
    assert_eq!(first.handler_failures, 1);
    assert_eq!(alerts.load(Ordering::SeqCst), 2);
    assert_eq!(handled.lock().as_slice(), [healthy.id]);

    // Only the unhandled entry comes back.
    let second = scheduler.process_dlq_once().await.unwrap();
    assert_eq!(second.scanned, 1);
    assert_eq!(alerts.load(Ordering::SeqCst), 3);

    assert!(repository.get(healthy.id).unwrap().dlq_handled_at.is_some());
    assert!(repository.get(broken.id).unwrap().dlq_handled_at.is_none());
    assert!(repository.get(broken.id).unwrap().is_max_retry());
    assert_eq!(scheduler.metrics().unwrap().dlq_handled_count, 1);
}

#[tokio::test]
async fn test_health_check_flags_backlog_and_sets_gauges() {
    let h = harness(
        SchedulerConfig::default()
            .with_batch_size(2)
            .with_backlog_multiplier(10),
    );
    let mut events: Vec<_> = (0..21).map(|_| order_event("t1")).collect();
    events[0].created_at = Utc::now() - chrono::Duration::minutes(3);
    let mut failed = order_event("t1");
    failed.mark_as_failed("boom");
    events.push(failed);
    h.repository.save_batch(&events).await.unwrap();

    let report = h.scheduler.health_check_once().await.unwrap();

    assert_eq!(report.pending, 21);
    assert_eq!(report.failed, 1);
    assert_eq!(report.dead_lettered, 0);
    assert!(report.backlog);
    assert!(report.oldest_pending_age.unwrap() >= Duration::from_secs(170));
    assert_eq!(h.collector.pending_count("all"), Some(21));
    assert_eq!(h.collector.failed_count("all"), Some(1));
    assert_eq!(h.collector.dlq_count("all"), Some(0));
}

#[tokio::test]
async fn test_health_check_below_threshold() {
    let h = harness(SchedulerConfig::default().with_tenant_id("t1"));
    h.repository
        .save_batch(&[order_event("t1"), order_event("t2")])
        .await
        .unwrap();

    let report = h.scheduler.health_check_once().await.unwrap();

    assert_eq!(report.pending, 1);
    assert!(!report.backlog);
    assert_eq!(h.collector.pending_count("t1"), Some(1));
}

#[tokio::test]
async fn test_tenant_scope_limits_polling_and_cleanup() {
    let repository = Arc::new(InMemoryOutboxRepository::new());
    let transport = Arc::new(ChannelEventPublisher::new().with_ack_mode(AckMode::Manual));
    let collector = Arc::new(InMemoryMetricsCollector::new());
    let scheduler = builder(&repository, &transport, &collector, SchedulerConfig::default())
        .tenant_id("tenant-a")
        .batch_size(10)
        .build()
        .unwrap();

    let mine = order_event("tenant-a");
    let theirs = order_event("tenant-b");
    let mut old_theirs = order_event("tenant-b");
    old_theirs.mark_as_published();
    old_theirs.published_at = Some(Utc::now() - chrono::Duration::days(3));
    repository
        .save_batch(&[mine.clone(), theirs.clone(), old_theirs.clone()])
        .await
        .unwrap();

    let report = scheduler.poll_once().await.unwrap();
    assert_eq!(report.submitted, 1);
    assert_eq!(transport.submissions_for(mine.id), 1);
    assert_eq!(transport.submissions_for(theirs.id), 0);

    let cleanup = scheduler.cleanup_once().await.unwrap();
    assert_eq!(cleanup.total(), 0);
    assert!(repository.get(old_theirs.id).is_some());
}

#[tokio::test]
async fn test_builder_rejects_invalid_config() {
    let repository = Arc::new(InMemoryOutboxRepository::new());
    let transport = Arc::new(ChannelEventPublisher::new());
    let collector = Arc::new(InMemoryMetricsCollector::new());

    let err = builder(&repository, &transport, &collector, SchedulerConfig::default())
        .poll_interval(Duration::from_millis(10))
        .build()
        .err()
        .unwrap();
    assert!(matches!(err, SchedulerError::InvalidConfig(_)));

    let err = SchedulerBuilder::new()
        .repository(repository)
        .build()
        .err()
        .unwrap();
    assert!(matches!(err, SchedulerError::MissingDependency("event_publisher")));
}

#[tokio::test]
async fn test_metrics_can_be_disabled() {
    let repository = Arc::new(InMemoryOutboxRepository::new());
    let transport = Arc::new(ChannelEventPublisher::new());
    let collector = Arc::new(InMemoryMetricsCollector::new());
    let scheduler = builder(&repository, &transport, &collector, SchedulerConfig::default())
        .metrics_enabled(false)
        .build()
        .unwrap();

    repository.save(&order_event("t1")).await.unwrap();
    let report = scheduler.poll_once().await.unwrap();
    assert_eq!(report.submitted, 1);
    scheduler.health_check_once().await.unwrap();

    assert!(scheduler.metrics().is_none());
    assert!(scheduler.publisher().metrics().is_none());
    assert_eq!(collector.pending_count("all"), None);
}
