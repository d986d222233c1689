//! # Outbox Scheduler
//!
//! Lifecycle controller for the periodic outbox loops:
//!
//! | Loop | Tick |
//! |------|------|
//! | poll | publish up to `batch_size` pending events |
//! | retry | resubmit failed events, dead-letter the exhausted ones |
//! | cleanup | delete published/failed rows past the retention window |
//! | health check | sample status counts, warn on backlog |
//! | DLQ | hand dead-lettered events to the DLQ handler and alert hook |
//!
//! Each enabled loop is a task selecting over its timer, the scheduler's
//! stop signal and the caller's cancellation token. A tick failure is
//! logged and recorded; the loop carries on with the next tick.
//!
//! `stop()` waits, bounded by the shutdown timeout, for every loop to
//! finish its in-flight tick.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::config::{ConfigError, SchedulerConfig};
use crate::dlq::{DlqAlertHandler, DlqHandler, NoOpDlqAlertHandler, NoOpDlqHandler};
use crate::error::{OutboxError, Result};
use crate::event::EventStatus;
use crate::metrics::{MetricsCollector, NoOpMetricsCollector};
use crate::port::OutboxRepository;
use crate::publisher::{BatchPublishReport, OutboxPublisher};

/// Gauge label used when the scheduler spans all tenants.
pub const ALL_TENANTS_LABEL: &str = "all";

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Scheduler is already running")]
    AlreadyRunning,

    #[error("Scheduler is not running")]
    NotRunning,

    #[error("Scheduler shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),

    #[error("Invalid scheduler configuration: {0}")]
    InvalidConfig(#[from] ConfigError),

    #[error("Missing dependency: {0}")]
    MissingDependency(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopKind {
    Poll,
    Retry,
    Cleanup,
    HealthCheck,
    Dlq,
}

impl LoopKind {
    fn name(self) -> &'static str {
        match self {
            LoopKind::Poll => "poll",
            LoopKind::Retry => "retry",
            LoopKind::Cleanup => "cleanup",
            LoopKind::HealthCheck => "health_check",
            LoopKind::Dlq => "dlq",
        }
    }
}

#[derive(Debug, Default)]
struct SchedulerMetrics {
    polls: AtomicU64,
    processed: AtomicU64,
    errors: AtomicU64,
    retry_runs: AtomicU64,
    retried: AtomicU64,
    cleaned: AtomicU64,
    dlq_handled: AtomicU64,
    last_poll_ms: AtomicI64,
    last_cleanup_ms: AtomicI64,
    last_retry_ms: AtomicI64,
    last_error: Mutex<Option<String>>,
}

fn stamp(slot: &AtomicI64) {
    slot.store(Utc::now().timestamp_millis(), Ordering::SeqCst);
}

fn read_stamp(slot: &AtomicI64) -> Option<DateTime<Utc>> {
    match slot.load(Ordering::SeqCst) {
        0 => None,
        ms => DateTime::from_timestamp_millis(ms),
    }
}

/// Point-in-time view of the scheduler counters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SchedulerMetricsSnapshot {
    pub poll_count: u64,
    /// Events submitted by the poll loop.
    pub processed_count: u64,
    pub error_count: u64,
    /// Retry loop ticks.
    pub retry_count: u64,
    /// Events resubmitted by the retry loop.
    pub retried_count: u64,
    pub cleaned_count: u64,
    pub dlq_handled_count: u64,
    pub last_poll_at: Option<DateTime<Utc>>,
    pub last_cleanup_at: Option<DateTime<Utc>>,
    pub last_retry_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Outcome of one retry tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetryReport {
    pub scanned: usize,
    pub retried: usize,
    pub failed: usize,
    /// Promoted to `MaxRetry` during this tick.
    pub dead_lettered: usize,
}

/// Outcome of one cleanup tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub published_deleted: u64,
    pub failed_deleted: u64,
}

impl CleanupReport {
    pub fn total(&self) -> u64 {
        self.published_deleted + self.failed_deleted
    }
}

/// Outcome of one health check.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HealthReport {
    pub pending: u64,
    pub failed: u64,
    pub dead_lettered: u64,
    /// Pending count exceeds `batch_size * backlog_multiplier`.
    pub backlog: bool,
    /// Only available when the repository provides stats.
    pub oldest_pending_age: Option<Duration>,
}

/// Outcome of one DLQ tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DlqReport {
    pub scanned: usize,
    /// Handler succeeded and the event was marked handled.
    pub handled: usize,
    pub handler_failures: usize,
    pub alert_failures: usize,
}

pub(crate) struct SchedulerInner {
    pub(crate) publisher: Arc<OutboxPublisher>,
    pub(crate) repository: Arc<dyn OutboxRepository>,
    pub(crate) config: SchedulerConfig,
    pub(crate) dlq_handler: Arc<dyn DlqHandler>,
    pub(crate) dlq_alert_handler: Arc<dyn DlqAlertHandler>,
    pub(crate) collector: Arc<dyn MetricsCollector>,
    metrics: Option<SchedulerMetrics>,
    running: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
    tracker: TaskTracker,
}

impl SchedulerInner {
    pub(crate) fn new(
        publisher: Arc<OutboxPublisher>,
        config: SchedulerConfig,
        dlq_handler: Arc<dyn DlqHandler>,
        dlq_alert_handler: Arc<dyn DlqAlertHandler>,
    ) -> std::result::Result<Self, SchedulerError> {
        config.validate()?;
        let repository = Arc::clone(publisher.repository());
        let collector: Arc<dyn MetricsCollector> = if config.enable_metrics {
            Arc::clone(publisher.collector())
        } else {
            Arc::new(NoOpMetricsCollector)
        };
        let metrics = config.enable_metrics.then(SchedulerMetrics::default);
        let (shutdown_tx, _) = broadcast::channel(1);
        Ok(Self {
            publisher,
            repository,
            config,
            dlq_handler,
            dlq_alert_handler,
            collector,
            metrics,
            running: AtomicBool::new(false),
            shutdown_tx,
            tracker: TaskTracker::new(),
        })
    }

    fn tenant(&self) -> Option<&str> {
        self.config.tenant_id.as_deref()
    }

    fn tenant_label(&self) -> &str {
        self.tenant().unwrap_or(ALL_TENANTS_LABEL)
    }

    async fn run_loop(
        self: Arc<Self>,
        kind: LoopKind,
        period: Duration,
        mut shutdown: broadcast::Receiver<()>,
        cancel: CancellationToken,
    ) {
        info!(loop_name = kind.name(), interval = ?period, "Outbox scheduler loop started");
        let mut interval = interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.recv() => break,
                _ = cancel.cancelled() => break,
                _ = interval.tick() => self.tick(kind).await,
            }
        }
        info!(loop_name = kind.name(), "Outbox scheduler loop stopped");
    }

    async fn tick(&self, kind: LoopKind) {
        let outcome = match kind {
            LoopKind::Poll => self.poll_once().await.map(|_| ()),
            LoopKind::Retry => self.retry_once().await.map(|_| ()),
            LoopKind::Cleanup => self.cleanup_once().await.map(|_| ()),
            LoopKind::HealthCheck => self.health_check_once().await.map(|_| ()),
            LoopKind::Dlq => self.process_dlq_once().await.map(|_| ()),
        };
        if let Err(e) = outcome {
            error!(loop_name = kind.name(), error = %e, "Outbox scheduler tick failed");
            self.record_error(&e);
        }
    }

    fn record_error(&self, error: &OutboxError) {
        if let Some(metrics) = &self.metrics {
            metrics.errors.fetch_add(1, Ordering::SeqCst);
            *metrics.last_error.lock() = Some(error.to_string());
        }
    }

    async fn poll_once(&self) -> Result<BatchPublishReport> {
        if let Some(metrics) = &self.metrics {
            metrics.polls.fetch_add(1, Ordering::SeqCst);
            stamp(&metrics.last_poll_ms);
        }

        let report = self
            .publisher
            .publish_pending_events(self.config.batch_size, self.tenant())
            .await?;

        if let Some(metrics) = &self.metrics {
            metrics
                .processed
                .fetch_add(report.submitted as u64, Ordering::SeqCst);
        }
        if let Some(e) = report.summary_error() {
            warn!(error = %e, "Poll tick published with failures");
            self.record_error(&e);
        }
        if report.total() > 0 {
            debug!(
                submitted = report.submitted,
                failed = report.failed,
                deferred = report.deferred,
                "Poll tick completed"
            );
        }
        Ok(report)
    }

    /// The lower of the scheduler and publisher retry ceilings.
    fn retry_ceiling(&self) -> u32 {
        self.config
            .max_retries
            .min(self.publisher.config().max_retries)
    }

    async fn retry_once(&self) -> Result<RetryReport> {
        // Every failed row is scanned: overlapping poll and retry failures can
        // push retry_count past the ceiling, and those rows must still be
        // promoted.
        let events = self
            .repository
            .find_events_for_retry(u32::MAX, self.config.batch_size)
            .await?;

        let ceiling = self.retry_ceiling();
        let mut report = RetryReport::default();
        for event in events {
            if self.tenant().is_some_and(|tenant| tenant != event.tenant_id) {
                continue;
            }
            report.scanned += 1;

            if event.can_retry() && event.retry_count < ceiling {
                let event_id = event.id;
                match self.publisher.retry_failed_event(event).await {
                    Ok(()) => report.retried += 1,
                    Err(e) => {
                        report.failed += 1;
                        warn!(event_id = %event_id, error = %e, "Retry attempt failed");
                    }
                }
                continue;
            }

            let message = event
                .last_error
                .clone()
                .unwrap_or_else(|| "max retries exceeded".to_string());
            match self.repository.mark_as_max_retry(event.id, &message).await {
                Ok(()) => {
                    report.dead_lettered += 1;
                    warn!(
                        event_id = %event.id,
                        tenant_id = %event.tenant_id,
                        retry_count = event.retry_count,
                        "Event exhausted its retries and was dead-lettered"
                    );
                    self.collector.record_dlq(
                        &event.tenant_id,
                        &event.aggregate_type,
                        &event.event_type,
                    );
                }
                Err(e) => {
                    report.failed += 1;
                    warn!(event_id = %event.id, error = %e, "Failed to dead-letter event");
                    self.record_error(&e);
                }
            }
        }

        if let Some(metrics) = &self.metrics {
            metrics.retry_runs.fetch_add(1, Ordering::SeqCst);
            metrics
                .retried
                .fetch_add(report.retried as u64, Ordering::SeqCst);
            stamp(&metrics.last_retry_ms);
        }
        if report.scanned > 0 {
            info!(
                scanned = report.scanned,
                retried = report.retried,
                failed = report.failed,
                dead_lettered = report.dead_lettered,
                "Retry tick completed"
            );
        }
        Ok(report)
    }

    async fn cleanup_once(&self) -> Result<CleanupReport> {
        let cutoff = retention_cutoff(self.config.cleanup_retention);
        let published_deleted = self
            .repository
            .delete_published_before(cutoff, self.tenant())
            .await?;
        let failed_deleted = self
            .repository
            .delete_failed_before(cutoff, self.tenant())
            .await?;
        let report = CleanupReport {
            published_deleted,
            failed_deleted,
        };

        if let Some(metrics) = &self.metrics {
            metrics.cleaned.fetch_add(report.total(), Ordering::SeqCst);
            stamp(&metrics.last_cleanup_ms);
        }
        if report.total() > 0 {
            info!(
                published = published_deleted,
                failed = failed_deleted,
                cutoff = %cutoff,
                "Cleaned up outbox events"
            );
        }
        Ok(report)
    }

    async fn health_check_once(&self) -> Result<HealthReport> {
        let counts = self.repository.count_by_status(self.tenant()).await?;
        let count = |status| counts.get(&status).copied().unwrap_or(0);

        let mut report = HealthReport {
            pending: count(EventStatus::Pending),
            failed: count(EventStatus::Failed),
            dead_lettered: count(EventStatus::MaxRetry),
            ..Default::default()
        };
        report.backlog = report.pending > self.config.backlog_threshold();

        let label = self.tenant_label();
        self.collector.set_pending_count(label, report.pending);
        self.collector.set_failed_count(label, report.failed);
        self.collector.set_dlq_count(label, report.dead_lettered);

        if let Some(provider) = self.repository.stats_provider() {
            match provider.stats(self.tenant()).await {
                Ok(stats) => report.oldest_pending_age = stats.oldest_pending_age,
                Err(e) => debug!(error = %e, "Repository stats unavailable"),
            }
        }

        if report.backlog {
            warn!(
                pending = report.pending,
                threshold = self.config.backlog_threshold(),
                oldest_pending_age = ?report.oldest_pending_age,
                "Outbox backlog detected"
            );
        } else {
            debug!(
                pending = report.pending,
                failed = report.failed,
                dead_lettered = report.dead_lettered,
                "Outbox health check"
            );
        }
        Ok(report)
    }

    async fn process_dlq_once(&self) -> Result<DlqReport> {
        let events = self
            .repository
            .find_max_retry_events(self.config.batch_size, self.tenant())
            .await?;

        let mut report = DlqReport {
            scanned: events.len(),
            ..Default::default()
        };
        for event in &events {
            let handled = match self.dlq_handler.handle(event).await {
                Ok(()) => true,
                Err(e) => {
                    report.handler_failures += 1;
                    warn!(event_id = %event.id, error = %e, "DLQ handler failed");
                    false
                }
            };

            if let Err(e) = self.dlq_alert_handler.alert(event).await {
                report.alert_failures += 1;
                warn!(event_id = %event.id, error = %e, "DLQ alert failed");
            }

            if handled {
                match self.repository.mark_dlq_handled(event.id).await {
                    Ok(()) => report.handled += 1,
                    Err(e) => {
                        warn!(event_id = %event.id, error = %e, "Failed to mark DLQ event as handled");
                        self.record_error(&e);
                    }
                }
            }
        }

        if let Some(metrics) = &self.metrics {
            metrics
                .dlq_handled
                .fetch_add(report.handled as u64, Ordering::SeqCst);
        }
        if report.scanned > 0 {
            info!(
                scanned = report.scanned,
                handled = report.handled,
                handler_failures = report.handler_failures,
                alert_failures = report.alert_failures,
                "DLQ tick completed"
            );
        }
        Ok(report)
    }

    fn snapshot(&self) -> Option<SchedulerMetricsSnapshot> {
        self.metrics.as_ref().map(|m| SchedulerMetricsSnapshot {
            poll_count: m.polls.load(Ordering::SeqCst),
            processed_count: m.processed.load(Ordering::SeqCst),
            error_count: m.errors.load(Ordering::SeqCst),
            retry_count: m.retry_runs.load(Ordering::SeqCst),
            retried_count: m.retried.load(Ordering::SeqCst),
            cleaned_count: m.cleaned.load(Ordering::SeqCst),
            dlq_handled_count: m.dlq_handled.load(Ordering::SeqCst),
            last_poll_at: read_stamp(&m.last_poll_ms),
            last_cleanup_at: read_stamp(&m.last_cleanup_ms),
            last_retry_at: read_stamp(&m.last_retry_ms),
            last_error: m.last_error.lock().clone(),
        })
    }
}

/// `now - retention`, clamped to the earliest representable instant.
fn retention_cutoff(retention: Duration) -> DateTime<Utc> {
    let now = Utc::now();
    chrono::Duration::from_std(retention)
        .ok()
        .and_then(|retention| now.checked_sub_signed(retention))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Runs the outbox maintenance loops over a shared publisher.
///
/// Cheap to clone; clones control the same loops.
#[derive(Clone)]
pub struct OutboxScheduler {
    inner: Arc<SchedulerInner>,
}

impl OutboxScheduler {
    /// Scheduler with no-op DLQ hooks. Use [`crate::SchedulerBuilder`] for
    /// the full set of options.
    ///
    /// # Errors
    /// [`SchedulerError::InvalidConfig`] when `config` fails validation.
    pub fn new(
        publisher: Arc<OutboxPublisher>,
        config: SchedulerConfig,
    ) -> std::result::Result<Self, SchedulerError> {
        let inner = SchedulerInner::new(
            publisher,
            config,
            Arc::new(NoOpDlqHandler),
            Arc::new(NoOpDlqAlertHandler),
        )?;
        Ok(Self::from_inner(inner))
    }

    pub(crate) fn from_inner(inner: SchedulerInner) -> Self {
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Spawn every enabled loop.
    ///
    /// Loops exit on [`Self::stop`] or when `cancel` fires.
    pub fn start(&self, cancel: CancellationToken) -> std::result::Result<(), SchedulerError> {
        if self
            .inner
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(SchedulerError::AlreadyRunning);
        }
        self.inner.tracker.reopen();

        let config = &self.inner.config;
        let loops = [
            (LoopKind::Poll, true, config.poll_interval),
            (LoopKind::Retry, config.enable_retry, config.retry_interval),
            (
                LoopKind::Cleanup,
                config.enable_cleanup,
                config.cleanup_interval,
            ),
            (
                LoopKind::HealthCheck,
                config.enable_health_check,
                config.health_check_interval,
            ),
            (LoopKind::Dlq, config.enable_dlq, config.dlq_interval),
        ];

        let mut started = 0;
        for (kind, enabled, period) in loops {
            if !enabled {
                continue;
            }
            let inner = Arc::clone(&self.inner);
            let shutdown = self.inner.shutdown_tx.subscribe();
            self.inner
                .tracker
                .spawn(inner.run_loop(kind, period, shutdown, cancel.clone()));
            started += 1;
        }

        info!(
            loops = started,
            tenant_id = self.inner.tenant_label(),
            batch_size = config.batch_size,
            "Outbox scheduler started"
        );
        Ok(())
    }

    /// Signal every loop to exit and wait for in-flight ticks.
    ///
    /// # Errors
    /// - [`SchedulerError::NotRunning`] when not started
    /// - [`SchedulerError::ShutdownTimeout`] when ticks outlive the shutdown
    ///   timeout; they keep running to completion in the background
    pub async fn stop(&self) -> std::result::Result<(), SchedulerError> {
        if self
            .inner
            .running
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(SchedulerError::NotRunning);
        }

        // Loops already stopped by the cancellation token have no receivers.
        let _ = self.inner.shutdown_tx.send(());
        self.inner.tracker.close();

        let timeout = self.inner.config.effective_shutdown_timeout();
        if tokio::time::timeout(timeout, self.inner.tracker.wait())
            .await
            .is_err()
        {
            warn!(
                timeout = ?timeout,
                in_flight = self.inner.tracker.len(),
                "Outbox scheduler shutdown timed out"
            );
            return Err(SchedulerError::ShutdownTimeout(timeout));
        }

        info!("Outbox scheduler stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Publish one batch of pending events.
    pub async fn poll_once(&self) -> Result<BatchPublishReport> {
        self.inner.poll_once().await
    }

    /// Run one retry pass.
    pub async fn retry_once(&self) -> Result<RetryReport> {
        self.inner.retry_once().await
    }

    /// Run one retention pass.
    pub async fn cleanup_once(&self) -> Result<CleanupReport> {
        self.inner.cleanup_once().await
    }

    pub async fn health_check_once(&self) -> Result<HealthReport> {
        self.inner.health_check_once().await
    }

    /// Run one dead-letter pass.
    pub async fn process_dlq_once(&self) -> Result<DlqReport> {
        self.inner.process_dlq_once().await
    }

    pub fn publisher(&self) -> &Arc<OutboxPublisher> {
        &self.inner.publisher
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    /// `None` when metrics are disabled in the config.
    pub fn metrics(&self) -> Option<SchedulerMetricsSnapshot> {
        self.inner.snapshot()
    }
}
