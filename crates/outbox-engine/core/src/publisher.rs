//! # Outbox Publisher
//!
//! Moves outbox events to the message transport.
//!
//! Submission and confirmation are decoupled:
//! 1. `publish_event` / `publish_batch` hand envelopes to the transport. A
//!    successful submission leaves the event `Pending`.
//! 2. The ACK listener drains the transport's result stream and marks
//!    confirmed events `Published`. A negative acknowledgment leaves the
//!    event `Pending`, so the next poll resubmits it.
//!
//! Submission failures are persisted as `Failed` and picked up by the
//! scheduler's retry loop.

use chrono::{DateTime, Utc};
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{ConfigError, PublisherConfig};
use crate::error::{OutboxError, Result};
use crate::event::OutboxEvent;
use crate::metrics::{MetricsCollector, NoOpMetricsCollector};
use crate::port::{Envelope, EventPublisher, OutboxRepository, PublishResult};
use crate::topic_mapper::TopicMapper;

/// Bound on the repository write made for one acknowledgment.
const ACK_UPDATE_TIMEOUT: Duration = Duration::from_secs(5);

/// Callback invoked on every submission or acknowledgment failure.
///
/// The event is absent for failures reported on the result stream, which
/// only carries the event id.
pub type ErrorHandler = Arc<dyn Fn(Option<&OutboxEvent>, &OutboxError) + Send + Sync>;

#[derive(Debug, Default)]
struct PublisherMetrics {
    published: AtomicU64,
    failed: AtomicU64,
    errors: AtomicU64,
    retries: AtomicU64,
    /// Unix millis; zero until the first confirmed publish.
    last_publish_ms: AtomicI64,
    last_error: Mutex<Option<String>>,
}

impl PublisherMetrics {
    fn record_published(&self) {
        self.published.fetch_add(1, Ordering::SeqCst);
        self.last_publish_ms
            .store(Utc::now().timestamp_millis(), Ordering::SeqCst);
    }

    fn record_failed(&self, error: &str) {
        self.failed.fetch_add(1, Ordering::SeqCst);
        *self.last_error.lock() = Some(error.to_string());
    }

    fn record_error(&self, error: &str) {
        self.errors.fetch_add(1, Ordering::SeqCst);
        *self.last_error.lock() = Some(error.to_string());
    }

    fn snapshot(&self) -> PublisherMetricsSnapshot {
        let last_publish_ms = self.last_publish_ms.load(Ordering::SeqCst);
        PublisherMetricsSnapshot {
            published_count: self.published.load(Ordering::SeqCst),
            failed_count: self.failed.load(Ordering::SeqCst),
            error_count: self.errors.load(Ordering::SeqCst),
            retry_count: self.retries.load(Ordering::SeqCst),
            last_publish_at: (last_publish_ms != 0)
                .then(|| DateTime::from_timestamp_millis(last_publish_ms))
                .flatten(),
            last_error: self.last_error.lock().clone(),
        }
    }

    fn reset(&self) {
        self.published.store(0, Ordering::SeqCst);
        self.failed.store(0, Ordering::SeqCst);
        self.errors.store(0, Ordering::SeqCst);
        self.retries.store(0, Ordering::SeqCst);
        self.last_publish_ms.store(0, Ordering::SeqCst);
        *self.last_error.lock() = None;
    }
}

/// Point-in-time view of the publisher counters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PublisherMetricsSnapshot {
    /// Events confirmed by the transport.
    pub published_count: u64,
    /// Rejected submissions and negative acknowledgments.
    pub failed_count: u64,
    /// Repository errors hit while recording outcomes.
    pub error_count: u64,
    pub retry_count: u64,
    pub last_publish_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Outcome of [`OutboxPublisher::publish_batch`].
///
/// Rejected submissions do not turn the batch into an `Err`: check
/// [`Self::summary_error`] (or `failed`) to detect them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[must_use = "rejected submissions are only reported through `failed` and `summary_error`"]
pub struct BatchPublishReport {
    /// Accepted by the transport; awaiting acknowledgment.
    pub submitted: usize,
    /// Rejected and persisted as `Failed`.
    pub failed: usize,
    /// Skipped because the idempotency key is already published.
    pub already_published: usize,
    /// Skipped because the schedule gate has not passed yet.
    pub deferred: usize,
}

impl BatchPublishReport {
    pub fn total(&self) -> usize {
        self.submitted + self.failed + self.already_published + self.deferred
    }

    /// Summary error when any submission failed.
    ///
    /// The only failure signal for rejected submissions; `publish_batch`
    /// still returns `Ok`.
    pub fn summary_error(&self) -> Option<OutboxError> {
        (self.failed > 0).then(|| OutboxError::BatchPublish {
            failed: self.failed,
            total: self.submitted + self.failed,
        })
    }
}

struct AckListener {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Applies acknowledgments from the result stream to the repository.
#[derive(Clone)]
struct AckReconciler {
    repository: Arc<dyn OutboxRepository>,
    collector: Arc<dyn MetricsCollector>,
    error_handler: Option<ErrorHandler>,
    metrics: Option<Arc<PublisherMetrics>>,
}

impl AckReconciler {
    async fn run(self, token: CancellationToken, mut results: broadcast::Receiver<PublishResult>) {
        info!("ACK listener started");
        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                received = results.recv() => match received {
                    Ok(result) => self.apply(result).await,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "ACK listener lagged; skipped events stay pending and will be resubmitted");
                    }
                    Err(RecvError::Closed) => {
                        info!("Publish result channel closed");
                        break;
                    }
                },
            }
        }
        info!("ACK listener stopped");
    }

    async fn apply(&self, result: PublishResult) {
        if result.success {
            self.confirm(&result).await;
        } else {
            self.reject(&result);
        }
    }

    async fn confirm(&self, result: &PublishResult) {
        let outcome = tokio::time::timeout(
            ACK_UPDATE_TIMEOUT,
            self.repository.mark_as_published(result.event_id),
        )
        .await
        .unwrap_or_else(|_| {
            Err(OutboxError::repository(format!(
                "marking event {} as published timed out after {ACK_UPDATE_TIMEOUT:?}",
                result.event_id
            )))
        });

        match outcome {
            Ok(()) => {
                debug!(event_id = %result.event_id, topic = %result.topic, "Event confirmed");
                if let Some(metrics) = &self.metrics {
                    metrics.record_published();
                }
                self.collector.record_published(
                    &result.tenant_id,
                    &result.aggregate_type,
                    &result.event_type,
                );
            }
            Err(e) => {
                warn!(event_id = %result.event_id, error = %e, "Failed to mark event as published");
                if let Some(metrics) = &self.metrics {
                    metrics.record_error(&e.to_string());
                }
                if let Some(handler) = &self.error_handler {
                    handler(None, &e);
                }
            }
        }
    }

    fn reject(&self, result: &PublishResult) {
        let message = result.error.as_deref().unwrap_or("negative acknowledgment");
        warn!(
            event_id = %result.event_id,
            topic = %result.topic,
            error = message,
            "Transport reported delivery failure; event stays pending"
        );
        let error = OutboxError::transport(message);
        if let Some(handler) = &self.error_handler {
            handler(None, &error);
        }
        if let Some(metrics) = &self.metrics {
            metrics.record_failed(message);
        }
        self.collector.record_failed(
            &result.tenant_id,
            &result.aggregate_type,
            &result.event_type,
            message,
        );
    }
}

/// Publishes outbox events and reconciles transport acknowledgments.
pub struct OutboxPublisher {
    repository: Arc<dyn OutboxRepository>,
    event_publisher: Arc<dyn EventPublisher>,
    topic_mapper: Arc<dyn TopicMapper>,
    config: PublisherConfig,
    collector: Arc<dyn MetricsCollector>,
    error_handler: Option<ErrorHandler>,
    metrics: Option<Arc<PublisherMetrics>>,
    ack_listener: Mutex<Option<AckListener>>,
}

impl OutboxPublisher {
    /// # Errors
    /// [`ConfigError`] when `config` fails validation.
    pub fn new(
        repository: Arc<dyn OutboxRepository>,
        event_publisher: Arc<dyn EventPublisher>,
        topic_mapper: Arc<dyn TopicMapper>,
        config: PublisherConfig,
    ) -> std::result::Result<Self, ConfigError> {
        config.validate()?;
        let metrics = config
            .enable_metrics
            .then(|| Arc::new(PublisherMetrics::default()));
        Ok(Self {
            repository,
            event_publisher,
            topic_mapper,
            config,
            collector: Arc::new(NoOpMetricsCollector),
            error_handler: None,
            metrics,
            ack_listener: Mutex::new(None),
        })
    }

    pub fn with_metrics_collector(mut self, collector: Arc<dyn MetricsCollector>) -> Self {
        self.collector = collector;
        self
    }

    pub fn with_error_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(Option<&OutboxEvent>, &OutboxError) + Send + Sync + 'static,
    {
        self.error_handler = Some(Arc::new(handler));
        self
    }

    pub(crate) fn with_shared_error_handler(mut self, handler: Option<ErrorHandler>) -> Self {
        self.error_handler = handler;
        self
    }

    pub fn config(&self) -> &PublisherConfig {
        &self.config
    }

    pub(crate) fn repository(&self) -> &Arc<dyn OutboxRepository> {
        &self.repository
    }

    pub(crate) fn collector(&self) -> &Arc<dyn MetricsCollector> {
        &self.collector
    }

    /// Whether `event` may go through [`Self::retry_failed_event`].
    ///
    /// The publisher ceiling caps the event's own ceiling.
    pub fn can_retry(&self, event: &OutboxEvent) -> bool {
        event.can_retry() && event.retry_count < self.config.max_retries
    }

    /// Submit one event to the transport.
    ///
    /// Returns `Ok` without contacting the transport when the event's
    /// idempotency key already belongs to a published record. On success the
    /// event stays `Pending` until the ACK listener sees its confirmation.
    ///
    /// # Errors
    /// - [`OutboxError::ScheduledForLater`] when the schedule gate is closed
    /// - [`OutboxError::NoTopic`] when the topic mapper returns nothing
    /// - the transport error, after the event was persisted as `Failed`.
    ///   A failure to persist is logged and counted in
    ///   [`PublisherMetricsSnapshot::error_count`]; the transport error is
    ///   still the one returned.
    pub async fn publish_event(&self, event: &OutboxEvent) -> Result<()> {
        let started = Instant::now();

        let Some(mut event) = self.resolve_stored(event).await? else {
            debug!(event_id = %event.id, "Event already published; skipping");
            return Ok(());
        };

        if !event.should_publish_now() {
            return Err(scheduled_for_later(&event));
        }

        let topic = self.topic_mapper.topic_for(&event.aggregate_type);
        if topic.is_empty() {
            return Err(OutboxError::NoTopic(event.aggregate_type.clone()));
        }

        if let Err(e) = self.submit(&topic, &event).await {
            event.mark_as_failed(&e.to_string());
            self.report_submission_failure(&event, &e);
            if let Err(persist) = self.repository.update(&event).await {
                warn!(event_id = %event.id, error = %persist, "Failed to persist failed event");
                if let Some(metrics) = &self.metrics {
                    metrics.record_error(&persist.to_string());
                }
            }
            return Err(e);
        }

        self.collector.record_publish_duration(
            &event.tenant_id,
            &event.aggregate_type,
            &event.event_type,
            started.elapsed(),
        );
        debug!(event_id = %event.id, topic = %topic, "Event submitted");
        Ok(())
    }

    /// Submit a batch of events.
    ///
    /// Already published idempotency keys and events scheduled for later
    /// are skipped. Rejected events are persisted as `Failed` in one
    /// `batch_update` call.
    ///
    /// Rejected submissions are not errors: the batch still returns `Ok` and
    /// callers must check [`BatchPublishReport::summary_error`].
    ///
    /// # Errors
    /// Repository errors raised while resolving idempotency keys.
    pub async fn publish_batch(&self, events: Vec<OutboxEvent>) -> Result<BatchPublishReport> {
        let mut report = BatchPublishReport::default();
        if events.is_empty() {
            return Ok(report);
        }

        let mut ready = Vec::with_capacity(events.len());
        for event in &events {
            match self.resolve_stored(event).await? {
                None => report.already_published += 1,
                Some(stored) if !stored.should_publish_now() => report.deferred += 1,
                Some(stored) => ready.push(stored),
            }
        }

        let outcomes = if self.config.concurrent_publish && ready.len() > 1 {
            self.submit_concurrently(ready).await
        } else {
            let mut outcomes = Vec::with_capacity(ready.len());
            for event in ready {
                let outcome = self.submit_resolving_topic(&event).await;
                outcomes.push((event, outcome));
            }
            outcomes
        };

        let mut failed_events = Vec::new();
        for (mut event, outcome) in outcomes {
            match outcome {
                Ok(elapsed) => {
                    report.submitted += 1;
                    self.collector.record_publish_duration(
                        &event.tenant_id,
                        &event.aggregate_type,
                        &event.event_type,
                        elapsed,
                    );
                }
                Err(e) => {
                    report.failed += 1;
                    event.mark_as_failed(&e.to_string());
                    self.report_submission_failure(&event, &e);
                    failed_events.push(event);
                }
            }
        }

        if !failed_events.is_empty() {
            if let Err(e) = self.repository.batch_update(&failed_events).await {
                warn!(count = failed_events.len(), error = %e, "Failed to persist failed events");
                if let Some(metrics) = &self.metrics {
                    metrics.record_error(&e.to_string());
                }
            }
        }

        debug!(
            submitted = report.submitted,
            failed = report.failed,
            already_published = report.already_published,
            deferred = report.deferred,
            "Batch published"
        );
        Ok(report)
    }

    /// Load up to `limit` pending events and publish them as one batch.
    pub async fn publish_pending_events(
        &self,
        limit: usize,
        tenant_id: Option<&str>,
    ) -> Result<BatchPublishReport> {
        let events = self
            .repository
            .find_pending_events(limit, tenant_id)
            .await?;
        self.publish_batch(events).await
    }

    /// Put a failed event back in play and resubmit it after `retry_delay`.
    ///
    /// # Errors
    /// [`OutboxError::RetriesExhausted`] when no retry budget is left, or the
    /// error of the resubmission.
    pub async fn retry_failed_event(&self, mut event: OutboxEvent) -> Result<()> {
        if !self.can_retry(&event) {
            return Err(OutboxError::RetriesExhausted {
                event_id: event.id,
                retry_count: event.retry_count,
            });
        }

        event.reset_for_retry();
        self.repository.update(&event).await?;

        if let Some(metrics) = &self.metrics {
            metrics.retries.fetch_add(1, Ordering::SeqCst);
        }
        self.collector
            .record_retry(&event.tenant_id, &event.aggregate_type, &event.event_type);

        if !self.config.retry_delay.is_zero() {
            tokio::time::sleep(self.config.retry_delay).await;
        }

        self.publish_event(&event).await
    }

    /// Start reconciling acknowledgments from the transport's result stream.
    ///
    /// Returns `false` when a listener is already running. The listener stops
    /// when `cancel` fires or [`Self::stop_ack_listener`] is called.
    pub fn start_ack_listener(&self, cancel: &CancellationToken) -> bool {
        self.start_ack_listener_with_channel(cancel, self.event_publisher.result_channel())
    }

    /// Like [`Self::start_ack_listener`] with a caller-supplied result stream,
    /// e.g. one scoped to a single tenant.
    pub fn start_ack_listener_with_channel(
        &self,
        cancel: &CancellationToken,
        results: broadcast::Receiver<PublishResult>,
    ) -> bool {
        let mut slot = self.ack_listener.lock();
        if slot
            .as_ref()
            .is_some_and(|listener| !listener.handle.is_finished())
        {
            debug!("ACK listener already running");
            return false;
        }

        let token = cancel.child_token();
        let reconciler = AckReconciler {
            repository: Arc::clone(&self.repository),
            collector: Arc::clone(&self.collector),
            error_handler: self.error_handler.clone(),
            metrics: self.metrics.clone(),
        };
        let handle = tokio::spawn(reconciler.run(token.clone(), results));
        *slot = Some(AckListener { token, handle });
        true
    }

    /// Stop the ACK listener and wait for it to exit. No-op when not running.
    pub async fn stop_ack_listener(&self) {
        let listener = self.ack_listener.lock().take();
        if let Some(listener) = listener {
            listener.token.cancel();
            if let Err(e) = listener.handle.await {
                warn!(error = %e, "ACK listener task ended abnormally");
            }
        }
    }

    pub fn is_ack_listener_running(&self) -> bool {
        self.ack_listener
            .lock()
            .as_ref()
            .is_some_and(|listener| !listener.handle.is_finished())
    }

    /// `None` when metrics are disabled in the config.
    pub fn metrics(&self) -> Option<PublisherMetricsSnapshot> {
        self.metrics.as_ref().map(|m| m.snapshot())
    }

    pub fn reset_metrics(&self) {
        if let Some(metrics) = &self.metrics {
            metrics.reset();
        }
    }

    /// The record to publish for `event`, or `None` when its idempotency
    /// key is already published.
    async fn resolve_stored(&self, event: &OutboxEvent) -> Result<Option<OutboxEvent>> {
        let Some(key) = event.idempotency_key.as_deref() else {
            return Ok(Some(event.clone()));
        };
        match self.repository.find_by_idempotency_key(key).await? {
            Some(stored) if stored.is_published() => Ok(None),
            Some(stored) => Ok(Some(stored)),
            None => Ok(Some(event.clone())),
        }
    }

    async fn submit(&self, topic: &str, event: &OutboxEvent) -> Result<()> {
        let envelope = Envelope::from(event);
        let submission = self.event_publisher.publish_envelope(topic, &envelope);
        if self.config.publish_timeout.is_zero() {
            return submission.await;
        }
        tokio::time::timeout(self.config.publish_timeout, submission)
            .await
            .unwrap_or(Err(OutboxError::PublishTimeout {
                event_id: event.id,
                timeout: self.config.publish_timeout,
            }))
    }

    async fn submit_resolving_topic(&self, event: &OutboxEvent) -> Result<Duration> {
        let started = Instant::now();
        let topic = self.topic_mapper.topic_for(&event.aggregate_type);
        if topic.is_empty() {
            return Err(OutboxError::NoTopic(event.aggregate_type.clone()));
        }
        self.submit(&topic, event).await?;
        Ok(started.elapsed())
    }

    async fn submit_concurrently(
        &self,
        events: Vec<OutboxEvent>,
    ) -> Vec<(OutboxEvent, Result<Duration>)> {
        let permits = Semaphore::new(self.config.publish_concurrency.max(1));
        let mut in_flight: FuturesUnordered<_> = events
            .into_iter()
            .map(|event| {
                let permits = &permits;
                async move {
                    let _permit = permits.acquire().await;
                    let outcome = self.submit_resolving_topic(&event).await;
                    (event, outcome)
                }
            })
            .collect();

        let mut outcomes = Vec::new();
        while let Some(outcome) = in_flight.next().await {
            outcomes.push(outcome);
        }
        outcomes
    }

    fn report_submission_failure(&self, event: &OutboxEvent, error: &OutboxError) {
        let message = error.to_string();
        warn!(
            event_id = %event.id,
            tenant_id = %event.tenant_id,
            retry_count = event.retry_count,
            error = %message,
            "Event submission failed"
        );
        if let Some(handler) = &self.error_handler {
            handler(Some(event), error);
        }
        if let Some(metrics) = &self.metrics {
            metrics.record_failed(&message);
        }
        self.collector.record_failed(
            &event.tenant_id,
            &event.aggregate_type,
            &event.event_type,
            &message,
        );
    }
}

impl Drop for OutboxPublisher {
    fn drop(&mut self) {
        if let Some(listener) = self.ack_listener.get_mut().take() {
            listener.token.cancel();
        }
    }
}

fn scheduled_for_later(event: &OutboxEvent) -> OutboxError {
    OutboxError::ScheduledForLater {
        event_id: event.id,
        scheduled_at: event.scheduled_at.unwrap_or(event.created_at),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topic_mapper::{DefaultTopicMapper, StaticTopicMapper};
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use serde_json::json;
    use std::collections::HashMap;

    /// Minimal store for unit tests; the full fake lives in the testing crate.
    #[derive(Default)]
    struct MapRepository {
        events: Mutex<HashMap<uuid::Uuid, OutboxEvent>>,
        reject_updates: std::sync::atomic::AtomicBool,
    }

    impl MapRepository {
        fn get(&self, id: uuid::Uuid) -> Option<OutboxEvent> {
            self.events.lock().get(&id).cloned()
        }

        fn insert(&self, event: &OutboxEvent) {
            self.events.lock().insert(event.id, event.clone());
        }
    }

    #[async_trait]
    impl OutboxRepository for MapRepository {
        async fn save(&self, event: &OutboxEvent) -> Result<()> {
            self.insert(event);
            Ok(())
        }
        async fn save_batch(&self, events: &[OutboxEvent]) -> Result<()> {
            events.iter().for_each(|e| self.insert(e));
            Ok(())
        }
        async fn update(&self, event: &OutboxEvent) -> Result<()> {
            if self.reject_updates.load(Ordering::SeqCst) {
                return Err(OutboxError::repository("disk full"));
            }
            self.insert(event);
            Ok(())
        }
        async fn find_by_id(&self, id: uuid::Uuid) -> Result<Option<OutboxEvent>> {
            Ok(self.get(id))
        }
        async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<OutboxEvent>> {
            Ok(self
                .events
                .lock()
                .values()
                .find(|e| e.idempotency_key.as_deref() == Some(key))
                .cloned())
        }
        async fn find_by_aggregate_id(&self, _: &str, _: Option<&str>) -> Result<Vec<OutboxEvent>> {
            Ok(Vec::new())
        }
        async fn find_by_aggregate_type(&self, _: &str, _: usize) -> Result<Vec<OutboxEvent>> {
            Ok(Vec::new())
        }
        async fn find_pending_events(&self, limit: usize, _: Option<&str>) -> Result<Vec<OutboxEvent>> {
            Ok(self
                .events
                .lock()
                .values()
                .filter(|e| e.is_pending())
                .take(limit)
                .cloned()
                .collect())
        }
        async fn find_pending_events_with_delay(
            &self,
            _: Option<&str>,
            _: Duration,
            _: usize,
        ) -> Result<Vec<OutboxEvent>> {
            Ok(Vec::new())
        }
        async fn find_events_for_retry(&self, _: u32, _: usize) -> Result<Vec<OutboxEvent>> {
            Ok(Vec::new())
        }
        async fn find_max_retry_events(&self, _: usize, _: Option<&str>) -> Result<Vec<OutboxEvent>> {
            Ok(Vec::new())
        }
        async fn mark_as_published(&self, id: uuid::Uuid) -> Result<()> {
            match self.events.lock().get_mut(&id) {
                Some(event) => {
                    event.mark_as_published();
                    Ok(())
                }
                None => Err(OutboxError::NotFound(id)),
            }
        }
        async fn mark_as_failed(&self, _: uuid::Uuid, _: &str) -> Result<()> {
            Ok(())
        }
        async fn increment_retry(&self, _: uuid::Uuid, _: &str) -> Result<()> {
            Ok(())
        }
        async fn mark_as_max_retry(&self, _: uuid::Uuid, _: &str) -> Result<()> {
            Ok(())
        }
        async fn mark_dlq_handled(&self, _: uuid::Uuid) -> Result<()> {
            Ok(())
        }
        async fn delete(&self, _: uuid::Uuid) -> Result<()> {
            Ok(())
        }
        async fn delete_batch(&self, _: &[uuid::Uuid]) -> Result<u64> {
            Ok(0)
        }
        async fn delete_published_before(&self, _: DateTime<Utc>, _: Option<&str>) -> Result<u64> {
            Ok(0)
        }
        async fn delete_failed_before(&self, _: DateTime<Utc>, _: Option<&str>) -> Result<u64> {
            Ok(0)
        }
        async fn count(&self, _: Option<crate::EventStatus>, _: Option<&str>) -> Result<u64> {
            Ok(0)
        }
        async fn count_by_status(
            &self,
            _: Option<&str>,
        ) -> Result<HashMap<crate::EventStatus, u64>> {
            Ok(HashMap::new())
        }
    }

    /// Transport that records topics and can be told to reject submissions.
    struct ScriptedTransport {
        topics: Mutex<Vec<String>>,
        reject: bool,
        delay: Duration,
        results: broadcast::Sender<PublishResult>,
    }

    impl ScriptedTransport {
        fn new(reject: bool) -> Self {
            let (results, _) = broadcast::channel(64);
            Self {
                topics: Mutex::new(Vec::new()),
                reject,
                delay: Duration::ZERO,
                results,
            }
        }

        fn submissions(&self) -> usize {
            self.topics.lock().len()
        }
    }

    #[async_trait]
    impl EventPublisher for ScriptedTransport {
        async fn publish_envelope(&self, topic: &str, _envelope: &Envelope) -> Result<()> {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.topics.lock().push(topic.to_string());
            if self.reject {
                Err(OutboxError::transport("broker unavailable"))
            } else {
                Ok(())
            }
        }

        fn result_channel(&self) -> broadcast::Receiver<PublishResult> {
            self.results.subscribe()
        }
    }

    fn order_event() -> OutboxEvent {
        OutboxEvent::new("t1", "Order", "order-123", "OrderCreated", &json!({"n": 1})).unwrap()
    }

    fn publisher(
        repository: Arc<MapRepository>,
        transport: Arc<ScriptedTransport>,
        config: PublisherConfig,
    ) -> OutboxPublisher {
        OutboxPublisher::new(repository, transport, Arc::new(DefaultTopicMapper), config).unwrap()
    }

    #[tokio::test]
    async fn test_publish_event_leaves_event_pending() {
        let repository = Arc::new(MapRepository::default());
        let transport = Arc::new(ScriptedTransport::new(false));
        let event = order_event();
        repository.insert(&event);

        let publisher = publisher(repository.clone(), transport.clone(), PublisherConfig::default());
        publisher.publish_event(&event).await.unwrap();

        assert_eq!(transport.topics.lock().as_slice(), ["Order-events"]);
        assert!(repository.get(event.id).unwrap().is_pending());
    }

    #[tokio::test]
    async fn test_publish_event_skips_published_key() {
        let repository = Arc::new(MapRepository::default());
        let transport = Arc::new(ScriptedTransport::new(false));
        let mut event = order_event();
        event.mark_as_published();
        repository.insert(&event);

        let publisher = publisher(repository, transport.clone(), PublisherConfig::default());
        let mut resubmitted = event.clone();
        resubmitted.status = crate::EventStatus::Pending;
        publisher.publish_event(&resubmitted).await.unwrap();
        publisher.publish_event(&resubmitted).await.unwrap();

        assert_eq!(transport.submissions(), 0);
    }

    #[tokio::test]
    async fn test_publish_event_rejects_scheduled_event() {
        let repository = Arc::new(MapRepository::default());
        let transport = Arc::new(ScriptedTransport::new(false));
        let event = order_event().with_scheduled_at(Utc::now() + ChronoDuration::hours(1));

        let publisher = publisher(repository, transport.clone(), PublisherConfig::default());
        let err = publisher.publish_event(&event).await.unwrap_err();

        assert!(matches!(err, OutboxError::ScheduledForLater { .. }));
        assert_eq!(transport.submissions(), 0);
    }

    #[tokio::test]
    async fn test_publish_event_without_topic() {
        let repository = Arc::new(MapRepository::default());
        let transport = Arc::new(ScriptedTransport::new(false));
        let publisher = OutboxPublisher::new(
            repository,
            transport.clone(),
            Arc::new(StaticTopicMapper::new("")),
            PublisherConfig::default(),
        )
        .unwrap();

        let err = publisher.publish_event(&order_event()).await.unwrap_err();
        assert!(matches!(err, OutboxError::NoTopic(ref t) if t == "Order"));
        assert_eq!(transport.submissions(), 0);
    }

    #[tokio::test]
    async fn test_submission_failure_marks_failed_and_notifies() {
        let repository = Arc::new(MapRepository::default());
        let transport = Arc::new(ScriptedTransport::new(true));
        let event = order_event();
        repository.insert(&event);

        let seen = Arc::new(AtomicU64::new(0));
        let seen_clone = Arc::clone(&seen);
        let publisher = publisher(repository.clone(), transport, PublisherConfig::default())
            .with_error_handler(move |event, error| {
                assert!(event.is_some());
                assert!(error.is_transport());
                seen_clone.fetch_add(1, Ordering::SeqCst);
            });

        let err = publisher.publish_event(&event).await.unwrap_err();

        assert!(err.is_transport());
        let stored = repository.get(event.id).unwrap();
        assert!(stored.is_failed());
        assert_eq!(stored.retry_count, 1);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        let metrics = publisher.metrics().unwrap();
        assert_eq!(metrics.failed_count, 1);
        assert!(metrics.last_error.unwrap().contains("broker unavailable"));
    }

    #[tokio::test]
    async fn test_submission_failure_reported_when_persist_fails() {
        let repository = Arc::new(MapRepository::default());
        repository.reject_updates.store(true, Ordering::SeqCst);
        let transport = Arc::new(ScriptedTransport::new(true));
        let event = order_event();
        repository.insert(&event);

        let seen = Arc::new(AtomicU64::new(0));
        let seen_clone = Arc::clone(&seen);
        let publisher = publisher(repository.clone(), transport, PublisherConfig::default())
            .with_error_handler(move |_, error| {
                assert!(error.is_transport());
                seen_clone.fetch_add(1, Ordering::SeqCst);
            });

        let err = publisher.publish_event(&event).await.unwrap_err();

        assert!(err.is_transport());
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert!(repository.get(event.id).unwrap().is_pending());
        let metrics = publisher.metrics().unwrap();
        assert_eq!(metrics.failed_count, 1);
        assert_eq!(metrics.error_count, 1);
        assert!(metrics.last_error.unwrap().contains("disk full"));
    }

    #[tokio::test]
    async fn test_rejected_batch_is_ok_with_summary_error() {
        let repository = Arc::new(MapRepository::default());
        let transport = Arc::new(ScriptedTransport::new(true));
        let events = vec![order_event(), order_event()];
        events.iter().for_each(|e| repository.insert(e));

        let publisher = publisher(repository.clone(), transport, PublisherConfig::default());
        let report = publisher.publish_batch(events.clone()).await.unwrap();

        assert_eq!(report.failed, 2);
        assert_eq!(report.submitted, 0);
        assert!(matches!(
            report.summary_error(),
            Some(OutboxError::BatchPublish { failed: 2, total: 2 })
        ));
        assert!(events.iter().all(|e| repository.get(e.id).unwrap().is_failed()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_timeout() {
        let repository = Arc::new(MapRepository::default());
        let mut transport = ScriptedTransport::new(false);
        transport.delay = Duration::from_secs(10);
        let event = order_event();
        repository.insert(&event);

        let publisher = publisher(
            repository.clone(),
            Arc::new(transport),
            PublisherConfig::default().with_publish_timeout(Duration::from_secs(1)),
        );
        let err = publisher.publish_event(&event).await.unwrap_err();

        assert!(matches!(err, OutboxError::PublishTimeout { .. }));
        assert!(repository.get(event.id).unwrap().is_failed());
    }

    #[tokio::test]
    async fn test_retry_failed_event_gates_on_budget() {
        let repository = Arc::new(MapRepository::default());
        let transport = Arc::new(ScriptedTransport::new(false));
        let publisher = publisher(
            repository.clone(),
            transport.clone(),
            PublisherConfig::default().with_retry_delay(Duration::ZERO),
        );

        let mut exhausted = order_event().with_max_retries(1);
        exhausted.mark_as_failed("boom");
        let err = publisher.retry_failed_event(exhausted).await.unwrap_err();
        assert!(matches!(err, OutboxError::RetriesExhausted { retry_count: 1, .. }));

        let mut retryable = order_event();
        retryable.mark_as_failed("boom");
        repository.insert(&retryable);
        publisher.retry_failed_event(retryable.clone()).await.unwrap();

        assert!(repository.get(retryable.id).unwrap().is_pending());
        assert_eq!(transport.submissions(), 1);
        assert_eq!(publisher.metrics().unwrap().retry_count, 1);
    }

    #[tokio::test]
    async fn test_publisher_ceiling_caps_event_ceiling() {
        let publisher = publisher(
            Arc::new(MapRepository::default()),
            Arc::new(ScriptedTransport::new(false)),
            PublisherConfig::default().with_max_retries(1),
        );
        let mut event = order_event().with_max_retries(5);
        assert!(publisher.can_retry(&event));
        event.mark_as_failed("boom");
        assert!(!publisher.can_retry(&event));
    }

    #[tokio::test]
    async fn test_ack_listener_applies_results() {
        let repository = Arc::new(MapRepository::default());
        let transport = Arc::new(ScriptedTransport::new(false));
        let confirmed = order_event();
        let rejected = order_event();
        repository.insert(&confirmed);
        repository.insert(&rejected);

        let publisher = publisher(repository.clone(), transport.clone(), PublisherConfig::default());
        let cancel = CancellationToken::new();
        assert!(publisher.start_ack_listener(&cancel));
        assert!(!publisher.start_ack_listener(&cancel));
        assert!(publisher.is_ack_listener_running());

        let ok = Envelope::from(&confirmed);
        let nack = Envelope::from(&rejected);
        transport
            .results
            .send(PublishResult::success("Order-events", &ok))
            .unwrap();
        transport
            .results
            .send(PublishResult::failure("Order-events", &nack, "nack"))
            .unwrap();

        for _ in 0..100 {
            if repository.get(confirmed.id).unwrap().is_published() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        publisher.stop_ack_listener().await;

        let stored = repository.get(confirmed.id).unwrap();
        assert!(stored.is_published());
        assert!(stored.published_at.is_some());
        assert!(repository.get(rejected.id).unwrap().is_pending());
        assert!(!publisher.is_ack_listener_running());
        assert_eq!(publisher.metrics().unwrap().published_count, 1);
    }

    #[tokio::test]
    async fn test_stop_ack_listener_is_idempotent() {
        let publisher = publisher(
            Arc::new(MapRepository::default()),
            Arc::new(ScriptedTransport::new(false)),
            PublisherConfig::default(),
        );
        publisher.stop_ack_listener().await;

        let cancel = CancellationToken::new();
        assert!(publisher.start_ack_listener(&cancel));
        publisher.stop_ack_listener().await;
        publisher.stop_ack_listener().await;
        assert!(publisher.start_ack_listener(&cancel));
        publisher.stop_ack_listener().await;
    }

    #[tokio::test]
    async fn test_metrics_disabled_and_reset() {
        let disabled = publisher(
            Arc::new(MapRepository::default()),
            Arc::new(ScriptedTransport::new(false)),
            PublisherConfig::default().with_metrics(false),
        );
        assert!(disabled.metrics().is_none());

        let repository = Arc::new(MapRepository::default());
        let event = order_event();
        repository.insert(&event);
        let enabled = publisher(
            repository,
            Arc::new(ScriptedTransport::new(true)),
            PublisherConfig::default(),
        );
        let _ = enabled.publish_event(&event).await;
        assert_eq!(enabled.metrics().unwrap().failed_count, 1);
        enabled.reset_metrics();
        assert_eq!(enabled.metrics().unwrap(), PublisherMetricsSnapshot::default());
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let result = OutboxPublisher::new(
            Arc::new(MapRepository::default()),
            Arc::new(ScriptedTransport::new(false)),
            Arc::new(DefaultTopicMapper),
            PublisherConfig::default().with_max_retries(500),
        );
        assert!(matches!(result, Err(ConfigError::OutOfRange { field: "max_retries", .. })));
    }

    #[test]
    fn test_batch_report_summary() {
        let clean = BatchPublishReport {
            submitted: 3,
            already_published: 1,
            ..Default::default()
        };
        assert!(clean.summary_error().is_none());
        assert_eq!(clean.total(), 4);

        let partial = BatchPublishReport {
            submitted: 3,
            failed: 2,
            ..Default::default()
        };
        assert_eq!(
            partial.summary_error().unwrap().to_string(),
            "Failed to publish 2 of 5 events"
        );
    }
}
