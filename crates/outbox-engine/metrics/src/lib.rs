//! # outbox-engine-metrics
//!
//! Prometheus implementation of the outbox `MetricsCollector` hook.
//!
//! Collection only: expose [`PrometheusMetricsCollector::gather`] from
//! whatever HTTP server the host process already runs.

use outbox_engine_core::MetricsCollector;
use prometheus::{Encoder, TextEncoder};
use std::time::Duration;

const EVENT_LABELS: &[&str] = &["tenant_id", "aggregate_type", "event_type"];
const TENANT_LABELS: &[&str] = &["tenant_id"];

/// Default buckets of the publish duration histogram, in seconds.
pub const DEFAULT_DURATION_BUCKETS: &[f64] = &[0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0];

/// Prometheus metrics for outbox publishing
#[derive(Clone)]
pub struct PrometheusMetricsCollector {
    registry: prometheus::Registry,

    published: prometheus::IntCounterVec,
    failed: prometheus::IntCounterVec,
    retries: prometheus::IntCounterVec,
    dead_lettered: prometheus::IntCounterVec,
    publish_duration: prometheus::HistogramVec,

    pending: prometheus::IntGaugeVec,
    failed_pending: prometheus::IntGaugeVec,
    dlq_size: prometheus::IntGaugeVec,
}

impl PrometheusMetricsCollector {
    /// Collector on a fresh registry with the default buckets.
    pub fn new() -> Result<Self, prometheus::Error> {
        Self::with_registry(prometheus::Registry::new(), DEFAULT_DURATION_BUCKETS.to_vec())
    }

    /// Register the outbox metrics on an existing registry.
    ///
    /// Fails when `registry` already holds metrics with the same names.
    pub fn with_registry(
        registry: prometheus::Registry,
        duration_buckets: Vec<f64>,
    ) -> Result<Self, prometheus::Error> {
        let published = prometheus::IntCounterVec::new(
            prometheus::opts!(
                "outbox_events_published_total",
                "Events confirmed by the transport"
            ),
            EVENT_LABELS,
        )?;
        registry.register(Box::new(published.clone()))?;

        let failed = prometheus::IntCounterVec::new(
            prometheus::opts!(
                "outbox_events_failed_total",
                "Failed submissions and negative acknowledgments"
            ),
            EVENT_LABELS,
        )?;
        registry.register(Box::new(failed.clone()))?;

        let retries = prometheus::IntCounterVec::new(
            prometheus::opts!("outbox_events_retried_total", "Retry attempts"),
            EVENT_LABELS,
        )?;
        registry.register(Box::new(retries.clone()))?;

        let dead_lettered = prometheus::IntCounterVec::new(
            prometheus::opts!(
                "outbox_events_dead_lettered_total",
                "Events moved to the dead-letter state"
            ),
            EVENT_LABELS,
        )?;
        registry.register(Box::new(dead_lettered.clone()))?;

        let publish_duration = prometheus::HistogramVec::new(
            prometheus::histogram_opts!(
                "outbox_publish_duration_seconds",
                "Time to submit an event to the transport",
                duration_buckets
            ),
            EVENT_LABELS,
        )?;
        registry.register(Box::new(publish_duration.clone()))?;

        let pending = prometheus::IntGaugeVec::new(
            prometheus::opts!("outbox_events_pending", "Events waiting to be published"),
            TENANT_LABELS,
        )?;
        registry.register(Box::new(pending.clone()))?;

        let failed_pending = prometheus::IntGaugeVec::new(
            prometheus::opts!("outbox_events_failed", "Events waiting for a retry"),
            TENANT_LABELS,
        )?;
        registry.register(Box::new(failed_pending.clone()))?;

        let dlq_size = prometheus::IntGaugeVec::new(
            prometheus::opts!("outbox_events_dead_letter", "Events in the dead-letter state"),
            TENANT_LABELS,
        )?;
        registry.register(Box::new(dlq_size.clone()))?;

        Ok(Self {
            registry,
            published,
            failed,
            retries,
            dead_lettered,
            publish_duration,
            pending,
            failed_pending,
            dlq_size,
        })
    }

    pub fn registry(&self) -> &prometheus::Registry {
        &self.registry
    }

    pub fn content_type(&self) -> &'static str {
        "text/plain; version=0.0.4; charset=utf-8"
    }

    /// Render every registered metric in the text exposition format.
    pub fn gather(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

fn gauge_value(count: u64) -> i64 {
    i64::try_from(count).unwrap_or(i64::MAX)
}

impl MetricsCollector for PrometheusMetricsCollector {
    fn record_published(&self, tenant_id: &str, aggregate_type: &str, event_type: &str) {
        self.published
            .with_label_values(&[tenant_id, aggregate_type, event_type])
            .inc();
    }

    fn record_failed(&self, tenant_id: &str, aggregate_type: &str, event_type: &str, _error: &str) {
        self.failed
            .with_label_values(&[tenant_id, aggregate_type, event_type])
            .inc();
    }

    fn record_retry(&self, tenant_id: &str, aggregate_type: &str, event_type: &str) {
        self.retries
            .with_label_values(&[tenant_id, aggregate_type, event_type])
            .inc();
    }

    fn record_dlq(&self, tenant_id: &str, aggregate_type: &str, event_type: &str) {
        self.dead_lettered
            .with_label_values(&[tenant_id, aggregate_type, event_type])
            .inc();
    }

    fn record_publish_duration(
        &self,
        tenant_id: &str,
        aggregate_type: &str,
        event_type: &str,
        duration: Duration,
    ) {
        self.publish_duration
            .with_label_values(&[tenant_id, aggregate_type, event_type])
            .observe(duration.as_secs_f64());
    }

    fn set_pending_count(&self, tenant_id: &str, count: u64) {
        self.pending
            .with_label_values(&[tenant_id])
            .set(gauge_value(count));
    }

    fn set_failed_count(&self, tenant_id: &str, count: u64) {
        self.failed_pending
            .with_label_values(&[tenant_id])
            .set(gauge_value(count));
    }

    fn set_dlq_count(&self, tenant_id: &str, count: u64) {
        self.dlq_size
            .with_label_values(&[tenant_id])
            .set(gauge_value(count));
    }
}
