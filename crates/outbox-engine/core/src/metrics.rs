//! # Metrics Collection
//!
//! [`MetricsCollector`] is the hook the publisher and scheduler report
//! through. Counters are keyed by tenant, aggregate type and event type;
//! gauges by tenant.
//!
//! - [`NoOpMetricsCollector`]: used when metrics are disabled
//! - [`InMemoryMetricsCollector`]: lock-free counters for tests and
//!   embedded dashboards
//!
//! The Prometheus collector lives in the `outbox-engine-metrics` crate.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Sink for outbox metrics. Implementations must be cheap and non-blocking;
/// they are called on the publish hot path.
pub trait MetricsCollector: Send + Sync {
    fn record_published(&self, tenant_id: &str, aggregate_type: &str, event_type: &str);

    fn record_failed(&self, tenant_id: &str, aggregate_type: &str, event_type: &str, error: &str);

    fn record_retry(&self, tenant_id: &str, aggregate_type: &str, event_type: &str);

    fn record_dlq(&self, tenant_id: &str, aggregate_type: &str, event_type: &str);

    fn record_publish_duration(
        &self,
        tenant_id: &str,
        aggregate_type: &str,
        event_type: &str,
        duration: Duration,
    );

    fn set_pending_count(&self, tenant_id: &str, count: u64);

    fn set_failed_count(&self, tenant_id: &str, count: u64);

    fn set_dlq_count(&self, tenant_id: &str, count: u64);
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpMetricsCollector;

impl MetricsCollector for NoOpMetricsCollector {
    fn record_published(&self, _: &str, _: &str, _: &str) {}
    fn record_failed(&self, _: &str, _: &str, _: &str, _: &str) {}
    fn record_retry(&self, _: &str, _: &str, _: &str) {}
    fn record_dlq(&self, _: &str, _: &str, _: &str) {}
    fn record_publish_duration(&self, _: &str, _: &str, _: &str, _: Duration) {}
    fn set_pending_count(&self, _: &str, _: u64) {}
    fn set_failed_count(&self, _: &str, _: u64) {}
    fn set_dlq_count(&self, _: &str, _: u64) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Counter {
    Published,
    Failed,
    Retry,
    Dlq,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Gauge {
    Pending,
    Failed,
    Dlq,
}

#[derive(Debug, Default)]
struct DurationStats {
    count: u64,
    total: Duration,
    min: Option<Duration>,
    max: Duration,
}

/// Point-in-time copy of an [`InMemoryMetricsCollector`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricsSnapshot {
    pub published_total: u64,
    pub failed_total: u64,
    pub retry_total: u64,
    pub dlq_total: u64,
    pub publish_count: u64,
    pub avg_publish_duration: Duration,
    pub min_publish_duration: Duration,
    pub max_publish_duration: Duration,
    pub last_error: Option<String>,
}

/// Collector that keeps everything in memory.
#[derive(Debug, Default)]
pub struct InMemoryMetricsCollector {
    published_total: AtomicU64,
    failed_total: AtomicU64,
    retry_total: AtomicU64,
    dlq_total: AtomicU64,
    by_tenant: DashMap<(Counter, String), u64>,
    by_event_type: DashMap<(Counter, String), u64>,
    gauges: DashMap<(Gauge, String), u64>,
    durations: Mutex<DurationStats>,
    last_error: Mutex<Option<String>>,
}

impl InMemoryMetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    fn bump(&self, counter: Counter, tenant_id: &str, event_type: &str) {
        let total = match counter {
            Counter::Published => &self.published_total,
            Counter::Failed => &self.failed_total,
            Counter::Retry => &self.retry_total,
            Counter::Dlq => &self.dlq_total,
        };
        total.fetch_add(1, Ordering::SeqCst);
        *self
            .by_tenant
            .entry((counter, tenant_id.to_string()))
            .or_insert(0) += 1;
        *self
            .by_event_type
            .entry((counter, event_type.to_string()))
            .or_insert(0) += 1;
    }

    fn lookup(map: &DashMap<(Counter, String), u64>, counter: Counter, key: &str) -> u64 {
        map.get(&(counter, key.to_string()))
            .map(|v| *v)
            .unwrap_or(0)
    }

    pub fn published_for_tenant(&self, tenant_id: &str) -> u64 {
        Self::lookup(&self.by_tenant, Counter::Published, tenant_id)
    }

    pub fn failed_for_tenant(&self, tenant_id: &str) -> u64 {
        Self::lookup(&self.by_tenant, Counter::Failed, tenant_id)
    }

    pub fn retries_for_tenant(&self, tenant_id: &str) -> u64 {
        Self::lookup(&self.by_tenant, Counter::Retry, tenant_id)
    }

    pub fn dlq_for_tenant(&self, tenant_id: &str) -> u64 {
        Self::lookup(&self.by_tenant, Counter::Dlq, tenant_id)
    }

    pub fn published_for_event_type(&self, event_type: &str) -> u64 {
        Self::lookup(&self.by_event_type, Counter::Published, event_type)
    }

    pub fn failed_for_event_type(&self, event_type: &str) -> u64 {
        Self::lookup(&self.by_event_type, Counter::Failed, event_type)
    }

    fn gauge(&self, gauge: Gauge, tenant_id: &str) -> Option<u64> {
        self.gauges.get(&(gauge, tenant_id.to_string())).map(|v| *v)
    }

    pub fn pending_count(&self, tenant_id: &str) -> Option<u64> {
        self.gauge(Gauge::Pending, tenant_id)
    }

    pub fn failed_count(&self, tenant_id: &str) -> Option<u64> {
        self.gauge(Gauge::Failed, tenant_id)
    }

    pub fn dlq_count(&self, tenant_id: &str) -> Option<u64> {
        self.gauge(Gauge::Dlq, tenant_id)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let durations = self.durations.lock();
        let avg = if durations.count == 0 {
            Duration::ZERO
        } else {
            durations.total / durations.count as u32
        };
        MetricsSnapshot {
            published_total: self.published_total.load(Ordering::SeqCst),
            failed_total: self.failed_total.load(Ordering::SeqCst),
            retry_total: self.retry_total.load(Ordering::SeqCst),
            dlq_total: self.dlq_total.load(Ordering::SeqCst),
            publish_count: durations.count,
            avg_publish_duration: avg,
            min_publish_duration: durations.min.unwrap_or_default(),
            max_publish_duration: durations.max,
            last_error: self.last_error.lock().clone(),
        }
    }

    pub fn reset(&self) {
        self.published_total.store(0, Ordering::SeqCst);
        self.failed_total.store(0, Ordering::SeqCst);
        self.retry_total.store(0, Ordering::SeqCst);
        self.dlq_total.store(0, Ordering::SeqCst);
        self.by_tenant.clear();
        self.by_event_type.clear();
        self.gauges.clear();
        *self.durations.lock() = DurationStats::default();
        *self.last_error.lock() = None;
    }
}

impl MetricsCollector for InMemoryMetricsCollector {
    fn record_published(&self, tenant_id: &str, _aggregate_type: &str, event_type: &str) {
        self.bump(Counter::Published, tenant_id, event_type);
    }

    fn record_failed(&self, tenant_id: &str, _aggregate_type: &str, event_type: &str, error: &str) {
        self.bump(Counter::Failed, tenant_id, event_type);
        *self.last_error.lock() = Some(error.to_string());
    }

    fn record_retry(&self, tenant_id: &str, _aggregate_type: &str, event_type: &str) {
        self.bump(Counter::Retry, tenant_id, event_type);
    }

    fn record_dlq(&self, tenant_id: &str, _aggregate_type: &str, event_type: &str) {
        self.bump(Counter::Dlq, tenant_id, event_type);
    }

    fn record_publish_duration(
        &self,
        _tenant_id: &str,
        _aggregate_type: &str,
        _event_type: &str,
        duration: Duration,
    ) {
        let mut stats = self.durations.lock();
        stats.count += 1;
        stats.total += duration;
        stats.min = Some(stats.min.map_or(duration, |min| min.min(duration)));
        stats.max = stats.max.max(duration);
    }

    fn set_pending_count(&self, tenant_id: &str, count: u64) {
        self.gauges
            .insert((Gauge::Pending, tenant_id.to_string()), count);
    }

    fn set_failed_count(&self, tenant_id: &str, count: u64) {
        self.gauges
            .insert((Gauge::Failed, tenant_id.to_string()), count);
    }

    fn set_dlq_count(&self, tenant_id: &str, count: u64) {
        self.gauges.insert((Gauge::Dlq, tenant_id.to_string()), count);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_counters_by_tenant_and_type() {
        let collector = InMemoryMetricsCollector::new();
        collector.record_published("t1", "Order", "OrderCreated");
        collector.record_published("t1", "Order", "OrderShipped");
        collector.record_published("t2", "Order", "OrderCreated");
        collector.record_failed("t2", "Order", "OrderCreated", "broker down");
        collector.record_retry("t2", "Order", "OrderCreated");
        collector.record_dlq("t2", "Order", "OrderCreated");

        assert_eq!(collector.published_for_tenant("t1"), 2);
        assert_eq!(collector.published_for_tenant("t2"), 1);
        assert_eq!(collector.published_for_event_type("OrderCreated"), 2);
        assert_eq!(collector.failed_for_tenant("t2"), 1);
        assert_eq!(collector.failed_for_event_type("OrderShipped"), 0);
        assert_eq!(collector.retries_for_tenant("t2"), 1);
        assert_eq!(collector.dlq_for_tenant("t2"), 1);

        let snapshot = collector.snapshot();
        assert_eq!(snapshot.published_total, 3);
        assert_eq!(snapshot.failed_total, 1);
        assert_eq!(snapshot.retry_total, 1);
        assert_eq!(snapshot.dlq_total, 1);
        assert_eq!(snapshot.last_error.as_deref(), Some("broker down"));
    }

    #[test]
    fn test_duration_stats() {
        let collector = InMemoryMetricsCollector::new();
        assert_eq!(collector.snapshot().avg_publish_duration, Duration::ZERO);

        for ms in [10, 30, 20] {
            collector.record_publish_duration("t1", "Order", "OrderCreated", Duration::from_millis(ms));
        }

        let snapshot = collector.snapshot();
        assert_eq!(snapshot.publish_count, 3);
        assert_eq!(snapshot.avg_publish_duration, Duration::from_millis(20));
        assert_eq!(snapshot.min_publish_duration, Duration::from_millis(10));
        assert_eq!(snapshot.max_publish_duration, Duration::from_millis(30));
    }

    #[test]
    fn test_gauges_and_reset() {
        let collector = InMemoryMetricsCollector::new();
        collector.set_pending_count("t1", 7);
        collector.set_failed_count("t1", 2);
        collector.set_dlq_count("t1", 1);
        collector.set_pending_count("t1", 5);

        assert_eq!(collector.pending_count("t1"), Some(5));
        assert_eq!(collector.failed_count("t1"), Some(2));
        assert_eq!(collector.dlq_count("t1"), Some(1));
        assert_eq!(collector.pending_count("t2"), None);

        collector.record_published("t1", "Order", "OrderCreated");
        collector.reset();
        assert_eq!(collector.snapshot(), MetricsSnapshot::default());
        assert_eq!(collector.pending_count("t1"), None);
    }

    #[test]
    fn test_concurrent_recording() {
        let collector = Arc::new(InMemoryMetricsCollector::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let collector = Arc::clone(&collector);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        collector.record_published("t1", "Order", "OrderCreated");
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(collector.published_for_tenant("t1"), 800);
        assert_eq!(collector.snapshot().published_total, 800);
    }

    #[test]
    fn test_noop_collector_is_object_safe() {
        let collector: Arc<dyn MetricsCollector> = Arc::new(NoOpMetricsCollector);
        collector.record_published("t1", "Order", "OrderCreated");
        collector.set_pending_count("t1", 1);
    }
}
