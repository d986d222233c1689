//! # Configuration
//!
//! [`PublisherConfig`] and [`SchedulerConfig`] with their defaults and
//! validation bounds. Both are validated when the publisher or scheduler is
//! constructed; an invalid value never reaches a running loop.

use std::time::Duration;
use thiserror::Error;

/// Shutdown timeout used when [`SchedulerConfig::shutdown_timeout`] is zero.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

const MAX_RETRIES_CEILING: u32 = 100;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("Invalid {field}: {reason}")]
    OutOfRange { field: &'static str, reason: String },
}

impl ConfigError {
    fn out_of_range(field: &'static str, reason: impl Into<String>) -> Self {
        Self::OutOfRange {
            field,
            reason: reason.into(),
        }
    }

    /// Name of the offending setting.
    pub fn field(&self) -> &'static str {
        match self {
            Self::OutOfRange { field, .. } => field,
        }
    }
}

fn check_min(field: &'static str, value: Duration, min: Duration) -> Result<(), ConfigError> {
    if value < min {
        return Err(ConfigError::out_of_range(
            field,
            format!("{value:?} is below the minimum of {min:?}"),
        ));
    }
    Ok(())
}

fn check_max(field: &'static str, value: Duration, max: Duration) -> Result<(), ConfigError> {
    if value > max {
        return Err(ConfigError::out_of_range(
            field,
            format!("{value:?} exceeds the maximum of {max:?}"),
        ));
    }
    Ok(())
}

fn check_max_retries(field: &'static str, value: u32) -> Result<(), ConfigError> {
    if value > MAX_RETRIES_CEILING {
        return Err(ConfigError::out_of_range(
            field,
            format!("{value} exceeds the maximum of {MAX_RETRIES_CEILING}"),
        ));
    }
    Ok(())
}

/// Settings of the [`crate::OutboxPublisher`].
#[derive(Debug, Clone, PartialEq)]
pub struct PublisherConfig {
    /// Retry budget checked by `retry_failed_event`.
    pub max_retries: u32,
    /// Pause before a retried event is resubmitted.
    pub retry_delay: Duration,
    /// Bound on a single submission. Zero disables the bound.
    pub publish_timeout: Duration,
    pub enable_metrics: bool,
    /// Publish batches with a bounded pool instead of one by one.
    pub concurrent_publish: bool,
    /// In-flight submissions allowed when `concurrent_publish` is set.
    pub publish_concurrency: usize,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
            publish_timeout: Duration::from_secs(30),
            enable_metrics: true,
            concurrent_publish: false,
            publish_concurrency: 10,
        }
    }
}

impl PublisherConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn with_publish_timeout(mut self, timeout: Duration) -> Self {
        self.publish_timeout = timeout;
        self
    }

    pub fn with_metrics(mut self, enabled: bool) -> Self {
        self.enable_metrics = enabled;
        self
    }

    /// Enable concurrent batch publishing with at most `limit` in flight.
    pub fn with_concurrency(mut self, limit: usize) -> Self {
        self.concurrent_publish = true;
        self.publish_concurrency = limit;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        check_max_retries("max_retries", self.max_retries)?;
        check_max("retry_delay", self.retry_delay, Duration::from_secs(3600))?;
        check_max(
            "publish_timeout",
            self.publish_timeout,
            Duration::from_secs(300),
        )?;
        if self.concurrent_publish && self.publish_concurrency == 0 {
            return Err(ConfigError::out_of_range(
                "publish_concurrency",
                "must be at least 1 when concurrent publishing is enabled",
            ));
        }
        Ok(())
    }
}

/// Settings of the [`crate::OutboxScheduler`] loops.
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    pub poll_interval: Duration,
    pub batch_size: usize,
    /// Restrict polling and maintenance to one tenant. `None` spans all.
    pub tenant_id: Option<String>,

    pub enable_cleanup: bool,
    pub cleanup_interval: Duration,
    /// Published and failed rows older than this are deleted.
    pub cleanup_retention: Duration,

    pub enable_health_check: bool,
    pub health_check_interval: Duration,
    /// Backlog warning fires when pending > `batch_size * backlog_multiplier`.
    pub backlog_multiplier: usize,

    pub enable_retry: bool,
    pub retry_interval: Duration,
    /// Retry ceiling of the retry loop. The publisher's `max_retries` caps it.
    pub max_retries: u32,

    pub enable_dlq: bool,
    pub dlq_interval: Duration,

    pub enable_metrics: bool,
    /// Bound on `stop()` waiting for in-flight ticks. Zero means the default.
    pub shutdown_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            batch_size: 100,
            tenant_id: None,
            enable_cleanup: true,
            cleanup_interval: Duration::from_secs(3600),
            cleanup_retention: Duration::from_secs(24 * 3600),
            enable_health_check: true,
            health_check_interval: Duration::from_secs(30),
            backlog_multiplier: 10,
            enable_retry: true,
            retry_interval: Duration::from_secs(30),
            max_retries: 3,
            enable_dlq: true,
            dlq_interval: Duration::from_secs(300),
            enable_metrics: true,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }
}

impl SchedulerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_tenant_id(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    pub fn with_cleanup(mut self, enabled: bool) -> Self {
        self.enable_cleanup = enabled;
        self
    }

    pub fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }

    pub fn with_cleanup_retention(mut self, retention: Duration) -> Self {
        self.cleanup_retention = retention;
        self
    }

    pub fn with_health_check(mut self, enabled: bool) -> Self {
        self.enable_health_check = enabled;
        self
    }

    pub fn with_health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval = interval;
        self
    }

    pub fn with_backlog_multiplier(mut self, multiplier: usize) -> Self {
        self.backlog_multiplier = multiplier;
        self
    }

    pub fn with_retry(mut self, enabled: bool) -> Self {
        self.enable_retry = enabled;
        self
    }

    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_dlq(mut self, enabled: bool) -> Self {
        self.enable_dlq = enabled;
        self
    }

    pub fn with_dlq_interval(mut self, interval: Duration) -> Self {
        self.dlq_interval = interval;
        self
    }

    pub fn with_metrics(mut self, enabled: bool) -> Self {
        self.enable_metrics = enabled;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// The shutdown bound actually applied by `stop()`.
    pub fn effective_shutdown_timeout(&self) -> Duration {
        if self.shutdown_timeout.is_zero() {
            DEFAULT_SHUTDOWN_TIMEOUT
        } else {
            self.shutdown_timeout
        }
    }

    /// Pending count above which the health check reports a backlog.
    pub fn backlog_threshold(&self) -> u64 {
        (self.batch_size as u64).saturating_mul(self.backlog_multiplier as u64)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        check_min("poll_interval", self.poll_interval, Duration::from_secs(1))?;
        check_max("poll_interval", self.poll_interval, Duration::from_secs(3600))?;

        if self.batch_size == 0 || self.batch_size > 10_000 {
            return Err(ConfigError::out_of_range(
                "batch_size",
                format!("{} is outside 1..=10000", self.batch_size),
            ));
        }

        if self.enable_cleanup {
            check_min(
                "cleanup_interval",
                self.cleanup_interval,
                Duration::from_secs(60),
            )?;
            check_min(
                "cleanup_retention",
                self.cleanup_retention,
                Duration::from_secs(3600),
            )?;
        }

        if self.enable_health_check {
            check_min(
                "health_check_interval",
                self.health_check_interval,
                Duration::from_secs(1),
            )?;
        }

        if self.enable_retry {
            check_min("retry_interval", self.retry_interval, Duration::from_secs(1))?;
            check_max_retries("max_retries", self.max_retries)?;
        }

        if self.enable_dlq {
            check_min("dlq_interval", self.dlq_interval, Duration::from_secs(1))?;
        }

        check_max(
            "shutdown_timeout",
            self.shutdown_timeout,
            Duration::from_secs(300),
        )?;

        Ok(())
    }
}
