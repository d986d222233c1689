//! Fluent construction of an [`OutboxScheduler`] and its publisher.
//!
//! ```ignore
//! let scheduler = SchedulerBuilder::new()
//!     .repository(repository)
//!     .event_publisher(transport)
//!     .poll_interval(Duration::from_secs(5))
//!     .tenant_id("tenant-a")
//!     .dlq_handler(Arc::new(LoggingDlqHandler))
//!     .build()?;
//! scheduler.publisher().start_ack_listener(&cancel);
//! scheduler.start(cancel.clone())?;
//! ```

use std::sync::Arc;
use std::time::Duration;

use crate::config::{PublisherConfig, SchedulerConfig};
use crate::dlq::{DlqAlertHandler, DlqHandler, NoOpDlqAlertHandler, NoOpDlqHandler};
use crate::error::OutboxError;
use crate::event::OutboxEvent;
use crate::metrics::MetricsCollector;
use crate::port::{EventPublisher, OutboxRepository};
use crate::publisher::{ErrorHandler, OutboxPublisher};
use crate::scheduler::{OutboxScheduler, SchedulerError, SchedulerInner};
use crate::topic_mapper::{DefaultTopicMapper, TopicMapper};

/// Builder for [`OutboxScheduler`].
///
/// Shorthand setters (`poll_interval`, `batch_size`, ...) are applied on top
/// of the scheduler config at build time, whichever order they were called in.
#[derive(Default)]
pub struct SchedulerBuilder {
    repository: Option<Arc<dyn OutboxRepository>>,
    event_publisher: Option<Arc<dyn EventPublisher>>,
    topic_mapper: Option<Arc<dyn TopicMapper>>,
    scheduler_config: SchedulerConfig,
    publisher_config: PublisherConfig,
    poll_interval: Option<Duration>,
    batch_size: Option<usize>,
    tenant_id: Option<String>,
    cleanup_enabled: Option<bool>,
    health_check_enabled: Option<bool>,
    metrics_enabled: Option<bool>,
    dlq_handler: Option<Arc<dyn DlqHandler>>,
    dlq_alert_handler: Option<Arc<dyn DlqAlertHandler>>,
    metrics_collector: Option<Arc<dyn MetricsCollector>>,
    error_handler: Option<ErrorHandler>,
}

impl SchedulerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn repository(mut self, repository: Arc<dyn OutboxRepository>) -> Self {
        self.repository = Some(repository);
        self
    }

    pub fn event_publisher(mut self, event_publisher: Arc<dyn EventPublisher>) -> Self {
        self.event_publisher = Some(event_publisher);
        self
    }

    /// Defaults to [`DefaultTopicMapper`].
    pub fn topic_mapper(mut self, topic_mapper: Arc<dyn TopicMapper>) -> Self {
        self.topic_mapper = Some(topic_mapper);
        self
    }

    pub fn scheduler_config(mut self, config: SchedulerConfig) -> Self {
        self.scheduler_config = config;
        self
    }

    pub fn publisher_config(mut self, config: PublisherConfig) -> Self {
        self.publisher_config = config;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = Some(interval);
        self
    }

    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = Some(batch_size);
        self
    }

    pub fn tenant_id(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    pub fn cleanup_enabled(mut self, enabled: bool) -> Self {
        self.cleanup_enabled = Some(enabled);
        self
    }

    pub fn health_check_enabled(mut self, enabled: bool) -> Self {
        self.health_check_enabled = Some(enabled);
        self
    }

    /// Toggles metrics on both the scheduler and the publisher.
    pub fn metrics_enabled(mut self, enabled: bool) -> Self {
        self.metrics_enabled = Some(enabled);
        self
    }

    pub fn dlq_handler(mut self, handler: Arc<dyn DlqHandler>) -> Self {
        self.dlq_handler = Some(handler);
        self
    }

    pub fn dlq_alert_handler(mut self, handler: Arc<dyn DlqAlertHandler>) -> Self {
        self.dlq_alert_handler = Some(handler);
        self
    }

    pub fn metrics_collector(mut self, collector: Arc<dyn MetricsCollector>) -> Self {
        self.metrics_collector = Some(collector);
        self
    }

    pub fn error_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(Option<&OutboxEvent>, &OutboxError) + Send + Sync + 'static,
    {
        self.error_handler = Some(Arc::new(handler));
        self
    }

    /// The scheduler config with shorthand overrides applied.
    fn effective_scheduler_config(&self) -> SchedulerConfig {
        let mut config = self.scheduler_config.clone();
        if let Some(interval) = self.poll_interval {
            config.poll_interval = interval;
        }
        if let Some(batch_size) = self.batch_size {
            config.batch_size = batch_size;
        }
        if let Some(tenant_id) = &self.tenant_id {
            config.tenant_id = Some(tenant_id.clone());
        }
        if let Some(enabled) = self.cleanup_enabled {
            config.enable_cleanup = enabled;
        }
        if let Some(enabled) = self.health_check_enabled {
            config.enable_health_check = enabled;
        }
        if let Some(enabled) = self.metrics_enabled {
            config.enable_metrics = enabled;
        }
        config
    }

    /// # Errors
    /// - [`SchedulerError::MissingDependency`] without a repository or event publisher
    /// - [`SchedulerError::InvalidConfig`] when either config fails validation
    pub fn build(self) -> Result<OutboxScheduler, SchedulerError> {
        let scheduler_config = self.effective_scheduler_config();

        let repository = self
            .repository
            .ok_or(SchedulerError::MissingDependency("repository"))?;
        let event_publisher = self
            .event_publisher
            .ok_or(SchedulerError::MissingDependency("event_publisher"))?;
        let topic_mapper = self
            .topic_mapper
            .unwrap_or_else(|| Arc::new(DefaultTopicMapper));

        let mut publisher_config = self.publisher_config;
        if let Some(enabled) = self.metrics_enabled {
            publisher_config.enable_metrics = enabled;
        }

        let mut publisher =
            OutboxPublisher::new(repository, event_publisher, topic_mapper, publisher_config)?
                .with_shared_error_handler(self.error_handler);
        if let Some(collector) = self.metrics_collector {
            publisher = publisher.with_metrics_collector(collector);
        }

        let inner = SchedulerInner::new(
            Arc::new(publisher),
            scheduler_config,
            self.dlq_handler
                .unwrap_or_else(|| Arc::new(NoOpDlqHandler)),
            self.dlq_alert_handler
                .unwrap_or_else(|| Arc::new(NoOpDlqAlertHandler)),
        )?;
        Ok(OutboxScheduler::from_inner(inner))
    }
}
