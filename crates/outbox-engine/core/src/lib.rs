//! # Outbox Engine Core
//!
//! Transactional outbox: events are written to a local store in the same
//! transaction as the business change, then relayed to a message transport
//! with at-least-once delivery.
//!
//! ## Components
//!
//! - [`OutboxEvent`]: the stored event and its delivery state machine
//! - [`OutboxRepository`] / [`TransactionalRepository`]: storage ports
//! - [`EventPublisher`]: transport port with an asynchronous ACK stream
//! - [`TopicMapper`]: aggregate type to topic resolution strategies
//! - [`OutboxPublisher`]: submission, batch publishing and ACK reconciliation
//! - [`OutboxScheduler`]: poll, retry, cleanup, health-check and DLQ loops
//! - [`MetricsCollector`], [`DlqHandler`], [`DlqAlertHandler`]: pluggable hooks
//!
//! Storage and transport implementations live in sibling crates
//! (`outbox-engine-pg`, `outbox-engine-testing`).

pub mod builder;
pub mod config;
pub mod dlq;
pub mod error;
pub mod event;
pub mod metrics;
pub mod port;
pub mod publisher;
pub mod scheduler;
pub mod topic_mapper;

pub use builder::SchedulerBuilder;
pub use config::{ConfigError, DEFAULT_SHUTDOWN_TIMEOUT, PublisherConfig, SchedulerConfig};
pub use dlq::{
    CompositeDlqHandler, DlqAlertHandler, DlqHandler, FnDlqAlertHandler, FnDlqHandler,
    LoggingDlqHandler, NoOpDlqAlertHandler, NoOpDlqHandler,
};
pub use error::{OutboxError, Result};
pub use event::{
    DEFAULT_EVENT_VERSION, DEFAULT_MAX_RETRIES, EventStatus, OutboxEvent,
    default_idempotency_key, generate_event_id,
};
pub use metrics::{
    InMemoryMetricsCollector, MetricsCollector, MetricsSnapshot, NoOpMetricsCollector,
};
pub use port::{
    Envelope, EventPublisher, NoOpEventPublisher, OutboxRepository, PublishResult,
    RepositoryStats, RepositoryStatsProvider, TransactionalRepository,
};
pub use publisher::{BatchPublishReport, ErrorHandler, OutboxPublisher, PublisherMetricsSnapshot};
pub use scheduler::{
    ALL_TENANTS_LABEL, CleanupReport, DlqReport, HealthReport, OutboxScheduler, RetryReport,
    SchedulerError, SchedulerMetricsSnapshot,
};
pub use topic_mapper::{
    ChainTopicMapper, DefaultTopicMapper, FnTopicMapper, MapTopicMapper, PrefixTopicMapper,
    StaticTopicMapper, TopicMapper,
};
