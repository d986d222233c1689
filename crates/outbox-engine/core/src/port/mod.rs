//! Ports consumed by the outbox engine.

pub mod event_publisher;
pub mod repository;

pub use event_publisher::{
    DEFAULT_RESULT_CHANNEL_CAPACITY, Envelope, EventPublisher, NoOpEventPublisher, PublishResult,
};
pub use repository::{
    OutboxRepository, RepositoryStats, RepositoryStatsProvider, TransactionalRepository,
};
