//! # Error Types
//!
//! Errors surfaced by outbox operations. Configuration and scheduler
//! lifecycle errors live next to the types they guard
//! ([`crate::config::ConfigError`], [`crate::scheduler::SchedulerError`]).

use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Result alias used across the outbox engine.
pub type Result<T, E = OutboxError> = std::result::Result<T, E>;

/// Errors produced by the outbox entity, ports and publisher.
#[derive(Debug, Error)]
pub enum OutboxError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid event status: {0}")]
    InvalidStatus(String),

    #[error("Outbox event not found: {0}")]
    NotFound(Uuid),

    #[error("Duplicate idempotency key: {0}")]
    DuplicateIdempotencyKey(String),

    #[error("Event {event_id} is scheduled for {scheduled_at}")]
    ScheduledForLater {
        event_id: Uuid,
        scheduled_at: DateTime<Utc>,
    },

    #[error("No topic found for aggregate type: {0}")]
    NoTopic(String),

    #[error("Event {event_id} has reached max retries ({retry_count})")]
    RetriesExhausted { event_id: Uuid, retry_count: u32 },

    #[error("Publishing event {event_id} timed out after {timeout:?}")]
    PublishTimeout { event_id: Uuid, timeout: Duration },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Failed to publish {failed} of {total} events")]
    BatchPublish { failed: usize, total: usize },

    #[error("DLQ handler error: {0}")]
    DlqHandler(String),

    #[error("Repository error: {message}")]
    Repository { message: String },

    #[error("Transaction error: {message}")]
    Transaction { message: String },
}

impl OutboxError {
    pub fn repository(message: impl Into<String>) -> Self {
        Self::Repository {
            message: message.into(),
        }
    }

    pub fn transaction(message: impl Into<String>) -> Self {
        Self::Transaction {
            message: message.into(),
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport(message.into())
    }

    /// Whether the error came from the message transport rather than the store.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::PublishTimeout { .. })
    }
}
