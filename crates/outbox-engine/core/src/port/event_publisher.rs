//! # Event Publisher Port
//!
//! Transport contract: non-blocking submission of an [`Envelope`] plus an
//! asynchronous stream of [`PublishResult`] acknowledgments.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use crate::error::Result;
use crate::event::OutboxEvent;

/// Capacity of the result channel owned by [`NoOpEventPublisher`].
pub const DEFAULT_RESULT_CHANNEL_CAPACITY: usize = 1024;

/// Wire-level wrapper handed to the transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub event_id: Uuid,
    pub aggregate_id: String,
    pub aggregate_type: String,
    pub event_type: String,
    pub event_version: i64,
    pub payload: Vec<u8>,
    pub timestamp: DateTime<Utc>,
    pub trace_id: Option<String>,
    pub correlation_id: Option<String>,
    /// Lets a multi-tenant transport route the acknowledgment back to the
    /// tenant's result channel.
    pub tenant_id: String,
}

impl From<&OutboxEvent> for Envelope {
    fn from(event: &OutboxEvent) -> Self {
        Self {
            event_id: event.id,
            aggregate_id: event.aggregate_id.clone(),
            aggregate_type: event.aggregate_type.clone(),
            event_type: event.event_type.clone(),
            event_version: event.version,
            payload: event.payload.clone(),
            timestamp: event.created_at,
            trace_id: event.trace_id.clone(),
            correlation_id: event.correlation_id.clone(),
            tenant_id: event.tenant_id.clone(),
        }
    }
}

/// Delivery outcome reported by the transport for one envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishResult {
    pub event_id: Uuid,
    pub topic: String,
    pub success: bool,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub aggregate_id: String,
    pub aggregate_type: String,
    pub event_type: String,
    pub tenant_id: String,
}

impl PublishResult {
    pub fn success(topic: impl Into<String>, envelope: &Envelope) -> Self {
        Self::new(topic.into(), envelope, None)
    }

    pub fn failure(topic: impl Into<String>, envelope: &Envelope, error: impl Into<String>) -> Self {
        Self::new(topic.into(), envelope, Some(error.into()))
    }

    fn new(topic: String, envelope: &Envelope, error: Option<String>) -> Self {
        Self {
            event_id: envelope.event_id,
            topic,
            success: error.is_none(),
            error,
            timestamp: Utc::now(),
            aggregate_id: envelope.aggregate_id.clone(),
            aggregate_type: envelope.aggregate_type.clone(),
            event_type: envelope.event_type.clone(),
            tenant_id: envelope.tenant_id.clone(),
        }
    }
}

/// Message transport used by the outbox publisher.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Hand an envelope to the send pipeline.
    ///
    /// `Ok` means "accepted for sending", not "delivered"; delivery is
    /// reported later on [`EventPublisher::result_channel`].
    async fn publish_envelope(&self, topic: &str, envelope: &Envelope) -> Result<()>;

    /// Subscribe to the transport-wide acknowledgment stream.
    fn result_channel(&self) -> broadcast::Receiver<PublishResult>;
}

/// Transport that accepts everything and acknowledges it immediately.
///
/// Useful for dry runs and tests of the surrounding wiring.
pub struct NoOpEventPublisher {
    results: broadcast::Sender<PublishResult>,
}

impl Default for NoOpEventPublisher {
    fn default() -> Self {
        Self::new()
    }
}

impl NoOpEventPublisher {
    pub fn new() -> Self {
        let (results, _) = broadcast::channel(DEFAULT_RESULT_CHANNEL_CAPACITY);
        Self { results }
    }
}

#[async_trait]
impl EventPublisher for NoOpEventPublisher {
    async fn publish_envelope(&self, topic: &str, envelope: &Envelope) -> Result<()> {
        debug!(
            topic,
            event_id = %envelope.event_id,
            event_type = %envelope.event_type,
            "No-op publisher accepted envelope"
        );
        // No subscriber means nobody is reconciling; dropping the ack is fine.
        let _ = self.results.send(PublishResult::success(topic, envelope));
        Ok(())
    }

    fn result_channel(&self) -> broadcast::Receiver<PublishResult> {
        self.results.subscribe()
    }
}
