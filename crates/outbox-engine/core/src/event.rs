//! # Outbox Event
//!
//! The unit of reliable delivery and its state machine.
//!
//! ```text
//! Pending --(submit + ack success)-------------------> Published   (terminal)
//! Pending --(submit failure)-------------------------> Failed
//! Failed  --(attempt fails, retry_count < max)-------> Failed
//! Failed  --(attempt fails, retry_count >= max)------> MaxRetry    (terminal)
//! Failed  --(explicit reset)-------------------------> Pending
//! ```
//!
//! `published_at` is set exactly when the event becomes `Published` and is
//! never cleared; once published, every other transition is ignored.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use uuid::{NoContext, Timestamp, Uuid};

use crate::error::{OutboxError, Result};

/// Retry ceiling applied to new events.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Schema version applied to new events.
pub const DEFAULT_EVENT_VERSION: i64 = 1;

/// Delivery status of an outbox event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    /// Waiting to be submitted or acknowledged.
    Pending,
    /// Acknowledged by the transport.
    Published,
    /// Submission failed; eligible for retry.
    Failed,
    /// Retry budget exhausted; dead-lettered.
    MaxRetry,
}

impl EventStatus {
    pub const ALL: [EventStatus; 4] = [
        EventStatus::Pending,
        EventStatus::Published,
        EventStatus::Failed,
        EventStatus::MaxRetry,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Pending => "pending",
            EventStatus::Published => "published",
            EventStatus::Failed => "failed",
            EventStatus::MaxRetry => "max_retry",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, EventStatus::Published | EventStatus::MaxRetry)
    }
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventStatus {
    type Err = OutboxError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(EventStatus::Pending),
            "published" => Ok(EventStatus::Published),
            "failed" => Ok(EventStatus::Failed),
            "max_retry" => Ok(EventStatus::MaxRetry),
            other => Err(OutboxError::InvalidStatus(other.to_string())),
        }
    }
}

/// Generate a time-ordered event id (UUID v7).
///
/// Falls back to a random UUID v4 when the system clock reads before the
/// Unix epoch and no meaningful timestamp can be embedded.
pub fn generate_event_id() -> Uuid {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(since_epoch) => Uuid::new_v7(Timestamp::from_unix(
            NoContext,
            since_epoch.as_secs(),
            since_epoch.subsec_nanos(),
        )),
        Err(_) => Uuid::new_v4(),
    }
}

/// Default idempotency key: `tenant:aggregateType:aggregateId:eventType:eventId`.
pub fn default_idempotency_key(
    tenant_id: &str,
    aggregate_type: &str,
    aggregate_id: &str,
    event_type: &str,
    event_id: Uuid,
) -> String {
    format!("{tenant_id}:{aggregate_type}:{aggregate_id}:{event_type}:{event_id}")
}

/// An event recorded in the outbox alongside a business-state change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEvent {
    pub id: Uuid,
    pub tenant_id: String,
    pub aggregate_id: String,
    /// Drives topic resolution.
    pub aggregate_type: String,
    pub event_type: String,
    /// Serialized domain event, opaque to the engine.
    pub payload: Vec<u8>,
    pub status: EventStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
    /// Not eligible for publishing before this instant.
    pub scheduled_at: Option<DateTime<Utc>>,
    pub last_retry_at: Option<DateTime<Utc>>,
    /// Set once a DLQ handler has processed the dead-lettered event.
    pub dlq_handled_at: Option<DateTime<Utc>>,
    pub version: i64,
    pub trace_id: Option<String>,
    pub correlation_id: Option<String>,
    /// Unique across the store; `None` disables the publish-time idempotency check.
    pub idempotency_key: Option<String>,
}

impl OutboxEvent {
    /// Create a pending event, serializing `payload` as JSON.
    pub fn new<T>(
        tenant_id: impl Into<String>,
        aggregate_type: impl Into<String>,
        aggregate_id: impl Into<String>,
        event_type: impl Into<String>,
        payload: &T,
    ) -> Result<Self>
    where
        T: Serialize + ?Sized,
    {
        let payload = serde_json::to_vec(payload)?;
        Ok(Self::from_raw_payload(
            tenant_id,
            aggregate_type,
            aggregate_id,
            event_type,
            payload,
        ))
    }

    /// Create a pending event from an already serialized payload.
    pub fn from_raw_payload(
        tenant_id: impl Into<String>,
        aggregate_type: impl Into<String>,
        aggregate_id: impl Into<String>,
        event_type: impl Into<String>,
        payload: Vec<u8>,
    ) -> Self {
        let id = generate_event_id();
        let tenant_id = tenant_id.into();
        let aggregate_type = aggregate_type.into();
        let aggregate_id = aggregate_id.into();
        let event_type = event_type.into();
        let idempotency_key =
            default_idempotency_key(&tenant_id, &aggregate_type, &aggregate_id, &event_type, id);
        let now = Utc::now();

        Self {
            id,
            tenant_id,
            aggregate_id,
            aggregate_type,
            event_type,
            payload,
            status: EventStatus::Pending,
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            last_error: None,
            created_at: now,
            updated_at: now,
            published_at: None,
            scheduled_at: None,
            last_retry_at: None,
            dlq_handled_at: None,
            version: DEFAULT_EVENT_VERSION,
            trace_id: None,
            correlation_id: None,
            idempotency_key: Some(idempotency_key),
        }
    }

    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn with_scheduled_at(mut self, scheduled_at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(scheduled_at);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_version(mut self, version: i64) -> Self {
        self.version = version;
        self
    }

    /// Whether another delivery attempt is allowed.
    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Record a confirmed delivery. Idempotent: a second call keeps the
    /// original `published_at`.
    pub fn mark_as_published(&mut self) {
        if self.is_published() {
            return;
        }
        let now = Utc::now();
        self.status = EventStatus::Published;
        self.published_at = Some(now);
        self.updated_at = now;
    }

    /// Record a failed submission and consume one retry.
    pub fn mark_as_failed(&mut self, error: &str) {
        if self.is_published() {
            return;
        }
        let now = Utc::now();
        self.status = EventStatus::Failed;
        self.retry_count += 1;
        self.last_error = Some(error.to_string());
        self.last_retry_at = Some(now);
        self.updated_at = now;
    }

    /// Record a failed retry attempt.
    ///
    /// The ceiling is checked against the count the attempt was made with:
    /// an attempt made while retries remained leaves the event `Failed`, an
    /// attempt made with the budget already spent moves it to `MaxRetry`.
    /// The count is incremented in both cases.
    pub fn increment_retry(&mut self, error: &str) {
        if self.is_published() {
            return;
        }
        let exhausted = !self.can_retry();
        let now = Utc::now();
        self.retry_count += 1;
        self.last_error = Some(error.to_string());
        self.last_retry_at = Some(now);
        self.updated_at = now;
        self.status = if exhausted {
            EventStatus::MaxRetry
        } else {
            EventStatus::Failed
        };
    }

    /// Move straight to the dead-letter state.
    pub fn mark_as_max_retry(&mut self, error: &str) {
        if self.is_published() {
            return;
        }
        self.status = EventStatus::MaxRetry;
        self.last_error = Some(error.to_string());
        self.updated_at = Utc::now();
    }

    /// Put the event back in the publish queue. Retry bookkeeping is kept.
    pub fn reset_for_retry(&mut self) {
        if self.is_published() {
            return;
        }
        self.status = EventStatus::Pending;
        self.updated_at = Utc::now();
    }

    /// Record that a DLQ handler processed this event.
    pub fn mark_dlq_handled(&mut self) {
        let now = Utc::now();
        self.dlq_handled_at = Some(now);
        self.updated_at = now;
    }

    /// `true` when no schedule is set or the scheduled instant has passed.
    pub fn should_publish_now(&self) -> bool {
        self.scheduled_at.is_none_or(|at| Utc::now() >= at)
    }

    /// `true` when the event is older than `max_age`.
    pub fn is_expired(&self, max_age: Duration) -> bool {
        let age = Utc::now().signed_duration_since(self.created_at);
        age.to_std().is_ok_and(|age| age > max_age)
    }

    pub fn is_pending(&self) -> bool {
        self.status == EventStatus::Pending
    }

    pub fn is_published(&self) -> bool {
        self.status == EventStatus::Published
    }

    pub fn is_failed(&self) -> bool {
        self.status == EventStatus::Failed
    }

    pub fn is_max_retry(&self) -> bool {
        self.status == EventStatus::MaxRetry
    }

    /// Deserialize the JSON payload.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.payload)?)
    }

    /// Replace the payload with the JSON form of `payload`.
    pub fn set_payload<T: Serialize + ?Sized>(&mut self, payload: &T) -> Result<()> {
        self.payload = serde_json::to_vec(payload)?;
        self.updated_at = Utc::now();
        Ok(())
    }
}
