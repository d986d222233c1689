//! Scripted message transport for tests.
//!
//! [`ChannelEventPublisher`] records every submitted envelope and reports
//! delivery on a broadcast channel, either immediately ([`AckMode::Success`],
//! [`AckMode::Failure`]) or when the test calls [`ChannelEventPublisher::ack`]
//! / [`ChannelEventPublisher::nack`] ([`AckMode::Manual`]).

use async_trait::async_trait;
use outbox_engine_core::{Envelope, EventPublisher, OutboxError, PublishResult, Result};
use parking_lot::Mutex;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

const RESULT_CHANNEL_CAPACITY: usize = 256;

/// How submissions are acknowledged.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum AckMode {
    /// Every accepted submission is confirmed right away.
    #[default]
    Success,
    /// Every accepted submission is negatively acknowledged with this error.
    Failure(String),
    /// Nothing is reported until the test acknowledges explicitly.
    Manual,
}

/// A submission captured by [`ChannelEventPublisher`].
#[derive(Debug, Clone, PartialEq)]
pub struct Submission {
    pub topic: String,
    pub envelope: Envelope,
}

/// Fake transport with scripted acknowledgments and injectable failures.
pub struct ChannelEventPublisher {
    results: broadcast::Sender<PublishResult>,
    submissions: Mutex<Vec<Submission>>,
    ack_mode: Mutex<AckMode>,
    rejection: Mutex<Option<String>>,
    submit_delay: Mutex<Duration>,
}

impl Default for ChannelEventPublisher {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelEventPublisher {
    pub fn new() -> Self {
        let (results, _) = broadcast::channel(RESULT_CHANNEL_CAPACITY);
        Self {
            results,
            submissions: Mutex::new(Vec::new()),
            ack_mode: Mutex::new(AckMode::default()),
            rejection: Mutex::new(None),
            submit_delay: Mutex::new(Duration::ZERO),
        }
    }

    pub fn with_ack_mode(self, mode: AckMode) -> Self {
        self.set_ack_mode(mode);
        self
    }

    pub fn set_ack_mode(&self, mode: AckMode) {
        *self.ack_mode.lock() = mode;
    }

    /// Reject every submission with a transport error until
    /// [`Self::accept_submissions`] is called.
    pub fn fail_submissions(&self, message: impl Into<String>) {
        *self.rejection.lock() = Some(message.into());
    }

    pub fn accept_submissions(&self) {
        *self.rejection.lock() = None;
    }

    /// Sleep this long inside every submission.
    pub fn set_submit_delay(&self, delay: Duration) {
        *self.submit_delay.lock() = delay;
    }

    pub fn submissions(&self) -> Vec<Submission> {
        self.submissions.lock().clone()
    }

    pub fn submission_count(&self) -> usize {
        self.submissions.lock().len()
    }

    /// Number of times `event_id` was submitted.
    pub fn submissions_for(&self, event_id: Uuid) -> usize {
        self.submissions
            .lock()
            .iter()
            .filter(|s| s.envelope.event_id == event_id)
            .count()
    }

    /// Confirm the latest submission of `event_id`. Returns `false` when it
    /// was never submitted.
    pub fn ack(&self, event_id: Uuid) -> bool {
        self.report(event_id, None)
    }

    /// Report a delivery failure for the latest submission of `event_id`.
    pub fn nack(&self, event_id: Uuid, error: impl Into<String>) -> bool {
        self.report(event_id, Some(error.into()))
    }

    /// Push an arbitrary result onto the stream.
    pub fn send_result(&self, result: PublishResult) {
        let _ = self.results.send(result);
    }

    fn report(&self, event_id: Uuid, error: Option<String>) -> bool {
        let submission = self
            .submissions
            .lock()
            .iter()
            .rev()
            .find(|s| s.envelope.event_id == event_id)
            .cloned();
        let Some(submission) = submission else {
            return false;
        };
        let result = match error {
            None => PublishResult::success(submission.topic, &submission.envelope),
            Some(error) => PublishResult::failure(submission.topic, &submission.envelope, error),
        };
        self.send_result(result);
        true
    }
}

#[async_trait]
impl EventPublisher for ChannelEventPublisher {
    async fn publish_envelope(&self, topic: &str, envelope: &Envelope) -> Result<()> {
        let delay = *self.submit_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if let Some(message) = self.rejection.lock().clone() {
            debug!(event_id = %envelope.event_id, "Rejecting submission");
            return Err(OutboxError::transport(message));
        }

        self.submissions.lock().push(Submission {
            topic: topic.to_string(),
            envelope: envelope.clone(),
        });

        let mode = self.ack_mode.lock().clone();
        match mode {
            AckMode::Success => self.send_result(PublishResult::success(topic, envelope)),
            AckMode::Failure(error) => {
                self.send_result(PublishResult::failure(topic, envelope, error))
            }
            AckMode::Manual => {}
        }
        Ok(())
    }

    fn result_channel(&self) -> broadcast::Receiver<PublishResult> {
        self.results.subscribe()
    }
}
