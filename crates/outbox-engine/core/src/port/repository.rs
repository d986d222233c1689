//! # Outbox Repository Port
//!
//! Storage contract required by the engine. Idempotency-key uniqueness
//! must be enforced by the implementation: several relay instances may
//! poll the same store concurrently.
//!
//! Two optional capabilities extend the base contract:
//! - [`RepositoryStatsProvider`]: aggregate counts and backlog age
//! - [`TransactionalRepository`]: inserting events inside a caller-owned
//!   transaction, so the business write and its outbox row commit together

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

use crate::error::Result;
use crate::event::{EventStatus, OutboxEvent};

/// Storage operations the outbox engine relies on.
///
/// Tenant arguments scope a query to one tenant; `None` spans all tenants.
#[async_trait]
pub trait OutboxRepository: Send + Sync {
    /// Insert a new event.
    ///
    /// # Errors
    /// [`crate::OutboxError::DuplicateIdempotencyKey`] when the key already exists.
    async fn save(&self, event: &OutboxEvent) -> Result<()>;

    /// Insert several events atomically.
    async fn save_batch(&self, events: &[OutboxEvent]) -> Result<()>;

    /// Overwrite the stored state of an existing event.
    async fn update(&self, event: &OutboxEvent) -> Result<()>;

    /// Overwrite several events. Stores with a bulk path should override this.
    async fn batch_update(&self, events: &[OutboxEvent]) -> Result<()> {
        for event in events {
            self.update(event).await?;
        }
        Ok(())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<OutboxEvent>>;

    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<OutboxEvent>>;

    async fn exists_by_idempotency_key(&self, key: &str) -> Result<bool> {
        Ok(self.find_by_idempotency_key(key).await?.is_some())
    }

    /// All events of one aggregate instance, oldest first.
    async fn find_by_aggregate_id(
        &self,
        aggregate_id: &str,
        tenant_id: Option<&str>,
    ) -> Result<Vec<OutboxEvent>>;

    /// Pending events of one aggregate type, oldest first.
    async fn find_by_aggregate_type(
        &self,
        aggregate_type: &str,
        limit: usize,
    ) -> Result<Vec<OutboxEvent>>;

    /// Pending events whose schedule gate has passed, oldest first.
    async fn find_pending_events(
        &self,
        limit: usize,
        tenant_id: Option<&str>,
    ) -> Result<Vec<OutboxEvent>>;

    /// Pending events created more than `delay` ago, oldest first.
    ///
    /// Lets a poller stay out of the way of callers that publish right after
    /// committing.
    async fn find_pending_events_with_delay(
        &self,
        tenant_id: Option<&str>,
        delay: Duration,
        limit: usize,
    ) -> Result<Vec<OutboxEvent>>;

    /// Failed events with `retry_count <= max_retries`, oldest first.
    ///
    /// Events sitting exactly at the ceiling are included so the retry loop
    /// can promote them to the dead-letter state. `u32::MAX` returns every
    /// failed event.
    async fn find_events_for_retry(&self, max_retries: u32, limit: usize)
    -> Result<Vec<OutboxEvent>>;

    /// Dead-lettered events not yet processed by a DLQ handler.
    async fn find_max_retry_events(
        &self,
        limit: usize,
        tenant_id: Option<&str>,
    ) -> Result<Vec<OutboxEvent>>;

    /// Set status `Published` and stamp `published_at`. No-op for an event
    /// that is already published.
    async fn mark_as_published(&self, id: Uuid) -> Result<()>;

    /// Set status `Failed`, record the error and consume one retry.
    async fn mark_as_failed(&self, id: Uuid, error: &str) -> Result<()>;

    /// Record a failed retry attempt; see [`OutboxEvent::increment_retry`].
    async fn increment_retry(&self, id: Uuid, error: &str) -> Result<()>;

    /// Set status `MaxRetry`.
    async fn mark_as_max_retry(&self, id: Uuid, error: &str) -> Result<()>;

    /// Stamp `dlq_handled_at` so the DLQ loop skips the event.
    async fn mark_dlq_handled(&self, id: Uuid) -> Result<()>;

    async fn delete(&self, id: Uuid) -> Result<()>;

    /// Returns the number of rows removed.
    async fn delete_batch(&self, ids: &[Uuid]) -> Result<u64>;

    /// Remove published events with `published_at < before`.
    async fn delete_published_before(
        &self,
        before: DateTime<Utc>,
        tenant_id: Option<&str>,
    ) -> Result<u64>;

    /// Remove failed events with `updated_at < before`.
    async fn delete_failed_before(
        &self,
        before: DateTime<Utc>,
        tenant_id: Option<&str>,
    ) -> Result<u64>;

    /// Count events, optionally restricted to one status.
    async fn count(&self, status: Option<EventStatus>, tenant_id: Option<&str>) -> Result<u64>;

    /// Count events grouped by status. Statuses without rows may be absent.
    async fn count_by_status(&self, tenant_id: Option<&str>) -> Result<HashMap<EventStatus, u64>>;

    /// The stats extension, when the store supports it.
    fn stats_provider(&self) -> Option<&dyn RepositoryStatsProvider> {
        None
    }
}

/// Aggregate view of the outbox contents.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RepositoryStats {
    pub pending_count: u64,
    pub published_count: u64,
    pub failed_count: u64,
    pub max_retry_count: u64,
    /// Age of the oldest pending event.
    pub oldest_pending_age: Option<Duration>,
}

impl RepositoryStats {
    pub fn from_counts(
        counts: &HashMap<EventStatus, u64>,
        oldest_pending_age: Option<Duration>,
    ) -> Self {
        let count = |status| counts.get(&status).copied().unwrap_or(0);
        Self {
            pending_count: count(EventStatus::Pending),
            published_count: count(EventStatus::Published),
            failed_count: count(EventStatus::Failed),
            max_retry_count: count(EventStatus::MaxRetry),
            oldest_pending_age,
        }
    }

    pub fn total(&self) -> u64 {
        self.pending_count + self.published_count + self.failed_count + self.max_retry_count
    }

    pub fn has_pending(&self) -> bool {
        self.pending_count > 0
    }

    /// Share of events that failed or were dead-lettered.
    pub fn error_rate(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            0.0
        } else {
            (self.failed_count + self.max_retry_count) as f64 / total as f64
        }
    }
}

/// Optional stats capability of a repository.
#[async_trait]
pub trait RepositoryStatsProvider: Send + Sync {
    async fn stats(&self, tenant_id: Option<&str>) -> Result<RepositoryStats>;
}

/// Optional capability: persist events inside a caller-owned transaction.
///
/// `Transaction` is opaque to the engine. A typical writer:
///
/// ```ignore
/// let mut tx = repository.begin().await?;
/// // business writes through the same handle ...
/// repository.save_in_tx(&mut tx, &event).await?;
/// repository.commit(tx).await?;
/// ```
#[async_trait]
pub trait TransactionalRepository: OutboxRepository {
    type Transaction: Send;

    async fn begin(&self) -> Result<Self::Transaction>;

    async fn commit(&self, tx: Self::Transaction) -> Result<()>;

    async fn rollback(&self, tx: Self::Transaction) -> Result<()>;

    async fn save_in_tx(&self, tx: &mut Self::Transaction, event: &OutboxEvent) -> Result<()>;

    async fn save_batch_in_tx(
        &self,
        tx: &mut Self::Transaction,
        events: &[OutboxEvent],
    ) -> Result<()> {
        for event in events {
            self.save_in_tx(tx, event).await?;
        }
        Ok(())
    }
}
