//! In-memory implementation of the outbox repository ports.
//!
//! Implements [`OutboxRepository`], [`RepositoryStatsProvider`] and
//! [`TransactionalRepository`] with the same semantics as the PostgreSQL
//! adapter, including idempotency-key uniqueness. Failure and latency can
//! be injected to exercise error paths of the publisher and scheduler.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use outbox_engine_core::{
    EventStatus, OutboxError, OutboxEvent, OutboxRepository, RepositoryStats,
    RepositoryStatsProvider, Result, TransactionalRepository,
};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Default)]
struct Store {
    events: HashMap<Uuid, OutboxEvent>,
    /// idempotency key -> event id
    keys: HashMap<String, Uuid>,
}

impl Store {
    fn check_insert(&self, event: &OutboxEvent) -> Result<()> {
        if self.events.contains_key(&event.id) {
            return Err(OutboxError::repository(format!(
                "event {} already exists",
                event.id
            )));
        }
        if let Some(key) = &event.idempotency_key {
            if self.keys.contains_key(key) {
                return Err(OutboxError::DuplicateIdempotencyKey(key.clone()));
            }
        }
        Ok(())
    }

    fn insert(&mut self, event: OutboxEvent) {
        if let Some(key) = &event.idempotency_key {
            self.keys.insert(key.clone(), event.id);
        }
        self.events.insert(event.id, event);
    }

    fn remove(&mut self, id: &Uuid) -> bool {
        match self.events.remove(id) {
            Some(event) => {
                if let Some(key) = &event.idempotency_key {
                    self.keys.remove(key);
                }
                true
            }
            None => false,
        }
    }

    fn modify(&mut self, id: Uuid, f: impl FnOnce(&mut OutboxEvent)) -> Result<()> {
        let event = self.events.get_mut(&id).ok_or(OutboxError::NotFound(id))?;
        f(event);
        Ok(())
    }

    /// Matching events, oldest first, at most `limit`.
    fn select(&self, limit: usize, filter: impl Fn(&OutboxEvent) -> bool) -> Vec<OutboxEvent> {
        let mut matches: Vec<_> = self.events.values().filter(|e| filter(e)).collect();
        matches.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        matches.into_iter().take(limit).cloned().collect()
    }

    fn delete_where(&mut self, filter: impl Fn(&OutboxEvent) -> bool) -> u64 {
        let ids: Vec<Uuid> = self
            .events
            .values()
            .filter(|e| filter(e))
            .map(|e| e.id)
            .collect();
        ids.iter().filter(|id| self.remove(id)).count() as u64
    }
}

fn tenant_matches(event: &OutboxEvent, tenant_id: Option<&str>) -> bool {
    tenant_id.is_none_or(|tenant| event.tenant_id == tenant)
}

/// In-memory outbox store.
///
/// # Example
///
/// ```rust,ignore
/// let repository = InMemoryOutboxRepository::new();
/// repository.save(&event).await?;
/// assert_eq!(repository.len(), 1);
///
/// repository.fail_with("connection reset");
/// assert!(repository.find_pending_events(10, None).await.is_err());
/// ```
#[derive(Debug, Default)]
pub struct InMemoryOutboxRepository {
    store: RwLock<Store>,
    failure: RwLock<Option<String>>,
    delay: RwLock<Duration>,
}

/// Buffered inserts applied atomically on commit.
#[derive(Debug, Default)]
pub struct InMemoryTransaction {
    pending: Vec<OutboxEvent>,
}

impl InMemoryTransaction {
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

impl InMemoryOutboxRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store seeded with `events`, bypassing uniqueness checks.
    pub fn with_events(events: impl IntoIterator<Item = OutboxEvent>) -> Self {
        let repository = Self::new();
        {
            let mut store = repository.store.write();
            for event in events {
                store.insert(event);
            }
        }
        repository
    }

    /// Fail every subsequent operation with a repository error.
    pub fn fail_with(&self, message: impl Into<String>) {
        *self.failure.write() = Some(message.into());
    }

    pub fn clear_failure(&self) {
        *self.failure.write() = None;
    }

    /// Sleep this long at the start of every operation.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.write() = delay;
    }

    pub fn get(&self, id: Uuid) -> Option<OutboxEvent> {
        self.store.read().events.get(&id).cloned()
    }

    pub fn all(&self) -> Vec<OutboxEvent> {
        self.store.read().select(usize::MAX, |_| true)
    }

    pub fn len(&self) -> usize {
        self.store.read().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.read().events.is_empty()
    }

    pub fn clear(&self) {
        let mut store = self.store.write();
        store.events.clear();
        store.keys.clear();
    }

    async fn enter(&self) -> Result<()> {
        let delay = *self.delay.read();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        match self.failure.read().as_ref() {
            Some(message) => Err(OutboxError::repository(message.clone())),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl OutboxRepository for InMemoryOutboxRepository {
    async fn save(&self, event: &OutboxEvent) -> Result<()> {
        self.enter().await?;
        let mut store = self.store.write();
        store.check_insert(event)?;
        store.insert(event.clone());
        Ok(())
    }

    async fn save_batch(&self, events: &[OutboxEvent]) -> Result<()> {
        self.enter().await?;
        let mut store = self.store.write();
        let mut batch_keys = std::collections::HashSet::new();
        for event in events {
            store.check_insert(event)?;
            if let Some(key) = &event.idempotency_key {
                if !batch_keys.insert(key.as_str()) {
                    return Err(OutboxError::DuplicateIdempotencyKey(key.clone()));
                }
            }
        }
        for event in events {
            store.insert(event.clone());
        }
        Ok(())
    }

    async fn update(&self, event: &OutboxEvent) -> Result<()> {
        self.enter().await?;
        let mut store = self.store.write();
        match store.events.get(&event.id) {
            None => return Err(OutboxError::NotFound(event.id)),
            // Published rows are never overwritten.
            Some(stored) if stored.is_published() => return Ok(()),
            Some(_) => {}
        }
        store.remove(&event.id);
        store.insert(event.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<OutboxEvent>> {
        self.enter().await?;
        Ok(self.get(id))
    }

    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<OutboxEvent>> {
        self.enter().await?;
        let store = self.store.read();
        Ok(store
            .keys
            .get(key)
            .and_then(|id| store.events.get(id))
            .cloned())
    }

    async fn find_by_aggregate_id(
        &self,
        aggregate_id: &str,
        tenant_id: Option<&str>,
    ) -> Result<Vec<OutboxEvent>> {
        self.enter().await?;
        Ok(self.store.read().select(usize::MAX, |e| {
            e.aggregate_id == aggregate_id && tenant_matches(e, tenant_id)
        }))
    }

    async fn find_by_aggregate_type(
        &self,
        aggregate_type: &str,
        limit: usize,
    ) -> Result<Vec<OutboxEvent>> {
        self.enter().await?;
        Ok(self.store.read().select(limit, |e| {
            e.aggregate_type == aggregate_type && e.is_pending()
        }))
    }

    async fn find_pending_events(
        &self,
        limit: usize,
        tenant_id: Option<&str>,
    ) -> Result<Vec<OutboxEvent>> {
        self.enter().await?;
        Ok(self.store.read().select(limit, |e| {
            e.is_pending() && e.should_publish_now() && tenant_matches(e, tenant_id)
        }))
    }

    async fn find_pending_events_with_delay(
        &self,
        tenant_id: Option<&str>,
        delay: Duration,
        limit: usize,
    ) -> Result<Vec<OutboxEvent>> {
        self.enter().await?;
        Ok(self.store.read().select(limit, |e| {
            e.is_pending() && e.is_expired(delay) && tenant_matches(e, tenant_id)
        }))
    }

    async fn find_events_for_retry(
        &self,
        max_retries: u32,
        limit: usize,
    ) -> Result<Vec<OutboxEvent>> {
        self.enter().await?;
        Ok(self
            .store
            .read()
            .select(limit, |e| e.is_failed() && e.retry_count <= max_retries))
    }

    async fn find_max_retry_events(
        &self,
        limit: usize,
        tenant_id: Option<&str>,
    ) -> Result<Vec<OutboxEvent>> {
        self.enter().await?;
        Ok(self.store.read().select(limit, |e| {
            e.is_max_retry() && e.dlq_handled_at.is_none() && tenant_matches(e, tenant_id)
        }))
    }

    async fn mark_as_published(&self, id: Uuid) -> Result<()> {
        self.enter().await?;
        self.store.write().modify(id, OutboxEvent::mark_as_published)
    }

    async fn mark_as_failed(&self, id: Uuid, error: &str) -> Result<()> {
        self.enter().await?;
        self.store.write().modify(id, |e| e.mark_as_failed(error))
    }

    async fn increment_retry(&self, id: Uuid, error: &str) -> Result<()> {
        self.enter().await?;
        self.store.write().modify(id, |e| e.increment_retry(error))
    }

    async fn mark_as_max_retry(&self, id: Uuid, error: &str) -> Result<()> {
        self.enter().await?;
        self.store.write().modify(id, |e| e.mark_as_max_retry(error))
    }

    async fn mark_dlq_handled(&self, id: Uuid) -> Result<()> {
        self.enter().await?;
        self.store.write().modify(id, OutboxEvent::mark_dlq_handled)
    }

    async fn delete(&self, id: Uuid) -> Result<()> {
        self.enter().await?;
        if self.store.write().remove(&id) {
            Ok(())
        } else {
            Err(OutboxError::NotFound(id))
        }
    }

    async fn delete_batch(&self, ids: &[Uuid]) -> Result<u64> {
        self.enter().await?;
        let mut store = self.store.write();
        Ok(ids.iter().filter(|id| store.remove(id)).count() as u64)
    }

    async fn delete_published_before(
        &self,
        before: DateTime<Utc>,
        tenant_id: Option<&str>,
    ) -> Result<u64> {
        self.enter().await?;
        Ok(self.store.write().delete_where(|e| {
            e.is_published()
                && e.published_at.is_some_and(|at| at < before)
                && tenant_matches(e, tenant_id)
        }))
    }

    async fn delete_failed_before(
        &self,
        before: DateTime<Utc>,
        tenant_id: Option<&str>,
    ) -> Result<u64> {
        self.enter().await?;
        Ok(self.store.write().delete_where(|e| {
            e.is_failed() && e.updated_at < before && tenant_matches(e, tenant_id)
        }))
    }

    async fn count(&self, status: Option<EventStatus>, tenant_id: Option<&str>) -> Result<u64> {
        self.enter().await?;
        Ok(self
            .store
            .read()
            .events
            .values()
            .filter(|e| status.is_none_or(|s| e.status == s) && tenant_matches(e, tenant_id))
            .count() as u64)
    }

    async fn count_by_status(&self, tenant_id: Option<&str>) -> Result<HashMap<EventStatus, u64>> {
        self.enter().await?;
        let mut counts = HashMap::new();
        for event in self.store.read().events.values() {
            if tenant_matches(event, tenant_id) {
                *counts.entry(event.status).or_insert(0) += 1;
            }
        }
        Ok(counts)
    }

    fn stats_provider(&self) -> Option<&dyn RepositoryStatsProvider> {
        Some(self)
    }
}

#[async_trait]
impl RepositoryStatsProvider for InMemoryOutboxRepository {
    async fn stats(&self, tenant_id: Option<&str>) -> Result<RepositoryStats> {
        let counts = self.count_by_status(tenant_id).await?;
        let now = Utc::now();
        let oldest_pending_age = self
            .store
            .read()
            .events
            .values()
            .filter(|e| e.is_pending() && tenant_matches(e, tenant_id))
            .map(|e| e.created_at)
            .min()
            .and_then(|oldest| now.signed_duration_since(oldest).to_std().ok());
        Ok(RepositoryStats::from_counts(&counts, oldest_pending_age))
    }
}

#[async_trait]
impl TransactionalRepository for InMemoryOutboxRepository {
    type Transaction = InMemoryTransaction;

    async fn begin(&self) -> Result<Self::Transaction> {
        self.enter().await?;
        Ok(InMemoryTransaction::default())
    }

    async fn commit(&self, tx: Self::Transaction) -> Result<()> {
        self.enter()
            .await
            .map_err(|e| OutboxError::transaction(e.to_string()))?;
        self.save_batch(&tx.pending).await
    }

    async fn rollback(&self, _tx: Self::Transaction) -> Result<()> {
        Ok(())
    }

    async fn save_in_tx(&self, tx: &mut Self::Transaction, event: &OutboxEvent) -> Result<()> {
        self.enter().await?;
        self.store.read().check_insert(event)?;
        let duplicate = event.idempotency_key.as_ref().is_some_and(|key| {
            tx.pending
                .iter()
                .any(|p| p.idempotency_key.as_ref() == Some(key))
        });
        if duplicate {
            return Err(OutboxError::DuplicateIdempotencyKey(
                event.idempotency_key.clone().unwrap_or_default(),
            ));
        }
        tx.pending.push(event.clone());
        Ok(())
    }
}
