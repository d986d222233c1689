//! PostgreSQL Outbox Repository
//!
//! SQLx-based implementation of [`OutboxRepository`] and
//! [`RepositoryStatsProvider`]. Queries are built at runtime, so no database
//! is required at compile time.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use outbox_engine_core::{
    EventStatus, OutboxError, OutboxEvent, OutboxRepository, RepositoryStats,
    RepositoryStatsProvider, Result,
};
use sqlx::postgres::{PgExecutor, PgPool};
use sqlx::{Postgres, QueryBuilder};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{IDEMPOTENCY_KEY_CONSTRAINT, PostgresOutboxRepositoryError};
use crate::row::{EVENT_COLUMNS, OutboxEventRow, into_events, to_db_counter};

/// Tenant predicate bound to `$n`; a NULL binding matches every tenant.
macro_rules! tenant_filter {
    ($n:literal) => {
        concat!("($", $n, "::TEXT IS NULL OR tenant_id = $", $n, ")")
    };
}

fn db_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

fn db_err(e: sqlx::Error) -> OutboxError {
    PostgresOutboxRepositoryError::Database(e).into()
}

/// Insert `events` with one multi-row statement on `executor`.
pub(crate) async fn insert_events<'e, E>(executor: E, events: &[OutboxEvent]) -> Result<()>
where
    E: PgExecutor<'e>,
{
    if events.is_empty() {
        return Ok(());
    }

    let mut query_builder: QueryBuilder<Postgres> = QueryBuilder::new(
        "INSERT INTO outbox_events (id, tenant_id, aggregate_id, aggregate_type, event_type, \
         payload, status, retry_count, max_retries, last_error, created_at, updated_at, \
         published_at, scheduled_at, last_retry_at, dlq_handled_at, version, trace_id, \
         correlation_id, idempotency_key) ",
    );
    query_builder.push_values(events, |mut b, event| {
        b.push_bind(event.id)
            .push_bind(&event.tenant_id)
            .push_bind(&event.aggregate_id)
            .push_bind(&event.aggregate_type)
            .push_bind(&event.event_type)
            .push_bind(&event.payload)
            .push_bind(event.status.as_str())
            .push_bind(to_db_counter(event.retry_count))
            .push_bind(to_db_counter(event.max_retries))
            .push_bind(&event.last_error)
            .push_bind(event.created_at)
            .push_bind(event.updated_at)
            .push_bind(event.published_at)
            .push_bind(event.scheduled_at)
            .push_bind(event.last_retry_at)
            .push_bind(event.dlq_handled_at)
            .push_bind(event.version)
            .push_bind(&event.trace_id)
            .push_bind(&event.correlation_id)
            .push_bind(&event.idempotency_key);
    });

    query_builder
        .build()
        .execute(executor)
        .await
        .map_err(|e| insert_error(e, events))?;
    Ok(())
}

/// Name the offending key when a single insert hits the idempotency constraint.
fn insert_error(e: sqlx::Error, events: &[OutboxEvent]) -> OutboxError {
    let err = PostgresOutboxRepositoryError::Database(e);
    if let ([event], true) = (events, err.is_duplicate_idempotency_key()) {
        if let Some(key) = &event.idempotency_key {
            return OutboxError::DuplicateIdempotencyKey(key.clone());
        }
    }
    err.into()
}

async fn update_event<'e, E>(executor: E, event: &OutboxEvent) -> Result<u64>
where
    E: PgExecutor<'e>,
{
    let result = sqlx::query(
        r#"
        UPDATE outbox_events
        SET tenant_id = $2, aggregate_id = $3, aggregate_type = $4, event_type = $5,
            payload = $6, status = $7, retry_count = $8, max_retries = $9,
            last_error = $10, updated_at = $11, published_at = $12, scheduled_at = $13,
            last_retry_at = $14, dlq_handled_at = $15, version = $16, trace_id = $17,
            correlation_id = $18, idempotency_key = $19
        WHERE id = $1 AND status <> 'published'
        "#,
    )
    .bind(event.id)
    .bind(&event.tenant_id)
    .bind(&event.aggregate_id)
    .bind(&event.aggregate_type)
    .bind(&event.event_type)
    .bind(&event.payload)
    .bind(event.status.as_str())
    .bind(to_db_counter(event.retry_count))
    .bind(to_db_counter(event.max_retries))
    .bind(&event.last_error)
    .bind(event.updated_at)
    .bind(event.published_at)
    .bind(event.scheduled_at)
    .bind(event.last_retry_at)
    .bind(event.dlq_handled_at)
    .bind(event.version)
    .bind(&event.trace_id)
    .bind(&event.correlation_id)
    .bind(&event.idempotency_key)
    .execute(executor)
    .await
    .map_err(|e| insert_error(e, std::slice::from_ref(event)))?;
    Ok(result.rows_affected())
}

/// PostgreSQL implementation of [`OutboxRepository`].
///
/// Rows live in the `outbox_events` table created by
/// [`Self::run_migrations`]. Published rows are never modified again.
#[derive(Debug, Clone)]
pub struct PostgresOutboxRepository {
    pool: PgPool,
}

impl PostgresOutboxRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the `outbox_events` table and its indexes if missing.
    pub async fn run_migrations(&self) -> std::result::Result<(), PostgresOutboxRepositoryError> {
        let create_table = format!(
            r#"
            CREATE TABLE IF NOT EXISTS outbox_events (
                id UUID PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                aggregate_id TEXT NOT NULL,
                aggregate_type TEXT NOT NULL,
                event_type TEXT NOT NULL,
                payload BYTEA NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending'
                    CHECK (status IN ('pending', 'published', 'failed', 'max_retry')),
                retry_count INTEGER NOT NULL DEFAULT 0,
                max_retries INTEGER NOT NULL DEFAULT 3,
                last_error TEXT,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                published_at TIMESTAMPTZ,
                scheduled_at TIMESTAMPTZ,
                last_retry_at TIMESTAMPTZ,
                dlq_handled_at TIMESTAMPTZ,
                version BIGINT NOT NULL DEFAULT 1,
                trace_id TEXT,
                correlation_id TEXT,
                idempotency_key TEXT,
                CONSTRAINT {IDEMPOTENCY_KEY_CONSTRAINT} UNIQUE (idempotency_key)
            )
            "#
        );

        let statements = [
            create_table.as_str(),
            "CREATE INDEX IF NOT EXISTS idx_outbox_events_pending \
             ON outbox_events (created_at) WHERE status = 'pending'",
            "CREATE INDEX IF NOT EXISTS idx_outbox_events_failed \
             ON outbox_events (updated_at) WHERE status = 'failed'",
            "CREATE INDEX IF NOT EXISTS idx_outbox_events_dlq \
             ON outbox_events (created_at) WHERE status = 'max_retry' AND dlq_handled_at IS NULL",
            "CREATE INDEX IF NOT EXISTS idx_outbox_events_published \
             ON outbox_events (published_at) WHERE status = 'published'",
            "CREATE INDEX IF NOT EXISTS idx_outbox_events_tenant_status \
             ON outbox_events (tenant_id, status)",
            "CREATE INDEX IF NOT EXISTS idx_outbox_events_aggregate \
             ON outbox_events (aggregate_id)",
        ];
        for statement in statements {
            sqlx::query(statement).execute(&self.pool).await?;
        }

        info!("Outbox schema is up to date");
        Ok(())
    }

    /// Resolve a zero-row mutation: `NotFound` when the id does not exist,
    /// otherwise the row was left alone on purpose.
    async fn ensure_exists(&self, id: Uuid, rows_affected: u64) -> Result<()> {
        if rows_affected > 0 {
            return Ok(());
        }
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM outbox_events WHERE id = $1)")
                .bind(id)
                .fetch_one(&self.pool)
                .await
                .map_err(db_err)?;
        if exists {
            debug!(event_id = %id, "Published outbox event left unchanged");
            Ok(())
        } else {
            Err(OutboxError::NotFound(id))
        }
    }

    async fn execute_for(&self, id: Uuid, sql: &str, error: Option<&str>) -> Result<()> {
        let mut query = sqlx::query(sql).bind(id);
        if let Some(error) = error {
            query = query.bind(error);
        }
        let result = query.execute(&self.pool).await.map_err(db_err)?;
        self.ensure_exists(id, result.rows_affected()).await
    }
}

#[async_trait]
impl OutboxRepository for PostgresOutboxRepository {
    async fn save(&self, event: &OutboxEvent) -> Result<()> {
        insert_events(&self.pool, std::slice::from_ref(event)).await
    }

    async fn save_batch(&self, events: &[OutboxEvent]) -> Result<()> {
        insert_events(&self.pool, events).await
    }

    async fn update(&self, event: &OutboxEvent) -> Result<()> {
        let rows = update_event(&self.pool, event).await?;
        self.ensure_exists(event.id, rows).await
    }

    async fn batch_update(&self, events: &[OutboxEvent]) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        for event in events {
            if update_event(&mut *tx, event).await? == 0 {
                let exists: bool =
                    sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM outbox_events WHERE id = $1)")
                        .bind(event.id)
                        .fetch_one(&mut *tx)
                        .await
                        .map_err(db_err)?;
                if !exists {
                    return Err(OutboxError::NotFound(event.id));
                }
            }
        }
        tx.commit().await.map_err(db_err)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<OutboxEvent>> {
        let row: Option<OutboxEventRow> = sqlx::query_as(&format!(
            "SELECT {EVENT_COLUMNS} FROM outbox_events WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(row.map(OutboxEvent::try_from).transpose()?)
    }

    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<OutboxEvent>> {
        let row: Option<OutboxEventRow> = sqlx::query_as(&format!(
            "SELECT {EVENT_COLUMNS} FROM outbox_events WHERE idempotency_key = $1"
        ))
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(row.map(OutboxEvent::try_from).transpose()?)
    }

    async fn exists_by_idempotency_key(&self, key: &str) -> Result<bool> {
        sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM outbox_events WHERE idempotency_key = $1)",
        )
        .bind(key)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)
    }

    async fn find_by_aggregate_id(
        &self,
        aggregate_id: &str,
        tenant_id: Option<&str>,
    ) -> Result<Vec<OutboxEvent>> {
        let rows: Vec<OutboxEventRow> = sqlx::query_as(&format!(
            "SELECT {EVENT_COLUMNS} FROM outbox_events \
             WHERE aggregate_id = $1 AND {} \
             ORDER BY created_at ASC, id ASC",
            tenant_filter!("2")
        ))
        .bind(aggregate_id)
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(into_events(rows)?)
    }

    async fn find_by_aggregate_type(
        &self,
        aggregate_type: &str,
        limit: usize,
    ) -> Result<Vec<OutboxEvent>> {
        let rows: Vec<OutboxEventRow> = sqlx::query_as(&format!(
            "SELECT {EVENT_COLUMNS} FROM outbox_events \
             WHERE status = 'pending' AND aggregate_type = $1 \
             ORDER BY created_at ASC, id ASC \
             LIMIT $2"
        ))
        .bind(aggregate_type)
        .bind(db_limit(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(into_events(rows)?)
    }

    async fn find_pending_events(
        &self,
        limit: usize,
        tenant_id: Option<&str>,
    ) -> Result<Vec<OutboxEvent>> {
        let rows: Vec<OutboxEventRow> = sqlx::query_as(&format!(
            "SELECT {EVENT_COLUMNS} FROM outbox_events \
             WHERE status = 'pending' \
             AND (scheduled_at IS NULL OR scheduled_at <= NOW()) \
             AND {} \
             ORDER BY created_at ASC, id ASC \
             LIMIT $1",
            tenant_filter!("2")
        ))
        .bind(db_limit(limit))
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(into_events(rows)?)
    }

    async fn find_pending_events_with_delay(
        &self,
        tenant_id: Option<&str>,
        delay: Duration,
        limit: usize,
    ) -> Result<Vec<OutboxEvent>> {
        let rows: Vec<OutboxEventRow> = sqlx::query_as(&format!(
            "SELECT {EVENT_COLUMNS} FROM outbox_events \
             WHERE status = 'pending' \
             AND created_at < NOW() - make_interval(secs => $3) \
             AND {} \
             ORDER BY created_at ASC, id ASC \
             LIMIT $1",
            tenant_filter!("2")
        ))
        .bind(db_limit(limit))
        .bind(tenant_id)
        .bind(delay.as_secs_f64())
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(into_events(rows)?)
    }

    async fn find_events_for_retry(
        &self,
        max_retries: u32,
        limit: usize,
    ) -> Result<Vec<OutboxEvent>> {
        let rows: Vec<OutboxEventRow> = sqlx::query_as(&format!(
            "SELECT {EVENT_COLUMNS} FROM outbox_events \
             WHERE status = 'failed' AND retry_count <= $1 \
             ORDER BY created_at ASC, id ASC \
             LIMIT $2"
        ))
        .bind(to_db_counter(max_retries))
        .bind(db_limit(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(into_events(rows)?)
    }

    async fn find_max_retry_events(
        &self,
        limit: usize,
        tenant_id: Option<&str>,
    ) -> Result<Vec<OutboxEvent>> {
        let rows: Vec<OutboxEventRow> = sqlx::query_as(&format!(
            "SELECT {EVENT_COLUMNS} FROM outbox_events \
             WHERE status = 'max_retry' AND dlq_handled_at IS NULL \
             AND {} \
             ORDER BY created_at ASC, id ASC \
             LIMIT $1",
            tenant_filter!("2")
        ))
        .bind(db_limit(limit))
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(into_events(rows)?)
    }

    async fn mark_as_published(&self, id: Uuid) -> Result<()> {
        self.execute_for(
            id,
            r#"
            UPDATE outbox_events
            SET status = 'published', published_at = NOW(), updated_at = NOW()
            WHERE id = $1 AND status <> 'published'
            "#,
            None,
        )
        .await
    }

    async fn mark_as_failed(&self, id: Uuid, error: &str) -> Result<()> {
        self.execute_for(
            id,
            r#"
            UPDATE outbox_events
            SET status = 'failed',
                retry_count = retry_count + 1,
                last_error = $2,
                last_retry_at = NOW(),
                updated_at = NOW()
            WHERE id = $1 AND status <> 'published'
            "#,
            Some(error),
        )
        .await
    }

    async fn increment_retry(&self, id: Uuid, error: &str) -> Result<()> {
        // Right-hand sides read the pre-update row.
        self.execute_for(
            id,
            r#"
            UPDATE outbox_events
            SET status = CASE WHEN retry_count < max_retries THEN 'failed' ELSE 'max_retry' END,
                retry_count = retry_count + 1,
                last_error = $2,
                last_retry_at = NOW(),
                updated_at = NOW()
            WHERE id = $1 AND status <> 'published'
            "#,
            Some(error),
        )
        .await
    }

    async fn mark_as_max_retry(&self, id: Uuid, error: &str) -> Result<()> {
        self.execute_for(
            id,
            r#"
            UPDATE outbox_events
            SET status = 'max_retry', last_error = $2, updated_at = NOW()
            WHERE id = $1 AND status <> 'published'
            "#,
            Some(error),
        )
        .await
    }

    async fn mark_dlq_handled(&self, id: Uuid) -> Result<()> {
        self.execute_for(
            id,
            "UPDATE outbox_events SET dlq_handled_at = NOW(), updated_at = NOW() WHERE id = $1",
            None,
        )
        .await
    }

    async fn delete(&self, id: Uuid) -> Result<()> {
        let result = sqlx::query("DELETE FROM outbox_events WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(OutboxError::NotFound(id));
        }
        Ok(())
    }

    async fn delete_batch(&self, ids: &[Uuid]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let result = sqlx::query("DELETE FROM outbox_events WHERE id = ANY($1)")
            .bind(ids)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(result.rows_affected())
    }

    async fn delete_published_before(
        &self,
        before: DateTime<Utc>,
        tenant_id: Option<&str>,
    ) -> Result<u64> {
        let result = sqlx::query(&format!(
            "DELETE FROM outbox_events \
             WHERE status = 'published' AND published_at < $1 AND {}",
            tenant_filter!("2")
        ))
        .bind(before)
        .bind(tenant_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected())
    }

    async fn delete_failed_before(
        &self,
        before: DateTime<Utc>,
        tenant_id: Option<&str>,
    ) -> Result<u64> {
        let result = sqlx::query(&format!(
            "DELETE FROM outbox_events \
             WHERE status = 'failed' AND updated_at < $1 AND {}",
            tenant_filter!("2")
        ))
        .bind(before)
        .bind(tenant_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected())
    }

    async fn count(&self, status: Option<EventStatus>, tenant_id: Option<&str>) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM outbox_events \
             WHERE ($1::TEXT IS NULL OR status = $1) AND {}",
            tenant_filter!("2")
        ))
        .bind(status.map(|s| s.as_str()))
        .bind(tenant_id)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(count.max(0) as u64)
    }

    async fn count_by_status(&self, tenant_id: Option<&str>) -> Result<HashMap<EventStatus, u64>> {
        let rows: Vec<(String, i64)> = sqlx::query_as(&format!(
            "SELECT status, COUNT(*) FROM outbox_events WHERE {} GROUP BY status",
            tenant_filter!("1")
        ))
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let mut counts = HashMap::with_capacity(rows.len());
        for (status, count) in rows {
            let status: EventStatus = status.parse()?;
            counts.insert(status, count.max(0) as u64);
        }
        Ok(counts)
    }

    fn stats_provider(&self) -> Option<&dyn RepositoryStatsProvider> {
        Some(self)
    }
}

#[async_trait]
impl RepositoryStatsProvider for PostgresOutboxRepository {
    async fn stats(&self, tenant_id: Option<&str>) -> Result<RepositoryStats> {
        let counts = self.count_by_status(tenant_id).await?;
        let oldest_pending_secs: Option<f64> = sqlx::query_scalar(&format!(
            "SELECT EXTRACT(EPOCH FROM (NOW() - MIN(created_at)))::FLOAT8 \
             FROM outbox_events WHERE status = 'pending' AND {}",
            tenant_filter!("1")
        ))
        .bind(tenant_id)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        let oldest_pending_age = oldest_pending_secs
            .filter(|secs| secs.is_finite() && *secs >= 0.0)
            .map(Duration::from_secs_f64);
        Ok(RepositoryStats::from_counts(&counts, oldest_pending_age))
    }
}
