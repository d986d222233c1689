//! Mapping between `outbox_events` rows and [`OutboxEvent`].

use chrono::{DateTime, Utc};
use outbox_engine_core::{EventStatus, OutboxEvent};
use sqlx::FromRow;
use uuid::Uuid;

use crate::error::PostgresOutboxRepositoryError;

/// Column list shared by every `SELECT` of a full event.
pub(crate) const EVENT_COLUMNS: &str = "id, tenant_id, aggregate_id, aggregate_type, event_type, \
     payload, status, retry_count, max_retries, last_error, created_at, updated_at, \
     published_at, scheduled_at, last_retry_at, dlq_handled_at, version, trace_id, \
     correlation_id, idempotency_key";

/// Row struct for outbox_events queries
#[derive(Debug, FromRow)]
pub(crate) struct OutboxEventRow {
    pub id: Uuid,
    pub tenant_id: String,
    pub aggregate_id: String,
    pub aggregate_type: String,
    pub event_type: String,
    pub payload: Vec<u8>,
    pub status: String,
    pub retry_count: i32,
    pub max_retries: i32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub last_retry_at: Option<DateTime<Utc>>,
    pub dlq_handled_at: Option<DateTime<Utc>>,
    pub version: i64,
    pub trace_id: Option<String>,
    pub correlation_id: Option<String>,
    pub idempotency_key: Option<String>,
}

fn counter(column: &'static str, value: i32) -> Result<u32, PostgresOutboxRepositoryError> {
    u32::try_from(value).map_err(|_| PostgresOutboxRepositoryError::InvalidColumn {
        column,
        message: format!("negative value {value}"),
    })
}

/// Counter value as stored; saturates at `i32::MAX`.
pub(crate) fn to_db_counter(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

impl TryFrom<OutboxEventRow> for OutboxEvent {
    type Error = PostgresOutboxRepositoryError;

    fn try_from(row: OutboxEventRow) -> Result<Self, Self::Error> {
        let status: EventStatus =
            row.status
                .parse()
                .map_err(|_| PostgresOutboxRepositoryError::InvalidColumn {
                    column: "status",
                    message: format!("unknown status '{}'", row.status),
                })?;

        Ok(OutboxEvent {
            id: row.id,
            tenant_id: row.tenant_id,
            aggregate_id: row.aggregate_id,
            aggregate_type: row.aggregate_type,
            event_type: row.event_type,
            payload: row.payload,
            status,
            retry_count: counter("retry_count", row.retry_count)?,
            max_retries: counter("max_retries", row.max_retries)?,
            last_error: row.last_error,
            created_at: row.created_at,
            updated_at: row.updated_at,
            published_at: row.published_at,
            scheduled_at: row.scheduled_at,
            last_retry_at: row.last_retry_at,
            dlq_handled_at: row.dlq_handled_at,
            version: row.version,
            trace_id: row.trace_id,
            correlation_id: row.correlation_id,
            idempotency_key: row.idempotency_key,
        })
    }
}

pub(crate) fn into_events(
    rows: Vec<OutboxEventRow>,
) -> Result<Vec<OutboxEvent>, PostgresOutboxRepositoryError> {
    rows.into_iter().map(OutboxEvent::try_from).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row_for(event: &OutboxEvent) -> OutboxEventRow {
        OutboxEventRow {
            id: event.id,
            tenant_id: event.tenant_id.clone(),
            aggregate_id: event.aggregate_id.clone(),
            aggregate_type: event.aggregate_type.clone(),
            event_type: event.event_type.clone(),
            payload: event.payload.clone(),
            status: event.status.as_str().to_string(),
            retry_count: to_db_counter(event.retry_count),
            max_retries: to_db_counter(event.max_retries),
            last_error: event.last_error.clone(),
            created_at: event.created_at,
            updated_at: event.updated_at,
            published_at: event.published_at,
            scheduled_at: event.scheduled_at,
            last_retry_at: event.last_retry_at,
            dlq_handled_at: event.dlq_handled_at,
            version: event.version,
            trace_id: event.trace_id.clone(),
            correlation_id: event.correlation_id.clone(),
            idempotency_key: event.idempotency_key.clone(),
        }
    }

    #[test]
    fn test_row_maps_every_field() {
        let mut event = OutboxEvent::new("t1", "Order", "o-1", "OrderCreated", &json!({"n": 1}))
            .unwrap()
            .with_trace_id("trace-1")
            .with_correlation_id("corr-1")
            .with_version(2);
        event.mark_as_failed("boom");
        event.mark_as_max_retry("boom");

        let mapped = OutboxEvent::try_from(row_for(&event)).unwrap();
        assert_eq!(mapped, event);
    }

    #[test]
    fn test_invalid_rows_are_rejected() {
        let event = OutboxEvent::new("t1", "Order", "o-1", "OrderCreated", &json!({})).unwrap();

        let mut row = row_for(&event);
        row.status = "archived".to_string();
        let err = OutboxEvent::try_from(row).unwrap_err();
        assert!(matches!(
            err,
            PostgresOutboxRepositoryError::InvalidColumn { column: "status", .. }
        ));

        let mut row = row_for(&event);
        row.retry_count = -1;
        let err = OutboxEvent::try_from(row).unwrap_err();
        assert!(matches!(
            err,
            PostgresOutboxRepositoryError::InvalidColumn { column: "retry_count", .. }
        ));
    }

    #[test]
    fn test_counter_saturates() {
        assert_eq!(to_db_counter(7), 7);
        assert_eq!(to_db_counter(u32::MAX), i32::MAX);
    }
}
