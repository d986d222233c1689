//! Adapter error type and its mapping onto [`OutboxError`].

use outbox_engine_core::OutboxError;

/// Name of the unique constraint guarding idempotency keys.
pub(crate) const IDEMPOTENCY_KEY_CONSTRAINT: &str = "uq_outbox_events_idempotency_key";

/// Error type specific to the PostgreSQL outbox repository
#[derive(Debug, thiserror::Error)]
pub enum PostgresOutboxRepositoryError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Outbox domain error: {0}")]
    Outbox(#[from] OutboxError),

    #[error("Invalid value in column {column}: {message}")]
    InvalidColumn {
        column: &'static str,
        message: String,
    },
}

fn is_idempotency_violation(db: &dyn sqlx::error::DatabaseError) -> bool {
    db.is_unique_violation() && db.constraint() == Some(IDEMPOTENCY_KEY_CONSTRAINT)
}

impl PostgresOutboxRepositoryError {
    /// Whether the database rejected a duplicate idempotency key.
    pub fn is_duplicate_idempotency_key(&self) -> bool {
        match self {
            Self::Database(e) => e.as_database_error().is_some_and(is_idempotency_violation),
            Self::Outbox(OutboxError::DuplicateIdempotencyKey(_)) => true,
            _ => false,
        }
    }
}

impl From<PostgresOutboxRepositoryError> for OutboxError {
    fn from(err: PostgresOutboxRepositoryError) -> Self {
        match err {
            PostgresOutboxRepositoryError::Outbox(e) => e,
            PostgresOutboxRepositoryError::Database(e) => match e.as_database_error() {
                Some(db) if is_idempotency_violation(db) => {
                    OutboxError::DuplicateIdempotencyKey(db.message().to_string())
                }
                _ => OutboxError::repository(format!("Database error: {e}")),
            },
            other => OutboxError::repository(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conversion_into_outbox_error() {
        let err = OutboxError::from(PostgresOutboxRepositoryError::Database(
            sqlx::Error::PoolTimedOut,
        ));
        assert!(matches!(err, OutboxError::Repository { .. }));
        assert!(err.to_string().contains("pool timed out"));

        let err = OutboxError::from(PostgresOutboxRepositoryError::InvalidColumn {
            column: "status",
            message: "unknown".to_string(),
        });
        assert_eq!(
            err.to_string(),
            "Repository error: Invalid value in column status: unknown"
        );
    }

    #[test]
    fn test_domain_errors_pass_through() {
        let id = uuid::Uuid::new_v4();
        let err = OutboxError::from(PostgresOutboxRepositoryError::from(
            OutboxError::NotFound(id),
        ));
        assert!(matches!(err, OutboxError::NotFound(found) if found == id));

        let duplicate = PostgresOutboxRepositoryError::from(
            OutboxError::DuplicateIdempotencyKey("k-1".to_string()),
        );
        assert!(duplicate.is_duplicate_idempotency_key());
        assert!(matches!(
            OutboxError::from(duplicate),
            OutboxError::DuplicateIdempotencyKey(key) if key == "k-1"
        ));
    }
}
