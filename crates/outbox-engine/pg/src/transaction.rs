//! Transaction-aware outbox writes.
//!
//! Lets callers insert outbox rows on the same [`sqlx::Transaction`] as their
//! business writes, so both commit or roll back together.

use async_trait::async_trait;
use outbox_engine_core::{OutboxError, OutboxEvent, Result, TransactionalRepository};
use sqlx::Postgres;
use tracing::debug;

use crate::error::PostgresOutboxRepositoryError;
use crate::repository::{PostgresOutboxRepository, insert_events};

fn tx_err(e: sqlx::Error) -> OutboxError {
    OutboxError::transaction(PostgresOutboxRepositoryError::Database(e).to_string())
}

#[async_trait]
impl TransactionalRepository for PostgresOutboxRepository {
    type Transaction = sqlx::Transaction<'static, Postgres>;

    async fn begin(&self) -> Result<Self::Transaction> {
        self.pool().begin().await.map_err(tx_err)
    }

    async fn commit(&self, tx: Self::Transaction) -> Result<()> {
        tx.commit().await.map_err(tx_err)?;
        debug!("Outbox transaction committed");
        Ok(())
    }

    async fn rollback(&self, tx: Self::Transaction) -> Result<()> {
        tx.rollback().await.map_err(tx_err)
    }

    async fn save_in_tx(&self, tx: &mut Self::Transaction, event: &OutboxEvent) -> Result<()> {
        insert_events(&mut **tx, std::slice::from_ref(event)).await
    }

    async fn save_batch_in_tx(
        &self,
        tx: &mut Self::Transaction,
        events: &[OutboxEvent],
    ) -> Result<()> {
        insert_events(&mut **tx, events).await
    }
}
