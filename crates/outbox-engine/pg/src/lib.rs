//! # outbox-engine-pg
//!
//! PostgreSQL storage for outbox-engine.
//!
//! [`PostgresOutboxRepository`] implements `OutboxRepository`,
//! `RepositoryStatsProvider` and `TransactionalRepository` on top of a
//! `sqlx` connection pool.
//!
//! ```rust,ignore
//! let pool = PgPool::connect(&database_url).await?;
//! let repository = PostgresOutboxRepository::new(pool);
//! repository.run_migrations().await?;
//!
//! let mut tx = repository.begin().await?;
//! sqlx::query("UPDATE orders SET state = 'paid' WHERE id = $1")
//!     .bind(order_id)
//!     .execute(&mut *tx)
//!     .await?;
//! repository.save_in_tx(&mut tx, &event).await?;
//! repository.commit(tx).await?;
//! ```

mod error;
mod repository;
mod row;
mod transaction;

pub use error::PostgresOutboxRepositoryError;
pub use repository::PostgresOutboxRepository;
