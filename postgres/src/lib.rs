//! `PostgreSQL` backends for Fleet Sync.
//!
//! This crate provides the outbox table and the transaction plumbing around
//! it:
//!
//! - [`PostgresOutboxRepository`]: stages records, claims unpublished ones
//!   with `SELECT ... FOR UPDATE SKIP LOCKED` and answers the idempotency
//!   check used by consumers
//! - [`PgUnitOfWork`]: a `sqlx` transaction paired with a
//!   [`UnitOfWork`](fleet_sync_core::unit_of_work::UnitOfWork), so that cache
//!   broadcasts and lease releases registered during a business operation
//!   run when the database transaction actually ends
//!
//! # Example
//!
//! ```ignore
//! use fleet_sync_postgres::{PgUnitOfWork, PostgresOutboxRepository};
//! use fleet_sync_core::outbox::NewOutboxRecord;
//!
//! async fn example(pool: sqlx::PgPool) -> Result<(), Box<dyn std::error::Error>> {
//!     let mut work = PgUnitOfWork::begin(&pool).await?;
//!     sqlx::query("UPDATE orders SET state = 'created' WHERE id = 'O1'")
//!         .execute(work.connection())
//!         .await?;
//!     work.stage(NewOutboxRecord::new("O1", "OrderCreated", &serde_json::json!({}))?)
//!         .await?;
//!     work.commit().await?;
//!     Ok(())
//! }
//! ```

use fleet_sync_core::outbox::OutboxError;
use fleet_sync_runtime::PostgresConfig;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

pub mod outbox;
pub mod schema;
pub mod unit_of_work;

pub use outbox::{PgClaim, PostgresOutboxRepository};
pub use schema::migrate;
pub use unit_of_work::{PgUnitOfWork, PgUnitOfWorkError};

/// Open a connection pool sized by `config`.
///
/// # Errors
///
/// Returns [`OutboxError::Database`] if no URL is configured or the first
/// connection fails.
pub async fn connect(config: &PostgresConfig) -> Result<PgPool, OutboxError> {
    let url = config
        .url
        .as_deref()
        .ok_or_else(|| OutboxError::Database("DATABASE_URL is not set".to_string()))?;

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .connect(url)
        .await
        .map_err(|e| OutboxError::Database(format!("Failed to connect: {e}")))?;

    tracing::info!(max_connections = config.max_connections, "Connected to PostgreSQL");
    Ok(pool)
}
