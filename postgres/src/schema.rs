//! Outbox table definition.

use fleet_sync_core::outbox::OutboxError;
use sqlx::PgPool;

/// Statements creating the `outbox` table and its indexes. Idempotent.
pub const OUTBOX_SCHEMA: &[&str] = &[
    r"
    CREATE TABLE IF NOT EXISTS outbox (
        id BIGSERIAL PRIMARY KEY,
        aggregate_id TEXT NOT NULL,
        event_type TEXT NOT NULL,
        payload TEXT NOT NULL,
        published BOOLEAN NOT NULL DEFAULT FALSE,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    ",
    // Publisher scan
    "CREATE INDEX IF NOT EXISTS idx_outbox_unpublished ON outbox (id) WHERE NOT published",
    // Consumer idempotency check
    "CREATE INDEX IF NOT EXISTS idx_outbox_aggregate ON outbox (aggregate_id) WHERE published",
];

/// Create the outbox table if it does not exist.
///
/// # Errors
///
/// Returns [`OutboxError::Database`] if a statement fails.
pub async fn migrate(pool: &PgPool) -> Result<(), OutboxError> {
    for statement in OUTBOX_SCHEMA {
        sqlx::query(statement)
            .execute(pool)
            .await
            .map_err(|e| OutboxError::Database(format!("Outbox migration failed: {e}")))?;
    }
    Ok(())
}
