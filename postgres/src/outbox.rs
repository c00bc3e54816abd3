//! `PostgreSQL` outbox repository.

use chrono::{DateTime, Utc};
use fleet_sync_core::outbox::{
    NewOutboxRecord, OutboxClaim, OutboxError, OutboxRecord, OutboxRepository,
};
use futures::future::BoxFuture;
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, PgPool, Postgres, Row, Transaction};

fn database(context: &str, error: &sqlx::Error) -> OutboxError {
    OutboxError::Database(format!("{context}: {error}"))
}

fn row_to_record(row: &PgRow) -> Result<OutboxRecord, OutboxError> {
    let field = |e: sqlx::Error| database("Failed to read outbox row", &e);
    Ok(OutboxRecord {
        id: row.try_get("id").map_err(field)?,
        aggregate_id: row.try_get("aggregate_id").map_err(field)?,
        event_type: row.try_get("event_type").map_err(field)?,
        payload: row.try_get("payload").map_err(field)?,
        published: row.try_get("published").map_err(field)?,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at").map_err(field)?,
    })
}

/// Outbox stored in the `outbox` table.
///
/// See [`schema`](crate::schema) for the table definition.
///
/// # Example
///
/// ```no_run
/// use fleet_sync_postgres::PostgresOutboxRepository;
/// use fleet_sync_core::outbox::OutboxRepository;
///
/// # async fn example(pool: sqlx::PgPool) -> Result<(), Box<dyn std::error::Error>> {
/// let outbox = PostgresOutboxRepository::new(pool);
/// let delivered = outbox.exists_published("O1").await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct PostgresOutboxRepository {
    pool: PgPool,
}

impl PostgresOutboxRepository {
    /// Create a repository over `pool`.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The underlying pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Stage `record` on `conn`, typically inside the caller's transaction.
    ///
    /// The record becomes visible to publishers only when that transaction
    /// commits, and disappears with it on rollback.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::Database`] if the insert fails.
    pub async fn stage_in(
        conn: &mut PgConnection,
        record: NewOutboxRecord,
    ) -> Result<OutboxRecord, OutboxError> {
        let row = sqlx::query(
            r"
            INSERT INTO outbox (aggregate_id, event_type, payload, published)
            VALUES ($1, $2, $3, FALSE)
            RETURNING id, aggregate_id, event_type, payload, published, created_at
            ",
        )
        .bind(&record.aggregate_id)
        .bind(&record.event_type)
        .bind(&record.payload)
        .fetch_one(conn)
        .await
        .map_err(|e| database("Failed to stage outbox record", &e))?;

        let staged = row_to_record(&row)?;

        tracing::debug!(
            id = staged.id,
            aggregate_id = %staged.aggregate_id,
            event_type = %staged.event_type,
            "Outbox record staged"
        );
        metrics::counter!(
            "fleet_sync_outbox_staged_total",
            "event_type" => staged.event_type.clone()
        )
        .increment(1);

        Ok(staged)
    }

    /// Number of records not yet published.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::Database`] if the query fails.
    pub async fn backlog(&self) -> Result<i64, OutboxError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM outbox WHERE NOT published")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| database("Failed to count outbox backlog", &e))?;
        Ok(count)
    }
}

impl OutboxRepository for PostgresOutboxRepository {
    fn stage(&self, record: NewOutboxRecord) -> BoxFuture<'_, Result<OutboxRecord, OutboxError>> {
        Box::pin(async move {
            let mut conn = self
                .pool
                .acquire()
                .await
                .map_err(|e| database("Failed to acquire connection", &e))?;
            Self::stage_in(&mut conn, record).await
        })
    }

    fn claim_unpublished(
        &self,
        limit: usize,
    ) -> BoxFuture<'_, Result<Box<dyn OutboxClaim>, OutboxError>> {
        Box::pin(async move {
            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(|e| database("Failed to begin claim", &e))?;

            let rows = sqlx::query(
                r"
                SELECT id, aggregate_id, event_type, payload, published, created_at
                FROM outbox
                WHERE NOT published
                ORDER BY id ASC
                LIMIT $1
                FOR UPDATE SKIP LOCKED
                ",
            )
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&mut *tx)
            .await
            .map_err(|e| database("Failed to claim outbox records", &e))?;

            let records = rows.iter().map(row_to_record).collect::<Result<Vec<_>, _>>()?;

            Ok(Box::new(PgClaim { tx, records }) as Box<dyn OutboxClaim>)
        })
    }

    fn exists_published<'a>(
        &'a self,
        aggregate_id: &'a str,
    ) -> BoxFuture<'a, Result<bool, OutboxError>> {
        Box::pin(async move {
            let (exists,): (bool,) = sqlx::query_as(
                "SELECT EXISTS (SELECT 1 FROM outbox WHERE aggregate_id = $1 AND published)",
            )
            .bind(aggregate_id)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| database("Failed to check published records", &e))?;
            Ok(exists)
        })
    }
}

/// Claimed rows, row-locked by an open transaction.
///
/// Marks are written inside the transaction and become visible on
/// [`OutboxClaim::finish`]. Dropping the claim rolls everything back.
pub struct PgClaim {
    tx: Transaction<'static, Postgres>,
    records: Vec<OutboxRecord>,
}

impl OutboxClaim for PgClaim {
    fn records(&self) -> &[OutboxRecord] {
        &self.records
    }

    fn mark_published(&mut self, id: i64) -> BoxFuture<'_, Result<(), OutboxError>> {
        Box::pin(async move {
            if !self.records.iter().any(|record| record.id == id) {
                return Err(OutboxError::NotClaimed(id));
            }

            sqlx::query("UPDATE outbox SET published = TRUE WHERE id = $1")
                .bind(id)
                .execute(&mut *self.tx)
                .await
                .map_err(|e| database("Failed to mark outbox record", &e))?;

            if let Some(record) = self.records.iter_mut().find(|record| record.id == id) {
                record.published = true;
            }
            Ok(())
        })
    }

    fn finish(self: Box<Self>) -> BoxFuture<'static, Result<(), OutboxError>> {
        Box::pin(async move {
            let Self { tx, records } = *self;
            let marked = records.iter().filter(|record| record.published).count();
            tx.commit()
                .await
                .map_err(|e| database("Failed to commit outbox claim", &e))?;
            tracing::trace!(claimed = records.len(), marked, "Outbox claim committed");
            Ok(())
        })
    }
}
