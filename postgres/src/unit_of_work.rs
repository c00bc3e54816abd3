//! A database transaction paired with a [`UnitOfWork`].
//!
//! The business operation runs its SQL on [`PgUnitOfWork::connection`] and
//! hands [`PgUnitOfWork::unit_of_work`] to the cache coordinator and the
//! locker. Committing commits the database first and only then runs the
//! registered callbacks, so a cache broadcast or a lease release never
//! happens for a transaction that did not make it to disk.

use fleet_sync_core::outbox::{NewOutboxRecord, OutboxError, OutboxRecord};
use fleet_sync_core::unit_of_work::{UnitOfWork, UnitOfWorkError};
use sqlx::{PgConnection, PgPool, Postgres, Transaction};
use thiserror::Error;

use crate::outbox::PostgresOutboxRepository;

/// Errors from beginning or finishing a [`PgUnitOfWork`].
#[derive(Error, Debug)]
pub enum PgUnitOfWorkError {
    /// The database transaction could not be started or finished
    #[error("Transaction error: {0}")]
    Database(#[from] sqlx::Error),

    /// The unit of work had already completed
    #[error(transparent)]
    UnitOfWork(#[from] UnitOfWorkError),
}

/// A `sqlx` transaction and the [`UnitOfWork`] scoped to it.
///
/// Dropping it without finishing rolls back both.
pub struct PgUnitOfWork {
    tx: Transaction<'static, Postgres>,
    uow: UnitOfWork,
}

impl PgUnitOfWork {
    /// Begin a transaction on `pool`.
    ///
    /// # Errors
    ///
    /// Returns [`PgUnitOfWorkError::Database`] if no connection is available.
    pub async fn begin(pool: &PgPool) -> Result<Self, PgUnitOfWorkError> {
        let tx = pool.begin().await?;
        let uow = UnitOfWork::begin();
        tracing::trace!(unit_of_work = uow.id(), "Database transaction opened");
        Ok(Self { tx, uow })
    }

    /// The unit of work to pass to cache and lock wrappers.
    #[must_use]
    pub const fn unit_of_work(&self) -> &UnitOfWork {
        &self.uow
    }

    /// The transaction's connection, for the business SQL.
    pub fn connection(&mut self) -> &mut PgConnection {
        &mut self.tx
    }

    /// Stage an outbox record inside this transaction.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::Database`] if the insert fails.
    pub async fn stage(&mut self, record: NewOutboxRecord) -> Result<OutboxRecord, OutboxError> {
        PostgresOutboxRepository::stage_in(&mut self.tx, record).await
    }

    /// Commit the database transaction, then run commit and completion
    /// callbacks.
    ///
    /// If the database commit fails the unit of work is rolled back instead,
    /// so completion callbacks (lease releases) still run.
    ///
    /// # Errors
    ///
    /// Returns [`PgUnitOfWorkError::Database`] if the commit fails.
    pub async fn commit(self) -> Result<(), PgUnitOfWorkError> {
        let Self { tx, uow } = self;
        if let Err(e) = tx.commit().await {
            tracing::warn!(unit_of_work = uow.id(), error = %e, "Database commit failed");
            uow.rollback().await?;
            return Err(e.into());
        }
        uow.commit().await?;
        Ok(())
    }

    /// Roll back the database transaction and the unit of work.
    ///
    /// # Errors
    ///
    /// Returns [`PgUnitOfWorkError::Database`] if the rollback fails; the
    /// unit of work is rolled back regardless.
    pub async fn rollback(self) -> Result<(), PgUnitOfWorkError> {
        let Self { tx, uow } = self;
        let outcome = tx.rollback().await;
        uow.rollback().await?;
        outcome?;
        Ok(())
    }
}
