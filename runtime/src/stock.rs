//! Lock-guarded stock decrement.
//!
//! [`StockService::decrease`] is the canonical write path built from the
//! other pieces:
//!
//! ```text
//! Idle -> LockAcquired -> Validated -> Persisted -> LockReleased
//!   |          |             |
//!   |          |             +-- quantity and StockDecreased saved together,
//!   |          |                 stock:{productId} written through on commit
//!   |          +-- requested > available: Insufficient, nothing persisted
//!   +-- lease not obtained in time: LockBusy, nothing read
//! ```
//!
//! The lease on `stock-{productId}` is held until the unit of work completes
//! (or until the operation returns, without one), so at most one decrement
//! per product is past validation at any instant across the fleet.

use crate::cache::{CacheCoordinator, CacheSpec, CachedCallError};
use crate::lock::{LockSpec, LockedCallError, Locker};
use fleet_sync_core::key::{KeyContext, KeyError};
use fleet_sync_core::lock::LockError;
use fleet_sync_core::outbox::{NewOutboxRecord, OutboxError};
use fleet_sync_core::unit_of_work::UnitOfWork;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Event type staged for every successful decrement.
pub const STOCK_DECREASED: &str = "StockDecreased";

/// Error from the stock persistence collaborator.
#[derive(Error, Debug)]
pub enum RepositoryError {
    /// The quantity store failed.
    #[error("Stock repository error: {0}")]
    Store(String),

    /// The event could not be staged next to the quantity.
    #[error(transparent)]
    Outbox(#[from] OutboxError),
}

/// Persistence of stock quantities.
pub trait StockRepository: Send + Sync {
    /// Current quantity of `product_id`, `None` if the product is unknown.
    ///
    /// # Errors
    ///
    /// Returns [`RepositoryError`] if the store cannot be read.
    fn quantity(&self, product_id: i64) -> BoxFuture<'_, Result<Option<i64>, RepositoryError>>;

    /// Overwrite the quantity of `product_id` and stage `event` in the
    /// outbox, both in the local transaction of `uow`.
    ///
    /// Neither write may become visible before `uow` commits, and neither
    /// may survive its rollback. Without an active `uow` both are applied
    /// at once.
    ///
    /// # Errors
    ///
    /// Returns [`RepositoryError`] if either write cannot be made. Nothing
    /// is applied in that case.
    fn save_decrement<'a>(
        &'a self,
        product_id: i64,
        quantity: i64,
        event: NewOutboxRecord,
        uow: &'a UnitOfWork,
    ) -> BoxFuture<'a, Result<(), RepositoryError>>;
}

/// Errors from [`StockService`].
#[derive(Error, Debug)]
pub enum StockError {
    /// Another decrement held the product's lease for the whole wait time.
    #[error("Stock of product is locked: '{key}' busy after {waited:?}")]
    LockBusy {
        /// Lease key
        key: String,
        /// Time spent waiting
        waited: Duration,
    },

    /// Not enough stock; nothing was persisted.
    #[error("Insufficient stock: requested {requested}, available {available}")]
    Insufficient {
        /// Requested amount
        requested: i64,
        /// Quantity on hand
        available: i64,
    },

    /// Unknown product.
    #[error("Product {0} not found")]
    NotFound(i64),

    /// Amount was zero or negative.
    #[error("Invalid decrement amount: {0}")]
    InvalidAmount(i64),

    /// Lock backend failure.
    #[error(transparent)]
    Lock(#[from] LockError),

    /// Persistence failure.
    #[error(transparent)]
    Repository(RepositoryError),

    /// The outbox event could not be staged.
    #[error(transparent)]
    Outbox(#[from] OutboxError),

    /// A lock or cache key could not be built.
    #[error(transparent)]
    InvalidKey(#[from] KeyError),
}

impl From<RepositoryError> for StockError {
    fn from(error: RepositoryError) -> Self {
        match error {
            RepositoryError::Outbox(e) => Self::Outbox(e),
            store @ RepositoryError::Store(_) => Self::Repository(store),
        }
    }
}

impl From<CachedCallError<StockError>> for StockError {
    fn from(error: CachedCallError<StockError>) -> Self {
        match error {
            CachedCallError::InvalidKey(e) => Self::InvalidKey(e),
            CachedCallError::Operation(e) => e,
        }
    }
}

impl<E: Into<StockError>> From<LockedCallError<E>> for StockError {
    fn from(error: LockedCallError<E>) -> Self {
        match error {
            LockedCallError::Busy { key, waited } => Self::LockBusy { key, waited },
            LockedCallError::InvalidKey(e) => Self::InvalidKey(e),
            LockedCallError::Backend(e) => Self::Lock(e),
            LockedCallError::Operation(e) => e.into(),
        }
    }
}

/// Payload of [`STOCK_DECREASED`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StockDecreased {
    /// Product whose stock changed
    pub product_id: i64,
    /// Amount taken
    pub amount: i64,
    /// Quantity left
    pub quantity: i64,
}

/// Stock operations over a lock service, the cache and a repository that
/// stages its events in the outbox.
#[derive(Clone)]
pub struct StockService {
    locker: Locker,
    cache: CacheCoordinator,
    repository: Arc<dyn StockRepository>,
    lock_spec: LockSpec,
    cache_spec: CacheSpec,
}

impl StockService {
    /// Create the service.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError`] if the built-in key templates fail to parse.
    pub fn new(
        locker: Locker,
        cache: CacheCoordinator,
        repository: Arc<dyn StockRepository>,
    ) -> Result<Self, KeyError> {
        Ok(Self {
            locker,
            cache,
            repository,
            lock_spec: LockSpec::parse("stock-{productId}")?,
            cache_spec: CacheSpec::parse("stock:", "{productId}")?,
        })
    }

    /// Take `amount` units of `product_id` and return the quantity left.
    ///
    /// The new quantity and a [`StockDecreased`] record are saved in the
    /// transaction of `uow`. The cache entry is written and broadcast on
    /// commit and the lease is released when `uow` completes.
    ///
    /// # Errors
    ///
    /// - [`StockError::InvalidAmount`] for `amount <= 0`
    /// - [`StockError::LockBusy`] if the lease was not obtained in time
    /// - [`StockError::NotFound`] for an unknown product
    /// - [`StockError::Insufficient`] if less than `amount` is available
    /// - [`StockError::Repository`] or [`StockError::Outbox`] on storage failures
    #[tracing::instrument(skip(self, uow), name = "stock_decrease", fields(unit_of_work = uow.id()))]
    pub async fn decrease(
        &self,
        product_id: i64,
        amount: i64,
        uow: &UnitOfWork,
    ) -> Result<i64, StockError> {
        if amount <= 0 {
            return Err(StockError::InvalidAmount(amount));
        }

        let ctx = KeyContext::new().with_arg("productId", product_id);
        let quantity = self
            .locker
            .with_lock_spec(&self.lock_spec, &ctx, uow, || async {
                self.cache
                    .write(&self.cache_spec, &ctx, uow, || {
                        self.decrease_locked(product_id, amount, uow)
                    })
                    .await
                    .map_err(StockError::from)
            })
            .await?;

        tracing::info!(product_id, amount, quantity, "Stock decreased");
        Ok(quantity)
    }

    /// Current quantity of `product_id`, served cache-aside.
    ///
    /// # Errors
    ///
    /// - [`StockError::NotFound`] for an unknown product
    /// - [`StockError::Repository`] if the store cannot be read on a miss
    pub async fn quantity(&self, product_id: i64) -> Result<i64, StockError> {
        let ctx = KeyContext::new().with_arg("productId", product_id);
        let quantity = self
            .cache
            .read(&self.cache_spec, &ctx, || self.load(product_id))
            .await?;
        Ok(quantity)
    }

    async fn load(&self, product_id: i64) -> Result<i64, StockError> {
        self.repository
            .quantity(product_id)
            .await?
            .ok_or(StockError::NotFound(product_id))
    }

    async fn decrease_locked(
        &self,
        product_id: i64,
        amount: i64,
        uow: &UnitOfWork,
    ) -> Result<i64, StockError> {
        let available = self.load(product_id).await?;

        if available < amount {
            tracing::debug!(product_id, amount, available, "Insufficient stock");
            return Err(StockError::Insufficient {
                requested: amount,
                available,
            });
        }

        let quantity = available - amount;
        let event = StockDecreased {
            product_id,
            amount,
            quantity,
        };
        let record = NewOutboxRecord::new(product_id.to_string(), STOCK_DECREASED, &event)?;
        self.repository
            .save_decrement(product_id, quantity, record, uow)
            .await?;

        Ok(quantity)
    }
}
