//! In-memory stock repository.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Test utilities document panics where critical

use crate::outbox::InMemoryOutboxRepository;
use fleet_sync_core::outbox::NewOutboxRecord;
use fleet_sync_core::unit_of_work::UnitOfWork;
use fleet_sync_runtime::stock::{RepositoryError, StockRepository};
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// `HashMap`-backed [`StockRepository`].
///
/// Reads and writes are separate calls, exactly like a plain
/// read-then-write against a database, so a missing lock shows up as lost
/// updates.
///
/// A decrement saved inside a unit of work is buffered together with its
/// event and applied to both maps on commit; a rollback discards both.
#[derive(Clone, Default)]
pub struct InMemoryStockRepository {
    quantities: Arc<Mutex<HashMap<i64, i64>>>,
    reads: Arc<AtomicUsize>,
    outbox: InMemoryOutboxRepository,
}

impl InMemoryStockRepository {
    /// Create an empty repository.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage decrement events in `outbox` instead of a private one.
    #[must_use]
    pub fn with_outbox(mut self, outbox: InMemoryOutboxRepository) -> Self {
        self.outbox = outbox;
        self
    }

    /// The outbox decrement events are staged in.
    #[must_use]
    pub fn outbox(&self) -> &InMemoryOutboxRepository {
        &self.outbox
    }

    /// Seed `product_id` with `quantity`.
    #[must_use]
    pub fn with_product(self, product_id: i64, quantity: i64) -> Self {
        self.set(product_id, quantity);
        self
    }

    /// Overwrite a quantity directly.
    pub fn set(&self, product_id: i64, quantity: i64) {
        self.quantities.lock().unwrap().insert(product_id, quantity);
    }

    /// Stored quantity of `product_id`.
    #[must_use]
    pub fn get(&self, product_id: i64) -> Option<i64> {
        self.quantities.lock().unwrap().get(&product_id).copied()
    }

    /// Number of trait reads served so far.
    #[must_use]
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

impl StockRepository for InMemoryStockRepository {
    fn quantity(&self, product_id: i64) -> BoxFuture<'_, Result<Option<i64>, RepositoryError>> {
        Box::pin(async move {
            self.reads.fetch_add(1, Ordering::SeqCst);
            let quantity = self.get(product_id);
            // Widen the read-modify-write window.
            tokio::task::yield_now().await;
            Ok(quantity)
        })
    }

    fn save_decrement<'a>(
        &'a self,
        product_id: i64,
        quantity: i64,
        event: NewOutboxRecord,
        uow: &'a UnitOfWork,
    ) -> BoxFuture<'a, Result<(), RepositoryError>> {
        Box::pin(async move {
            self.outbox.stage_in(event, uow).await?;

            let quantities = Arc::clone(&self.quantities);
            let write = move || async move {
                quantities.lock().unwrap().insert(product_id, quantity);
            };
            if let Err(write) = uow.on_commit(write) {
                write().await;
            }
            Ok(())
        })
    }
}
