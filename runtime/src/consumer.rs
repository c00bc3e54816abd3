//! Idempotent event consumption.
//!
//! Delivery from the outbox is at-least-once, so a consumer may see the same
//! aggregate's event twice. [`IdempotentConsumer`] checks the consuming
//! service's own outbox before applying an effect: if a record for the
//! aggregate has already been published, the event was handled before and is
//! discarded.
//!
//! The `apply` closure is expected to stage its own outbox record for the
//! aggregate (e.g. `PaymentCompleted` for an `OrderCreated`), which is what
//! makes the aggregate count as handled once the publisher has sent it.

use fleet_sync_core::outbox::{OutboxError, OutboxRepository};
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;

/// Result of handling one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Handled<T> {
    /// The effect was applied.
    Applied(T),
    /// The aggregate was already handled; nothing was applied.
    Duplicate,
}

impl<T> Handled<T> {
    /// Whether the effect was applied.
    #[must_use]
    pub const fn is_applied(&self) -> bool {
        matches!(self, Self::Applied(_))
    }
}

/// Error from [`IdempotentConsumer::handle`].
#[derive(Error, Debug)]
pub enum ConsumerError<E> {
    /// The "already handled" lookup failed; the effect was not applied.
    #[error("Idempotency lookup failed: {0}")]
    Lookup(OutboxError),

    /// The effect failed.
    #[error("{0}")]
    Apply(E),
}

/// Applies each aggregate's effect at most once per published outcome.
#[derive(Clone)]
pub struct IdempotentConsumer {
    outbox: Arc<dyn OutboxRepository>,
}

impl IdempotentConsumer {
    /// Create a consumer checking `outbox` for already-handled aggregates.
    #[must_use]
    pub fn new(outbox: Arc<dyn OutboxRepository>) -> Self {
        Self { outbox }
    }

    /// Apply `apply` unless `aggregate_id` was already handled.
    ///
    /// # Errors
    ///
    /// - [`ConsumerError::Lookup`] if the outbox cannot be queried
    /// - [`ConsumerError::Apply`] if the effect fails
    pub async fn handle<T, E, F, Fut>(
        &self,
        aggregate_id: &str,
        apply: F,
    ) -> Result<Handled<T>, ConsumerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let handled = self
            .outbox
            .exists_published(aggregate_id)
            .await
            .map_err(ConsumerError::Lookup)?;

        if handled {
            tracing::info!(aggregate_id = %aggregate_id, "Duplicate event discarded");
            return Ok(Handled::Duplicate);
        }

        let value = apply().await.map_err(ConsumerError::Apply)?;
        tracing::debug!(aggregate_id = %aggregate_id, "Event applied");
        Ok(Handled::Applied(value))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Test code can use unwrap
mod tests {
    use super::*;
    use fleet_sync_core::outbox::NewOutboxRecord;
    use fleet_sync_testing::outbox::InMemoryOutboxRepository;
    use serde_json::json;

    #[tokio::test]
    async fn applies_then_discards_once_published() {
        let outbox = Arc::new(InMemoryOutboxRepository::new());
        let consumer = IdempotentConsumer::new(Arc::clone(&outbox) as Arc<dyn OutboxRepository>);

        let first = consumer
            .handle("O1", || async {
                let record = outbox
                    .stage(NewOutboxRecord::new("O1", "PaymentCompleted", &json!({"orderId": "O1"}))?)
                    .await?;
                Ok::<_, OutboxError>(record.id)
            })
            .await
            .unwrap();
        assert!(first.is_applied());
        if let Handled::Applied(id) = first {
            outbox.mark_published(id);
        }

        let second = consumer
            .handle("O1", || async { Ok::<_, OutboxError>(0) })
            .await
            .unwrap();
        assert_eq!(second, Handled::Duplicate);
    }

    #[tokio::test]
    async fn apply_errors_propagate() {
        let outbox = Arc::new(InMemoryOutboxRepository::new());
        let consumer = IdempotentConsumer::new(outbox);

        let err = consumer
            .handle("O2", || async { Err::<(), _>("declined") })
            .await
            .unwrap_err();
        assert!(matches!(err, ConsumerError::Apply("declined")));
    }
}
