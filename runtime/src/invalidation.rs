//! Background listener applying fleet-wide invalidations to this process.
//!
//! Every process runs one listener for its lifetime. It subscribes to the
//! invalidation channel, parses each payload and hands it to
//! [`CacheCoordinator::apply_invalidation`]. Malformed payloads, including
//! ones that cannot be decoded as text, are logged and dropped. A lost
//! subscription is re-established with exponential backoff, so the listener
//! only stops on shutdown. Every new subscription resyncs the coordinator,
//! because whatever was broadcast in between is gone.
//!
//! # Example
//!
//! ```ignore
//! let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
//! let listener = InvalidationListener::spawn(coordinator.clone(), bus, shutdown_rx);
//!
//! // On shutdown:
//! shutdown_tx.send(true).ok();
//! listener.await.ok();
//! ```

use crate::cache::CacheCoordinator;
use crate::retry::{Backoff, RetryPolicy};
use fleet_sync_core::cache::{CacheError, InvalidationBus, InvalidationMessage};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Spawns and runs the invalidation listener task.
pub struct InvalidationListener {
    coordinator: CacheCoordinator,
    bus: Arc<dyn InvalidationBus>,
    backoff: Backoff,
    shutdown: watch::Receiver<bool>,
}

impl InvalidationListener {
    /// Spawn the listener, with a reconnect policy taken from the
    /// coordinator's configuration.
    #[must_use]
    pub fn spawn(
        coordinator: CacheCoordinator,
        bus: Arc<dyn InvalidationBus>,
        shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let config = coordinator.config();
        let policy = RetryPolicy::builder()
            .initial_delay(Duration::from_millis(config.resubscribe_initial_ms))
            .max_delay(Duration::from_millis(config.resubscribe_max_ms))
            .build();
        Self::spawn_with_policy(coordinator, bus, shutdown, policy)
    }

    /// Spawn the listener with an explicit reconnect policy.
    #[must_use]
    pub fn spawn_with_policy(
        coordinator: CacheCoordinator,
        bus: Arc<dyn InvalidationBus>,
        shutdown: watch::Receiver<bool>,
        policy: RetryPolicy,
    ) -> JoinHandle<()> {
        let listener = Self {
            coordinator,
            bus,
            backoff: Backoff::new(policy),
            shutdown,
        };
        tokio::spawn(listener.run())
    }

    async fn run(mut self) {
        tracing::info!("Invalidation listener started");

        while !self.is_shutdown() {
            let subscribed = tokio::select! {
                subscribed = self.bus.subscribe() => subscribed,
                () = wait_for_shutdown(&mut self.shutdown) => break,
            };

            match subscribed {
                Ok(stream) => {
                    self.backoff.reset();
                    tracing::info!("Subscribed to invalidation channel");
                    self.coordinator.resync();
                    if self.consume(stream).await.is_break() {
                        break;
                    }
                },
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to subscribe to invalidation channel");
                },
            }

            let delay = self.backoff.next_delay();
            tracing::info!(
                attempt = self.backoff.attempts(),
                delay_ms = delay.as_millis(),
                "Re-subscribing to invalidation channel"
            );
            tokio::select! {
                () = tokio::time::sleep(delay) => {},
                () = wait_for_shutdown(&mut self.shutdown) => break,
            }
        }

        tracing::info!("Invalidation listener stopped");
    }

    /// Drain one subscription. Breaks on shutdown, continues when the
    /// subscription is lost.
    async fn consume(
        &mut self,
        mut stream: fleet_sync_core::cache::PayloadStream,
    ) -> std::ops::ControlFlow<()> {
        loop {
            tokio::select! {
                item = stream.next() => match item {
                    Some(Ok(payload)) => self.handle(&payload).await,
                    Some(Err(CacheError::Serialization(reason))) => {
                        tracing::warn!(reason = %reason, "Dropping undecodable invalidation message");
                    },
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "Invalidation subscription failed");
                        return std::ops::ControlFlow::Continue(());
                    },
                    None => {
                        tracing::warn!("Invalidation subscription ended");
                        return std::ops::ControlFlow::Continue(());
                    },
                },
                () = wait_for_shutdown(&mut self.shutdown) => {
                    return std::ops::ControlFlow::Break(());
                },
            }
        }
    }

    async fn handle(&self, payload: &str) {
        match payload.parse::<InvalidationMessage>() {
            Ok(message) => {
                self.coordinator.apply_invalidation(&message).await;
            },
            Err(e) => {
                tracing::warn!(error = %e, "Dropping malformed invalidation message");
            },
        }
    }

    fn is_shutdown(&self) -> bool {
        *self.shutdown.borrow()
    }
}

/// Resolves once the flag is `true` or its sender is gone.
async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    if shutdown.wait_for(|stop| *stop).await.is_err() {
        tracing::debug!("Shutdown sender dropped, stopping");
    }
}
