//! Lock wrappers: run an operation while holding a fleet-wide lease.
//!
//! [`Locker`] acquires a lease from a [`LockService`], runs the wrapped
//! operation and releases the lease on every path:
//!
//! - **Immediate** release ([`Locker::with_lock`], [`Locker::with_lock_timed`]):
//!   right after the operation returns, whether it succeeded or failed
//! - **Scoped** release ([`Locker::with_scoped_lock`]): when the unit of work
//!   completes (commit or rollback), so no other process enters the critical
//!   section before the transaction's writes are visible. If the unit of work
//!   is not active the release is immediate.
//!
//! Which of the two applies is decided once, right after acquisition, by
//! registering the release on the unit of work. If the calling future is
//! dropped mid-operation, the lease is released from a spawned task.
//!
//! A timed-out acquisition is reported as [`LockedCallError::Busy`] and the
//! operation is never run. Retrying is the caller's decision. Acquisition is
//! bounded here as well, at the wait time plus [`ACQUIRE_GRACE`], so a
//! backend that stops answering cannot hold the caller past its wait time.

use crate::config::LockConfig;
use crate::metrics::LockMetrics;
use fleet_sync_core::key::{KeyContext, KeyError, KeyExpression};
use fleet_sync_core::lock::{LockError, LockHandle, LockService};
use fleet_sync_core::unit_of_work::{Completion, UnitOfWork};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

/// Slack on top of the wait time for the backend's final attempt to answer.
pub const ACQUIRE_GRACE: Duration = Duration::from_millis(250);

/// Error of a lock-wrapped call.
#[derive(Error, Debug)]
pub enum LockedCallError<E> {
    /// The lease was not obtained within the wait time; the operation did not run.
    #[error("Lock '{key}' is busy (gave up after {waited:?})")]
    Busy {
        /// The contended key
        key: String,
        /// How long the caller waited
        waited: Duration,
    },

    /// The lock key could not be resolved.
    #[error("Invalid lock key: {0}")]
    InvalidKey(KeyError),

    /// The lock backend failed; the operation did not run.
    #[error("Lock backend failed: {0}")]
    Backend(LockError),

    /// The wrapped operation failed (the lease has been released or handed
    /// to the unit of work).
    #[error("{0}")]
    Operation(E),
}

/// Lock settings for a call site: key expression plus optional overrides of
/// the default wait and lease times.
#[derive(Debug, Clone)]
pub struct LockSpec {
    key: KeyExpression,
    wait_time: Option<Duration>,
    lease_time: Option<Duration>,
}

impl LockSpec {
    /// Lock on `key` with the default times.
    #[must_use]
    pub const fn new(key: KeyExpression) -> Self {
        Self {
            key,
            wait_time: None,
            lease_time: None,
        }
    }

    /// Parse a key template such as `"stock-{productId}"`.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError`] if the template is malformed.
    pub fn parse(template: &str) -> Result<Self, KeyError> {
        Ok(Self::new(KeyExpression::parse(template)?))
    }

    /// Override the wait time.
    #[must_use]
    pub const fn with_wait_time(mut self, wait_time: Duration) -> Self {
        self.wait_time = Some(wait_time);
        self
    }

    /// Override the lease time.
    #[must_use]
    pub const fn with_lease_time(mut self, lease_time: Duration) -> Self {
        self.lease_time = Some(lease_time);
        self
    }
}

/// Releases the lease unless disarmed, also when dropped mid-operation.
struct ReleaseGuard {
    service: Arc<dyn LockService>,
    handle: Option<LockHandle>,
}

impl ReleaseGuard {
    async fn release(mut self) {
        if let Some(handle) = self.handle.take() {
            release_logged(self.service.as_ref(), &handle, None).await;
        }
    }

    fn disarm(&mut self) {
        self.handle = None;
    }
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        tracing::warn!(key = %handle.key(), "Locked call cancelled, releasing lease in background");

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let service = Arc::clone(&self.service);
                runtime.spawn(async move {
                    release_logged(service.as_ref(), &handle, None).await;
                });
            },
            Err(_) => {
                tracing::error!(
                    key = %handle.key(),
                    "No async runtime available, lease will expire on its own"
                );
            },
        }
    }
}

async fn release_logged(
    service: &dyn LockService,
    handle: &LockHandle,
    completion: Option<Completion>,
) {
    match service.release(handle).await {
        Ok(true) => {
            tracing::debug!(key = %handle.key(), completion = ?completion, "Lease released");
        },
        Ok(false) => {
            tracing::warn!(
                key = %handle.key(),
                owner = %handle.owner(),
                "Lease already expired or taken over before release"
            );
        },
        Err(e) => {
            tracing::warn!(
                key = %handle.key(),
                error = %e,
                "Lease release failed, it will expire on its own"
            );
        },
    }
}

/// Runs operations under fleet-wide leases.
#[derive(Clone)]
pub struct Locker {
    service: Arc<dyn LockService>,
    config: LockConfig,
}

impl Locker {
    /// Create a locker with default wait and lease times from `config`.
    #[must_use]
    pub fn new(service: Arc<dyn LockService>, config: LockConfig) -> Self {
        Self { service, config }
    }

    /// The underlying lock service.
    #[must_use]
    pub fn service(&self) -> &Arc<dyn LockService> {
        &self.service
    }

    /// Run `operation` under `key` with the default times, releasing right after.
    ///
    /// # Errors
    ///
    /// See [`LockedCallError`].
    pub async fn with_lock<T, E, F, Fut>(
        &self,
        key: &str,
        operation: F,
    ) -> Result<T, LockedCallError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.run(
            key,
            self.config.wait_time(),
            self.config.lease_time(),
            &UnitOfWork::none(),
            operation,
        )
        .await
    }

    /// Run `operation` under `key` with explicit times, releasing right after.
    ///
    /// # Errors
    ///
    /// See [`LockedCallError`].
    pub async fn with_lock_timed<T, E, F, Fut>(
        &self,
        key: &str,
        wait_time: Duration,
        lease_time: Duration,
        operation: F,
    ) -> Result<T, LockedCallError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.run(key, wait_time, lease_time, &UnitOfWork::none(), operation)
            .await
    }

    /// Run `operation` under `key`, releasing when `uow` completes (or right
    /// after, if `uow` is not active).
    ///
    /// # Errors
    ///
    /// See [`LockedCallError`].
    pub async fn with_scoped_lock<T, E, F, Fut>(
        &self,
        key: &str,
        uow: &UnitOfWork,
        operation: F,
    ) -> Result<T, LockedCallError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.run(
            key,
            self.config.wait_time(),
            self.config.lease_time(),
            uow,
            operation,
        )
        .await
    }

    /// Resolve `spec` against `ctx` and run `operation` scoped to `uow`.
    ///
    /// # Errors
    ///
    /// See [`LockedCallError`].
    pub async fn with_lock_spec<T, E, F, Fut>(
        &self,
        spec: &LockSpec,
        ctx: &KeyContext,
        uow: &UnitOfWork,
        operation: F,
    ) -> Result<T, LockedCallError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let key = spec.key.resolve(ctx).map_err(LockedCallError::InvalidKey)?;
        let wait_time = spec.wait_time.unwrap_or_else(|| self.config.wait_time());
        let lease_time = spec.lease_time.unwrap_or_else(|| self.config.lease_time());
        self.run(&key, wait_time, lease_time, uow, operation).await
    }

    async fn run<T, E, F, Fut>(
        &self,
        key: &str,
        wait_time: Duration,
        lease_time: Duration,
        uow: &UnitOfWork,
        operation: F,
    ) -> Result<T, LockedCallError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let started = Instant::now();
        let bound = wait_time.saturating_add(ACQUIRE_GRACE);
        let attempt = self.service.acquire(key, wait_time, lease_time);
        let acquired = tokio::time::timeout(bound, attempt)
            .await
            .unwrap_or_else(|_| {
                tracing::warn!(
                    key = %key,
                    bound_ms = bound.as_millis(),
                    "Lock backend did not answer in time"
                );
                Err(LockError::Busy {
                    key: key.to_string(),
                    waited: started.elapsed(),
                })
            });
        let handle = match acquired {
            Ok(handle) => {
                LockMetrics::record_acquisition("acquired", started.elapsed());
                handle
            },
            Err(LockError::Busy { key, waited }) => {
                LockMetrics::record_acquisition("busy", started.elapsed());
                tracing::debug!(key = %key, waited_ms = waited.as_millis(), "Lock busy");
                return Err(LockedCallError::Busy { key, waited });
            },
            Err(e) => {
                LockMetrics::record_acquisition("error", started.elapsed());
                tracing::warn!(key = %key, error = %e, "Lock acquisition failed");
                return Err(LockedCallError::Backend(e));
            },
        };
        tracing::debug!(key = %key, owner = %handle.owner(), "Lease acquired");

        let mut guard = ReleaseGuard {
            service: Arc::clone(&self.service),
            handle: Some(handle.clone()),
        };

        let service = Arc::clone(&self.service);
        let scoped = uow
            .on_completion(move |completion| async move {
                release_logged(service.as_ref(), &handle, Some(completion)).await;
            })
            .is_ok();
        if scoped {
            tracing::debug!(key = %key, unit_of_work = uow.id(), "Lease release deferred to completion");
            guard.disarm();
        }

        let outcome = operation().await;
        guard.release().await;
        outcome.map_err(LockedCallError::Operation)
    }
}
