//! In-memory lease lock service.
//!
//! Leases are kept in a map keyed by lock key and expire on the Tokio clock,
//! so tests with `start_paused = true` can expire them deterministically.
//! Waiters are woken when a lease is released and otherwise re-check every
//! few milliseconds.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Test utilities document panics where critical

use chrono::Utc;
use fleet_sync_core::environment::{Clock, SystemClock};
use fleet_sync_core::lock::{LockError, LockHandle, LockOwner, LockService};
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

const RECHECK_INTERVAL: Duration = Duration::from_millis(5);

/// Stand-in for "never" when an instant would overflow the clock.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

fn later(start: Instant, span: Duration) -> Instant {
    start.checked_add(span).unwrap_or_else(|| start + FAR_FUTURE)
}

#[derive(Debug)]
struct Lease {
    owner: LockOwner,
    expires_at: Instant,
}

/// In-memory [`LockService`].
///
/// # Example
///
/// ```
/// use fleet_sync_testing::lock::InMemoryLockService;
/// use fleet_sync_core::lock::LockService;
/// use std::time::Duration;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let locks = InMemoryLockService::new();
/// let handle = locks.acquire("stock-1", Duration::ZERO, Duration::from_secs(5)).await?;
/// assert!(locks.is_held("stock-1"));
///
/// locks.release(&handle).await?;
/// assert!(!locks.is_held("stock-1"));
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct InMemoryLockService {
    leases: Arc<Mutex<HashMap<String, Lease>>>,
    released: Arc<Notify>,
    clock: Arc<dyn Clock>,
}

impl InMemoryLockService {
    /// Create a service stamping lease expiries with the system clock.
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create a service stamping lease expiries with `clock`.
    #[must_use]
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            leases: Arc::new(Mutex::new(HashMap::new())),
            released: Arc::new(Notify::new()),
            clock,
        }
    }

    /// Whether `key` is currently leased by anyone.
    #[must_use]
    pub fn is_held(&self, key: &str) -> bool {
        self.leases
            .lock()
            .unwrap()
            .get(key)
            .is_some_and(|lease| lease.expires_at > Instant::now())
    }

    /// Number of live leases.
    #[must_use]
    pub fn held_count(&self) -> usize {
        let now = Instant::now();
        self.leases
            .lock()
            .unwrap()
            .values()
            .filter(|lease| lease.expires_at > now)
            .count()
    }

    fn try_take(&self, key: &str, lease_time: Duration) -> Option<LockHandle> {
        let now = Instant::now();
        let mut leases = self.leases.lock().unwrap();
        if leases.get(key).is_some_and(|lease| lease.expires_at > now) {
            return None;
        }

        let owner = LockOwner::generate();
        leases.insert(
            key.to_string(),
            Lease {
                owner: owner.clone(),
                expires_at: later(now, lease_time),
            },
        );
        Some(LockHandle::new(key.to_string(), owner, self.expiry_stamp(lease_time)))
    }

    fn expiry_stamp(&self, lease_time: Duration) -> chrono::DateTime<Utc> {
        let lease = chrono::Duration::from_std(lease_time).unwrap_or(chrono::Duration::MAX);
        self.clock
            .now()
            .checked_add_signed(lease)
            .unwrap_or(chrono::DateTime::<Utc>::MAX_UTC)
    }
}

impl Default for InMemoryLockService {
    fn default() -> Self {
        Self::new()
    }
}

impl LockService for InMemoryLockService {
    fn acquire<'a>(
        &'a self,
        key: &'a str,
        wait_time: Duration,
        lease_time: Duration,
    ) -> BoxFuture<'a, Result<LockHandle, LockError>> {
        Box::pin(async move {
            let started = Instant::now();
            let deadline = later(started, wait_time);
            loop {
                if let Some(handle) = self.try_take(key, lease_time) {
                    return Ok(handle);
                }

                let now = Instant::now();
                if now >= deadline {
                    return Err(LockError::Busy {
                        key: key.to_string(),
                        waited: now - started,
                    });
                }

                let nap = RECHECK_INTERVAL.min(deadline - now);
                let _ = tokio::time::timeout(nap, self.released.notified()).await;
            }
        })
    }

    fn release<'a>(&'a self, handle: &'a LockHandle) -> BoxFuture<'a, Result<bool, LockError>> {
        Box::pin(async move {
            let mut leases = self.leases.lock().unwrap();
            let owned = leases
                .get(handle.key())
                .is_some_and(|lease| &lease.owner == handle.owner());
            if owned {
                leases.remove(handle.key());
                drop(leases);
                self.released.notify_waiters();
            }
            Ok(owned)
        })
    }

    fn renew<'a>(
        &'a self,
        handle: &'a LockHandle,
        lease_time: Duration,
    ) -> BoxFuture<'a, Result<bool, LockError>> {
        Box::pin(async move {
            let now = Instant::now();
            let mut leases = self.leases.lock().unwrap();
            match leases.get_mut(handle.key()) {
                Some(lease) if &lease.owner == handle.owner() && lease.expires_at > now => {
                    lease.expires_at = later(now, lease_time);
                    Ok(true)
                },
                _ => Ok(false),
            }
        })
    }
}
