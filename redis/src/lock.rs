//! Lease locks on Redis.
//!
//! A lease is a plain string key holding the owner token, written with
//! `SET key owner NX PX lease`. Redis expires it on its own if the holder
//! dies. Release and renewal compare the stored owner first, inside a Lua
//! script, so a holder whose lease already lapsed can never remove or extend
//! somebody else's.

use chrono::{DateTime, Utc};
use fleet_sync_core::lock::{LockError, LockHandle, LockOwner, LockService};
use futures::future::BoxFuture;
use rand::Rng;
use redis::aio::ConnectionManager;
use std::time::Duration;
use tokio::time::Instant;

/// Delete the key only if it still holds our owner token.
const RELEASE_SCRIPT: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
else
    return 0
end
";

/// Reset the expiry only if the key still holds our owner token.
const RENEW_SCRIPT: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('PEXPIRE', KEYS[1], ARGV[2])
else
    return 0
end
";

fn unavailable(command: &str, error: &redis::RedisError) -> LockError {
    LockError::Unavailable(format!("Redis {command} failed: {error}"))
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX).max(1)
}

fn expiry_after(lease_time: Duration) -> DateTime<Utc> {
    let lease = chrono::Duration::from_std(lease_time).unwrap_or(chrono::Duration::MAX);
    Utc::now()
        .checked_add_signed(lease)
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Redis-backed [`LockService`].
///
/// Acquisition polls `SET NX` every `retry_interval`, jittered by up to half
/// an interval so that waiters on a hot key spread out, until the wait time
/// runs out.
#[derive(Clone)]
pub struct RedisLockService {
    conn: ConnectionManager,
    retry_interval: Duration,
}

impl RedisLockService {
    /// Connect to `url`.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Unavailable`] if Redis cannot be reached.
    pub async fn new(url: &str, retry_interval: Duration) -> Result<Self, LockError> {
        let (_, conn) = crate::connect(url)
            .await
            .map_err(|e| LockError::Unavailable(e.to_string()))?;
        Ok(Self::from_manager(conn, retry_interval))
    }

    /// Wrap an existing connection manager.
    #[must_use]
    pub const fn from_manager(conn: ConnectionManager, retry_interval: Duration) -> Self {
        Self {
            conn,
            retry_interval,
        }
    }

    async fn try_take(
        &self,
        key: &str,
        owner: &LockOwner,
        lease_time: Duration,
    ) -> Result<bool, LockError> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(owner.as_str())
            .arg("NX")
            .arg("PX")
            .arg(millis(lease_time))
            .query_async(&mut conn)
            .await
            .map_err(|e| unavailable("SET NX", &e))?;
        Ok(reply.is_some())
    }

    fn next_nap(&self, remaining: Duration) -> Duration {
        let base = u64::try_from(self.retry_interval.as_millis()).unwrap_or(u64::MAX);
        let jitter = rand::thread_rng().gen_range(0..=base / 2);
        Duration::from_millis(base.saturating_add(jitter)).min(remaining)
    }
}

/// `started + wait_time`, or a far-off instant when that overflows.
fn deadline_after(started: Instant, wait_time: Duration) -> Instant {
    started
        .checked_add(wait_time)
        .unwrap_or_else(|| started + FAR_FUTURE)
}

const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

impl LockService for RedisLockService {
    fn acquire<'a>(
        &'a self,
        key: &'a str,
        wait_time: Duration,
        lease_time: Duration,
    ) -> BoxFuture<'a, Result<LockHandle, LockError>> {
        Box::pin(async move {
            let owner = LockOwner::generate();
            let started = Instant::now();
            let deadline = deadline_after(started, wait_time);
            let mut attempts = 0_u32;

            loop {
                attempts += 1;
                let remaining = deadline.saturating_duration_since(Instant::now());
                let bound = remaining.max(self.retry_interval);
                // An unanswered SET NX that landed anyway expires with its lease.
                let taken = tokio::time::timeout(bound, self.try_take(key, &owner, lease_time))
                    .await
                    .unwrap_or_else(|_| {
                        tracing::warn!(key = %key, attempts, "SET NX did not answer in time");
                        Ok(false)
                    })?;
                if taken {
                    tracing::debug!(key = %key, owner = %owner, attempts, "Lease acquired");
                    return Ok(LockHandle::new(key.to_string(), owner, expiry_after(lease_time)));
                }

                let now = Instant::now();
                if now >= deadline {
                    tracing::debug!(key = %key, attempts, "Lease still held, giving up");
                    return Err(LockError::Busy {
                        key: key.to_string(),
                        waited: now - started,
                    });
                }

                tokio::time::sleep(self.next_nap(deadline - now)).await;
            }
        })
    }

    fn release<'a>(&'a self, handle: &'a LockHandle) -> BoxFuture<'a, Result<bool, LockError>> {
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let deleted: i64 = redis::Script::new(RELEASE_SCRIPT)
                .key(handle.key())
                .arg(handle.owner().as_str())
                .invoke_async(&mut conn)
                .await
                .map_err(|e| unavailable("release script", &e))?;

            if deleted == 0 {
                tracing::warn!(
                    key = %handle.key(),
                    owner = %handle.owner(),
                    "Lease was no longer ours at release"
                );
            }
            Ok(deleted == 1)
        })
    }

    fn renew<'a>(
        &'a self,
        handle: &'a LockHandle,
        lease_time: Duration,
    ) -> BoxFuture<'a, Result<bool, LockError>> {
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let renewed: i64 = redis::Script::new(RENEW_SCRIPT)
                .key(handle.key())
                .arg(handle.owner().as_str())
                .arg(millis(lease_time))
                .invoke_async(&mut conn)
                .await
                .map_err(|e| unavailable("renew script", &e))?;
            Ok(renewed == 1)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REDIS_URL: &str = "redis://127.0.0.1:6379";

    #[test]
    fn unbounded_wait_does_not_overflow_the_deadline() {
        let started = Instant::now();
        assert!(deadline_after(started, Duration::MAX) > started);
        assert_eq!(
            deadline_after(started, Duration::from_secs(1)),
            started + Duration::from_secs(1)
        );
    }

    #[allow(clippy::unwrap_used)]
    async fn service() -> RedisLockService {
        RedisLockService::new(REDIS_URL, Duration::from_millis(20))
            .await
            .unwrap()
    }

    #[tokio::test]
    #[ignore] // Requires Redis running
    #[allow(clippy::unwrap_used)]
    async fn second_acquirer_times_out_while_lease_is_held() {
        let locks = service().await;
        let key = format!("fleet-sync-test-{}", LockOwner::generate());

        let first = locks
            .acquire(&key, Duration::ZERO, Duration::from_secs(5))
            .await
            .unwrap();
        let second = locks
            .acquire(&key, Duration::from_millis(100), Duration::from_secs(5))
            .await;
        assert!(second.unwrap_err().is_busy());

        assert!(locks.release(&first).await.unwrap());
        let third = locks
            .acquire(&key, Duration::ZERO, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(locks.release(&third).await.unwrap());
    }

    #[tokio::test]
    #[ignore] // Requires Redis running
    #[allow(clippy::unwrap_used)]
    async fn expired_lease_cannot_be_released_by_its_old_holder() {
        let locks = service().await;
        let key = format!("fleet-sync-test-{}", LockOwner::generate());

        let stale = locks
            .acquire(&key, Duration::ZERO, Duration::from_millis(50))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;

        let fresh = locks
            .acquire(&key, Duration::ZERO, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(!locks.release(&stale).await.unwrap());
        assert!(!locks.renew(&stale, Duration::from_secs(5)).await.unwrap());

        assert!(locks.renew(&fresh, Duration::from_secs(5)).await.unwrap());
        assert!(locks.release(&fresh).await.unwrap());
        assert!(!locks.release(&fresh).await.unwrap());
    }
}
