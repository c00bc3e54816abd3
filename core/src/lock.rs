//! Distributed mutual exclusion over named resources.
//!
//! A [`LockService`] hands out time-bounded exclusive leases on string keys
//! such as `"stock-42"`. A lease is held until it is released by its owner or
//! until its lease time elapses, whichever comes first, so a crashed holder
//! blocks others for at most one lease period.
//!
//! Ownership is proven by an opaque [`LockOwner`] token minted per
//! acquisition: releasing or renewing with a handle whose token no longer
//! matches the stored one is a no-op.

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Build a lease key in the `"<resource-type>-<resource-id>"` format.
#[must_use]
pub fn lease_key(resource_type: &str, resource_id: impl fmt::Display) -> String {
    format!("{resource_type}-{resource_id}")
}

/// Errors from lock acquisition or release.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LockError {
    /// The lease could not be obtained within the wait time.
    #[error("Lock '{key}' is busy (gave up after {waited:?})")]
    Busy {
        /// The contended key
        key: String,
        /// How long the caller waited
        waited: Duration,
    },

    /// The lock backend could not be reached or rejected the command.
    #[error("Lock service unavailable: {0}")]
    Unavailable(String),
}

impl LockError {
    /// Whether this is a [`LockError::Busy`] timeout.
    #[must_use]
    pub const fn is_busy(&self) -> bool {
        matches!(self, Self::Busy { .. })
    }
}

/// Identity of a lease holder.
///
/// Formatted as `"<host>:<pid>:<uuid>"` so that a stored owner can be traced
/// back to a process when debugging a stuck lease.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LockOwner(String);

impl LockOwner {
    /// Mint a fresh, globally unique owner token.
    #[must_use]
    pub fn generate() -> Self {
        let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
        Self(format!("{host}:{}:{}", std::process::id(), Uuid::new_v4()))
    }

    /// Wrap an existing token.
    #[must_use]
    pub const fn new(token: String) -> Self {
        Self(token)
    }

    /// The raw token.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LockOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Proof of a successful acquisition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHandle {
    key: String,
    owner: LockOwner,
    lease_expiry: DateTime<Utc>,
}

impl LockHandle {
    /// Create a handle. Called by [`LockService`] implementations.
    #[must_use]
    pub const fn new(key: String, owner: LockOwner, lease_expiry: DateTime<Utc>) -> Self {
        Self {
            key,
            owner,
            lease_expiry,
        }
    }

    /// The locked key.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The owner token.
    #[must_use]
    pub const fn owner(&self) -> &LockOwner {
        &self.owner
    }

    /// When the lease lapses unless renewed.
    #[must_use]
    pub const fn lease_expiry(&self) -> DateTime<Utc> {
        self.lease_expiry
    }

    /// Whether the lease has lapsed at `now`.
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.lease_expiry
    }

    /// Copy of this handle with a new expiry, after a successful renewal.
    #[must_use]
    pub fn renewed(&self, lease_expiry: DateTime<Utc>) -> Self {
        Self {
            key: self.key.clone(),
            owner: self.owner.clone(),
            lease_expiry,
        }
    }
}

/// Fleet-wide lease provider.
///
/// Acquisition blocks up to `wait_time` and never retries on its own after
/// that: a timeout is reported as [`LockError::Busy`], retry policy belongs to
/// the caller.
pub trait LockService: Send + Sync {
    /// Obtain an exclusive lease on `key`, waiting up to `wait_time`.
    ///
    /// # Errors
    ///
    /// - [`LockError::Busy`] if the lease is still held by someone else when
    ///   `wait_time` elapses
    /// - [`LockError::Unavailable`] if the backend fails
    fn acquire<'a>(
        &'a self,
        key: &'a str,
        wait_time: Duration,
        lease_time: Duration,
    ) -> BoxFuture<'a, Result<LockHandle, LockError>>;

    /// Release the lease if `handle` still owns it.
    ///
    /// Returns `false` (and changes nothing) when the lease already expired
    /// or is held by a different owner. Releasing twice is safe.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Unavailable`] if the backend fails.
    fn release<'a>(&'a self, handle: &'a LockHandle) -> BoxFuture<'a, Result<bool, LockError>>;

    /// Extend the lease held by `handle` to `lease_time` from now.
    ///
    /// Returns `false` if `handle` no longer owns the lease.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Unavailable`] if the backend fails.
    fn renew<'a>(
        &'a self,
        handle: &'a LockHandle,
        lease_time: Duration,
    ) -> BoxFuture<'a, Result<bool, LockError>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    #[test]
    fn lease_keys_follow_type_dash_id() {
        assert_eq!(lease_key("stock", 42), "stock-42");
        assert_eq!(lease_key("order", "O1"), "order-O1");
    }

    #[test]
    fn owners_are_unique() {
        let a = LockOwner::generate();
        let b = LockOwner::generate();
        assert_ne!(a, b);
        assert!(a.as_str().contains(&std::process::id().to_string()));
    }

    #[test]
    fn handle_expiry() {
        let now = Utc::now();
        let handle = LockHandle::new(
            "stock-1".to_string(),
            LockOwner::generate(),
            now + TimeDelta::seconds(5),
        );
        assert!(!handle.is_expired_at(now));
        assert!(handle.is_expired_at(now + TimeDelta::seconds(5)));

        let renewed = handle.renewed(now + TimeDelta::seconds(30));
        assert_eq!(renewed.owner(), handle.owner());
        assert!(!renewed.is_expired_at(now + TimeDelta::seconds(10)));
    }
}
