//! Contracts for the shared cache tier and the fleet-wide invalidation bus.
//!
//! Every process keeps a small process-local tier (tier-1, see the runtime
//! crate) in front of a shared key/value store (tier-2, [`SharedCache`]).
//! Whenever a process writes or deletes an entry it broadcasts an
//! [`InvalidationMessage`] over the [`InvalidationBus`] so every other process
//! evicts its tier-1 copy.
//!
//! ```text
//!   process A                         process B
//! ┌───────────┐                     ┌───────────┐
//! │  tier-1   │                     │  tier-1   │◄── evict on message
//! └─────┬─────┘                     └─────▲─────┘
//!       │ write                           │
//!       ▼                                 │
//! ┌──────────────────────────────────────────────┐
//! │ tier-2 (shared)   +   channel "cache-sync"   │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! # Wire format
//!
//! Messages travel as plain strings: `"<WRITE|DELETE> <fullKey>"`. Delivery
//! is at-least-once and handling is idempotent: invalidating an absent key is
//! a no-op.

use futures::Stream;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::pin::Pin;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Channel every process publishes to and subscribes on.
pub const INVALIDATION_CHANNEL: &str = "cache-sync";

/// Errors raised by the shared tier or the invalidation bus.
///
/// The coordinator never surfaces these to business callers: a failing cache
/// degrades to a miss (reads) or a no-op (writes and deletes).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// The backing store could not be reached or rejected the command.
    #[error("Cache store unavailable: {0}")]
    Unavailable(String),

    /// The operation did not complete within its timeout.
    #[error("Cache operation '{operation}' timed out after {timeout:?}")]
    Timeout {
        /// Name of the command (`get`, `set`, `delete`, `publish`, ...)
        operation: &'static str,
        /// The timeout that elapsed
        timeout: Duration,
    },

    /// A cached value could not be serialized or deserialized.
    #[error("Cache value serialization failed: {0}")]
    Serialization(String),
}

/// Kind of change an invalidation message announces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CacheOperation {
    /// The entry was (re)written.
    Write,
    /// The entry was removed.
    Delete,
}

impl CacheOperation {
    /// Wire tag of the operation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Write => "WRITE",
            Self::Delete => "DELETE",
        }
    }
}

impl fmt::Display for CacheOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A payload on the invalidation channel that could not be parsed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Malformed invalidation message '{payload}': {reason}")]
pub struct MalformedInvalidation {
    /// The raw payload as received
    pub payload: String,
    /// What was wrong with it
    pub reason: &'static str,
}

/// "This key changed" notification broadcast to every process.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InvalidationMessage {
    /// What happened to the entry
    pub operation: CacheOperation,
    /// Prefixed key as stored in both tiers
    pub full_key: String,
}

impl InvalidationMessage {
    /// Create a message.
    #[must_use]
    pub fn new(operation: CacheOperation, full_key: impl Into<String>) -> Self {
        Self {
            operation,
            full_key: full_key.into(),
        }
    }

    /// Announce a write of `full_key`.
    #[must_use]
    pub fn write(full_key: impl Into<String>) -> Self {
        Self::new(CacheOperation::Write, full_key)
    }

    /// Announce a delete of `full_key`.
    #[must_use]
    pub fn delete(full_key: impl Into<String>) -> Self {
        Self::new(CacheOperation::Delete, full_key)
    }
}

impl fmt::Display for InvalidationMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.operation, self.full_key)
    }
}

impl FromStr for InvalidationMessage {
    type Err = MalformedInvalidation;

    fn from_str(payload: &str) -> Result<Self, Self::Err> {
        let malformed = |reason| MalformedInvalidation {
            payload: payload.to_string(),
            reason,
        };

        let (tag, key) = payload
            .split_once(' ')
            .ok_or_else(|| malformed("expected '<OP> <key>'"))?;

        let operation = match tag {
            "WRITE" => CacheOperation::Write,
            "DELETE" => CacheOperation::Delete,
            _ => return Err(malformed("unknown operation tag")),
        };

        if key.trim().is_empty() {
            return Err(malformed("empty key"));
        }

        Ok(Self::new(operation, key))
    }
}

/// Stream of raw payloads received on the invalidation channel.
///
/// Payloads are handed over unparsed so that the listener decides what to do
/// with malformed ones.
pub type PayloadStream = Pin<Box<dyn Stream<Item = Result<String, CacheError>> + Send>>;

/// Shared, network-accessible key/value store (tier-2).
///
/// Values are JSON text. Implementations must be safe for concurrent use and
/// bound every call with a timeout.
///
/// # Dyn Compatibility
///
/// Methods return boxed futures so the store can be held as
/// `Arc<dyn SharedCache>` by the coordinator and by deferred callbacks.
pub trait SharedCache: Send + Sync {
    /// Fetch the value stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] if the store is unreachable or times out.
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<String>, CacheError>>;

    /// Store `value` under `key`, expiring after `ttl`.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] if the store is unreachable or times out.
    fn set<'a>(
        &'a self,
        key: &'a str,
        value: &'a str,
        ttl: Duration,
    ) -> BoxFuture<'a, Result<(), CacheError>>;

    /// Remove `key`. Removing an absent key succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] if the store is unreachable or times out.
    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<(), CacheError>>;
}

/// Publish/subscribe channel carrying [`InvalidationMessage`]s between processes.
pub trait InvalidationBus: Send + Sync {
    /// Broadcast `message` to every subscriber, this process included.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] if the message could not be handed to the channel.
    fn publish<'a>(&'a self, message: &'a InvalidationMessage) -> BoxFuture<'a, Result<(), CacheError>>;

    /// Open a subscription on [`INVALIDATION_CHANNEL`].
    ///
    /// The stream ends when the underlying connection is lost; callers
    /// re-subscribe.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] if the subscription cannot be established.
    fn subscribe(&self) -> BoxFuture<'_, Result<PayloadStream, CacheError>>;
}
