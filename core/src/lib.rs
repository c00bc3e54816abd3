//! # Fleet Sync Core
//!
//! Core traits and types for keeping shared state coherent across a fleet of
//! cooperating processes.
//!
//! This crate holds the contracts only. Orchestration lives in
//! `fleet-sync-runtime`, backends in `fleet-sync-redis`, `fleet-sync-postgres`
//! and `fleet-sync-redpanda`, and in-memory implementations for tests in
//! `fleet-sync-testing`.
//!
//! ## Core Concepts
//!
//! - **Key**: placeholder templates (`"stock-{productId}"`) or closures that
//!   turn call arguments and results into cache and lock keys
//! - **Shared cache**: the tier-2 key/value store plus the invalidation bus
//!   that tells every process to evict its tier-1 copy
//! - **Lock**: time-bounded exclusive leases on named resources
//! - **Unit of work**: an explicit transaction scope that defers cache
//!   population and lease release until the transaction completes
//! - **Outbox**: events staged in the business transaction and published to
//!   the broker later, at least once
//!
//! ## Architecture Principles
//!
//! - The cache is never the system of record: its failures degrade to misses
//! - Nothing observable happens before the transaction that caused it commits
//! - Every blocking call carries a timeout
//! - Dependencies are injected as trait objects
//!
//! ## Example
//!
//! ```
//! use fleet_sync_core::key::{KeyContext, KeyExpression};
//!
//! let key = KeyExpression::parse("stock-{productId}").unwrap();
//! let ctx = KeyContext::new().with_arg("productId", 42);
//! assert_eq!(key.resolve(&ctx).unwrap(), "stock-42");
//! ```

// Re-export commonly used types
pub use chrono::{DateTime, Utc};
pub use serde::{Deserialize, Serialize};

pub mod broker;
pub mod cache;
pub mod key;
pub mod lock;
pub mod outbox;
pub mod unit_of_work;

pub use broker::{BrokerAck, BrokerError, EventEnvelope, MessageBroker};
pub use cache::{
    CacheError, CacheOperation, INVALIDATION_CHANNEL, InvalidationBus, InvalidationMessage,
    SharedCache,
};
pub use key::{KeyContext, KeyError, KeyExpression, KeyTemplate};
pub use lock::{LockError, LockHandle, LockOwner, LockService};
pub use outbox::{NewOutboxRecord, OutboxClaim, OutboxError, OutboxRecord, OutboxRepository};
pub use unit_of_work::{Completion, UnitOfWork, UnitOfWorkError};

/// Injected dependencies shared by runtime components.
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    ///
    /// Lease expiries and outbox timestamps are taken from a `Clock` so tests
    /// can pin them.
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Wall-clock time.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}
