//! # Fleet Sync Runtime
//!
//! Orchestration on top of the `fleet-sync-core` contracts.
//!
//! This crate holds the logic every write path of a service goes through:
//! the two-tier cache, the lock wrappers, and the outbox publisher. Backends
//! (Redis, `PostgreSQL`, Redpanda) live in their own crates and are plugged in
//! as trait objects.
//!
//! ## Core Components
//!
//! - **[`CacheCoordinator`]**: cache-aside `READ`, deferred `WRITE` and
//!   immediate `DELETE` policies over a process-local tier and a shared tier
//! - **[`InvalidationListener`]**: applies fleet-wide invalidations for the
//!   lifetime of the process
//! - **[`Locker`]**: runs an operation under a lease, releasing it right
//!   away or when the unit of work completes
//! - **[`OutboxPublisher`]**: drains staged events to the broker on an interval
//! - **[`IdempotentConsumer`]**: discards events of already-handled aggregates
//! - **[`StockService`]**: the lock-guarded decrement built from all of the above
//!
//! ## Example
//!
//! ```ignore
//! use fleet_sync_runtime::{CacheCoordinator, FleetConfig, InvalidationListener, Locker, StockService};
//!
//! let config = FleetConfig::from_env()?;
//! let cache = CacheCoordinator::new(shared_cache, bus.clone(), config.cache.clone());
//! let locker = Locker::new(lock_service, config.lock.clone());
//!
//! let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
//! let listener = InvalidationListener::spawn(cache.clone(), bus, shutdown_rx);
//!
//! let stock = StockService::new(locker, cache, stock_repository)?;
//! let left = stock.decrease(42, 1, &UnitOfWork::none()).await?;
//! ```

/// Two-tier cache coordinator and its policies
pub mod cache;

/// Circuit breaker guarding the shared cache tier
pub mod circuit_breaker;

/// Configuration loaded from the environment
pub mod config;

/// Idempotent event consumption
pub mod consumer;

/// Fleet-wide invalidation listener
pub mod invalidation;

/// Lease-based lock wrappers
pub mod lock;

/// Prometheus metrics for observability
pub mod metrics;

/// Outbox publisher loop
pub mod outbox;

/// Retry logic with exponential backoff
pub mod retry;

/// Lock-guarded stock decrement
pub mod stock;

pub use cache::{CacheCoordinator, CachePolicy, CacheSpec, CachedCallError, LocalCache};
pub use config::{
    CacheConfig, ConfigError, FleetConfig, LockConfig, OutboxConfig, PostgresConfig,
    RedisConfig, RedpandaConfig,
};
pub use consumer::{ConsumerError, Handled, IdempotentConsumer};
pub use invalidation::InvalidationListener;
pub use lock::{LockSpec, LockedCallError, Locker};
pub use outbox::{OutboxPublisher, TickReport};
pub use stock::{StockError, StockRepository, StockService};
