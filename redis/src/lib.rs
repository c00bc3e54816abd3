//! Redis backends for Fleet Sync.
//!
//! One Redis deployment serves three roles for the whole fleet:
//!
//! - **Shared tier** ([`RedisSharedCache`]): `GET` / `SET PX` / `DEL` on the
//!   fully-qualified cache key
//! - **Invalidation bus** ([`RedisInvalidationBus`]): `PUBLISH` / `SUBSCRIBE`
//!   on the [`INVALIDATION_CHANNEL`](fleet_sync_core::cache::INVALIDATION_CHANNEL)
//! - **Lease locks** ([`RedisLockService`]): `SET NX PX` with an owner token,
//!   released and renewed through compare-and-act Lua scripts
//!
//! # Example
//!
//! ```no_run
//! use fleet_sync_redis::RedisBackends;
//! use fleet_sync_runtime::RedisConfig;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let backends = RedisBackends::connect(&RedisConfig::default()).await?;
//! let (shared, bus, locks) = backends.into_arcs();
//! # Ok(())
//! # }
//! ```

use fleet_sync_core::cache::{CacheError, InvalidationBus, SharedCache};
use fleet_sync_core::lock::LockService;
use fleet_sync_runtime::RedisConfig;
use redis::Client;
use redis::aio::ConnectionManager;
use std::sync::Arc;

pub mod cache;
pub mod lock;

pub use cache::{RedisInvalidationBus, RedisSharedCache};
pub use lock::RedisLockService;

/// Open a client and a multiplexed, auto-reconnecting connection.
///
/// # Errors
///
/// Returns [`CacheError::Unavailable`] if the URL is invalid or the first
/// connection fails.
pub async fn connect(url: &str) -> Result<(Client, ConnectionManager), CacheError> {
    let client = Client::open(url)
        .map_err(|e| CacheError::Unavailable(format!("Failed to create Redis client: {e}")))?;

    let conn = ConnectionManager::new(client.clone()).await.map_err(|e| {
        CacheError::Unavailable(format!("Failed to create Redis connection manager: {e}"))
    })?;

    Ok((client, conn))
}

/// All three Redis backends sharing one connection manager.
#[derive(Clone)]
pub struct RedisBackends {
    /// Shared cache tier
    pub shared: RedisSharedCache,
    /// Invalidation bus
    pub bus: RedisInvalidationBus,
    /// Lease lock service
    pub locks: RedisLockService,
}

impl RedisBackends {
    /// Connect to `config.url` and build every backend.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Unavailable`] if Redis cannot be reached.
    pub async fn connect(config: &RedisConfig) -> Result<Self, CacheError> {
        let (client, conn) = connect(&config.url).await?;

        tracing::info!(url = %config.url, "Connected to Redis");

        Ok(Self {
            shared: RedisSharedCache::from_manager(conn.clone()),
            bus: RedisInvalidationBus::from_parts(client, conn.clone()),
            locks: RedisLockService::from_manager(conn, config.lock_retry_interval()),
        })
    }

    /// Split into trait objects for the coordinator and the locker.
    #[must_use]
    pub fn into_arcs(
        self,
    ) -> (
        Arc<dyn SharedCache>,
        Arc<dyn InvalidationBus>,
        Arc<dyn LockService>,
    ) {
        (Arc::new(self.shared), Arc::new(self.bus), Arc::new(self.locks))
    }
}
