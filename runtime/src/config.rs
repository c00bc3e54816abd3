//! Configuration for every Fleet Sync component.
//!
//! Each component has its own section with sensible defaults. [`FleetConfig::from_env`]
//! starts from the defaults and applies environment overrides:
//!
//! | Variable | Field | Default |
//! |---|---|---|
//! | `CACHE_DEFAULT_TTL_SECS` | `cache.default_ttl_secs` | `300` |
//! | `CACHE_LOCAL_MAX_ENTRIES` | `cache.local_max_entries` | `10000` |
//! | `CACHE_LOCAL_TTL_SECS` | `cache.local_ttl_secs` | `60` |
//! | `CACHE_STORE_TIMEOUT_MS` | `cache.store_timeout_ms` | `500` |
//! | `LOCK_WAIT_MS` | `lock.wait_ms` | `3000` |
//! | `LOCK_LEASE_MS` | `lock.lease_ms` | `5000` |
//! | `OUTBOX_INTERVAL_MS` | `outbox.interval_ms` | `5000` |
//! | `OUTBOX_TOPIC` | `outbox.topic` | `stock-result` |
//! | `OUTBOX_BATCH_SIZE` | `outbox.batch_size` | `100` |
//! | `OUTBOX_SEND_TIMEOUT_MS` | `outbox.send_timeout_ms` | `5000` |
//! | `REDIS_URL` | `redis.url` | `redis://127.0.0.1:6379` |
//! | `DATABASE_URL` | `postgres.url` | unset |
//! | `DATABASE_MAX_CONNECTIONS` | `postgres.max_connections` | `10` |
//! | `REDPANDA_BROKERS` | `redpanda.brokers` | `localhost:9092` |
//! | `REDPANDA_CONSUMER_GROUP` | `redpanda.consumer_group` | `fleet-sync` |
//!
//! # Example
//!
//! ```no_run
//! use fleet_sync_runtime::config::FleetConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = FleetConfig::from_env()?;
//! println!("Publishing outbox events to {}", config.outbox.topic);
//! # Ok(())
//! # }
//! ```

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Configuration error
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// An environment variable holds a value of the wrong type
    #[error("Invalid value for {var}: '{value}'")]
    InvalidValue {
        /// Variable name
        var: String,
        /// Offending value
        value: String,
    },
    /// Configuration validation failed
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

fn invalid(msg: &str) -> ConfigError {
    ConfigError::ValidationError(msg.to_string())
}

/// Whole milliseconds of `duration`, saturating at `u64::MAX`.
fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Read `var` and parse it, keeping `current` when unset.
fn override_from_env<T: FromStr>(var: &str, current: &mut T) -> Result<(), ConfigError> {
    if let Ok(value) = std::env::var(var) {
        *current = value.trim().parse().map_err(|_| ConfigError::InvalidValue {
            var: var.to_string(),
            value,
        })?;
    }
    Ok(())
}

/// Two-tier cache configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Tier-2 TTL used when a call site gives none (seconds)
    pub default_ttl_secs: u64,
    /// Maximum number of tier-1 entries
    pub local_max_entries: u64,
    /// Tier-1 time-to-live (seconds)
    pub local_ttl_secs: u64,
    /// Timeout of every tier-2 and bus call (milliseconds)
    pub store_timeout_ms: u64,
    /// Consecutive tier-2 failures before tier-2 is bypassed
    pub breaker_failure_threshold: u32,
    /// How long tier-2 stays bypassed before it is probed again (milliseconds)
    pub breaker_cool_down_ms: u64,
    /// How long a published invalidation is remembered as self-authored (milliseconds)
    pub echo_window_ms: u64,
    /// First re-subscription delay of the invalidation listener (milliseconds)
    pub resubscribe_initial_ms: u64,
    /// Cap on the re-subscription delay (milliseconds)
    pub resubscribe_max_ms: u64,
}

impl CacheConfig {
    /// Validate cache configuration
    ///
    /// # Errors
    ///
    /// Returns error if configuration is invalid
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_ttl_secs == 0 {
            return Err(invalid("cache.default_ttl_secs must be > 0"));
        }
        if self.local_max_entries == 0 {
            return Err(invalid("cache.local_max_entries must be > 0"));
        }
        if self.local_ttl_secs == 0 {
            return Err(invalid("cache.local_ttl_secs must be > 0"));
        }
        if self.store_timeout_ms == 0 {
            return Err(invalid("cache.store_timeout_ms must be > 0"));
        }
        if self.breaker_failure_threshold == 0 {
            return Err(invalid("cache.breaker_failure_threshold must be > 0"));
        }
        if self.resubscribe_initial_ms > self.resubscribe_max_ms {
            return Err(invalid(
                "cache.resubscribe_initial_ms must not exceed cache.resubscribe_max_ms",
            ));
        }
        Ok(())
    }

    /// Fallback tier-2 TTL
    #[must_use]
    pub const fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }

    /// Tier-1 time-to-live
    #[must_use]
    pub const fn local_ttl(&self) -> Duration {
        Duration::from_secs(self.local_ttl_secs)
    }

    /// Tier-2 call timeout
    #[must_use]
    pub const fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    /// Breaker cool-down
    #[must_use]
    pub const fn breaker_cool_down(&self) -> Duration {
        Duration::from_millis(self.breaker_cool_down_ms)
    }

    /// Self-echo memory window
    #[must_use]
    pub const fn echo_window(&self) -> Duration {
        Duration::from_millis(self.echo_window_ms)
    }

    /// Set the fallback tier-2 TTL
    #[must_use]
    pub const fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl_secs = ttl.as_secs();
        self
    }

    /// Set tier-1 capacity and time-to-live
    #[must_use]
    pub const fn with_local_tier(mut self, max_entries: u64, ttl: Duration) -> Self {
        self.local_max_entries = max_entries;
        self.local_ttl_secs = ttl.as_secs();
        self
    }

    /// Set the tier-2 breaker threshold and cool-down
    #[must_use]
    pub fn with_breaker(mut self, failure_threshold: u32, cool_down: Duration) -> Self {
        self.breaker_failure_threshold = failure_threshold;
        self.breaker_cool_down_ms = millis(cool_down);
        self
    }

    /// Set how long own broadcasts are remembered for echo suppression
    #[must_use]
    pub fn with_echo_window(mut self, window: Duration) -> Self {
        self.echo_window_ms = millis(window);
        self
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl_secs: 300,
            local_max_entries: 10_000,
            local_ttl_secs: 60,
            store_timeout_ms: 500,
            breaker_failure_threshold: 5,
            breaker_cool_down_ms: 30_000,
            echo_window_ms: 2_000,
            resubscribe_initial_ms: 100,
            resubscribe_max_ms: 30_000,
        }
    }
}

/// Distributed lock configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockConfig {
    /// Default time to wait for a busy lease (milliseconds)
    pub wait_ms: u64,
    /// Default lease time (milliseconds)
    pub lease_ms: u64,
}

impl LockConfig {
    /// Validate lock configuration
    ///
    /// # Errors
    ///
    /// Returns error if configuration is invalid
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.lease_ms == 0 {
            return Err(invalid("lock.lease_ms must be > 0"));
        }
        Ok(())
    }

    /// Default wait time
    #[must_use]
    pub const fn wait_time(&self) -> Duration {
        Duration::from_millis(self.wait_ms)
    }

    /// Default lease time
    #[must_use]
    pub const fn lease_time(&self) -> Duration {
        Duration::from_millis(self.lease_ms)
    }

    /// Set default wait and lease times
    #[must_use]
    pub fn with_times(mut self, wait: Duration, lease: Duration) -> Self {
        self.wait_ms = millis(wait);
        self.lease_ms = millis(lease);
        self
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            wait_ms: 3_000,
            lease_ms: 5_000,
        }
    }
}

/// Outbox publisher configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxConfig {
    /// Delay between publisher ticks (milliseconds)
    pub interval_ms: u64,
    /// Broker topic events are sent to
    pub topic: String,
    /// Maximum records claimed per tick
    pub batch_size: usize,
    /// Timeout for one broker acknowledgement (milliseconds)
    pub send_timeout_ms: u64,
}

impl OutboxConfig {
    /// Validate outbox configuration
    ///
    /// # Errors
    ///
    /// Returns error if configuration is invalid
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interval_ms == 0 {
            return Err(invalid("outbox.interval_ms must be > 0"));
        }
        if self.topic.is_empty() {
            return Err(invalid("outbox.topic cannot be empty"));
        }
        if self.batch_size == 0 {
            return Err(invalid("outbox.batch_size must be > 0"));
        }
        if self.send_timeout_ms == 0 {
            return Err(invalid("outbox.send_timeout_ms must be > 0"));
        }
        Ok(())
    }

    /// Publisher tick interval
    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Broker acknowledgement timeout
    #[must_use]
    pub const fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    /// Set the topic
    #[must_use]
    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = topic.into();
        self
    }

    /// Set the batch size
    #[must_use]
    pub const fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Set the acknowledgement timeout
    #[must_use]
    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout_ms = millis(timeout);
        self
    }
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            interval_ms: 5_000,
            topic: "stock-result".to_string(),
            batch_size: 100,
            send_timeout_ms: 5_000,
        }
    }
}

/// Redis connection configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Connection URL
    pub url: String,
    /// Interval between lease acquisition attempts (milliseconds)
    pub lock_retry_interval_ms: u64,
}

impl RedisConfig {
    /// Lease polling interval
    #[must_use]
    pub const fn lock_retry_interval(&self) -> Duration {
        Duration::from_millis(self.lock_retry_interval_ms)
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            lock_retry_interval_ms: 50,
        }
    }
}

/// `PostgreSQL` configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostgresConfig {
    /// Database URL (from environment variable for security)
    #[serde(skip)]
    pub url: Option<String>,
    /// Maximum connections in pool
    pub max_connections: u32,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 10,
        }
    }
}

/// Redpanda/Kafka configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedpandaConfig {
    /// Comma-separated bootstrap brokers
    pub brokers: String,
    /// Consumer group for subscriptions
    pub consumer_group: String,
}

impl Default for RedpandaConfig {
    fn default() -> Self {
        Self {
            brokers: "localhost:9092".to_string(),
            consumer_group: "fleet-sync".to_string(),
        }
    }
}

/// Complete Fleet Sync configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FleetConfig {
    /// Two-tier cache
    pub cache: CacheConfig,
    /// Distributed lock
    pub lock: LockConfig,
    /// Outbox publisher
    pub outbox: OutboxConfig,
    /// Redis backend
    pub redis: RedisConfig,
    /// `PostgreSQL` backend
    pub postgres: PostgresConfig,
    /// Redpanda backend
    pub redpanda: RedpandaConfig,
}

impl FleetConfig {
    /// Load configuration from defaults plus environment overrides
    ///
    /// # Errors
    ///
    /// Returns error if a variable cannot be parsed or the result is invalid
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        override_from_env("CACHE_DEFAULT_TTL_SECS", &mut config.cache.default_ttl_secs)?;
        override_from_env("CACHE_LOCAL_MAX_ENTRIES", &mut config.cache.local_max_entries)?;
        override_from_env("CACHE_LOCAL_TTL_SECS", &mut config.cache.local_ttl_secs)?;
        override_from_env("CACHE_STORE_TIMEOUT_MS", &mut config.cache.store_timeout_ms)?;

        override_from_env("LOCK_WAIT_MS", &mut config.lock.wait_ms)?;
        override_from_env("LOCK_LEASE_MS", &mut config.lock.lease_ms)?;

        override_from_env("OUTBOX_INTERVAL_MS", &mut config.outbox.interval_ms)?;
        override_from_env("OUTBOX_TOPIC", &mut config.outbox.topic)?;
        override_from_env("OUTBOX_BATCH_SIZE", &mut config.outbox.batch_size)?;
        override_from_env("OUTBOX_SEND_TIMEOUT_MS", &mut config.outbox.send_timeout_ms)?;

        override_from_env("REDIS_URL", &mut config.redis.url)?;

        if let Ok(url) = std::env::var("DATABASE_URL") {
            config.postgres.url = Some(url);
        }
        override_from_env("DATABASE_MAX_CONNECTIONS", &mut config.postgres.max_connections)?;

        override_from_env("REDPANDA_BROKERS", &mut config.redpanda.brokers)?;
        override_from_env("REDPANDA_CONSUMER_GROUP", &mut config.redpanda.consumer_group)?;

        config.validate()?;
        Ok(config)
    }

    /// Validate every section
    ///
    /// # Errors
    ///
    /// Returns the first validation failure
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.cache.validate()?;
        self.lock.validate()?;
        self.outbox.validate()?;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Test code can use unwrap
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = FleetConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.outbox.interval(), Duration::from_secs(5));
        assert_eq!(config.cache.default_ttl(), Duration::from_secs(300));
    }

    #[test]
    fn validation_rejects_zero_values() {
        let mut config = FleetConfig::default();
        config.cache.default_ttl_secs = 0;
        assert!(config.validate().is_err());

        let mut config = FleetConfig::default();
        config.outbox.topic = String::new();
        assert!(matches!(config.validate(), Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn builders_convert_durations() {
        let lock = LockConfig::default().with_times(Duration::from_secs(1), Duration::from_secs(10));
        assert_eq!(lock.wait_ms, 1_000);
        assert_eq!(lock.lease_time(), Duration::from_secs(10));

        let cache = CacheConfig::default().with_breaker(2, Duration::from_millis(250));
        assert_eq!(cache.breaker_cool_down(), Duration::from_millis(250));
    }

    #[test]
    fn oversized_durations_saturate_instead_of_wrapping() {
        let lock = LockConfig::default().with_times(Duration::MAX, Duration::from_secs(1));
        assert_eq!(lock.wait_ms, u64::MAX);
        assert_eq!(lock.lease_ms, 1_000);

        let outbox = OutboxConfig::default().with_send_timeout(Duration::MAX);
        assert_eq!(outbox.send_timeout_ms, u64::MAX);

        let cache = CacheConfig::default().with_breaker(1, Duration::MAX);
        assert_eq!(cache.breaker_cool_down_ms, u64::MAX);
    }

    #[test]
    fn config_serializes_without_secrets() {
        let mut config = FleetConfig::default();
        config.postgres.url = Some("postgres://user:secret@db/app".to_string());
        let json = serde_json::to_string(&config).unwrap();
        assert!(!json.contains("secret"));
    }
}
