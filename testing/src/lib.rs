//! # Fleet Sync Testing
//!
//! In-memory backends and helpers for testing code built on Fleet Sync.
//!
//! This crate provides:
//! - In-memory implementations of every backend trait (shared cache,
//!   invalidation bus, lock service, outbox repository, broker)
//! - An in-memory stock repository for the stock decrement
//! - A fixed clock for deterministic timestamps
//! - proptest strategies and a tracing helper
//!
//! Sharing one set of backends between several coordinators simulates
//! several processes of a fleet.
//!
//! ## Example
//!
//! ```ignore
//! use fleet_sync_testing::{InMemoryInvalidationBus, InMemorySharedCache};
//! use fleet_sync_runtime::{CacheConfig, CacheCoordinator};
//!
//! let shared = Arc::new(InMemorySharedCache::new());
//! let bus = Arc::new(InMemoryInvalidationBus::new());
//! let process_a = CacheCoordinator::new(shared.clone(), bus.clone(), CacheConfig::default());
//! let process_b = CacheCoordinator::new(shared, bus, CacheConfig::default());
//! ```

use chrono::{DateTime, Utc};
use fleet_sync_core::environment::Clock;

pub mod broker;
pub mod cache;
pub mod lock;
pub mod outbox;
pub mod stock;

/// Mock implementations of environment traits.
pub mod mocks {
    use super::{Clock, DateTime, Utc};

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use fleet_sync_testing::mocks::FixedClock;
    /// use fleet_sync_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// let time1 = clock.now();
    /// let time2 = clock.now();
    /// assert_eq!(time1, time2); // Always the same!
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    #[must_use]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(DateTime::<Utc>::from_timestamp(1_735_689_600, 0).unwrap_or_default())
    }
}

/// Test helpers.
pub mod helpers {
    use std::time::Duration;

    /// Install a `tracing` subscriber honouring `RUST_LOG`, once per process.
    ///
    /// Later calls are no-ops.
    pub fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    }

    /// Poll `check` every 5 ms until it holds or `within` elapses.
    ///
    /// Returns whether the condition was reached.
    pub async fn eventually(within: Duration, mut check: impl FnMut() -> bool) -> bool {
        let deadline = tokio::time::Instant::now() + within;
        loop {
            if check() {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

/// Property-based testing utilities using proptest.
pub mod properties {
    use proptest::prelude::*;

    /// Initial stock and a batch of decrement amounts.
    #[derive(Debug, Clone)]
    pub struct DecrementPlan {
        /// Stock on hand before the batch
        pub initial: i64,
        /// Requested amounts, all positive
        pub amounts: Vec<i64>,
    }

    impl DecrementPlan {
        /// Sum of all requests.
        #[must_use]
        pub fn total(&self) -> i64 {
            self.amounts.iter().sum()
        }
    }

    /// Plans with up to 24 requests of 1..=5 units against 0..=60 units.
    pub fn decrement_plan() -> impl Strategy<Value = DecrementPlan> {
        (0_i64..=60, prop::collection::vec(1_i64..=5, 1..24))
            .prop_map(|(initial, amounts)| DecrementPlan { initial, amounts })
    }

    /// Key argument values: short identifiers safe inside any key.
    pub fn key_argument() -> impl Strategy<Value = String> {
        "[A-Za-z0-9_-]{1,12}"
    }
}

// Re-export commonly used items
pub use broker::{MockBroker, SentMessage};
pub use cache::{InMemoryInvalidationBus, InMemorySharedCache};
pub use lock::InMemoryLockService;
pub use mocks::{FixedClock, test_clock};
pub use outbox::InMemoryOutboxRepository;
pub use stock::InMemoryStockRepository;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_clock() {
        let clock = test_clock();
        assert_eq!(clock.now(), clock.now());
        assert_eq!(clock.now().to_rfc3339(), "2025-01-01T00:00:00+00:00");
    }
}
