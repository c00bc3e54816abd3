//! Circuit breaker guarding the shared cache tier.
//!
//! The cache is never the system of record, so a struggling tier-2 store must
//! not slow every request down to its timeout. After a run of consecutive
//! failures the breaker opens and tier-2 calls are skipped (reads become
//! misses, writes become no-ops) for a cool-down period; then a single probe
//! is let through.
//!
//! # States
//!
//! - **Closed**: calls pass through; consecutive failures are counted
//! - **Open**: calls are rejected without touching the store
//! - **HalfOpen**: after the cool-down, calls probe the store; the first
//!   success closes the breaker, the first failure reopens it
//!
//! Every call that passes is bounded by a timeout; a timeout counts as a
//! failure.

use crate::metrics::CacheMetrics;
use fleet_sync_core::cache::CacheError;
use std::future::Future;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Circuit is closed, calls pass through normally
    Closed,
    /// Circuit is open, calls are skipped
    Open,
    /// Circuit is half-open, testing if the store recovered
    HalfOpen,
}

impl State {
    /// Gauge value: 0 = closed, 1 = half-open, 2 = open.
    #[must_use]
    pub const fn as_gauge(self) -> f64 {
        match self {
            Self::Closed => 0.0,
            Self::HalfOpen => 1.0,
            Self::Open => 2.0,
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: State,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

/// Tier-2 circuit breaker with per-call timeouts.
#[derive(Debug)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    cool_down: Duration,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    /// Create a closed breaker.
    #[must_use]
    pub fn new(failure_threshold: u32, cool_down: Duration) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            cool_down,
            inner: Mutex::new(Inner {
                state: State::Closed,
                consecutive_failures: 0,
                opened_at: None,
            }),
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> State {
        self.lock().state
    }

    /// Run `call` through the breaker, bounded by `timeout`.
    ///
    /// # Errors
    ///
    /// - [`CacheError::Unavailable`] without running `call` while the breaker is open
    /// - [`CacheError::Timeout`] if `call` does not finish in time
    /// - whatever `call` itself returns
    pub async fn call<T, Fut>(
        &self,
        operation: &'static str,
        timeout: Duration,
        call: Fut,
    ) -> Result<T, CacheError>
    where
        Fut: Future<Output = Result<T, CacheError>>,
    {
        if !self.try_pass() {
            return Err(CacheError::Unavailable(format!(
                "circuit open, {operation} skipped"
            )));
        }

        let outcome = tokio::time::timeout(timeout, call)
            .await
            .unwrap_or(Err(CacheError::Timeout { operation, timeout }));

        match &outcome {
            Ok(_) => self.on_success(),
            Err(_) => self.on_failure(),
        }
        outcome
    }

    /// Force the breaker closed.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.state = State::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        CacheMetrics::record_breaker_state(State::Closed);
    }

    fn try_pass(&self) -> bool {
        let mut inner = self.lock();
        match inner.state {
            State::Closed | State::HalfOpen => true,
            State::Open => {
                let cooled = inner
                    .opened_at
                    .is_none_or(|opened| opened.elapsed() >= self.cool_down);
                if cooled {
                    tracing::info!("Shared cache breaker OPEN -> HALF_OPEN, probing");
                    inner.state = State::HalfOpen;
                    CacheMetrics::record_breaker_state(State::HalfOpen);
                }
                cooled
            },
        }
    }

    fn on_success(&self) {
        let mut inner = self.lock();
        inner.consecutive_failures = 0;
        if inner.state != State::Closed {
            tracing::info!("Shared cache breaker -> CLOSED, store recovered");
            inner.state = State::Closed;
            inner.opened_at = None;
            CacheMetrics::record_breaker_state(State::Closed);
        }
    }

    fn on_failure(&self) {
        let mut inner = self.lock();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);

        let trip = match inner.state {
            State::HalfOpen => true,
            State::Closed => inner.consecutive_failures >= self.failure_threshold,
            State::Open => false,
        };
        if trip {
            tracing::warn!(
                failures = inner.consecutive_failures,
                cool_down_ms = self.cool_down.as_millis(),
                "Shared cache breaker -> OPEN, bypassing tier-2"
            );
            inner.state = State::Open;
            inner.opened_at = Some(Instant::now());
            CacheMetrics::record_breaker_state(State::Open);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
