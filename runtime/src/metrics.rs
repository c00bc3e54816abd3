//! Prometheus metrics for observability and monitoring.
//!
//! Metric families:
//! - Cache hits per tier, misses, and swallowed tier-2 errors
//! - Shared cache breaker state
//! - Lock acquisitions by outcome and time spent waiting
//! - Outbox records published and failed, tick duration
//!
//! Recording is always on (the `metrics` facade is a no-op until a recorder
//! is installed). [`MetricsServer`] installs the Prometheus recorder.
//!
//! # Example
//!
//! ```rust,no_run
//! use fleet_sync_runtime::metrics::MetricsServer;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//!
//! // Render for a /metrics endpoint
//! let body = server.render().unwrap_or_default();
//! # Ok(())
//! # }
//! ```

use crate::circuit_breaker::State;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus metrics server.
///
/// Holds the handle used to render metrics for Prometheus scraping.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a new metrics server.
    ///
    /// # Arguments
    ///
    /// * `addr` - Address the scrape endpoint is served on (e.g., `0.0.0.0:9090`)
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Register metric descriptions and install the Prometheus recorder.
    ///
    /// # Errors
    ///
    /// Returns error if the exporter cannot be built or installed.
    ///
    /// # Note
    ///
    /// If a recorder is already installed (e.g., by another test), this logs
    /// a warning and succeeds without a handle.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let builder = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[
                    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
                ],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        match builder.install_recorder() {
            Ok(handle) => {
                self.handle = Some(handle);
                tracing::info!(addr = %self.addr, "Metrics recorder installed");
                Ok(())
            },
            Err(e) => {
                let err_msg = e.to_string();
                if err_msg.contains("already initialized") {
                    tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
                    Ok(())
                } else {
                    Err(MetricsError::Install(err_msg))
                }
            },
        }
    }

    /// Address the scrape endpoint is meant to be served on.
    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Render current metrics in Prometheus format.
    ///
    /// Returns `None` if this server did not install the recorder.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

/// Register all metric descriptions.
fn register_metrics() {
    // Cache
    describe_counter!(
        "fleet_sync_cache_hits_total",
        "Cache hits, labelled by tier (local or shared)"
    );
    describe_counter!(
        "fleet_sync_cache_misses_total",
        "Reads that fell through to the wrapped operation"
    );
    describe_counter!(
        "fleet_sync_cache_errors_total",
        "Swallowed shared cache and invalidation bus errors, labelled by operation"
    );
    describe_counter!(
        "fleet_sync_cache_invalidations_total",
        "Invalidation messages applied from other processes"
    );
    describe_gauge!(
        "fleet_sync_cache_breaker_state",
        "Shared cache breaker state (0=closed, 1=half-open, 2=open)"
    );

    // Lock
    describe_counter!(
        "fleet_sync_lock_acquisitions_total",
        "Lease acquisitions, labelled by outcome (acquired, busy, error)"
    );
    describe_histogram!(
        "fleet_sync_lock_wait_duration_seconds",
        "Time spent waiting for a lease"
    );

    // Outbox
    describe_counter!(
        "fleet_sync_outbox_published_total",
        "Outbox records acknowledged by the broker and marked published"
    );
    describe_counter!(
        "fleet_sync_outbox_failed_total",
        "Outbox sends that failed and were left for the next tick"
    );
    describe_histogram!(
        "fleet_sync_outbox_tick_duration_seconds",
        "Time taken by one publisher tick"
    );
}

/// Cache metrics recorder.
pub struct CacheMetrics;

impl CacheMetrics {
    /// Record a hit in `tier` (`"local"` or `"shared"`).
    pub fn record_hit(tier: &'static str) {
        counter!("fleet_sync_cache_hits_total", "tier" => tier).increment(1);
    }

    /// Record a miss in both tiers.
    pub fn record_miss() {
        counter!("fleet_sync_cache_misses_total").increment(1);
    }

    /// Record a swallowed error.
    pub fn record_error(operation: &'static str) {
        counter!("fleet_sync_cache_errors_total", "operation" => operation).increment(1);
    }

    /// Record an applied invalidation.
    pub fn record_invalidation() {
        counter!("fleet_sync_cache_invalidations_total").increment(1);
    }

    /// Record the breaker state.
    pub fn record_breaker_state(state: State) {
        gauge!("fleet_sync_cache_breaker_state").set(state.as_gauge());
    }
}

/// Lock metrics recorder.
pub struct LockMetrics;

impl LockMetrics {
    /// Record an acquisition attempt and how long it waited.
    pub fn record_acquisition(outcome: &'static str, waited: Duration) {
        counter!("fleet_sync_lock_acquisitions_total", "outcome" => outcome).increment(1);
        histogram!("fleet_sync_lock_wait_duration_seconds").record(waited.as_secs_f64());
    }
}

/// Outbox metrics recorder.
pub struct OutboxMetrics;

impl OutboxMetrics {
    /// Record a published record.
    pub fn record_published() {
        counter!("fleet_sync_outbox_published_total").increment(1);
    }

    /// Record a failed send.
    pub fn record_failed() {
        counter!("fleet_sync_outbox_failed_total").increment(1);
    }

    /// Record a tick.
    pub fn record_tick(duration: Duration) {
        histogram!("fleet_sync_outbox_tick_duration_seconds").record(duration.as_secs_f64());
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Test code can use unwrap
mod tests {
    use super::*;

    #[test]
    fn test_metrics_server_creation() {
        let addr = "127.0.0.1:0".parse().unwrap();
        let server = MetricsServer::new(addr);
        assert!(server.render().is_none());
        assert_eq!(server.addr(), addr);
    }

    #[test]
    fn test_metrics_server_render() {
        let addr = "127.0.0.1:0".parse().unwrap();
        let mut server = MetricsServer::new(addr);
        server.start().unwrap();

        CacheMetrics::record_hit("local");
        CacheMetrics::record_miss();
        LockMetrics::record_acquisition("acquired", Duration::from_millis(3));
        OutboxMetrics::record_published();

        // If another test installed the recorder first, there is no handle.
        if let Some(rendered) = server.render() {
            assert!(rendered.contains("fleet_sync_cache_hits_total"));
            assert!(rendered.contains("fleet_sync_lock_acquisitions_total"));
            assert!(rendered.contains("fleet_sync_outbox_published_total"));
        }
    }
}
