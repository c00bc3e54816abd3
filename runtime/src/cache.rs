//! Two-tier cache coordinator.
//!
//! [`CacheCoordinator`] wraps a plain async operation with one of three
//! policies:
//!
//! - **Read** ([`CacheCoordinator::read`]): tier-1, then tier-2 (populating
//!   tier-1), then the operation (populating both tiers)
//! - **Write** ([`CacheCoordinator::write`]): run the operation, then write its
//!   result to both tiers and broadcast `WRITE`; deferred to commit when the
//!   unit of work is active
//! - **Delete** ([`CacheCoordinator::evict`]): run the operation, then clear
//!   both tiers and broadcast `DELETE`, immediately
//!
//! Tier-1 is a bounded, TTL-evicting [`LocalCache`]; tier-2 is any
//! [`SharedCache`]. Tier-2 failures never fail the wrapped operation: reads
//! degrade to misses and writes to no-ops, and a circuit breaker stops calling
//! a store that keeps failing.
//!
//! # Example
//!
//! ```ignore
//! let spec = CacheSpec::parse("stock:", "{productId}")?.with_ttl(Duration::from_secs(60));
//! let ctx = KeyContext::new().with_arg("productId", 42);
//!
//! let quantity: i64 = coordinator
//!     .read(&spec, &ctx, || repository.quantity(42))
//!     .await?;
//! ```

use crate::circuit_breaker::{CircuitBreaker, State};
use crate::config::CacheConfig;
use crate::metrics::CacheMetrics;
use fleet_sync_core::cache::{CacheError, InvalidationBus, InvalidationMessage, SharedCache};
use fleet_sync_core::key::{KeyContext, KeyError, KeyExpression};
use fleet_sync_core::unit_of_work::UnitOfWork;
use moka::future::Cache;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

/// Number of distinct remembered broadcasts above which stale ones are pruned.
const ECHO_PRUNE_THRESHOLD: usize = 1_024;

/// Which policy wraps a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachePolicy {
    /// Cache-aside read
    Read,
    /// Write-through after the operation
    Write,
    /// Evict after the operation
    Delete,
}

/// Error of a cache-wrapped call.
#[derive(Error, Debug)]
pub enum CachedCallError<E> {
    /// The key expression could not be resolved. A programming error at the
    /// call site.
    #[error("Invalid cache key: {0}")]
    InvalidKey(KeyError),

    /// The wrapped operation failed.
    #[error("{0}")]
    Operation(E),
}

impl<E> CachedCallError<E> {
    /// The operation's error, if that is what failed.
    pub fn into_operation(self) -> Option<E> {
        match self {
            Self::Operation(e) => Some(e),
            Self::InvalidKey(_) => None,
        }
    }
}

/// Per-call-site cache settings.
#[derive(Debug, Clone)]
pub struct CacheSpec {
    prefix: String,
    key: KeyExpression,
    ttl: Duration,
    cache_null: bool,
}

impl CacheSpec {
    /// Settings with the default TTL and null caching disabled.
    #[must_use]
    pub fn new(prefix: impl Into<String>, key: KeyExpression) -> Self {
        Self {
            prefix: prefix.into(),
            key,
            ttl: Duration::ZERO,
            cache_null: false,
        }
    }

    /// Parse `template` as the key expression.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError`] if the template is malformed.
    pub fn parse(prefix: impl Into<String>, template: &str) -> Result<Self, KeyError> {
        Ok(Self::new(prefix, KeyExpression::parse(template)?))
    }

    /// Set the tier-2 TTL. Zero falls back to the configured default.
    #[must_use]
    pub const fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Allow caching results whose JSON form is `null`.
    #[must_use]
    pub const fn with_cache_null(mut self, cache_null: bool) -> Self {
        self.cache_null = cache_null;
        self
    }

    /// The key prefix.
    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// The key expression.
    #[must_use]
    pub const fn key(&self) -> &KeyExpression {
        &self.key
    }

    /// `prefix + resolved key`.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError`] if the expression cannot be resolved against `ctx`.
    pub fn full_key(&self, ctx: &KeyContext) -> Result<String, KeyError> {
        let key = self.key.resolve(ctx)?;
        Ok(format!("{}{key}", self.prefix))
    }

    fn ttl_or(&self, fallback: Duration) -> Duration {
        if self.ttl.is_zero() { fallback } else { self.ttl }
    }
}

/// Process-local, bounded, TTL-evicting tier.
#[derive(Clone)]
pub struct LocalCache {
    entries: Cache<String, String>,
}

impl LocalCache {
    /// Create a tier holding at most `max_entries` entries for at most `ttl` each.
    #[must_use]
    pub fn new(max_entries: u64, ttl: Duration) -> Self {
        Self {
            entries: Cache::builder()
                .max_capacity(max_entries)
                .time_to_live(ttl)
                .build(),
        }
    }

    /// Look up `key`.
    pub async fn get(&self, key: &str) -> Option<String> {
        self.entries.get(key).await
    }

    /// Store `value` under `key`.
    pub async fn insert(&self, key: String, value: String) {
        self.entries.insert(key, value).await;
    }

    /// Evict `key`; evicting an absent key is a no-op.
    pub async fn invalidate(&self, key: &str) {
        self.entries.invalidate(key).await;
    }

    /// Evict every entry.
    pub fn invalidate_all(&self) {
        self.entries.invalidate_all();
    }

    /// Whether `key` is currently cached.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }
}

/// Broadcasts this process authored and has not seen come back yet.
struct EchoLedger {
    window: Duration,
    sent: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl EchoLedger {
    fn new(window: Duration) -> Self {
        Self {
            window,
            sent: Mutex::new(HashMap::new()),
        }
    }

    fn record(&self, message: &InvalidationMessage) {
        if self.window.is_zero() {
            return;
        }
        let now = Instant::now();
        let mut sent = self.sent.lock().unwrap_or_else(PoisonError::into_inner);
        if sent.len() >= ECHO_PRUNE_THRESHOLD {
            sent.retain(|_, stamps| {
                stamps.retain(|at| now.duration_since(*at) < self.window);
                !stamps.is_empty()
            });
        }
        sent.entry(message.to_string()).or_default().push_back(now);
    }

    /// Consume one remembered copy of `message`, if any is still fresh.
    fn take(&self, message: &InvalidationMessage) -> bool {
        let wire = message.to_string();
        let now = Instant::now();
        let mut sent = self.sent.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(stamps) = sent.get_mut(&wire) else {
            return false;
        };

        while stamps
            .front()
            .is_some_and(|at| now.duration_since(*at) >= self.window)
        {
            stamps.pop_front();
        }
        let hit = stamps.pop_front().is_some();
        if stamps.is_empty() {
            sent.remove(&wire);
        }
        hit
    }

    fn clear(&self) {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    fn forget(&self, message: &InvalidationMessage) {
        let wire = message.to_string();
        let mut sent = self.sent.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(stamps) = sent.get_mut(&wire) {
            stamps.pop_back();
            if stamps.is_empty() {
                sent.remove(&wire);
            }
        }
    }
}

struct Inner {
    local: LocalCache,
    shared: Arc<dyn SharedCache>,
    bus: Arc<dyn InvalidationBus>,
    breaker: CircuitBreaker,
    echoes: EchoLedger,
    resyncs: AtomicU64,
    config: CacheConfig,
}

impl Inner {
    async fn shared_get(&self, key: &str) -> Option<String> {
        let timeout = self.config.store_timeout();
        match self.breaker.call("get", timeout, self.shared.get(key)).await {
            Ok(value) => value,
            Err(e) => {
                self.swallow("get", key, &e);
                None
            },
        }
    }

    async fn shared_set(&self, key: &str, value: &str, ttl: Duration) {
        let timeout = self.config.store_timeout();
        if let Err(e) = self
            .breaker
            .call("set", timeout, self.shared.set(key, value, ttl))
            .await
        {
            self.swallow("set", key, &e);
        }
    }

    async fn shared_delete(&self, key: &str) {
        let timeout = self.config.store_timeout();
        if let Err(e) = self
            .breaker
            .call("delete", timeout, self.shared.delete(key))
            .await
        {
            self.swallow("delete", key, &e);
        }
    }

    async fn populate(&self, key: &str, json: &str, ttl: Duration) {
        self.shared_set(key, json, ttl).await;
        self.local.insert(key.to_string(), json.to_string()).await;
    }

    async fn broadcast(&self, message: InvalidationMessage) {
        self.echoes.record(&message);

        let timeout = self.config.store_timeout();
        let outcome = tokio::time::timeout(timeout, self.bus.publish(&message))
            .await
            .unwrap_or(Err(CacheError::Timeout {
                operation: "publish",
                timeout,
            }));

        match outcome {
            Ok(()) => tracing::debug!(message = %message, "Invalidation broadcast"),
            Err(e) => {
                self.echoes.forget(&message);
                self.swallow("publish", &message.full_key, &e);
            },
        }
    }

    fn swallow(&self, operation: &'static str, key: &str, error: &CacheError) {
        CacheMetrics::record_error(operation);
        if self.breaker.state() == State::Open {
            tracing::debug!(operation, key = %key, error = %error, "Shared cache bypassed");
        } else {
            tracing::warn!(operation, key = %key, error = %error, "Shared cache call failed, continuing without it");
        }
    }
}

/// Coordinates tier-1, tier-2 and the invalidation bus around wrapped calls.
///
/// Cheap to clone; clones share both tiers.
#[derive(Clone)]
pub struct CacheCoordinator {
    inner: Arc<Inner>,
}

impl CacheCoordinator {
    /// Create a coordinator with a fresh tier-1.
    #[must_use]
    pub fn new(
        shared: Arc<dyn SharedCache>,
        bus: Arc<dyn InvalidationBus>,
        config: CacheConfig,
    ) -> Self {
        let local = LocalCache::new(config.local_max_entries, config.local_ttl());
        let breaker = CircuitBreaker::new(config.breaker_failure_threshold, config.breaker_cool_down());
        let echoes = EchoLedger::new(config.echo_window());

        Self {
            inner: Arc::new(Inner {
                local,
                shared,
                bus,
                breaker,
                echoes,
                resyncs: AtomicU64::new(0),
                config,
            }),
        }
    }

    /// The process-local tier.
    #[must_use]
    pub fn local(&self) -> &LocalCache {
        &self.inner.local
    }

    /// The configuration in use.
    #[must_use]
    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// State of the tier-2 circuit breaker.
    #[must_use]
    pub fn breaker_state(&self) -> State {
        self.inner.breaker.state()
    }

    /// Dispatch to [`read`](Self::read), [`write`](Self::write) or
    /// [`evict`](Self::evict).
    ///
    /// # Errors
    ///
    /// See the individual policies.
    pub async fn with_cache<T, E, F, Fut>(
        &self,
        policy: CachePolicy,
        spec: &CacheSpec,
        ctx: &KeyContext,
        uow: &UnitOfWork,
        operation: F,
    ) -> Result<T, CachedCallError<E>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        match policy {
            CachePolicy::Read => self.read(spec, ctx, operation).await,
            CachePolicy::Write => self.write(spec, ctx, uow, operation).await,
            CachePolicy::Delete => self.evict(spec, ctx, operation).await,
        }
    }

    /// Cache-aside read.
    ///
    /// Undecodable cached values are treated as misses.
    ///
    /// # Errors
    ///
    /// - [`CachedCallError::InvalidKey`] if the key cannot be resolved (the
    ///   operation is not run)
    /// - [`CachedCallError::Operation`] if the operation fails on a miss
    pub async fn read<T, E, F, Fut>(
        &self,
        spec: &CacheSpec,
        ctx: &KeyContext,
        operation: F,
    ) -> Result<T, CachedCallError<E>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let full_key = spec.full_key(ctx).map_err(CachedCallError::InvalidKey)?;
        let inner = &self.inner;

        if let Some(json) = inner.local.get(&full_key).await {
            match serde_json::from_str(&json) {
                Ok(value) => {
                    CacheMetrics::record_hit("local");
                    tracing::debug!(key = %full_key, tier = "local", "Cache hit");
                    return Ok(value);
                },
                Err(e) => {
                    tracing::warn!(key = %full_key, error = %e, "Discarding undecodable local entry");
                    inner.local.invalidate(&full_key).await;
                },
            }
        }

        if let Some(json) = inner.shared_get(&full_key).await {
            match serde_json::from_str(&json) {
                Ok(value) => {
                    inner.local.insert(full_key.clone(), json).await;
                    CacheMetrics::record_hit("shared");
                    tracing::debug!(key = %full_key, tier = "shared", "Cache hit");
                    return Ok(value);
                },
                Err(e) => {
                    inner.swallow("decode", &full_key, &CacheError::Serialization(e.to_string()));
                },
            }
        }

        CacheMetrics::record_miss();
        tracing::debug!(key = %full_key, "Cache miss");

        let value = operation().await.map_err(CachedCallError::Operation)?;

        if let Some(json) = self.cacheable(spec, &full_key, &value) {
            let ttl = spec.ttl_or(inner.config.default_ttl());
            inner.populate(&full_key, &json, ttl).await;
        }
        Ok(value)
    }

    /// Write-through after the operation.
    ///
    /// The tier-2 write, tier-1 write and `WRITE` broadcast run when `uow`
    /// commits, or right away if `uow` is not active. The key may reference
    /// `{result...}`; it is then resolved after the operation.
    ///
    /// # Errors
    ///
    /// - [`CachedCallError::InvalidKey`] if the key cannot be resolved; when
    ///   the key references the result this happens after the operation ran
    /// - [`CachedCallError::Operation`] if the operation fails (nothing is cached)
    pub async fn write<T, E, F, Fut>(
        &self,
        spec: &CacheSpec,
        ctx: &KeyContext,
        uow: &UnitOfWork,
        operation: F,
    ) -> Result<T, CachedCallError<E>>
    where
        T: Serialize,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let resolved_early = if spec.key().references_result() {
            None
        } else {
            Some(spec.full_key(ctx).map_err(CachedCallError::InvalidKey)?)
        };

        let value = operation().await.map_err(CachedCallError::Operation)?;

        let encoded = match serde_json::to_value(&value) {
            Ok(encoded) => encoded,
            Err(e) => {
                let key = resolved_early.as_deref().unwrap_or(spec.prefix());
                self.inner
                    .swallow("encode", key, &CacheError::Serialization(e.to_string()));
                return Ok(value);
            },
        };

        let full_key = match resolved_early {
            Some(key) => key,
            None => spec
                .full_key(&ctx.clone().with_result(encoded.clone()))
                .map_err(CachedCallError::InvalidKey)?,
        };

        if encoded.is_null() && !spec.cache_null {
            tracing::debug!(key = %full_key, "Null result not cached");
            return Ok(value);
        }

        let json = encoded.to_string();
        let ttl = spec.ttl_or(self.inner.config.default_ttl());
        let inner = Arc::clone(&self.inner);
        let publish = move || async move {
            inner.populate(&full_key, &json, ttl).await;
            inner.broadcast(InvalidationMessage::write(full_key)).await;
        };

        match uow.on_commit(publish) {
            Ok(()) => tracing::debug!(unit_of_work = uow.id(), "Cache write deferred to commit"),
            Err(publish) => publish().await,
        }
        Ok(value)
    }

    /// Evict after the operation.
    ///
    /// Both tiers are cleared and `DELETE` broadcast before this returns,
    /// whatever the unit-of-work state. Nothing is evicted if the operation fails.
    ///
    /// # Errors
    ///
    /// - [`CachedCallError::InvalidKey`] if the key cannot be resolved (the
    ///   operation is not run)
    /// - [`CachedCallError::Operation`] if the operation fails
    pub async fn evict<T, E, F, Fut>(
        &self,
        spec: &CacheSpec,
        ctx: &KeyContext,
        operation: F,
    ) -> Result<T, CachedCallError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let full_key = spec.full_key(ctx).map_err(CachedCallError::InvalidKey)?;

        let value = operation().await.map_err(CachedCallError::Operation)?;

        self.inner.shared_delete(&full_key).await;
        self.inner.local.invalidate(&full_key).await;
        self.inner.broadcast(InvalidationMessage::delete(full_key)).await;
        Ok(value)
    }

    /// Apply an invalidation received from the bus: delete the key from
    /// tier-2 and evict it from tier-1.
    ///
    /// Returns `false` when the message is this process's own broadcast
    /// coming back, which is skipped.
    pub async fn apply_invalidation(&self, message: &InvalidationMessage) -> bool {
        if self.inner.echoes.take(message) {
            tracing::trace!(message = %message, "Skipping own invalidation");
            return false;
        }

        self.inner.shared_delete(&message.full_key).await;
        self.inner.local.invalidate(&message.full_key).await;
        CacheMetrics::record_invalidation();
        tracing::debug!(message = %message, "Invalidation applied");
        true
    }

    /// Start over after a gap in invalidation delivery.
    ///
    /// Broadcasts published while no subscription was open are lost, so
    /// tier-1 is flushed. Remembered own broadcasts are forgotten: their
    /// echoes may never arrive, and a stale token would swallow the next
    /// foreign message for the same key.
    pub fn resync(&self) {
        self.inner.echoes.clear();
        self.inner.local.invalidate_all();
        let count = self.inner.resyncs.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::info!(resyncs = count, "Tier-1 flushed after invalidation resubscribe");
    }

    /// How many times [`resync`](Self::resync) has run.
    #[must_use]
    pub fn resyncs(&self) -> u64 {
        self.inner.resyncs.load(Ordering::SeqCst)
    }

    /// JSON form of `value` if the spec allows caching it.
    fn cacheable<T: Serialize>(&self, spec: &CacheSpec, key: &str, value: &T) -> Option<String> {
        match serde_json::to_value(value) {
            Ok(encoded) if encoded.is_null() && !spec.cache_null => None,
            Ok(encoded) => Some(encoded.to_string()),
            Err(e) => {
                self.inner
                    .swallow("encode", key, &CacheError::Serialization(e.to_string()));
                None
            },
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Test code can use unwrap
mod tests {
    use super::*;
    use fleet_sync_core::unit_of_work::UnitOfWork;
    use fleet_sync_testing::cache::{InMemoryInvalidationBus, InMemorySharedCache};
    use std::convert::Infallible;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fixture {
        coordinator: CacheCoordinator,
        shared: Arc<InMemorySharedCache>,
        bus: Arc<InMemoryInvalidationBus>,
    }

    fn fixture() -> Fixture {
        let shared = Arc::new(InMemorySharedCache::new());
        let bus = Arc::new(InMemoryInvalidationBus::new());
        let coordinator = CacheCoordinator::new(
            Arc::clone(&shared) as Arc<dyn SharedCache>,
            Arc::clone(&bus) as Arc<dyn InvalidationBus>,
            CacheConfig::default().with_breaker(2, Duration::from_secs(60)),
        );
        Fixture {
            coordinator,
            shared,
            bus,
        }
    }

    fn spec() -> CacheSpec {
        CacheSpec::parse("stock:", "{productId}").unwrap()
    }

    fn ctx(id: i64) -> KeyContext {
        KeyContext::new().with_arg("productId", id)
    }

    #[tokio::test]
    async fn read_populates_both_tiers_on_miss() {
        let f = fixture();
        let calls = AtomicUsize::new(0);

        for _ in 0..3 {
            let value: i64 = f
                .coordinator
                .read(&spec(), &ctx(1), || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, Infallible>(10)
                })
                .await
                .unwrap();
            assert_eq!(value, 10);
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(f.shared.value("stock:1").as_deref(), Some("10"));
        assert!(f.coordinator.local().contains("stock:1"));
    }

    #[tokio::test]
    async fn read_uses_shared_tier_and_fills_local() {
        let f = fixture();
        f.shared.insert("stock:2", "7");

        let value: i64 = f
            .coordinator
            .read(&spec(), &ctx(2), || async { Ok::<_, Infallible>(99) })
            .await
            .unwrap();

        assert_eq!(value, 7);
        assert!(f.coordinator.local().contains("stock:2"));
    }

    #[tokio::test]
    async fn null_results_are_cached_only_when_allowed() {
        let f = fixture();

        let value: Option<i64> = f
            .coordinator
            .read(&spec(), &ctx(3), || async { Ok::<_, Infallible>(None) })
            .await
            .unwrap();
        assert_eq!(value, None);
        assert_eq!(f.shared.value("stock:3"), None);

        let allow_null = spec().with_cache_null(true);
        let _: Option<i64> = f
            .coordinator
            .read(&allow_null, &ctx(3), || async { Ok::<_, Infallible>(None) })
            .await
            .unwrap();
        assert_eq!(f.shared.value("stock:3").as_deref(), Some("null"));
    }

    #[tokio::test]
    async fn write_is_deferred_until_commit() {
        let f = fixture();
        let uow = UnitOfWork::begin();

        let value: i64 = f
            .coordinator
            .write(&spec(), &ctx(4), &uow, || async { Ok::<_, Infallible>(5) })
            .await
            .unwrap();
        assert_eq!(value, 5);
        assert_eq!(f.shared.value("stock:4"), None);
        assert!(f.bus.published().is_empty());

        uow.commit().await.unwrap();

        assert_eq!(f.shared.value("stock:4").as_deref(), Some("5"));
        assert!(f.coordinator.local().contains("stock:4"));
        assert_eq!(f.bus.published(), vec!["WRITE stock:4".to_string()]);
    }

    #[tokio::test]
    async fn write_is_discarded_on_rollback() {
        let f = fixture();
        let uow = UnitOfWork::begin();

        let _: i64 = f
            .coordinator
            .write(&spec(), &ctx(5), &uow, || async { Ok::<_, Infallible>(5) })
            .await
            .unwrap();
        uow.rollback().await.unwrap();

        assert_eq!(f.shared.value("stock:5"), None);
        assert!(!f.coordinator.local().contains("stock:5"));
        assert!(f.bus.published().is_empty());
    }

    #[tokio::test]
    async fn write_without_unit_of_work_is_immediate() {
        let f = fixture();

        let _: i64 = f
            .coordinator
            .write(&spec(), &ctx(6), &UnitOfWork::none(), || async {
                Ok::<_, Infallible>(6)
            })
            .await
            .unwrap();

        assert_eq!(f.shared.value("stock:6").as_deref(), Some("6"));
        assert_eq!(f.bus.published(), vec!["WRITE stock:6".to_string()]);
    }

    #[tokio::test]
    async fn write_key_can_reference_result() {
        #[derive(Serialize)]
        struct Order {
            id: String,
            total: u32,
        }

        let f = fixture();
        let spec = CacheSpec::parse("order:", "{result.id}").unwrap();

        let _: Order = f
            .coordinator
            .write(&spec, &KeyContext::new(), &UnitOfWork::none(), || async {
                Ok::<_, Infallible>(Order {
                    id: "O1".to_string(),
                    total: 10,
                })
            })
            .await
            .unwrap();

        assert_eq!(
            f.shared.value("order:O1").as_deref(),
            Some(r#"{"id":"O1","total":10}"#)
        );
    }

    #[tokio::test]
    async fn failed_operation_caches_nothing() {
        let f = fixture();

        let outcome: Result<i64, _> = f
            .coordinator
            .write(&spec(), &ctx(7), &UnitOfWork::none(), || async {
                Err::<i64, _>("boom")
            })
            .await;

        assert!(matches!(outcome, Err(CachedCallError::Operation("boom"))));
        assert_eq!(f.shared.value("stock:7"), None);
    }

    #[tokio::test]
    async fn invalid_key_is_surfaced_before_the_operation() {
        let f = fixture();
        let ran = AtomicUsize::new(0);

        let outcome: Result<i64, CachedCallError<Infallible>> = f
            .coordinator
            .read(&spec(), &KeyContext::new(), || async {
                ran.fetch_add(1, Ordering::SeqCst);
                Ok(1)
            })
            .await;

        assert!(matches!(
            outcome,
            Err(CachedCallError::InvalidKey(KeyError::MissingArgument(_)))
        ));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn evict_clears_both_tiers_and_broadcasts() {
        let f = fixture();
        let _: i64 = f
            .coordinator
            .read(&spec(), &ctx(8), || async { Ok::<_, Infallible>(1) })
            .await
            .unwrap();

        f.coordinator
            .evict(&spec(), &ctx(8), || async { Ok::<_, Infallible>(()) })
            .await
            .unwrap();

        assert_eq!(f.shared.value("stock:8"), None);
        assert!(!f.coordinator.local().contains("stock:8"));
        assert_eq!(f.bus.published(), vec!["DELETE stock:8".to_string()]);
    }

    #[tokio::test]
    async fn shared_tier_failures_degrade_to_misses() {
        let f = fixture();
        f.shared.fail_all(true);

        let value: i64 = f
            .coordinator
            .read(&spec(), &ctx(9), || async { Ok::<_, Infallible>(3) })
            .await
            .unwrap();
        assert_eq!(value, 3);

        // Tier-1 still works
        assert!(f.coordinator.local().contains("stock:9"));

        // The failed get and set reached the threshold of 2
        let _: i64 = f
            .coordinator
            .read(&spec(), &ctx(10), || async { Ok::<_, Infallible>(4) })
            .await
            .unwrap();
        assert_eq!(f.coordinator.breaker_state(), State::Open);
    }

    #[tokio::test]
    async fn own_broadcasts_are_not_applied_but_foreign_ones_are() {
        let f = fixture();
        let _: i64 = f
            .coordinator
            .write(&spec(), &ctx(11), &UnitOfWork::none(), || async {
                Ok::<_, Infallible>(11)
            })
            .await
            .unwrap();

        // Our own echo leaves the fresh entry alone
        let echo = InvalidationMessage::write("stock:11");
        assert!(!f.coordinator.apply_invalidation(&echo).await);
        assert!(f.coordinator.local().contains("stock:11"));

        // The same message from another writer evicts
        assert!(f.coordinator.apply_invalidation(&echo).await);
        assert!(!f.coordinator.local().contains("stock:11"));
        assert_eq!(f.shared.value("stock:11"), None);

        // Absent keys are a no-op
        assert!(
            f.coordinator
                .apply_invalidation(&InvalidationMessage::delete("stock:404"))
                .await
        );
    }

    #[tokio::test(start_paused = true)]
    async fn unreturned_echo_expires_before_a_foreign_write_arrives() {
        let f = fixture();
        assert!(f.coordinator.config().echo_window() <= Duration::from_secs(2));

        let _: i64 = f
            .coordinator
            .write(&spec(), &ctx(13), &UnitOfWork::none(), || async {
                Ok::<_, Infallible>(13)
            })
            .await
            .unwrap();

        // Our echo was lost; another process writes the same key later
        let window = f.coordinator.config().echo_window();
        tokio::time::advance(window + Duration::from_millis(1)).await;
        let foreign = InvalidationMessage::write("stock:13");
        assert!(f.coordinator.apply_invalidation(&foreign).await);
        assert!(!f.coordinator.local().contains("stock:13"));
    }

    #[tokio::test]
    async fn resync_forgets_own_broadcasts_and_flushes_local_tier() {
        let f = fixture();
        let _: i64 = f
            .coordinator
            .write(&spec(), &ctx(14), &UnitOfWork::none(), || async {
                Ok::<_, Infallible>(14)
            })
            .await
            .unwrap();
        let _: i64 = f
            .coordinator
            .read(&spec(), &ctx(15), || async { Ok::<_, Infallible>(15) })
            .await
            .unwrap();

        f.coordinator.resync();
        assert_eq!(f.coordinator.resyncs(), 1);
        assert!(!f.coordinator.local().contains("stock:14"));
        assert!(!f.coordinator.local().contains("stock:15"));
        assert_eq!(f.shared.value("stock:15").as_deref(), Some("15"));

        // A foreign write of the same key is no longer mistaken for our echo
        f.coordinator.local().insert("stock:14".to_string(), "14".to_string()).await;
        let foreign = InvalidationMessage::write("stock:14");
        assert!(f.coordinator.apply_invalidation(&foreign).await);
        assert!(!f.coordinator.local().contains("stock:14"));
    }

    #[tokio::test]
    async fn zero_ttl_falls_back_to_default() {
        let f = fixture();
        let _: i64 = f
            .coordinator
            .read(&spec().with_ttl(Duration::ZERO), &ctx(12), || async {
                Ok::<_, Infallible>(1)
            })
            .await
            .unwrap();

        assert_eq!(f.shared.ttl("stock:12"), Some(f.coordinator.config().default_ttl()));
    }

    proptest::proptest! {
        #[test]
        fn full_key_is_prefix_then_resolved_key(
            id in fleet_sync_testing::properties::key_argument()
        ) {
            let ctx = KeyContext::new().with_arg("productId", id.clone());
            proptest::prop_assert_eq!(spec().full_key(&ctx).unwrap(), format!("stock:{id}"));
        }
    }
}
