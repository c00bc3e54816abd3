//! In-memory shared cache tier and invalidation bus.
//!
//! - [`InMemorySharedCache`]: `HashMap`-backed tier-2 store with TTLs and
//!   failure injection
//! - [`InMemoryInvalidationBus`]: `tokio::sync::broadcast` pub/sub that can
//!   drop all subscriptions at once, to exercise re-subscription
//!
//! Several coordinators sharing one cache and one bus behave like several
//! processes sharing a Redis instance.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Test utilities document panics where critical

use fleet_sync_core::cache::{CacheError, InvalidationBus, InvalidationMessage, PayloadStream, SharedCache};
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    ttl: Option<Duration>,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self) -> bool {
        self.expires_at.is_none_or(|at| Instant::now() < at)
    }
}

/// In-memory tier-2 store.
///
/// # Example
///
/// ```
/// use fleet_sync_testing::cache::InMemorySharedCache;
/// use fleet_sync_core::cache::SharedCache;
/// use std::time::Duration;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let cache = InMemorySharedCache::new();
/// cache.set("stock:1", "10", Duration::from_secs(60)).await?;
/// assert_eq!(cache.value("stock:1").as_deref(), Some("10"));
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug, Default)]
pub struct InMemorySharedCache {
    entries: Arc<RwLock<HashMap<String, Entry>>>,
    failing: Arc<AtomicBool>,
}

impl InMemorySharedCache {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a value without a TTL.
    pub fn insert(&self, key: &str, value: &str) {
        self.entries.write().unwrap().insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                ttl: None,
                expires_at: None,
            },
        );
    }

    /// Live value under `key`, bypassing failure injection.
    #[must_use]
    pub fn value(&self, key: &str) -> Option<String> {
        self.entries
            .read()
            .unwrap()
            .get(key)
            .filter(|entry| entry.is_live())
            .map(|entry| entry.value.clone())
    }

    /// TTL the live value under `key` was written with.
    #[must_use]
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        self.entries
            .read()
            .unwrap()
            .get(key)
            .filter(|entry| entry.is_live())
            .and_then(|entry| entry.ttl)
    }

    /// Make every trait call fail with [`CacheError::Unavailable`] (or stop).
    pub fn fail_all(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of live entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap()
            .values()
            .filter(|entry| entry.is_live())
            .count()
    }

    /// Whether there are no live entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check(&self) -> Result<(), CacheError> {
        if self.failing.load(Ordering::SeqCst) {
            Err(CacheError::Unavailable("injected failure".to_string()))
        } else {
            Ok(())
        }
    }
}

impl SharedCache for InMemorySharedCache {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<String>, CacheError>> {
        Box::pin(async move {
            self.check()?;
            Ok(self.value(key))
        })
    }

    fn set<'a>(
        &'a self,
        key: &'a str,
        value: &'a str,
        ttl: Duration,
    ) -> BoxFuture<'a, Result<(), CacheError>> {
        Box::pin(async move {
            self.check()?;
            self.entries.write().unwrap().insert(
                key.to_string(),
                Entry {
                    value: value.to_string(),
                    ttl: Some(ttl),
                    expires_at: Some(Instant::now() + ttl),
                },
            );
            Ok(())
        })
    }

    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<(), CacheError>> {
        Box::pin(async move {
            self.check()?;
            self.entries.write().unwrap().remove(key);
            Ok(())
        })
    }
}

/// In-memory invalidation channel.
///
/// Every [`subscribe`](InvalidationBus::subscribe) gets its own receiver;
/// [`disconnect_all`](Self::disconnect_all) ends every open subscription
/// stream, like a dropped Redis connection.
#[derive(Clone, Debug)]
pub struct InMemoryInvalidationBus {
    sender: Arc<Mutex<broadcast::Sender<Result<String, CacheError>>>>,
    published: Arc<Mutex<Vec<String>>>,
    subscriptions: Arc<AtomicUsize>,
    failing: Arc<AtomicBool>,
}

impl InMemoryInvalidationBus {
    const CAPACITY: usize = 1024;

    /// Create a bus with no subscribers.
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(Self::CAPACITY);
        Self {
            sender: Arc::new(Mutex::new(sender)),
            published: Arc::new(Mutex::new(Vec::new())),
            subscriptions: Arc::new(AtomicUsize::new(0)),
            failing: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Payloads published through the trait, oldest first.
    #[must_use]
    pub fn published(&self) -> Vec<String> {
        self.published.lock().unwrap().clone()
    }

    /// Deliver a raw payload to subscribers without recording it, as if
    /// another process had published it.
    pub fn send_raw(&self, payload: &str) {
        // No subscribers is fine.
        let _ = self.sender.lock().unwrap().send(Ok(payload.to_string()));
    }

    /// Deliver a payload that cannot be decoded as text, like a non-UTF-8
    /// Redis message.
    pub fn send_undecodable(&self) {
        let error = CacheError::Serialization("invalid utf-8 in payload".to_string());
        let _ = self.sender.lock().unwrap().send(Err(error));
    }

    /// Number of successful [`subscribe`](InvalidationBus::subscribe) calls so far.
    #[must_use]
    pub fn subscriptions(&self) -> usize {
        self.subscriptions.load(Ordering::SeqCst)
    }

    /// Number of open subscriptions.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.lock().unwrap().receiver_count()
    }

    /// End every open subscription stream.
    pub fn disconnect_all(&self) {
        let (sender, _) = broadcast::channel(Self::CAPACITY);
        *self.sender.lock().unwrap() = sender;
    }

    /// Make publish and subscribe fail (or stop).
    pub fn fail_all(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), CacheError> {
        if self.failing.load(Ordering::SeqCst) {
            Err(CacheError::Unavailable("injected failure".to_string()))
        } else {
            Ok(())
        }
    }
}

impl Default for InMemoryInvalidationBus {
    fn default() -> Self {
        Self::new()
    }
}

impl InvalidationBus for InMemoryInvalidationBus {
    fn publish<'a>(&'a self, message: &'a InvalidationMessage) -> BoxFuture<'a, Result<(), CacheError>> {
        Box::pin(async move {
            self.check()?;
            let payload = message.to_string();
            self.published.lock().unwrap().push(payload.clone());
            let _ = self.sender.lock().unwrap().send(Ok(payload));
            Ok(())
        })
    }

    fn subscribe(&self) -> BoxFuture<'_, Result<PayloadStream, CacheError>> {
        Box::pin(async move {
            self.check()?;
            let mut receiver = self.sender.lock().unwrap().subscribe();
            self.subscriptions.fetch_add(1, Ordering::SeqCst);
            let stream = async_stream::stream! {
                loop {
                    match receiver.recv().await {
                        Ok(item) => yield item,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "Invalidation subscriber lagged");
                        },
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            };
            Ok(Box::pin(stream) as PayloadStream)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_their_ttl() {
        let cache = InMemorySharedCache::new();
        cache.set("k", "v", Duration::from_secs(1)).await.unwrap();
        assert_eq!(cache.ttl("k"), Some(Duration::from_secs(1)));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(cache.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn failure_injection_affects_trait_calls_only() {
        let cache = InMemorySharedCache::new();
        cache.insert("k", "v");
        cache.fail_all(true);

        assert!(cache.get("k").await.is_err());
        assert_eq!(cache.value("k").as_deref(), Some("v"));
    }

    #[tokio::test]
    async fn subscribers_see_published_and_raw_payloads() {
        let bus = InMemoryInvalidationBus::new();
        let mut stream = bus.subscribe().await.unwrap();
        assert_eq!(bus.subscriber_count(), 1);

        bus.publish(&InvalidationMessage::delete("stock:1")).await.unwrap();
        bus.send_raw("garbage");

        assert_eq!(stream.next().await.unwrap().unwrap(), "DELETE stock:1");
        assert_eq!(stream.next().await.unwrap().unwrap(), "garbage");
        assert_eq!(bus.published(), vec!["DELETE stock:1".to_string()]);
        assert_eq!(bus.subscriptions(), 1);
    }

    #[tokio::test]
    async fn undecodable_payloads_arrive_as_serialization_errors() {
        let bus = InMemoryInvalidationBus::new();
        let mut stream = bus.subscribe().await.unwrap();

        bus.send_undecodable();
        bus.send_raw("WRITE stock:1");

        assert!(matches!(
            stream.next().await.unwrap(),
            Err(CacheError::Serialization(_))
        ));
        assert_eq!(stream.next().await.unwrap().unwrap(), "WRITE stock:1");
    }

    #[tokio::test]
    async fn disconnect_ends_open_streams() {
        let bus = InMemoryInvalidationBus::new();
        let mut stream = bus.subscribe().await.unwrap();

        bus.disconnect_all();
        assert!(stream.next().await.is_none());
        assert_eq!(bus.subscriber_count(), 0);
    }
}
