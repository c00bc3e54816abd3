//! Shared cache tier and invalidation bus on Redis.

use fleet_sync_core::cache::{
    CacheError, INVALIDATION_CHANNEL, InvalidationBus, InvalidationMessage, PayloadStream,
    SharedCache,
};
use futures::StreamExt;
use futures::future::BoxFuture;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use std::time::Duration;

fn unavailable(command: &str, error: &redis::RedisError) -> CacheError {
    CacheError::Unavailable(format!("Redis {command} failed: {error}"))
}

/// Tier-2 cache backed by Redis strings.
///
/// Each process holds a clone; clones share one multiplexed connection.
#[derive(Clone)]
pub struct RedisSharedCache {
    conn: ConnectionManager,
}

impl RedisSharedCache {
    /// Connect to `url`.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Unavailable`] if Redis cannot be reached.
    pub async fn new(url: &str) -> Result<Self, CacheError> {
        let (_, conn) = crate::connect(url).await?;
        Ok(Self::from_manager(conn))
    }

    /// Wrap an existing connection manager.
    #[must_use]
    pub const fn from_manager(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

impl SharedCache for RedisSharedCache {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<String>, CacheError>> {
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let value: Option<String> = conn.get(key).await.map_err(|e| unavailable("GET", &e))?;
            Ok(value)
        })
    }

    fn set<'a>(
        &'a self,
        key: &'a str,
        value: &'a str,
        ttl: Duration,
    ) -> BoxFuture<'a, Result<(), CacheError>> {
        Box::pin(async move {
            let mut conn = self.conn.clone();
            // PX rejects zero
            let millis = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
            let _: () = conn
                .pset_ex(key, value, millis)
                .await
                .map_err(|e| unavailable("SET", &e))?;
            Ok(())
        })
    }

    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<(), CacheError>> {
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let _: () = conn.del(key).await.map_err(|e| unavailable("DEL", &e))?;
            Ok(())
        })
    }
}

/// Invalidation bus over Redis pub/sub.
///
/// Publishing goes through the shared connection manager. Every
/// subscription opens its own dedicated connection, since a connection in
/// subscriber mode cannot issue other commands.
#[derive(Clone)]
pub struct RedisInvalidationBus {
    client: Client,
    conn: ConnectionManager,
    channel: String,
}

impl RedisInvalidationBus {
    /// Connect to `url`, using [`INVALIDATION_CHANNEL`].
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Unavailable`] if Redis cannot be reached.
    pub async fn new(url: &str) -> Result<Self, CacheError> {
        let (client, conn) = crate::connect(url).await?;
        Ok(Self::from_parts(client, conn))
    }

    /// Build from an existing client and connection manager.
    #[must_use]
    pub fn from_parts(client: Client, conn: ConnectionManager) -> Self {
        Self {
            client,
            conn,
            channel: INVALIDATION_CHANNEL.to_string(),
        }
    }

    /// Use a different channel name.
    ///
    /// Only processes on the same channel see each other's messages.
    #[must_use]
    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = channel.into();
        self
    }

    /// The channel this bus publishes to and subscribes on.
    #[must_use]
    pub fn channel(&self) -> &str {
        &self.channel
    }
}

impl InvalidationBus for RedisInvalidationBus {
    fn publish<'a>(
        &'a self,
        message: &'a InvalidationMessage,
    ) -> BoxFuture<'a, Result<(), CacheError>> {
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let receivers: i64 = conn
                .publish(&self.channel, message.to_string())
                .await
                .map_err(|e| unavailable("PUBLISH", &e))?;

            tracing::trace!(
                channel = %self.channel,
                message = %message,
                receivers = receivers,
                "Published invalidation"
            );
            Ok(())
        })
    }

    fn subscribe(&self) -> BoxFuture<'_, Result<PayloadStream, CacheError>> {
        Box::pin(async move {
            let mut pubsub = self
                .client
                .get_async_pubsub()
                .await
                .map_err(|e| unavailable("SUBSCRIBE connect", &e))?;
            pubsub
                .subscribe(&self.channel)
                .await
                .map_err(|e| unavailable("SUBSCRIBE", &e))?;

            tracing::debug!(channel = %self.channel, "Subscribed to invalidation channel");

            let stream = pubsub.into_on_message().map(|msg| {
                msg.get_payload::<String>().map_err(|e| {
                    CacheError::Serialization(format!("Invalid invalidation payload: {e}"))
                })
            });
            Ok(Box::pin(stream) as PayloadStream)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REDIS_URL: &str = "redis://127.0.0.1:6379";

    #[tokio::test]
    #[ignore] // Requires Redis running
    #[allow(clippy::unwrap_used)]
    async fn values_round_trip_and_expire() {
        let cache = RedisSharedCache::new(REDIS_URL).await.unwrap();

        cache
            .set("fleet-sync:test:expire", "42", Duration::from_millis(200))
            .await
            .unwrap();
        assert_eq!(
            cache.get("fleet-sync:test:expire").await.unwrap().as_deref(),
            Some("42")
        );

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(cache.get("fleet-sync:test:expire").await.unwrap(), None);
    }

    #[tokio::test]
    #[ignore] // Requires Redis running
    #[allow(clippy::unwrap_used)]
    async fn deleting_an_absent_key_succeeds() {
        let cache = RedisSharedCache::new(REDIS_URL).await.unwrap();

        cache.delete("fleet-sync:test:absent").await.unwrap();
        cache
            .set("fleet-sync:test:present", "1", Duration::from_secs(5))
            .await
            .unwrap();
        cache.delete("fleet-sync:test:present").await.unwrap();
        assert_eq!(cache.get("fleet-sync:test:present").await.unwrap(), None);
    }

    #[tokio::test]
    #[ignore] // Requires Redis running
    #[allow(clippy::unwrap_used)]
    async fn subscribers_receive_published_messages() {
        let bus = RedisInvalidationBus::new(REDIS_URL)
            .await
            .unwrap()
            .with_channel("fleet-sync-test");
        let mut stream = bus.subscribe().await.unwrap();

        bus.publish(&InvalidationMessage::write("stock:1"))
            .await
            .unwrap();

        let payload = tokio::time::timeout(Duration::from_secs(2), stream.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(payload, "WRITE stock:1");
    }
}
