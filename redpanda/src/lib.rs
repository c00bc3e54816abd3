//! Redpanda message broker for Fleet Sync.
//!
//! [`RedpandaBroker`] implements [`MessageBroker`] on top of rdkafka, so it
//! works against Redpanda or any other Kafka-compatible cluster. The outbox
//! publisher sends through it; consumers subscribe through it.
//!
//! # Messages
//!
//! - **Key**: the aggregate id. Every event of one aggregate lands on the
//!   same partition, which is what keeps per-aggregate order end to end.
//! - **Value**: the JSON [`EventEnvelope`]
//!   (`{"eventType": ..., "payload": ...}`).
//!
//! # Delivery Semantics
//!
//! **At-least-once** on both sides:
//! - `send` resolves only once the broker acknowledged the message; the
//!   outbox marks a record published only after that
//! - the consumer commits an offset only AFTER the message was handed to the
//!   subscriber's channel; a crash before the commit means redelivery
//! - consumers therefore deduplicate (see the runtime's idempotent consumer)
//!
//! # Example
//!
//! ```no_run
//! use fleet_sync_redpanda::RedpandaBroker;
//! use fleet_sync_core::broker::{EventEnvelope, MessageBroker};
//! use futures::StreamExt;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let broker = RedpandaBroker::new("localhost:9092")?;
//!
//! let envelope = EventEnvelope::new("OrderCreated", serde_json::json!({"orderId": "O1"}));
//! let ack = broker.send("order-events", "O1", &envelope).await?;
//!
//! let mut stream = broker.subscribe(&["order-events"]).await?;
//! while let Some(received) = stream.next().await {
//!     let received = received?;
//!     println!("{:?} {}", received.key, received.envelope.event_type);
//! }
//! # Ok(())
//! # }
//! ```

use fleet_sync_core::broker::{
    BrokerAck, BrokerError, EnvelopeStream, EventEnvelope, MessageBroker, ReceivedEnvelope,
};
use fleet_sync_runtime::RedpandaConfig;
use futures::future::BoxFuture;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::message::{BorrowedMessage, Message};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::types::RDKafkaErrorCode;
use rdkafka::util::Timeout;
use std::time::Duration;

const DEFAULT_ACKS: &str = "all";
const DEFAULT_COMPRESSION: &str = "none";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_BUFFER_SIZE: usize = 1000;
const DEFAULT_OFFSET_RESET: &str = "earliest";

/// Kafka-compatible [`MessageBroker`].
///
/// # Configuration
///
/// - **Brokers**: bootstrap servers (required)
/// - **Producer**: acks (default `"all"`), compression, delivery timeout
/// - **Consumer**: group id, buffer size, offset reset (default `"earliest"`,
///   so a new group sees events staged before it first subscribed)
///
/// # Example
///
/// ```no_run
/// use fleet_sync_redpanda::RedpandaBroker;
/// use std::time::Duration;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let broker = RedpandaBroker::builder()
///     .brokers("localhost:9092,localhost:9093")
///     .producer_acks("all")
///     .compression("lz4")
///     .timeout(Duration::from_secs(10))
///     .consumer_group("stock-service")
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct RedpandaBroker {
    producer: FutureProducer,
    brokers: String,
    timeout: Duration,
    consumer_group: Option<String>,
    buffer_size: usize,
    auto_offset_reset: String,
}

impl RedpandaBroker {
    /// Create a broker with default settings.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::ConnectionFailed`] if the producer cannot be
    /// created.
    pub fn new(brokers: &str) -> Result<Self, BrokerError> {
        Self::builder().brokers(brokers).build()
    }

    /// Create a broker from service configuration.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::ConnectionFailed`] if the producer cannot be
    /// created.
    pub fn from_config(config: &RedpandaConfig) -> Result<Self, BrokerError> {
        Self::builder()
            .brokers(&config.brokers)
            .consumer_group(&config.consumer_group)
            .build()
    }

    /// Start configuring a broker.
    #[must_use]
    pub fn builder() -> RedpandaBrokerBuilder {
        RedpandaBrokerBuilder::default()
    }

    /// Bootstrap servers.
    #[must_use]
    pub fn brokers(&self) -> &str {
        &self.brokers
    }

    /// Consumer group used by [`MessageBroker::subscribe`] for `topics`.
    ///
    /// Without an explicit group, one is derived from the sorted topic list.
    #[must_use]
    pub fn group_for(&self, topics: &[String]) -> String {
        self.consumer_group.clone().unwrap_or_else(|| {
            let mut sorted = topics.to_vec();
            sorted.sort();
            format!("fleet-sync-{}", sorted.join("-"))
        })
    }

    fn create_consumer(
        &self,
        group: &str,
        topics: &[String],
    ) -> Result<StreamConsumer, BrokerError> {
        let subscription_failed = |reason: String| BrokerError::SubscriptionFailed {
            topics: topics.to_vec(),
            reason,
        };

        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &self.brokers)
            .set("group.id", group)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", &self.auto_offset_reset)
            .set("session.timeout.ms", "6000")
            .set("enable.partition.eof", "false")
            .create()
            .map_err(|e| subscription_failed(format!("Failed to create consumer: {e}")))?;

        let topic_refs: Vec<&str> = topics.iter().map(String::as_str).collect();
        consumer
            .subscribe(&topic_refs)
            .map_err(|e| subscription_failed(format!("Failed to subscribe to topics: {e}")))?;

        Ok(consumer)
    }
}

/// Decode one consumed message.
fn decode(message: &BorrowedMessage<'_>) -> Result<ReceivedEnvelope, BrokerError> {
    let payload = message
        .payload()
        .ok_or_else(|| BrokerError::DeserializationFailed("Message has no payload".to_string()))?;
    let envelope = EventEnvelope::from_bytes(payload)?;
    let key = message
        .key()
        .map(|key| String::from_utf8_lossy(key).into_owned());

    Ok(ReceivedEnvelope {
        topic: message.topic().to_string(),
        key,
        envelope,
    })
}

fn send_error(topic: &str, timeout: Duration, error: &KafkaError) -> BrokerError {
    match error {
        KafkaError::MessageProduction(RDKafkaErrorCode::MessageTimedOut) => BrokerError::Timeout {
            topic: topic.to_string(),
            timeout,
        },
        other => BrokerError::SendFailed {
            topic: topic.to_string(),
            reason: other.to_string(),
        },
    }
}

/// Builder for a [`RedpandaBroker`].
#[derive(Default)]
pub struct RedpandaBrokerBuilder {
    brokers: Option<String>,
    producer_acks: Option<String>,
    compression: Option<String>,
    timeout: Option<Duration>,
    consumer_group: Option<String>,
    buffer_size: Option<usize>,
    auto_offset_reset: Option<String>,
}

impl RedpandaBrokerBuilder {
    /// Comma-separated bootstrap servers, e.g. `"localhost:9092"`.
    #[must_use]
    pub fn brokers(mut self, brokers: impl Into<String>) -> Self {
        self.brokers = Some(brokers.into());
        self
    }

    /// Producer acknowledgement mode: `"0"`, `"1"` or `"all"`.
    ///
    /// Default: `"all"`. Anything weaker lets a record be marked published
    /// before it is replicated.
    #[must_use]
    pub fn producer_acks(mut self, acks: impl Into<String>) -> Self {
        self.producer_acks = Some(acks.into());
        self
    }

    /// Compression codec: `"none"`, `"gzip"`, `"snappy"`, `"lz4"`, `"zstd"`.
    #[must_use]
    pub fn compression(mut self, compression: impl Into<String>) -> Self {
        self.compression = Some(compression.into());
        self
    }

    /// Delivery timeout for one send (default 5 seconds).
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Consumer group for subscriptions.
    ///
    /// Processes sharing a group split the partitions between them.
    #[must_use]
    pub fn consumer_group(mut self, consumer_group: impl Into<String>) -> Self {
        self.consumer_group = Some(consumer_group.into());
        self
    }

    /// Messages buffered between the consumer and the subscriber
    /// (default 1000, minimum 1).
    #[must_use]
    pub fn buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = Some(buffer_size.max(1));
        self
    }

    /// Where a new consumer group starts: `"earliest"`, `"latest"` or `"error"`.
    #[must_use]
    pub fn auto_offset_reset(mut self, policy: impl Into<String>) -> Self {
        self.auto_offset_reset = Some(policy.into());
        self
    }

    /// Create the producer and the broker.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::ConnectionFailed`] if no brokers were given or
    /// the producer configuration is rejected.
    pub fn build(self) -> Result<RedpandaBroker, BrokerError> {
        let brokers = self
            .brokers
            .ok_or_else(|| BrokerError::ConnectionFailed("Brokers not configured".to_string()))?;
        let timeout = self.timeout.unwrap_or(DEFAULT_TIMEOUT);
        let acks = self.producer_acks.as_deref().unwrap_or(DEFAULT_ACKS);
        let compression = self.compression.as_deref().unwrap_or(DEFAULT_COMPRESSION);

        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &brokers)
            .set("message.timeout.ms", timeout.as_millis().to_string())
            .set("acks", acks)
            .set("compression.type", compression)
            .create()
            .map_err(|e| {
                BrokerError::ConnectionFailed(format!("Failed to create producer: {e}"))
            })?;

        let buffer_size = self.buffer_size.unwrap_or(DEFAULT_BUFFER_SIZE);
        let auto_offset_reset = self
            .auto_offset_reset
            .unwrap_or_else(|| DEFAULT_OFFSET_RESET.to_string());

        tracing::info!(
            brokers = %brokers,
            acks = acks,
            compression = compression,
            buffer_size = buffer_size,
            auto_offset_reset = %auto_offset_reset,
            "Redpanda broker created"
        );

        Ok(RedpandaBroker {
            producer,
            brokers,
            timeout,
            consumer_group: self.consumer_group,
            buffer_size,
            auto_offset_reset,
        })
    }
}

impl MessageBroker for RedpandaBroker {
    fn send<'a>(
        &'a self,
        topic: &'a str,
        key: &'a str,
        envelope: &'a EventEnvelope,
    ) -> BoxFuture<'a, Result<BrokerAck, BrokerError>> {
        Box::pin(async move {
            let value = envelope.to_bytes()?;
            let record = FutureRecord::to(topic).key(key).payload(&value);

            match self.producer.send(record, Timeout::After(self.timeout)).await {
                Ok((partition, offset)) => {
                    tracing::debug!(
                        topic = %topic,
                        key = %key,
                        partition = partition,
                        offset = offset,
                        event_type = %envelope.event_type,
                        "Message acknowledged"
                    );
                    Ok(BrokerAck { partition, offset })
                },
                Err((kafka_error, _)) => {
                    tracing::warn!(
                        topic = %topic,
                        key = %key,
                        error = %kafka_error,
                        "Message not acknowledged"
                    );
                    Err(send_error(topic, self.timeout, &kafka_error))
                },
            }
        })
    }

    fn subscribe(&self, topics: &[&str]) -> BoxFuture<'_, Result<EnvelopeStream, BrokerError>> {
        let topics: Vec<String> = topics.iter().map(ToString::to_string).collect();

        Box::pin(async move {
            let group = self.group_for(&topics);
            let consumer = self.create_consumer(&group, &topics)?;

            tracing::info!(
                topics = ?topics,
                consumer_group = %group,
                buffer_size = self.buffer_size,
                "Subscribed to topics"
            );

            let (tx, mut rx) = tokio::sync::mpsc::channel(self.buffer_size);

            // The task owns the consumer; it ends when the subscriber drops
            // the stream.
            tokio::spawn(async move {
                use futures::StreamExt;
                use rdkafka::consumer::CommitMode;

                let mut stream = consumer.stream();
                while let Some(next) = stream.next().await {
                    let message = match next {
                        Ok(message) => message,
                        Err(e) => {
                            let err = BrokerError::TransportError(format!(
                                "Failed to receive message: {e}"
                            ));
                            if tx.send(Err(err)).await.is_err() {
                                break;
                            }
                            continue;
                        },
                    };

                    let decoded = decode(&message);
                    if let Err(e) = &decoded {
                        tracing::warn!(
                            topic = message.topic(),
                            partition = message.partition(),
                            offset = message.offset(),
                            error = %e,
                            "Undecodable message"
                        );
                    }

                    // Receiver gone: exit WITHOUT committing
                    if tx.send(decoded).await.is_err() {
                        break;
                    }

                    // Commit only after hand-off
                    if let Err(e) = consumer.commit_message(&message, CommitMode::Async) {
                        tracing::warn!(
                            topic = message.topic(),
                            partition = message.partition(),
                            offset = message.offset(),
                            error = %e,
                            "Failed to commit offset (message may be redelivered)"
                        );
                    }
                }

                tracing::debug!("Consumer task exiting");
            });

            let stream = async_stream::stream! {
                while let Some(received) = rx.recv().await {
                    yield received;
                }
            };

            Ok(Box::pin(stream) as EnvelopeStream)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redpanda_broker_is_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<RedpandaBroker>();
        assert_sync::<RedpandaBroker>();
    }

    #[test]
    fn build_requires_brokers() {
        let result = RedpandaBroker::builder().build();
        assert!(matches!(result, Err(BrokerError::ConnectionFailed(_))));
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn consumer_group_defaults_to_sorted_topics() {
        // Creating a producer does not contact the cluster
        let broker = RedpandaBroker::new("localhost:9092").unwrap();
        let topics = vec!["stock-events".to_string(), "order-events".to_string()];
        assert_eq!(broker.group_for(&topics), "fleet-sync-order-events-stock-events");

        let broker = RedpandaBroker::from_config(&RedpandaConfig::default()).unwrap();
        assert_eq!(broker.group_for(&topics), "fleet-sync");
    }

    #[test]
    fn delivery_timeouts_map_to_timeout_errors() {
        let timeout = Duration::from_secs(1);
        let timed_out = KafkaError::MessageProduction(RDKafkaErrorCode::MessageTimedOut);
        assert!(matches!(
            send_error("t", timeout, &timed_out),
            BrokerError::Timeout { .. }
        ));

        let rejected = KafkaError::MessageProduction(RDKafkaErrorCode::MessageSizeTooLarge);
        assert!(matches!(
            send_error("t", timeout, &rejected),
            BrokerError::SendFailed { .. }
        ));
    }
}
