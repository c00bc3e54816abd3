//! Message broker abstraction used by the outbox publisher and by consumers.
//!
//! The outbox publisher hands each staged record to a [`MessageBroker`] as an
//! [`EventEnvelope`] and only marks the record published once
//! [`MessageBroker::send`] resolves, i.e. after the broker acknowledged it.
//!
//! # Wire format
//!
//! The message value is the JSON envelope
//!
//! ```json
//! { "eventType": "StockDecreased", "payload": { "productId": 42, "quantity": 7 } }
//! ```
//!
//! and the message key is the aggregate id, so every event of one aggregate
//! lands on the same partition and keeps its order.
//!
//! # Delivery
//!
//! - **At-least-once**: a record whose acknowledgement was lost is sent again
//!   on the next publisher tick
//! - **Idempotency**: consumers must tolerate duplicates (see the runtime's
//!   idempotent consumer helper)
//!
//! # Implementations
//!
//! - `MockBroker` in `fleet-sync-testing` for tests
//! - `RedpandaBroker` in `fleet-sync-redpanda` for production (Kafka-compatible)

use futures::Stream;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during broker operations.
#[derive(Error, Debug, Clone)]
pub enum BrokerError {
    /// Failed to connect to the broker
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// The broker rejected or failed to acknowledge a message
    #[error("Send failed for topic '{topic}': {reason}")]
    SendFailed {
        /// The topic that failed
        topic: String,
        /// The reason for failure
        reason: String,
    },

    /// No acknowledgement arrived in time
    #[error("Send to topic '{topic}' timed out after {timeout:?}")]
    Timeout {
        /// The topic that timed out
        topic: String,
        /// The timeout that elapsed
        timeout: Duration,
    },

    /// Failed to subscribe to topics
    #[error("Subscription failed for topics {topics:?}: {reason}")]
    SubscriptionFailed {
        /// The topics that failed to subscribe
        topics: Vec<String>,
        /// The reason for failure
        reason: String,
    },

    /// An envelope could not be encoded or decoded
    #[error("Envelope (de)serialization failed: {0}")]
    DeserializationFailed(String),

    /// Network or transport error
    #[error("Transport error: {0}")]
    TransportError(String),
}

/// Message value carried on the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    /// Event type name (e.g. `"OrderCreated"`)
    pub event_type: String,
    /// Event body as a JSON object
    pub payload: serde_json::Value,
}

impl EventEnvelope {
    /// Create an envelope.
    #[must_use]
    pub fn new(event_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
        }
    }

    /// Encode to the JSON bytes sent as the message value.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::DeserializationFailed`] if encoding fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>, BrokerError> {
        serde_json::to_vec(self).map_err(|e| BrokerError::DeserializationFailed(e.to_string()))
    }

    /// Decode a message value.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::DeserializationFailed`] if `bytes` is not a
    /// valid envelope.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, BrokerError> {
        serde_json::from_slice(bytes).map_err(|e| BrokerError::DeserializationFailed(e.to_string()))
    }
}

/// Acknowledgement returned once the broker has durably accepted a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BrokerAck {
    /// Partition the message was written to
    pub partition: i32,
    /// Offset within that partition
    pub offset: i64,
}

/// An envelope received from a subscription.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedEnvelope {
    /// Topic the message was read from
    pub topic: String,
    /// Message key (the aggregate id), if present
    pub key: Option<String>,
    /// Decoded message value
    pub envelope: EventEnvelope,
}

/// Stream of envelopes from subscriptions.
pub type EnvelopeStream = Pin<Box<dyn Stream<Item = Result<ReceivedEnvelope, BrokerError>> + Send>>;

/// Trait for broker clients.
///
/// # Dyn Compatibility
///
/// Methods return boxed futures so the publisher can hold an
/// `Arc<dyn MessageBroker>`.
pub trait MessageBroker: Send + Sync {
    /// Send `envelope` to `topic` under message key `key`.
    ///
    /// Resolves only after the broker acknowledged the message.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::SendFailed`] or [`BrokerError::Timeout`] if the
    /// message was not acknowledged.
    fn send<'a>(
        &'a self,
        topic: &'a str,
        key: &'a str,
        envelope: &'a EventEnvelope,
    ) -> BoxFuture<'a, Result<BrokerAck, BrokerError>>;

    /// Subscribe to one or more topics.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::SubscriptionFailed`] if subscription fails.
    fn subscribe(&self, topics: &[&str]) -> BoxFuture<'_, Result<EnvelopeStream, BrokerError>>;
}
