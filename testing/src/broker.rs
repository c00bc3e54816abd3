//! Mock message broker.
//!
//! Records every acknowledged send and forwards it to subscribers of the
//! topic. Sends can be made to fail a given number of times, or to
//! acknowledge only after a delay (to exercise send timeouts).

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Test utilities document panics where critical

use fleet_sync_core::broker::{
    BrokerAck, BrokerError, EnvelopeStream, EventEnvelope, MessageBroker, ReceivedEnvelope,
};
use futures::future::BoxFuture;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;

/// A message the broker acknowledged.
#[derive(Debug, Clone, PartialEq)]
pub struct SentMessage {
    /// Topic it was sent to
    pub topic: String,
    /// Message key
    pub key: String,
    /// Message value
    pub envelope: EventEnvelope,
}

/// In-memory [`MessageBroker`].
#[derive(Clone, Debug)]
pub struct MockBroker {
    sent: Arc<Mutex<Vec<SentMessage>>>,
    feed: broadcast::Sender<SentMessage>,
    fail_next: Arc<AtomicUsize>,
    failing: Arc<AtomicBool>,
    ack_delay: Arc<Mutex<Option<Duration>>>,
}

impl MockBroker {
    /// Create a broker that acknowledges everything.
    #[must_use]
    pub fn new() -> Self {
        let (feed, _) = broadcast::channel(1024);
        Self {
            sent: Arc::new(Mutex::new(Vec::new())),
            feed,
            fail_next: Arc::new(AtomicUsize::new(0)),
            failing: Arc::new(AtomicBool::new(false)),
            ack_delay: Arc::new(Mutex::new(None)),
        }
    }

    /// Acknowledged messages, in send order.
    #[must_use]
    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().unwrap().clone()
    }

    /// Acknowledged messages on `topic`.
    #[must_use]
    pub fn sent_to(&self, topic: &str) -> Vec<SentMessage> {
        self.sent()
            .into_iter()
            .filter(|message| message.topic == topic)
            .collect()
    }

    /// Fail the next `count` sends.
    pub fn fail_next(&self, count: usize) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    /// Fail every send (or stop).
    pub fn fail_all(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Wait `delay` before acknowledging each send.
    pub fn delay_acks(&self, delay: Duration) {
        *self.ack_delay.lock().unwrap() = Some(delay);
    }

    fn take_failure(&self) -> bool {
        self.failing.load(Ordering::SeqCst)
            || self
                .fail_next
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
    }
}

impl Default for MockBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageBroker for MockBroker {
    fn send<'a>(
        &'a self,
        topic: &'a str,
        key: &'a str,
        envelope: &'a EventEnvelope,
    ) -> BoxFuture<'a, Result<BrokerAck, BrokerError>> {
        Box::pin(async move {
            let delay = *self.ack_delay.lock().unwrap();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }

            if self.take_failure() {
                return Err(BrokerError::SendFailed {
                    topic: topic.to_string(),
                    reason: "injected failure".to_string(),
                });
            }

            let message = SentMessage {
                topic: topic.to_string(),
                key: key.to_string(),
                envelope: envelope.clone(),
            };
            let offset = {
                let mut sent = self.sent.lock().unwrap();
                sent.push(message.clone());
                sent.len() - 1
            };
            let _ = self.feed.send(message);

            Ok(BrokerAck {
                partition: 0,
                offset: i64::try_from(offset).unwrap_or(i64::MAX),
            })
        })
    }

    fn subscribe(&self, topics: &[&str]) -> BoxFuture<'_, Result<EnvelopeStream, BrokerError>> {
        let topics: Vec<String> = topics.iter().map(ToString::to_string).collect();
        let mut receiver = self.feed.subscribe();
        Box::pin(async move {
            let stream = async_stream::stream! {
                loop {
                    match receiver.recv().await {
                        Ok(message) if topics.contains(&message.topic) => {
                            yield Ok(ReceivedEnvelope {
                                topic: message.topic,
                                key: Some(message.key),
                                envelope: message.envelope,
                            });
                        },
                        Ok(_) => {},
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            yield Err(BrokerError::TransportError(format!("lagged by {skipped} messages")));
                        },
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            };
            Ok(Box::pin(stream) as EnvelopeStream)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use serde_json::json;

    #[tokio::test]
    async fn failures_are_counted_down() {
        let broker = MockBroker::new();
        let envelope = EventEnvelope::new("OrderCreated", json!({}));
        broker.fail_next(2);

        tokio_test::assert_err!(broker.send("t", "O1", &envelope).await);
        tokio_test::assert_err!(broker.send("t", "O1", &envelope).await);
        let ack = tokio_test::assert_ok!(broker.send("t", "O1", &envelope).await);
        assert_eq!(ack.offset, 0);
        assert_eq!(broker.sent().len(), 1);
    }

    #[tokio::test]
    async fn subscribers_receive_their_topics_only() {
        let broker = MockBroker::new();
        let mut stream = broker.subscribe(&["order-events"]).await.unwrap();

        broker
            .send("stock-result", "1", &EventEnvelope::new("StockDecreased", json!({})))
            .await
            .unwrap();
        broker
            .send("order-events", "O1", &EventEnvelope::new("OrderCreated", json!({"id": "O1"})))
            .await
            .unwrap();

        let received = stream.next().await.unwrap().unwrap();
        assert_eq!(received.topic, "order-events");
        assert_eq!(received.key.as_deref(), Some("O1"));
        assert_eq!(received.envelope.event_type, "OrderCreated");
    }
}
