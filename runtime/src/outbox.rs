//! Outbox publisher loop.
//!
//! [`OutboxPublisher`] periodically claims unpublished outbox records, sends
//! each one to the broker and marks it published only after the broker has
//! acknowledged it. Delivery is at-least-once: a record whose send fails or
//! times out stays unpublished and is retried on a later tick.
//!
//! # Ordering
//!
//! Records are sent one at a time in claim order (oldest first). When a send
//! for an aggregate fails, the remaining records of that aggregate are held
//! back for the rest of the tick so they never overtake it; other aggregates
//! carry on.
//!
//! # Example
//!
//! ```ignore
//! let publisher = OutboxPublisher::new(repository, broker, config.outbox.clone());
//! let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
//! let task = publisher.spawn(shutdown_rx);
//!
//! // On shutdown:
//! shutdown_tx.send(true).ok();
//! task.await.ok();
//! ```

use crate::config::OutboxConfig;
use crate::metrics::OutboxMetrics;
use fleet_sync_core::broker::{BrokerError, MessageBroker};
use fleet_sync_core::outbox::{OutboxError, OutboxRecord, OutboxRepository};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Outcome of one publisher tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Records acknowledged and marked published
    pub published: usize,
    /// Records whose send failed; retried on a later tick
    pub failed: usize,
    /// Records not attempted this tick (held back behind a failure, or with
    /// an unreadable payload)
    pub skipped: usize,
}

impl TickReport {
    /// Total number of records claimed.
    #[must_use]
    pub const fn claimed(&self) -> usize {
        self.published + self.failed + self.skipped
    }
}

/// Drains the outbox to the broker.
#[derive(Clone)]
pub struct OutboxPublisher {
    repository: Arc<dyn OutboxRepository>,
    broker: Arc<dyn MessageBroker>,
    config: OutboxConfig,
}

impl OutboxPublisher {
    /// Create a publisher.
    #[must_use]
    pub fn new(
        repository: Arc<dyn OutboxRepository>,
        broker: Arc<dyn MessageBroker>,
        config: OutboxConfig,
    ) -> Self {
        Self {
            repository,
            broker,
            config,
        }
    }

    /// Run one publishing pass over the current unpublished records.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError`] if records cannot be claimed or the marks
    /// cannot be persisted. Broker failures are not errors: they are counted
    /// in the report.
    #[tracing::instrument(skip(self), name = "outbox_tick", fields(topic = %self.config.topic))]
    pub async fn tick(&self) -> Result<TickReport, OutboxError> {
        let started = Instant::now();
        let mut claim = self.repository.claim_unpublished(self.config.batch_size).await?;
        let records: Vec<OutboxRecord> = claim.records().to_vec();

        let mut report = TickReport::default();
        let mut held_back: HashSet<String> = HashSet::new();

        for record in &records {
            if held_back.contains(&record.aggregate_id) {
                report.skipped += 1;
                continue;
            }

            let envelope = match record.to_envelope() {
                Ok(envelope) => envelope,
                Err(e) => {
                    tracing::error!(
                        id = record.id,
                        aggregate_id = %record.aggregate_id,
                        event_type = %record.event_type,
                        error = %e,
                        "Outbox record has an unreadable payload, leaving it unpublished"
                    );
                    held_back.insert(record.aggregate_id.clone());
                    report.skipped += 1;
                    continue;
                },
            };

            match self.send(record, &envelope).await {
                Ok(()) => {
                    if let Err(e) = claim.mark_published(record.id).await {
                        tracing::error!(
                            id = record.id,
                            error = %e,
                            "Sent record could not be marked published, it will be sent again"
                        );
                        held_back.insert(record.aggregate_id.clone());
                        report.failed += 1;
                        OutboxMetrics::record_failed();
                        continue;
                    }
                    report.published += 1;
                    OutboxMetrics::record_published();
                },
                Err(e) => {
                    tracing::warn!(
                        id = record.id,
                        aggregate_id = %record.aggregate_id,
                        error = %e,
                        "Broker send failed, record stays unpublished"
                    );
                    held_back.insert(record.aggregate_id.clone());
                    report.failed += 1;
                    OutboxMetrics::record_failed();
                },
            }
        }

        claim.finish().await?;
        OutboxMetrics::record_tick(started.elapsed());

        if report.claimed() > 0 {
            tracing::info!(
                published = report.published,
                failed = report.failed,
                skipped = report.skipped,
                "Outbox tick finished"
            );
        }
        Ok(report)
    }

    async fn send(
        &self,
        record: &OutboxRecord,
        envelope: &fleet_sync_core::broker::EventEnvelope,
    ) -> Result<(), BrokerError> {
        let timeout = self.config.send_timeout();
        let topic = self.config.topic.as_str();
        let ack = tokio::time::timeout(
            timeout,
            self.broker.send(topic, &record.aggregate_id, envelope),
        )
        .await
        .map_err(|_| BrokerError::Timeout {
            topic: topic.to_string(),
            timeout,
        })??;

        tracing::debug!(
            id = record.id,
            event_type = %record.event_type,
            partition = ack.partition,
            offset = ack.offset,
            "Outbox record acknowledged"
        );
        Ok(())
    }

    /// Tick on a fixed interval until `shutdown` flips to `true` (or its
    /// sender is dropped). A failing tick is logged and retried on the next one.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            topic = %self.config.topic,
            interval_ms = self.config.interval_ms,
            "Outbox publisher started"
        );

        let mut interval = tokio::time::interval(self.config.interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while !*shutdown.borrow() {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.tick().await {
                        tracing::error!(error = %e, "Outbox tick failed");
                    }
                }

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        tracing::info!("Shutdown signal received");
                        break;
                    }
                }
            }
        }

        tracing::info!("Outbox publisher stopped");
    }

    /// Spawn [`run`](Self::run) onto the runtime.
    #[must_use]
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Test code can use unwrap
mod tests {
    use super::*;
    use fleet_sync_core::outbox::NewOutboxRecord;
    use fleet_sync_testing::broker::MockBroker;
    use fleet_sync_testing::outbox::InMemoryOutboxRepository;
    use serde_json::json;
    use std::time::Duration;

    struct Fixture {
        publisher: OutboxPublisher,
        repository: Arc<InMemoryOutboxRepository>,
        broker: Arc<MockBroker>,
    }

    fn fixture() -> Fixture {
        let repository = Arc::new(InMemoryOutboxRepository::new());
        let broker = Arc::new(MockBroker::new());
        let publisher = OutboxPublisher::new(
            Arc::clone(&repository) as Arc<dyn OutboxRepository>,
            Arc::clone(&broker) as Arc<dyn MessageBroker>,
            OutboxConfig::default()
                .with_topic("order-events")
                .with_send_timeout(Duration::from_millis(100)),
        );
        Fixture {
            publisher,
            repository,
            broker,
        }
    }

    async fn stage(repository: &InMemoryOutboxRepository, aggregate: &str, seq: u32) -> i64 {
        repository
            .stage(NewOutboxRecord::new(aggregate, "OrderCreated", &json!({ "seq": seq })).unwrap())
            .await
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn publishes_and_marks_in_order() {
        let f = fixture();
        stage(&f.repository, "O1", 1).await;
        stage(&f.repository, "O2", 1).await;

        let report = f.publisher.tick().await.unwrap();
        assert_eq!(report.published, 2);

        let sent = f.broker.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].topic, "order-events");
        assert_eq!(sent[0].key, "O1");
        assert_eq!(sent[1].key, "O2");
        assert!(f.repository.records().iter().all(|r| r.published));

        // Nothing left for the next tick
        assert_eq!(f.publisher.tick().await.unwrap(), TickReport::default());
    }

    #[tokio::test]
    async fn failed_sends_stay_unpublished_and_hold_back_their_aggregate() {
        let f = fixture();
        let first = stage(&f.repository, "O1", 1).await;
        stage(&f.repository, "O1", 2).await;
        stage(&f.repository, "O2", 1).await;

        f.broker.fail_next(1);
        let report = f.publisher.tick().await.unwrap();
        assert_eq!(
            report,
            TickReport {
                published: 1,
                failed: 1,
                skipped: 1
            }
        );
        assert_eq!(f.broker.sent().len(), 1);
        assert_eq!(f.broker.sent()[0].key, "O2");
        assert!(!f.repository.record(first).unwrap().published);

        // Retried in order on the next tick
        let report = f.publisher.tick().await.unwrap();
        assert_eq!(report.published, 2);
        let keys: Vec<_> = f.broker.sent().iter().map(|m| m.envelope.payload["seq"].clone()).collect();
        assert_eq!(keys, vec![json!(1), json!(1), json!(2)]);
    }

    #[tokio::test(start_paused = true)]
    async fn unacknowledged_sends_time_out() {
        let f = fixture();
        let id = stage(&f.repository, "O1", 1).await;

        f.broker.delay_acks(Duration::from_secs(10));
        let report = f.publisher.tick().await.unwrap();
        assert_eq!(report.failed, 1);
        assert!(!f.repository.record(id).unwrap().published);
    }

    #[tokio::test]
    async fn poison_payloads_are_skipped() {
        let f = fixture();
        f.repository.insert_raw("O9", "Broken", "{not json");
        stage(&f.repository, "O10", 1).await;

        let report = f.publisher.tick().await.unwrap();
        assert_eq!(report.published, 1);
        assert_eq!(report.skipped, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn run_ticks_until_shutdown() {
        let f = fixture();
        stage(&f.repository, "O1", 1).await;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = f.publisher.clone().spawn(shutdown_rx);

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(f.broker.sent().len(), 1);

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
    }
}
