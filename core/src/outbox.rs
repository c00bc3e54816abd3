//! Transactional outbox: durable staging of domain events.
//!
//! A business transaction that changes state also stages an [`OutboxRecord`]
//! describing the change, in the same local transaction. A separate publisher
//! loop later claims unpublished records, sends them to the broker and marks
//! them published after the acknowledgement. Staging is the only write path;
//! the publisher never creates records, and records are never deleted.
//!
//! # Claims
//!
//! [`OutboxRepository::claim_unpublished`] opens an exclusive scope over a batch
//! of unpublished records (`SELECT ... FOR UPDATE SKIP LOCKED` on `PostgreSQL`).
//! Two publishers never claim the same record at the same time; marks made
//! through the [`OutboxClaim`] become durable on [`OutboxClaim::finish`].

use crate::broker::EventEnvelope;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from outbox storage.
#[derive(Error, Debug, Clone)]
pub enum OutboxError {
    /// Database operation failed
    #[error("Outbox database error: {0}")]
    Database(String),

    /// A payload could not be serialized or parsed as JSON
    #[error("Outbox payload serialization error: {0}")]
    Serialization(String),

    /// A mark was attempted for a record outside the claim
    #[error("Outbox record {0} is not part of this claim")]
    NotClaimed(i64),
}

/// A staged domain event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxRecord {
    /// Monotonic identifier assigned by the store
    pub id: i64,
    /// Aggregate the event belongs to; also the broker message key
    pub aggregate_id: String,
    /// Event type name
    pub event_type: String,
    /// Event body as JSON text
    pub payload: String,
    /// Whether the broker acknowledged the event
    pub published: bool,
    /// When the record was staged
    pub created_at: DateTime<Utc>,
}

impl OutboxRecord {
    /// Parse the payload into the envelope sent to the broker.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::Serialization`] if the payload is not valid JSON.
    pub fn to_envelope(&self) -> Result<EventEnvelope, OutboxError> {
        let payload = serde_json::from_str(&self.payload)
            .map_err(|e| OutboxError::Serialization(e.to_string()))?;
        Ok(EventEnvelope::new(self.event_type.clone(), payload))
    }
}

/// A record about to be staged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewOutboxRecord {
    /// Aggregate the event belongs to
    pub aggregate_id: String,
    /// Event type name
    pub event_type: String,
    /// Event body as JSON text
    pub payload: String,
}

impl NewOutboxRecord {
    /// Serialize `payload` to JSON and build a record.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::Serialization`] if `payload` cannot be serialized.
    pub fn new(
        aggregate_id: impl Into<String>,
        event_type: impl Into<String>,
        payload: &impl Serialize,
    ) -> Result<Self, OutboxError> {
        let payload =
            serde_json::to_string(payload).map_err(|e| OutboxError::Serialization(e.to_string()))?;
        Ok(Self {
            aggregate_id: aggregate_id.into(),
            event_type: event_type.into(),
            payload,
        })
    }
}

/// Exclusive scope over a batch of claimed, unpublished records.
///
/// Dropping a claim without calling [`OutboxClaim::finish`] releases the rows;
/// whether marks made so far survive depends on the backend (they do not on
/// `PostgreSQL`, where the transaction rolls back). Either way the affected
/// records are simply sent again.
pub trait OutboxClaim: Send {
    /// Claimed records, oldest first.
    fn records(&self) -> &[OutboxRecord];

    /// Record that `id` was acknowledged by the broker.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError`] if the mark cannot be written.
    fn mark_published(&mut self, id: i64) -> BoxFuture<'_, Result<(), OutboxError>>;

    /// Persist all marks and release the claimed rows.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError`] if the marks cannot be persisted.
    fn finish(self: Box<Self>) -> BoxFuture<'static, Result<(), OutboxError>>;
}

/// Storage of outbox records.
pub trait OutboxRepository: Send + Sync {
    /// Append an unpublished record.
    ///
    /// Backends that support it also offer a variant staging inside the
    /// caller's transaction; this one uses its own.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::Database`] if the insert fails.
    fn stage(&self, record: NewOutboxRecord) -> BoxFuture<'_, Result<OutboxRecord, OutboxError>>;

    /// Claim up to `limit` unpublished records, oldest first, skipping rows
    /// already claimed by another scope.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::Database`] if the query fails.
    fn claim_unpublished(
        &self,
        limit: usize,
    ) -> BoxFuture<'_, Result<Box<dyn OutboxClaim>, OutboxError>>;

    /// Whether any record of `aggregate_id` has been published.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::Database`] if the query fails.
    fn exists_published<'a>(&'a self, aggregate_id: &'a str) -> BoxFuture<'a, Result<bool, OutboxError>>;
}
