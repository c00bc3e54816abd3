//! In-memory outbox repository.
//!
//! Mirrors the `PostgreSQL` semantics closely enough for publisher and
//! consumer tests:
//! - ids are assigned in staging order
//! - a claim hides its rows from other claims until it is finished or dropped
//! - marks become visible on [`OutboxClaim::finish`]; a dropped claim
//!   discards them

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Test utilities document panics where critical

use fleet_sync_core::environment::{Clock, SystemClock};
use fleet_sync_core::outbox::{NewOutboxRecord, OutboxClaim, OutboxError, OutboxRecord, OutboxRepository};
use fleet_sync_core::unit_of_work::UnitOfWork;
use futures::future::BoxFuture;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Debug, Default)]
struct State {
    records: Vec<OutboxRecord>,
    claimed: HashSet<i64>,
}

/// In-memory [`OutboxRepository`].
#[derive(Clone)]
pub struct InMemoryOutboxRepository {
    state: Arc<Mutex<State>>,
    clock: Arc<dyn Clock>,
    failing: Arc<AtomicBool>,
}

impl InMemoryOutboxRepository {
    /// Create an empty repository stamping records with the system clock.
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create an empty repository stamping records with `clock`.
    #[must_use]
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            clock,
            failing: Arc::new(AtomicBool::new(false)),
        }
    }

    /// All records, in id order.
    #[must_use]
    pub fn records(&self) -> Vec<OutboxRecord> {
        self.state.lock().unwrap().records.clone()
    }

    /// The record with `id`.
    #[must_use]
    pub fn record(&self, id: i64) -> Option<OutboxRecord> {
        self.state
            .lock()
            .unwrap()
            .records
            .iter()
            .find(|record| record.id == id)
            .cloned()
    }

    /// Records not yet published.
    #[must_use]
    pub fn unpublished(&self) -> Vec<OutboxRecord> {
        self.state
            .lock()
            .unwrap()
            .records
            .iter()
            .filter(|record| !record.published)
            .cloned()
            .collect()
    }

    /// Mark `id` published directly, as a publisher elsewhere would.
    pub fn mark_published(&self, id: i64) {
        let mut state = self.state.lock().unwrap();
        if let Some(record) = state.records.iter_mut().find(|record| record.id == id) {
            record.published = true;
        }
    }

    /// Stage a record with an arbitrary, possibly invalid, payload text.
    pub fn insert_raw(&self, aggregate_id: &str, event_type: &str, payload: &str) -> i64 {
        self.push(NewOutboxRecord {
            aggregate_id: aggregate_id.to_string(),
            event_type: event_type.to_string(),
            payload: payload.to_string(),
        })
        .id
    }

    /// Stage `record` when `uow` commits, or right away without an active
    /// unit of work.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::Database`] while [`fail_all`](Self::fail_all)
    /// is in effect; nothing is staged then.
    pub async fn stage_in(
        &self,
        record: NewOutboxRecord,
        uow: &UnitOfWork,
    ) -> Result<(), OutboxError> {
        self.check()?;
        let outbox = self.clone();
        let stage = move || async move {
            outbox.push(record);
        };
        if let Err(stage) = uow.on_commit(stage) {
            stage().await;
        }
        Ok(())
    }

    /// Make every trait call fail with [`OutboxError::Database`] (or stop).
    pub fn fail_all(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), OutboxError> {
        if self.failing.load(Ordering::SeqCst) {
            Err(OutboxError::Database("injected failure".to_string()))
        } else {
            Ok(())
        }
    }

    fn push(&self, new: NewOutboxRecord) -> OutboxRecord {
        let mut state = self.state.lock().unwrap();
        let id = state.records.last().map_or(1, |last| last.id + 1);
        let record = OutboxRecord {
            id,
            aggregate_id: new.aggregate_id,
            event_type: new.event_type,
            payload: new.payload,
            published: false,
            created_at: self.clock.now(),
        };
        state.records.push(record.clone());
        record
    }
}

impl Default for InMemoryOutboxRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl OutboxRepository for InMemoryOutboxRepository {
    fn stage(&self, record: NewOutboxRecord) -> BoxFuture<'_, Result<OutboxRecord, OutboxError>> {
        Box::pin(async move {
            self.check()?;
            Ok(self.push(record))
        })
    }

    fn claim_unpublished(
        &self,
        limit: usize,
    ) -> BoxFuture<'_, Result<Box<dyn OutboxClaim>, OutboxError>> {
        Box::pin(async move {
            self.check()?;
            let mut state = self.state.lock().unwrap();
            let records: Vec<OutboxRecord> = state
                .records
                .iter()
                .filter(|record| !record.published && !state.claimed.contains(&record.id))
                .take(limit)
                .cloned()
                .collect();
            state.claimed.extend(records.iter().map(|record| record.id));
            drop(state);

            Ok(Box::new(InMemoryClaim {
                state: Arc::clone(&self.state),
                records,
                marks: Vec::new(),
                finished: false,
            }) as Box<dyn OutboxClaim>)
        })
    }

    fn exists_published<'a>(&'a self, aggregate_id: &'a str) -> BoxFuture<'a, Result<bool, OutboxError>> {
        Box::pin(async move {
            self.check()?;
            Ok(self
                .state
                .lock()
                .unwrap()
                .records
                .iter()
                .any(|record| record.published && record.aggregate_id == aggregate_id))
        })
    }
}

struct InMemoryClaim {
    state: Arc<Mutex<State>>,
    records: Vec<OutboxRecord>,
    marks: Vec<i64>,
    finished: bool,
}

impl InMemoryClaim {
    fn release_rows(&self, state: &mut State) {
        for record in &self.records {
            state.claimed.remove(&record.id);
        }
    }
}

impl OutboxClaim for InMemoryClaim {
    fn records(&self) -> &[OutboxRecord] {
        &self.records
    }

    fn mark_published(&mut self, id: i64) -> BoxFuture<'_, Result<(), OutboxError>> {
        Box::pin(async move {
            if !self.records.iter().any(|record| record.id == id) {
                return Err(OutboxError::NotClaimed(id));
            }
            self.marks.push(id);
            Ok(())
        })
    }

    fn finish(mut self: Box<Self>) -> BoxFuture<'static, Result<(), OutboxError>> {
        Box::pin(async move {
            let state = Arc::clone(&self.state);
            let mut state = state.lock().unwrap();
            for record in &mut state.records {
                if self.marks.contains(&record.id) {
                    record.published = true;
                }
            }
            self.release_rows(&mut state);
            self.finished = true;
            Ok(())
        })
    }
}

impl Drop for InMemoryClaim {
    fn drop(&mut self) {
        if !self.finished {
            if let Ok(mut state) = self.state.lock() {
                self.release_rows(&mut state);
            }
        }
    }
}
