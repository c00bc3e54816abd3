//! Explicit unit-of-work handle for deferring work to transaction completion.
//!
//! Business code creates a [`UnitOfWork`] at its transaction boundary and
//! passes it down the call chain. Infrastructure that must not act before
//! the transaction's writes are durable registers callbacks on it instead of
//! acting immediately:
//!
//! - the cache coordinator defers cache population and invalidation
//!   broadcasts with [`UnitOfWork::on_commit`], so nobody observes a cache
//!   entry for data that is later rolled back
//! - the lock wrappers defer lease release with
//!   [`UnitOfWork::on_completion`], so no other process can enter the critical
//!   section before the writes are visible
//!
//! Registration hands the callback back when the unit of work is not active.
//! The caller then runs it immediately, which makes "deferred or immediate"
//! a single decision taken at registration time.
//!
//! # Example
//!
//! ```
//! use fleet_sync_core::unit_of_work::UnitOfWork;
//!
//! # async fn example() {
//! let uow = UnitOfWork::begin();
//! let deferred = uow.on_commit(|| async { println!("after commit") });
//! assert!(deferred.is_ok());
//! uow.commit().await.ok();
//! # }
//! ```

use futures::future::BoxFuture;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;

/// How a unit of work ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// The transaction committed.
    Committed,
    /// The transaction rolled back (explicitly, on error, or by being dropped).
    RolledBack,
}

/// Callback run after a successful commit.
pub type CommitAction = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// Callback run after the unit of work ends, whatever the outcome.
pub type CompletionAction = Box<dyn FnOnce(Completion) -> BoxFuture<'static, ()> + Send>;

/// Errors from finishing a unit of work.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitOfWorkError {
    /// The unit of work was never active or has already completed.
    #[error("Unit of work {0} is not active")]
    NotActive(u64),
}

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Default)]
struct Pending {
    active: bool,
    on_commit: Vec<CommitAction>,
    on_completion: Vec<CompletionAction>,
}

struct Scope {
    id: u64,
    pending: Mutex<Pending>,
}

impl Scope {
    /// Deactivate and take every registered callback, exactly once.
    fn take(&self) -> Option<(Vec<CommitAction>, Vec<CompletionAction>)> {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        if !pending.active {
            return None;
        }
        pending.active = false;
        Some((
            std::mem::take(&mut pending.on_commit),
            std::mem::take(&mut pending.on_completion),
        ))
    }
}

impl Drop for Scope {
    fn drop(&mut self) {
        let Some((_, on_completion)) = self.take() else {
            return;
        };
        if on_completion.is_empty() {
            return;
        }

        tracing::warn!(
            unit_of_work = self.id,
            callbacks = on_completion.len(),
            "Unit of work dropped while active, rolling back"
        );

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    for action in on_completion {
                        action(Completion::RolledBack).await;
                    }
                });
            },
            Err(_) => {
                tracing::error!(
                    unit_of_work = self.id,
                    "No async runtime available, completion callbacks were not run"
                );
            },
        }
    }
}

/// Handle to the scope of one business transaction.
///
/// Cloning is cheap and every clone refers to the same scope.
/// [`UnitOfWork::none`] represents "no transaction": it is never active and
/// every registration is handed back.
#[derive(Clone)]
pub struct UnitOfWork {
    scope: Option<Arc<Scope>>,
}

impl UnitOfWork {
    /// Start a new, active unit of work.
    #[must_use]
    pub fn begin() -> Self {
        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(unit_of_work = id, "Unit of work started");
        Self {
            scope: Some(Arc::new(Scope {
                id,
                pending: Mutex::new(Pending {
                    active: true,
                    ..Pending::default()
                }),
            })),
        }
    }

    /// A handle representing the absence of a transaction.
    #[must_use]
    pub const fn none() -> Self {
        Self { scope: None }
    }

    /// Identifier for logging; `0` for [`UnitOfWork::none`].
    #[must_use]
    pub fn id(&self) -> u64 {
        self.scope.as_ref().map_or(0, |scope| scope.id)
    }

    /// Whether the transaction is still open.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.scope.as_ref().is_some_and(|scope| {
            scope
                .pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .active
        })
    }

    /// Run `action` after a successful commit.
    ///
    /// # Errors
    ///
    /// Hands the boxed action back when the unit of work is not active; the
    /// caller is expected to run it immediately.
    pub fn on_commit<F, Fut>(&self, action: F) -> Result<(), CommitAction>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let boxed: CommitAction = Box::new(move || Box::pin(action()));
        let Some(scope) = &self.scope else {
            return Err(boxed);
        };

        let mut pending = scope.pending.lock().unwrap_or_else(PoisonError::into_inner);
        if pending.active {
            pending.on_commit.push(boxed);
            Ok(())
        } else {
            Err(boxed)
        }
    }

    /// Run `action` once the unit of work ends, committed or rolled back.
    ///
    /// # Errors
    ///
    /// Hands the boxed action back when the unit of work is not active; the
    /// caller is expected to run it immediately.
    pub fn on_completion<F, Fut>(&self, action: F) -> Result<(), CompletionAction>
    where
        F: FnOnce(Completion) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let boxed: CompletionAction = Box::new(move |completion| Box::pin(action(completion)));
        let Some(scope) = &self.scope else {
            return Err(boxed);
        };

        let mut pending = scope.pending.lock().unwrap_or_else(PoisonError::into_inner);
        if pending.active {
            pending.on_completion.push(boxed);
            Ok(())
        } else {
            Err(boxed)
        }
    }

    /// Mark the transaction committed, then run commit callbacks followed by
    /// completion callbacks, each in registration order.
    ///
    /// Call this only after the underlying transaction has committed.
    ///
    /// # Errors
    ///
    /// Returns [`UnitOfWorkError::NotActive`] if already completed.
    pub async fn commit(&self) -> Result<(), UnitOfWorkError> {
        let (on_commit, on_completion) = self.take()?;
        tracing::debug!(
            unit_of_work = self.id(),
            commit_callbacks = on_commit.len(),
            completion_callbacks = on_completion.len(),
            "Unit of work committed"
        );

        for action in on_commit {
            action().await;
        }
        for action in on_completion {
            action(Completion::Committed).await;
        }
        Ok(())
    }

    /// Mark the transaction rolled back and run completion callbacks.
    /// Commit callbacks are discarded.
    ///
    /// # Errors
    ///
    /// Returns [`UnitOfWorkError::NotActive`] if already completed.
    pub async fn rollback(&self) -> Result<(), UnitOfWorkError> {
        let (discarded, on_completion) = self.take()?;
        tracing::debug!(
            unit_of_work = self.id(),
            discarded_commit_callbacks = discarded.len(),
            completion_callbacks = on_completion.len(),
            "Unit of work rolled back"
        );

        for action in on_completion {
            action(Completion::RolledBack).await;
        }
        Ok(())
    }

    fn take(&self) -> Result<(Vec<CommitAction>, Vec<CompletionAction>), UnitOfWorkError> {
        self.scope
            .as_ref()
            .and_then(|scope| scope.take())
            .ok_or(UnitOfWorkError::NotActive(self.id()))
    }
}

impl Default for UnitOfWork {
    fn default() -> Self {
        Self::none()
    }
}

impl fmt::Debug for UnitOfWork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnitOfWork")
            .field("id", &self.id())
            .field("active", &self.is_active())
            .finish()
    }
}

/// Run `work` inside a fresh unit of work: commit on `Ok`, roll back on `Err`.
///
/// Use this where there is no database transaction to pair with (or in
/// tests); backends with real transactions provide their own pairing.
///
/// # Errors
///
/// Returns the error produced by `work`.
pub async fn transactional<F, Fut, T, E>(work: F) -> Result<T, E>
where
    F: FnOnce(UnitOfWork) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let uow = UnitOfWork::begin();
    let outcome = work(uow.clone()).await;

    let finished = if outcome.is_ok() {
        uow.commit().await
    } else {
        uow.rollback().await
    };
    if let Err(e) = finished {
        tracing::debug!(error = %e, "Unit of work was already completed by the work itself");
    }

    outcome
}
