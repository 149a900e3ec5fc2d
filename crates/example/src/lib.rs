//! Example per-request unit of work built with lifescope.
//!
//! Each request opens a [`Request`] scope. Every worker the request fans out
//! to, whether a thread or a tokio task, inherits that scope, opens its own
//! [`Transaction`] scope and shares the request's one [`DbSession`].
//!
//! ```text
//! ┌───────────────────────── Request scope ─────────────────────────┐
//! │  DbSession #n                                                   │
//! │                                                                 │
//! │  ┌── Transaction ──┐  ┌── Transaction ──┐  ┌── Transaction ──┐  │
//! │  │ UnitOfWork (0)  │  │ UnitOfWork (1)  │  │ UnitOfWork (2)  │  │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────┘  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Closing a scope releases what it cached: units of work when their worker
//! finishes, the session when the request ends.

pub mod telemetry;

use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use lifescope_lifestyle::ScopedLifestyle;
use lifescope_store::prelude::*;

/// Context type of a request scope.
pub struct Request;

/// Context type of a worker's transaction scope.
pub struct Transaction;

/// Errors raised while handling a request.
#[derive(Debug, thiserror::Error)]
pub enum DemoError {
    /// A scope was used in the wrong state.
    #[error(transparent)]
    Scope(#[from] ScopeError),

    /// A worker thread panicked.
    #[error("worker {0} panicked")]
    WorkerPanicked(usize),

    /// A worker task failed to complete.
    #[error("worker task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

// ─────────────────────────────────────────────────────────────────────────────
// Services
// ─────────────────────────────────────────────────────────────────────────────

/// A database session shared by everything in one request.
#[derive(Debug)]
pub struct DbSession {
    id: u64,
    closed: AtomicBool,
}

impl DbSession {
    /// Returns the session id.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Returns `true` once the session was closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn close(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }
}

/// One worker's unit of work.
#[derive(Debug)]
pub struct UnitOfWork {
    worker: usize,
    session: Arc<DbSession>,
    committed: AtomicBool,
}

impl UnitOfWork {
    /// Returns the worker this unit belongs to.
    #[must_use]
    pub fn worker(&self) -> usize {
        self.worker
    }

    /// Returns the session this unit writes through.
    #[must_use]
    pub fn session(&self) -> &Arc<DbSession> {
        &self.session
    }

    /// Returns `true` once the unit was committed.
    #[must_use]
    pub fn is_committed(&self) -> bool {
        self.committed.load(Ordering::Acquire)
    }
}

/// The application's scoped services.
pub struct Services {
    registry: Arc<StoreRegistry>,
    sessions: ScopedLifestyle<Request, DbSession>,
    units: ScopedLifestyle<Transaction, UnitOfWork>,
    next_session: AtomicU64,
    closed_sessions: Arc<AtomicUsize>,
}

impl Services {
    /// Registers the scoped services against `registry`.
    #[must_use]
    pub fn new(registry: Arc<StoreRegistry>) -> Self {
        let closed_sessions = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&closed_sessions);

        let sessions =
            ScopedLifestyle::from_registry(&registry, move |session: &Arc<DbSession>| {
                let closed = session.close();
                if closed {
                    counter.fetch_add(1, Ordering::SeqCst);
                    tracing::debug!(session = session.id(), "session closed");
                }
                closed
            });
        let units = ScopedLifestyle::from_registry(&registry, |unit: &Arc<UnitOfWork>| {
            let committed = !unit.committed.swap(true, Ordering::AcqRel);
            tracing::debug!(
                worker = unit.worker(),
                session = unit.session().id(),
                "unit of work committed"
            );
            committed
        });

        Self {
            registry,
            sessions,
            units,
            next_session: AtomicU64::new(1),
            closed_sessions,
        }
    }

    /// Returns the registry the services cache into.
    #[must_use]
    pub fn registry(&self) -> &Arc<StoreRegistry> {
        &self.registry
    }

    /// Returns the request's session.
    ///
    /// # Errors
    ///
    /// [`ScopeError::NotOpen`] outside a [`Request`] scope.
    pub fn session(&self, ctx: &CallContext) -> Result<Arc<DbSession>, ScopeError> {
        self.sessions.resolve(ctx, || {
            let id = self.next_session.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(session = id, "session opened");
            Arc::new(DbSession {
                id,
                closed: AtomicBool::new(false),
            })
        })
    }

    /// Returns the transaction's unit of work, bound to the request's session.
    ///
    /// # Errors
    ///
    /// [`ScopeError::NotOpen`] outside a [`Transaction`] scope nested in a
    /// [`Request`] scope.
    pub fn unit_of_work(
        &self,
        ctx: &CallContext,
        worker: usize,
    ) -> Result<Arc<UnitOfWork>, ScopeError> {
        let session = self.session(ctx)?;
        self.units.resolve(ctx, || {
            Arc::new(UnitOfWork {
                worker,
                session,
                committed: AtomicBool::new(false),
            })
        })
    }

    /// Returns how many sessions have been closed.
    #[must_use]
    pub fn closed_sessions(&self) -> usize {
        self.closed_sessions.load(Ordering::SeqCst)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Request handling
// ─────────────────────────────────────────────────────────────────────────────

/// What one request did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestSummary {
    /// The request number.
    pub request: u64,
    /// The session every worker used.
    pub session: u64,
    /// How many workers shared the session.
    pub workers: usize,
    /// How many values the request scope released on close.
    pub released: usize,
}

fn run_worker(services: &Services, ctx: &CallContext, worker: usize) -> Result<u64, ScopeError> {
    let tx = LifetimeScope::<Transaction>::open(services.registry(), ctx)?;
    let unit = services.unit_of_work(tx.context(), worker)?;
    tracing::trace!(worker, session = unit.session().id(), "worker running");
    tx.close()?;
    Ok(unit.session().id())
}

fn summarize(
    request: u64,
    session: &DbSession,
    sessions: &[u64],
    released: usize,
) -> RequestSummary {
    debug_assert!(sessions.iter().all(|&id| id == session.id()));
    RequestSummary {
        request,
        session: session.id(),
        workers: sessions.len(),
        released,
    }
}

/// Handles one request, fanning out to `workers` threads.
///
/// # Errors
///
/// Returns [`DemoError`] if a scope is misused or a worker panics.
pub fn handle_request(
    services: &Services,
    root: &CallContext,
    request: u64,
    workers: usize,
) -> Result<RequestSummary, DemoError> {
    let scope = LifetimeScope::<Request>::open(services.registry(), root)?;
    let session = services.session(scope.context())?;
    tracing::info!(request, session = session.id(), workers, "request started");

    let sessions = std::thread::scope(|s| {
        let handles: Vec<_> = (0..workers)
            .map(|worker| {
                let handle = scope
                    .context()
                    .spawn_scoped(s, move |ctx| run_worker(services, &ctx, worker));
                (worker, handle)
            })
            .collect();

        handles
            .into_iter()
            .map(|(worker, handle)| {
                handle
                    .join()
                    .map_err(|_| DemoError::WorkerPanicked(worker))?
                    .map_err(DemoError::from)
            })
            .collect::<Result<Vec<_>, _>>()
    })?;

    let released = scope.close()?;
    tracing::info!(request, released, "request finished");
    Ok(summarize(request, &session, &sessions, released))
}

/// Handles one request, fanning out to `workers` tokio tasks.
///
/// # Errors
///
/// Returns [`DemoError`] if a scope is misused or a worker task fails.
pub async fn handle_request_async(
    services: Arc<Services>,
    root: CallContext,
    request: u64,
    workers: usize,
) -> Result<RequestSummary, DemoError> {
    let scope = LifetimeScope::<Request>::open(services.registry(), &root)?;
    let session = services.session(scope.context())?;
    tracing::info!(request, session = session.id(), workers, "request started");

    let handles: Vec<_> = (0..workers)
        .map(|worker| {
            let services = Arc::clone(&services);
            scope
                .context()
                .spawn_task(move |ctx| async move { run_worker(&services, &ctx, worker) })
        })
        .collect();

    let mut sessions = Vec::with_capacity(workers);
    for handle in handles {
        sessions.push(handle.await??);
    }

    let released = scope.close()?;
    tracing::info!(request, released, "request finished");
    Ok(summarize(request, &session, &sessions, released))
}
