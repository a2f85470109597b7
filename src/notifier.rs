//! Change notifier — process-wide registry of auth-change reactions.
//!
//! DESIGN
//! ======
//! Handlers are registered while the app is being wired and live for the
//! process. The list is append-only, so dispatch takes a cheap snapshot of
//! it and never holds the lock across an await.
//!
//! Dispatch is a fixed-order loop: handlers run one after another in
//! registration order, each awaited to completion before the next starts.
//! A handler that errors or panics is logged and recorded in the
//! `DispatchReport`; the loop moves on and the session mutation that caused
//! the dispatch stays committed.
//!
//! Registering the same handler twice runs it twice. That is the caller's
//! call, not something the registry second-guesses.
//!
//! PER-CONNECTION QUEUE
//! ====================
//! On a live connection dispatches go through a `DispatchQueue`: one spawned
//! worker per connection drains changes in the order they were committed.
//! A slow handler delays the dispatches queued behind it but never the ws
//! loop, so a navigation can still be read and can cancel the queue.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, PoisonError, RwLock};

use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::identity::IdentityError;
use crate::session::{SessionSnapshot, SessionState, SessionStatus};

// =============================================================================
// TYPES
// =============================================================================

/// One firing transition, as seen by handlers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthChange {
    pub old_status: SessionStatus,
    pub new_status: SessionStatus,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
}

impl AuthChange {
    #[must_use]
    pub fn is_signed_in(&self) -> bool {
        self.new_status == SessionStatus::SignedIn
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error(transparent)]
    Identity(#[from] IdentityError),
    #[error("{0}")]
    Failed(String),
    #[error("handler panicked: {0}")]
    Panicked(String),
}

/// What a handler can reach while reacting: the connection's session.
pub struct HandlerContext<'a> {
    session: &'a SessionState,
}

impl<'a> HandlerContext<'a> {
    pub(crate) fn new(session: &'a SessionState) -> Self {
        Self { session }
    }

    #[must_use]
    pub fn session(&self) -> &'a SessionState {
        self.session
    }

    /// Already reflects the change being dispatched.
    #[must_use]
    pub fn snapshot(&self) -> SessionSnapshot {
        self.session.snapshot()
    }
}

#[async_trait::async_trait]
pub trait AuthChangeHandler: Send + Sync {
    /// Label used in logs and dispatch reports.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    async fn on_auth_change(&self, ctx: &HandlerContext<'_>, change: &AuthChange) -> Result<(), HandlerError>;
}

// =============================================================================
// CLOSURE HANDLERS
// =============================================================================

pub struct FnHandler<F> {
    name: String,
    f: F,
}

#[async_trait::async_trait]
impl<F, Fut> AuthChangeHandler for FnHandler<F>
where
    F: Fn(AuthChange) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn on_auth_change(&self, _ctx: &HandlerContext<'_>, change: &AuthChange) -> Result<(), HandlerError> {
        (self.f)(change.clone()).await
    }
}

/// Wrap an async closure as a handler.
pub fn handler_fn<F, Fut>(name: impl Into<String>, f: F) -> Arc<dyn AuthChangeHandler>
where
    F: Fn(AuthChange) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    Arc::new(FnHandler { name: name.into(), f })
}

// =============================================================================
// DISPATCH REPORT
// =============================================================================

#[derive(Debug)]
pub struct HandlerOutcome {
    pub name: String,
    pub result: Result<(), HandlerError>,
}

/// Per-handler results of one dispatch, in dispatch order.
#[derive(Debug, Default)]
pub struct DispatchReport {
    pub outcomes: Vec<HandlerOutcome>,
}

impl DispatchReport {
    #[must_use]
    pub fn failures(&self) -> usize {
        self.outcomes.iter().filter(|o| o.result.is_err()).count()
    }

    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.outcomes.iter().map(|o| o.name.as_str()).collect()
    }
}

// =============================================================================
// REGISTRY
// =============================================================================

#[derive(Default)]
pub struct ChangeNotifier {
    handlers: RwLock<Vec<Arc<dyn AuthChangeHandler>>>,
}

impl ChangeNotifier {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a handler. Duplicates are kept and invoked once per registration.
    pub fn register(&self, handler: Arc<dyn AuthChangeHandler>) {
        debug!(handler = handler.name(), "notifier: registered");
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handler);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run every handler, in registration order, against one change.
    pub(crate) async fn notify(&self, ctx: &HandlerContext<'_>, change: &AuthChange) -> DispatchReport {
        let handlers: Vec<Arc<dyn AuthChangeHandler>> = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let mut report = DispatchReport { outcomes: Vec::with_capacity(handlers.len()) };
        for handler in handlers {
            let name = handler.name().to_string();
            let result = match AssertUnwindSafe(handler.on_auth_change(ctx, change))
                .catch_unwind()
                .await
            {
                Ok(result) => result,
                Err(panic) => Err(HandlerError::Panicked(panic_message(panic.as_ref()))),
            };
            if let Err(e) = &result {
                warn!(handler = %name, error = %e, new = ?change.new_status, "notifier: handler failed");
            }
            report.outcomes.push(HandlerOutcome { name, result });
        }
        report
    }
}

// =============================================================================
// DISPATCH QUEUE
// =============================================================================

/// FIFO worker running one connection's dispatches off the ws loop.
pub struct DispatchQueue {
    session: Arc<SessionState>,
    tx: mpsc::UnboundedSender<AuthChange>,
    worker: JoinHandle<()>,
}

impl DispatchQueue {
    /// Start the worker. Must be called inside a tokio runtime.
    #[must_use]
    pub fn spawn(session: Arc<SessionState>) -> Self {
        let (tx, worker) = start_worker(Arc::clone(&session));
        Self { session, tx, worker }
    }

    /// Queue a committed change behind any dispatch still running.
    pub fn enqueue(&self, change: AuthChange) -> bool {
        match self.tx.send(change) {
            Ok(()) => true,
            Err(e) => {
                warn!(new = ?e.0.new_status, "notifier: dispatch queue closed, change dropped");
                false
            }
        }
    }

    /// Abort the dispatch in flight and drop everything still queued.
    /// Later changes go to a fresh worker.
    pub fn cancel(&mut self) {
        self.worker.abort();
        let (tx, worker) = start_worker(Arc::clone(&self.session));
        self.tx = tx;
        self.worker = worker;
    }

    /// Stop accepting changes. Already queued dispatches still run.
    pub fn close(self) {
        drop(self.tx);
    }
}

fn start_worker(session: Arc<SessionState>) -> (mpsc::UnboundedSender<AuthChange>, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<AuthChange>();
    let worker = tokio::spawn(async move {
        while let Some(change) = rx.recv().await {
            let report = session.dispatch(&change).await;
            debug!(new = ?change.new_status, failures = report.failures(), "notifier: dispatch complete");
        }
    });
    (tx, worker)
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        return (*s).to_string();
    }
    if let Some(s) = panic.downcast_ref::<String>() {
        return s.clone();
    }
    "unknown panic".into()
}

#[cfg(test)]
#[path = "notifier_test.rs"]
mod tests;
