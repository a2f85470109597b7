//! Load-order guard — page-load actions that wait for the first auth sync.
//!
//! DESIGN
//! ======
//! Page entry starts two independent completions: the browser's identity SDK
//! settling (which arrives as a `session:*` frame) and the page's own load
//! actions. `LoadGuard::on_load` puts an `AwaitAuthCheck` step in front of
//! the supplied actions. That step is a join on the session's watch channel,
//! bounded by the configured wait, so actions never read a `Loading` status
//! that is about to change.
//!
//! TRADE-OFFS
//! ==========
//! The wait is bounded. If the SDK never settles the actions still run with
//! the session still `Loading` and the report says `auth_checked = false`.
//! A stuck client degrades to "unknown visitor" rather than a hung page.

use std::any::type_name;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tracing::{debug, warn};

use crate::frame::{Data, ErrorCode};
use crate::identity::IdentityError;
use crate::notifier::panic_message;
use crate::session::{SessionSnapshot, SessionState, SessionStatus};

// =============================================================================
// ERRORS
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error(transparent)]
    Identity(#[from] IdentityError),
    /// The action requires a signed-in visitor.
    #[error("sign-in required")]
    Unauthorized,
    #[error("{0}")]
    Failed(String),
    #[error("load action panicked: {0}")]
    Panicked(String),
}

impl ErrorCode for LoadError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Identity(e) => e.error_code(),
            Self::Unauthorized => "E_UNAUTHORIZED",
            Self::Failed(_) => "E_LOAD_FAILED",
            Self::Panicked(_) => "E_LOAD_PANICKED",
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, Self::Identity(e) if e.retryable())
    }
}

// =============================================================================
// ACTIONS
// =============================================================================

/// One page-load step supplied by the application.
#[async_trait::async_trait]
pub trait LoadAction: Send + Sync {
    fn name(&self) -> &str {
        type_name::<Self>()
    }

    async fn run(&self, session: &SessionState) -> Result<Data, LoadError>;
}

pub struct FnAction<F> {
    name: String,
    f: F,
}

#[async_trait::async_trait]
impl<F, Fut> LoadAction for FnAction<F>
where
    F: Fn(SessionSnapshot) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Data, LoadError>> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, session: &SessionState) -> Result<Data, LoadError> {
        (self.f)(session.snapshot()).await
    }
}

/// Wrap an async closure over the session snapshot as a load action.
pub fn action_fn<F, Fut>(name: impl Into<String>, f: F) -> Arc<dyn LoadAction>
where
    F: Fn(SessionSnapshot) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Data, LoadError>> + Send + 'static,
{
    Arc::new(FnAction { name: name.into(), f })
}

// =============================================================================
// GUARD
// =============================================================================

#[derive(Debug, Clone, Copy)]
pub struct LoadGuard {
    timeout: Duration,
}

impl LoadGuard {
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Prefix `actions` with the auth-check barrier.
    #[must_use]
    pub fn on_load(&self, actions: Vec<Arc<dyn LoadAction>>) -> LoadSequence {
        let steps = std::iter::once(LoadStep::AwaitAuthCheck)
            .chain(actions.into_iter().map(LoadStep::Action))
            .collect();
        LoadSequence { steps, timeout: self.timeout }
    }
}

#[derive(Clone)]
pub enum LoadStep {
    AwaitAuthCheck,
    Action(Arc<dyn LoadAction>),
}

impl std::fmt::Debug for LoadStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AwaitAuthCheck => f.write_str("AwaitAuthCheck"),
            Self::Action(action) => f.debug_tuple("Action").field(&action.name()).finish(),
        }
    }
}

// =============================================================================
// SEQUENCE
// =============================================================================

#[derive(Debug)]
pub struct ActionOutcome {
    pub name: String,
    pub result: Result<Data, LoadError>,
}

impl ActionOutcome {
    /// Item payload for `page:load` responses.
    #[must_use]
    pub fn to_data(&self) -> Data {
        let mut data = Data::new();
        data.insert("action".into(), serde_json::json!(self.name));
        match &self.result {
            Ok(payload) => {
                data.insert("ok".into(), serde_json::json!(true));
                data.insert("data".into(), serde_json::json!(payload));
            }
            Err(e) => {
                data.insert("ok".into(), serde_json::json!(false));
                data.insert(crate::frame::FRAME_CODE.into(), serde_json::json!(e.error_code()));
                data.insert(crate::frame::FRAME_MESSAGE.into(), serde_json::json!(e.to_string()));
            }
        }
        data
    }
}

#[derive(Debug)]
pub struct LoadReport {
    /// False when the barrier timed out before the session settled.
    pub auth_checked: bool,
    /// Session status the actions ran against.
    pub status: SessionStatus,
    pub actions: Vec<ActionOutcome>,
}

impl LoadReport {
    #[must_use]
    pub fn to_data(&self) -> Data {
        let mut data = Data::new();
        data.insert("auth_checked".into(), serde_json::json!(self.auth_checked));
        data.insert("status".into(), serde_json::json!(self.status));
        data.insert("actions".into(), serde_json::json!(self.actions.len()));
        data
    }
}

#[derive(Clone, Debug)]
pub struct LoadSequence {
    steps: Vec<LoadStep>,
    timeout: Duration,
}

impl LoadSequence {
    #[must_use]
    pub fn steps(&self) -> &[LoadStep] {
        &self.steps
    }

    pub async fn run(&self, session: &SessionState) -> LoadReport {
        self.run_with(session, |_| {}).await
    }

    /// Run every step in order, handing each action's outcome to
    /// `on_action` as soon as it completes.
    pub async fn run_with<F>(&self, session: &SessionState, mut on_action: F) -> LoadReport
    where
        F: FnMut(&ActionOutcome) + Send,
    {
        let mut auth_checked = session.status().is_settled();
        let mut actions = Vec::new();

        for step in &self.steps {
            match step {
                LoadStep::AwaitAuthCheck => {
                    auth_checked = await_auth_check(session, self.timeout).await;
                }
                LoadStep::Action(action) => {
                    let name = action.name().to_string();
                    let result = match AssertUnwindSafe(action.run(session)).catch_unwind().await {
                        Ok(result) => result,
                        Err(panic) => Err(LoadError::Panicked(panic_message(panic.as_ref()))),
                    };
                    if let Err(e) = &result {
                        warn!(action = %name, error = %e, "guard: load action failed");
                    }
                    let outcome = ActionOutcome { name, result };
                    on_action(&outcome);
                    actions.push(outcome);
                }
            }
        }

        LoadReport { auth_checked, status: session.status(), actions }
    }
}

/// Wait until the session leaves `Loading`, up to `timeout`.
async fn await_auth_check(session: &SessionState, timeout: Duration) -> bool {
    let mut rx = session.subscribe();
    let settled = tokio::time::timeout(timeout, rx.wait_for(|s| s.status.is_settled()))
        .await
        .map(|r| r.is_ok());
    match settled {
        Ok(true) => {
            debug!("guard: auth check complete");
            true
        }
        Ok(false) => false,
        Err(_) => {
            warn!(?timeout, "guard: auth check timed out, running actions unsettled");
            false
        }
    }
}

#[cfg(test)]
#[path = "guard_test.rs"]
mod tests;
