//! Session state — the server's live mirror of the browser's auth status.
//!
//! ARCHITECTURE
//! ============
//! One `SessionState` exists per bridge connection. It is created `Loading`
//! and only the synchronizer moves it, through `commit` (or `apply_transition`,
//! which also runs the handlers inline). Readers (page loads, handlers, the
//! ws loop) see it through a `watch` channel so waiting for "settled" is a
//! join on the channel rather than a poll.
//!
//! INVARIANTS
//! ==========
//! - `user_id` and `session_id` are both set iff `status == SignedIn`.
//! - The status never returns to `Loading`; a reconnect builds a new state.
//! - A firing transition is committed before any handler runs, so handlers
//!   always observe the new state.
//! - Rejected transitions leave the state untouched.

pub mod user_info;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::frame::{Data, Frame};
use crate::identity::{IdentityClient, IdentityError, UserRecord};
use crate::notifier::{AuthChange, ChangeNotifier, DispatchReport, HandlerContext};
pub use user_info::{UserInfo, UserInfoState};

// =============================================================================
// STATUS
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Loading,
    SignedIn,
    SignedOut,
}

impl SessionStatus {
    /// True once the first synchronization has landed.
    #[must_use]
    pub fn is_settled(self) -> bool {
        !matches!(self, SessionStatus::Loading)
    }
}

/// Point-in-time copy of a session's fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSnapshot {
    pub status: SessionStatus,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
}

impl SessionSnapshot {
    #[must_use]
    pub fn loading() -> Self {
        Self { status: SessionStatus::Loading, user_id: None, session_id: None }
    }

    #[must_use]
    pub fn is_signed_in(&self) -> bool {
        self.status == SessionStatus::SignedIn
    }

    /// Payload form used by `session:*` frames.
    #[must_use]
    pub fn to_data(&self) -> Data {
        let mut data = Data::new();
        data.insert("status".into(), serde_json::json!(self.status));
        data.insert("user_id".into(), serde_json::json!(self.user_id));
        data.insert("session_id".into(), serde_json::json!(self.session_id));
        data.insert("auth_checked".into(), serde_json::json!(self.status.is_settled()));
        data
    }
}

// =============================================================================
// TRANSITION
// =============================================================================

/// A requested move to a settled status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub status: SessionStatus,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
}

impl Transition {
    pub fn signed_in(user_id: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self { status: SessionStatus::SignedIn, user_id: Some(user_id.into()), session_id: Some(session_id.into()) }
    }

    #[must_use]
    pub fn signed_out() -> Self {
        Self { status: SessionStatus::SignedOut, user_id: None, session_id: None }
    }

    /// Check the paired-identifier invariant and return the target snapshot.
    fn validate(&self) -> Result<SessionSnapshot, TransitionError> {
        let present = |v: &Option<String>| v.as_deref().is_some_and(|s| !s.is_empty());
        match self.status {
            SessionStatus::Loading => Err(TransitionError::BackToLoading),
            SessionStatus::SignedIn if present(&self.user_id) && present(&self.session_id) => Ok(SessionSnapshot {
                status: SessionStatus::SignedIn,
                user_id: self.user_id.clone(),
                session_id: self.session_id.clone(),
            }),
            SessionStatus::SignedIn => Err(TransitionError::UnpairedIdentifiers),
            SessionStatus::SignedOut if self.user_id.is_none() && self.session_id.is_none() => {
                Ok(SessionSnapshot { status: SessionStatus::SignedOut, user_id: None, session_id: None })
            }
            SessionStatus::SignedOut => Err(TransitionError::IdentifiersWhileSignedOut),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    #[error("signed-in transition needs both user_id and session_id")]
    UnpairedIdentifiers,
    #[error("signed-out transition must not carry identifiers")]
    IdentifiersWhileSignedOut,
    #[error("sessions never transition back to loading")]
    BackToLoading,
}

impl crate::frame::ErrorCode for TransitionError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::UnpairedIdentifiers => "E_UNPAIRED_IDENTIFIERS",
            Self::IdentifiersWhileSignedOut => "E_IDENTIFIERS_WHILE_SIGNED_OUT",
            Self::BackToLoading => "E_BACK_TO_LOADING",
        }
    }
}

/// What a transition did.
#[derive(Debug)]
pub enum TransitionOutcome {
    /// Invariant violated; nothing changed.
    Rejected(TransitionError),
    /// Identical to the current state; no fan-out.
    Unchanged,
    /// State committed and handlers dispatched.
    Fired(DispatchReport),
    /// State committed; the dispatch was handed to the connection's queue.
    Queued,
}

impl TransitionOutcome {
    #[must_use]
    pub fn fired(&self) -> bool {
        matches!(self, TransitionOutcome::Fired(_) | TransitionOutcome::Queued)
    }
}

// =============================================================================
// SESSION STATE
// =============================================================================

pub struct SessionState {
    tx: watch::Sender<SessionSnapshot>,
    client: Arc<dyn IdentityClient>,
    notifier: Arc<ChangeNotifier>,
    user_info: Option<Arc<UserInfoState>>,
    outbox: Option<mpsc::Sender<Frame>>,
}

impl SessionState {
    /// Fresh `Loading` state for a new connection.
    #[must_use]
    pub fn new(client: Arc<dyn IdentityClient>, notifier: Arc<ChangeNotifier>) -> Self {
        let (tx, _rx) = watch::channel(SessionSnapshot::loading());
        Self { tx, client, notifier, user_info: None, outbox: None }
    }

    /// Attach a user info cache that is invalidated on sign-out.
    #[must_use]
    pub fn with_user_info(mut self, user_info: Arc<UserInfoState>) -> Self {
        self.user_info = Some(user_info);
        self
    }

    /// Attach the connection's outbound frame channel for handler pushes.
    #[must_use]
    pub fn with_outbox(mut self, outbox: mpsc::Sender<Frame>) -> Self {
        self.outbox = Some(outbox);
        self
    }

    #[must_use]
    pub fn snapshot(&self) -> SessionSnapshot {
        self.tx.borrow().clone()
    }

    #[must_use]
    pub fn status(&self) -> SessionStatus {
        self.tx.borrow().status
    }

    #[must_use]
    pub fn is_signed_in(&self) -> bool {
        self.status() == SessionStatus::SignedIn
    }

    /// Receiver that observes every committed change.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.tx.subscribe()
    }

    #[must_use]
    pub fn client(&self) -> &Arc<dyn IdentityClient> {
        &self.client
    }

    #[must_use]
    pub fn user_info(&self) -> Option<&Arc<UserInfoState>> {
        self.user_info.as_ref()
    }

    /// Push a frame to this connection's browser. Drops the frame if the
    /// outbox is full or closed; callers include the ws loop itself, which
    /// must never block on its own outbox.
    pub fn emit(&self, frame: Frame) -> bool {
        let Some(outbox) = &self.outbox else {
            return false;
        };
        match outbox.try_send(frame) {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "session: dropped outbound frame");
                false
            }
        }
    }

    /// Fetch the provider record for the signed-in user.
    ///
    /// # Errors
    ///
    /// `MissingUser` when nobody is signed in, otherwise whatever the
    /// identity client reports.
    pub async fn fetch_user(&self) -> Result<UserRecord, IdentityError> {
        let Some(user_id) = self.snapshot().user_id else {
            return Err(IdentityError::MissingUser);
        };
        self.client.fetch_user(&user_id).await
    }

    /// Apply a settled status reported by the synchronizer and dispatch the
    /// change to every handler before returning.
    ///
    /// Never fails outward: invalid requests are logged and reported as
    /// `Rejected` with the state untouched.
    pub(crate) async fn apply_transition(&self, transition: Transition) -> TransitionOutcome {
        match self.commit(&transition) {
            Err(e) => TransitionOutcome::Rejected(e),
            Ok(None) => TransitionOutcome::Unchanged,
            Ok(Some(change)) => TransitionOutcome::Fired(self.dispatch(&change).await),
        }
    }

    /// Validate and commit `transition` without running handlers.
    ///
    /// Returns the change to dispatch, or `None` when the state already
    /// matched. Sign-out invalidation and the `session:changed` push happen
    /// here, so they are never skipped by a cancelled dispatch.
    pub(crate) fn commit(&self, transition: &Transition) -> Result<Option<AuthChange>, TransitionError> {
        let next = transition.validate().inspect_err(|e| {
            warn!(error = %e, ?transition, "session: rejected transition");
        })?;

        let mut replaced = None;
        self.tx.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            replaced = Some(std::mem::replace(current, next.clone()));
            true
        });
        let Some(previous) = replaced else {
            debug!(status = ?next.status, "session: no-op transition");
            return Ok(None);
        };

        info!(
            old = ?previous.status,
            new = ?next.status,
            user_id = next.user_id.as_deref().unwrap_or("-"),
            "session: transition"
        );

        if let Some(user_info) = &self.user_info {
            if previous.is_signed_in() && previous.user_id != next.user_id {
                user_info.invalidate();
            }
        }

        self.emit(Frame::request("session:changed", next.to_data()));
        Ok(Some(AuthChange {
            old_status: previous.status,
            new_status: next.status,
            user_id: next.user_id,
            session_id: next.session_id,
        }))
    }

    /// Run every registered handler against an already-committed change.
    pub(crate) async fn dispatch(&self, change: &AuthChange) -> DispatchReport {
        let ctx = HandlerContext::new(self);
        self.notifier.notify(&ctx, change).await
    }
}

#[cfg(test)]
#[path = "session_test.rs"]
mod tests;
