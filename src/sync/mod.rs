//! Synchronizer — turns the browser's settled auth signal into session
//! transitions.
//!
//! ARCHITECTURE
//! ============
//! The browser side (`observer::SignalObserver`) decides *when* to push; the
//! server side (`Synchronizer`) decides *what* the push means. A signed-in
//! push carries a freshly minted session token, never bare identifiers, so
//! the server only believes what the identity provider vouches for.
//!
//! ```text
//!   SDK signal ──► SignalObserver ──► session:set {token} ──► Synchronizer
//!                                     session:clear              │
//!                                                                ▼
//!                                          verify_session ──► commit ──► handlers
//! ```
//!
//! The synchronizer is the only writer of `SessionState`. Without a queue it
//! runs handlers inline; a connection gives it a `DispatchQueue` so handlers
//! run on a worker and the ws loop keeps reading frames.

pub mod observer;

use std::sync::Arc;

use tracing::{info, warn};

use crate::frame::{ErrorCode, Frame};
use crate::identity::IdentityError;
use crate::notifier::DispatchQueue;
use crate::session::{SessionState, Transition, TransitionOutcome};

pub use observer::{Signal, SignalObserver, SyncAction};

// =============================================================================
// EVENTS
// =============================================================================

/// A settled (or explicitly loading) report from the browser.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    Loading,
    SignedIn { token: String },
    SignedOut,
}

impl SyncEvent {
    /// Decode a `session:set` / `session:clear` / `session:loading` frame.
    ///
    /// # Errors
    ///
    /// `MissingToken` for a `session:set` without a token, `UnknownOp` for
    /// any other syscall.
    pub fn from_frame(frame: &Frame) -> Result<Self, SyncError> {
        match frame.op() {
            "set" => match frame.str_field("token").filter(|t| !t.is_empty()) {
                Some(token) => Ok(Self::SignedIn { token: token.to_string() }),
                None => Err(SyncError::MissingToken),
            },
            "clear" => Ok(Self::SignedOut),
            "loading" => Ok(Self::Loading),
            other => Err(SyncError::UnknownOp(other.to_string())),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("session:set requires a token")]
    MissingToken,
    #[error("unknown session op: {0}")]
    UnknownOp(String),
    /// The provider could not be reached; the session was left as it was.
    #[error(transparent)]
    Identity(IdentityError),
}

impl ErrorCode for SyncError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::MissingToken => "E_MISSING_TOKEN",
            Self::UnknownOp(_) => "E_UNKNOWN_OP",
            Self::Identity(e) => e.error_code(),
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, Self::Identity(e) if e.retryable())
    }
}

// =============================================================================
// SYNCHRONIZER
// =============================================================================

pub struct Synchronizer {
    session: Arc<SessionState>,
    queue: Option<DispatchQueue>,
}

impl Synchronizer {
    /// Synchronizer that awaits every handler before `handle` returns.
    #[must_use]
    pub fn new(session: Arc<SessionState>) -> Self {
        Self { session, queue: None }
    }

    /// Synchronizer that hands dispatches to a per-connection worker.
    #[must_use]
    pub fn queued(session: Arc<SessionState>) -> Self {
        let queue = DispatchQueue::spawn(Arc::clone(&session));
        Self { session, queue: Some(queue) }
    }

    #[must_use]
    pub fn session(&self) -> &Arc<SessionState> {
        &self.session
    }

    /// Apply one browser report to the session.
    ///
    /// A token the provider rejects reads as signed out.
    ///
    /// # Errors
    ///
    /// `SyncError::Identity` when verification failed for reasons unrelated
    /// to the token itself (network, provider outage). State is untouched.
    pub async fn handle(&self, event: SyncEvent) -> Result<TransitionOutcome, SyncError> {
        let transition = match event {
            SyncEvent::Loading => return Ok(TransitionOutcome::Unchanged),
            SyncEvent::SignedOut => Transition::signed_out(),
            SyncEvent::SignedIn { token } => match self.session.client().verify_session(&token).await {
                Ok(info) => Transition::signed_in(info.user_id, info.session_id),
                Err(e) if e.is_rejection() => {
                    info!(error = %e, "sync: token rejected, treating as signed out");
                    Transition::signed_out()
                }
                Err(e) => {
                    warn!(error = %e, "sync: verification unavailable, session unchanged");
                    return Err(SyncError::Identity(e));
                }
            },
        };
        let Some(queue) = &self.queue else {
            return Ok(self.session.apply_transition(transition).await);
        };
        Ok(match self.session.commit(&transition) {
            Err(e) => TransitionOutcome::Rejected(e),
            Ok(None) => TransitionOutcome::Unchanged,
            Ok(Some(change)) => {
                queue.enqueue(change);
                TransitionOutcome::Queued
            }
        })
    }

    /// Cancel handler work in flight or queued for this connection.
    pub fn cancel_dispatch(&mut self) {
        if let Some(queue) = &mut self.queue {
            queue.cancel();
        }
    }

    /// Let queued dispatches finish, then stop the worker.
    pub fn close(&mut self) {
        if let Some(queue) = self.queue.take() {
            queue.close();
        }
    }
}

#[cfg(test)]
#[path = "sync_test.rs"]
mod tests;
