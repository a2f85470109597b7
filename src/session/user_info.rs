//! Optional per-connection cache of richer user attributes.
//!
//! Kept apart from `SessionState` so connections that only need "signed in
//! as whom" never pay for a user fetch. The cache is keyed implicitly by the
//! session's current user: the session invalidates it when that user goes
//! away, and a generation counter stops a fetch that was in flight across
//! the invalidation from writing stale data back.

use std::sync::{Mutex, PoisonError};

use serde::Serialize;
use tracing::debug;

use super::{SessionState, SessionStatus};
use crate::frame::{Data, Frame};
use crate::identity::{IdentityError, UserRecord};
use crate::notifier::{AuthChange, AuthChangeHandler, HandlerContext, HandlerError};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UserInfo {
    pub is_loading: bool,
    pub user: Option<UserRecord>,
}

impl UserInfo {
    #[must_use]
    pub fn to_data(&self) -> Data {
        let mut data = Data::new();
        data.insert("is_loading".into(), serde_json::json!(self.is_loading));
        data.insert("user".into(), serde_json::to_value(&self.user).unwrap_or_default());
        data
    }
}

#[derive(Default)]
struct Inner {
    info: UserInfo,
    generation: u64,
}

#[derive(Default)]
pub struct UserInfoState {
    inner: Mutex<Inner>,
}

impl UserInfoState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn snapshot(&self) -> UserInfo {
        self.lock().info.clone()
    }

    /// Forget the cached user and orphan any fetch in flight.
    pub fn invalidate(&self) {
        let mut inner = self.lock();
        inner.generation += 1;
        inner.info = UserInfo::default();
        debug!(generation = inner.generation, "user_info: invalidated");
    }

    /// Fetch the signed-in user's record into the cache.
    ///
    /// # Errors
    ///
    /// `MissingUser` when nobody is signed in (or the user signed out while
    /// the fetch was running); otherwise the identity client's error, in
    /// which case any previously cached record is kept.
    pub async fn load(&self, session: &SessionState) -> Result<UserRecord, IdentityError> {
        let generation = {
            let mut inner = self.lock();
            inner.info.is_loading = true;
            inner.generation
        };

        let result = session.fetch_user().await;

        let mut inner = self.lock();
        if inner.generation != generation {
            debug!("user_info: discarded fetch that raced an invalidation");
            return Err(IdentityError::MissingUser);
        }
        inner.info.is_loading = false;
        match result {
            Ok(user) => {
                inner.info.user = Some(user.clone());
                Ok(user)
            }
            Err(IdentityError::MissingUser) => {
                inner.info.user = None;
                Err(IdentityError::MissingUser)
            }
            Err(e) => Err(e),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// =============================================================================
// AUTOLOAD HANDLER
// =============================================================================

/// Opt-in handler that fetches user info on every sign-in and pushes it to
/// the browser as `user:changed`. Connections without a `UserInfoState`
/// are skipped.
pub struct LoadUserInfo;

#[async_trait::async_trait]
impl AuthChangeHandler for LoadUserInfo {
    fn name(&self) -> &str {
        "load_user_info"
    }

    async fn on_auth_change(&self, ctx: &HandlerContext<'_>, change: &AuthChange) -> Result<(), HandlerError> {
        let session = ctx.session();
        let Some(user_info) = session.user_info() else {
            return Ok(());
        };
        if change.new_status != SessionStatus::SignedIn {
            return Ok(());
        }
        user_info.load(session).await?;
        session.emit(Frame::request("user:changed", user_info.snapshot().to_data()));
        Ok(())
    }
}

#[cfg(test)]
#[path = "user_info_test.rs"]
mod tests;
