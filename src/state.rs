//! Shared application state.
//!
//! DESIGN
//! ======
//! `AppState` is injected into Axum handlers via the `State` extractor. It
//! holds everything that is process-wide: config, the identity client, the
//! auth-change registry and the page registry. Per-connection state
//! (`SessionState`) is built from it on websocket upgrade and never shared.
//!
//! Handlers and pages are registered while wiring the app, before serving.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::config::AuthConfig;
use crate::frame::Frame;
use crate::guard::{LoadAction, LoadGuard};
use crate::identity::IdentityClient;
use crate::notifier::{AuthChangeHandler, ChangeNotifier};
use crate::pages::Pages;
use crate::session::{SessionState, UserInfoState};

/// Clone is required by Axum; all inner fields are Arc-wrapped or Copy.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AuthConfig>,
    pub identity: Arc<dyn IdentityClient>,
    pub notifier: Arc<ChangeNotifier>,
    pub guard: LoadGuard,
    pub pages: Arc<Pages>,
}

impl AppState {
    #[must_use]
    pub fn new(config: AuthConfig, identity: Arc<dyn IdentityClient>) -> Self {
        let guard = LoadGuard::new(config.auth_wait_timeout);
        Self {
            config: Arc::new(config),
            identity,
            notifier: Arc::new(ChangeNotifier::new()),
            guard,
            pages: Arc::new(Pages::new()),
        }
    }

    /// Subscribe `handler` to every firing transition on every connection.
    pub fn register_on_auth_change_handler(&self, handler: Arc<dyn AuthChangeHandler>) {
        self.notifier.register(handler);
    }

    /// Register `actions` for `route`, behind the auth-check barrier.
    pub fn add_page(&self, route: impl Into<String>, actions: Vec<Arc<dyn LoadAction>>) {
        self.pages.add_page(route, self.guard.on_load(actions));
    }

    /// Fresh `Loading` session for a new connection.
    #[must_use]
    pub fn new_session(&self, outbox: mpsc::Sender<Frame>) -> SessionState {
        let session =
            SessionState::new(Arc::clone(&self.identity), Arc::clone(&self.notifier)).with_outbox(outbox);
        if self.config.register_user_state || self.config.autoload_user_info {
            session.with_user_info(Arc::new(UserInfoState::new()))
        } else {
            session
        }
    }
}

// =============================================================================
// TEST HELPERS
// =============================================================================

#[cfg(test)]
pub mod test_helpers {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    use crate::config::{ClaimsOptions, HttpTimeouts};
    use crate::identity::{IdentityError, SessionInfo, UserRecord};
    use crate::notifier::{AuthChange, HandlerError, handler_fn};

    /// Config pointing the identity client at `api_url` with test secrets.
    #[must_use]
    pub fn test_config(api_url: &str) -> AuthConfig {
        AuthConfig {
            publishable_key: "pk_test_bridge".into(),
            secret_key: "sk_test_secret".into(),
            api_url: api_url.trim_end_matches('/').to_string(),
            auth_wait_timeout: Duration::from_millis(200),
            claims: ClaimsOptions::default(),
            register_user_state: true,
            autoload_user_info: false,
            timeouts: HttpTimeouts { request_secs: 2, connect_secs: 1 },
        }
    }

    /// Token understood by `MockIdentity`: `tok:<user_id>:<session_id>`.
    #[must_use]
    pub fn token(user_id: &str, session_id: &str) -> String {
        format!("tok:{user_id}:{session_id}")
    }

    #[must_use]
    pub fn user_record(id: &str) -> UserRecord {
        UserRecord {
            id: id.into(),
            first_name: Some("Test".into()),
            last_name: Some(id.into()),
            username: None,
            email_address: Some(format!("{id}@example.test")),
            has_image: false,
            image_url: None,
            raw: serde_json::json!({"id": id}),
        }
    }

    /// Identity client without a network.
    ///
    /// - `tok:<user>:<sid>` verifies; `down` fails as an outage; anything
    ///   else is rejected.
    /// - `fetch_user` returns `user_record(id)` unless `user_gone` or
    ///   `fail_fetches` is set.
    #[derive(Default)]
    pub struct MockIdentity {
        pub fetch_delay: Option<Duration>,
        pub fail_fetches: AtomicBool,
        pub verify_calls: AtomicUsize,
        pub fetch_calls: AtomicUsize,
    }

    impl MockIdentity {
        #[must_use]
        pub fn with_fetch_delay(delay: Duration) -> Self {
            Self { fetch_delay: Some(delay), ..Self::default() }
        }

        #[must_use]
        pub fn fetches(&self) -> usize {
            self.fetch_calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl IdentityClient for MockIdentity {
        async fn verify_session(&self, token: &str) -> Result<SessionInfo, IdentityError> {
            self.verify_calls.fetch_add(1, Ordering::SeqCst);
            if token == "down" {
                return Err(IdentityError::ApiRequest("connection refused".into()));
            }
            let Some((user_id, session_id)) = token.strip_prefix("tok:").and_then(|rest| rest.split_once(':')) else {
                return Err(IdentityError::TokenRejected("malformed token".into()));
            };
            Ok(SessionInfo {
                user_id: user_id.into(),
                session_id: session_id.into(),
                expires_at: i64::MAX,
                claims: serde_json::Map::new(),
            })
        }

        async fn fetch_user(&self, user_id: &str) -> Result<UserRecord, IdentityError> {
            self.fetch_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.fetch_delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail_fetches.load(Ordering::SeqCst) {
                return Err(IdentityError::ApiResponse { status: 503, body: String::new() });
            }
            if user_id == "user_gone" {
                return Err(IdentityError::UserNotFound(user_id.into()));
            }
            Ok(user_record(user_id))
        }
    }

    /// `AppState` over a `MockIdentity`.
    #[must_use]
    pub fn test_app_state() -> AppState {
        test_app_state_with(Arc::new(MockIdentity::default()))
    }

    #[must_use]
    pub fn test_app_state_with(identity: Arc<MockIdentity>) -> AppState {
        AppState::new(test_config("http://127.0.0.1:9"), identity)
    }

    /// Serve the full router on an ephemeral local port.
    pub async fn spawn_server(state: AppState) -> std::net::SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind test listener");
        let addr = listener.local_addr().expect("listener addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, crate::routes::app(state)).await;
        });
        addr
    }

    /// Standalone session (no outbox, no user info) over `identity`.
    #[must_use]
    pub fn test_session(identity: Arc<MockIdentity>, notifier: Arc<ChangeNotifier>) -> SessionState {
        SessionState::new(identity, notifier)
    }

    /// Shared log of `label:new_status` entries written by recording handlers.
    pub type CallLog = Arc<Mutex<Vec<String>>>;

    /// Handler that appends `"{label}:{new_status:?}"` to `log`.
    pub fn recording_handler(label: &'static str, log: &CallLog) -> Arc<dyn AuthChangeHandler> {
        let log = Arc::clone(log);
        handler_fn(label, move |change: AuthChange| {
            let log = Arc::clone(&log);
            async move {
                log.lock()
                    .expect("log mutex")
                    .push(format!("{label}:{:?}", change.new_status));
                Ok::<(), HandlerError>(())
            }
        })
    }
}

#[cfg(test)]
#[path = "state_test.rs"]
mod tests;
