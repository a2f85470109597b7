//! Remote identity — typed client for the identity provider's backend.
//!
//! DESIGN
//! ======
//! The bridge never performs the sign-in handshake itself. It only needs two
//! answers from the provider: "is this session token genuine, and whose is
//! it" and "what does this user look like". `IdentityClient` is the seam;
//! `ClerkClient` is the HTTP implementation and tests plug in mocks.
//!
//! Errors split into two families. Token *rejections* mean the client's
//! claim is false and the session should read as signed out. Remote
//! *failures* (timeouts, 5xx, garbled bodies) say nothing about the visitor
//! and must not move session state.

pub mod clerk;

use serde::Serialize;

pub use clerk::ClerkClient;

// =============================================================================
// ERROR
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    /// The token failed signature or claim validation.
    #[error("session token rejected: {0}")]
    TokenRejected(String),

    /// The token names a signing key the provider does not publish.
    #[error("unknown signing key: {0}")]
    UnknownSigningKey(String),

    /// A user lookup was requested while nobody is signed in.
    #[error("no signed-in user")]
    MissingUser,

    /// The provider has no record of the requested user.
    #[error("user not found: {0}")]
    UserNotFound(String),

    /// The HTTP request to the provider failed.
    #[error("identity API request failed: {0}")]
    ApiRequest(String),

    /// The provider returned a non-success HTTP status.
    #[error("identity API response error: status {status}")]
    ApiResponse { status: u16, body: String },

    /// The provider response body could not be deserialized.
    #[error("identity API response parse failed: {0}")]
    ApiParse(String),

    /// The underlying HTTP client could not be constructed.
    #[error("HTTP client build failed: {0}")]
    HttpClientBuild(String),
}

impl IdentityError {
    /// True when the provider positively refused the token.
    #[must_use]
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::TokenRejected(_) | Self::UnknownSigningKey(_))
    }
}

impl crate::frame::ErrorCode for IdentityError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::TokenRejected(_) => "E_TOKEN_REJECTED",
            Self::UnknownSigningKey(_) => "E_UNKNOWN_SIGNING_KEY",
            Self::MissingUser => "E_MISSING_USER",
            Self::UserNotFound(_) => "E_USER_NOT_FOUND",
            Self::ApiRequest(_) => "E_API_REQUEST",
            Self::ApiResponse { .. } => "E_API_RESPONSE",
            Self::ApiParse(_) => "E_API_PARSE",
            Self::HttpClientBuild(_) => "E_HTTP_CLIENT_BUILD",
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, Self::ApiRequest(_) | Self::ApiResponse { status: 429 | 500..=599, .. })
    }
}

// =============================================================================
// TYPES
// =============================================================================

/// A verified session token.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionInfo {
    pub user_id: String,
    pub session_id: String,
    /// `exp` claim, seconds since Unix epoch.
    pub expires_at: i64,
    /// Every claim from the token, including the ones lifted above.
    pub claims: serde_json::Map<String, serde_json::Value>,
}

/// The subset of a provider user record the bridge exposes.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserRecord {
    pub id: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub username: Option<String>,
    pub email_address: Option<String>,
    pub has_image: bool,
    pub image_url: Option<String>,
    /// Full provider payload for callers needing more attributes.
    pub raw: serde_json::Value,
}

impl UserRecord {
    /// Best human-readable name: full name, then username, then email.
    #[must_use]
    pub fn display_name(&self) -> Option<String> {
        let full = [self.first_name.as_deref(), self.last_name.as_deref()]
            .into_iter()
            .flatten()
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join(" ");
        if !full.is_empty() {
            return Some(full);
        }
        self.username
            .clone()
            .or_else(|| self.email_address.clone())
    }
}

// =============================================================================
// CLIENT TRAIT
// =============================================================================

/// Request/response access to the identity provider.
#[async_trait::async_trait]
pub trait IdentityClient: Send + Sync {
    /// Verify a session token minted by the browser SDK.
    async fn verify_session(&self, token: &str) -> Result<SessionInfo, IdentityError>;

    /// Fetch the provider's record for `user_id`.
    async fn fetch_user(&self, user_id: &str) -> Result<UserRecord, IdentityError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::ErrorCode;

    fn record() -> UserRecord {
        UserRecord {
            id: "user_1".into(),
            first_name: None,
            last_name: None,
            username: None,
            email_address: None,
            has_image: false,
            image_url: None,
            raw: serde_json::Value::Null,
        }
    }

    #[test]
    fn rejection_errors_are_not_retryable() {
        let err = IdentityError::TokenRejected("expired".into());
        assert!(err.is_rejection());
        assert!(!err.retryable());
        assert_eq!(err.error_code(), "E_TOKEN_REJECTED");
        assert!(IdentityError::UnknownSigningKey("kid".into()).is_rejection());
    }

    #[test]
    fn remote_failures_are_retryable_but_not_rejections() {
        let err = IdentityError::ApiRequest("timed out".into());
        assert!(!err.is_rejection());
        assert!(err.retryable());

        let err = IdentityError::ApiResponse { status: 503, body: String::new() };
        assert!(err.retryable());
        let err = IdentityError::ApiResponse { status: 401, body: String::new() };
        assert!(!err.retryable());
    }

    #[test]
    fn display_name_prefers_full_name() {
        let mut user = record();
        user.first_name = Some("Ada".into());
        user.last_name = Some("Lovelace".into());
        user.username = Some("ada".into());
        assert_eq!(user.display_name().as_deref(), Some("Ada Lovelace"));
    }

    #[test]
    fn display_name_falls_back_to_username_then_email() {
        let mut user = record();
        user.email_address = Some("ada@example.test".into());
        assert_eq!(user.display_name().as_deref(), Some("ada@example.test"));
        user.username = Some("ada".into());
        assert_eq!(user.display_name().as_deref(), Some("ada"));
    }

    #[test]
    fn display_name_none_when_nothing_known() {
        assert_eq!(record().display_name(), None);
    }
}
