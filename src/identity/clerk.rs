//! Clerk Backend API client.
//!
//! Session tokens are verified locally against the instance JWKS; user
//! records come from `/users/{id}`. Pure parsing lives in `parse_user` and
//! `session_info_from_claims` for testability.
//!
//! Only algorithms on the configured allow-list (RS256 by default) are
//! accepted, and the token header must agree with the `alg` its key
//! publishes. The header is attacker-controlled and never chooses on its own.
//!
//! The JWKS is fetched once and cached for the process. Failures that could
//! be explained by key rotation ask for a reset, throttled to one per
//! `JWKS_RESET_INTERVAL` so a stream of forged tokens cannot turn every
//! request into a JWKS fetch.

use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::jwk::{Jwk, JwkSet};
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use super::{IdentityClient, IdentityError, SessionInfo, UserRecord};
use crate::config::{AuthConfig, ClaimsOptions};

const JWKS_RESET_INTERVAL: Duration = Duration::from_secs(10);

type Claims = serde_json::Map<String, serde_json::Value>;

// =============================================================================
// CLIENT
// =============================================================================

pub struct ClerkClient {
    http: reqwest::Client,
    api_url: String,
    secret_key: String,
    claims: ClaimsOptions,
    jwks: RwLock<Option<Arc<JwkSet>>>,
    last_jwks_reset: Mutex<Option<Instant>>,
}

impl ClerkClient {
    /// Build a client from bridge config.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client fails to build.
    pub fn from_config(config: &AuthConfig) -> Result<Self, IdentityError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeouts.request_secs))
            .connect_timeout(Duration::from_secs(config.timeouts.connect_secs))
            .build()
            .map_err(|e| IdentityError::HttpClientBuild(e.to_string()))?;
        Ok(Self {
            http,
            api_url: config.api_url.clone(),
            secret_key: config.secret_key.clone(),
            claims: config.claims.clone(),
            jwks: RwLock::new(None),
            last_jwks_reset: Mutex::new(None),
        })
    }

    /// Return the cached JWKS, fetching it on first use.
    async fn jwks(&self) -> Result<Arc<JwkSet>, IdentityError> {
        if let Some(keys) = self.jwks.read().await.as_ref() {
            return Ok(Arc::clone(keys));
        }

        let mut slot = self.jwks.write().await;
        // Another task may have filled the slot while we waited for the lock.
        if let Some(keys) = slot.as_ref() {
            return Ok(Arc::clone(keys));
        }
        let keys = Arc::new(self.fetch_jwks().await?);
        debug!(keys = keys.keys.len(), "identity: jwks fetched");
        *slot = Some(Arc::clone(&keys));
        Ok(keys)
    }

    async fn fetch_jwks(&self) -> Result<JwkSet, IdentityError> {
        let text = self.get(&format!("{}/jwks", self.api_url)).await?;
        serde_json::from_str(&text).map_err(|e| IdentityError::ApiParse(e.to_string()))
    }

    /// Drop the cached JWKS so the next verification refetches it.
    ///
    /// Returns false when a reset happened too recently and this one was skipped.
    async fn request_jwks_reset(&self) -> bool {
        {
            let mut last = self
                .last_jwks_reset
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if last.is_some_and(|at| at.elapsed() < JWKS_RESET_INTERVAL) {
                warn!("identity: jwks reset requested too soon");
                return false;
            }
            *last = Some(Instant::now());
        }
        *self.jwks.write().await = None;
        true
    }

    async fn get(&self, url: &str) -> Result<String, IdentityError> {
        let response = self
            .http
            .get(url)
            .bearer_auth(&self.secret_key)
            .send()
            .await
            .map_err(|e| IdentityError::ApiRequest(e.to_string()))?;

        let status = response.status().as_u16();
        let text = response
            .text()
            .await
            .map_err(|e| IdentityError::ApiRequest(e.to_string()))?;

        if !(200..300).contains(&status) {
            return Err(IdentityError::ApiResponse { status, body: text });
        }
        Ok(text)
    }

    fn validation(&self, alg: Algorithm) -> Validation {
        let mut validation = Validation::new(alg);
        validation.algorithms = self.claims.algorithms.clone();
        validation.leeway = self.claims.leeway_secs;
        validation.validate_exp = true;
        validation.validate_nbf = true;
        // Session tokens carry `azp`, not `aud`; azp is checked separately.
        validation.validate_aud = false;
        validation.set_required_spec_claims(&["exp", "nbf", "sub"]);
        if let Some(issuer) = &self.claims.issuer {
            validation.set_issuer(&[issuer]);
        }
        validation
    }
}

#[async_trait::async_trait]
impl IdentityClient for ClerkClient {
    async fn verify_session(&self, token: &str) -> Result<SessionInfo, IdentityError> {
        let header = match jsonwebtoken::decode_header(token) {
            Ok(header) => header,
            Err(e) => {
                self.request_jwks_reset().await;
                return Err(IdentityError::TokenRejected(e.to_string()));
            }
        };
        if !self.claims.algorithms.contains(&header.alg) {
            return Err(IdentityError::TokenRejected(format!("algorithm {:?} not allowed", header.alg)));
        }
        let Some(kid) = header.kid.clone() else {
            return Err(IdentityError::TokenRejected("token header has no kid".into()));
        };

        let mut keys = self.jwks().await?;
        if keys.find(&kid).is_none() && self.request_jwks_reset().await {
            keys = self.jwks().await?;
        }
        let Some(jwk) = keys.find(&kid) else {
            return Err(IdentityError::UnknownSigningKey(kid));
        };
        check_key_algorithm(jwk, header.alg)?;
        let key = DecodingKey::from_jwk(jwk).map_err(|e| IdentityError::TokenRejected(e.to_string()))?;

        let data = match jsonwebtoken::decode::<Claims>(token, &key, &self.validation(header.alg)) {
            Ok(data) => data,
            Err(e) => {
                if matches!(e.kind(), ErrorKind::InvalidSignature | ErrorKind::InvalidToken) {
                    self.request_jwks_reset().await;
                }
                return Err(IdentityError::TokenRejected(e.to_string()));
            }
        };

        session_info_from_claims(data.claims, &self.claims.authorized_parties)
    }

    async fn fetch_user(&self, user_id: &str) -> Result<UserRecord, IdentityError> {
        let url = format!("{}/users/{user_id}", self.api_url);
        match self.get(&url).await {
            Ok(text) => parse_user(&text),
            Err(IdentityError::ApiResponse { status: 404, .. }) => Err(IdentityError::UserNotFound(user_id.to_string())),
            Err(e) => Err(e),
        }
    }
}

// =============================================================================
// PARSING
// =============================================================================

/// A key that names its algorithm only verifies tokens signed with it.
fn check_key_algorithm(jwk: &Jwk, alg: Algorithm) -> Result<(), IdentityError> {
    let Some(key_alg) = jwk.common.key_algorithm else {
        return Ok(());
    };
    match Algorithm::from_str(&key_alg.to_string()) {
        Ok(published) if published == alg => Ok(()),
        _ => Err(IdentityError::TokenRejected(format!(
            "token algorithm {alg:?} does not match key algorithm {key_alg}"
        ))),
    }
}

/// Lift identifiers out of validated claims and apply the `azp` allow-list.
fn session_info_from_claims(claims: Claims, authorized_parties: &[String]) -> Result<SessionInfo, IdentityError> {
    let field = |key: &str| {
        claims
            .get(key)
            .and_then(serde_json::Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };

    let Some(user_id) = field("sub") else {
        return Err(IdentityError::TokenRejected("token has no sub claim".into()));
    };
    let Some(session_id) = field("sid") else {
        return Err(IdentityError::TokenRejected("token has no sid claim".into()));
    };
    if !authorized_parties.is_empty() {
        match field("azp") {
            Some(azp) if authorized_parties.contains(&azp) => {}
            other => {
                return Err(IdentityError::TokenRejected(format!(
                    "unauthorized party: {}",
                    other.as_deref().unwrap_or("<none>")
                )));
            }
        }
    }
    let expires_at = claims
        .get("exp")
        .and_then(serde_json::Value::as_i64)
        .unwrap_or_default();

    Ok(SessionInfo { user_id, session_id, expires_at, claims })
}

#[derive(serde::Deserialize)]
struct ApiUser {
    id: String,
    first_name: Option<String>,
    last_name: Option<String>,
    username: Option<String>,
    #[serde(default)]
    email_addresses: Vec<ApiEmail>,
    primary_email_address_id: Option<String>,
    #[serde(default)]
    has_image: bool,
    image_url: Option<String>,
}

#[derive(serde::Deserialize)]
struct ApiEmail {
    id: Option<String>,
    email_address: String,
}

fn parse_user(json: &str) -> Result<UserRecord, IdentityError> {
    let raw: serde_json::Value = serde_json::from_str(json).map_err(|e| IdentityError::ApiParse(e.to_string()))?;
    let api: ApiUser = serde_json::from_value(raw.clone()).map_err(|e| IdentityError::ApiParse(e.to_string()))?;

    let primary = api
        .primary_email_address_id
        .as_deref()
        .and_then(|pid| {
            api.email_addresses
                .iter()
                .find(|e| e.id.as_deref() == Some(pid))
        })
        .or_else(|| api.email_addresses.first())
        .map(|e| e.email_address.clone());

    let non_empty = |s: Option<String>| s.filter(|v| !v.is_empty());

    Ok(UserRecord {
        id: api.id,
        first_name: non_empty(api.first_name),
        last_name: non_empty(api.last_name),
        username: non_empty(api.username),
        email_address: primary,
        has_image: api.has_image,
        image_url: non_empty(api.image_url),
        raw,
    })
}

#[cfg(test)]
#[path = "clerk_test.rs"]
mod tests;
