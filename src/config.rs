//! Bridge configuration parsed from environment variables.
//!
//! `from_env` is a thin wrapper over `from_lookup` so tests can feed a map
//! instead of mutating the process environment.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use jsonwebtoken::Algorithm;

pub const DEFAULT_API_URL: &str = "https://api.clerk.com/v1";
pub const DEFAULT_AUTH_WAIT_TIMEOUT_MS: u64 = 1000;
pub const DEFAULT_JWT_LEEWAY_SECS: u64 = 60;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 5;

// =============================================================================
// ERROR
// =============================================================================

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    /// A required key is unset or empty.
    #[error("missing required env var {var}")]
    Missing { var: &'static str },

    /// A value is present but cannot be parsed.
    #[error("invalid value for {var}: {value:?}")]
    Invalid { var: &'static str, value: String },
}

// =============================================================================
// TYPES
// =============================================================================

/// JWT claim checks applied to every session token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimsOptions {
    /// Clock-skew allowance for `exp` and `nbf`.
    pub leeway_secs: u64,
    /// Expected `iss`, if pinned.
    pub issuer: Option<String>,
    /// Allowed `azp` origins. Empty means any.
    pub authorized_parties: Vec<String>,
    /// Signature algorithms a session token may use. Never empty.
    pub algorithms: Vec<Algorithm>,
}

impl Default for ClaimsOptions {
    fn default() -> Self {
        Self {
            leeway_secs: DEFAULT_JWT_LEEWAY_SECS,
            issuer: None,
            authorized_parties: Vec::new(),
            algorithms: vec![Algorithm::RS256],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HttpTimeouts {
    pub request_secs: u64,
    pub connect_secs: u64,
}

#[derive(Clone, PartialEq, Eq)]
pub struct AuthConfig {
    /// Safe for client exposure; handed to the browser SDK.
    pub publishable_key: String,
    /// Server-only; used by the identity client.
    pub secret_key: String,
    pub api_url: String,
    /// Upper bound on how long guarded page loads wait for the first sync.
    pub auth_wait_timeout: Duration,
    pub claims: ClaimsOptions,
    /// Give every connection a `UserInfoState`.
    pub register_user_state: bool,
    /// Register the handler that fetches user info on sign-in.
    pub autoload_user_info: bool,
    pub timeouts: HttpTimeouts,
}

impl fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthConfig")
            .field("publishable_key", &self.publishable_key)
            .field("secret_key", &"<redacted>")
            .field("api_url", &self.api_url)
            .field("auth_wait_timeout", &self.auth_wait_timeout)
            .field("claims", &self.claims)
            .field("register_user_state", &self.register_user_state)
            .field("autoload_user_info", &self.autoload_user_info)
            .field("timeouts", &self.timeouts)
            .finish()
    }
}

impl AuthConfig {
    /// Build typed config from environment variables.
    ///
    /// Required:
    /// - `CLERK_PUBLISHABLE_KEY`
    /// - `CLERK_SECRET_KEY`
    ///
    /// Optional:
    /// - `CLERK_API_URL`: default `https://api.clerk.com/v1`
    /// - `CLERK_AUTH_WAIT_TIMEOUT_MS`: default 1000
    /// - `CLERK_JWT_LEEWAY_SECS`: default 60
    /// - `CLERK_JWT_ISSUER`: unset disables the issuer check
    /// - `CLERK_AUTHORIZED_PARTIES`: comma separated `azp` allow-list
    /// - `CLERK_JWT_ALGORITHMS`: comma separated, default `RS256`
    /// - `CLERK_REGISTER_USER_STATE`: default false
    /// - `CLERK_AUTOLOAD_USER_INFO`: default false
    /// - `CLERK_REQUEST_TIMEOUT_SECS`: default 10
    /// - `CLERK_CONNECT_TIMEOUT_SECS`: default 5
    ///
    /// # Errors
    ///
    /// Returns an error if a required key is missing or any value fails to parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build typed config from an arbitrary key lookup.
    ///
    /// # Errors
    ///
    /// Same as [`AuthConfig::from_env`].
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let publishable_key = required(&lookup, "CLERK_PUBLISHABLE_KEY")?;
        let secret_key = required(&lookup, "CLERK_SECRET_KEY")?;

        let api_url = lookup("CLERK_API_URL")
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_API_URL.to_string())
            .trim_end_matches('/')
            .to_string();

        let wait_ms = parse_or(&lookup, "CLERK_AUTH_WAIT_TIMEOUT_MS", DEFAULT_AUTH_WAIT_TIMEOUT_MS)?;
        let claims = ClaimsOptions {
            leeway_secs: parse_or(&lookup, "CLERK_JWT_LEEWAY_SECS", DEFAULT_JWT_LEEWAY_SECS)?,
            issuer: lookup("CLERK_JWT_ISSUER").filter(|v| !v.trim().is_empty()),
            authorized_parties: parse_list(lookup("CLERK_AUTHORIZED_PARTIES").as_deref()),
            algorithms: parse_algorithms(&lookup, "CLERK_JWT_ALGORITHMS")?,
        };
        let timeouts = HttpTimeouts {
            request_secs: parse_or(&lookup, "CLERK_REQUEST_TIMEOUT_SECS", DEFAULT_REQUEST_TIMEOUT_SECS)?,
            connect_secs: parse_or(&lookup, "CLERK_CONNECT_TIMEOUT_SECS", DEFAULT_CONNECT_TIMEOUT_SECS)?,
        };

        Ok(Self {
            publishable_key,
            secret_key,
            api_url,
            auth_wait_timeout: Duration::from_millis(wait_ms),
            claims,
            register_user_state: parse_bool(&lookup, "CLERK_REGISTER_USER_STATE")?,
            autoload_user_info: parse_bool(&lookup, "CLERK_AUTOLOAD_USER_INFO")?,
            timeouts,
        })
    }
}

// =============================================================================
// PARSING
// =============================================================================

fn required<F>(lookup: &F, var: &'static str) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(var) {
        Some(v) if !v.trim().is_empty() => Ok(v.trim().to_string()),
        _ => Err(ConfigError::Missing { var }),
    }
}

fn parse_or<F>(lookup: &F, var: &'static str, default: u64) -> Result<u64, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(var) else {
        return Ok(default);
    };
    raw.trim()
        .parse::<u64>()
        .map_err(|_| ConfigError::Invalid { var, value: raw })
}

fn parse_bool<F>(lookup: &F, var: &'static str) -> Result<bool, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(var) else {
        return Ok(false);
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "" | "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid { var, value: raw }),
    }
}

fn parse_algorithms<F>(lookup: &F, var: &'static str) -> Result<Vec<Algorithm>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(var);
    let names = parse_list(raw.as_deref());
    if names.is_empty() {
        return Ok(ClaimsOptions::default().algorithms);
    }
    names
        .iter()
        .map(|name| Algorithm::from_str(name))
        .collect::<Result<_, _>>()
        .map_err(|_| ConfigError::Invalid { var, value: raw.unwrap_or_default() })
}

fn parse_list(raw: Option<&str>) -> Vec<String> {
    raw.unwrap_or("")
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
