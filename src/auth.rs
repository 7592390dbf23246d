//! Credential handshake types.
//!
//! The handshake is a single `public/auth` call with the
//! `client_credentials` grant. A successful answer carries an access token
//! that is attached to every privileged call afterwards.
//!
//! ```text
//! Unauthenticated ──authenticate──▶ Authenticating ──token──▶ Authenticated
//!        ▲                               │
//!        └──────── rejected / timeout ───┘
//! ```

use std::fmt;
use std::time::{Duration, Instant};

use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::{Result, SessionError};

/// Environment variable holding the API client id.
pub const ENV_CLIENT_ID: &str = "DERIBIT_CLIENT_ID";

/// Environment variable holding the API client secret.
pub const ENV_CLIENT_SECRET: &str = "DERIBIT_CLIENT_SECRET";

/// Grant type used by the handshake.
pub const GRANT_CLIENT_CREDENTIALS: &str = "client_credentials";

/// API key pair.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    /// Client id.
    pub client_id: String,
    /// Client secret.
    pub client_secret: String,
}

impl Credentials {
    /// Create a key pair.
    pub fn new(client_id: impl Into<String>, client_secret: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
        }
    }

    /// Read the key pair from `DERIBIT_CLIENT_ID` / `DERIBIT_CLIENT_SECRET`.
    pub fn from_env() -> Result<Self> {
        let read = |name: &str| {
            std::env::var(name)
                .ok()
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| SessionError::Config(format!("{name} is not set")))
        };
        Ok(Self::new(read(ENV_CLIENT_ID)?, read(ENV_CLIENT_SECRET)?))
    }

    /// Handshake parameters.
    pub fn to_params(&self) -> Value {
        json!({
            "grant_type": GRANT_CLIENT_CREDENTIALS,
            "client_id": self.client_id,
            "client_secret": self.client_secret,
        })
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .finish()
    }
}

/// `result` member of a successful handshake.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthResult {
    pub access_token: String,
    #[serde(default)]
    pub expires_in: u64,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub token_type: Option<String>,
}

/// Token obtained by a successful handshake.
#[derive(Clone)]
pub struct AccessToken {
    token: String,
    refresh_token: Option<String>,
    scope: Option<String>,
    expires_in: Duration,
    obtained_at: Instant,
}

impl AccessToken {
    /// Parse a handshake result. `None` unless it carries a non-empty token.
    pub fn from_result(result: &Value) -> Option<Self> {
        let parsed: AuthResult = serde_json::from_value(result.clone()).ok()?;
        if parsed.access_token.is_empty() {
            return None;
        }
        Some(Self {
            token: parsed.access_token,
            refresh_token: parsed.refresh_token,
            scope: parsed.scope,
            expires_in: Duration::from_secs(parsed.expires_in),
            obtained_at: Instant::now(),
        })
    }

    /// The bearer token attached to privileged calls.
    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn refresh_token(&self) -> Option<&str> {
        self.refresh_token.as_deref()
    }

    pub fn scope(&self) -> Option<&str> {
        self.scope.as_deref()
    }

    /// When the server stops honoring the token. `None` if no lifetime was given.
    pub fn expires_at(&self) -> Option<Instant> {
        if self.expires_in.is_zero() {
            None
        } else {
            Some(self.obtained_at + self.expires_in)
        }
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at().is_some_and(|at| Instant::now() >= at)
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("token", &"<redacted>")
            .field("scope", &self.scope)
            .field("expires_in", &self.expires_in)
            .finish()
    }
}

/// Authentication state of a session.
#[derive(Debug, Clone, Default)]
pub enum AuthState {
    #[default]
    Unauthenticated,
    /// Handshake sent as call `request_id`, answer not yet seen.
    Authenticating { request_id: u64 },
    Authenticated(AccessToken),
}

impl AuthState {
    pub fn is_authenticated(&self) -> bool {
        matches!(self, AuthState::Authenticated(_))
    }

    /// Token to attach to privileged calls, if authenticated.
    pub fn token(&self) -> Option<&AccessToken> {
        match self {
            AuthState::Authenticated(token) => Some(token),
            _ => None,
        }
    }

    /// Identifier of the handshake in flight, if any.
    pub fn handshake_id(&self) -> Option<u64> {
        match self {
            AuthState::Authenticating { request_id } => Some(*request_id),
            _ => None,
        }
    }
}
