//! Authentication Collaborators
//!
//! The relay never stores credentials itself. It reads them through
//! [`AuthGate`], verifies them through [`SessionVerifier`], and hands an
//! `UNAUTHORIZED` outcome to [`LoginFlow`]. Credential storage and the login
//! UI live outside this crate.
//!
//! # Session Probe
//!
//! ```text
//! GET <session_url>
//!   Chat-Token:    <session id>
//!   Authorization: <access token>
//!
//! { "code": 0,   "data": { ...user info... } }   -> Ok(UserInfo)
//! { "code": 401, ... }                            -> UNAUTHORIZED
//! { "code": n,   "message": "..." }               -> UNKNOWN_ERROR
//! ```

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{ChatError, ErrorCode};

/// Strip characters that break the handshake query and headers
///
/// Removes `'`, `"` and `\`, which stored credentials may carry from being
/// JSON-quoted.
#[must_use]
pub fn sanitize(value: &str) -> String {
    value
        .chars()
        .filter(|c| !matches!(c, '\'' | '"' | '\\'))
        .collect()
}

/// Source of stored credentials
#[async_trait]
pub trait AuthGate: Send + Sync {
    /// Stored session id, if any
    async fn session_id(&self) -> Option<String>;

    /// Stored access token, if any
    async fn access_token(&self) -> Option<String>;
}

/// Sanitized credential pair
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Credentials {
    /// Session id
    pub session_id: String,
    /// Bearer token
    pub token: String,
}

impl Credentials {
    /// Read and sanitize both values from a gate
    ///
    /// # Errors
    ///
    /// Returns `UNAUTHORIZED` if either value is missing or empty.
    pub async fn from_gate(gate: &dyn AuthGate) -> Result<Self, ChatError> {
        let session_id = gate.session_id().await.map(|s| sanitize(&s));
        let token = gate.access_token().await.map(|t| sanitize(&t));
        match (session_id, token) {
            (Some(session_id), Some(token)) if !session_id.is_empty() && !token.is_empty() => {
                Ok(Self { session_id, token })
            }
            _ => Err(ChatError::with_message(
                ErrorCode::Unauthorized,
                "no stored session credentials",
            )),
        }
    }
}

/// Credentials fixed at construction
#[derive(Clone, Debug, Default)]
pub struct StaticAuthGate {
    session_id: Option<String>,
    token: Option<String>,
}

impl StaticAuthGate {
    /// Create a gate returning the given values
    pub fn new(session_id: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            session_id: Some(session_id.into()),
            token: Some(token.into()),
        }
    }

    /// Gate with no stored credentials
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AuthGate for StaticAuthGate {
    async fn session_id(&self) -> Option<String> {
        self.session_id.clone()
    }

    async fn access_token(&self) -> Option<String> {
        self.token.clone()
    }
}

/// Credentials read from `RELAY_SESSION_ID` / `RELAY_TOKEN` on every call
#[derive(Clone, Debug, Default)]
pub struct EnvAuthGate;

#[async_trait]
impl AuthGate for EnvAuthGate {
    async fn session_id(&self) -> Option<String> {
        std::env::var("RELAY_SESSION_ID").ok()
    }

    async fn access_token(&self) -> Option<String> {
        std::env::var("RELAY_TOKEN").ok()
    }
}

/// Account details returned by the session probe
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserInfo {
    /// Account id
    pub id: u64,
    /// Login name
    pub username: String,
    /// Display name
    pub nickname: String,
    /// Avatar URL
    pub avatar: String,
    /// Model ids the account may use
    pub chat_models: Vec<u32>,
    /// Role descriptors
    pub chat_roles: Vec<serde_json::Value>,
    /// Creation timestamp
    pub created_at: i64,
    /// Last update timestamp
    pub updated_at: i64,
    /// Subscription expiry timestamp
    pub expired_time: i64,
    /// Image generation calls left
    pub img_calls: i64,
    /// Last login timestamp
    pub last_login_at: i64,
    /// Last login address
    pub last_login_ip: String,
    /// Remaining credit
    pub power: i64,
    /// Account enabled
    pub status: bool,
    /// Paid subscriber
    pub vip: bool,
}

/// Verifies credentials against the chat service
#[async_trait]
pub trait SessionVerifier: Send + Sync {
    /// Probe the session
    ///
    /// # Errors
    ///
    /// `UNAUTHORIZED` for rejected credentials, `NETWORK_ERROR` when the
    /// service is unreachable, `UNKNOWN_ERROR` for anything else.
    async fn verify(&self, credentials: &Credentials) -> Result<UserInfo, ChatError>;
}

#[derive(Debug, Deserialize)]
struct SessionBody {
    code: i64,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    data: Option<serde_json::Value>,
}

/// HTTP session probe
#[derive(Clone, Debug)]
pub struct HttpSessionVerifier {
    client: reqwest::Client,
    url: String,
}

impl HttpSessionVerifier {
    /// Create a verifier for `url`
    ///
    /// # Errors
    ///
    /// Returns `UNKNOWN_ERROR` if the HTTP client cannot be built.
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, ChatError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ChatError::with_message(ErrorCode::UnknownError, e.to_string()))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl SessionVerifier for HttpSessionVerifier {
    async fn verify(&self, credentials: &Credentials) -> Result<UserInfo, ChatError> {
        let response = self
            .client
            .get(&self.url)
            .header("Chat-Token", &credentials.session_id)
            .header("Authorization", &credentials.token)
            .send()
            .await
            .map_err(|e| ChatError::with_message(ErrorCode::NetworkError, e.to_string()))?;

        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Err(ChatError::unauthorized());
        }

        let body: SessionBody = response
            .json()
            .await
            .map_err(|e| ChatError::with_message(ErrorCode::UnknownError, e.to_string()))?;

        match body.code {
            0 => {
                let data = body.data.unwrap_or(serde_json::Value::Null);
                serde_json::from_value(data)
                    .map_err(|e| ChatError::with_message(ErrorCode::UnknownError, e.to_string()))
            }
            401 => Err(ChatError::unauthorized()),
            code => {
                tracing::warn!(code, "Session probe rejected");
                Err(ChatError::with_message(
                    ErrorCode::UnknownError,
                    body.message
                        .unwrap_or_else(|| format!("session probe returned code {code}")),
                ))
            }
        }
    }
}

/// Out-of-band login trigger
#[async_trait]
pub trait LoginFlow: Send + Sync {
    /// Ask the user to log in
    async fn begin(&self);
}

/// Login flow that only logs where to sign in
#[derive(Clone, Debug)]
pub struct LogLoginFlow {
    login_url: String,
}

impl LogLoginFlow {
    /// Create a flow pointing at `login_url`
    pub fn new(login_url: impl Into<String>) -> Self {
        Self {
            login_url: login_url.into(),
        }
    }
}

#[async_trait]
impl LoginFlow for LogLoginFlow {
    async fn begin(&self) {
        tracing::warn!(login_url = %self.login_url, "Not logged in to the chat service");
    }
}
