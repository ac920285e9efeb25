//! Error Types
//!
//! Two families of errors live here:
//!
//! - [`ChatError`]: the error descriptor surfaced to callers. It crosses the
//!   bridge boundary, so it is serializable and carries a stable
//!   [`ErrorCode`] from the provider's taxonomy.
//! - [`TransportError`] / [`RegistryError`]: internal failures of sockets,
//!   bridge wire framing, and the connection table. These never reach a
//!   stream session directly; they are converted into a `ChatError` (usually
//!   inside a synthetic `error` frame) at the manager/router boundary.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::messages::ConversationId;

/// Stable error codes shared by both sides of the bridge
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Session or token rejected by the chat service
    Unauthorized,
    /// Socket open/send/close failure
    NetworkError,
    /// Caller lacks entitlement for the requested model
    ModelNoPermission,
    /// No terminal frame arrived before the request timeout
    RequestTimeoutAbort,
    /// Unparsable frame or unexpected response shape
    UnknownError,
}

impl ErrorCode {
    /// Wire representation of the code
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unauthorized => "UNAUTHORIZED",
            Self::NetworkError => "NETWORK_ERROR",
            Self::ModelNoPermission => "MODEL_NO_PERMISSION",
            Self::RequestTimeoutAbort => "REQUEST_TIMEOUT_ABORT",
            Self::UnknownError => "UNKNOWN_ERROR",
        }
    }

    /// Default human-readable description for the code
    #[must_use]
    pub fn default_message(self) -> &'static str {
        match self {
            Self::Unauthorized => "not logged in to the chat service",
            Self::NetworkError => "network error while talking to the chat service",
            Self::ModelNoPermission => "no permission to use this model",
            Self::RequestTimeoutAbort => "request timed out waiting for a response",
            Self::UnknownError => "unknown error",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error descriptor surfaced to the original caller
#[derive(Clone, Debug, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{code}: {message}")]
pub struct ChatError {
    /// Taxonomy code
    pub code: ErrorCode,
    /// Detail message
    #[serde(default)]
    pub message: String,
}

impl ChatError {
    /// Create an error with the code's default message
    #[must_use]
    pub fn new(code: ErrorCode) -> Self {
        Self {
            code,
            message: code.default_message().to_string(),
        }
    }

    /// Create an error with a custom detail message
    pub fn with_message(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// `UNAUTHORIZED`
    #[must_use]
    pub fn unauthorized() -> Self {
        Self::new(ErrorCode::Unauthorized)
    }

    /// `NETWORK_ERROR`
    #[must_use]
    pub fn network() -> Self {
        Self::new(ErrorCode::NetworkError)
    }

    /// `MODEL_NO_PERMISSION`
    #[must_use]
    pub fn model_no_permission() -> Self {
        Self::new(ErrorCode::ModelNoPermission)
    }

    /// `REQUEST_TIMEOUT_ABORT`
    #[must_use]
    pub fn request_timeout() -> Self {
        Self::new(ErrorCode::RequestTimeoutAbort)
    }

    /// `UNKNOWN_ERROR`
    #[must_use]
    pub fn unknown() -> Self {
        Self::new(ErrorCode::UnknownError)
    }

    /// Whether this error should trigger the out-of-band login flow
    #[must_use]
    pub fn is_unauthorized(&self) -> bool {
        self.code == ErrorCode::Unauthorized
    }
}

/// Errors from sockets and the bridge wire
#[derive(Debug, Error)]
pub enum TransportError {
    /// Could not establish the connection (handshake failure)
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Handshake did not complete in time
    #[error("connection timed out after {0} ms")]
    ConnectTimeout(u64),

    /// Writing to the connection failed
    #[error("send failed: {0}")]
    SendFailed(String),

    /// The peer closed the connection
    #[error("connection closed")]
    ConnectionClosed,

    /// Payload could not be encoded or decoded
    #[error("serialization error: {0}")]
    SerializationError(String),

    /// Envelope checksum did not match its payload
    #[error("checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch {
        /// Checksum carried in the header
        expected: u32,
        /// Checksum computed over the payload
        actual: u32,
    },

    /// Bridge peer rejected
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Operation not valid in the current state
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Underlying I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<TransportError> for ChatError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::SerializationError(_) | TransportError::ChecksumMismatch { .. } => {
                ChatError::with_message(ErrorCode::UnknownError, err.to_string())
            }
            other => ChatError::with_message(ErrorCode::NetworkError, other.to_string()),
        }
    }
}

/// Errors from the connection registry
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// An open connection is already registered for this conversation
    #[error("an open connection already exists for conversation {0}")]
    AlreadyExists(ConversationId),

    /// No connection is registered for this conversation
    #[error("no connection registered for conversation {0}")]
    NotFound(ConversationId),
}
