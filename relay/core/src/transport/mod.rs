//! Socket Transport Layer
//!
//! Abstraction over the bidirectional socket that backs one conversation:
//! - `websocket`: the real provider connection (tokio-tungstenite)
//! - `memory`: in-process stand-in used by tests and local tooling
//!
//! # Design Philosophy
//!
//! A connector performs the handshake and hands back a [`SocketHandle`]: a
//! pair of channels bridged to the socket by background read/write tasks.
//! Everything above this layer (manager, heartbeat, router) only ever sees
//! channels, so the same code drives a real network socket or a test double.
//!
//! ```text
//!             outbound (SocketMessage)
//!  Manager ──────────────────────────────▶ write task ──▶ socket
//!  Router  ◀────────────────────────────── read task  ◀── socket
//!             inbound (SocketEvent)
//! ```

pub mod frame;
pub mod heartbeat;
pub mod memory;
#[cfg(feature = "websocket")]
pub mod websocket;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::TransportError;
use crate::messages::ConversationId;

pub use frame::{Frame, FrameKind, MAX_FRAME_SIZE};
pub use heartbeat::{HeartbeatConfig, HeartbeatExit, HeartbeatTask};
pub use memory::{MemoryConnector, MemoryPeer};
#[cfg(feature = "websocket")]
pub use websocket::WebSocketConnector;

/// Capacity of the per-socket channels
pub const SOCKET_CHANNEL_CAPACITY: usize = 256;

/// Message written to a socket
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SocketMessage {
    /// Text message
    Text(String),
    /// Binary message
    Binary(Vec<u8>),
    /// Close the socket
    Close,
}

/// Event read from a socket
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SocketEvent {
    /// Text or binary message payload
    Message(SocketMessage),
    /// The socket closed
    Closed {
        /// Close code, if the peer sent one
        code: Option<u16>,
        /// Close reason
        reason: String,
    },
    /// The socket failed
    Error(String),
}

/// Channel pair bridged to an open socket
#[derive(Debug)]
pub struct SocketHandle {
    /// Messages to write
    pub outbound: mpsc::Sender<SocketMessage>,
    /// Events read
    pub inbound: mpsc::Receiver<SocketEvent>,
}

/// Parameters of one socket handshake
///
/// Renders as
/// `<scheme>://<host>/api/chat/new?session_id=&role_id=&chat_id=&model_id=&token=`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionTarget {
    /// `ws` or `wss`
    pub scheme: String,
    /// Provider host (optionally with port)
    pub host: String,
    /// Sanitized session id
    pub session_id: String,
    /// Provider role
    pub role_id: u32,
    /// Conversation id, sent as `chat_id`
    pub conversation_id: ConversationId,
    /// Provider model (empty when unset)
    pub model_id: Option<u32>,
    /// Sanitized bearer token
    pub token: String,
}

impl ConnectionTarget {
    /// Path of the streaming chat endpoint
    pub const PATH: &'static str = "/api/chat/new";

    /// Build the handshake URL
    ///
    /// # Errors
    ///
    /// Returns `TransportError::ConnectionFailed` if scheme/host do not form a
    /// valid URL.
    pub fn url(&self) -> Result<String, TransportError> {
        let base = format!("{}://{}{}", self.scheme, self.host, Self::PATH);
        let model_id = self.model_id.map(|m| m.to_string()).unwrap_or_default();
        let role_id = self.role_id.to_string();
        let url = reqwest::Url::parse_with_params(
            &base,
            &[
                ("session_id", self.session_id.as_str()),
                ("role_id", role_id.as_str()),
                ("chat_id", self.conversation_id.as_str()),
                ("model_id", model_id.as_str()),
                ("token", self.token.as_str()),
            ],
        )
        .map_err(|e| TransportError::ConnectionFailed(format!("invalid target {base}: {e}")))?;
        Ok(url.to_string())
    }
}

/// Performs socket handshakes
#[async_trait]
pub trait SocketConnector: Send + Sync {
    /// Open a socket to `target`
    ///
    /// # Errors
    ///
    /// Returns `TransportError::ConnectionFailed` / `ConnectTimeout` when the
    /// handshake does not succeed.
    async fn connect(&self, target: &ConnectionTarget) -> Result<SocketHandle, TransportError>;
}
