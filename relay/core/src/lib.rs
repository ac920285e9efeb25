//! Relay Core - Streaming Chat Session Multiplexer
//!
//! This crate multiplexes many concurrent chat conversations over per-conversation
//! streaming sockets to a remote chat service, correlating asynchronously
//! arriving response frames back to the request that produced them.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                      REQUESTER CONTEXT                           │
//! │  ┌────────────┐   ┌────────────────┐   ┌──────────────────────┐  │
//! │  │ ChatClient ├──►│ StreamSession  │◄──┤ StreamListener       │  │
//! │  │ (profile)  │   │ (state machine)│   │  └─ RequestTable     │  │
//! │  └─────┬──────┘   └────────────────┘   └──────────▲───────────┘  │
//! └────────┼──────────────────────────────────────────┼──────────────┘
//!          │ create / chat / session                  │ stream-channel
//!          ▼                                          │ broadcasts
//! ┌──────────────────────── Bridge ───────────────────┴──────────────┐
//! │           in-process  |  Unix socket (CRC32 envelopes)           │
//! └────────┬─────────────────────────────────────────▲───────────────┘
//!          ▼                                         │
//! ┌──────────────────────────────────────────────────┼───────────────┐
//! │                      BACKGROUND CONTEXT          │               │
//! │  ┌───────────────────┐  ┌────────────────┐  ┌────┴───────────┐   │
//! │  │ ConnectionManager ├─►│ MessageRouter  ├─►│ BroadcastHub   │   │
//! │  │  └─ heartbeats    │  └───────┬────────┘  └────────────────┘   │
//! │  └─────────┬─────────┘          │                                │
//! │            ▼                    ▼                                │
//! │  ┌─────────────────────────────────────┐                         │
//! │  │ ConnectionRegistry (single owner)   │                         │
//! │  └─────────────────────────────────────┘                         │
//! └────────────┬─────────────────────────────────────────────────────┘
//!              ▼
//!      one socket per conversation ──► remote chat service
//! ```
//!
//! # Module Overview
//!
//! - [`error`]: Error taxonomy carried to callers, transport and registry errors
//! - [`messages`]: Identifiers and bridge wire types
//! - [`config`]: Layered configuration (defaults, TOML, environment)
//! - [`models`]: Model capability records
//! - [`auth`]: Credentials, session probe, login flow
//! - [`transport`]: Frames, socket connectors, heartbeats
//! - [`registry`]: Conversation -> connection table
//! - [`manager`]: Socket lifecycle
//! - [`router`]: Frame delivery to pending callbacks
//! - [`background`]: Background request handler
//! - [`bridge`]: Requester/background message passing
//! - [`streaming`]: Requester-side frame correlation and session state
//! - [`client`]: Completion orchestrator

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod auth;
pub mod background;
pub mod bridge;
pub mod client;
pub mod config;
pub mod error;
pub mod manager;
pub mod messages;
pub mod models;
pub mod registry;
pub mod router;
pub mod streaming;
pub mod transport;

// Re-exports for convenience
pub use auth::{
    AuthGate, Credentials, EnvAuthGate, HttpSessionVerifier, LogLoginFlow, LoginFlow,
    SessionVerifier, StaticAuthGate, UserInfo,
};
pub use background::BackgroundContext;
pub use client::{ChatClient, Completion};
pub use config::{ConfigError, RelayConfig};
pub use error::{ChatError, ErrorCode, RegistryError, TransportError};
pub use manager::{ConnectionManager, ManagerConfig, OpenParams};
pub use messages::{
    BridgeReply, BridgeRequest, BridgeResponse, BroadcastSource, ConversationId, RequestId,
    StreamBroadcast,
};
pub use models::{ModelProfile, Permission};
pub use registry::{ConnectionHandle, ConnectionId, ConnectionRegistry, RegistrySummary};
pub use router::{MessageRouter, RouteOutcome};

// Bridge exports
pub use bridge::{Bridge, BroadcastHub, InProcessBridge, RequestHandler};
#[cfg(unix)]
pub use bridge::{UnixBridgeClient, UnixBridgeServer};

// Streaming exports
pub use streaming::{
    ConversationResponse, RequestTable, ResponseKind, SessionState, StreamListener, StreamSession,
};

// Transport exports
pub use transport::{
    ConnectionTarget, Frame, FrameKind, HeartbeatConfig, MemoryConnector, SocketConnector,
};
#[cfg(feature = "websocket")]
pub use transport::WebSocketConnector;
