//! Unix Socket Bridge
//!
//! Carries the bridge contract between processes: the background daemon runs
//! [`UnixBridgeServer`], requester processes connect with
//! [`UnixBridgeClient`].
//!
//! # Socket Location
//!
//! Default: `$XDG_RUNTIME_DIR/chat-relay/relay.sock`
//! Fallback: `/tmp/chat-relay-$UID/relay.sock`
//!
//! # Security
//!
//! - Socket created with mode 0600 (owner-only access)
//! - Peer UID validated via `SO_PEERCRED` (Linux)
//! - No network exposure
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐                        ┌──────────────────┐
//! │ Requester        │                        │ Background       │
//! │                  │   Request {id, body}   │                  │
//! │ UnixBridgeClient ├───────────────────────►│ UnixBridgeServer │
//! │                  │◄───────────────────────┤                  │
//! │                  │   Response {id, body}  │                  │
//! │                  │◄───────────────────────┤  BroadcastHub    │
//! │                  │   Broadcast {body}     │                  │
//! └──────────────────┘                        └──────────────────┘
//! ```

mod client;
mod server;

pub use client::UnixBridgeClient;
pub use server::UnixBridgeServer;

use std::path::PathBuf;

/// Get the default bridge socket path
#[must_use]
pub fn default_socket_path() -> PathBuf {
    crate::config::default_socket_path()
}
