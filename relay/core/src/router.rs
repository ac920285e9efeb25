//! Message Router
//!
//! Dispatches inbound socket messages to the single pending callback of their
//! conversation.
//!
//! - `heartbeat` frames are liveness only and never forwarded
//! - every other frame goes to the pending callback, if any
//! - `end`/`error` clear the callback after it ran (one terminal per request)
//! - frames with no pending callback are dropped
//! - undecodable payloads become a synthetic `UNKNOWN_ERROR` frame and report
//!   [`RouteOutcome::Malformed`] so the manager closes the socket
//!
//! A panicking callback is caught here and treated as delivered.

use std::panic::{catch_unwind, AssertUnwindSafe};

use crate::error::{ChatError, ErrorCode};
use crate::messages::ConversationId;
use crate::registry::ConnectionRegistry;
use crate::transport::{Frame, FrameKind, SocketMessage};

/// What happened to one inbound message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Forwarded to the pending callback
    Delivered,
    /// No pending callback; discarded
    Dropped,
    /// Liveness frame; not forwarded
    Heartbeat,
    /// Payload could not be decoded; the socket should be closed
    Malformed(ChatError),
}

/// Routes frames from sockets to per-conversation callbacks
#[derive(Clone)]
pub struct MessageRouter {
    registry: ConnectionRegistry,
}

impl MessageRouter {
    /// Create a router over a registry
    #[must_use]
    pub fn new(registry: ConnectionRegistry) -> Self {
        Self { registry }
    }

    /// Route a decoded frame
    pub fn route(&self, conversation_id: &ConversationId, frame: &Frame) -> RouteOutcome {
        if frame.kind == FrameKind::Heartbeat {
            tracing::debug!(conversation_id = %conversation_id, "Heartbeat frame received");
            return RouteOutcome::Heartbeat;
        }

        let Some((token, callback)) = self.registry.pending(conversation_id) else {
            tracing::debug!(
                conversation_id = %conversation_id,
                kind = ?frame.kind,
                "No pending callback, frame dropped"
            );
            return RouteOutcome::Dropped;
        };

        tracing::debug!(conversation_id = %conversation_id, kind = ?frame.kind, "Routing frame");

        if catch_unwind(AssertUnwindSafe(|| callback(frame))).is_err() {
            tracing::error!(conversation_id = %conversation_id, "Frame callback panicked");
        }

        if frame.is_terminal() {
            self.registry.clear_pending(conversation_id, token);
        }

        RouteOutcome::Delivered
    }

    /// Decode and route a raw socket message
    pub fn route_message(
        &self,
        conversation_id: &ConversationId,
        message: &SocketMessage,
    ) -> RouteOutcome {
        let decoded = match message {
            SocketMessage::Text(text) => Frame::decode(text),
            SocketMessage::Binary(bytes) => Frame::decode_binary(bytes),
            SocketMessage::Close => return RouteOutcome::Dropped,
        };

        match decoded {
            Ok(frame) => self.route(conversation_id, &frame),
            Err(e) => {
                tracing::warn!(conversation_id = %conversation_id, error = %e, "Malformed frame");
                let error = ChatError::with_message(ErrorCode::UnknownError, e.to_string());
                self.route(conversation_id, &Frame::synthetic_error(error.clone()));
                RouteOutcome::Malformed(error)
            }
        }
    }
}
