//! Bridge Messages
//!
//! Identifiers and the message shapes exchanged between the requester context
//! and the background context.
//!
//! # Wire Shapes
//!
//! ```text
//! request   { "type": "create" | "chat" | "session",
//!             "conversationId"?, "prompt"?, "roleId", "modelId" }
//! response  [ errorOrNull, data ]
//!             create  -> { "conversationId": "..." }
//!             chat    -> { "type": "connected" }
//!             session -> { "id": ..., "username": ..., "chat_models": [...] }
//! broadcast { "source": "stream-channel", "conversationId", "data": Frame }
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::auth::UserInfo;
use crate::error::{ChatError, ErrorCode};
use crate::transport::frame::Frame;

/// Conversation identifier
///
/// Opaque and stable across every completion request in one conversation.
/// Doubles as the `chat_id` of the backing socket.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(String);

impl ConversationId {
    /// Generate a new random (UUIDv4) conversation ID
    #[must_use]
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Wrap an existing identifier
    pub fn from_string(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the raw identifier
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ConversationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConversationId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ConversationId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Completion request identifier (one per `completion` call)
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub String);

impl RequestId {
    /// Generate a new unique request ID
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        let id = COUNTER.fetch_add(1, Ordering::SeqCst);
        Self(format!("rid_{id}"))
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Request from the requester context to the background context
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum BridgeRequest {
    /// Open (or reuse) the socket backing a conversation
    Create {
        /// Conversation to reuse; the background generates one if absent
        #[serde(default, skip_serializing_if = "Option::is_none")]
        conversation_id: Option<ConversationId>,
        /// Provider role
        role_id: u32,
        /// Provider model
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model_id: Option<u32>,
    },

    /// Send a prompt over an already-open conversation socket
    Chat {
        /// Target conversation
        conversation_id: ConversationId,
        /// Prompt text
        prompt: String,
        /// Provider role
        role_id: u32,
        /// Provider model
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model_id: Option<u32>,
    },

    /// Probe the stored credentials against the chat service
    Session,
}

impl BridgeRequest {
    /// Short name for logging
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Create { .. } => "create",
            Self::Chat { .. } => "chat",
            Self::Session => "session",
        }
    }
}

/// Acknowledgment kind carried by a successful `chat` request
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckKind {
    /// Socket open and prompt sent
    Connected,
}

/// Successful payload of a bridge response
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BridgeReply {
    /// Reply to `create`
    Created {
        /// Conversation whose socket is now open
        #[serde(rename = "conversationId")]
        conversation_id: ConversationId,
    },
    /// Reply to `chat`
    Ack {
        /// Always `connected`
        #[serde(rename = "type")]
        kind: AckKind,
    },
    /// Reply to `session`
    Session(UserInfo),
}

impl BridgeReply {
    /// The `{ type: "connected" }` acknowledgment
    #[must_use]
    pub fn connected() -> Self {
        Self::Ack {
            kind: AckKind::Connected,
        }
    }
}

/// Response tuple `[errorOrNull, data]`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeResponse(pub Option<ChatError>, pub Option<BridgeReply>);

impl BridgeResponse {
    /// Successful response
    #[must_use]
    pub fn ok(reply: BridgeReply) -> Self {
        Self(None, Some(reply))
    }

    /// Failed response
    #[must_use]
    pub fn err(error: ChatError) -> Self {
        Self(Some(error), None)
    }

    /// Collapse the tuple into a `Result`
    ///
    /// A response carrying neither an error nor data is an unexpected shape
    /// and maps to `UNKNOWN_ERROR`.
    pub fn into_result(self) -> Result<BridgeReply, ChatError> {
        match self {
            Self(Some(err), _) => Err(err),
            Self(None, Some(reply)) => Ok(reply),
            Self(None, None) => Err(ChatError::with_message(
                ErrorCode::UnknownError,
                "empty bridge response",
            )),
        }
    }
}

impl From<Result<BridgeReply, ChatError>> for BridgeResponse {
    fn from(result: Result<BridgeReply, ChatError>) -> Self {
        match result {
            Ok(reply) => Self::ok(reply),
            Err(err) => Self::err(err),
        }
    }
}

/// Tag on every streamed-fragment broadcast
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BroadcastSource {
    /// Frames forwarded from a conversation socket
    #[serde(rename = "stream-channel")]
    StreamChannel,
}

/// Fire-and-forget broadcast of one forwarded frame
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamBroadcast {
    /// Always `stream-channel`
    pub source: BroadcastSource,
    /// Conversation the frame belongs to
    pub conversation_id: ConversationId,
    /// The forwarded frame
    pub data: Frame,
}

impl StreamBroadcast {
    /// Tag a frame for a conversation
    #[must_use]
    pub fn new(conversation_id: ConversationId, data: Frame) -> Self {
        Self {
            source: BroadcastSource::StreamChannel,
            conversation_id,
            data,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_conversation_ids_unique() {
        assert_ne!(ConversationId::new(), ConversationId::new());
    }

    #[test]
    fn test_create_request_wire_shape() {
        let req = BridgeRequest::Create {
            conversation_id: Some("c-1".into()),
            role_id: 1,
            model_id: Some(11),
        };
        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(
            value,
            json!({"type": "create", "conversationId": "c-1", "roleId": 1, "modelId": 11})
        );
    }

    #[test]
    fn test_create_request_without_conversation() {
        let req: BridgeRequest =
            serde_json::from_value(json!({"type": "create", "roleId": 1})).unwrap();
        assert_eq!(
            req,
            BridgeRequest::Create {
                conversation_id: None,
                role_id: 1,
                model_id: None,
            }
        );
    }

    #[test]
    fn test_response_tuple_shapes() {
        let created = BridgeResponse::ok(BridgeReply::Created {
            conversation_id: "c-9".into(),
        });
        assert_eq!(
            serde_json::to_value(&created).unwrap(),
            json!([null, {"conversationId": "c-9"}])
        );

        let ack: BridgeResponse =
            serde_json::from_value(json!([null, {"type": "connected"}])).unwrap();
        assert_eq!(ack.into_result().unwrap(), BridgeReply::connected());

        let failed: BridgeResponse =
            serde_json::from_value(json!([{"code": "NETWORK_ERROR", "message": "down"}, null]))
                .unwrap();
        assert_eq!(failed.into_result().unwrap_err().code, ErrorCode::NetworkError);
    }

    #[test]
    fn test_empty_response_is_unknown_error() {
        let err = BridgeResponse(None, None).into_result().unwrap_err();
        assert_eq!(err.code, ErrorCode::UnknownError);
    }

    #[test]
    fn test_broadcast_wire_shape() {
        let broadcast = StreamBroadcast::new("c-2".into(), Frame::middle("hi"));
        assert_eq!(
            serde_json::to_value(&broadcast).unwrap(),
            json!({
                "source": "stream-channel",
                "conversationId": "c-2",
                "data": {"type": "middle", "content": "hi"}
            })
        );
    }
}
