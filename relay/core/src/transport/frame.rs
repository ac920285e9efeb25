//! Frame Codec
//!
//! Wire unit exchanged over a conversation socket: a JSON object carrying a
//! `type` discriminator and optional text `content`.
//!
//! # Frame Format
//!
//! ```text
//! inbound   { "type": "start" | "middle" | "end" | "error" | "heartbeat",
//!             "content"?: string, "error"?: { "code", "message" } | string }
//! outbound  { "type": "chat", "content": <prompt> }
//!           { "type": "heartbeat", "content": "ping" }
//! ```
//!
//! Binary socket messages are decoded as UTF-8 before JSON parsing. A payload
//! that is not valid UTF-8, not valid JSON, or carries an unknown `type` is a
//! [`TransportError::SerializationError`]; the router turns that into a
//! synthetic `error` frame. An `error` field of any other shape never fails
//! the decode: a string becomes an `UNKNOWN_ERROR` message, anything else is
//! ignored.

use serde::{Deserialize, Serialize};

use crate::error::{ChatError, ErrorCode, TransportError};

/// Maximum accepted frame payload (10 MB)
pub const MAX_FRAME_SIZE: usize = 10 * 1024 * 1024;

/// Heartbeat probe content
pub const HEARTBEAT_CONTENT: &str = "ping";

/// Frame type discriminator
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameKind {
    /// Reply is starting
    Start,
    /// One streamed text fragment
    Middle,
    /// Reply complete
    End,
    /// Reply failed
    Error,
    /// Liveness probe
    Heartbeat,
    /// Prompt submission (outbound only)
    Chat,
}

impl FrameKind {
    /// `end` and `error` end a request
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::End | Self::Error)
    }
}

/// One message unit on a conversation socket
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    /// Frame type
    #[serde(rename = "type")]
    pub kind: FrameKind,
    /// Optional text payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Optional error descriptor (on `error` frames)
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "lenient_error"
    )]
    pub error: Option<ChatError>,
}

fn lenient_error<'de, D>(deserializer: D) -> Result<Option<ChatError>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(match value {
        serde_json::Value::String(message) if !message.is_empty() => {
            Some(ChatError::with_message(ErrorCode::UnknownError, message))
        }
        serde_json::Value::Object(_) => serde_json::from_value(value).ok(),
        _ => None,
    })
}

impl Frame {
    fn new(kind: FrameKind, content: Option<String>) -> Self {
        Self {
            kind,
            content,
            error: None,
        }
    }

    /// `start` frame
    #[must_use]
    pub fn start() -> Self {
        Self::new(FrameKind::Start, None)
    }

    /// `middle` frame carrying a fragment
    pub fn middle(content: impl Into<String>) -> Self {
        Self::new(FrameKind::Middle, Some(content.into()))
    }

    /// `end` frame
    #[must_use]
    pub fn end() -> Self {
        Self::new(FrameKind::End, None)
    }

    /// Outbound heartbeat probe
    #[must_use]
    pub fn heartbeat() -> Self {
        Self::new(FrameKind::Heartbeat, Some(HEARTBEAT_CONTENT.to_string()))
    }

    /// Outbound prompt submission
    pub fn chat(prompt: impl Into<String>) -> Self {
        Self::new(FrameKind::Chat, Some(prompt.into()))
    }

    /// Locally generated `error` frame standing in for a transport failure
    #[must_use]
    pub fn synthetic_error(error: ChatError) -> Self {
        Self {
            kind: FrameKind::Error,
            content: Some(error.message.clone()),
            error: Some(error),
        }
    }

    /// Whether this frame ends a request
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.kind.is_terminal()
    }

    /// Error descriptor of an `error` frame
    ///
    /// Remote error frames usually carry only `content`; those map to
    /// `UNKNOWN_ERROR` with the content as detail.
    #[must_use]
    pub fn error_descriptor(&self) -> ChatError {
        match (&self.error, &self.content) {
            (Some(err), _) => err.clone(),
            (None, Some(content)) => ChatError::with_message(ErrorCode::UnknownError, content),
            (None, None) => ChatError::unknown(),
        }
    }

    /// Serialize to the JSON text sent over the socket
    pub fn encode(&self) -> Result<String, TransportError> {
        serde_json::to_string(self).map_err(|e| TransportError::SerializationError(e.to_string()))
    }

    /// Parse a text socket message
    pub fn decode(text: &str) -> Result<Self, TransportError> {
        if text.len() > MAX_FRAME_SIZE {
            return Err(TransportError::SerializationError(format!(
                "Frame size {} exceeds maximum {MAX_FRAME_SIZE}",
                text.len()
            )));
        }
        serde_json::from_str(text).map_err(|e| TransportError::SerializationError(e.to_string()))
    }

    /// Parse a binary socket message (UTF-8 text, then JSON)
    pub fn decode_binary(bytes: &[u8]) -> Result<Self, TransportError> {
        let text = std::str::from_utf8(bytes)
            .map_err(|e| TransportError::SerializationError(format!("invalid UTF-8: {e}")))?;
        Self::decode(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_decode_middle() {
        let frame = Frame::decode(r#"{"type":"middle","content":"ab"}"#).unwrap();
        assert_eq!(frame, Frame::middle("ab"));
        assert!(!frame.is_terminal());
    }

    #[test]
    fn test_decode_binary_utf8() {
        let frame = Frame::decode_binary(r#"{"type":"end"}"#.as_bytes()).unwrap();
        assert_eq!(frame.kind, FrameKind::End);
        assert!(frame.is_terminal());
    }

    #[test]
    fn test_decode_binary_invalid_utf8() {
        let result = Frame::decode_binary(&[0xff, 0xfe, 0x00]);
        assert!(matches!(result, Err(TransportError::SerializationError(_))));
    }

    #[test]
    fn test_decode_tolerates_foreign_error_field() {
        let frame = Frame::decode(r#"{"type":"error","content":"x","error":"quota"}"#).unwrap();
        assert_eq!(frame.kind, FrameKind::Error);
        assert_eq!(
            frame.error_descriptor(),
            ChatError::with_message(ErrorCode::UnknownError, "quota")
        );

        let frame = Frame::decode(r#"{"type":"error","content":"x","error":42}"#).unwrap();
        assert_eq!(frame.error, None);
        assert_eq!(frame.error_descriptor().message, "x");

        let frame =
            Frame::decode(r#"{"type":"error","error":{"code":"NETWORK_ERROR","message":"m"}}"#)
                .unwrap();
        assert_eq!(frame.error_descriptor().code, ErrorCode::NetworkError);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(Frame::decode("not json").is_err());
        assert!(Frame::decode(r#"{"type":"bogus"}"#).is_err());
        assert!(Frame::decode(r#"{"content":"no type"}"#).is_err());
    }

    #[test]
    fn test_outbound_shapes() {
        assert_eq!(
            Frame::heartbeat().encode().unwrap(),
            r#"{"type":"heartbeat","content":"ping"}"#
        );
        assert_eq!(
            Frame::chat("hello").encode().unwrap(),
            r#"{"type":"chat","content":"hello"}"#
        );
    }

    #[test]
    fn test_error_descriptor_from_content() {
        let frame = Frame::decode(r#"{"type":"error","content":"quota exceeded"}"#).unwrap();
        let err = frame.error_descriptor();
        assert_eq!(err.code, ErrorCode::UnknownError);
        assert_eq!(err.message, "quota exceeded");
    }

    #[test]
    fn test_synthetic_error_keeps_code() {
        let frame = Frame::synthetic_error(ChatError::network());
        assert!(frame.is_terminal());
        assert_eq!(frame.error_descriptor().code, ErrorCode::NetworkError);
    }
}
