//! Stream Session
//!
//! One completion request's lifecycle:
//!
//! ```text
//!   Idle ──begin──> AwaitingConnection ──connected──> Streaming
//!                          │                            │  start  -> Generating (unchanged text)
//!                          │ fail                       │  middle -> Generating (cumulative text)
//!                          v                            │
//!                       Errored <──── error frame ──────┤
//!                                     Done <── end ─────┤
//!                                 TimedOut <── deadline ┘
//! ```
//!
//! Every session emits exactly one terminal response (`Done` or `Error`).
//! Once terminal, further input is ignored.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::table::RequestTable;
use crate::error::{ChatError, ErrorCode};
use crate::messages::{ConversationId, RequestId};
use crate::transport::{Frame, FrameKind};

/// Default time allowed between the chat acknowledgment and a terminal frame
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

// ============================================================================
// Session State
// ============================================================================

/// Lifecycle state of a stream session
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Not started
    Idle,
    /// Waiting for the connection and the chat acknowledgment
    AwaitingConnection,
    /// Receiving frames
    Streaming,
    /// Finished with an `end` frame
    Done,
    /// Finished with an error
    Errored,
    /// No terminal frame before the deadline
    TimedOut,
}

impl SessionState {
    /// Whether no further responses will be emitted
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Errored | Self::TimedOut)
    }
}

// ============================================================================
// Responses
// ============================================================================

/// What a response reports
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ResponseKind {
    /// Partial output, `text` is cumulative
    Generating {
        /// Text received so far
        text: String,
    },
    /// Final output
    Done {
        /// Complete text
        text: String,
    },
    /// Terminal failure
    Error {
        /// Error descriptor
        error: ChatError,
    },
}

/// One update delivered to the caller of `completion`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationResponse {
    /// Conversation this request belongs to
    pub conversation_id: ConversationId,
    /// Request this update belongs to
    pub request_id: RequestId,
    /// Update payload
    #[serde(flatten)]
    pub kind: ResponseKind,
}

impl ConversationResponse {
    /// Whether this is the request's final update
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self.kind, ResponseKind::Generating { .. })
    }
}

// ============================================================================
// State Machine
// ============================================================================

/// State machine for one completion request
#[derive(Debug)]
pub struct StreamSession {
    conversation_id: ConversationId,
    request_id: RequestId,
    state: SessionState,
    text: String,
}

impl StreamSession {
    /// Create an idle session
    #[must_use]
    pub fn new(conversation_id: ConversationId, request_id: RequestId) -> Self {
        Self {
            conversation_id,
            request_id,
            state: SessionState::Idle,
            text: String::new(),
        }
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Text accumulated so far
    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Conversation of this session
    #[must_use]
    pub fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }

    /// Request of this session
    #[must_use]
    pub fn request_id(&self) -> &RequestId {
        &self.request_id
    }

    /// `Idle -> AwaitingConnection`
    pub fn begin(&mut self) {
        if self.state == SessionState::Idle {
            self.state = SessionState::AwaitingConnection;
        }
    }

    /// `AwaitingConnection -> Streaming`, emitting the first `Generating`
    pub fn connected(&mut self) -> Option<ConversationResponse> {
        if self.state != SessionState::AwaitingConnection {
            return None;
        }
        self.state = SessionState::Streaming;
        Some(self.generating())
    }

    /// Apply one frame received while streaming
    pub fn on_frame(&mut self, frame: &Frame) -> Option<ConversationResponse> {
        if self.state != SessionState::Streaming {
            return None;
        }
        match frame.kind {
            FrameKind::Start => Some(self.generating()),
            FrameKind::Middle => {
                if let Some(ref content) = frame.content {
                    self.text.push_str(content);
                }
                Some(self.generating())
            }
            FrameKind::End => {
                self.state = SessionState::Done;
                Some(self.respond(ResponseKind::Done {
                    text: self.text.clone(),
                }))
            }
            FrameKind::Error => {
                self.state = SessionState::Errored;
                Some(self.respond(ResponseKind::Error {
                    error: frame.error_descriptor(),
                }))
            }
            FrameKind::Heartbeat | FrameKind::Chat => None,
        }
    }

    /// Fail the session from any non-terminal state
    pub fn fail(&mut self, error: ChatError) -> Option<ConversationResponse> {
        if self.state.is_terminal() {
            return None;
        }
        self.state = SessionState::Errored;
        Some(self.respond(ResponseKind::Error { error }))
    }

    /// `Streaming -> TimedOut`
    pub fn time_out(&mut self) -> Option<ConversationResponse> {
        if self.state != SessionState::Streaming {
            return None;
        }
        self.state = SessionState::TimedOut;
        Some(self.respond(ResponseKind::Error {
            error: ChatError::request_timeout(),
        }))
    }

    fn generating(&self) -> ConversationResponse {
        self.respond(ResponseKind::Generating {
            text: self.text.clone(),
        })
    }

    fn respond(&self, kind: ResponseKind) -> ConversationResponse {
        ConversationResponse {
            conversation_id: self.conversation_id.clone(),
            request_id: self.request_id.clone(),
            kind,
        }
    }

    // ========================================================================
    // Driver
    // ========================================================================

    /// Consume frames until a terminal response or the deadline
    ///
    /// The session must already be streaming. On timeout the request is
    /// deregistered from `table` (only if it is still this request's entry).
    /// A closed frame channel means the request was superseded or the
    /// listener was reset.
    pub async fn drive(
        mut self,
        mut frames: mpsc::UnboundedReceiver<Frame>,
        table: RequestTable,
        timeout: Duration,
        out: mpsc::UnboundedSender<ConversationResponse>,
    ) -> SessionState {
        let deadline = Instant::now() + timeout;

        while !self.state.is_terminal() {
            let response = tokio::select! {
                frame = frames.recv() => match frame {
                    Some(frame) => {
                        tracing::debug!(
                            conversation_id = %self.conversation_id,
                            request_id = %self.request_id,
                            kind = ?frame.kind,
                            "Stream frame"
                        );
                        self.on_frame(&frame)
                    }
                    None => self.fail(ChatError::with_message(
                        ErrorCode::UnknownError,
                        "request superseded",
                    )),
                },
                () = tokio::time::sleep_until(deadline) => {
                    table.deregister(&self.conversation_id, &self.request_id);
                    tracing::warn!(
                        conversation_id = %self.conversation_id,
                        request_id = %self.request_id,
                        timeout_ms = timeout.as_millis() as u64,
                        "Request timed out"
                    );
                    self.time_out()
                }
            };

            if let Some(response) = response {
                // Caller may have stopped listening; the session still finishes
                let _ = out.send(response);
            }
        }

        tracing::info!(
            conversation_id = %self.conversation_id,
            request_id = %self.request_id,
            state = ?self.state,
            chars = self.text.len(),
            "Stream session finished"
        );
        self.state
    }
}
