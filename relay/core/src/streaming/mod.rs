//! Requester-Side Streaming
//!
//! # Architecture
//!
//! ```text
//! Bridge broadcasts ──> StreamListener ──> RequestTable ──> StreamSession ──> caller
//!   (all conversations)    (source filter)   (by conversation)  (state machine)
//! ```
//!
//! The listener is the only broadcast subscriber in a requester context; the
//! table correlates frames to the one active request of each conversation, and
//! each session turns its frames into `Generating`/`Done`/`Error` responses.

pub mod listener;
pub mod session;
pub mod table;

pub use listener::StreamListener;
pub use session::{
    ConversationResponse, ResponseKind, SessionState, StreamSession, DEFAULT_REQUEST_TIMEOUT,
};
pub use table::RequestTable;
