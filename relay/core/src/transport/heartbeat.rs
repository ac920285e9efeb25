//! Heartbeat Keepalive
//!
//! The sole liveness mechanism for a conversation socket. While the socket is
//! open a `{"type":"heartbeat","content":"ping"}` frame is written once right
//! away and then every `interval` (5 s by default). The provider never answers
//! heartbeats; a failed write is the only failure signal. A writer that went
//! away counts as a failed write, since the socket can no longer carry frames.
//!
//! # Usage
//!
//! ```ignore
//! let task = HeartbeatTask::new(conversation_id, outbound.clone(), HeartbeatConfig::default());
//! let handle = tokio::spawn(async move {
//!     if task.run().await == HeartbeatExit::SendFailed {
//!         // close the connection
//!     }
//! });
//! // on close
//! handle.abort();
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

use super::{Frame, SocketMessage};
use crate::messages::ConversationId;

/// Default heartbeat interval
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(5_000);

/// Configuration for heartbeat behavior
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Interval between heartbeat frames (default: 5 seconds)
    pub interval: Duration,
    /// Whether heartbeats are sent at all
    pub enabled: bool,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_HEARTBEAT_INTERVAL,
            enabled: true,
        }
    }
}

impl HeartbeatConfig {
    /// Config with heartbeats disabled
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }

    /// Set the interval
    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }
}

/// Why a heartbeat loop ended
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HeartbeatExit {
    /// Heartbeats are disabled
    Stopped,
    /// Writing a heartbeat failed or the writer is gone; the caller must close
    /// the connection
    SendFailed,
}

/// Per-connection heartbeat loop
pub struct HeartbeatTask {
    conversation_id: ConversationId,
    outbound: mpsc::Sender<SocketMessage>,
    config: HeartbeatConfig,
}

impl HeartbeatTask {
    /// Create a heartbeat loop for one socket
    #[must_use]
    pub fn new(
        conversation_id: ConversationId,
        outbound: mpsc::Sender<SocketMessage>,
        config: HeartbeatConfig,
    ) -> Self {
        Self {
            conversation_id,
            outbound,
            config,
        }
    }

    /// Run until the socket closes or a write fails
    ///
    /// Cancelled by aborting the spawned task.
    pub async fn run(self) -> HeartbeatExit {
        if !self.config.enabled {
            return HeartbeatExit::Stopped;
        }

        let payload = match Frame::heartbeat().encode() {
            Ok(text) => text,
            Err(e) => {
                tracing::error!(conversation_id = %self.conversation_id, error = %e, "Heartbeat encode failed");
                return HeartbeatExit::SendFailed;
            }
        };

        // First tick completes immediately
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;

            if self.outbound.is_closed() {
                tracing::warn!(conversation_id = %self.conversation_id, "Socket writer gone, heartbeat failed");
                return HeartbeatExit::SendFailed;
            }

            if let Err(e) = self.outbound.send(SocketMessage::Text(payload.clone())).await {
                tracing::warn!(
                    conversation_id = %self.conversation_id,
                    error = %e,
                    "Heartbeat send failed"
                );
                return HeartbeatExit::SendFailed;
            }

            tracing::debug!(conversation_id = %self.conversation_id, "Heartbeat sent");
        }
    }
}
