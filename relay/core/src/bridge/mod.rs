//! Request/Response Bridge
//!
//! The message-passing substrate between the requester context (which runs
//! completions) and the background context (which owns sockets and
//! credentials).
//!
//! - `in_process`: direct handler call plus a tokio broadcast channel
//! - `unix_socket`: the same contract across processes over a Unix socket
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────┐   request / [err, data]   ┌──────────────────────┐
//! │ Requester            ├──────────────────────────►│ Background           │
//! │  ChatClient          │                           │  RequestHandler      │
//! │  StreamListener  ◄───┤◄──────────────────────────┤  BroadcastHub        │
//! └──────────────────────┘   broadcast (fan-out)     └──────────────────────┘
//! ```
//!
//! Requests are single request/response pairs; broadcasts are
//! fire-and-forget and reach every subscriber, which filter by conversation.

pub mod envelope;
pub mod in_process;
#[cfg(unix)]
pub mod unix_socket;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::error::ChatError;
use crate::messages::{BridgeReply, BridgeRequest, BridgeResponse, StreamBroadcast};

pub use envelope::{BridgeEnvelope, EnvelopeDecoder};
pub use in_process::InProcessBridge;
#[cfg(unix)]
pub use unix_socket::{UnixBridgeClient, UnixBridgeServer};

/// Default broadcast channel capacity
pub const DEFAULT_BROADCAST_CAPACITY: usize = 1024;

/// Requester-side view of the bridge
#[async_trait]
pub trait Bridge: Send + Sync {
    /// Send one request and wait for its response
    ///
    /// # Errors
    ///
    /// The `ChatError` carried by the response, or `NETWORK_ERROR` if the
    /// bridge itself failed.
    async fn request(&self, request: BridgeRequest) -> Result<BridgeReply, ChatError>;

    /// Subscribe to stream broadcasts
    fn subscribe(&self) -> broadcast::Receiver<StreamBroadcast>;
}

/// Background-side request handler
#[async_trait]
pub trait RequestHandler: Send + Sync {
    /// Answer one request
    async fn handle(&self, request: BridgeRequest) -> BridgeResponse;
}

/// Fan-out point for stream broadcasts
#[derive(Clone, Debug)]
pub struct BroadcastHub {
    tx: broadcast::Sender<StreamBroadcast>,
}

impl Default for BroadcastHub {
    fn default() -> Self {
        Self::new(DEFAULT_BROADCAST_CAPACITY)
    }
}

impl BroadcastHub {
    /// Create a hub with the given capacity
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish to every subscriber
    ///
    /// Returns the number of subscribers reached (0 is not an error).
    pub fn publish(&self, message: StreamBroadcast) -> usize {
        self.tx.send(message).unwrap_or(0)
    }

    /// New subscription
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<StreamBroadcast> {
        self.tx.subscribe()
    }

    /// Current subscriber count
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Frame;

    #[tokio::test]
    async fn test_hub_fan_out() {
        let hub = BroadcastHub::new(8);
        assert_eq!(hub.publish(StreamBroadcast::new("c".into(), Frame::end())), 0);

        let mut a = hub.subscribe();
        let mut b = hub.subscribe();
        assert_eq!(hub.subscriber_count(), 2);
        assert_eq!(hub.publish(StreamBroadcast::new("c".into(), Frame::middle("x"))), 2);

        assert_eq!(a.recv().await.unwrap().data, Frame::middle("x"));
        assert_eq!(b.recv().await.unwrap().data, Frame::middle("x"));
    }
}
