//! In-Memory Socket Transport
//!
//! A [`SocketConnector`] that never touches the network. Every handshake
//! produces a [`MemoryPeer`], the server side of the socket, which tests (and
//! the daemon's offline mode) use to push frames to the client and observe
//! what the client sent.
//!
//! A small wire task sits between the client's outbound channel and the peer,
//! so a client-initiated close is echoed back as a `Closed` event the same way
//! a real websocket close handshake is.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{
    ConnectionTarget, Frame, SocketConnector, SocketEvent, SocketHandle, SocketMessage,
    SOCKET_CHANNEL_CAPACITY,
};
use crate::error::TransportError;

/// Normal-closure close code
const CLOSE_NORMAL: u16 = 1000;

struct Inner {
    connects: AtomicUsize,
    refuse: AtomicUsize,
    handshake_delay: Mutex<Duration>,
    targets: Mutex<Vec<ConnectionTarget>>,
    peers_tx: mpsc::UnboundedSender<MemoryPeer>,
    peers_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<MemoryPeer>>,
}

/// In-memory connector
///
/// Cloning shares the same peer queue and counters.
#[derive(Clone)]
pub struct MemoryConnector {
    inner: Arc<Inner>,
}

impl Default for MemoryConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryConnector {
    /// Create a connector that accepts every handshake immediately
    #[must_use]
    pub fn new() -> Self {
        let (peers_tx, peers_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                connects: AtomicUsize::new(0),
                refuse: AtomicUsize::new(0),
                handshake_delay: Mutex::new(Duration::ZERO),
                targets: Mutex::new(Vec::new()),
                peers_tx,
                peers_rx: tokio::sync::Mutex::new(peers_rx),
            }),
        }
    }

    /// Delay every handshake (lets concurrent opens interleave)
    #[must_use]
    pub fn with_handshake_delay(self, delay: Duration) -> Self {
        *self.inner.handshake_delay.lock() = delay;
        self
    }

    /// Refuse the next `n` handshakes
    pub fn refuse_next(&self, n: usize) {
        self.inner.refuse.store(n, Ordering::SeqCst);
    }

    /// Number of successful handshakes so far
    #[must_use]
    pub fn connect_count(&self) -> usize {
        self.inner.connects.load(Ordering::SeqCst)
    }

    /// Targets of every attempted handshake, in order
    #[must_use]
    pub fn targets(&self) -> Vec<ConnectionTarget> {
        self.inner.targets.lock().clone()
    }

    /// Wait for the server side of the next accepted socket
    pub async fn accept(&self) -> Option<MemoryPeer> {
        self.inner.peers_rx.lock().await.recv().await
    }
}

#[async_trait]
impl SocketConnector for MemoryConnector {
    async fn connect(&self, target: &ConnectionTarget) -> Result<SocketHandle, TransportError> {
        self.inner.targets.lock().push(target.clone());

        let delay = *self.inner.handshake_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let refused = self
            .inner
            .refuse
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(TransportError::ConnectionFailed(format!(
                "handshake refused for {}",
                target.conversation_id
            )));
        }

        let (outbound_tx, mut outbound_rx) = mpsc::channel::<SocketMessage>(SOCKET_CHANNEL_CAPACITY);
        let (inbound_tx, inbound_rx) = mpsc::channel::<SocketEvent>(SOCKET_CHANNEL_CAPACITY);
        let (peer_tx, peer_rx) = mpsc::channel::<SocketMessage>(SOCKET_CHANNEL_CAPACITY);

        let echo_tx = inbound_tx.clone();
        tokio::spawn(async move {
            while let Some(msg) = outbound_rx.recv().await {
                let closing = msg == SocketMessage::Close;
                let _ = peer_tx.send(msg).await;
                if closing {
                    let _ = echo_tx
                        .send(SocketEvent::Closed {
                            code: Some(CLOSE_NORMAL),
                            reason: "closed by client".to_string(),
                        })
                        .await;
                    return;
                }
            }
            let _ = echo_tx
                .send(SocketEvent::Closed {
                    code: None,
                    reason: "client dropped".to_string(),
                })
                .await;
        });

        let peer = MemoryPeer {
            target: target.clone(),
            to_client: inbound_tx,
            from_client: peer_rx,
        };
        self.inner.connects.fetch_add(1, Ordering::SeqCst);
        let _ = self.inner.peers_tx.send(peer);

        tracing::debug!(conversation_id = %target.conversation_id, "In-memory socket accepted");

        Ok(SocketHandle {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}

/// Server side of an in-memory socket
pub struct MemoryPeer {
    target: ConnectionTarget,
    to_client: mpsc::Sender<SocketEvent>,
    from_client: mpsc::Receiver<SocketMessage>,
}

impl MemoryPeer {
    /// Handshake parameters the client used
    #[must_use]
    pub fn target(&self) -> &ConnectionTarget {
        &self.target
    }

    async fn push(&self, event: SocketEvent) -> Result<(), TransportError> {
        self.to_client
            .send(event)
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }

    /// Send a frame as a text message
    pub async fn send_frame(&self, frame: &Frame) -> Result<(), TransportError> {
        self.send_text(frame.encode()?).await
    }

    /// Send a raw text message
    pub async fn send_text(&self, text: impl Into<String>) -> Result<(), TransportError> {
        self.push(SocketEvent::Message(SocketMessage::Text(text.into())))
            .await
    }

    /// Send a raw binary message
    pub async fn send_binary(&self, bytes: Vec<u8>) -> Result<(), TransportError> {
        self.push(SocketEvent::Message(SocketMessage::Binary(bytes)))
            .await
    }

    /// Close the socket from the server side
    pub async fn close(&self) -> Result<(), TransportError> {
        self.push(SocketEvent::Closed {
            code: Some(CLOSE_NORMAL),
            reason: "closed by server".to_string(),
        })
        .await
    }

    /// Fail the socket
    pub async fn fail(&self, reason: impl Into<String>) -> Result<(), TransportError> {
        self.push(SocketEvent::Error(reason.into())).await
    }

    /// Next message the client wrote; `None` once the client side is gone
    pub async fn recv(&mut self) -> Option<SocketMessage> {
        self.from_client.recv().await
    }

    /// Wait for the client to close the socket
    ///
    /// Returns `Some(SocketMessage::Close)` on an explicit close, `None` if
    /// the client side went away without one.
    pub async fn recv_close(&mut self) -> Option<SocketMessage> {
        loop {
            if let SocketMessage::Close = self.recv().await? {
                return Some(SocketMessage::Close);
            }
        }
    }

    /// Next frame the client wrote, skipping heartbeats
    ///
    /// Returns `None` on close or on a payload that is not a frame.
    pub async fn recv_non_heartbeat(&mut self) -> Option<Frame> {
        loop {
            let frame = match self.recv().await? {
                SocketMessage::Text(text) => Frame::decode(&text).ok()?,
                SocketMessage::Binary(bytes) => Frame::decode_binary(&bytes).ok()?,
                SocketMessage::Close => return None,
            };
            if frame.kind != super::FrameKind::Heartbeat {
                return Some(frame);
            }
        }
    }
}
