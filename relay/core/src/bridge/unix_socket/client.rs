//! Unix Socket Bridge Client
//!
//! Requester-side end of the bridge. Requests are correlated with their
//! responses by id through a table of oneshot senders; broadcasts are
//! re-published on a local [`BroadcastHub`] so any number of listeners in this
//! process can subscribe.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::bridge::envelope::{encode, BridgeEnvelope, EnvelopeDecoder};
use crate::bridge::{Bridge, BroadcastHub, DEFAULT_BROADCAST_CAPACITY};
use crate::error::{ChatError, ErrorCode, TransportError};
use crate::messages::{BridgeReply, BridgeRequest, BridgeResponse, StreamBroadcast};

type PendingTable = DashMap<u64, oneshot::Sender<BridgeResponse>>;

/// Client side of the cross-process bridge
pub struct UnixBridgeClient {
    socket_path: PathBuf,
    writer: mpsc::Sender<BridgeEnvelope>,
    pending: Arc<PendingTable>,
    hub: BroadcastHub,
    next_id: AtomicU64,
    connected: Arc<AtomicBool>,
}

impl UnixBridgeClient {
    /// Connect to a bridge server
    ///
    /// # Errors
    ///
    /// Returns `TransportError::ConnectionFailed` if the socket cannot be
    /// reached.
    pub async fn connect(socket_path: &Path) -> Result<Self, TransportError> {
        let stream = UnixStream::connect(socket_path).await.map_err(|e| {
            TransportError::ConnectionFailed(format!("Failed to connect to {socket_path:?}: {e}"))
        })?;
        let (mut read_half, mut write_half) = stream.into_split();

        let (writer, mut write_rx) = mpsc::channel::<BridgeEnvelope>(64);
        let pending: Arc<PendingTable> = Arc::new(DashMap::new());
        let hub = BroadcastHub::new(DEFAULT_BROADCAST_CAPACITY);
        let connected = Arc::new(AtomicBool::new(true));

        // Read task: stream -> responses / broadcasts
        let read_pending = Arc::clone(&pending);
        let read_hub = hub.clone();
        let read_connected = Arc::clone(&connected);
        tokio::spawn(async move {
            let mut decoder = EnvelopeDecoder::new();
            let mut buf = [0u8; 4096];
            'read: loop {
                let n = match read_half.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(e) => {
                        tracing::warn!(error = %e, "Bridge read error");
                        break;
                    }
                };
                decoder.push(&buf[..n]);

                loop {
                    match decoder.decode_next() {
                        Ok(Some(BridgeEnvelope::Response { id, body })) => {
                            match read_pending.remove(&id) {
                                Some((_, tx)) => {
                                    let _ = tx.send(body);
                                }
                                None => tracing::debug!(id, "Response for unknown request"),
                            }
                        }
                        Ok(Some(BridgeEnvelope::Broadcast { body })) => {
                            read_hub.publish(body);
                        }
                        Ok(Some(BridgeEnvelope::Request { .. })) => {
                            tracing::warn!("Unexpected request envelope from server");
                        }
                        Ok(None) => break,
                        Err(e) => {
                            tracing::warn!(error = %e, "Envelope decode error");
                            break 'read;
                        }
                    }
                }
            }

            read_connected.store(false, Ordering::SeqCst);
            // Dropping the senders fails every waiting request
            read_pending.clear();
            tracing::info!("Disconnected from bridge server");
        });

        // Write task: write_rx -> stream
        let write_connected = Arc::clone(&connected);
        let write_pending = Arc::clone(&pending);
        tokio::spawn(async move {
            while let Some(envelope) = write_rx.recv().await {
                match encode(&envelope) {
                    Ok(bytes) => {
                        if let Err(e) = write_half.write_all(&bytes).await {
                            tracing::warn!(error = %e, "Bridge write error");
                            break;
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "Envelope encode error"),
                }
            }
            write_connected.store(false, Ordering::SeqCst);
            write_pending.clear();
        });

        tracing::info!(path = ?socket_path, "Connected to bridge server");

        Ok(Self {
            socket_path: socket_path.to_path_buf(),
            writer,
            pending,
            hub,
            next_id: AtomicU64::new(1),
            connected,
        })
    }

    /// Get the socket path
    pub fn socket_path(&self) -> &PathBuf {
        &self.socket_path
    }

    /// Whether the server connection is still up
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn disconnected() -> ChatError {
        ChatError::with_message(ErrorCode::NetworkError, "bridge disconnected")
    }

    /// Insert the reply slot for `id`
    ///
    /// The disconnect path clears the table after lowering `connected`, so a
    /// slot inserted after that clear is caught by the check here.
    fn track(&self, id: u64) -> Result<oneshot::Receiver<BridgeResponse>, ChatError> {
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);
        if !self.is_connected() {
            self.pending.remove(&id);
            return Err(Self::disconnected());
        }
        Ok(rx)
    }
}

#[async_trait]
impl Bridge for UnixBridgeClient {
    async fn request(&self, request: BridgeRequest) -> Result<BridgeReply, ChatError> {
        if !self.is_connected() {
            return Err(Self::disconnected());
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let envelope = BridgeEnvelope::request(id, &request)?;

        let rx = self.track(id)?;

        tracing::debug!(id, kind = request.kind(), "Bridge request (unix socket)");

        if self.writer.send(envelope).await.is_err() {
            self.pending.remove(&id);
            return Err(Self::disconnected());
        }

        rx.await
            .map_err(|_| Self::disconnected())?
            .into_result()
    }

    fn subscribe(&self) -> broadcast::Receiver<StreamBroadcast> {
        self.hub.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::unix_socket::UnixBridgeServer;
    use crate::bridge::RequestHandler;
    use crate::transport::Frame;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::Notify;

    struct Fixed;

    #[async_trait]
    impl RequestHandler for Fixed {
        async fn handle(&self, request: BridgeRequest) -> BridgeResponse {
            match request {
                BridgeRequest::Chat { .. } => BridgeResponse::ok(BridgeReply::connected()),
                _ => BridgeResponse::err(ChatError::network()),
            }
        }
    }

    #[tokio::test]
    async fn test_connect_no_server() {
        let temp_dir = TempDir::new().unwrap();
        let result = UnixBridgeClient::connect(&temp_dir.path().join("missing.sock")).await;
        assert!(matches!(result, Err(TransportError::ConnectionFailed(_))));
    }

    #[tokio::test]
    async fn test_request_after_disconnect_leaves_no_slot() {
        let temp_dir = TempDir::new().unwrap();
        let socket_path = temp_dir.path().join("relay.sock");

        let mut server =
            UnixBridgeServer::new(socket_path.clone(), Arc::new(Fixed), BroadcastHub::new(16));
        server.listen().await.unwrap();
        let client = UnixBridgeClient::connect(&socket_path).await.unwrap();

        // Disconnect noticed between the first check and the insert
        client.connected.store(false, Ordering::SeqCst);
        let err = client.track(7).unwrap_err();
        assert_eq!(err.code, ErrorCode::NetworkError);
        assert!(client.pending.is_empty());

        let err = tokio::time::timeout(Duration::from_secs(2), client.request(BridgeRequest::Session))
            .await
            .unwrap()
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::NetworkError);

        server.shutdown();
    }

    #[tokio::test]
    async fn test_request_and_broadcast_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let socket_path = temp_dir.path().join("relay.sock");
        let hub = BroadcastHub::new(16);

        let mut server = UnixBridgeServer::new(socket_path.clone(), Arc::new(Fixed), hub.clone());
        server.listen().await.unwrap();
        let stop = Arc::new(Notify::new());
        let stop_server = Arc::clone(&stop);
        let server_task = tokio::spawn(async move {
            server.run(stop_server.notified()).await.unwrap();
            server.shutdown();
        });

        let client = UnixBridgeClient::connect(&socket_path).await.unwrap();
        assert!(client.is_connected());

        let reply = client
            .request(BridgeRequest::Chat {
                conversation_id: "c-1".into(),
                prompt: "hi".into(),
                role_id: 1,
                model_id: None,
            })
            .await
            .unwrap();
        assert_eq!(reply, BridgeReply::connected());

        let err = client.request(BridgeRequest::Session).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::NetworkError);

        // The server subscribed for this client once the first request was served
        let mut rx = client.subscribe();
        hub.publish(StreamBroadcast::new("c-1".into(), Frame::middle("x")));
        let received = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.data, Frame::middle("x"));

        stop.notify_one();
        server_task.await.unwrap();
    }
}
