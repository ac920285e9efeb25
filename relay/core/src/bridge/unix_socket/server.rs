//! Unix Socket Bridge Server
//!
//! Background-side end of the bridge. Each accepted client gets:
//! - a read loop decoding request envelopes and answering each one from a
//!   spawned task (so a slow `create` does not block a `session` probe)
//! - a write task draining that client's outbound queue
//! - a forwarder copying every hub broadcast into the outbound queue

use std::future::Future;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc};

use crate::bridge::envelope::{encode, BridgeEnvelope, EnvelopeDecoder};
use crate::bridge::{BroadcastHub, RequestHandler};
use crate::error::{ChatError, ErrorCode, TransportError};
use crate::messages::{BridgeRequest, BridgeResponse};
use crate::registry::ConnectionId;

/// Per-client outbound queue depth
const CLIENT_QUEUE: usize = 256;

/// Server side of the cross-process bridge
pub struct UnixBridgeServer {
    socket_path: PathBuf,
    handler: Arc<dyn RequestHandler>,
    hub: BroadcastHub,
    listener: Option<UnixListener>,
}

impl UnixBridgeServer {
    /// Create a server; call [`listen`](Self::listen) before [`run`](Self::run)
    pub fn new(socket_path: PathBuf, handler: Arc<dyn RequestHandler>, hub: BroadcastHub) -> Self {
        Self {
            socket_path,
            handler,
            hub,
            listener: None,
        }
    }

    /// Get the socket path
    pub fn socket_path(&self) -> &PathBuf {
        &self.socket_path
    }

    /// Bind the socket (mode 0600), replacing a stale socket file
    pub async fn listen(&mut self) -> Result<(), TransportError> {
        if let Some(parent) = self.socket_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                TransportError::Io(std::io::Error::new(
                    e.kind(),
                    format!("Failed to create directory {parent:?}: {e}"),
                ))
            })?;
        }

        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path)?;
        }

        let listener = UnixListener::bind(&self.socket_path)?;
        std::fs::set_permissions(&self.socket_path, std::fs::Permissions::from_mode(0o600))?;
        self.listener = Some(listener);

        tracing::info!(path = ?self.socket_path, "Bridge listening on Unix socket");
        Ok(())
    }

    /// Accept clients until `shutdown` completes
    pub async fn run(&self, shutdown: impl Future<Output = ()>) -> Result<(), TransportError> {
        let listener = self
            .listener
            .as_ref()
            .ok_or_else(|| TransportError::InvalidState("Not listening".to_string()))?;

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("Bridge server stopping");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    let (stream, _addr) = accepted?;
                    if let Err(e) = validate_peer(&stream) {
                        tracing::warn!(error = %e, "Bridge client rejected");
                        continue;
                    }
                    let handler = Arc::clone(&self.handler);
                    let hub = self.hub.clone();
                    tokio::spawn(serve_client(stream, handler, hub));
                }
            }
        }
    }

    /// Stop listening and remove the socket file
    pub fn shutdown(&mut self) {
        self.listener = None;
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path).ok();
        }
    }
}

impl Drop for UnixBridgeServer {
    fn drop(&mut self) {
        if self.listener.is_some() && self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path).ok();
        }
    }
}

/// Validate peer credentials
///
/// On Linux, uses SO_PEERCRED to require the same UID as the server.
#[cfg(target_os = "linux")]
fn validate_peer(stream: &UnixStream) -> Result<(), TransportError> {
    use std::os::unix::io::AsRawFd;

    let fd = stream.as_raw_fd();
    let cred = unsafe {
        let mut cred: libc::ucred = std::mem::zeroed();
        let mut len = std::mem::size_of::<libc::ucred>() as libc::socklen_t;
        let result = libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_PEERCRED,
            &mut cred as *mut _ as *mut libc::c_void,
            &mut len,
        );
        if result < 0 {
            return Err(TransportError::AuthenticationFailed(
                "Failed to get peer credentials".to_string(),
            ));
        }
        cred
    };

    let my_uid = unsafe { libc::getuid() };
    if cred.uid != my_uid {
        return Err(TransportError::AuthenticationFailed(format!(
            "Peer UID {} does not match server UID {my_uid}",
            cred.uid
        )));
    }

    tracing::debug!(peer_uid = cred.uid, peer_pid = cred.pid, "Bridge peer validated");
    Ok(())
}

/// Filesystem permissions are the only check off Linux
#[cfg(not(target_os = "linux"))]
fn validate_peer(_stream: &UnixStream) -> Result<(), TransportError> {
    Ok(())
}

/// Parse and answer one raw request body
async fn answer(handler: &dyn RequestHandler, body: serde_json::Value) -> BridgeResponse {
    match serde_json::from_value::<BridgeRequest>(body) {
        Ok(request) => handler.handle(request).await,
        Err(e) => {
            tracing::warn!(error = %e, "Unknown bridge request");
            BridgeResponse::err(ChatError::with_message(
                ErrorCode::UnknownError,
                format!("unknown request: {e}"),
            ))
        }
    }
}

async fn serve_client(stream: UnixStream, handler: Arc<dyn RequestHandler>, hub: BroadcastHub) {
    let client_id = ConnectionId::new();
    let (mut read_half, mut write_half) = stream.into_split();
    let (out_tx, mut out_rx) = mpsc::channel::<BridgeEnvelope>(CLIENT_QUEUE);

    tracing::info!(client_id = %client_id, "Bridge client connected");

    // Write task: out_rx -> stream
    let writer = tokio::spawn(async move {
        while let Some(envelope) = out_rx.recv().await {
            let bytes = match encode(&envelope) {
                Ok(bytes) => bytes,
                Err(e) => {
                    tracing::warn!(client_id = %client_id, error = %e, "Envelope encode error");
                    continue;
                }
            };
            if let Err(e) = write_half.write_all(&bytes).await {
                tracing::debug!(client_id = %client_id, error = %e, "Bridge write error");
                break;
            }
        }
    });

    // Broadcast forwarder: hub -> out_tx
    let mut broadcasts = hub.subscribe();
    let forward_tx = out_tx.clone();
    let forwarder = tokio::spawn(async move {
        loop {
            match broadcasts.recv().await {
                Ok(body) => {
                    if forward_tx.send(BridgeEnvelope::Broadcast { body }).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(client_id = %client_id, skipped, "Bridge client lagging, broadcasts dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    // Read loop: stream -> requests
    let mut decoder = EnvelopeDecoder::new();
    let mut buf = [0u8; 4096];
    'read: loop {
        let n = match read_half.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                tracing::debug!(client_id = %client_id, error = %e, "Bridge read error");
                break;
            }
        };
        decoder.push(&buf[..n]);

        loop {
            match decoder.decode_next() {
                Ok(Some(BridgeEnvelope::Request { id, body })) => {
                    let handler = Arc::clone(&handler);
                    let reply_tx = out_tx.clone();
                    tokio::spawn(async move {
                        let body = answer(handler.as_ref(), body).await;
                        let _ = reply_tx.send(BridgeEnvelope::Response { id, body }).await;
                    });
                }
                Ok(Some(other)) => {
                    tracing::warn!(client_id = %client_id, envelope = ?other, "Unexpected envelope from client");
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(client_id = %client_id, error = %e, "Envelope decode error");
                    break 'read;
                }
            }
        }
    }

    forwarder.abort();
    drop(out_tx);
    let _ = writer.await;
    tracing::info!(client_id = %client_id, "Bridge client disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tempfile::TempDir;

    struct Reject;

    #[async_trait]
    impl RequestHandler for Reject {
        async fn handle(&self, _request: BridgeRequest) -> BridgeResponse {
            BridgeResponse::err(ChatError::unauthorized())
        }
    }

    #[tokio::test]
    async fn test_listen_sets_permissions() {
        let temp_dir = TempDir::new().unwrap();
        let socket_path = temp_dir.path().join("nested").join("relay.sock");

        let mut server =
            UnixBridgeServer::new(socket_path.clone(), Arc::new(Reject), BroadcastHub::new(4));
        server.listen().await.unwrap();

        let mode = std::fs::metadata(&socket_path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);

        server.shutdown();
        assert!(!socket_path.exists());
    }

    #[tokio::test]
    async fn test_run_requires_listen() {
        let temp_dir = TempDir::new().unwrap();
        let server = UnixBridgeServer::new(
            temp_dir.path().join("relay.sock"),
            Arc::new(Reject),
            BroadcastHub::new(4),
        );
        let result = server.run(std::future::ready(())).await;
        assert!(matches!(result, Err(TransportError::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_unknown_request_answered() {
        let response = answer(&Reject, serde_json::json!({"type": "teleport"})).await;
        let err = response.into_result().unwrap_err();
        assert_eq!(err.code, ErrorCode::UnknownError);

        let response = answer(&Reject, serde_json::json!({"type": "session"})).await;
        assert!(response.into_result().unwrap_err().is_unauthorized());
    }
}
