//! Connection Manager
//!
//! Owns the lifecycle of conversation sockets: handshake, registration,
//! heartbeat scheduling, inbound reading, and teardown.
//!
//! # Lifecycle
//!
//! ```text
//!  open() ──▶ reuse? ──yes──▶ existing handle
//!               │ no
//!               ▼
//!          connector.connect(target) ──err──▶ NETWORK_ERROR
//!               │
//!               ▼
//!          registry.create() ──AlreadyExists──▶ close own socket, return winner
//!               │
//!               ├──▶ spawn heartbeat (5 s)   send failure ─┐
//!               └──▶ spawn reader ──▶ router               │
//!                          │ close / error / malformed     │
//!                          ▼                               ▼
//!                     fail pending (synthetic error) ─▶ unregister ─▶ close socket
//! ```

use std::sync::Arc;

use crate::auth::Credentials;
use crate::config::RelayConfig;
use crate::error::{ChatError, ErrorCode, RegistryError};
use crate::messages::ConversationId;
use crate::registry::{ConnectionHandle, ConnectionId, ConnectionRegistry, RemovedConnection};
use crate::router::{MessageRouter, RouteOutcome};
use crate::transport::{
    ConnectionTarget, Frame, HeartbeatConfig, HeartbeatExit, HeartbeatTask, SocketConnector,
    SocketEvent, SocketHandle, SocketMessage,
};

/// Connection manager settings
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ManagerConfig {
    /// Socket scheme
    pub scheme: String,
    /// Chat service host
    pub host: String,
    /// Heartbeat settings
    pub heartbeat: HeartbeatConfig,
    /// Fail the pending request when its socket closes
    pub fail_pending_on_close: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self::from(&RelayConfig::default())
    }
}

impl From<&RelayConfig> for ManagerConfig {
    fn from(config: &RelayConfig) -> Self {
        Self {
            scheme: config.scheme.clone(),
            host: config.host.clone(),
            heartbeat: config.heartbeat(),
            fail_pending_on_close: config.fail_pending_on_close,
        }
    }
}

/// Parameters of one `open`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OpenParams {
    /// Conversation to back
    pub conversation_id: ConversationId,
    /// Sanitized credentials
    pub credentials: Credentials,
    /// Provider role
    pub role_id: u32,
    /// Provider model
    pub model_id: Option<u32>,
}

/// Why a socket went away
#[derive(Clone, Debug, PartialEq, Eq)]
enum CloseReason {
    Remote { code: Option<u16>, reason: String },
    Error(String),
    Malformed,
    HeartbeatFailed,
    Local,
}

impl CloseReason {
    fn describe(&self) -> String {
        match self {
            Self::Remote { code, reason } => match code {
                Some(code) => format!("connection closed ({code}) {reason}"),
                None => format!("connection closed {reason}"),
            },
            Self::Error(e) => format!("connection error: {e}"),
            Self::Malformed => "malformed frame".to_string(),
            Self::HeartbeatFailed => "heartbeat send failed".to_string(),
            Self::Local => "connection closed locally".to_string(),
        }
    }
}

struct ManagerInner {
    registry: ConnectionRegistry,
    router: MessageRouter,
    connector: Arc<dyn SocketConnector>,
    config: ManagerConfig,
}

/// Opens, keeps alive, and closes conversation sockets
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
}

impl ConnectionManager {
    /// Create a manager
    #[must_use]
    pub fn new(
        registry: ConnectionRegistry,
        connector: Arc<dyn SocketConnector>,
        config: ManagerConfig,
    ) -> Self {
        let router = MessageRouter::new(registry.clone());
        Self {
            inner: Arc::new(ManagerInner {
                registry,
                router,
                connector,
                config,
            }),
        }
    }

    /// The registry this manager writes to
    #[must_use]
    pub fn registry(&self) -> &ConnectionRegistry {
        &self.inner.registry
    }

    /// Open the socket for a conversation, reusing an open one
    ///
    /// # Errors
    ///
    /// Returns `NETWORK_ERROR` if the handshake fails.
    pub async fn open(&self, params: OpenParams) -> Result<ConnectionHandle, ChatError> {
        let conversation_id = params.conversation_id.clone();

        if let Some(existing) = self.open_handle(&conversation_id) {
            tracing::debug!(
                conversation_id = %conversation_id,
                connection_id = %existing.id,
                "Reusing open connection"
            );
            return Ok(existing);
        }

        let target = ConnectionTarget {
            scheme: self.inner.config.scheme.clone(),
            host: self.inner.config.host.clone(),
            session_id: params.credentials.session_id,
            role_id: params.role_id,
            conversation_id: conversation_id.clone(),
            model_id: params.model_id,
            token: params.credentials.token,
        };

        let socket = self.inner.connector.connect(&target).await.map_err(|e| {
            tracing::error!(conversation_id = %conversation_id, error = %e, "Handshake failed");
            ChatError::from(e)
        })?;

        self.register(conversation_id, socket)
    }

    fn open_handle(&self, conversation_id: &ConversationId) -> Option<ConnectionHandle> {
        self.inner
            .registry
            .get(conversation_id)
            .filter(ConnectionHandle::is_open)
    }

    fn register(
        &self,
        conversation_id: ConversationId,
        socket: SocketHandle,
    ) -> Result<ConnectionHandle, ChatError> {
        let SocketHandle { outbound, inbound } = socket;

        let handle = match self.inner.registry.create(&conversation_id, outbound.clone()) {
            Ok(handle) => handle,
            Err(RegistryError::AlreadyExists(_)) => {
                // Lost a concurrent open; drop our socket and use the winner's
                let _ = outbound.try_send(SocketMessage::Close);
                drop(inbound);
                tracing::info!(conversation_id = %conversation_id, "Concurrent open lost, reusing winner");
                return self.open_handle(&conversation_id).ok_or_else(|| {
                    ChatError::with_message(ErrorCode::NetworkError, "winning connection closed")
                });
            }
            Err(e) => return Err(ChatError::with_message(ErrorCode::UnknownError, e.to_string())),
        };

        let id = handle.id;

        let heartbeat = HeartbeatTask::new(
            conversation_id.clone(),
            outbound,
            self.inner.config.heartbeat.clone(),
        );
        let this = self.clone();
        let hb_conversation = conversation_id.clone();
        let heartbeat_task = tokio::spawn(async move {
            if heartbeat.run().await == HeartbeatExit::SendFailed {
                this.handle_closed(&hb_conversation, id, CloseReason::HeartbeatFailed);
            }
        });
        self.inner
            .registry
            .set_heartbeat(&conversation_id, id, heartbeat_task.abort_handle());

        let this = self.clone();
        let reader_conversation = conversation_id.clone();
        tokio::spawn(async move {
            this.read_loop(reader_conversation, id, inbound).await;
        });

        tracing::info!(conversation_id = %conversation_id, connection_id = %id, "Connection opened");
        Ok(handle)
    }

    async fn read_loop(
        &self,
        conversation_id: ConversationId,
        id: ConnectionId,
        mut inbound: tokio::sync::mpsc::Receiver<SocketEvent>,
    ) {
        while let Some(event) = inbound.recv().await {
            match event {
                SocketEvent::Message(msg) => {
                    if let RouteOutcome::Malformed(_) =
                        self.inner.router.route_message(&conversation_id, &msg)
                    {
                        self.handle_closed(&conversation_id, id, CloseReason::Malformed);
                        return;
                    }
                }
                SocketEvent::Closed { code, reason } => {
                    self.handle_closed(&conversation_id, id, CloseReason::Remote { code, reason });
                    return;
                }
                SocketEvent::Error(e) => {
                    tracing::error!(conversation_id = %conversation_id, error = %e, "Socket error");
                    self.handle_closed(&conversation_id, id, CloseReason::Error(e));
                    return;
                }
            }
        }
        self.handle_closed(
            &conversation_id,
            id,
            CloseReason::Remote {
                code: None,
                reason: "inbound ended".to_string(),
            },
        );
    }

    fn handle_closed(&self, conversation_id: &ConversationId, id: ConnectionId, reason: CloseReason) {
        let is_current = self
            .inner
            .registry
            .get(conversation_id)
            .is_some_and(|h| h.id == id);
        if !is_current {
            return;
        }

        if self.inner.config.fail_pending_on_close && reason != CloseReason::Malformed {
            let error = ChatError::with_message(ErrorCode::NetworkError, reason.describe());
            self.inner
                .router
                .route(conversation_id, &Frame::synthetic_error(error));
        }

        if let Some(removed) = self.inner.registry.remove_if_current(conversation_id, id) {
            Self::teardown(removed);
            tracing::info!(
                conversation_id = %conversation_id,
                connection_id = %id,
                reason = %reason.describe(),
                "Connection closed"
            );
        }
    }

    fn teardown(removed: RemovedConnection) {
        if let Some(heartbeat) = removed.heartbeat {
            heartbeat.abort();
        }
        let _ = removed.outbound.try_send(SocketMessage::Close);
    }

    /// Send a prompt over the conversation's open socket
    ///
    /// # Errors
    ///
    /// Returns `NETWORK_ERROR` if no open socket exists or the write fails.
    pub async fn send_chat(&self, conversation_id: &ConversationId, prompt: &str) -> Result<(), ChatError> {
        let handle = self.open_handle(conversation_id).ok_or_else(|| {
            ChatError::with_message(
                ErrorCode::NetworkError,
                format!("no open connection for conversation {conversation_id}"),
            )
        })?;

        let payload = Frame::chat(prompt).encode()?;
        handle
            .outbound
            .send(SocketMessage::Text(payload))
            .await
            .map_err(|_| ChatError::with_message(ErrorCode::NetworkError, "connection closed"))?;

        tracing::debug!(conversation_id = %conversation_id, "Chat frame sent");
        Ok(())
    }

    /// Close the conversation's socket
    pub fn close(&self, conversation_id: &ConversationId) {
        if let Some(handle) = self.inner.registry.get(conversation_id) {
            self.handle_closed(conversation_id, handle.id, CloseReason::Local);
        }
    }

    /// Close every socket and empty the registry
    pub fn shutdown(&self) {
        for conversation_id in self.inner.registry.conversation_ids() {
            self.close(&conversation_id);
        }
        for removed in self.inner.registry.reset() {
            Self::teardown(removed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::FrameCallback;
    use crate::transport::{FrameKind, MemoryConnector};
    use parking_lot::Mutex;
    use std::time::Duration;

    fn params(conv: &str) -> OpenParams {
        OpenParams {
            conversation_id: conv.into(),
            credentials: Credentials {
                session_id: "sid".into(),
                token: "tok".into(),
            },
            role_id: 1,
            model_id: Some(11),
        }
    }

    fn manager(connector: &MemoryConnector) -> ConnectionManager {
        ConnectionManager::new(
            ConnectionRegistry::new(),
            Arc::new(connector.clone()),
            ManagerConfig {
                scheme: "ws".into(),
                host: "memory".into(),
                ..Default::default()
            },
        )
    }

    fn recorder() -> (FrameCallback, Arc<Mutex<Vec<Frame>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        (Arc::new(move |f: &Frame| sink.lock().push(f.clone())), seen)
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_registers_and_reuses() {
        let connector = MemoryConnector::new();
        let manager = manager(&connector);

        let first = manager.open(params("c-1")).await.unwrap();
        let second = manager.open(params("c-1")).await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(connector.connect_count(), 1);
        assert!(manager.registry().is_open(&"c-1".into()));

        let target = &connector.targets()[0];
        assert_eq!(target.session_id, "sid");
        assert_eq!(target.model_id, Some(11));
    }

    #[tokio::test]
    async fn test_handshake_failure_is_network_error() {
        let connector = MemoryConnector::new();
        connector.refuse_next(1);
        let manager = manager(&connector);

        let err = manager.open(params("c-1")).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::NetworkError);
        assert_eq!(manager.registry().count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_chat_frame() {
        let connector = MemoryConnector::new();
        let manager = manager(&connector);
        manager.open(params("c-1")).await.unwrap();
        let mut peer = connector.accept().await.unwrap();

        manager.send_chat(&"c-1".into(), "hello").await.unwrap();
        let frame = peer.recv_non_heartbeat().await.unwrap();
        assert_eq!(frame, Frame::chat("hello"));
    }

    #[tokio::test]
    async fn test_send_chat_without_connection() {
        let manager = manager(&MemoryConnector::new());
        let err = manager.send_chat(&"nope".into(), "hi").await.unwrap_err();
        assert_eq!(err.code, ErrorCode::NetworkError);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_close_fails_pending_and_unregisters() {
        let connector = MemoryConnector::new();
        let manager = manager(&connector);
        let conv: ConversationId = "c-1".into();
        manager.open(params("c-1")).await.unwrap();
        let peer = connector.accept().await.unwrap();

        let (callback, seen) = recorder();
        manager.registry().set_pending(&conv, callback).unwrap();

        peer.close().await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(manager.registry().count(), 0);
        let frames = seen.lock();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].kind, FrameKind::Error);
        assert_eq!(frames[0].error_descriptor().code, ErrorCode::NetworkError);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_without_failing_pending() {
        let connector = MemoryConnector::new();
        let manager = ConnectionManager::new(
            ConnectionRegistry::new(),
            Arc::new(connector.clone()),
            ManagerConfig {
                fail_pending_on_close: false,
                ..Default::default()
            },
        );
        let conv: ConversationId = "c-1".into();
        manager.open(params("c-1")).await.unwrap();
        let peer = connector.accept().await.unwrap();

        let (callback, seen) = recorder();
        manager.registry().set_pending(&conv, callback).unwrap();

        peer.fail("reset by peer").await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(manager.registry().count(), 0);
        assert!(seen.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_frame_closes_connection() {
        let connector = MemoryConnector::new();
        let manager = manager(&connector);
        let conv: ConversationId = "c-1".into();
        manager.open(params("c-1")).await.unwrap();
        let mut peer = connector.accept().await.unwrap();

        let (callback, seen) = recorder();
        manager.registry().set_pending(&conv, callback).unwrap();

        peer.send_text("{{garbage").await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(manager.registry().count(), 0);
        {
            let frames = seen.lock();
            assert_eq!(frames.len(), 1);
            assert_eq!(frames[0].error_descriptor().code, ErrorCode::UnknownError);
        }

        // Client sent a close to the server
        loop {
            match peer.recv().await {
                Some(SocketMessage::Close) | None => break,
                Some(_) => continue,
            }
        }
    }

    /// Connector whose write side is gone while its read side stays silent
    struct DeadWriterConnector {
        inbound: Mutex<Vec<tokio::sync::mpsc::Sender<SocketEvent>>>,
    }

    #[async_trait::async_trait]
    impl SocketConnector for DeadWriterConnector {
        async fn connect(
            &self,
            _target: &ConnectionTarget,
        ) -> Result<SocketHandle, crate::error::TransportError> {
            let (outbound, outbound_rx) = tokio::sync::mpsc::channel(8);
            let (inbound_tx, inbound) = tokio::sync::mpsc::channel(8);
            drop(outbound_rx);
            self.inbound.lock().push(inbound_tx);
            Ok(SocketHandle { outbound, inbound })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_dead_writer_closes_connection_and_fails_pending() {
        let connector = Arc::new(DeadWriterConnector {
            inbound: Mutex::new(Vec::new()),
        });
        let manager = ConnectionManager::new(
            ConnectionRegistry::new(),
            connector.clone(),
            ManagerConfig::default(),
        );
        let conv: ConversationId = "c-1".into();
        manager.open(params("c-1")).await.unwrap();

        let (callback, seen) = recorder();
        manager.registry().set_pending(&conv, callback).unwrap();

        tokio::time::sleep(Duration::from_secs(1)).await;

        // No Closed event ever arrives; the heartbeat alone tears it down
        assert_eq!(connector.inbound.lock().len(), 1);
        assert_eq!(manager.registry().count(), 0);
        assert!(manager.registry().pending(&conv).is_none());

        let frames = seen.lock();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].kind, FrameKind::Error);
        assert_eq!(frames[0].error_descriptor().code, ErrorCode::NetworkError);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_open_single_connection() {
        let connector = MemoryConnector::new().with_handshake_delay(Duration::from_millis(100));
        let manager = manager(&connector);

        let (a, b) = tokio::join!(manager.open(params("c-1")), manager.open(params("c-1")));
        let (a, b) = (a.unwrap(), b.unwrap());

        assert_eq!(a.id, b.id);
        assert_eq!(manager.registry().count(), 1);
        assert_eq!(manager.registry().summary().open_connections, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_closes_everything() {
        let connector = MemoryConnector::new();
        let manager = manager(&connector);
        manager.open(params("a")).await.unwrap();
        manager.open(params("b")).await.unwrap();
        assert_eq!(manager.registry().count(), 2);

        manager.shutdown();
        assert_eq!(manager.registry().count(), 0);
    }
}
