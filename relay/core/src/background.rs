//! Background Context
//!
//! The long-lived side of the bridge. It owns the connection registry, the
//! connection manager, and the broadcast hub, and answers bridge requests:
//!
//! | request   | behavior                                                     |
//! |-----------|--------------------------------------------------------------|
//! | `create`  | reuse the open socket or open one; reply `{conversationId}`  |
//! | `chat`    | register the forwarding callback, send the prompt            |
//! | `session` | probe the stored credentials                                 |
//!
//! There is exactly one context per process, created with
//! [`BackgroundContext::init`] and torn down with [`BackgroundContext::reset`].

use std::sync::Arc;

use async_trait::async_trait;

use crate::auth::{AuthGate, Credentials, SessionVerifier};
use crate::bridge::{BroadcastHub, RequestHandler};
use crate::config::RelayConfig;
use crate::error::{ChatError, ErrorCode};
use crate::manager::{ConnectionManager, ManagerConfig, OpenParams};
use crate::messages::{BridgeReply, BridgeRequest, BridgeResponse, ConversationId, StreamBroadcast};
use crate::registry::{ConnectionRegistry, FrameCallback};
use crate::transport::{Frame, SocketConnector};

struct BackgroundInner {
    manager: ConnectionManager,
    hub: BroadcastHub,
    auth: Arc<dyn AuthGate>,
    verifier: Arc<dyn SessionVerifier>,
}

/// Background request handler and socket owner
#[derive(Clone)]
pub struct BackgroundContext {
    inner: Arc<BackgroundInner>,
}

impl BackgroundContext {
    /// Build the process's background context
    #[must_use]
    pub fn init(
        config: &RelayConfig,
        connector: Arc<dyn SocketConnector>,
        auth: Arc<dyn AuthGate>,
        verifier: Arc<dyn SessionVerifier>,
    ) -> Self {
        let registry = ConnectionRegistry::new();
        let manager = ConnectionManager::new(registry, connector, ManagerConfig::from(config));
        let hub = BroadcastHub::new(config.broadcast_capacity);

        tracing::info!(host = %config.host, "Background context initialized");

        Self {
            inner: Arc::new(BackgroundInner {
                manager,
                hub,
                auth,
                verifier,
            }),
        }
    }

    /// Hub carrying stream broadcasts
    #[must_use]
    pub fn hub(&self) -> BroadcastHub {
        self.inner.hub.clone()
    }

    /// Live connection table
    #[must_use]
    pub fn registry(&self) -> &ConnectionRegistry {
        self.inner.manager.registry()
    }

    /// Close every socket and clear the registry
    pub fn reset(&self) {
        self.inner.manager.shutdown();
        tracing::info!("Background context reset");
    }

    async fn create(
        &self,
        conversation_id: Option<ConversationId>,
        role_id: u32,
        model_id: Option<u32>,
    ) -> Result<BridgeReply, ChatError> {
        let conversation_id = conversation_id.unwrap_or_default();

        if self.registry().is_open(&conversation_id) {
            return Ok(BridgeReply::Created { conversation_id });
        }

        let credentials = Credentials::from_gate(self.inner.auth.as_ref()).await?;
        self.inner
            .manager
            .open(OpenParams {
                conversation_id: conversation_id.clone(),
                credentials,
                role_id,
                model_id,
            })
            .await?;

        Ok(BridgeReply::Created { conversation_id })
    }

    async fn chat(&self, conversation_id: ConversationId, prompt: String) -> Result<BridgeReply, ChatError> {
        let registry = self.registry();
        if !registry.is_open(&conversation_id) {
            return Err(ChatError::with_message(
                ErrorCode::NetworkError,
                format!("no open connection for conversation {conversation_id}"),
            ));
        }

        let hub = self.inner.hub.clone();
        let tagged = conversation_id.clone();
        let forward: FrameCallback = Arc::new(move |frame: &Frame| {
            hub.publish(StreamBroadcast::new(tagged.clone(), frame.clone()));
        });

        let token = registry
            .set_pending(&conversation_id, forward)
            .map_err(|e| ChatError::with_message(ErrorCode::NetworkError, e.to_string()))?;

        if let Err(e) = self.inner.manager.send_chat(&conversation_id, &prompt).await {
            registry.clear_pending(&conversation_id, token);
            tracing::error!(conversation_id = %conversation_id, error = %e, "Chat send failed");
            return Err(ChatError::with_message(ErrorCode::NetworkError, e.message));
        }

        Ok(BridgeReply::connected())
    }

    async fn session(&self) -> Result<BridgeReply, ChatError> {
        let credentials = Credentials::from_gate(self.inner.auth.as_ref()).await?;
        let user = self.inner.verifier.verify(&credentials).await?;
        Ok(BridgeReply::Session(user))
    }
}

#[async_trait]
impl RequestHandler for BackgroundContext {
    async fn handle(&self, request: BridgeRequest) -> BridgeResponse {
        let kind = request.kind();
        let result = match request {
            BridgeRequest::Create {
                conversation_id,
                role_id,
                model_id,
            } => self.create(conversation_id, role_id, model_id).await,
            BridgeRequest::Chat {
                conversation_id,
                prompt,
                ..
            } => self.chat(conversation_id, prompt).await,
            BridgeRequest::Session => self.session().await,
        };

        if let Err(ref e) = result {
            tracing::warn!(request = kind, code = %e.code, message = %e.message, "Bridge request failed");
        }
        result.into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{StaticAuthGate, UserInfo};
    use crate::transport::{FrameKind, MemoryConnector};
    use std::time::Duration;

    struct AcceptAll;

    #[async_trait]
    impl SessionVerifier for AcceptAll {
        async fn verify(&self, credentials: &Credentials) -> Result<UserInfo, ChatError> {
            Ok(UserInfo {
                username: credentials.session_id.clone(),
                ..Default::default()
            })
        }
    }

    fn context(connector: &MemoryConnector, auth: StaticAuthGate) -> BackgroundContext {
        BackgroundContext::init(
            &RelayConfig::default(),
            Arc::new(connector.clone()),
            Arc::new(auth),
            Arc::new(AcceptAll),
        )
    }

    fn create(conv: Option<&str>) -> BridgeRequest {
        BridgeRequest::Create {
            conversation_id: conv.map(ConversationId::from),
            role_id: 1,
            model_id: Some(1),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_generates_id_and_reuses() {
        let connector = MemoryConnector::new();
        let ctx = context(&connector, StaticAuthGate::new("'sid'", "tok"));

        let reply = ctx.handle(create(None)).await.into_result().unwrap();
        let BridgeReply::Created { conversation_id } = reply else {
            panic!("expected created reply");
        };
        assert!(uuid::Uuid::parse_str(conversation_id.as_str()).is_ok());
        assert_eq!(connector.targets()[0].session_id, "sid");

        let again = ctx
            .handle(create(Some(conversation_id.as_str())))
            .await
            .into_result()
            .unwrap();
        assert_eq!(again, BridgeReply::Created { conversation_id });
        assert_eq!(connector.connect_count(), 1);
    }

    #[tokio::test]
    async fn test_create_without_credentials() {
        let connector = MemoryConnector::new();
        let ctx = context(&connector, StaticAuthGate::empty());

        let err = ctx.handle(create(Some("c-1"))).await.into_result().unwrap_err();
        assert!(err.is_unauthorized());
        assert_eq!(connector.connect_count(), 0);
    }

    #[tokio::test]
    async fn test_chat_requires_open_connection() {
        let ctx = context(&MemoryConnector::new(), StaticAuthGate::new("s", "t"));
        let err = ctx
            .handle(BridgeRequest::Chat {
                conversation_id: "missing".into(),
                prompt: "hi".into(),
                role_id: 1,
                model_id: None,
            })
            .await
            .into_result()
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::NetworkError);
    }

    #[tokio::test(start_paused = true)]
    async fn test_chat_forwards_frames_as_broadcasts() {
        let connector = MemoryConnector::new();
        let ctx = context(&connector, StaticAuthGate::new("s", "t"));
        ctx.handle(create(Some("c-1"))).await.into_result().unwrap();
        let mut peer = connector.accept().await.unwrap();
        let mut broadcasts = ctx.hub().subscribe();

        let ack = ctx
            .handle(BridgeRequest::Chat {
                conversation_id: "c-1".into(),
                prompt: "hello".into(),
                role_id: 1,
                model_id: Some(1),
            })
            .await
            .into_result()
            .unwrap();
        assert_eq!(ack, BridgeReply::connected());
        assert_eq!(peer.recv_non_heartbeat().await.unwrap(), Frame::chat("hello"));

        peer.send_frame(&Frame::middle("a")).await.unwrap();
        peer.send_frame(&Frame::end()).await.unwrap();

        let first = broadcasts.recv().await.unwrap();
        assert_eq!(first.conversation_id, "c-1".into());
        assert_eq!(first.data, Frame::middle("a"));
        assert_eq!(broadcasts.recv().await.unwrap().data.kind, FrameKind::End);

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(ctx.registry().pending(&"c-1".into()).is_none());
    }

    #[tokio::test]
    async fn test_session_probe() {
        let ctx = context(&MemoryConnector::new(), StaticAuthGate::new("ada", "t"));
        let reply = ctx.handle(BridgeRequest::Session).await.into_result().unwrap();
        let BridgeReply::Session(user) = reply else {
            panic!("expected session reply");
        };
        assert_eq!(user.username, "ada");
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_closes_connections() {
        let connector = MemoryConnector::new();
        let ctx = context(&connector, StaticAuthGate::new("s", "t"));
        ctx.handle(create(Some("a"))).await.into_result().unwrap();
        ctx.handle(create(Some("b"))).await.into_result().unwrap();
        assert_eq!(ctx.registry().count(), 2);

        ctx.reset();
        assert_eq!(ctx.registry().count(), 0);
    }
}
