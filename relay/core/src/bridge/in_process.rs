//! In-Process Bridge
//!
//! Used when requester and background share one process: requests call the
//! handler directly, broadcasts go through the shared [`BroadcastHub`].
//!
//! # Usage
//!
//! ```ignore
//! let background = BackgroundContext::init(config, connector, auth, verifier);
//! let bridge = InProcessBridge::new(Arc::new(background.clone()), background.hub());
//! let client = ChatClient::new(Arc::new(bridge), profile, login, timeout);
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;

use super::{Bridge, BroadcastHub, RequestHandler};
use crate::error::ChatError;
use crate::messages::{BridgeReply, BridgeRequest, StreamBroadcast};

/// Bridge whose background lives in the same process
#[derive(Clone)]
pub struct InProcessBridge {
    handler: Arc<dyn RequestHandler>,
    hub: BroadcastHub,
}

impl InProcessBridge {
    /// Connect a handler and the hub it publishes to
    #[must_use]
    pub fn new(handler: Arc<dyn RequestHandler>, hub: BroadcastHub) -> Self {
        Self { handler, hub }
    }
}

#[async_trait]
impl Bridge for InProcessBridge {
    async fn request(&self, request: BridgeRequest) -> Result<BridgeReply, ChatError> {
        tracing::debug!(kind = request.kind(), "Bridge request (in-process)");
        self.handler.handle(request).await.into_result()
    }

    fn subscribe(&self) -> broadcast::Receiver<StreamBroadcast> {
        self.hub.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::messages::BridgeResponse;
    use crate::transport::Frame;

    struct Echo;

    #[async_trait]
    impl RequestHandler for Echo {
        async fn handle(&self, request: BridgeRequest) -> BridgeResponse {
            match request {
                BridgeRequest::Create {
                    conversation_id, ..
                } => BridgeResponse::ok(BridgeReply::Created {
                    conversation_id: conversation_id.unwrap_or_default(),
                }),
                BridgeRequest::Chat { .. } => BridgeResponse::ok(BridgeReply::connected()),
                BridgeRequest::Session => BridgeResponse::err(ChatError::unauthorized()),
            }
        }
    }

    #[tokio::test]
    async fn test_request_and_subscribe() {
        let hub = BroadcastHub::new(8);
        let bridge = InProcessBridge::new(Arc::new(Echo), hub.clone());

        let reply = bridge
            .request(BridgeRequest::Create {
                conversation_id: Some("c-1".into()),
                role_id: 1,
                model_id: None,
            })
            .await
            .unwrap();
        assert_eq!(
            reply,
            BridgeReply::Created {
                conversation_id: "c-1".into()
            }
        );

        let err = bridge.request(BridgeRequest::Session).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::Unauthorized);

        let mut rx = bridge.subscribe();
        hub.publish(StreamBroadcast::new("c-1".into(), Frame::end()));
        assert_eq!(rx.recv().await.unwrap().conversation_id, "c-1".into());
    }
}
