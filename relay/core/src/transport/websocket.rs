//! WebSocket Connector
//!
//! Opens the provider's streaming endpoint with tokio-tungstenite and bridges
//! the socket to channels: a read task forwards frames into the inbound
//! channel, a write task drains the outbound channel into the socket.

use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use super::{
    ConnectionTarget, SocketConnector, SocketEvent, SocketHandle, SocketMessage,
    SOCKET_CHANNEL_CAPACITY,
};
use crate::error::TransportError;

/// Connector for the real provider endpoint
#[derive(Clone, Debug)]
pub struct WebSocketConnector {
    connect_timeout: Duration,
}

impl WebSocketConnector {
    /// Create a connector with the given handshake timeout
    #[must_use]
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl SocketConnector for WebSocketConnector {
    async fn connect(&self, target: &ConnectionTarget) -> Result<SocketHandle, TransportError> {
        let url = target.url()?;

        let (stream, _response) = tokio::time::timeout(self.connect_timeout, connect_async(url))
            .await
            .map_err(|_| TransportError::ConnectTimeout(self.connect_timeout.as_millis() as u64))?
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        let (mut write, mut read) = stream.split();

        let (outbound_tx, mut outbound_rx) = mpsc::channel::<SocketMessage>(SOCKET_CHANNEL_CAPACITY);
        let (inbound_tx, inbound_rx) = mpsc::channel::<SocketEvent>(SOCKET_CHANNEL_CAPACITY);

        let conversation_id = target.conversation_id.clone();
        let write_errors = inbound_tx.clone();

        // Read task: socket -> inbound
        tokio::spawn(async move {
            while let Some(msg) = read.next().await {
                let event = match msg {
                    Ok(Message::Text(text)) => SocketEvent::Message(SocketMessage::Text(text)),
                    Ok(Message::Binary(bytes)) => {
                        SocketEvent::Message(SocketMessage::Binary(bytes))
                    }
                    Ok(Message::Close(frame)) => {
                        let (code, reason) = frame
                            .map(|f| (Some(u16::from(f.code)), f.reason.into_owned()))
                            .unwrap_or((None, String::new()));
                        let _ = inbound_tx.send(SocketEvent::Closed { code, reason }).await;
                        return;
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        let _ = inbound_tx.send(SocketEvent::Error(e.to_string())).await;
                        return;
                    }
                };
                if inbound_tx.send(event).await.is_err() {
                    tracing::debug!(conversation_id = %conversation_id, "Inbound receiver dropped");
                    return;
                }
            }
            let _ = inbound_tx
                .send(SocketEvent::Closed {
                    code: None,
                    reason: "stream ended".to_string(),
                })
                .await;
        });

        // Write task: outbound -> socket
        let conversation_id = target.conversation_id.clone();
        tokio::spawn(async move {
            while let Some(msg) = outbound_rx.recv().await {
                let result = match msg {
                    SocketMessage::Text(text) => write.send(Message::Text(text)).await,
                    SocketMessage::Binary(bytes) => write.send(Message::Binary(bytes)).await,
                    SocketMessage::Close => {
                        let _ = write.send(Message::Close(None)).await;
                        break;
                    }
                };
                if let Err(e) = result {
                    tracing::warn!(conversation_id = %conversation_id, error = %e, "WebSocket write error");
                    let _ = write_errors
                        .send(SocketEvent::Error(format!("write failed: {e}")))
                        .await;
                    break;
                }
            }
            let _ = write.close().await;
        });

        tracing::info!(
            conversation_id = %target.conversation_id,
            host = %target.host,
            "WebSocket connected"
        );

        Ok(SocketHandle {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}
