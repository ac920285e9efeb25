//! Stream Listener
//!
//! The requester's single subscription to bridge broadcasts. It keeps only
//! `stream-channel` broadcasts and hands each frame to the request table,
//! which routes by conversation id.

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use super::table::RequestTable;
use crate::bridge::Bridge;
use crate::messages::{BroadcastSource, StreamBroadcast};

/// Broadcast subscription feeding a [`RequestTable`]
pub struct StreamListener {
    table: RequestTable,
    task: JoinHandle<()>,
}

impl StreamListener {
    /// Subscribe to `bridge` and start forwarding
    #[must_use]
    pub fn init(bridge: &dyn Bridge, table: RequestTable) -> Self {
        let mut broadcasts = bridge.subscribe();
        let forward_table = table.clone();

        let task = tokio::spawn(async move {
            loop {
                match broadcasts.recv().await {
                    Ok(message) => forward(&forward_table, message),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Stream listener lagging, frames lost");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        tracing::debug!("Broadcast channel closed, stream listener stopping");
                        break;
                    }
                }
            }
        });

        Self { table, task }
    }

    /// Table this listener feeds
    #[must_use]
    pub fn table(&self) -> &RequestTable {
        &self.table
    }

    /// Stop listening and drop every waiting request
    pub fn reset(&self) {
        self.task.abort();
        self.table.clear();
    }
}

impl Drop for StreamListener {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn forward(table: &RequestTable, message: StreamBroadcast) {
    if message.source != BroadcastSource::StreamChannel {
        return;
    }
    let conversation_id = message.conversation_id;
    let kind = message.data.kind;
    if !table.deliver(&conversation_id, message.data) {
        tracing::debug!(conversation_id = %conversation_id, kind = ?kind, "No waiting request, broadcast ignored");
    }
}
