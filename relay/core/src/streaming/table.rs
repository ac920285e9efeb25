//! Request Table
//!
//! Correlates broadcast frames with the completion waiting for them. One entry
//! per conversation holds the frame channel of its active request.
//!
//! - registering replaces the previous entry; dropping its sender closes the
//!   superseded request's channel
//! - a terminal frame removes the entry as it is delivered, so each request
//!   is fulfilled at most once
//! - deregistration is keyed by request id, so a stale request cannot evict
//!   its successor

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;

use crate::messages::{ConversationId, RequestId};
use crate::transport::Frame;

struct RequestEntry {
    request_id: RequestId,
    tx: mpsc::UnboundedSender<Frame>,
}

/// Conversation -> active request
#[derive(Clone, Default)]
pub struct RequestTable {
    entries: Arc<DashMap<ConversationId, RequestEntry>>,
}

impl RequestTable {
    /// Create an empty table
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the active request of a conversation
    ///
    /// Returns the receiving end of the request's frame channel.
    pub fn register(
        &self,
        conversation_id: &ConversationId,
        request_id: RequestId,
    ) -> mpsc::UnboundedReceiver<Frame> {
        let (tx, rx) = mpsc::unbounded_channel();
        let previous = self.entries.insert(
            conversation_id.clone(),
            RequestEntry {
                request_id: request_id.clone(),
                tx,
            },
        );
        if let Some(previous) = previous {
            tracing::warn!(
                conversation_id = %conversation_id,
                superseded = %previous.request_id,
                request_id = %request_id,
                "Request superseded"
            );
        }
        rx
    }

    /// Hand a frame to the conversation's active request
    ///
    /// Returns `true` if a request received it.
    pub fn deliver(&self, conversation_id: &ConversationId, frame: Frame) -> bool {
        if frame.is_terminal() {
            match self.entries.remove(conversation_id) {
                Some((_, entry)) => entry.tx.send(frame).is_ok(),
                None => false,
            }
        } else {
            match self.entries.get(conversation_id) {
                Some(entry) => entry.tx.send(frame).is_ok(),
                None => false,
            }
        }
    }

    /// Remove the entry if it still belongs to `request_id`
    pub fn deregister(&self, conversation_id: &ConversationId, request_id: &RequestId) -> bool {
        self.entries
            .remove_if(conversation_id, |_, entry| &entry.request_id == request_id)
            .is_some()
    }

    /// Whether the conversation has an active request
    #[must_use]
    pub fn contains(&self, conversation_id: &ConversationId) -> bool {
        self.entries.contains_key(conversation_id)
    }

    /// Number of active requests
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no request is active
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every entry (closing their channels)
    pub fn clear(&self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_terminal_frame_fulfills_once() {
        let table = RequestTable::new();
        let conv = ConversationId::from("c-1");
        let mut rx = table.register(&conv, RequestId::new());

        assert!(table.deliver(&conv, Frame::middle("a")));
        assert!(table.deliver(&conv, Frame::end()));
        assert!(!table.contains(&conv));
        assert!(!table.deliver(&conv, Frame::middle("late")));

        assert_eq!(rx.recv().await, Some(Frame::middle("a")));
        assert_eq!(rx.recv().await, Some(Frame::end()));
        assert_eq!(rx.recv().await, None);
    }

    #[test]
    fn test_receiver_woken_on_delivery() {
        let table = RequestTable::new();
        let conv = ConversationId::from("c-1");
        let mut rx = table.register(&conv, RequestId::new());

        let mut recv = tokio_test::task::spawn(rx.recv());
        tokio_test::assert_pending!(recv.poll());

        assert!(!table.deliver(&"other".into(), Frame::middle("no")));
        assert!(!recv.is_woken());

        assert!(table.deliver(&conv, Frame::middle("x")));
        assert!(recv.is_woken());
        tokio_test::assert_ready_eq!(recv.poll(), Some(Frame::middle("x")));
    }

    #[tokio::test]
    async fn test_register_supersedes() {
        let table = RequestTable::new();
        let conv = ConversationId::from("c-1");
        let mut old = table.register(&conv, RequestId::new());
        let mut new = table.register(&conv, RequestId::new());

        assert_eq!(old.recv().await, None);
        assert!(table.deliver(&conv, Frame::start()));
        assert_eq!(new.recv().await, Some(Frame::start()));
    }

    #[test]
    fn test_deregister_checks_request_id() {
        let table = RequestTable::new();
        let conv = ConversationId::from("c-1");
        let first = RequestId::new();
        let _rx1 = table.register(&conv, first.clone());
        let second = RequestId::new();
        let _rx2 = table.register(&conv, second.clone());

        assert!(!table.deregister(&conv, &first));
        assert_eq!(table.len(), 1);
        assert!(table.deregister(&conv, &second));
        assert!(table.is_empty());
    }
}
