//! Connection Registry
//!
//! Process-wide table of live conversation sockets. The registry is the only
//! component that mutates connection entries; everything else reads through
//! cheap [`ConnectionHandle`] snapshots or asks the registry to change state.
//!
//! # Architecture
//!
//! ```text
//!                     ConnectionRegistry
//!                    ┌──────────────────────────────────────────┐
//!                    │ HashMap<ConversationId, Connection>      │
//!                    │   - wrapped in Arc<RwLock<>>             │
//!                    └──────────────────┬───────────────────────┘
//!                                       │
//!             ┌─────────────────────────┼─────────────────────────┐
//!             │                         │                         │
//!     ┌───────▼────────┐        ┌───────▼────────┐        ┌───────▼────────┐
//!     │ conv a (conn-1)│        │ conv b (conn-2)│        │ conv c (conn-3)│
//!     │ outbound tx    │        │ outbound tx    │        │ outbound tx    │
//!     │ heartbeat      │        │ heartbeat      │        │ heartbeat      │
//!     │ pending cb?    │        │ pending cb?    │        │ pending cb?    │
//!     └────────────────┘        └────────────────┘        └────────────────┘
//! ```
//!
//! # Thread Safety
//!
//! Each method takes the lock once, so every mutation is atomic. Sequences
//! such as "check open, then connect, then create" span awaits and are not;
//! [`ConnectionRegistry::create`] rejects the second writer with
//! `AlreadyExists` and the caller falls back to the winner's connection.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use crate::error::RegistryError;
use crate::messages::ConversationId;
use crate::transport::{Frame, SocketMessage};

/// Unique identifier of one socket
///
/// A conversation may be backed by several sockets over its life (reopen
/// after close); each gets a fresh id so stale close events can be told apart
/// from the current connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Create a new unique connection ID
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::SeqCst))
    }

    /// Get the raw numeric value
    #[must_use]
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Callback invoked for every forwarded frame of the active request
pub type FrameCallback = Arc<dyn Fn(&Frame) + Send + Sync>;

/// Token identifying one registration of a pending callback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackToken(u64);

impl CallbackToken {
    fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::SeqCst))
    }
}

struct PendingCallback {
    token: CallbackToken,
    callback: FrameCallback,
}

/// A live conversation socket, owned by the registry
struct Connection {
    id: ConnectionId,
    outbound: mpsc::Sender<SocketMessage>,
    heartbeat: Option<AbortHandle>,
    pending: Option<PendingCallback>,
    opened_at: Instant,
}

impl Connection {
    fn is_open(&self) -> bool {
        !self.outbound.is_closed()
    }
}

/// Read-only snapshot of a registered connection
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    /// Socket identifier
    pub id: ConnectionId,
    /// Conversation served by the socket
    pub conversation_id: ConversationId,
    /// Channel to write to the socket
    pub outbound: mpsc::Sender<SocketMessage>,
    /// When the socket was registered
    pub opened_at: Instant,
}

impl ConnectionHandle {
    /// Check if the socket is still open
    #[must_use]
    pub fn is_open(&self) -> bool {
        !self.outbound.is_closed()
    }

    /// Get the connection uptime in seconds
    #[must_use]
    pub fn uptime_secs(&self) -> u64 {
        self.opened_at.elapsed().as_secs()
    }
}

/// Resources released by removing a connection
///
/// The caller tears these down; the registry never touches sockets or tasks.
#[derive(Debug)]
pub struct RemovedConnection {
    /// Socket identifier
    pub id: ConnectionId,
    /// Channel to write to the socket (for a final close)
    pub outbound: mpsc::Sender<SocketMessage>,
    /// Heartbeat task to cancel
    pub heartbeat: Option<AbortHandle>,
}

/// Snapshot of registry state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrySummary {
    /// Registered connections
    pub total_connections: usize,
    /// Registered connections whose socket is open
    pub open_connections: usize,
    /// Connections with an active request
    pub pending_requests: usize,
}

/// Registry of conversation sockets
#[derive(Clone)]
pub struct ConnectionRegistry {
    inner: Arc<RwLock<HashMap<ConversationId, Connection>>>,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionRegistry {
    /// Create a new empty registry
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register a connection for a conversation
    ///
    /// A registered but closed entry is replaced.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::AlreadyExists` if an open connection is
    /// already registered for `conversation_id`.
    pub fn create(
        &self,
        conversation_id: &ConversationId,
        outbound: mpsc::Sender<SocketMessage>,
    ) -> Result<ConnectionHandle, RegistryError> {
        let mut inner = self.inner.write();

        if inner.get(conversation_id).is_some_and(Connection::is_open) {
            return Err(RegistryError::AlreadyExists(conversation_id.clone()));
        }

        let conn = Connection {
            id: ConnectionId::new(),
            outbound,
            heartbeat: None,
            pending: None,
            opened_at: Instant::now(),
        };
        let handle = ConnectionHandle {
            id: conn.id,
            conversation_id: conversation_id.clone(),
            outbound: conn.outbound.clone(),
            opened_at: conn.opened_at,
        };

        if let Some(stale) = inner.insert(conversation_id.clone(), conn) {
            if let Some(hb) = stale.heartbeat {
                hb.abort();
            }
            tracing::debug!(
                conversation_id = %conversation_id,
                connection_id = %stale.id,
                "Replaced closed connection"
            );
        }

        tracing::info!(
            conversation_id = %conversation_id,
            connection_id = %handle.id,
            "Connection registered"
        );
        Ok(handle)
    }

    /// Look up the connection for a conversation
    #[must_use]
    pub fn get(&self, conversation_id: &ConversationId) -> Option<ConnectionHandle> {
        self.inner
            .read()
            .get(conversation_id)
            .map(|conn| ConnectionHandle {
                id: conn.id,
                conversation_id: conversation_id.clone(),
                outbound: conn.outbound.clone(),
                opened_at: conn.opened_at,
            })
    }

    /// Remove the connection for a conversation (idempotent)
    pub fn remove(&self, conversation_id: &ConversationId) -> Option<RemovedConnection> {
        let removed = self.inner.write().remove(conversation_id);
        removed.map(|conn| {
            tracing::info!(
                conversation_id = %conversation_id,
                connection_id = %conn.id,
                "Connection unregistered"
            );
            RemovedConnection {
                id: conn.id,
                outbound: conn.outbound,
                heartbeat: conn.heartbeat,
            }
        })
    }

    /// Remove the entry only if it is still the given socket
    ///
    /// Close events of a replaced socket must not evict its successor.
    pub fn remove_if_current(
        &self,
        conversation_id: &ConversationId,
        id: ConnectionId,
    ) -> Option<RemovedConnection> {
        let mut inner = self.inner.write();
        if inner.get(conversation_id).map(|c| c.id) != Some(id) {
            return None;
        }
        let conn = inner.remove(conversation_id)?;
        drop(inner);

        tracing::info!(
            conversation_id = %conversation_id,
            connection_id = %conn.id,
            "Connection unregistered"
        );
        Some(RemovedConnection {
            id: conn.id,
            outbound: conn.outbound,
            heartbeat: conn.heartbeat,
        })
    }

    /// Attach the heartbeat task of a socket
    ///
    /// Returns `false` (and aborts the task) if the socket is no longer the
    /// registered one.
    pub fn set_heartbeat(
        &self,
        conversation_id: &ConversationId,
        id: ConnectionId,
        heartbeat: AbortHandle,
    ) -> bool {
        let mut inner = self.inner.write();
        match inner.get_mut(conversation_id) {
            Some(conn) if conn.id == id => {
                if let Some(old) = conn.heartbeat.replace(heartbeat) {
                    old.abort();
                }
                true
            }
            _ => {
                heartbeat.abort();
                false
            }
        }
    }

    /// Register the callback for the conversation's active request
    ///
    /// Replaces (and drops) any previous callback.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::NotFound` if no connection is registered.
    pub fn set_pending(
        &self,
        conversation_id: &ConversationId,
        callback: FrameCallback,
    ) -> Result<CallbackToken, RegistryError> {
        let mut inner = self.inner.write();
        let conn = inner
            .get_mut(conversation_id)
            .ok_or_else(|| RegistryError::NotFound(conversation_id.clone()))?;

        let token = CallbackToken::next();
        if conn
            .pending
            .replace(PendingCallback { token, callback })
            .is_some()
        {
            tracing::debug!(conversation_id = %conversation_id, "Pending callback replaced");
        }
        Ok(token)
    }

    /// Current pending callback
    #[must_use]
    pub fn pending(&self, conversation_id: &ConversationId) -> Option<(CallbackToken, FrameCallback)> {
        self.inner
            .read()
            .get(conversation_id)
            .and_then(|conn| conn.pending.as_ref())
            .map(|p| (p.token, Arc::clone(&p.callback)))
    }

    /// Clear the pending callback if it is still the given registration
    ///
    /// Returns `true` if a callback was cleared.
    pub fn clear_pending(&self, conversation_id: &ConversationId, token: CallbackToken) -> bool {
        let mut inner = self.inner.write();
        match inner.get_mut(conversation_id) {
            Some(conn) if conn.pending.as_ref().map(|p| p.token) == Some(token) => {
                conn.pending = None;
                true
            }
            _ => false,
        }
    }

    /// Check if an open connection is registered
    #[must_use]
    pub fn is_open(&self, conversation_id: &ConversationId) -> bool {
        self.inner
            .read()
            .get(conversation_id)
            .is_some_and(Connection::is_open)
    }

    /// Get the number of registered connections
    #[must_use]
    pub fn count(&self) -> usize {
        self.inner.read().len()
    }

    /// Get the conversations with a registered connection
    #[must_use]
    pub fn conversation_ids(&self) -> Vec<ConversationId> {
        self.inner.read().keys().cloned().collect()
    }

    /// Get a summary of registry state
    #[must_use]
    pub fn summary(&self) -> RegistrySummary {
        let inner = self.inner.read();
        RegistrySummary {
            total_connections: inner.len(),
            open_connections: inner.values().filter(|c| c.is_open()).count(),
            pending_requests: inner.values().filter(|c| c.pending.is_some()).count(),
        }
    }

    /// Drop every entry
    ///
    /// Returns the removed connections so the caller can close them.
    pub fn reset(&self) -> Vec<RemovedConnection> {
        let drained: Vec<_> = self.inner.write().drain().collect();
        if !drained.is_empty() {
            tracing::info!(removed = drained.len(), "Connection registry reset");
        }
        drained
            .into_iter()
            .map(|(_, conn)| RemovedConnection {
                id: conn.id,
                outbound: conn.outbound,
                heartbeat: conn.heartbeat,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn channel() -> (mpsc::Sender<SocketMessage>, mpsc::Receiver<SocketMessage>) {
        mpsc::channel(8)
    }

    #[test]
    fn test_create_and_get() {
        let registry = ConnectionRegistry::new();
        let conv = ConversationId::from("c-1");
        let (tx, _rx) = channel();

        let handle = registry.create(&conv, tx).unwrap();
        assert_eq!(registry.count(), 1);
        assert!(registry.is_open(&conv));
        assert_eq!(registry.get(&conv).unwrap().id, handle.id);
    }

    #[test]
    fn test_create_rejects_open_duplicate() {
        let registry = ConnectionRegistry::new();
        let conv = ConversationId::from("c-1");
        let (tx1, _rx1) = channel();
        let (tx2, _rx2) = channel();

        registry.create(&conv, tx1).unwrap();
        let err = registry.create(&conv, tx2).unwrap_err();
        assert_eq!(err, RegistryError::AlreadyExists(conv));
    }

    #[test]
    fn test_create_replaces_closed_entry() {
        let registry = ConnectionRegistry::new();
        let conv = ConversationId::from("c-1");
        let (tx1, rx1) = channel();
        let first = registry.create(&conv, tx1).unwrap();
        drop(rx1);
        assert!(!registry.is_open(&conv));

        let (tx2, _rx2) = channel();
        let second = registry.create(&conv, tx2).unwrap();
        assert_ne!(first.id, second.id);
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn test_remove_idempotent() {
        let registry = ConnectionRegistry::new();
        let conv = ConversationId::from("c-1");
        let (tx, _rx) = channel();
        registry.create(&conv, tx).unwrap();

        assert!(registry.remove(&conv).is_some());
        assert!(registry.remove(&conv).is_none());
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn test_remove_if_current_ignores_stale_id() {
        let registry = ConnectionRegistry::new();
        let conv = ConversationId::from("c-1");
        let (tx, _rx) = channel();
        let handle = registry.create(&conv, tx).unwrap();

        assert!(registry.remove_if_current(&conv, ConnectionId::new()).is_none());
        assert_eq!(registry.count(), 1);
        assert!(registry.remove_if_current(&conv, handle.id).is_some());
    }

    #[test]
    fn test_pending_replace_drops_previous() {
        let registry = ConnectionRegistry::new();
        let conv = ConversationId::from("c-1");
        let (tx, _rx) = channel();
        registry.create(&conv, tx).unwrap();

        let first: FrameCallback = Arc::new(|_| {});
        let weak = Arc::downgrade(&first);
        let first_token = registry.set_pending(&conv, first).unwrap();
        let second_token = registry.set_pending(&conv, Arc::new(|_| {})).unwrap();

        assert!(weak.upgrade().is_none());
        assert!(!registry.clear_pending(&conv, first_token));
        assert!(registry.clear_pending(&conv, second_token));
        assert!(registry.pending(&conv).is_none());
    }

    #[test]
    fn test_set_pending_without_connection() {
        let registry = ConnectionRegistry::new();
        let conv = ConversationId::from("missing");
        let result = registry.set_pending(&conv, Arc::new(|_| {}));
        assert_eq!(result.unwrap_err(), RegistryError::NotFound(conv));
    }

    #[test]
    fn test_pending_callback_invocation() {
        let registry = ConnectionRegistry::new();
        let conv = ConversationId::from("c-1");
        let (tx, _rx) = channel();
        registry.create(&conv, tx).unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        registry
            .set_pending(
                &conv,
                Arc::new(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();

        let (_, cb) = registry.pending(&conv).unwrap();
        cb(&Frame::end());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_summary_and_reset() {
        let registry = ConnectionRegistry::new();
        let (tx1, _rx1) = channel();
        let (tx2, rx2) = channel();
        registry.create(&"a".into(), tx1).unwrap();
        registry.create(&"b".into(), tx2).unwrap();
        registry.set_pending(&"a".into(), Arc::new(|_| {})).unwrap();
        drop(rx2);

        assert_eq!(
            registry.summary(),
            RegistrySummary {
                total_connections: 2,
                open_connections: 1,
                pending_requests: 1,
            }
        );

        let removed = registry.reset();
        assert_eq!(removed.len(), 2);
        assert_eq!(registry.count(), 0);
    }
}
