//! Live connection handles and the per-process connection registry.
//!
//! Uses lock-free DashMap keyed by identity, so a process holds at most one
//! live handle per identity.

use crate::error::{GatewayError, Result};
use crate::protocol::Packet;
use axum::extract::ws::Message;
use chrono::Utc;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

/// Unique per-connection identifier (distinct from the user identity).
pub type ConnectionId = Uuid;

/// Default buffer size for a connection's outbound queue.
pub const CLIENT_CHANNEL_BUFFER_SIZE: usize = 1000;

/// Lifecycle of a connection once its upgrade has completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Open = 0,
    Closing = 1,
    Closed = 2,
}

impl From<u8> for ConnectionState {
    fn from(value: u8) -> Self {
        match value {
            0 => ConnectionState::Open,
            1 => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }
}

/// Handle to one live WebSocket connection.
///
/// Frames are never written to the socket directly: they are queued on a
/// bounded channel drained by the connection's single writer task.
pub struct ConnectionHandle {
    /// Unique connection identifier.
    pub id: ConnectionId,
    /// Identity this connection serves.
    pub identity: String,
    /// Timestamp when the connection was opened.
    pub connected_at: i64,
    tx: mpsc::Sender<Message>,
    state: AtomicU8,
    cancel: CancellationToken,
}

impl ConnectionHandle {
    /// Create an open handle. `cancel` fires when the handle is closed.
    pub fn new(identity: impl Into<String>, tx: mpsc::Sender<Message>, cancel: CancellationToken) -> Self {
        Self {
            id: Uuid::new_v4(),
            identity: identity.into(),
            connected_at: Utc::now().timestamp_millis(),
            tx,
            state: AtomicU8::new(ConnectionState::Open as u8),
            cancel,
        }
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from(self.state.load(Ordering::Acquire))
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Token cancelled once this connection starts closing.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Queue a packet for the socket.
    /// Uses try_send for non-blocking behavior - drops the packet if the buffer is full.
    pub fn deliver(&self, packet: &Packet) -> Result<()> {
        if !self.is_open() {
            return Err(GatewayError::Transport(format!(
                "connection {} is not open",
                self.id
            )));
        }
        let json = serde_json::to_string(packet)?;
        self.send_frame(Message::Text(json.into()))
    }

    /// Queue a raw frame for the socket.
    pub fn send_frame(&self, msg: Message) -> Result<()> {
        match self.tx.try_send(msg) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(GatewayError::ChannelSend),
            Err(TrySendError::Closed(_)) => {
                // Writer is gone, so the socket is too.
                self.close();
                Err(GatewayError::Transport(format!(
                    "writer for connection {} has stopped",
                    self.id
                )))
            }
        }
    }

    /// Begin closing: cancel the session and queue a Close frame.
    /// Only the first call has any effect.
    pub fn close(&self) {
        let transitioned = self
            .state
            .compare_exchange(
                ConnectionState::Open as u8,
                ConnectionState::Closing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();

        if transitioned {
            debug!("Closing connection {} for {}", self.id, self.identity);
            self.cancel.cancel();
            let _ = self.tx.try_send(Message::Close(None));
        }
    }

    /// Terminal state, set once teardown has finished.
    pub fn mark_closed(&self) {
        self.cancel.cancel();
        self.state
            .store(ConnectionState::Closed as u8, Ordering::Release);
    }
}

/// Lock-free registry of live connections, one per identity.
pub struct ConnectionRegistry {
    connections: DashMap<String, Arc<ConnectionHandle>>,
}

impl ConnectionRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
        }
    }

    /// Insert `handle`, atomically replacing any handle for the same identity.
    /// The replaced handle is returned so the caller can close it.
    pub fn register(&self, handle: Arc<ConnectionHandle>) -> Option<Arc<ConnectionHandle>> {
        let previous = self
            .connections
            .insert(handle.identity.clone(), handle.clone());

        match &previous {
            Some(prev) => info!(
                "Connection {} for {} replaces {}",
                handle.id, handle.identity, prev.id
            ),
            None => info!("Connection {} for {} registered", handle.id, handle.identity),
        }

        previous
    }

    /// Remove `handle` only if it is still the registered one for its identity.
    pub fn remove(&self, handle: &ConnectionHandle) -> bool {
        let removed = self
            .connections
            .remove_if(&handle.identity, |_, current| current.id == handle.id)
            .is_some();

        if removed {
            info!("Connection {} for {} unregistered", handle.id, handle.identity);
        } else {
            debug!(
                "Connection {} for {} already replaced, leaving registry untouched",
                handle.id, handle.identity
            );
        }

        removed
    }

    /// Get the live handle for an identity.
    pub fn lookup(&self, identity: &str) -> Option<Arc<ConnectionHandle>> {
        self.connections.get(identity).map(|r| r.clone())
    }

    /// Get the total number of live connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_handle(identity: &str, buffer: usize) -> (Arc<ConnectionHandle>, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(buffer);
        let handle = ConnectionHandle::new(identity, tx, CancellationToken::new());
        (Arc::new(handle), rx)
    }

    #[test]
    fn test_register_replaces_and_returns_previous() {
        let registry = ConnectionRegistry::new();
        let (first, mut first_rx) = make_handle("u1", 8);
        let (second, _second_rx) = make_handle("u1", 8);

        assert!(registry.register(first.clone()).is_none());
        let previous = registry.register(second.clone()).unwrap();
        assert_eq!(previous.id, first.id);
        previous.close();

        assert_eq!(registry.connection_count(), 1);
        assert_eq!(registry.lookup("u1").unwrap().id, second.id);
        assert_eq!(first.state(), ConnectionState::Closing);
        assert!(first.cancel_token().is_cancelled());
        assert!(matches!(first_rx.try_recv(), Ok(Message::Close(None))));
    }

    #[test]
    fn test_stale_remove_keeps_replacement() {
        let registry = ConnectionRegistry::new();
        let (stale, _rx1) = make_handle("u1", 8);
        let (fresh, _rx2) = make_handle("u1", 8);

        registry.register(stale.clone());
        registry.register(fresh.clone());

        assert!(!registry.remove(&stale));
        assert_eq!(registry.lookup("u1").unwrap().id, fresh.id);

        assert!(registry.remove(&fresh));
        assert!(registry.lookup("u1").is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_deliver_queues_json_text() {
        let (handle, mut rx) = make_handle("u2", 8);
        handle.deliver(&Packet::direct("u1", "u2", "hello")).unwrap();

        match rx.try_recv() {
            Ok(Message::Text(text)) => {
                let packet: Packet = serde_json::from_str(text.as_str()).unwrap();
                assert_eq!(packet.content, "hello");
                assert_eq!(packet.sender_id, "u1");
            }
            other => panic!("expected text frame, got {:?}", other),
        }
    }

    #[test]
    fn test_deliver_drops_when_buffer_full() {
        let (handle, _rx) = make_handle("u2", 1);
        let packet = Packet::direct("u1", "u2", "x");

        handle.deliver(&packet).unwrap();
        assert!(matches!(
            handle.deliver(&packet),
            Err(GatewayError::ChannelSend)
        ));
        assert!(handle.is_open());
    }

    #[test]
    fn test_deliver_after_writer_gone_closes_handle() {
        let (handle, rx) = make_handle("u2", 4);
        drop(rx);

        assert!(handle.deliver(&Packet::direct("u1", "u2", "x")).is_err());
        assert_eq!(handle.state(), ConnectionState::Closing);
        assert!(handle.deliver(&Packet::direct("u1", "u2", "y")).is_err());
    }

    #[test]
    fn test_close_is_idempotent() {
        let (handle, mut rx) = make_handle("u1", 8);
        handle.close();
        handle.close();
        handle.mark_closed();

        assert!(matches!(rx.try_recv(), Ok(Message::Close(None))));
        assert!(rx.try_recv().is_err());
        assert_eq!(handle.state(), ConnectionState::Closed);
    }

    #[test]
    fn test_concurrent_register_keeps_one_per_identity() {
        use std::thread;

        let registry = Arc::new(ConnectionRegistry::new());
        let mut threads = vec![];

        for _ in 0..4 {
            let registry = registry.clone();
            threads.push(thread::spawn(move || {
                let mut receivers = vec![];
                for i in 0..50 {
                    let (handle, rx) = make_handle(&format!("user{}", i), 4);
                    if let Some(prev) = registry.register(handle) {
                        prev.close();
                    }
                    receivers.push(rx);
                }
                receivers
            }));
        }

        for t in threads {
            t.join().unwrap();
        }

        assert_eq!(registry.connection_count(), 50);
        for i in 0..50 {
            assert!(registry.lookup(&format!("user{}", i)).unwrap().is_open());
        }
    }
}
