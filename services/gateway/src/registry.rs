//! Connection registry
//!
//! Tracks every live viewer connection and fans leaderboard frames out to
//! them. Each connection owns a bounded outbound queue drained by its own
//! writer task, so a broadcast never waits on a slow socket: a full or
//! closed queue fails that connection only.
//!
//! Lifecycle:
//!
//! ```text
//! Connecting ──► Open ──► Closing ──► Closed
//!     │            │
//!     └────────────┴────► Error ────► Closed
//! ```
//!
//! Entries are removed from the map when they reach `Closed`.

use std::sync::Arc;

use axum::extract::ws::{Message, Utf8Bytes};
use dashmap::DashMap;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use types::ids::ConnectionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connecting,
    Open,
    Closing,
    Error,
    Closed,
}

impl ConnectionState {
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Connecting, Open)
                | (Connecting, Closing)
                | (Connecting, Error)
                | (Open, Closing)
                | (Open, Error)
                | (Closing, Closed)
                | (Closing, Error)
                | (Error, Closed)
        )
    }

    pub fn is_terminal(self) -> bool {
        self == ConnectionState::Closed
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("connection {0} is not registered")]
    UnknownConnection(ConnectionId),

    #[error("connection {id} cannot move from {from:?} to {to:?}")]
    InvalidTransition {
        id: ConnectionId,
        from: ConnectionState,
        to: ConnectionState,
    },

    #[error("connection {0} outbound queue is full")]
    QueueFull(ConnectionId),

    #[error("connection {0} outbound queue is closed")]
    QueueClosed(ConnectionId),
}

#[derive(Debug)]
struct ConnectionHandle {
    state: ConnectionState,
    sender: mpsc::Sender<Message>,
    connected_at_ms: i64,
}

/// Outcome of one broadcast.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    /// Registered but not yet (or no longer) open
    pub skipped: usize,
    /// Connections failed and removed during this broadcast
    pub failed: Vec<ConnectionId>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryStats {
    pub connections: usize,
    pub open: usize,
}

#[derive(Debug, Clone)]
pub struct ConnectionRegistry {
    connections: Arc<DashMap<ConnectionId, ConnectionHandle>>,
    buffer: usize,
}

impl ConnectionRegistry {
    pub fn new(buffer: usize) -> Self {
        Self {
            connections: Arc::new(DashMap::new()),
            buffer: buffer.max(1),
        }
    }

    /// Register a new connection in `Connecting` and hand back the receiving
    /// end of its outbound queue.
    pub fn register(&self) -> (ConnectionId, mpsc::Receiver<Message>) {
        let id = ConnectionId::new();
        let (sender, receiver) = mpsc::channel(self.buffer);
        self.connections.insert(
            id,
            ConnectionHandle {
                state: ConnectionState::Connecting,
                sender,
                connected_at_ms: now_ms(),
            },
        );
        debug!(connection_id = %id, "Connection registered");
        (id, receiver)
    }

    pub fn state(&self, id: ConnectionId) -> Option<ConnectionState> {
        self.connections.get(&id).map(|c| c.state)
    }

    /// Move `id` to `next`. Reaching `Closed` releases the slot.
    pub fn transition(
        &self,
        id: ConnectionId,
        next: ConnectionState,
    ) -> Result<ConnectionState, RegistryError> {
        {
            let mut handle = self
                .connections
                .get_mut(&id)
                .ok_or(RegistryError::UnknownConnection(id))?;
            if !handle.state.can_transition_to(next) {
                return Err(RegistryError::InvalidTransition {
                    id,
                    from: handle.state,
                    to: next,
                });
            }
            handle.state = next;
        }

        if next.is_terminal() {
            if let Some((_, handle)) = self.connections.remove(&id) {
                debug!(
                    connection_id = %id,
                    open_for_ms = now_ms() - handle.connected_at_ms,
                    "Connection released"
                );
            }
        }
        Ok(next)
    }

    pub fn open(&self, id: ConnectionId) -> Result<(), RegistryError> {
        self.open_with(id, || None)
    }

    /// Move `id` to `Open`, queuing the frame `first` yields ahead of any
    /// broadcast.
    ///
    /// `first` runs while the entry is locked. A broadcast that reached the
    /// entry earlier saw it `Connecting` and skipped it; a later one queues
    /// behind the first frame.
    pub fn open_with<F>(&self, id: ConnectionId, first: F) -> Result<(), RegistryError>
    where
        F: FnOnce() -> Option<Message>,
    {
        {
            let mut handle = self
                .connections
                .get_mut(&id)
                .ok_or(RegistryError::UnknownConnection(id))?;
            if !handle.state.can_transition_to(ConnectionState::Open) {
                return Err(RegistryError::InvalidTransition {
                    id,
                    from: handle.state,
                    to: ConnectionState::Open,
                });
            }
            if let Some(message) = first() {
                if handle.sender.try_send(message).is_err() {
                    debug!(connection_id = %id, "First frame dropped, queue unavailable");
                }
            }
            handle.state = ConnectionState::Open;
        }
        info!(connection_id = %id, "Connection open");
        Ok(())
    }

    /// Orderly close: `Closing` then `Closed`. Unknown ids are ignored.
    pub fn close(&self, id: ConnectionId) {
        if self.state(id).is_none() {
            return;
        }
        // Already closing or failed: just finish.
        let _ = self.transition(id, ConnectionState::Closing);
        self.release(id);
        info!(connection_id = %id, "Connection closed");
    }

    /// Abnormal end: `Error` then `Closed`. Unknown ids are ignored.
    pub fn fail(&self, id: ConnectionId, reason: &str) {
        if self.state(id).is_none() {
            return;
        }
        let _ = self.transition(id, ConnectionState::Error);
        self.release(id);
        warn!(connection_id = %id, reason, "Connection failed");
    }

    /// Reach `Closed` from whatever non-terminal state the entry is in.
    fn release(&self, id: ConnectionId) {
        if self.transition(id, ConnectionState::Closed).is_err() {
            self.connections.remove(&id);
        }
    }

    /// Queue `message` for one connection without waiting.
    pub fn send_to(&self, id: ConnectionId, message: Message) -> Result<(), RegistryError> {
        let sender = self
            .connections
            .get(&id)
            .map(|c| c.sender.clone())
            .ok_or(RegistryError::UnknownConnection(id))?;
        sender.try_send(message).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => RegistryError::QueueFull(id),
            mpsc::error::TrySendError::Closed(_) => RegistryError::QueueClosed(id),
        })
    }

    /// Queue `payload` once for every open connection.
    ///
    /// Connections whose queue is full or closed are collected during the
    /// pass and failed after it, so the map is never mutated while iterated.
    pub fn broadcast(&self, payload: Utf8Bytes) -> BroadcastReport {
        let mut report = BroadcastReport::default();

        for entry in self.connections.iter() {
            if entry.state != ConnectionState::Open {
                report.skipped += 1;
                continue;
            }
            match entry.sender.try_send(Message::Text(payload.clone())) {
                Ok(()) => report.delivered += 1,
                Err(_) => report.failed.push(*entry.key()),
            }
        }

        for id in &report.failed {
            self.fail(*id, "outbound queue full or closed");
        }
        report
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn stats(&self) -> RegistryStats {
        let open = self
            .connections
            .iter()
            .filter(|c| c.state == ConnectionState::Open)
            .count();
        RegistryStats {
            connections: self.connections.len(),
            open,
        }
    }
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_connection(registry: &ConnectionRegistry) -> (ConnectionId, mpsc::Receiver<Message>) {
        let (id, rx) = registry.register();
        registry.open(id).unwrap();
        (id, rx)
    }

    fn text(message: Message) -> String {
        match message {
            Message::Text(text) => text.as_str().to_string(),
            other => panic!("Expected text frame, got {:?}", other),
        }
    }

    #[test]
    fn test_state_machine_transitions() {
        use ConnectionState::*;
        assert!(Connecting.can_transition_to(Open));
        assert!(Open.can_transition_to(Closing));
        assert!(Open.can_transition_to(Error));
        assert!(Closing.can_transition_to(Closed));
        assert!(Error.can_transition_to(Closed));

        assert!(!Open.can_transition_to(Connecting));
        assert!(!Closed.can_transition_to(Open));
        assert!(!Error.can_transition_to(Open));
        assert!(!Open.can_transition_to(Closed));
    }

    #[test]
    fn test_register_starts_connecting() {
        let registry = ConnectionRegistry::new(4);
        let (id, _rx) = registry.register();
        assert_eq!(registry.state(id), Some(ConnectionState::Connecting));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.stats().open, 0);
    }

    #[test]
    fn test_invalid_transition_rejected() {
        let registry = ConnectionRegistry::new(4);
        let (id, _rx) = open_connection(&registry);

        let err = registry.transition(id, ConnectionState::Connecting).unwrap_err();
        assert_eq!(
            err,
            RegistryError::InvalidTransition {
                id,
                from: ConnectionState::Open,
                to: ConnectionState::Connecting,
            }
        );
        assert_eq!(registry.state(id), Some(ConnectionState::Open));
    }

    #[test]
    fn test_close_releases_slot() {
        let registry = ConnectionRegistry::new(4);
        let (id, _rx) = open_connection(&registry);

        registry.close(id);
        assert_eq!(registry.state(id), None);
        assert!(registry.is_empty());

        // Closing twice is harmless.
        registry.close(id);
    }

    #[test]
    fn test_fail_releases_slot() {
        let registry = ConnectionRegistry::new(4);
        let (id, _rx) = registry.register();

        registry.fail(id, "handshake error");
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_open_connection() {
        let registry = ConnectionRegistry::new(4);
        let mut receivers: Vec<_> = (0..5).map(|_| open_connection(&registry).1).collect();
        let (_pending, _pending_rx) = registry.register();

        let report = registry.broadcast(Utf8Bytes::from("{\"users\":[]}"));

        assert_eq!(report.delivered, 5);
        assert_eq!(report.skipped, 1);
        assert!(report.failed.is_empty());
        for rx in &mut receivers {
            assert_eq!(text(rx.recv().await.unwrap()), "{\"users\":[]}");
        }
    }

    #[test]
    fn test_broadcast_fails_full_queue_only() {
        let registry = ConnectionRegistry::new(1);
        let (slow, _slow_rx) = open_connection(&registry);
        let (fast, mut fast_rx) = open_connection(&registry);

        let first = registry.broadcast(Utf8Bytes::from("s1"));
        assert_eq!(first.delivered, 2);
        assert_eq!(text(fast_rx.try_recv().unwrap()), "s1");

        // slow never drained its single slot
        let second = registry.broadcast(Utf8Bytes::from("s2"));
        assert_eq!(second.delivered, 1);
        assert_eq!(second.failed, vec![slow]);
        assert_eq!(registry.state(slow), None);
        assert_eq!(registry.state(fast), Some(ConnectionState::Open));
        assert_eq!(text(fast_rx.try_recv().unwrap()), "s2");
    }

    #[test]
    fn test_broadcast_fails_dropped_receiver() {
        let registry = ConnectionRegistry::new(4);
        let (gone, gone_rx) = open_connection(&registry);
        drop(gone_rx);

        let report = registry.broadcast(Utf8Bytes::from("s1"));
        assert_eq!(report.failed, vec![gone]);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_closed_connection_not_targeted() {
        let registry = ConnectionRegistry::new(4);
        let (id, mut rx) = open_connection(&registry);

        assert_eq!(registry.broadcast(Utf8Bytes::from("s1")).delivered, 1);
        registry.close(id);

        let report = registry.broadcast(Utf8Bytes::from("s2"));
        assert_eq!(report, BroadcastReport::default());
        assert_eq!(text(rx.try_recv().unwrap()), "s1");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_first_frame_precedes_later_broadcasts() {
        let registry = ConnectionRegistry::new(4);
        let (id, mut rx) = registry.register();

        // Broadcasts before the connection opens are skipped.
        let report = registry.broadcast(Utf8Bytes::from("s1"));
        assert_eq!(report.skipped, 1);

        registry
            .open_with(id, || Some(Message::Text(Utf8Bytes::from("s1"))))
            .unwrap();
        registry.broadcast(Utf8Bytes::from("s2"));

        assert_eq!(text(rx.try_recv().unwrap()), "s1");
        assert_eq!(text(rx.try_recv().unwrap()), "s2");
        assert!(rx.try_recv().is_err());
        assert_eq!(registry.state(id), Some(ConnectionState::Open));
    }

    #[test]
    fn test_open_with_rejects_open_connection() {
        let registry = ConnectionRegistry::new(4);
        let (id, mut rx) = open_connection(&registry);

        let result = registry.open_with(id, || Some(Message::Text(Utf8Bytes::from("late"))));

        assert!(matches!(result, Err(RegistryError::InvalidTransition { .. })));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_send_to_unknown_connection() {
        let registry = ConnectionRegistry::new(4);
        let id = ConnectionId::new();
        assert_eq!(
            registry.send_to(id, Message::Text(Utf8Bytes::from("x"))),
            Err(RegistryError::UnknownConnection(id))
        );
    }
}
