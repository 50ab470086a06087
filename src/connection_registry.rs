// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Connection Registry
//!
//! Tracks which user is reachable on which live connection so that a
//! session can forward a frame to the receiver's session.
//!
//! The registry maps user ids to unbounded message channels. The receiving
//! session drains its channel and writes to its own socket, so no socket
//! I/O ever happens while the registry lock is held and a sender never
//! waits on a slow receiver.
//!
//! Each registration carries a process-unique [`ConnectionId`]. Removal is a
//! compare-and-remove on that id: when a user reconnects and replaces their
//! entry, the superseded session's cleanup cannot remove the newer entry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::storage::UserId;

/// Process-unique identifier of one accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

/// A raw frame queued for delivery to a connected client.
#[derive(Debug, Clone)]
pub struct RegistryMessage {
    /// Frame bytes exactly as received from the sender, without terminator.
    pub data: Bytes,
}

/// Clonable handle to a registered connection's outbound channel.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub connection_id: ConnectionId,
    tx: mpsc::UnboundedSender<RegistryMessage>,
}

impl ConnectionHandle {
    /// Queues a frame without waiting.
    pub fn try_forward(&self, msg: RegistryMessage) -> ForwardOutcome {
        match self.tx.send(msg) {
            Ok(()) => ForwardOutcome::Queued,
            Err(_) => ForwardOutcome::Offline,
        }
    }
}

/// Result of attempting to forward a frame to a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardOutcome {
    /// The frame was queued on the receiver's connection.
    Queued,
    /// The receiver has no live connection.
    Offline,
}

/// What a session gets back from [`ConnectionRegistry::register`].
pub struct Registration {
    pub connection_id: ConnectionId,
    pub receiver: mpsc::UnboundedReceiver<RegistryMessage>,
}

/// Thread-safe registry of connected users.
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<UserId, ConnectionHandle>>,
    next_id: AtomicU64,
}

impl ConnectionRegistry {
    /// Creates a new empty registry.
    pub fn new() -> Self {
        ConnectionRegistry {
            connections: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Registers a connected user. Returns the receiving end of the channel.
    ///
    /// If the user was already registered (reconnection), the old entry is
    /// replaced and the old receiver will see the channel close.
    pub fn register(&self, user_id: UserId) -> Registration {
        let (tx, rx) = mpsc::unbounded_channel();
        let connection_id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let handle = ConnectionHandle { connection_id, tx };

        let mut connections = self.connections.write().unwrap();
        connections.insert(user_id, handle);

        Registration {
            connection_id,
            receiver: rx,
        }
    }

    /// Unregisters a user, but only if the entry still belongs to
    /// `connection_id`. Returns whether an entry was removed.
    pub fn unregister(&self, user_id: UserId, connection_id: ConnectionId) -> bool {
        let mut connections = self.connections.write().unwrap();
        match connections.get(&user_id) {
            Some(handle) if handle.connection_id == connection_id => {
                connections.remove(&user_id);
                true
            }
            _ => false,
        }
    }

    /// Returns the user's live connection handle, if any.
    pub fn lookup(&self, user_id: UserId) -> Option<ConnectionHandle> {
        let connections = self.connections.read().unwrap();
        connections.get(&user_id).cloned()
    }

    /// Forwards a frame to a user if they are online.
    pub fn try_forward(&self, user_id: UserId, msg: RegistryMessage) -> ForwardOutcome {
        match self.lookup(user_id) {
            Some(handle) => handle.try_forward(msg),
            None => ForwardOutcome::Offline,
        }
    }

    /// Returns whether a user currently has a registered connection.
    pub fn is_online(&self, user_id: UserId) -> bool {
        let connections = self.connections.read().unwrap();
        connections.contains_key(&user_id)
    }

    /// Returns the number of currently connected users.
    pub fn connected_count(&self) -> usize {
        let connections = self.connections.read().unwrap();
        connections.len()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
