// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Client Session Handler
//!
//! Owns one client connection from handshake to close: registers the
//! announced user, persists every application frame, and forwards it to the
//! receiver's session when the receiver is online.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::{sleep_until, timeout, Instant};
use tokio_util::codec::Framed;
use tracing::{debug, error, warn};

use crate::connection_registry::{
    ConnectionId, ConnectionRegistry, ForwardOutcome, Registration, RegistryMessage,
};
use crate::identity::IdentityVerifier;
use crate::metrics::RelayMetrics;
use crate::protocol::{self, ChatFrame, FrameCodec, FrameError, InboundFrame};
use crate::storage::{MessageStore, StoreError, UserId};

/// Shared dependencies for handling a client connection.
#[derive(Clone)]
pub struct SessionDeps {
    pub store: Arc<dyn MessageStore>,
    pub registry: Arc<ConnectionRegistry>,
    pub verifier: Arc<dyn IdentityVerifier>,
    pub metrics: RelayMetrics,
    pub max_frame_size: usize,
    /// Ends the session after this long without an inbound frame. None waits forever.
    pub idle_timeout: Option<Duration>,
    /// Limit on waiting for the handshake frame. None waits forever.
    pub handshake_timeout: Option<Duration>,
}

/// What happened to one inbound application frame.
#[derive(Debug)]
pub enum FrameOutcome {
    /// The frame did not parse and was skipped.
    Malformed(FrameError),
    /// The store rejected the message; nothing was forwarded.
    PersistFailed,
    /// The message was stored; the forward went as described.
    Persisted(ForwardOutcome),
}

/// Removes the session's registry entry exactly once, whichever way the
/// session ends.
struct RegistrationGuard<'a> {
    registry: &'a ConnectionRegistry,
    metrics: &'a RelayMetrics,
    user_id: UserId,
    connection_id: ConnectionId,
    session: &'a str,
}

impl Drop for RegistrationGuard<'_> {
    fn drop(&mut self) {
        if !self.registry.unregister(self.user_id, self.connection_id) {
            debug!(
                "[{}] Registry entry already taken over by a newer connection",
                self.session
            );
        }
        self.metrics.connections_active.dec();
    }
}

async fn idle_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Reads and validates the handshake frame. Returns None if the connection
/// should be closed without registering.
async fn read_handshake<S>(
    framed: &mut Framed<S, FrameCodec>,
    handshake_timeout: Option<Duration>,
    session: &str,
) -> Option<UserId>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let first = match handshake_timeout {
        Some(limit) => match timeout(limit, framed.next()).await {
            Ok(next) => next,
            Err(_) => {
                warn!("[{}] Handshake timeout", session);
                return None;
            }
        },
        None => framed.next().await,
    };

    match first {
        Some(Ok(InboundFrame::Data(raw))) => match protocol::parse_handshake(&raw) {
            Ok(user_id) => Some(user_id),
            Err(e) => {
                warn!("[{}] Invalid handshake: {}", session, e);
                None
            }
        },
        Some(Ok(InboundFrame::Oversized)) => {
            warn!("[{}] Invalid handshake: {}", session, FrameError::TooLong);
            None
        }
        Some(Err(e)) => {
            warn!("[{}] Error reading handshake: {}", session, e);
            None
        }
        None => {
            debug!("[{}] Connection closed before handshake", session);
            None
        }
    }
}

async fn persist(store: Arc<dyn MessageStore>, frame: ChatFrame) -> Result<i64, StoreError> {
    match tokio::task::spawn_blocking(move || store.append(frame.into_message())).await {
        Ok(result) => result,
        Err(e) => Err(StoreError::Io(std::io::Error::other(e))),
    }
}

/// Parses, persists and forwards one application frame.
///
/// Forwarding only happens after the store confirmed the append. The frame
/// is forwarded as the exact bytes received.
pub async fn relay_frame(
    raw: Bytes,
    deps: &SessionDeps,
    user_id: UserId,
    session: &str,
) -> FrameOutcome {
    let metrics = &deps.metrics;
    metrics.frames_received.inc();

    let frame = match ChatFrame::parse(&raw) {
        Ok(frame) => frame,
        Err(e) => {
            debug!("[{}] Skipping malformed frame: {}", session, e);
            metrics.frames_malformed.inc();
            return FrameOutcome::Malformed(e);
        }
    };

    if frame.sender_id != user_id {
        debug!("[{}] Sender field differs from handshake identity", session);
    }

    let receiver_id = frame.receiver_id;
    let timer = metrics.append_duration.start_timer();
    let appended = persist(deps.store.clone(), frame).await;
    timer.observe_duration();

    match appended {
        Ok(message_id) => {
            metrics.messages_persisted.inc();
            debug!("[{}] Stored message {}", session, message_id);
        }
        Err(e) => {
            error!("[{}] Failed to store message: {}", session, e);
            metrics.persist_failures.inc();
            return FrameOutcome::PersistFailed;
        }
    }

    let outcome = deps
        .registry
        .try_forward(receiver_id, RegistryMessage { data: raw });
    match outcome {
        ForwardOutcome::Queued => metrics.frames_forwarded.inc(),
        ForwardOutcome::Offline => metrics.frames_offline.inc(),
    }
    FrameOutcome::Persisted(outcome)
}

/// Handles a client connection until the peer disconnects or an I/O error
/// occurs.
pub async fn handle_connection<S>(stream: S, deps: SessionDeps)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // Logs carry a random session label, never the user id
    let session = &uuid::Uuid::new_v4().to_string()[..8];

    let mut framed = Framed::new(stream, FrameCodec::with_max_length(deps.max_frame_size));

    let Some(user_id) = read_handshake(&mut framed, deps.handshake_timeout, session).await else {
        deps.metrics.handshake_failures.inc();
        return;
    };

    if !deps.verifier.verify(user_id) {
        warn!("[{}] Identity rejected", session);
        deps.metrics.handshake_failures.inc();
        return;
    }

    let Registration {
        connection_id,
        receiver: mut registry_rx,
    } = deps.registry.register(user_id);
    deps.metrics.connections_active.inc();
    let _registration = RegistrationGuard {
        registry: &deps.registry,
        metrics: &deps.metrics,
        user_id,
        connection_id,
        session,
    };

    debug!(
        "[{}] Client registered (connection {})",
        session,
        connection_id.as_u64()
    );

    let mut deadline = deps.idle_timeout.map(|d| Instant::now() + d);
    let mut forwards_open = true;

    loop {
        tokio::select! {
            inbound = framed.next() => {
                match inbound {
                    Some(Ok(InboundFrame::Data(raw))) => {
                        deadline = deps.idle_timeout.map(|d| Instant::now() + d);
                        relay_frame(raw, &deps, user_id, session).await;
                    }
                    Some(Ok(InboundFrame::Oversized)) => {
                        deadline = deps.idle_timeout.map(|d| Instant::now() + d);
                        debug!(
                            "[{}] Skipping malformed frame: {}",
                            session,
                            FrameError::TooLong
                        );
                        deps.metrics.frames_malformed.inc();
                    }
                    Some(Err(e)) => {
                        warn!("[{}] Read error: {}", session, e);
                        break;
                    }
                    None => {
                        debug!("[{}] Disconnected", session);
                        break;
                    }
                }
            }
            forwarded = registry_rx.recv(), if forwards_open => {
                match forwarded {
                    Some(msg) => {
                        if let Err(e) = framed.send(msg.data).await {
                            warn!("[{}] Write error: {}", session, e);
                            break;
                        }
                    }
                    None => {
                        // A newer connection registered the same user
                        debug!("[{}] Superseded, no longer receiving forwards", session);
                        forwards_open = false;
                    }
                }
            }
            _ = idle_deadline(deadline) => {
                warn!("[{}] Idle timeout", session);
                break;
            }
        }
    }
}
