// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Relay Server
//!
//! Binds the client listener and spawns one session task per accepted
//! connection. Sessions are unbounded unless a connection cap is configured.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::connection_limit::ConnectionLimiter;
use crate::handler::{self, SessionDeps};

/// Pause after a failed accept (e.g. file descriptor exhaustion).
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// A bound relay, ready to accept clients.
pub struct RelayServer {
    listener: TcpListener,
    deps: SessionDeps,
    limiter: ConnectionLimiter,
}

impl RelayServer {
    /// Binds the listener. Fails if the address is unavailable.
    pub async fn bind(
        addr: SocketAddr,
        deps: SessionDeps,
        limiter: ConnectionLimiter,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(RelayServer {
            listener,
            deps,
            limiter,
        })
    }

    /// Returns the bound address.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts connections forever.
    ///
    /// Accept errors are logged and do not stop the loop.
    pub async fn run(self) {
        let RelayServer {
            listener,
            deps,
            limiter,
        } = self;

        if let Ok(addr) = listener.local_addr() {
            info!("Relay listening on {}", addr);
        }

        loop {
            let (stream, addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Accept failed: {}", e);
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    continue;
                }
            };

            let Some(slot) = limiter.try_acquire() else {
                warn!(
                    "Connection rejected: at max capacity ({}/{})",
                    limiter.active_count(),
                    limiter.cap().unwrap_or_default()
                );
                deps.metrics.connections_rejected.inc();
                drop(stream);
                continue;
            };

            if let Err(e) = stream.set_nodelay(true) {
                debug!("Failed to set TCP_NODELAY for {}: {}", addr, e);
            }

            deps.metrics.connections_total.inc();
            let deps = deps.clone();

            tokio::spawn(async move {
                // Keep the slot alive for the duration of the connection
                let _slot = slot;
                debug!("New connection");
                handler::handle_connection(stream, deps).await;
                debug!("Connection closed");
            });
        }
    }
}
