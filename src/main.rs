// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Parlor Relay Server
//!
//! Local relay for the Parlor desktop messenger.
//! Provides:
//! - Line-framed TCP endpoint that routes chat frames between online clients
//! - Durable message log shared with the desktop client
//! - HTTP endpoints for health checks, Prometheus metrics and history replay

use std::sync::Arc;
use std::time::Instant;

use tokio::net::TcpListener;
use tracing::{error, info, warn};

use parlor_relay::config::RelayConfig;
use parlor_relay::connection_limit::ConnectionLimiter;
use parlor_relay::connection_registry::ConnectionRegistry;
use parlor_relay::handler::SessionDeps;
use parlor_relay::http::{create_router, HttpState};
use parlor_relay::identity::AcceptAnyIdentity;
use parlor_relay::metrics::RelayMetrics;
use parlor_relay::server::RelayServer;
use parlor_relay::storage::{create_message_store, MessageStore};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("parlor_relay=info".parse().expect("static directive")),
        )
        .init();

    let config = RelayConfig::from_env();
    let start_time = Instant::now();

    info!("Starting Parlor Relay v{}", env!("CARGO_PKG_VERSION"));
    info!("Relay: {}", config.listen_addr);
    info!("Admin endpoint: {}", config.admin_addr);
    info!("Storage backend: {:?}", config.storage_backend);
    match config.idle_timeout() {
        Some(idle) => info!("Idle timeout: {}s", idle.as_secs()),
        None => info!("Idle timeout: disabled"),
    }
    match config.connection_cap() {
        Some(cap) => info!("Connection cap: {}", cap),
        None => info!("Connection cap: unlimited"),
    }

    let store: Arc<dyn MessageStore> =
        match create_message_store(config.storage_backend, Some(&config.data_dir)) {
            Ok(store) => Arc::from(store),
            Err(e) => {
                error!("Failed to open message store: {}", e);
                std::process::exit(1);
            }
        };

    let metrics = RelayMetrics::new();
    let counting_store = store.clone();
    match tokio::task::spawn_blocking(move || counting_store.message_count()).await {
        Ok(count) => metrics.messages_stored.set(count as i64),
        Err(e) => warn!("Failed to count stored messages: {}", e),
    }
    let registry = Arc::new(ConnectionRegistry::new());

    if config.admin_token.is_some() {
        info!("Admin endpoints protected with bearer token");
    } else if !config.admin_addr.ip().is_loopback() {
        warn!("Admin endpoints exposed on non-localhost without a token");
        warn!("Consider setting RELAY_ADMIN_TOKEN");
    }

    let http_state = HttpState {
        metrics: metrics.clone(),
        admin_token: config.admin_token.clone(),
        store: store.clone(),
        registry: registry.clone(),
        start_time,
    };
    let http_router = create_router(http_state);

    let http_listener = match TcpListener::bind(config.admin_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind admin listener on {}: {}", config.admin_addr, e);
            std::process::exit(1);
        }
    };

    let admin_addr = config.admin_addr;
    tokio::spawn(async move {
        info!("HTTP server listening on {}", admin_addr);
        if let Err(e) = axum::serve(http_listener, http_router).await {
            error!("HTTP server stopped: {}", e);
        }
    });

    let deps = SessionDeps {
        store,
        registry,
        verifier: Arc::new(AcceptAnyIdentity),
        metrics,
        max_frame_size: config.max_frame_size,
        idle_timeout: config.idle_timeout(),
        handshake_timeout: config.handshake_timeout(),
    };
    let limiter = ConnectionLimiter::new(config.connection_cap());

    let server = match RelayServer::bind(config.listen_addr, deps, limiter).await {
        Ok(server) => server,
        Err(e) => {
            error!("Failed to bind relay listener on {}: {}", config.listen_addr, e);
            std::process::exit(1);
        }
    };

    server.run().await;
}
