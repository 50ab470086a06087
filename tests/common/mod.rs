// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Common test utilities for relay integration tests.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

use parlor_relay::connection_limit::ConnectionLimiter;
use parlor_relay::connection_registry::ConnectionRegistry;
use parlor_relay::handler::SessionDeps;
use parlor_relay::identity::AcceptAnyIdentity;
use parlor_relay::metrics::RelayMetrics;
use parlor_relay::protocol::{FrameCodec, InboundFrame};
use parlor_relay::server::RelayServer;
use parlor_relay::storage::{MemoryMessageStore, MessageStore};

pub type TestClient = Framed<TcpStream, FrameCodec>;

/// A relay running on an ephemeral port.
#[allow(dead_code)]
pub struct TestRelay {
    pub addr: SocketAddr,
    pub store: Arc<dyn MessageStore>,
    pub registry: Arc<ConnectionRegistry>,
    pub metrics: RelayMetrics,
}

/// Starts a relay backed by an in-memory store.
#[allow(dead_code)]
pub async fn start_relay() -> TestRelay {
    start_relay_with(
        Arc::new(MemoryMessageStore::new()),
        ConnectionLimiter::unlimited(),
    )
    .await
}

/// Starts a relay with the given store and connection limiter.
#[allow(dead_code)]
pub async fn start_relay_with(
    store: Arc<dyn MessageStore>,
    limiter: ConnectionLimiter,
) -> TestRelay {
    let registry = Arc::new(ConnectionRegistry::new());
    let metrics = RelayMetrics::new();
    let deps = SessionDeps {
        store: store.clone(),
        registry: registry.clone(),
        verifier: Arc::new(AcceptAnyIdentity),
        metrics: metrics.clone(),
        max_frame_size: 1024,
        idle_timeout: None,
        handshake_timeout: None,
    };

    let server = RelayServer::bind("127.0.0.1:0".parse().unwrap(), deps, limiter)
        .await
        .expect("bind relay");
    let addr = server.local_addr().unwrap();
    tokio::spawn(server.run());

    TestRelay {
        addr,
        store,
        registry,
        metrics,
    }
}

/// Connects a raw client without sending a handshake.
#[allow(dead_code)]
pub async fn connect(addr: SocketAddr) -> TestClient {
    let stream = TcpStream::connect(addr).await.expect("connect to relay");
    Framed::new(stream, FrameCodec::new())
}

/// Connects and identifies as `user_id`, waiting until the relay has
/// registered the session.
#[allow(dead_code)]
pub async fn connect_as(relay: &TestRelay, user_id: i64) -> TestClient {
    let before = relay.metrics.connections_active.get();
    let mut client = connect(relay.addr).await;
    send_line(&mut client, &user_id.to_string()).await;
    wait_until(|| {
        relay.registry.is_online(user_id) && relay.metrics.connections_active.get() > before
    })
    .await;
    client
}

#[allow(dead_code)]
pub async fn send_line(client: &mut TestClient, line: &str) {
    client
        .send(Bytes::copy_from_slice(line.as_bytes()))
        .await
        .expect("send frame");
}

/// Receives one frame, failing the test after two seconds.
#[allow(dead_code)]
pub async fn recv_line(client: &mut TestClient) -> String {
    match tokio::time::timeout(Duration::from_secs(2), client.next()).await {
        Ok(Some(Ok(InboundFrame::Data(data)))) => String::from_utf8(data.to_vec()).unwrap(),
        other => panic!("Expected a frame, got {:?}", other),
    }
}

/// Asserts that nothing arrives within a short window.
#[allow(dead_code)]
pub async fn assert_silent(client: &mut TestClient) {
    if let Ok(frame) = tokio::time::timeout(Duration::from_millis(100), client.next()).await {
        panic!("Expected no frame, got {:?}", frame);
    }
}

/// Polls `check` until it holds or two seconds have passed.
#[allow(dead_code)]
pub async fn wait_until(mut check: impl FnMut() -> bool) {
    for _ in 0..400 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached");
}
