//! HTTP Server for Health, Metrics and History Endpoints
//!
//! Runs on a separate admin listener so the relay port only speaks the
//! line protocol.

use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{Path, State},
    http::{header, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use tracing::error;

use crate::connection_registry::ConnectionRegistry;
use crate::metrics::RelayMetrics;
use crate::storage::{MessageStore, UserId};

/// Shared state for HTTP handlers.
#[derive(Clone)]
pub struct HttpState {
    pub metrics: RelayMetrics,
    pub admin_token: Option<String>,
    pub store: Arc<dyn MessageStore>,
    pub registry: Arc<ConnectionRegistry>,
    pub start_time: Instant,
}

fn is_protected(path: &str) -> bool {
    path == "/metrics" || path.starts_with("/conversations/")
}

/// Middleware to check the bearer token on protected endpoints.
async fn admin_auth_middleware(
    State(state): State<HttpState>,
    request: Request<axum::body::Body>,
    next: Next,
) -> Response {
    if is_protected(request.uri().path()) {
        if let Some(ref expected_token) = state.admin_token {
            let auth_header = request.headers().get(header::AUTHORIZATION);
            let is_authorized = auth_header.is_some_and(|h| {
                h.to_str()
                    .map(|s| {
                        s.strip_prefix("Bearer ")
                            .is_some_and(|token| token == expected_token)
                    })
                    .unwrap_or(false)
            });

            if !is_authorized {
                return (
                    StatusCode::UNAUTHORIZED,
                    [(header::WWW_AUTHENTICATE, "Bearer")],
                    "Unauthorized",
                )
                    .into_response();
            }
        }
    }

    next.run(request).await
}

/// Creates the HTTP router.
pub fn create_router(state: HttpState) -> Router {
    Router::new()
        .route("/", get(root_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/conversations/{a}/{b}", get(conversation_handler))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            admin_auth_middleware,
        ))
        .with_state(state)
}

/// Root handler - returns basic info.
async fn root_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "service": "parlor-relay-admin",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": ["/health", "/metrics", "/conversations/{a}/{b}"]
    }))
}

/// Counts stored messages on the blocking pool; the SQLite count holds the
/// store lock and scans the table.
async fn stored_message_count(store: &Arc<dyn MessageStore>) -> Option<usize> {
    let store = store.clone();
    match tokio::task::spawn_blocking(move || store.message_count()).await {
        Ok(count) => Some(count),
        Err(e) => {
            error!("Message count task failed: {}", e);
            None
        }
    }
}

async fn health_handler(State(state): State<HttpState>) -> impl IntoResponse {
    let message_count = stored_message_count(&state.store).await;
    Json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_seconds": state.start_time.elapsed().as_secs(),
        "connected_users": state.registry.connected_count(),
        "message_count": message_count,
    }))
}

async fn metrics_handler(State(state): State<HttpState>) -> impl IntoResponse {
    if let Some(count) = stored_message_count(&state.store).await {
        state.metrics.messages_stored.set(count as i64);
    }
    let metrics_text = state.metrics.encode();

    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        metrics_text,
    )
}

/// Replays the conversation between two users, oldest first.
async fn conversation_handler(
    State(state): State<HttpState>,
    Path((a, b)): Path<(UserId, UserId)>,
) -> Response {
    let store = state.store.clone();
    let result = tokio::task::spawn_blocking(move || store.query_conversation(a, b)).await;

    match result {
        Ok(Ok(messages)) => Json(messages).into_response(),
        Ok(Err(e)) => {
            error!("Conversation query failed: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
        Err(e) => {
            error!("Conversation query task failed: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryMessageStore, MessageKind, NewMessage, StoreError, StoredMessage};
    use axum::body::Body;
    use std::time::Duration;
    use tower::ServiceExt;

    /// Store whose count takes as long as a large table scan.
    struct SlowCountStore;

    impl MessageStore for SlowCountStore {
        fn append(&self, _message: NewMessage) -> Result<i64, StoreError> {
            Ok(1)
        }

        fn query_conversation(
            &self,
            _a: UserId,
            _b: UserId,
        ) -> Result<Vec<StoredMessage>, StoreError> {
            Ok(Vec::new())
        }

        fn message_count(&self) -> usize {
            std::thread::sleep(Duration::from_millis(300));
            42
        }
    }

    fn create_test_state(token: Option<&str>) -> (HttpState, Arc<MemoryMessageStore>) {
        let store = Arc::new(MemoryMessageStore::new());
        let state = HttpState {
            metrics: RelayMetrics::new(),
            admin_token: token.map(str::to_string),
            store: store.clone(),
            registry: Arc::new(ConnectionRegistry::new()),
            start_time: Instant::now(),
        };
        (state, store)
    }

    async fn get_request(app: Router, uri: &str, token: Option<&str>) -> Response {
        let mut builder = Request::builder().uri(uri);
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        app.oneshot(builder.body(Body::empty()).unwrap())
            .await
            .unwrap()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let (state, _) = create_test_state(None);
        let response = get_request(create_router(state), "/metrics", None).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let (state, store) = create_test_state(None);
        store
            .append(NewMessage {
                sender_id: 1,
                receiver_id: 2,
                kind: MessageKind::Text,
                content: "hi".to_string(),
            })
            .unwrap();

        let response = get_request(create_router(state), "/health", None).await;
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["message_count"], 1);
        assert_eq!(body["connected_users"], 0);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_message_count_does_not_stall_runtime() {
        let (mut state, _) = create_test_state(None);
        state.store = Arc::new(SlowCountStore);
        let app = create_router(state.clone());

        let ticker = tokio::spawn(async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Instant::now()
        });

        let response = get_request(app.clone(), "/health", None).await;
        let finished = Instant::now();
        assert_eq!(body_json(response).await["message_count"], 42);
        assert!(ticker.await.unwrap() < finished);

        let response = get_request(app, "/metrics", None).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(state.metrics.messages_stored.get(), 42);
    }

    #[tokio::test]
    async fn test_conversation_endpoint() {
        let (state, store) = create_test_state(None);
        for (s, r, kind, content) in [(1, 2, "text", "hello"), (2, 1, "sticker", "s1.png")] {
            store
                .append(NewMessage {
                    sender_id: s,
                    receiver_id: r,
                    kind: MessageKind::from_tag(kind),
                    content: content.to_string(),
                })
                .unwrap();
        }

        let response = get_request(create_router(state), "/conversations/2/1", None).await;
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        let messages = body.as_array().unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0]["content"], "hello");
        assert_eq!(messages[0]["kind"], "text");
        assert_eq!(messages[1]["kind"], "sticker");
    }

    #[tokio::test]
    async fn test_protected_endpoints_require_token() {
        let (state, _) = create_test_state(Some("secret"));
        let app = create_router(state);

        let response = get_request(app.clone(), "/metrics", None).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = get_request(app.clone(), "/conversations/1/2", Some("wrong")).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = get_request(app.clone(), "/metrics", Some("secret")).await;
        assert_eq!(response.status(), StatusCode::OK);

        // Health stays open for liveness probes
        let response = get_request(app, "/health", None).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_conversation_rejects_non_integer_ids() {
        let (state, _) = create_test_state(None);
        let response = get_request(create_router(state), "/conversations/abc/2", None).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
