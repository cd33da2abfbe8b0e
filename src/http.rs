use crate::control::Dispatcher;
use crate::metrics::Metrics;
use crate::sampler::SnapshotFeed;
use crate::stream;
use axum::body::Body;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, Query, State};
use axum::http::{header::CONTENT_TYPE, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{routing::get, Json, Router};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, warn};

/// Shared-secret check for the stream upgrade. No expected token means the
/// endpoint is open.
#[derive(Debug, Clone, Default)]
pub struct TokenGate {
    expected: Option<String>,
}

impl TokenGate {
    pub fn new(expected: Option<String>) -> Self {
        Self {
            expected: expected.filter(|t| !t.is_empty()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.expected.is_some()
    }

    pub fn allows(&self, provided: Option<&str>) -> bool {
        match (&self.expected, provided) {
            (None, _) => true,
            (Some(expected), Some(provided)) => constant_time_eq(expected, provided),
            (Some(_), None) => false,
        }
    }
}

/// Compares every byte regardless of where the first mismatch is.
fn constant_time_eq(a: &str, b: &str) -> bool {
    let (a, b) = (a.as_bytes(), b.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |diff, (x, y)| diff | (x ^ y)) == 0
}

#[derive(Clone)]
pub struct HttpAppState {
    pub metrics: Arc<Metrics>,
    pub feed: SnapshotFeed,
    pub dispatcher: Dispatcher,
    pub gate: TokenGate,
}

#[derive(Debug, Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

pub fn build_router(state: HttpAppState) -> Router {
    Router::new()
        .route("/ws", get(stream_handler))
        .route("/api/snapshot", get(snapshot_handler))
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn stream_handler(
    State(state): State<HttpAppState>,
    Query(query): Query<TokenQuery>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    upgrade: Option<WebSocketUpgrade>,
) -> Response {
    let peer = connect_info
        .map(|ConnectInfo(addr)| addr)
        .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 0)));

    if !state.gate.allows(query.token.as_deref()) {
        debug!(peer = %peer, "stream upgrade rejected: bad token");
        return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
    }
    let Some(upgrade) = upgrade else {
        return (StatusCode::UPGRADE_REQUIRED, "websocket upgrade required").into_response();
    };

    let HttpAppState {
        metrics,
        feed,
        dispatcher,
        ..
    } = state;
    upgrade
        .on_failed_upgrade(move |err| warn!(peer = %peer, error = %err, "websocket upgrade failed"))
        .on_upgrade(move |socket| stream::serve_socket(socket, peer, feed, dispatcher, metrics))
}

async fn snapshot_handler(
    State(state): State<HttpAppState>,
    Query(query): Query<TokenQuery>,
) -> Response {
    if !state.gate.allows(query.token.as_deref()) {
        return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
    }
    let snapshot = state.feed.borrow().as_deref().cloned().unwrap_or_default();
    Json(snapshot).into_response()
}

async fn metrics_handler(State(state): State<HttpAppState>) -> Response {
    state.metrics.inc_scrape_count();
    match state.metrics.encode_metrics() {
        Ok(encoded) => {
            let mut response = Response::new(Body::from(encoded));
            response.headers_mut().insert(
                CONTENT_TYPE,
                HeaderValue::from_static("text/plain; version=0.0.4"),
            );
            response
        }
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to encode metrics: {err}"),
        )
            .into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::SysinfoProcessControl;
    use crate::docker::DockerClient;
    use crate::schema::Snapshot;
    use axum::body::to_bytes;
    use axum::http::Request;
    use tokio::sync::watch;
    use tower::ServiceExt;

    fn app_with(
        token: Option<&str>,
    ) -> (Router, watch::Sender<Option<Arc<Snapshot>>>, Arc<Metrics>) {
        let metrics = Metrics::new().expect("metrics registry");
        let (tx, feed) = watch::channel(None);
        let dispatcher = Dispatcher::new(
            Arc::new(DockerClient::new("/nonexistent/docker.sock")),
            Arc::new(SysinfoProcessControl::new()),
        );
        let app = build_router(HttpAppState {
            metrics: metrics.clone(),
            feed,
            dispatcher,
            gate: TokenGate::new(token.map(str::to_string)),
        });
        (app, tx, metrics)
    }

    async fn get_request(app: Router, uri: &str) -> (StatusCode, String) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn healthz_returns_ok() {
        let (app, _tx, _) = app_with(None);
        let (status, body) = get_request(app, "/healthz").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "ok");
    }

    #[tokio::test]
    async fn metrics_counts_scrapes() {
        let (app, _tx, _) = app_with(None);
        let (status, body) = get_request(app, "/metrics").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("agent_uptime_seconds"));
        assert!(body.contains("agent_scrape_count_total 1"));
    }

    #[tokio::test]
    async fn snapshot_endpoint_serves_latest_or_default() {
        let (app, tx, _) = app_with(None);
        let (status, body) = get_request(app.clone(), "/api/snapshot").await;
        assert_eq!(status, StatusCode::OK);
        let value: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert!(value["top_processes"].as_array().unwrap().is_empty());

        let mut snapshot = Snapshot::default();
        snapshot.metadata.hostname = "gw-2".to_string();
        tx.send_replace(Some(Arc::new(snapshot)));
        let (_, body) = get_request(app, "/api/snapshot").await;
        let value: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(value["metadata"]["hostname"], "gw-2");
    }

    #[tokio::test]
    async fn stream_rejects_wrong_token_before_upgrade() {
        let (app, _tx, _) = app_with(Some("s3cret"));
        let (status, _) = get_request(app.clone(), "/ws").await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        let (status, _) = get_request(app, "/ws?token=guess").await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn snapshot_requires_token_when_gated() {
        let (app, tx, _) = app_with(Some("s3cret"));
        let mut snapshot = Snapshot::default();
        snapshot.metadata.hostname = "secret-host".to_string();
        tx.send_replace(Some(Arc::new(snapshot)));

        let (status, body) = get_request(app.clone(), "/api/snapshot").await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(!body.contains("secret-host"));
        let (status, _) = get_request(app.clone(), "/api/snapshot?token=guess").await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, body) = get_request(app, "/api/snapshot?token=s3cret").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("secret-host"));
    }

    #[tokio::test]
    async fn stream_without_upgrade_headers_is_426() {
        let (app, _tx, _) = app_with(Some("s3cret"));
        let (status, _) = get_request(app, "/ws?token=s3cret").await;
        assert_eq!(status, StatusCode::UPGRADE_REQUIRED);

        let (open, _tx, _) = app_with(None);
        let (status, _) = get_request(open, "/ws").await;
        assert_eq!(status, StatusCode::UPGRADE_REQUIRED);
    }

    #[test]
    fn token_gate_rules() {
        assert!(TokenGate::new(None).allows(None));
        assert!(!TokenGate::new(Some(String::new())).is_enabled());
        let gate = TokenGate::new(Some("abc".to_string()));
        assert!(gate.allows(Some("abc")));
        assert!(!gate.allows(Some("abcd")));
        assert!(!gate.allows(None));
        assert!(!gate.allows(Some("abd")));
        assert!(!gate.allows(Some("")));
    }

    #[test]
    fn constant_time_eq_matches_plain_equality() {
        assert!(constant_time_eq("s3cret", "s3cret"));
        assert!(!constant_time_eq("s3cret", "s3creT"));
        assert!(!constant_time_eq("s3cret", "s3cre"));
        assert!(constant_time_eq("", ""));
    }
}
