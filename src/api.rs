use axum::extract::State;
use axum::http::header;
use axum::http::HeaderMap;
use axum::http::HeaderValue;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub type ServerStateRef = Arc<ServerState>;

/// State behind the probe endpoints. Readiness is flipped once the kube
/// client is up and leader election, when enabled, has been won; until then
/// the controller must not receive traffic decisions based on /readyz.
pub struct ServerState {
    ready: AtomicBool,
}

pub fn new_state() -> ServerStateRef {
    Arc::new(ServerState {
        ready: AtomicBool::new(false),
    })
}

impl ServerState {
    pub fn mark_ready(&self) {
        self.ready.store(true, Ordering::Relaxed);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }
}

async fn health() -> &'static str {
    "OK"
}

async fn ready(State(state): State<ServerStateRef>) -> Response {
    if state.is_ready() {
        (StatusCode::OK, "OK").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "controller not ready").into_response()
    }
}

async fn metrics() -> Response {
    if let Ok(body) = crate::metrics::metrics().await {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/openmetrics-text; version=1.0.0; charset=utf-8"),
        );
        (headers, body).into_response()
    } else {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "failed to generate metrics",
        )
            .into_response()
    }
}

pub async fn server(port: u16, state: ServerStateRef) {
    let app = Router::new()
        .route("/health", get(health))
        .route("/readyz", get(ready))
        .route("/metrics", get(metrics))
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("Listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Could not bind to metrics port");
    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!("Encountered error serving api: {e}");
    }
}
