//! HTTP API serving cached snapshots and window analyses

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use prometheus::{Encoder, TextEncoder};
use serde::Deserialize;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use watcher_lib::{
    models::{Data, WatcherMetrics, WindowDuration},
    MetricsProvider, Watcher, WatcherError,
};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub watcher: Watcher,
    pub provider: Arc<dyn MetricsProvider>,
}

impl AppState {
    pub fn new(watcher: Watcher, provider: Arc<dyn MetricsProvider>) -> Self {
        Self { watcher, provider }
    }
}

#[derive(Debug, Deserialize)]
struct MetricsQuery {
    host: Option<String>,
    duration: Option<String>,
}

/// Most recent snapshot, optionally filtered to a single host
async fn watcher_metrics(
    State(state): State<Arc<AppState>>,
    Query(query): Query<MetricsQuery>,
) -> Response {
    match state.watcher.latest().await {
        Ok(metrics) => filtered_response(metrics, query.host.as_deref()),
        Err(err) => error_response(err),
    }
}

/// Per-host mean/variance across the requested window
async fn variation_metrics(
    State(state): State<Arc<AppState>>,
    Query(query): Query<MetricsQuery>,
) -> Response {
    let duration = match query.duration.as_deref() {
        None => WindowDuration::FifteenMinutes,
        Some(raw) => raw.parse().unwrap_or_else(|_| {
            warn!(duration = raw, "unexpected window duration, defaulting to 15m");
            WindowDuration::FifteenMinutes
        }),
    };

    match state.watcher.analysis(duration).await {
        Ok(metrics) => filtered_response(metrics, query.host.as_deref()),
        Err(err) => error_response(err),
    }
}

/// Truncate the snapshot to one host when a filter is present; unknown
/// hosts are 404.
fn filtered_response(metrics: WatcherMetrics, host: Option<&str>) -> Response {
    let Some(host) = host else {
        return (StatusCode::OK, Json(metrics)).into_response();
    };

    match metrics.data.node_metrics_map.get(host) {
        Some(node) => {
            let mut data = Data::default();
            data.node_metrics_map.insert(host.to_string(), node.clone());
            let filtered = WatcherMetrics {
                timestamp: metrics.timestamp,
                window: metrics.window,
                source: metrics.source.clone(),
                data,
            };
            (StatusCode::OK, Json(filtered)).into_response()
        }
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

fn error_response(err: WatcherError) -> Response {
    match err {
        WatcherError::NotStarted => {
            error!(error = %err, "watcher read failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
        WatcherError::NoMetricsYet => StatusCode::NOT_FOUND.into_response(),
    }
}

/// Backend liveness probe - 200 if the provider answers, 503 otherwise
async fn healthz(State(state): State<Arc<AppState>>) -> Response {
    match state.provider.health().await {
        Ok(()) => (StatusCode::OK, Json(serde_json::json!({"status": "ok"}))).into_response(),
        Err(err) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({"status": "unavailable", "error": err.to_string()})),
        )
            .into_response(),
    }
}

/// Prometheus metrics endpoint
async fn metrics() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    encoder.encode(&metric_families, &mut buffer).unwrap();

    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        buffer,
    )
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/watcher", get(watcher_metrics))
        .route("/variation", get(variation_metrics))
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Start the API server; drains when the shutdown channel fires.
pub async fn serve(
    port: u16,
    state: Arc<AppState>,
    mut shutdown: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    let app = create_router(state);

    let addr = format!("0.0.0.0:{}", port);
    info!(addr = %addr, "starting watcher API server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await?;

    Ok(())
}
