//! HTTP observability surface: health and Prometheus metrics.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::error::{ParlanceError, ParlanceResult};
use crate::metrics::Metrics;
use crate::session::SessionStore;

#[derive(Clone)]
struct HttpState {
    metrics: Arc<Metrics>,
    store: Arc<SessionStore>,
}

/// Starts the metrics/health server on `port`. Runs until cancelled.
pub async fn start_http(
    metrics: Arc<Metrics>,
    store: Arc<SessionStore>,
    port: u16,
    cancel: CancellationToken,
) -> ParlanceResult<tokio::task::JoinHandle<()>> {
    let state = HttpState { metrics, store };
    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_text))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .map_err(|e| ParlanceError::Internal(format!("cannot bind HTTP port {}: {}", port, e)))?;
    log::info!("[Http] Serving /healthz and /metrics on port {}", port);

    let handle = tokio::spawn(async move {
        let shutdown = async move { cancel.cancelled().await };
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
        {
            log::error!("[Http] Server error: {}", e);
        }
    });
    Ok(handle)
}

async fn healthz(State(state): State<HttpState>) -> Json<serde_json::Value> {
    let stats = state.store.stats();
    Json(serde_json::json!({
        "status": "ok",
        "active_calls": stats.active_calls,
        "active_playbacks": stats.active_playbacks,
    }))
}

async fn metrics_text(State(state): State<HttpState>) -> String {
    state.metrics.render()
}
