//! Worker HTTP surface: `/health` and `/metrics`.
//!
//! `/health` returns a JSON liveness document and answers 503 once the
//! worker is in the error or shutdown state, so orchestrators stop
//! routing to it. `/metrics` serves the Prometheus text format.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use tokio::sync::{broadcast, watch};
use tracing::info;

use crate::context::DeploymentContext;
use crate::metrics::{export_metrics, ResourceSampler};
use crate::worker::runtime::WorkerCounters;
use crate::worker::state::WorkerState;

/// Shared state for the worker's HTTP routes.
#[derive(Clone)]
pub struct HttpState {
    pub worker_id: String,
    pub class: String,
    pub context: DeploymentContext,
    pub state_rx: watch::Receiver<WorkerState>,
    pub counters: Arc<WorkerCounters>,
    started_at: Instant,
    sampler: Arc<Mutex<ResourceSampler>>,
}

impl HttpState {
    pub fn new(
        worker_id: impl Into<String>,
        class: impl Into<String>,
        context: DeploymentContext,
        state_rx: watch::Receiver<WorkerState>,
        counters: Arc<WorkerCounters>,
    ) -> Self {
        Self {
            worker_id: worker_id.into(),
            class: class.into(),
            context,
            state_rx,
            counters,
            started_at: Instant::now(),
            sampler: Arc::new(Mutex::new(ResourceSampler::new())),
        }
    }
}

/// GET /health
async fn health(State(state): State<HttpState>) -> impl IntoResponse {
    let worker_state = *state.state_rx.borrow();
    let healthy = !matches!(worker_state, WorkerState::Error | WorkerState::Shutdown);
    let resources = state.sampler.lock().unwrap().sample();

    let body = Json(serde_json::json!({
        "status": if healthy { "healthy" } else { "unhealthy" },
        "state": worker_state,
        "worker_id": state.worker_id,
        "class": state.class,
        "uptime_seconds": state.started_at.elapsed().as_secs_f64(),
        "jobs_processed": state.counters.processed(),
        "jobs_failed": state.counters.failed(),
        "resources": resources,
        "deployment": state.context,
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }));

    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, body)
}

/// GET /metrics
async fn metrics() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        export_metrics(),
    )
}

/// Builds the worker's router.
pub fn router(state: HttpState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Serves the HTTP surface until the shutdown signal fires.
pub async fn serve(
    addr: SocketAddr,
    state: HttpState,
    mut shutdown: broadcast::Receiver<()>,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, "worker http surface listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await
}
