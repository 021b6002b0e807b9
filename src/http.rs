//! Observability HTTP surface: `/health`, `/status`, `/metrics` (§4.9, §6).
//!
//! Served from its own task via axum, independent of the monitor's tick
//! cadence; `/status` reads a snapshot the monitor publishes after every
//! tick rather than locking any state the monitor itself is using.

use std::sync::Arc;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use tokio::sync::RwLock;
use tower_http::trace::TraceLayer;

#[derive(Debug, Clone, Serialize)]
pub struct ServerStatusEntry {
    pub name: String,
    pub state: &'static str,
    pub running: bool,
    pub players: u32,
    pub idle_since: Option<chrono::DateTime<chrono::Utc>>,
    pub degraded: bool,
    pub quarantined: bool,
}

#[derive(Debug, Clone, Serialize)]
struct StatusResponse {
    servers: Vec<ServerStatusEntry>,
}

pub type StatusSnapshot = Arc<RwLock<Vec<ServerStatusEntry>>>;

#[derive(Clone)]
pub struct AppState {
    pub status: StatusSnapshot,
    pub metrics: PrometheusHandle,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/metrics", get(metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    "ok"
}

async fn status(State(state): State<AppState>) -> impl IntoResponse {
    let servers = state.status.read().await.clone();
    Json(StatusResponse { servers })
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    state.metrics.render()
}
