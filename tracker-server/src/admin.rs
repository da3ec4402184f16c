use std::future::ready;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use tower_http::trace::TraceLayer;

use health::HealthRegistry;
use metrics_exporter_prometheus::PrometheusHandle;
use tracker_common::liveness::{DeviceLiveness, LivenessEntry};
use tracker_common::metrics::track_metrics;
use tracker_common::rawlog::{RawLog, RawLogEntry};

/// Shared state for the admin read endpoints.
#[derive(Clone)]
pub struct AdminState {
    pub liveness: Arc<DeviceLiveness>,
    pub rawlog: Arc<RawLog>,
    pub online_threshold: Duration,
}

async fn index() -> &'static str {
    "tracker"
}

#[derive(Deserialize)]
struct RawLogQuery {
    port: Option<u16>,
    limit: Option<usize>,
}

/// Recent raw inbound traffic, for protocol debugging.
async fn rawlog(
    State(state): State<AdminState>,
    Query(query): Query<RawLogQuery>,
) -> Json<Vec<RawLogEntry>> {
    Json(state.rawlog.list(query.port, query.limit))
}

/// Every known device with its last-seen time and derived status.
async fn devices(State(state): State<AdminState>) -> Json<Vec<LivenessEntry>> {
    Json(state.liveness.snapshot(state.online_threshold))
}

/// The operator surface: process liveness, metrics and debug reads.
pub fn router(state: AdminState, registry: HealthRegistry, metrics: PrometheusHandle) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/_liveness", get(move || ready(registry.get_status())))
        .route("/metrics", get(move || ready(metrics.render())))
        .route("/_rawlog", get(rawlog))
        .route("/_devices", get(devices))
        .layer(TraceLayer::new_for_http())
        .layer(axum::middleware::from_fn(track_metrics))
        .with_state(state)
}
