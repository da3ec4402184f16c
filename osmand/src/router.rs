use std::sync::Arc;

use axum::Router;
use tower_http::trace::TraceLayer;

use tracker_common::ingest::PositionIngestor;
use tracker_common::metrics::track_metrics;
use tracker_common::rawlog::RawLog;

use crate::report;

#[derive(Clone)]
pub struct State {
    pub ingestor: Arc<PositionIngestor>,
    pub rawlog: Arc<RawLog>,
    /// Listener port, recorded alongside raw traffic.
    pub port: u16,
}

/// Builds the OsmAnd endpoint router.
///
/// Everything is a fallback route on purpose: clients report to `/`, to
/// arbitrary configured paths, and Traccar derived apps to whatever their
/// build hardcodes, so the handler owns the whole path space.
pub fn router(ingestor: Arc<PositionIngestor>, rawlog: Arc<RawLog>, port: u16) -> Router {
    let state = State {
        ingestor,
        rawlog,
        port,
    };

    Router::new()
        .fallback(report::position)
        .layer(TraceLayer::new_for_http())
        .layer(axum::middleware::from_fn(track_metrics))
        .with_state(state)
}
