use axum::extract::State;
use axum::Json;
use serde::Serialize;
use upshift_billing::QueueStats;

use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub queue: QueueStats,
}

/// GET /health
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        queue: state.queue.stats(),
    })
}
