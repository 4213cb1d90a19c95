use axum::extract::State;
use axum::Json;
use serde::Serialize;

use crate::state::SharedState;

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub subjects_tracked: usize,
    pub queue_depth: usize,
    pub in_flight: usize,
    pub load_factor: f64,
    pub throttling_active: bool,
}

/// GET /api/status
pub async fn get_status(State(state): State<SharedState>) -> Json<StatusResponse> {
    let stats = state.scheduler.stats();

    Json(StatusResponse {
        subjects_tracked: state.limiter.subjects_tracked(),
        queue_depth: stats.queued,
        in_flight: stats.in_flight,
        load_factor: state.load_factor(),
        throttling_active: state.limiter.throttler().is_active(),
    })
}
