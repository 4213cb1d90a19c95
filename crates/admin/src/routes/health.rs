use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};

use crate::state::SharedState;

/// GET /api/health
///
/// `degraded` when the load signal has stopped producing samples; admission
/// still works in that state, with throttling suspended.
pub async fn health_check(State(state): State<SharedState>) -> Json<Value> {
    let load_signal_ok = state
        .sampler
        .as_ref()
        .map_or(true, |sampler| !sampler.is_degraded());

    Json(json!({
        "status": if load_signal_ok { "healthy" } else { "degraded" },
        "load_signal": load_signal_ok,
        "uptime_secs": state.start_time.elapsed().as_secs(),
        "version": env!("CARGO_PKG_VERSION")
    }))
}
