use admission_common::AppConfig;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;

use crate::state::SharedState;

/// GET /api/config
///
/// Returns the running configuration as JSON.
pub async fn get_config(State(state): State<SharedState>) -> impl IntoResponse {
    let config = state.config();
    Json(serde_json::to_value(&*config).unwrap_or(json!({"error": "serialization failed"})))
}

/// PUT /api/config
///
/// Accepts a full configuration as JSON, validates it, and applies it to
/// the running limiter and scheduler.
pub async fn update_config(
    State(state): State<SharedState>,
    Json(new_config): Json<AppConfig>,
) -> impl IntoResponse {
    match state.apply_config(new_config) {
        Ok(()) => {
            tracing::info!("configuration updated via admin API");
            (StatusCode::OK, Json(json!({ "status": "updated" })))
        }
        Err(e) => (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "status": "error",
                "message": format!("validation failed: {}", e)
            })),
        ),
    }
}

/// POST /api/config/reload
///
/// Re-reads the configuration file the daemon was started with.
pub async fn reload_config(State(state): State<SharedState>) -> impl IntoResponse {
    match state.reload_from_disk() {
        Ok(()) => (StatusCode::OK, Json(json!({ "status": "reloaded" }))),
        Err(e) => (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "status": "error",
                "message": format!("reload failed: {}", e)
            })),
        ),
    }
}
