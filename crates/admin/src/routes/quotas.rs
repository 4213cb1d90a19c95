use admission_common::RateLimit;
use admission_rate_limit::QuotaView;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;

use crate::state::SharedState;

/// Body of `PUT /api/quotas/{user_id}`.
#[derive(Debug, Deserialize)]
pub struct SetQuotaRequest {
    pub capacity: u64,
    pub window_secs: f64,
    #[serde(default)]
    pub burst: u64,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

/// GET /api/quotas/{user_id}
///
/// Returns the user's override, or the global default when there is none.
pub async fn get_quota(
    State(state): State<SharedState>,
    Path(user_id): Path<String>,
) -> Json<QuotaView> {
    Json(state.limiter.get_quota(&user_id))
}

/// PUT /api/quotas/{user_id}
pub async fn set_quota(
    State(state): State<SharedState>,
    Path(user_id): Path<String>,
    Json(body): Json<SetQuotaRequest>,
) -> impl IntoResponse {
    let limit = RateLimit::new(body.capacity, body.window_secs, body.burst);
    match state.limiter.set_quota(&user_id, limit, body.expires_at) {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({
                "status": "ok",
                "quota": state.limiter.get_quota(&user_id)
            })),
        ),
        Err(e) => (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "status": "error",
                "message": e.to_string()
            })),
        ),
    }
}

/// DELETE /api/quotas/{user_id}
pub async fn clear_quota(
    State(state): State<SharedState>,
    Path(user_id): Path<String>,
) -> impl IntoResponse {
    if state.limiter.clear_quota(&user_id) {
        (StatusCode::OK, Json(json!({ "status": "cleared" })))
    } else {
        (
            StatusCode::NOT_FOUND,
            Json(json!({
                "status": "error",
                "message": format!("no quota override for {}", user_id)
            })),
        )
    }
}
