//! Liveness endpoints and the catch-all 404.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;

use crate::server::state::AppState;
use crate::server::utils::ApiError;

pub async fn index_handler() -> impl IntoResponse {
    (StatusCode::OK, "tandem relay")
}

pub async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let body = serde_json::json!({
        "status": "ok",
        "channels": state.registry.len(),
        "bans": state.ledger.ban_list().len(),
    });
    (StatusCode::OK, axum::Json(body))
}

pub async fn not_found_handler() -> ApiError {
    ApiError::not_found("not found")
}
