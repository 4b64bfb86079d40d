//! Sealed note creation and unlock.

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;

use crate::ids::NoteId;
use crate::notes::{NewNote, UnlockNote};
use crate::server::state::AppState;
use crate::server::utils::{parse_id, ApiError};

pub async fn create_note_handler(
    State(state): State<AppState>,
    body: Result<Json<NewNote>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(note) = body.map_err(|e| ApiError::malformed(e.body_text()))?;
    let created = state.notes.create(note).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

pub async fn unlock_note_handler(
    Path(note_id): Path<String>,
    State(state): State<AppState>,
    body: Result<Json<UnlockNote>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let note_id: NoteId = parse_id(&note_id, "note id")?;
    let Json(request) = body.map_err(|e| ApiError::malformed(e.body_text()))?;
    let sealed = state.notes.unlock(note_id, &request.auth_token).await?;
    Ok(Json(sealed))
}
