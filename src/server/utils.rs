//! Shared utility functions for the HTTP surface.

use std::str::FromStr;

use axum::extract::ws::{Message, WebSocket};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use crate::channel::ChannelError;
use crate::error::ErrorKind;
use crate::notes::NoteError;
use crate::server::gate::Strike;

/// Build a standard JSON error response.
pub fn api_error(status: StatusCode, message: impl Into<String>) -> Response {
    let body = serde_json::json!({ "error": message.into() });
    (status, axum::Json(body)).into_response()
}

pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::Malformed => StatusCode::BAD_REQUEST,
        ErrorKind::Unauthorized => StatusCode::UNAUTHORIZED,
        ErrorKind::Transient => StatusCode::GATEWAY_TIMEOUT,
        ErrorKind::ResourceExhausted | ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Error returned by handlers. Carries the strike marker the gate looks for.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
    strike: bool,
}

impl ApiError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            status: status_for(kind),
            message: message.into(),
            strike: kind.strikes(),
        }
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Malformed, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    /// The caller's deadline lapsed before the work finished.
    pub fn deadline() -> Self {
        Self::new(ErrorKind::Transient, "deadline exceeded")
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn strikes(&self) -> bool {
        self.strike
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut response = api_error(self.status, self.message);
        if self.strike {
            response.extensions_mut().insert(Strike);
        }
        response
    }
}

impl From<ChannelError> for ApiError {
    fn from(e: ChannelError) -> Self {
        ApiError::new(e.kind(), e.to_string())
    }
}

impl From<NoteError> for ApiError {
    fn from(e: NoteError) -> Self {
        if e.kind() == ErrorKind::Internal {
            crate::tlog_warn!("notes: {}", e);
            return ApiError::new(ErrorKind::Internal, "internal error");
        }
        ApiError::new(e.kind(), e.to_string())
    }
}

/// Push one JSON text frame. Returns false once the socket is unusable.
pub async fn send_json<T: Serialize>(socket: &mut WebSocket, value: &T) -> bool {
    let text = match serde_json::to_string(value) {
        Ok(text) => text,
        Err(e) => {
            crate::tlog_warn!("ws: could not encode frame: {}", e);
            return true;
        }
    };
    socket.send(Message::Text(text)).await.is_ok()
}

/// Parse an identifier taken from the request path.
pub fn parse_id<T: FromStr>(raw: &str, what: &str) -> Result<T, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::malformed(format!("invalid {what}")))
}
