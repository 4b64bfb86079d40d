//! Ban gate: runs ahead of every route.
//!
//! 1. A banned address gets 403 before anything else happens.
//! 2. Every other request counts toward the address's hourly usage, except
//!    liveness probes.
//! 3. The response decides whether the caller earns a strike: any 400 or
//!    404, any server fault except a lapsed deadline, anything a handler
//!    marked with [`Strike`], and any panic while serving the request.
//!
//! Requests without a known peer address (no `ConnectInfo`) pass ungated.

use std::net::{IpAddr, SocketAddr};
use std::panic::AssertUnwindSafe;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::Response;
use futures_util::FutureExt;

use crate::server::state::AppState;
use crate::server::utils::api_error;

/// Response extension set by handlers when the caller misbehaved.
#[derive(Debug, Clone, Copy)]
pub struct Strike;

/// Paths that never count toward usage.
const LIVENESS_PATHS: &[&str] = &["/", "/health"];

fn client_addr(request: &Request) -> Option<IpAddr> {
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip())
}

fn earns_strike(response: &Response) -> bool {
    let status = response.status();
    status == StatusCode::NOT_FOUND
        || status == StatusCode::BAD_REQUEST
        || (status.is_server_error() && status != StatusCode::GATEWAY_TIMEOUT)
        || response.extensions().get::<Strike>().is_some()
}

pub async fn ban_gate(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let Some(addr) = client_addr(&request) else {
        return next.run(request).await;
    };
    let path = request.uri().path().to_string();

    if state.ledger.is_banned(addr) {
        crate::tlog!("gate: banned {} tried to access {}", addr, path);
        return api_error(StatusCode::FORBIDDEN, "forbidden");
    }

    if !LIVENESS_PATHS.contains(&path.as_str()) {
        state.ledger.record_usage(addr);
    }

    match AssertUnwindSafe(next.run(request)).catch_unwind().await {
        Ok(response) => {
            if earns_strike(&response) {
                state.ledger.record_strike(addr);
            }
            response
        }
        Err(_) => {
            crate::tlog_crit!("gate: handler panicked serving {}", path);
            state.ledger.record_strike(addr);
            api_error(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
        }
    }
}
