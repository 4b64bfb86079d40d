//! Axum router construction.

use axum::http::HeaderValue;
use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

use crate::server::gate::ban_gate;
use crate::server::handlers;
use crate::server::state::AppState;

fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    if allowed_origins.is_empty() {
        return CorsLayer::permissive();
    }
    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                crate::tlog_warn!("config: ignoring invalid CORS origin {:?}", origin);
                None
            }
        })
        .collect();
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods(Any)
        .allow_headers(Any)
}

/// Build the complete router with every route behind the ban gate.
pub fn build_router(state: AppState) -> Router {
    let cors = cors_layer(&state.config.allowed_origins);

    Router::new()
        // Liveness
        .route("/", get(handlers::health::index_handler))
        .route("/health", get(handlers::health::health_handler))
        // Channels
        .route(
            "/channels",
            post(handlers::channels::create_channel_handler),
        )
        .route(
            "/channels/:channel_id/connect",
            get(handlers::channels::connect_handler),
        )
        // Messages
        .route(
            "/channels/:channel_id/peers/:peer_id/messages",
            get(handlers::messages::subscribe_handler),
        )
        .route(
            "/channels/:channel_id/messages",
            post(handlers::messages::send_message_handler),
        )
        // Notes
        .route("/notes", post(handlers::notes::create_note_handler))
        .route(
            "/notes/:note_id/unlock",
            post(handlers::notes::unlock_note_handler),
        )
        .fallback(handlers::health::not_found_handler)
        .layer(middleware::from_fn_with_state(state.clone(), ban_gate))
        .layer(cors)
        .with_state(state)
}
