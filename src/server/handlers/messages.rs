//! Message subscription stream and relayed sends.

use axum::extract::rejection::JsonRejection;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Response;
use axum::Json;
use tokio::sync::mpsc;

use crate::channel::Subscription;
use crate::ids::{ChannelId, PeerId};
use crate::protocol::{RelayedMessage, SendMessageRequest};
use crate::server::config::MESSAGE_STREAM_CAPACITY;
use crate::server::state::AppState;
use crate::server::utils::{parse_id, send_json, ApiError};

/// Register the peer's message sink, then stream relayed payloads over a
/// WebSocket until it closes.
pub async fn subscribe_handler(
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
    Path((channel_id, peer_id)): Path<(String, String)>,
    State(state): State<AppState>,
) -> Result<Response, ApiError> {
    let ws = ws.map_err(|e| ApiError::malformed(e.body_text()))?;
    let channel_id: ChannelId = parse_id(&channel_id, "channel id")?;
    let peer_id: PeerId = parse_id(&peer_id, "peer id")?;

    let (sink, messages) = mpsc::channel(MESSAGE_STREAM_CAPACITY);
    let subscription = state.registry.subscribe(channel_id, peer_id, sink)?;

    Ok(ws.on_upgrade(move |socket| stream_messages(socket, subscription, messages)))
}

async fn stream_messages(
    mut socket: WebSocket,
    subscription: Subscription,
    mut messages: mpsc::Receiver<RelayedMessage>,
) {
    loop {
        tokio::select! {
            message = messages.recv() => {
                let Some(message) = message else { break };
                if !send_json(&mut socket, &message).await {
                    break;
                }
            }
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    _ => {}
                }
            }
        }
    }
    drop(subscription);
}

/// Relay one payload to the other occupant, waiting up to the send deadline
/// for it to subscribe.
pub async fn send_message_handler(
    Path(channel_id): Path<String>,
    State(state): State<AppState>,
    body: Result<Json<SendMessageRequest>, JsonRejection>,
) -> Result<StatusCode, ApiError> {
    let channel_id: ChannelId = parse_id(&channel_id, "channel id")?;
    let Json(request) = body.map_err(|e| ApiError::malformed(e.body_text()))?;
    let (sender, message) = request.into_parts();
    if let Some(field) = message.missing_field() {
        return Err(ApiError::malformed(format!("missing {field}")));
    }

    let send = state.registry.send(channel_id, sender, message);
    match tokio::time::timeout(state.config.send_deadline, send).await {
        Ok(result) => {
            result?;
            Ok(StatusCode::NO_CONTENT)
        }
        Err(_) => {
            crate::tlog!(
                "relay: send on {} gave up after {}s",
                crate::logging::channel_id(&channel_id.to_string()),
                state.config.send_deadline.as_secs()
            );
            Err(ApiError::deadline())
        }
    }
}
