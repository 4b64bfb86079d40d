//! Channel creation and the connection-event stream.

use axum::extract::rejection::QueryRejection;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use tokio::sync::mpsc;

use crate::channel::Membership;
use crate::ids::ChannelId;
use crate::protocol::{decode_b64, ConnectQuery, ConnectionEvent, CreateChannelResponse};
use crate::server::state::AppState;
use crate::server::utils::{parse_id, send_json, ApiError};

pub async fn create_channel_handler(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, ApiError> {
    let channel_id = state.registry.create_channel()?;
    Ok((
        StatusCode::CREATED,
        Json(CreateChannelResponse { channel_id }),
    ))
}

/// Join the channel, then stream connection events over a WebSocket for as
/// long as the socket stays open. Joining happens before the upgrade so a
/// missing or full channel is an ordinary HTTP error.
pub async fn connect_handler(
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
    Path(channel_id): Path<String>,
    query: Result<Query<ConnectQuery>, QueryRejection>,
    State(state): State<AppState>,
) -> Result<Response, ApiError> {
    let ws = ws.map_err(|e| ApiError::malformed(e.body_text()))?;
    let Query(query) = query.map_err(|e| ApiError::malformed(e.body_text()))?;
    let channel_id: ChannelId = parse_id(&channel_id, "channel id")?;
    let public_key = query
        .public_key
        .as_deref()
        .map(decode_b64)
        .transpose()
        .map_err(|_| ApiError::malformed("public_key is not valid base64"))?
        .filter(|key| !key.is_empty())
        .ok_or_else(|| ApiError::malformed("missing public_key"))?;

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let membership = state.registry.join(channel_id, public_key, events_tx)?;

    Ok(ws.on_upgrade(move |socket| stream_events(socket, membership, events_rx)))
}

async fn stream_events(
    mut socket: WebSocket,
    membership: Membership,
    mut events: mpsc::UnboundedReceiver<ConnectionEvent>,
) {
    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                if !send_json(&mut socket, &event).await {
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
    // Leaving the channel tells the other occupant.
    drop(membership);
}
