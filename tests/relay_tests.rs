use std::net::SocketAddr;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use tandem::ledger::{AbuseLedger, LedgerConfig};
use tandem::notes::NoteStore;
use tandem::server::config::RelayConfig;
use tandem::server::router::build_router;
use tandem::server::state::AppState;
use tandem::storage::Storage;

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct Relay {
    addr: SocketAddr,
    state: AppState,
    shutdown: Option<oneshot::Sender<()>>,
}

impl Relay {
    fn http(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    fn ws(&self, path: &str) -> String {
        format!("ws://{}{}", self.addr, path)
    }
}

impl Drop for Relay {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

async fn start_relay(relay: RelayConfig) -> Relay {
    let state = AppState::new(
        AbuseLedger::open(LedgerConfig::default()),
        NoteStore::new(Storage::open_in_memory().expect("in-memory notes")),
        relay,
    );
    let app = build_router(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind relay");
    let addr = listener.local_addr().expect("relay addr");
    let (shutdown_tx, shutdown_rx) = oneshot::channel();

    let server = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        let _ = shutdown_rx.await;
    });
    tokio::spawn(async move {
        let _ = server.await;
    });

    Relay {
        addr,
        state,
        shutdown: Some(shutdown_tx),
    }
}

/// Run a blocking HTTP call and return its status and JSON body (if any).
async fn call(method: &'static str, url: String, body: Option<Value>) -> (u16, Value) {
    tokio::task::spawn_blocking(move || {
        let request = ureq::request(method, &url);
        let result = match body {
            Some(body) => request.send_json(body),
            None => request.call(),
        };
        let response = match result {
            Ok(response) => response,
            Err(ureq::Error::Status(_, response)) => response,
            Err(e) => panic!("transport error: {e}"),
        };
        let status = response.status();
        let text = response.into_string().unwrap_or_default();
        (status, serde_json::from_str(&text).unwrap_or(Value::Null))
    })
    .await
    .expect("http task")
}

async fn create_channel(relay: &Relay) -> String {
    let (status, body) = call("POST", relay.http("/channels"), None).await;
    assert_eq!(status, 201);
    body["channel_id"].as_str().expect("channel id").to_string()
}

async fn connect(relay: &Relay, channel_id: &str, public_key: &[u8]) -> Ws {
    let url = relay.ws(&format!(
        "/channels/{}/connect?public_key={}",
        channel_id,
        STANDARD.encode(public_key)
    ));
    let (ws, _) = tokio_tungstenite::connect_async(url)
        .await
        .expect("connect to channel");
    ws
}

async fn connect_status(relay: &Relay, channel_id: &str, public_key: &[u8]) -> u16 {
    let url = relay.ws(&format!(
        "/channels/{}/connect?public_key={}",
        channel_id,
        STANDARD.encode(public_key)
    ));
    match tokio_tungstenite::connect_async(url).await {
        Ok(_) => 101,
        Err(tokio_tungstenite::tungstenite::Error::Http(response)) => response.status().as_u16(),
        Err(e) => panic!("unexpected websocket error: {e}"),
    }
}

async fn next_json(ws: &mut Ws) -> Value {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("frame before timeout")
            .expect("stream open")
            .expect("frame ok");
        if let Message::Text(text) = frame {
            return serde_json::from_str(&text).expect("json frame");
        }
    }
}

async fn wait_for_channel_count(relay: &Relay, expected: usize) {
    for _ in 0..50 {
        if relay.state.registry.len() == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!(
        "registry holds {} channels, expected {}",
        relay.state.registry.len(),
        expected
    );
}

#[tokio::test]
async fn two_peers_pair_and_relay_a_message() {
    let relay = start_relay(RelayConfig::default()).await;
    let channel_id = create_channel(&relay).await;

    // A joins first and only learns its own id.
    let mut a = connect(&relay, &channel_id, b"pkA").await;
    let own_a = next_json(&mut a).await;
    assert_eq!(own_a["is_self"], true);
    assert_eq!(own_a["is_connected"], true);
    assert!(own_a["public_key"].is_null());
    let a_id = own_a["peer_id"].as_str().unwrap().to_string();

    // B joins and both sides learn about each other.
    let mut b = connect(&relay, &channel_id, b"pkB").await;
    let own_b = next_json(&mut b).await;
    assert_eq!(own_b["is_self"], true);
    let b_id = own_b["peer_id"].as_str().unwrap().to_string();

    let a_seen_by_b = next_json(&mut b).await;
    assert_eq!(a_seen_by_b["peer_id"], a_id.as_str());
    assert_eq!(a_seen_by_b["is_self"], false);
    assert_eq!(a_seen_by_b["is_connected"], true);
    assert_eq!(a_seen_by_b["public_key"], STANDARD.encode(b"pkA"));

    let b_seen_by_a = next_json(&mut a).await;
    assert_eq!(b_seen_by_a["peer_id"], b_id.as_str());
    assert_eq!(b_seen_by_a["is_connected"], true);
    assert_eq!(b_seen_by_a["public_key"], STANDARD.encode(b"pkB"));

    // A subscribes, B sends.
    let (mut a_messages, _) = tokio_tungstenite::connect_async(
        relay.ws(&format!("/channels/{channel_id}/peers/{a_id}/messages")),
    )
    .await
    .expect("subscribe");

    let (status, _) = call(
        "POST",
        relay.http(&format!("/channels/{channel_id}/messages")),
        Some(json!({
            "peer_id": b_id,
            "encrypted_message": STANDARD.encode(b"CT1"),
            "iv": STANDARD.encode(b"IV1"),
        })),
    )
    .await;
    assert_eq!(status, 204);

    let relayed = next_json(&mut a_messages).await;
    assert_eq!(relayed["encrypted_message"], STANDARD.encode(b"CT1"));
    assert_eq!(relayed["iv"], STANDARD.encode(b"IV1"));
    assert!(relayed.get("session_key").is_none());

    // B leaves; A hears about it.
    b.close(None).await.expect("close b");
    let b_left = next_json(&mut a).await;
    assert_eq!(b_left["peer_id"], b_id.as_str());
    assert_eq!(b_left["is_connected"], false);
    assert_eq!(relay.state.registry.len(), 1);

    // Once A leaves too the channel is gone.
    a_messages.close(None).await.expect("close messages");
    a.close(None).await.expect("close a");
    wait_for_channel_count(&relay, 0).await;
    assert_eq!(connect_status(&relay, &channel_id, b"pkC").await, 404);
}

#[tokio::test]
async fn third_peer_is_turned_away() {
    let relay = start_relay(RelayConfig::default()).await;
    let channel_id = create_channel(&relay).await;

    let _a = connect(&relay, &channel_id, b"pkA").await;
    let _b = connect(&relay, &channel_id, b"pkB").await;
    assert_eq!(connect_status(&relay, &channel_id, b"pkC").await, 409);
}

#[tokio::test]
async fn bad_connect_requests_are_rejected() {
    let relay = start_relay(RelayConfig::default()).await;

    let unknown = "00".repeat(16);
    assert_eq!(connect_status(&relay, &unknown, b"pkA").await, 404);
    assert_eq!(connect_status(&relay, "not-an-id", b"pkA").await, 400);

    let channel_id = create_channel(&relay).await;
    let url = relay.ws(&format!("/channels/{channel_id}/connect"));
    match tokio_tungstenite::connect_async(url).await {
        Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
            assert_eq!(response.status().as_u16(), 400)
        }
        other => panic!("expected 400, got {:?}", other.map(|_| ())),
    }
}

#[tokio::test]
async fn send_waits_for_subscriber_until_deadline() {
    let relay = start_relay(RelayConfig {
        send_deadline: Duration::from_millis(100),
        ..RelayConfig::default()
    })
    .await;
    let channel_id = create_channel(&relay).await;

    let mut a = connect(&relay, &channel_id, b"pkA").await;
    next_json(&mut a).await;
    let mut b = connect(&relay, &channel_id, b"pkB").await;
    let b_id = next_json(&mut b).await["peer_id"].as_str().unwrap().to_string();

    let (status, body) = call(
        "POST",
        relay.http(&format!("/channels/{channel_id}/messages")),
        Some(json!({
            "peer_id": b_id,
            "encrypted_message": STANDARD.encode(b"CT"),
            "iv": STANDARD.encode(b"IV"),
        })),
    )
    .await;
    assert_eq!(status, 504);
    assert_eq!(body["error"], "deadline exceeded");
}

#[tokio::test]
async fn send_from_a_stranger_is_not_found() {
    let relay = start_relay(RelayConfig::default()).await;
    let channel_id = create_channel(&relay).await;
    let _a = connect(&relay, &channel_id, b"pkA").await;

    let (status, _) = call(
        "POST",
        relay.http(&format!("/channels/{channel_id}/messages")),
        Some(json!({
            "peer_id": "ab".repeat(16),
            "encrypted_message": STANDARD.encode(b"CT"),
            "iv": STANDARD.encode(b"IV"),
        })),
    )
    .await;
    assert_eq!(status, 404);

    let (status, _) = call(
        "POST",
        relay.http(&format!("/channels/{channel_id}/messages")),
        Some(json!({ "peer_id": "ab".repeat(16), "iv": "" })),
    )
    .await;
    assert_eq!(status, 400);
}

#[tokio::test]
async fn notes_unlock_until_attempts_run_out() {
    let relay = start_relay(RelayConfig::default()).await;

    let (status, created) = call(
        "POST",
        relay.http("/notes"),
        Some(json!({
            "cipher_text": STANDARD.encode(b"secret"),
            "auth_tag": STANDARD.encode(b"tag"),
            "iv": STANDARD.encode(b"iv"),
            "salt": STANDARD.encode(b"salt"),
            "auth_token": STANDARD.encode(b"derived-token"),
            "minutes_available": 10,
            "max_unlocks": 2,
        })),
    )
    .await;
    assert_eq!(status, 201);
    let note_id = created["note_id"].as_str().unwrap().to_string();
    assert!(created["expires_at"].as_u64().unwrap() > 0);

    let unlock_url = relay.http(&format!("/notes/{note_id}/unlock"));
    let token = json!({ "auth_token": STANDARD.encode(b"derived-token") });
    let (status, sealed) = call("POST", unlock_url.clone(), Some(token.clone())).await;
    assert_eq!(status, 200);
    assert_eq!(sealed["cipher_text"], STANDARD.encode(b"secret"));
    assert_eq!(sealed["remaining_unlocks"], 1);

    let (status, sealed) = call("POST", unlock_url.clone(), Some(token.clone())).await;
    assert_eq!(status, 200);
    assert_eq!(sealed["remaining_unlocks"], 0);

    let (status, _) = call("POST", unlock_url, Some(token)).await;
    assert_eq!(status, 404);
}

#[tokio::test]
async fn wrong_note_token_is_refused_and_spends_an_attempt() {
    let relay = start_relay(RelayConfig::default()).await;

    let (status, created) = call(
        "POST",
        relay.http("/notes"),
        Some(json!({
            "cipher_text": STANDARD.encode(b"secret"),
            "auth_tag": STANDARD.encode(b"tag"),
            "iv": STANDARD.encode(b"iv"),
            "salt": STANDARD.encode(b"salt"),
            "auth_token": STANDARD.encode(b"derived-token"),
            "minutes_available": 10,
            "max_unlocks": 2,
        })),
    )
    .await;
    assert_eq!(status, 201);
    let note_id = created["note_id"].as_str().unwrap().to_string();
    let unlock_url = relay.http(&format!("/notes/{note_id}/unlock"));

    let guess = json!({ "auth_token": STANDARD.encode(b"guess") });
    let (status, body) = call("POST", unlock_url.clone(), Some(guess)).await;
    assert_eq!(status, 401);
    assert!(body.get("cipher_text").is_none());

    let token = json!({ "auth_token": STANDARD.encode(b"derived-token") });
    let (status, sealed) = call("POST", unlock_url.clone(), Some(token.clone())).await;
    assert_eq!(status, 200);
    assert_eq!(sealed["remaining_unlocks"], 0);

    let (status, _) = call("POST", unlock_url, Some(token)).await;
    assert_eq!(status, 404);
}

#[tokio::test]
async fn empty_note_is_malformed() {
    let relay = start_relay(RelayConfig::default()).await;
    let (status, body) = call(
        "POST",
        relay.http("/notes"),
        Some(json!({
            "cipher_text": "",
            "auth_tag": STANDARD.encode(b"tag"),
            "iv": STANDARD.encode(b"iv"),
            "salt": STANDARD.encode(b"salt"),
            "auth_token": STANDARD.encode(b"derived-token"),
            "minutes_available": 10,
        })),
    )
    .await;
    assert_eq!(status, 400);
    assert_eq!(body["error"], "missing field: cipher_text");
}

#[tokio::test]
async fn health_reports_live_channels() {
    let relay = start_relay(RelayConfig::default()).await;
    create_channel(&relay).await;
    let (status, body) = call("GET", relay.http("/health"), None).await;
    assert_eq!(status, 200);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["channels"], 1);
}
