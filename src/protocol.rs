//! Wire types exchanged between peers and the relay.
//!
//! ## Summary
//! - Everything travels as JSON. Opaque byte strings (public keys, ciphertext,
//!   IVs, wrapped session keys) are standard base64 and are never interpreted.
//! - `ConnectionEvent` is one item of a peer's connection stream: first a
//!   self-event carrying the peer's assigned id, then presence events for
//!   the other occupant of the channel.
//! - `RelayedMessage` is both the body of a send and one item of the
//!   recipient's message stream.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::ids::{ChannelId, PeerId};

/// Serde adapter for `Vec<u8>` as a base64 string.
pub mod b64 {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD
            .decode(text.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

/// Serde adapter for `Option<Vec<u8>>` as an optional base64 string.
pub mod b64_opt {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        bytes: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(bytes) => serializer.serialize_some(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        let text = Option::<String>::deserialize(deserializer)?;
        text.map(|t| STANDARD.decode(t.as_bytes()))
            .transpose()
            .map_err(serde::de::Error::custom)
    }
}

/// Decode a base64 string supplied outside a JSON body (e.g. a query string).
pub fn decode_b64(text: &str) -> Result<Vec<u8>, base64::DecodeError> {
    STANDARD.decode(text.as_bytes())
}

/// Connection-state notification pushed to a peer's connection stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionEvent {
    pub peer_id: PeerId,
    pub is_self: bool,
    pub is_connected: bool,
    #[serde(default, with = "b64_opt")]
    pub public_key: Option<Vec<u8>>,
}

impl ConnectionEvent {
    /// The first event of every connection: hands the caller its own id.
    pub fn own_id(peer_id: PeerId) -> Self {
        Self {
            peer_id,
            is_self: true,
            is_connected: true,
            public_key: None,
        }
    }

    /// The other occupant is present and reachable under `public_key`.
    pub fn peer_present(peer_id: PeerId, public_key: Vec<u8>) -> Self {
        Self {
            peer_id,
            is_self: false,
            is_connected: true,
            public_key: Some(public_key),
        }
    }

    /// The other occupant left the channel.
    pub fn peer_left(peer_id: PeerId) -> Self {
        Self {
            peer_id,
            is_self: false,
            is_connected: false,
            public_key: None,
        }
    }
}

/// Opaque encrypted payload relayed from one peer to the other.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayedMessage {
    /// Present only on messages that carry a (re)wrapped symmetric key.
    #[serde(default, with = "b64_opt", skip_serializing_if = "Option::is_none")]
    pub session_key: Option<Vec<u8>>,
    #[serde(with = "b64")]
    pub encrypted_message: Vec<u8>,
    #[serde(with = "b64")]
    pub iv: Vec<u8>,
}

impl RelayedMessage {
    /// Name of the first required field that is empty, if any.
    pub fn missing_field(&self) -> Option<&'static str> {
        if self.encrypted_message.is_empty() {
            Some("encrypted_message")
        } else if self.iv.is_empty() {
            Some("iv")
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateChannelResponse {
    pub channel_id: ChannelId,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConnectQuery {
    pub public_key: Option<String>,
}

/// Body of a send: the sender's id plus the opaque payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessageRequest {
    pub peer_id: PeerId,
    #[serde(default, with = "b64_opt", skip_serializing_if = "Option::is_none")]
    pub session_key: Option<Vec<u8>>,
    #[serde(with = "b64")]
    pub encrypted_message: Vec<u8>,
    #[serde(with = "b64")]
    pub iv: Vec<u8>,
}

impl SendMessageRequest {
    pub fn into_parts(self) -> (PeerId, RelayedMessage) {
        (
            self.peer_id,
            RelayedMessage {
                session_key: self.session_key,
                encrypted_message: self.encrypted_message,
                iv: self.iv,
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn self_event_has_no_public_key() {
        let event = ConnectionEvent::own_id(PeerId::from_bytes([1; 16]));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["is_self"], true);
        assert_eq!(json["is_connected"], true);
        assert!(json["public_key"].is_null());
    }

    #[test]
    fn relayed_message_omits_absent_session_key() {
        let msg = RelayedMessage {
            session_key: None,
            encrypted_message: b"ct".to_vec(),
            iv: b"iv".to_vec(),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert!(json.get("session_key").is_none());
        assert_eq!(json["encrypted_message"], "Y3Q=");
        assert_eq!(json["iv"], "aXY=");
    }

    #[test]
    fn send_request_rejects_bad_base64() {
        let body = serde_json::json!({
            "peer_id": "11".repeat(16),
            "encrypted_message": "***",
            "iv": "aXY=",
        });
        assert!(serde_json::from_value::<SendMessageRequest>(body).is_err());
    }

    #[test]
    fn missing_field_reports_empty_payload_parts() {
        let mut msg = RelayedMessage {
            session_key: Some(vec![9]),
            encrypted_message: Vec::new(),
            iv: vec![1],
        };
        assert_eq!(msg.missing_field(), Some("encrypted_message"));
        msg.encrypted_message = vec![2];
        msg.iv.clear();
        assert_eq!(msg.missing_field(), Some("iv"));
        msg.iv.push(3);
        assert_eq!(msg.missing_field(), None);
    }
}
