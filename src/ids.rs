//! 128-bit random identifiers for channels, peers and notes.
//!
//! Every identifier is drawn from the operating system CSPRNG and rendered as
//! 32 lowercase hex characters on the wire and in logs.

use std::fmt;
use std::str::FromStr;

use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Number of random bytes in every identifier.
pub const ID_LEN: usize = 16;

/// Error returned when an identifier string is not 32 hex characters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidId(String);

impl fmt::Display for InvalidId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid identifier: {:?}", self.0)
    }
}

impl std::error::Error for InvalidId {}

fn parse_id(s: &str) -> Result<[u8; ID_LEN], InvalidId> {
    let mut bytes = [0u8; ID_LEN];
    if s.len() != ID_LEN * 2 {
        return Err(InvalidId(s.to_string()));
    }
    hex::decode_to_slice(s, &mut bytes).map_err(|_| InvalidId(s.to_string()))?;
    Ok(bytes)
}

macro_rules! random_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name([u8; ID_LEN]);

        impl $name {
            /// Draw a fresh identifier from the OS random source.
            pub fn random() -> Self {
                let mut bytes = [0u8; ID_LEN];
                OsRng.fill_bytes(&mut bytes);
                Self(bytes)
            }

            pub fn from_bytes(bytes: [u8; ID_LEN]) -> Self {
                Self(bytes)
            }

            pub fn as_bytes(&self) -> &[u8; ID_LEN] {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&hex::encode(self.0))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), hex::encode(self.0))
            }
        }

        impl FromStr for $name {
            type Err = InvalidId;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                parse_id(s).map(Self)
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_string())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let text = String::deserialize(deserializer)?;
                text.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

random_id!(
    /// Identifier of a rendezvous channel. Unique among live channels.
    ChannelId
);

random_id!(
    /// Identifier handed to a peer when it joins a channel.
    PeerId
);

random_id!(
    /// Identifier of a stored encrypted note.
    NoteId
);
