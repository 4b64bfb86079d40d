//! Sealed notes: one encrypted secret, unlockable a few times before it
//! expires.
//!
//! The client encrypts the note and uploads the ciphertext, tag, IV and key
//! derivation salt, plus an unlock token derived from the same password. The
//! relay keeps only the SHA-256 of the token. Every unlock consumes one
//! attempt whether or not the token matches, and only a matching token gets
//! the sealed parts back. The note is destroyed when the budget or the
//! deadline runs out.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

use crate::error::ErrorKind;
use crate::ids::NoteId;
use crate::logging;
use crate::protocol::b64;
use crate::storage::{NoteRow, Storage, StorageError};

/// Attempts at drawing an unused note id before giving up.
pub const MAX_ID_ATTEMPTS: usize = 10;

pub const MIN_MINUTES_AVAILABLE: u32 = 1;
pub const MAX_MINUTES_AVAILABLE: u32 = 5040;
pub const DEFAULT_MAX_UNLOCKS: u32 = 5;
pub const MAX_UNLOCKS_CEILING: u32 = 10;

#[derive(Debug)]
pub enum NoteError {
    Malformed(&'static str),
    NotFound(NoteId),
    /// Token did not match. The attempt was still consumed.
    WrongToken { note_id: NoteId, remaining: u32 },
    IdSpaceExhausted { attempts: usize, live_notes: usize },
    Storage(StorageError),
}

impl NoteError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            NoteError::Malformed(_) => ErrorKind::Malformed,
            NoteError::NotFound(_) => ErrorKind::NotFound,
            NoteError::WrongToken { .. } => ErrorKind::Unauthorized,
            NoteError::IdSpaceExhausted { .. } => ErrorKind::ResourceExhausted,
            NoteError::Storage(_) => ErrorKind::Internal,
        }
    }
}

impl std::fmt::Display for NoteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NoteError::Malformed(field) => write!(f, "missing field: {field}"),
            NoteError::NotFound(_) | NoteError::WrongToken { .. } => {
                write!(f, "unable to read note")
            }
            NoteError::IdSpaceExhausted { attempts, .. } => {
                write!(f, "unable to draw a free note id after {attempts} attempts")
            }
            NoteError::Storage(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for NoteError {}

impl From<StorageError> for NoteError {
    fn from(e: StorageError) -> Self {
        NoteError::Storage(e)
    }
}

/// Body of a note creation request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewNote {
    #[serde(with = "b64")]
    pub cipher_text: Vec<u8>,
    #[serde(with = "b64")]
    pub auth_tag: Vec<u8>,
    #[serde(with = "b64")]
    pub iv: Vec<u8>,
    #[serde(with = "b64")]
    pub salt: Vec<u8>,
    /// Key-derived secret the reader must present to unlock.
    #[serde(with = "b64")]
    pub auth_token: Vec<u8>,
    pub minutes_available: u32,
    #[serde(default)]
    pub max_unlocks: Option<u32>,
}

impl NewNote {
    fn missing_field(&self) -> Option<&'static str> {
        [
            ("cipher_text", &self.cipher_text),
            ("auth_tag", &self.auth_tag),
            ("iv", &self.iv),
            ("salt", &self.salt),
            ("auth_token", &self.auth_token),
        ]
        .into_iter()
        .find(|(_, bytes)| bytes.is_empty())
        .map(|(name, _)| name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateNoteResponse {
    pub note_id: NoteId,
    /// Unix seconds.
    pub expires_at: u64,
}

/// Body of an unlock request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnlockNote {
    #[serde(with = "b64")]
    pub auth_token: Vec<u8>,
}

/// What an unlock hands back to the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedNote {
    pub note_id: NoteId,
    #[serde(with = "b64")]
    pub cipher_text: Vec<u8>,
    #[serde(with = "b64")]
    pub auth_tag: Vec<u8>,
    #[serde(with = "b64")]
    pub iv: Vec<u8>,
    #[serde(with = "b64")]
    pub salt: Vec<u8>,
    pub expires_at: u64,
    pub remaining_unlocks: u32,
}

fn token_verifier(token: &[u8]) -> Vec<u8> {
    Sha256::digest(token).to_vec()
}

/// Compare without an early exit on the first differing byte.
fn verifier_matches(stored: &[u8], presented: &[u8]) -> bool {
    stored.len() == presented.len()
        && stored
            .iter()
            .zip(presented)
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Shared handle on the note table.
#[derive(Clone)]
pub struct NoteStore {
    storage: Arc<Mutex<Storage>>,
}

impl NoteStore {
    pub fn new(storage: Storage) -> Self {
        Self {
            storage: Arc::new(Mutex::new(storage)),
        }
    }

    pub async fn create(&self, note: NewNote) -> Result<CreateNoteResponse, NoteError> {
        self.create_at(note, now_secs(), NoteId::random).await
    }

    pub(crate) async fn create_at(
        &self,
        note: NewNote,
        now: u64,
        mut next_id: impl FnMut() -> NoteId,
    ) -> Result<CreateNoteResponse, NoteError> {
        if let Some(field) = note.missing_field() {
            return Err(NoteError::Malformed(field));
        }

        let minutes = note
            .minutes_available
            .clamp(MIN_MINUTES_AVAILABLE, MAX_MINUTES_AVAILABLE);
        let unlocks = note
            .max_unlocks
            .unwrap_or(DEFAULT_MAX_UNLOCKS)
            .clamp(1, MAX_UNLOCKS_CEILING);
        let expires_at = now + u64::from(minutes) * 60;

        let storage = self.storage.lock().await;
        storage.delete_expired_notes(now)?;

        let mut row = NoteRow {
            note_id: next_id(),
            cipher_text: note.cipher_text,
            auth_tag: note.auth_tag,
            iv: note.iv,
            salt: note.salt,
            verifier: token_verifier(&note.auth_token),
            expires_at,
            remaining_unlocks: unlocks,
            created_at: now,
        };
        for attempt in 0..MAX_ID_ATTEMPTS {
            if attempt > 0 {
                row.note_id = next_id();
            }
            match storage.insert_note(&row) {
                Ok(()) => {
                    crate::tlog!(
                        "notes: {} sealed for {} min, {} unlocks",
                        logging::note_id(&row.note_id.to_string()),
                        minutes,
                        unlocks
                    );
                    return Ok(CreateNoteResponse {
                        note_id: row.note_id,
                        expires_at,
                    });
                }
                Err(StorageError::AlreadyExists(_)) => continue,
                Err(e) => return Err(e.into()),
            }
        }

        let live_notes = storage.count_notes()?;
        crate::tlog_crit!(
            "notes: no free note id after {} attempts ({} live notes)",
            MAX_ID_ATTEMPTS,
            live_notes
        );
        Err(NoteError::IdSpaceExhausted {
            attempts: MAX_ID_ATTEMPTS,
            live_notes,
        })
    }

    /// Consume one unlock attempt and, if `auth_token` matches, hand back
    /// the sealed note.
    pub async fn unlock(&self, note_id: NoteId, auth_token: &[u8]) -> Result<SealedNote, NoteError> {
        self.unlock_at(note_id, auth_token, now_secs()).await
    }

    pub(crate) async fn unlock_at(
        &self,
        note_id: NoteId,
        auth_token: &[u8],
        now: u64,
    ) -> Result<SealedNote, NoteError> {
        if auth_token.is_empty() {
            return Err(NoteError::Malformed("auth_token"));
        }

        let storage = self.storage.lock().await;
        storage.delete_expired_notes(now)?;

        let Some(row) = storage.get_note(note_id)? else {
            crate::tlog!(
                "notes: no note {}",
                logging::note_id(&note_id.to_string())
            );
            return Err(NoteError::NotFound(note_id));
        };
        let remaining = storage
            .consume_unlock(note_id)?
            .ok_or(NoteError::NotFound(note_id))?;

        if !verifier_matches(&row.verifier, &token_verifier(auth_token)) {
            crate::tlog!(
                "notes: wrong token for {}, {} left",
                logging::note_id(&note_id.to_string()),
                remaining
            );
            return Err(NoteError::WrongToken { note_id, remaining });
        }

        if remaining == 0 {
            crate::tlog!(
                "notes: {} unlocked for the last time",
                logging::note_id(&note_id.to_string())
            );
        } else {
            crate::tlog!(
                "notes: {} unlocked, {} left",
                logging::note_id(&note_id.to_string()),
                remaining
            );
        }

        Ok(SealedNote {
            note_id,
            cipher_text: row.cipher_text,
            auth_tag: row.auth_tag,
            iv: row.iv,
            salt: row.salt,
            expires_at: row.expires_at,
            remaining_unlocks: remaining,
        })
    }

    /// Drop every expired note. Returns how many were removed.
    pub async fn purge_expired(&self) -> Result<usize, NoteError> {
        self.purge_expired_at(now_secs()).await
    }

    pub(crate) async fn purge_expired_at(&self, now: u64) -> Result<usize, NoteError> {
        let purged = self.storage.lock().await.delete_expired_notes(now)?;
        Ok(purged)
    }

    pub async fn len(&self) -> Result<usize, NoteError> {
        Ok(self.storage.lock().await.count_notes()?)
    }
}
