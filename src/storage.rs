//! SQLite storage layer for sealed notes.
//!
//! Notes are opaque client-side-encrypted blobs with an expiry and a budget
//! of unlock attempts. The relay never sees the note key.

use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::ids::NoteId;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum StorageError {
    Sqlite(rusqlite::Error),
    Io(std::io::Error),
    AlreadyExists(String),
    Corrupt(String),
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageError::Sqlite(e) => write!(f, "sqlite error: {e}"),
            StorageError::Io(e) => write!(f, "io error: {e}"),
            StorageError::AlreadyExists(msg) => write!(f, "already exists: {msg}"),
            StorageError::Corrupt(msg) => write!(f, "corrupt row: {msg}"),
        }
    }
}

impl std::error::Error for StorageError {}

impl From<rusqlite::Error> for StorageError {
    fn from(e: rusqlite::Error) -> Self {
        StorageError::Sqlite(e)
    }
}

impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        StorageError::Io(e)
    }
}

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

/// Note row stored in the database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoteRow {
    pub note_id: NoteId,
    pub cipher_text: Vec<u8>,
    pub auth_tag: Vec<u8>,
    pub iv: Vec<u8>,
    pub salt: Vec<u8>,
    /// SHA-256 of the client's unlock token.
    pub verifier: Vec<u8>,
    /// Unix seconds after which the note is gone.
    pub expires_at: u64,
    pub remaining_unlocks: u32,
    pub created_at: u64,
}

// ---------------------------------------------------------------------------
// Storage handle
// ---------------------------------------------------------------------------

/// Main storage handle wrapping a SQLite connection.
pub struct Storage {
    conn: Connection,
}

impl Storage {
    /// Open or create a database at the given path. Creates schema if needed.
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        let storage = Self { conn };
        storage.create_schema()?;
        Ok(storage)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        let storage = Self { conn };
        storage.create_schema()?;
        Ok(storage)
    }

    fn create_schema(&self) -> Result<(), StorageError> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS notes (
                note_id           TEXT PRIMARY KEY,
                cipher_text       BLOB NOT NULL,
                auth_tag          BLOB NOT NULL,
                iv                BLOB NOT NULL,
                salt              BLOB NOT NULL,
                verifier          BLOB NOT NULL,
                expires_at        INTEGER NOT NULL,
                remaining_unlocks INTEGER NOT NULL,
                created_at        INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_notes_expires_at ON notes(expires_at);
            ",
        )?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Notes CRUD
    // -----------------------------------------------------------------------

    /// Insert a new note. Fails with `AlreadyExists` if the id is taken.
    pub fn insert_note(&self, row: &NoteRow) -> Result<(), StorageError> {
        let inserted = self.conn.execute(
            "INSERT OR IGNORE INTO notes
             (note_id, cipher_text, auth_tag, iv, salt, verifier, expires_at,
              remaining_unlocks, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                row.note_id.to_string(),
                row.cipher_text,
                row.auth_tag,
                row.iv,
                row.salt,
                row.verifier,
                row.expires_at as i64,
                row.remaining_unlocks as i64,
                row.created_at as i64,
            ],
        )?;
        if inserted == 0 {
            return Err(StorageError::AlreadyExists(row.note_id.to_string()));
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn has_note(&self, note_id: NoteId) -> Result<bool, StorageError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM notes WHERE note_id = ?1",
            params![note_id.to_string()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn get_note(&self, note_id: NoteId) -> Result<Option<NoteRow>, StorageError> {
        let mut stmt = self.conn.prepare(
            "SELECT note_id, cipher_text, auth_tag, iv, salt, verifier, expires_at,
                    remaining_unlocks, created_at
             FROM notes WHERE note_id = ?1",
        )?;
        let row = stmt
            .query_row(params![note_id.to_string()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    NoteRow {
                        note_id,
                        cipher_text: row.get(1)?,
                        auth_tag: row.get(2)?,
                        iv: row.get(3)?,
                        salt: row.get(4)?,
                        verifier: row.get(5)?,
                        expires_at: row.get::<_, i64>(6)? as u64,
                        remaining_unlocks: row.get::<_, i64>(7)?.max(0) as u32,
                        created_at: row.get::<_, i64>(8)? as u64,
                    },
                ))
            })
            .optional()?;

        match row {
            Some((stored_id, note)) if stored_id.parse::<NoteId>().ok() == Some(note_id) => {
                Ok(Some(note))
            }
            Some((stored_id, _)) => Err(StorageError::Corrupt(stored_id)),
            None => Ok(None),
        }
    }

    /// Consume one unlock attempt. Returns the attempts left afterwards, or
    /// `None` if the note does not exist.
    pub fn consume_unlock(&self, note_id: NoteId) -> Result<Option<u32>, StorageError> {
        let tx = self.conn.unchecked_transaction()?;
        let remaining: Option<i64> = tx
            .query_row(
                "SELECT remaining_unlocks FROM notes WHERE note_id = ?1",
                params![note_id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        let Some(remaining) = remaining else {
            return Ok(None);
        };

        let left = (remaining - 1).max(0);
        if left == 0 {
            tx.execute(
                "DELETE FROM notes WHERE note_id = ?1",
                params![note_id.to_string()],
            )?;
        } else {
            tx.execute(
                "UPDATE notes SET remaining_unlocks = ?1 WHERE note_id = ?2",
                params![left, note_id.to_string()],
            )?;
        }
        tx.commit()?;
        Ok(Some(left as u32))
    }

    /// Delete every note whose expiry is at or before `now`.
    pub fn delete_expired_notes(&self, now: u64) -> Result<usize, StorageError> {
        let affected = self.conn.execute(
            "DELETE FROM notes WHERE expires_at <= ?1",
            params![now as i64],
        )?;
        Ok(affected)
    }

    pub fn count_notes(&self) -> Result<usize, StorageError> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM notes", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn note(byte: u8, expires_at: u64, unlocks: u32) -> NoteRow {
        NoteRow {
            note_id: NoteId::from_bytes([byte; 16]),
            cipher_text: vec![1, 2, 3],
            auth_tag: vec![4],
            iv: vec![5],
            salt: vec![6],
            verifier: vec![7; 32],
            expires_at,
            remaining_unlocks: unlocks,
            created_at: 100,
        }
    }

    #[test]
    fn test_note_crud() {
        let storage = Storage::open_in_memory().unwrap();
        let row = note(1, 1_000, 3);
        storage.insert_note(&row).unwrap();

        assert!(storage.has_note(row.note_id).unwrap());
        assert_eq!(storage.get_note(row.note_id).unwrap(), Some(row.clone()));
        assert_eq!(storage.get_note(NoteId::from_bytes([9; 16])).unwrap(), None);
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let storage = Storage::open_in_memory().unwrap();
        storage.insert_note(&note(2, 1_000, 1)).unwrap();
        let err = storage.insert_note(&note(2, 2_000, 1)).unwrap_err();
        assert!(matches!(err, StorageError::AlreadyExists(_)));
    }

    #[test]
    fn test_consume_unlock_deletes_at_zero() {
        let storage = Storage::open_in_memory().unwrap();
        let row = note(3, 1_000, 2);
        storage.insert_note(&row).unwrap();

        assert_eq!(storage.consume_unlock(row.note_id).unwrap(), Some(1));
        assert!(storage.has_note(row.note_id).unwrap());
        assert_eq!(storage.consume_unlock(row.note_id).unwrap(), Some(0));
        assert!(!storage.has_note(row.note_id).unwrap());
        assert_eq!(storage.consume_unlock(row.note_id).unwrap(), None);
    }

    #[test]
    fn test_delete_expired_notes() {
        let storage = Storage::open_in_memory().unwrap();
        storage.insert_note(&note(4, 50, 1)).unwrap();
        storage.insert_note(&note(5, 100, 1)).unwrap();
        storage.insert_note(&note(6, 200, 1)).unwrap();

        assert_eq!(storage.delete_expired_notes(100).unwrap(), 2);
        assert_eq!(storage.count_notes().unwrap(), 1);
    }

    #[test]
    fn test_open_on_disk() {
        let ts = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let dir = std::env::temp_dir().join(format!("tandem-storage-{}-{ts}", std::process::id()));
        let path = dir.join("notes.sqlite3");
        {
            let storage = Storage::open(&path).unwrap();
            storage.insert_note(&note(7, 1_000, 1)).unwrap();
        }
        let storage = Storage::open(&path).unwrap();
        assert_eq!(storage.count_notes().unwrap(), 1);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
