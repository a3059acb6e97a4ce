use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension};
use std::collections::BTreeSet;
use std::path::Path;
use substrate_core::{Message, Result, SubstrateError};
use tracing::info;
use uuid::Uuid;

use crate::archival::{ArchivalEntry, MemoryCategory};
use crate::core_memory::CoreBlock;

fn db_err(e: impl std::fmt::Display) -> SubstrateError {
    SubstrateError::Memory(e.to_string())
}

/// SQLite persistence for core blocks, archival entries and session histories.
pub struct MemoryStore {
    db: Mutex<Connection>,
}

/// A persisted session summary.
#[derive(Debug, Clone)]
pub struct SessionRow {
    pub id: String,
    pub message_count: usize,
    pub updated_at: String,
}

impl MemoryStore {
    /// Open or create the memory database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        info!(?path, "opening memory store");

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path).map_err(db_err)?;

        // WAL for concurrent reads
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(db_err)?;

        Self::init(conn)
    }

    /// Open an in-memory database (for tests).
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory().map_err(db_err)?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS core_blocks (
                label TEXT PRIMARY KEY,
                content TEXT NOT NULL,
                description TEXT,
                char_limit INTEGER NOT NULL,
                read_only INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS archival_entries (
                id TEXT PRIMARY KEY,
                content TEXT NOT NULL,
                category TEXT NOT NULL,
                importance INTEGER NOT NULL,
                tags TEXT NOT NULL DEFAULT '[]',
                embedding BLOB,
                excluded INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_archival_category ON archival_entries(category);

            CREATE TABLE IF NOT EXISTS session_messages (
                session_id TEXT PRIMARY KEY,
                messages_json TEXT NOT NULL,
                message_count INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT NOT NULL
            );
            ",
        )
        .map_err(db_err)?;

        Ok(Self {
            db: Mutex::new(conn),
        })
    }

    // ── Core blocks ────────────────────────────────────────────

    /// Upsert a block. Row order (creation order) is preserved across updates.
    pub fn save_block(&self, block: &CoreBlock) -> Result<()> {
        let db = self.db.lock();
        db.execute(
            "INSERT INTO core_blocks (label, content, description, char_limit, read_only, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(label) DO UPDATE SET
                content = excluded.content,
                description = excluded.description,
                char_limit = excluded.char_limit,
                read_only = excluded.read_only,
                updated_at = excluded.updated_at",
            rusqlite::params![
                block.label,
                block.content,
                block.description,
                block.limit as i64,
                block.read_only as i32,
                block.updated_at.to_rfc3339(),
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    pub fn load_blocks(&self) -> Result<Vec<CoreBlock>> {
        let db = self.db.lock();
        let mut stmt = db
            .prepare(
                "SELECT label, content, description, char_limit, read_only, updated_at
                 FROM core_blocks ORDER BY rowid",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map([], |row| {
                Ok(CoreBlock {
                    label: row.get(0)?,
                    content: row.get(1)?,
                    description: row.get(2)?,
                    limit: row.get::<_, i64>(3)? as usize,
                    read_only: row.get::<_, i32>(4)? != 0,
                    updated_at: parse_ts(&row.get::<_, String>(5)?),
                })
            })
            .map_err(db_err)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(db_err)?;
        Ok(rows)
    }

    // ── Archival entries ───────────────────────────────────────

    pub fn insert_archival(&self, entry: &ArchivalEntry) -> Result<()> {
        let tags = serde_json::to_string(&entry.tags)?;
        let blob = (!entry.embedding.is_empty()).then(|| encode_embedding(&entry.embedding));
        let db = self.db.lock();
        db.execute(
            "INSERT INTO archival_entries (id, content, category, importance, tags, embedding, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![
                entry.id.to_string(),
                entry.content,
                entry.category.as_str(),
                entry.importance as i32,
                tags,
                blob,
                entry.timestamp.to_rfc3339(),
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    pub fn set_archival_excluded(&self, id: Uuid, excluded: bool) -> Result<()> {
        let db = self.db.lock();
        let rows = db
            .execute(
                "UPDATE archival_entries SET excluded = ?2 WHERE id = ?1",
                rusqlite::params![id.to_string(), excluded as i32],
            )
            .map_err(db_err)?;
        if rows == 0 {
            return Err(SubstrateError::EntryNotFound(id.to_string()));
        }
        Ok(())
    }

    /// Load every archival entry with its exclusion flag, oldest first.
    pub fn load_archival(&self) -> Result<Vec<(ArchivalEntry, bool)>> {
        type Raw = (String, String, String, i32, String, Option<Vec<u8>>, i32, String);

        let raw: Vec<Raw> = {
            let db = self.db.lock();
            let mut stmt = db
                .prepare(
                    "SELECT id, content, category, importance, tags, embedding, excluded, created_at
                     FROM archival_entries ORDER BY created_at, rowid",
                )
                .map_err(db_err)?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                        row.get(6)?,
                        row.get(7)?,
                    ))
                })
                .map_err(db_err)?
                .collect::<std::result::Result<Vec<Raw>, _>>()
                .map_err(db_err)?;
            rows
        };

        raw.into_iter()
            .map(
                |(id, content, category, importance, tags, blob, excluded, created_at)| -> Result<(ArchivalEntry, bool)> {
                let entry = ArchivalEntry {
                    id: Uuid::parse_str(&id).map_err(db_err)?,
                    content,
                    category: category.parse::<MemoryCategory>()?,
                    importance: importance.clamp(1, 10) as u8,
                    tags: serde_json::from_str::<BTreeSet<String>>(&tags)?,
                    embedding: blob.map(|b| decode_embedding(&b)).unwrap_or_default(),
                    timestamp: parse_ts(&created_at),
                };
                Ok((entry, excluded != 0))
            })
            .collect()
    }

    // ── Session histories ──────────────────────────────────────

    /// Persist a session's full message history as a JSON blob.
    pub fn save_session_messages(&self, session_id: &str, messages: &[Message]) -> Result<()> {
        let json = serde_json::to_string(messages)?;
        let db = self.db.lock();
        db.execute(
            "INSERT INTO session_messages (session_id, messages_json, message_count, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(session_id) DO UPDATE SET
                messages_json = excluded.messages_json,
                message_count = excluded.message_count,
                updated_at = excluded.updated_at",
            rusqlite::params![session_id, json, messages.len() as i64, Utc::now().to_rfc3339()],
        )
        .map_err(db_err)?;
        Ok(())
    }

    /// Load a session's history; unknown sessions have an empty history.
    pub fn load_session_messages(&self, session_id: &str) -> Result<Vec<Message>> {
        let json: Option<String> = {
            let db = self.db.lock();
            db.query_row(
                "SELECT messages_json FROM session_messages WHERE session_id = ?1",
                rusqlite::params![session_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?
        };
        match json {
            Some(j) => Ok(serde_json::from_str(&j)?),
            None => Ok(Vec::new()),
        }
    }

    /// Most recently updated sessions first.
    pub fn list_sessions(&self, limit: usize) -> Result<Vec<SessionRow>> {
        let db = self.db.lock();
        let mut stmt = db
            .prepare(
                "SELECT session_id, message_count, updated_at FROM session_messages
                 ORDER BY updated_at DESC LIMIT ?1",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(rusqlite::params![limit as i64], |row| {
                Ok(SessionRow {
                    id: row.get(0)?,
                    message_count: row.get::<_, i64>(1)? as usize,
                    updated_at: row.get(2)?,
                })
            })
            .map_err(db_err)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(db_err)?;
        Ok(rows)
    }

    pub fn delete_session(&self, session_id: &str) -> Result<bool> {
        let db = self.db.lock();
        let rows = db
            .execute(
                "DELETE FROM session_messages WHERE session_id = ?1",
                rusqlite::params![session_id],
            )
            .map_err(db_err)?;
        Ok(rows > 0)
    }
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

/// Little-endian f32 blob.
pub fn encode_embedding(v: &[f32]) -> Vec<u8> {
    v.iter().flat_map(|f| f.to_le_bytes()).collect()
}

/// Inverse of [`encode_embedding`]; a trailing partial float is ignored.
pub fn decode_embedding(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_embedding_blob_is_little_endian() {
        let blob = encode_embedding(&[1.0, -2.5]);
        assert_eq!(blob.len(), 8);
        assert_eq!(&blob[..4], &1.0f32.to_le_bytes());
        assert_eq!(decode_embedding(&blob), vec![1.0, -2.5]);
        assert_eq!(decode_embedding(&blob[..7]), vec![1.0]);
    }

    #[test]
    fn test_unknown_session_is_empty() {
        let store = MemoryStore::open_in_memory().unwrap();
        assert!(store.load_session_messages("nobody").unwrap().is_empty());
        assert!(!store.delete_session("nobody").unwrap());
    }

    #[test]
    fn test_exclude_unknown_entry_fails() {
        let store = MemoryStore::open_in_memory().unwrap();
        assert!(matches!(
            store.set_archival_excluded(Uuid::new_v4(), true),
            Err(SubstrateError::EntryNotFound(_))
        ));
    }
}
