//! Engagement lock rows
//!
//! One row per conversation at most, guaranteed by the primary key. The
//! insert either lands or conflicts; there is no read-then-write.

use super::Database;
use crate::lock::LockRepository;
use anyhow::{Context, Result};
use rusqlite::{params, OptionalExtension};
use serde::Serialize;

/// A stored lock row
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LockRow {
    pub conversation_id: String,
    pub holder_id: String,
    pub expires_at: i64,
}

impl Database {
    fn lock_from_sqlite(row: &rusqlite::Row) -> rusqlite::Result<LockRow> {
        Ok(LockRow {
            conversation_id: row.get(0)?,
            holder_id: row.get(1)?,
            expires_at: row.get(2)?,
        })
    }

    /// Current lock row for a conversation, expired or not
    pub fn get_lock(&self, conversation_id: &str) -> Result<Option<LockRow>> {
        let conn = self.conn()?;
        let lock = conn
            .query_row(
                "SELECT conversation_id, holder_id, expires_at
                 FROM engagement_locks WHERE conversation_id = ?1",
                params![conversation_id],
                Self::lock_from_sqlite,
            )
            .optional()
            .context("failed to query lock")?;
        Ok(lock)
    }

    /// All lock rows, for the admin CLI
    pub fn list_locks(&self) -> Result<Vec<LockRow>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT conversation_id, holder_id, expires_at
                 FROM engagement_locks ORDER BY expires_at",
            )
            .context("failed to prepare locks query")?;

        let locks = stmt
            .query([])?
            .mapped(Self::lock_from_sqlite)
            .collect::<Result<Vec<_>, _>>()
            .context("failed to list locks")?;

        Ok(locks)
    }
}

impl LockRepository for Database {
    fn try_insert_lock(&self, conversation_id: &str, holder_id: &str, expires_at: i64) -> Result<bool> {
        let conn = self.conn()?;
        let inserted = conn
            .execute(
                "INSERT INTO engagement_locks (conversation_id, holder_id, expires_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(conversation_id) DO NOTHING",
                params![conversation_id, holder_id, expires_at],
            )
            .context("failed to insert lock")?;
        Ok(inserted == 1)
    }

    fn delete_expired_lock(&self, conversation_id: &str, now: i64) -> Result<bool> {
        let conn = self.conn()?;
        let deleted = conn
            .execute(
                "DELETE FROM engagement_locks WHERE conversation_id = ?1 AND expires_at <= ?2",
                params![conversation_id, now],
            )
            .context("failed to delete expired lock")?;
        Ok(deleted > 0)
    }

    fn delete_lock_if_holder(&self, conversation_id: &str, holder_id: &str) -> Result<bool> {
        let conn = self.conn()?;
        let deleted = conn
            .execute(
                "DELETE FROM engagement_locks WHERE conversation_id = ?1 AND holder_id = ?2",
                params![conversation_id, holder_id],
            )
            .context("failed to release lock")?;
        Ok(deleted > 0)
    }
}
