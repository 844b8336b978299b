//! Reply cooldown rows

use super::Database;
use crate::cooldown::CooldownRepository;
use anyhow::{Context, Result};
use rusqlite::{params, OptionalExtension};

impl CooldownRepository for Database {
    fn last_reply_at(&self, conversation_id: &str, persona_key: &str) -> Result<Option<i64>> {
        let conn = self.conn()?;
        let at = conn
            .query_row(
                "SELECT last_reply_at FROM reply_cooldowns
                 WHERE conversation_id = ?1 AND persona_id = ?2",
                params![conversation_id, persona_key],
                |row| row.get(0),
            )
            .optional()
            .context("failed to query cooldown")?;
        Ok(at)
    }

    fn record_reply_at(&self, conversation_id: &str, persona_key: &str, at: i64) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO reply_cooldowns (conversation_id, persona_id, last_reply_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(conversation_id, persona_id)
             DO UPDATE SET last_reply_at = MAX(last_reply_at, excluded.last_reply_at)",
            params![conversation_id, persona_key, at],
        )
        .context("failed to record cooldown")?;
        Ok(())
    }
}
