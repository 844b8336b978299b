//! Message operations
//!
//! Messages are append-only. Every message has exactly one author: a human
//! user or a persona. "The conversation's last message is a persona reply"
//! is read straight off the author of the highest `seq`.

use super::{new_id, now_ms, Database};
use anyhow::{Context, Result};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};

/// Who wrote a message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Author {
    Human(String),
    Persona(String),
}

impl Author {
    pub fn is_persona(&self) -> bool {
        matches!(self, Author::Persona(_))
    }

    /// Raw id of whoever wrote the message
    pub fn id(&self) -> &str {
        match self {
            Author::Human(id) | Author::Persona(id) => id,
        }
    }

    fn from_columns(user: Option<String>, persona: Option<String>) -> rusqlite::Result<Self> {
        match (user, persona) {
            (Some(user), None) => Ok(Author::Human(user)),
            (None, Some(persona)) => Ok(Author::Persona(persona)),
            _ => Err(rusqlite::Error::InvalidColumnType(
                6,
                "author".to_string(),
                rusqlite::types::Type::Null,
            )),
        }
    }
}

/// A message in a conversation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Insert order; 0 until stored
    pub seq: i64,
    pub id: String,
    pub conversation_id: String,
    pub created_at: i64,
    pub content: String,
    /// References to generated media (URLs or storage keys)
    pub media: Vec<String>,
    pub author: Author,
}

impl Message {
    fn new(conversation_id: impl Into<String>, author: Author, content: impl Into<String>) -> Self {
        Self {
            seq: 0,
            id: new_id(),
            conversation_id: conversation_id.into(),
            created_at: now_ms(),
            content: content.into(),
            media: vec![],
            author,
        }
    }

    /// Create a message written by a human user
    pub fn human(
        conversation_id: impl Into<String>,
        user_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self::new(conversation_id, Author::Human(user_id.into()), content)
    }

    /// Create a reply written by a persona
    pub fn persona(
        conversation_id: impl Into<String>,
        persona_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self::new(conversation_id, Author::Persona(persona_id.into()), content)
    }

    pub fn is_persona_reply(&self) -> bool {
        self.author.is_persona()
    }
}

/// Message store as seen by the engagement path
pub trait MessageStore: Send + Sync {
    /// Append a message, returning its assigned sequence number
    fn insert_message(&self, message: &Message) -> Result<i64>;

    /// Most recent message in a conversation
    fn latest_message(&self, conversation_id: &str) -> Result<Option<Message>>;

    /// Last `limit` messages, oldest first
    fn recent_messages(&self, conversation_id: &str, limit: usize) -> Result<Vec<Message>>;

    /// Message immediately preceding `seq` in the same conversation
    fn message_before(&self, conversation_id: &str, seq: i64) -> Result<Option<Message>>;

    /// Messages created at or after `since_ms`, up to and including `seq`
    fn count_messages_since(&self, conversation_id: &str, since_ms: i64, seq: i64) -> Result<u32>;

    fn get_message(&self, id: &str) -> Result<Option<Message>>;
}

/// Cross-conversation view used by the polling trigger source
pub trait MessageLog: Send + Sync {
    /// Messages across all conversations with `seq` greater than `after`
    fn messages_after(&self, after: i64, limit: usize) -> Result<Vec<Message>>;

    /// Highest sequence number stored so far (0 when empty)
    fn max_message_seq(&self) -> Result<i64>;
}

const MESSAGE_COLUMNS: &str = "seq, id, conversation_id, created_at, content, media, \
                               author_user_id, author_persona_id";

impl Database {
    fn message_from_sqlite(row: &rusqlite::Row) -> rusqlite::Result<Message> {
        let media: String = row.get(5)?;
        Ok(Message {
            seq: row.get(0)?,
            id: row.get(1)?,
            conversation_id: row.get(2)?,
            created_at: row.get(3)?,
            content: row.get(4)?,
            media: serde_json::from_str(&media).map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, Box::new(e))
            })?,
            author: Author::from_columns(row.get(6)?, row.get(7)?)?,
        })
    }
}

impl MessageLog for Database {
    fn messages_after(&self, after: i64, limit: usize) -> Result<Vec<Message>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages WHERE seq > ?1 ORDER BY seq LIMIT ?2"
            ))
            .context("failed to prepare messages_after query")?;

        let messages = stmt
            .query(params![after, limit as i64])?
            .mapped(Self::message_from_sqlite)
            .collect::<Result<Vec<_>, _>>()
            .context("failed to list messages")?;

        Ok(messages)
    }

    fn max_message_seq(&self) -> Result<i64> {
        let conn = self.conn()?;
        let seq: Option<i64> = conn
            .query_row("SELECT MAX(seq) FROM messages", [], |row| row.get(0))
            .context("failed to query max seq")?;
        Ok(seq.unwrap_or(0))
    }
}

impl MessageStore for Database {
    fn insert_message(&self, message: &Message) -> Result<i64> {
        let media = serde_json::to_string(&message.media)?;
        let (user, persona) = match &message.author {
            Author::Human(id) => (Some(id.as_str()), None),
            Author::Persona(id) => (None, Some(id.as_str())),
        };

        let seq = {
            let conn = self.conn()?;
            conn.execute(
                r#"
                INSERT INTO messages (
                    id, conversation_id, created_at, content, media,
                    author_user_id, author_persona_id
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                "#,
                params![
                    message.id,
                    message.conversation_id,
                    message.created_at,
                    message.content,
                    media,
                    user,
                    persona,
                ],
            )
            .context("failed to insert message")?;
            conn.last_insert_rowid()
        };

        let mut stored = message.clone();
        stored.seq = seq;
        self.feed.publish(stored);

        Ok(seq)
    }

    fn latest_message(&self, conversation_id: &str) -> Result<Option<Message>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE conversation_id = ?1 ORDER BY seq DESC LIMIT 1"
            ))
            .context("failed to prepare latest message query")?;

        let message = stmt
            .query_row(params![conversation_id], Self::message_from_sqlite)
            .optional()
            .context("failed to query latest message")?;

        Ok(message)
    }

    fn recent_messages(&self, conversation_id: &str, limit: usize) -> Result<Vec<Message>> {
        let conn = self.conn()?;
        // Newest N by seq, then flip back to chronological
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM (
                    SELECT * FROM messages
                    WHERE conversation_id = ?1
                    ORDER BY seq DESC
                    LIMIT ?2
                 )
                 ORDER BY seq"
            ))
            .context("failed to prepare recent messages query")?;

        let messages = stmt
            .query(params![conversation_id, limit as i64])?
            .mapped(Self::message_from_sqlite)
            .collect::<Result<Vec<_>, _>>()
            .context("failed to list recent messages")?;

        Ok(messages)
    }

    fn message_before(&self, conversation_id: &str, seq: i64) -> Result<Option<Message>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE conversation_id = ?1 AND seq < ?2
                 ORDER BY seq DESC LIMIT 1"
            ))
            .context("failed to prepare previous message query")?;

        let message = stmt
            .query_row(params![conversation_id, seq], Self::message_from_sqlite)
            .optional()
            .context("failed to query previous message")?;

        Ok(message)
    }

    fn count_messages_since(&self, conversation_id: &str, since_ms: i64, seq: i64) -> Result<u32> {
        let conn = self.conn()?;
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM messages
                 WHERE conversation_id = ?1 AND created_at >= ?2 AND seq <= ?3",
                params![conversation_id, since_ms, seq],
                |row| row.get(0),
            )
            .context("failed to count recent messages")?;
        Ok(count as u32)
    }

    fn get_message(&self, id: &str) -> Result<Option<Message>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"))
            .context("failed to prepare message query")?;

        let message = stmt
            .query_row(params![id], Self::message_from_sqlite)
            .optional()
            .context("failed to query message")?;

        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_latest() -> Result<()> {
        let db = Database::in_memory()?;

        assert!(db.latest_message("lobby")?.is_none());

        let first = Message::human("lobby", "amy", "hello");
        let seq1 = db.insert_message(&first)?;
        let reply = Message::persona("lobby", "p-1", "hi amy");
        let seq2 = db.insert_message(&reply)?;
        assert!(seq2 > seq1);

        let latest = db.latest_message("lobby")?.expect("latest exists");
        assert_eq!(latest.id, reply.id);
        assert_eq!(latest.seq, seq2);
        assert!(latest.is_persona_reply());

        let fetched = db.get_message(&first.id)?.expect("first exists");
        assert_eq!(fetched.author, Author::Human("amy".to_string()));
        assert_eq!(fetched.content, "hello");

        Ok(())
    }

    #[test]
    fn test_recent_messages_chronological() -> Result<()> {
        let db = Database::in_memory()?;
        for i in 0..5 {
            db.insert_message(&Message::human("lobby", "amy", format!("m{i}")))?;
        }
        db.insert_message(&Message::human("elsewhere", "bob", "noise"))?;

        let recent = db.recent_messages("lobby", 3)?;
        let contents: Vec<_> = recent.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m2", "m3", "m4"]);

        Ok(())
    }

    #[test]
    fn test_message_before_and_count() -> Result<()> {
        let db = Database::in_memory()?;
        let a = Message::human("lobby", "amy", "a");
        let seq_a = db.insert_message(&a)?;
        db.insert_message(&Message::human("other", "bob", "x"))?;
        let b = Message::human("lobby", "bob", "b");
        let seq_b = db.insert_message(&b)?;

        let prev = db.message_before("lobby", seq_b)?.expect("has previous");
        assert_eq!(prev.seq, seq_a);
        assert!(db.message_before("lobby", seq_a)?.is_none());

        assert_eq!(db.count_messages_since("lobby", 0, seq_b)?, 2);
        assert_eq!(db.count_messages_since("lobby", 0, seq_a)?, 1);
        assert_eq!(db.count_messages_since("lobby", i64::MAX, seq_b)?, 0);

        Ok(())
    }

    #[test]
    fn test_media_round_trip() -> Result<()> {
        let db = Database::in_memory()?;
        let mut reply = Message::persona("lobby", "p-1", "");
        reply.media = vec!["media/abc.png".to_string()];
        db.insert_message(&reply)?;

        let fetched = db.get_message(&reply.id)?.expect("stored");
        assert_eq!(fetched.media, vec!["media/abc.png".to_string()]);
        Ok(())
    }

    #[test]
    fn test_corrupt_media_is_an_error() -> Result<()> {
        let db = Database::in_memory()?;
        let msg = Message::human("lobby", "amy", "look");
        db.insert_message(&msg)?;
        db.conn()?.execute(
            "UPDATE messages SET media = 'not json' WHERE id = ?1",
            params![msg.id],
        )?;

        assert!(db.get_message(&msg.id).is_err());
        assert!(db.latest_message("lobby").is_err());
        Ok(())
    }

    #[test]
    fn test_author_exactly_one() -> Result<()> {
        let db = Database::in_memory()?;
        let conn = db.conn()?;
        let both = conn.execute(
            "INSERT INTO messages (id, conversation_id, created_at, author_user_id, author_persona_id)
             VALUES ('x', 'lobby', 0, 'amy', 'p-1')",
            [],
        );
        assert!(both.is_err());
        let neither = conn.execute(
            "INSERT INTO messages (id, conversation_id, created_at) VALUES ('y', 'lobby', 0)",
            [],
        );
        assert!(neither.is_err());
        Ok(())
    }

    #[test]
    fn test_messages_after_and_max_seq() -> Result<()> {
        let db = Database::in_memory()?;
        assert_eq!(db.max_message_seq()?, 0);

        let seq1 = db.insert_message(&Message::human("a", "amy", "1"))?;
        db.insert_message(&Message::human("b", "bob", "2"))?;
        db.insert_message(&Message::human("a", "amy", "3"))?;

        let after = db.messages_after(seq1, 10)?;
        assert_eq!(after.len(), 2);
        assert_eq!(after[0].content, "2");
        assert_eq!(db.max_message_seq()?, after[1].seq);

        Ok(())
    }

    #[tokio::test]
    async fn test_insert_publishes_to_feed() -> Result<()> {
        let db = Database::in_memory()?;
        let mut rx = db.feed().subscribe();

        let msg = Message::human("lobby", "amy", "ping");
        let seq = db.insert_message(&msg)?;

        let event = rx.recv().await.expect("event delivered");
        assert_eq!(event.id, msg.id);
        assert_eq!(event.seq, seq);
        Ok(())
    }
}
