//! Database schema definitions
//!
//! All CREATE TABLE statements for the murmur database.

/// Schema version for migrations
pub const SCHEMA_VERSION: i32 = 1;

/// Complete schema SQL
pub const SCHEMA: &str = r#"
--------------------------------------------------------------------------------
-- PERSONAS
-- Configured autonomous participants. Edited by humans; this service only
-- touches last_reply_at.
--------------------------------------------------------------------------------

CREATE TABLE IF NOT EXISTS personas (
    id TEXT PRIMARY KEY,                    -- UUIDv7
    conversation_id TEXT NOT NULL,
    name TEXT NOT NULL,                     -- @mention handle
    display_name TEXT,
    engagement_mode TEXT NOT NULL DEFAULT 'probabilistic'
        CHECK (engagement_mode IN ('off', 'mention_only', 'probabilistic')),
    engagement_percent INTEGER NOT NULL DEFAULT 25
        CHECK (engagement_percent BETWEEN 0 AND 100),
    personality TEXT,
    tone TEXT,
    last_reply_at INTEGER,                  -- Unix timestamp ms, NULL = never
    created_at INTEGER NOT NULL,
    UNIQUE (conversation_id, name)
);

CREATE INDEX IF NOT EXISTS idx_personas_conversation ON personas(conversation_id);

--------------------------------------------------------------------------------
-- MESSAGES
-- Append-only. Exactly one of author_user_id / author_persona_id is set.
--------------------------------------------------------------------------------

CREATE TABLE IF NOT EXISTS messages (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,  -- insert order, scan cursor
    id TEXT UNIQUE NOT NULL,                -- UUIDv7
    conversation_id TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    content TEXT NOT NULL DEFAULT '',
    media TEXT NOT NULL DEFAULT '[]',       -- JSON array of media references
    author_user_id TEXT,
    author_persona_id TEXT,
    CHECK ((author_user_id IS NULL) <> (author_persona_id IS NULL))
);

CREATE INDEX IF NOT EXISTS idx_messages_conversation ON messages(conversation_id, seq);

--------------------------------------------------------------------------------
-- ENGAGEMENT LOCKS
-- At most one row per conversation. The primary key is the mutual exclusion.
--------------------------------------------------------------------------------

CREATE TABLE IF NOT EXISTS engagement_locks (
    conversation_id TEXT PRIMARY KEY,
    holder_id TEXT NOT NULL,
    expires_at INTEGER NOT NULL             -- Unix timestamp ms
);

--------------------------------------------------------------------------------
-- REPLY COOLDOWNS
-- persona_id is '' when cooldowns are tracked per conversation.
--------------------------------------------------------------------------------

CREATE TABLE IF NOT EXISTS reply_cooldowns (
    conversation_id TEXT NOT NULL,
    persona_id TEXT NOT NULL DEFAULT '',
    last_reply_at INTEGER NOT NULL,
    PRIMARY KEY (conversation_id, persona_id)
);
"#;
