//! Persona operations
//!
//! Personas are configured by humans (see `murmur-admin`). The engagement
//! path only reads them and bumps `last_reply_at`.

use super::{new_id, now_ms, Database};
use anyhow::{Context, Result};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};

/// How a persona decides to speak
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngagementMode {
    /// Never replies
    Off,
    /// Replies only when invoked or @mentioned
    MentionOnly,
    /// Replies on a weighted random draw
    Probabilistic,
}

impl EngagementMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngagementMode::Off => "off",
            EngagementMode::MentionOnly => "mention_only",
            EngagementMode::Probabilistic => "probabilistic",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "off" => Some(EngagementMode::Off),
            "mention_only" | "mention-only" | "mention" => Some(EngagementMode::MentionOnly),
            "probabilistic" => Some(EngagementMode::Probabilistic),
            _ => None,
        }
    }
}

/// A persona attached to one conversation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Persona {
    pub id: String,
    pub conversation_id: String,
    pub name: String,
    pub display_name: Option<String>,
    pub engagement_mode: EngagementMode,
    /// Base reply probability, 0..=100
    pub engagement_percent: u8,
    pub personality: Option<String>,
    pub tone: Option<String>,
    pub last_reply_at: Option<i64>,
    pub created_at: i64,
}

impl Persona {
    /// Create a new persona with defaults
    pub fn new(conversation_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: new_id(),
            conversation_id: conversation_id.into(),
            name: name.into(),
            display_name: None,
            engagement_mode: EngagementMode::Probabilistic,
            engagement_percent: 25,
            personality: None,
            tone: None,
            last_reply_at: None,
            created_at: now_ms(),
        }
    }

    /// Name shown in transcripts
    pub fn label(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.name)
    }

    /// Whether `text` addresses this persona with `@name`
    pub fn is_mentioned_in(&self, text: &str) -> bool {
        let handle = format!("@{}", self.name.to_lowercase());
        let lower = text.to_lowercase();
        lower.match_indices(&handle).any(|(at, _)| {
            // the handle must not run on into a longer name
            lower[at + handle.len()..]
                .chars()
                .next()
                .map_or(true, |c| !(c.is_alphanumeric() || c == '_' || c == '-'))
        })
    }
}

/// Persona store as seen by the engagement path
pub trait PersonaStore: Send + Sync {
    fn get_persona(&self, id: &str) -> Result<Option<Persona>>;

    fn list_personas(&self, conversation_id: &str) -> Result<Vec<Persona>>;

    fn set_last_reply_at(&self, persona_id: &str, at: i64) -> Result<()>;
}

const PERSONA_COLUMNS: &str = "id, conversation_id, name, display_name, engagement_mode, \
                               engagement_percent, personality, tone, last_reply_at, created_at";

impl Database {
    fn persona_from_sqlite(row: &rusqlite::Row) -> rusqlite::Result<Persona> {
        let mode: String = row.get(4)?;
        let percent: i64 = row.get(5)?;
        Ok(Persona {
            id: row.get(0)?,
            conversation_id: row.get(1)?,
            name: row.get(2)?,
            display_name: row.get(3)?,
            engagement_mode: EngagementMode::parse(&mode).unwrap_or(EngagementMode::Off),
            engagement_percent: percent.clamp(0, 100) as u8,
            personality: row.get(6)?,
            tone: row.get(7)?,
            last_reply_at: row.get(8)?,
            created_at: row.get(9)?,
        })
    }

    /// Insert a new persona
    pub fn insert_persona(&self, persona: &Persona) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO personas (
                id, conversation_id, name, display_name, engagement_mode,
                engagement_percent, personality, tone, last_reply_at, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
            params![
                persona.id,
                persona.conversation_id,
                persona.name,
                persona.display_name,
                persona.engagement_mode.as_str(),
                persona.engagement_percent.min(100),
                persona.personality,
                persona.tone,
                persona.last_reply_at,
                persona.created_at,
            ],
        )
        .with_context(|| format!("failed to insert persona {}", persona.name))?;
        Ok(())
    }

    /// Change a persona's engagement configuration
    pub fn update_persona_engagement(
        &self,
        persona_id: &str,
        mode: EngagementMode,
        percent: Option<u8>,
    ) -> Result<bool> {
        let conn = self.conn()?;
        let changed = conn
            .execute(
                "UPDATE personas
                 SET engagement_mode = ?2,
                     engagement_percent = COALESCE(?3, engagement_percent)
                 WHERE id = ?1",
                params![persona_id, mode.as_str(), percent.map(|p| p.min(100))],
            )
            .context("failed to update persona engagement")?;
        Ok(changed > 0)
    }

    /// Look up a persona by its @name within a conversation
    pub fn get_persona_by_name(&self, conversation_id: &str, name: &str) -> Result<Option<Persona>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {PERSONA_COLUMNS} FROM personas WHERE conversation_id = ?1 AND name = ?2"
            ))
            .context("failed to prepare persona name query")?;

        let persona = stmt
            .query_row(params![conversation_id, name], Self::persona_from_sqlite)
            .optional()
            .context("failed to query persona by name")?;

        Ok(persona)
    }

    pub fn delete_persona(&self, persona_id: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM personas WHERE id = ?1", params![persona_id])
            .context("failed to delete persona")?;
        Ok(())
    }
}

impl PersonaStore for Database {
    fn get_persona(&self, id: &str) -> Result<Option<Persona>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!("SELECT {PERSONA_COLUMNS} FROM personas WHERE id = ?1"))
            .context("failed to prepare persona query")?;

        let persona = stmt
            .query_row(params![id], Self::persona_from_sqlite)
            .optional()
            .context("failed to query persona")?;

        Ok(persona)
    }

    fn list_personas(&self, conversation_id: &str) -> Result<Vec<Persona>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {PERSONA_COLUMNS} FROM personas
                 WHERE conversation_id = ?1 ORDER BY created_at, id"
            ))
            .context("failed to prepare personas query")?;

        let personas = stmt
            .query(params![conversation_id])?
            .mapped(Self::persona_from_sqlite)
            .collect::<Result<Vec<_>, _>>()
            .context("failed to list personas")?;

        Ok(personas)
    }

    fn set_last_reply_at(&self, persona_id: &str, at: i64) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE personas
             SET last_reply_at = MAX(COALESCE(last_reply_at, 0), ?2)
             WHERE id = ?1",
            params![persona_id, at],
        )
        .context("failed to update last_reply_at")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_persona_crud() -> Result<()> {
        let db = Database::in_memory()?;

        let mut persona = Persona::new("lobby", "sage");
        persona.display_name = Some("The Sage".to_string());
        persona.personality = Some("patient, curious".to_string());
        persona.engagement_percent = 40;
        db.insert_persona(&persona)?;

        let fetched = db.get_persona(&persona.id)?.expect("persona exists");
        assert_eq!(fetched.name, "sage");
        assert_eq!(fetched.label(), "The Sage");
        assert_eq!(fetched.engagement_mode, EngagementMode::Probabilistic);
        assert_eq!(fetched.engagement_percent, 40);
        assert!(fetched.last_reply_at.is_none());

        let by_name = db.get_persona_by_name("lobby", "sage")?.expect("by name");
        assert_eq!(by_name.id, persona.id);

        assert_eq!(db.list_personas("lobby")?.len(), 1);
        assert!(db.list_personas("elsewhere")?.is_empty());

        db.delete_persona(&persona.id)?;
        assert!(db.get_persona(&persona.id)?.is_none());
        Ok(())
    }

    #[test]
    fn test_duplicate_name_rejected() -> Result<()> {
        let db = Database::in_memory()?;
        db.insert_persona(&Persona::new("lobby", "sage"))?;
        assert!(db.insert_persona(&Persona::new("lobby", "sage")).is_err());
        db.insert_persona(&Persona::new("other", "sage"))?;
        Ok(())
    }

    #[test]
    fn test_update_engagement() -> Result<()> {
        let db = Database::in_memory()?;
        let persona = Persona::new("lobby", "sage");
        db.insert_persona(&persona)?;

        assert!(db.update_persona_engagement(&persona.id, EngagementMode::MentionOnly, None)?);
        let fetched = db.get_persona(&persona.id)?.expect("exists");
        assert_eq!(fetched.engagement_mode, EngagementMode::MentionOnly);
        assert_eq!(fetched.engagement_percent, 25);

        db.update_persona_engagement(&persona.id, EngagementMode::Probabilistic, Some(250))?;
        let fetched = db.get_persona(&persona.id)?.expect("exists");
        assert_eq!(fetched.engagement_percent, 100);

        assert!(!db.update_persona_engagement("missing", EngagementMode::Off, None)?);
        Ok(())
    }

    #[test]
    fn test_last_reply_at_never_moves_backwards() -> Result<()> {
        let db = Database::in_memory()?;
        let persona = Persona::new("lobby", "sage");
        db.insert_persona(&persona)?;

        db.set_last_reply_at(&persona.id, 2_000)?;
        db.set_last_reply_at(&persona.id, 1_000)?;
        let fetched = db.get_persona(&persona.id)?.expect("exists");
        assert_eq!(fetched.last_reply_at, Some(2_000));
        Ok(())
    }

    #[test]
    fn test_mention_detection() {
        let persona = Persona::new("lobby", "sage");
        assert!(persona.is_mentioned_in("hey @sage what do you think"));
        assert!(persona.is_mentioned_in("@Sage?"));
        assert!(persona.is_mentioned_in("thoughts, @sage."));
        assert!(!persona.is_mentioned_in("@sagebrush is a plant"));
        assert!(!persona.is_mentioned_in("sage advice"));
    }

    #[test]
    fn test_mode_parse() {
        for mode in [
            EngagementMode::Off,
            EngagementMode::MentionOnly,
            EngagementMode::Probabilistic,
        ] {
            assert_eq!(EngagementMode::parse(mode.as_str()), Some(mode));
        }
        assert_eq!(EngagementMode::parse("mention-only"), Some(EngagementMode::MentionOnly));
        assert_eq!(EngagementMode::parse("loud"), None);
    }
}
