//! Minimum spacing between persona replies.
//!
//! The engagement lock only covers a reply while it is being generated.
//! The cooldown covers the stretch right after a reply lands, when the lock
//! is already gone but further triggers could otherwise fire another reply
//! before any human has spoken.
//!
//! Storage errors here are treated as "not in cooldown". This is the
//! opposite of the lock manager, which fails closed: a flaky store must not
//! silence personas indefinitely, and the worst case is one extra reply.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::Deserialize;

use crate::db::now_ms;

/// Storage for last-reply timestamps.
///
/// `persona_key` is empty when cooldowns are tracked per conversation.
pub trait CooldownRepository: Send + Sync {
    fn last_reply_at(&self, conversation_id: &str, persona_key: &str) -> Result<Option<i64>>;

    /// Record a reply; must never move the stored time backwards
    fn record_reply_at(&self, conversation_id: &str, persona_key: &str, at: i64) -> Result<()>;
}

/// What a cooldown is keyed by
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CooldownScope {
    /// Any persona's reply cools the whole conversation
    #[default]
    Conversation,
    /// Each persona cools down independently
    Persona,
}

#[derive(Clone)]
pub struct CooldownTracker {
    repo: Arc<dyn CooldownRepository>,
    window: Duration,
    scope: CooldownScope,
}

impl CooldownTracker {
    pub const DEFAULT_WINDOW: Duration = Duration::from_secs(30);

    pub fn new(repo: Arc<dyn CooldownRepository>, window: Duration, scope: CooldownScope) -> Self {
        Self {
            repo,
            window,
            scope,
        }
    }

    fn key<'a>(&self, persona_id: &'a str) -> &'a str {
        match self.scope {
            CooldownScope::Conversation => "",
            CooldownScope::Persona => persona_id,
        }
    }

    pub fn is_in_cooldown(&self, conversation_id: &str, persona_id: &str) -> bool {
        match self.repo.last_reply_at(conversation_id, self.key(persona_id)) {
            Ok(Some(last)) => {
                let window_ms = i64::try_from(self.window.as_millis()).unwrap_or(i64::MAX);
                now_ms() < last.saturating_add(window_ms)
            }
            Ok(None) => false,
            Err(e) => {
                tracing::warn!(
                    conversation = conversation_id,
                    "cooldown lookup failed, treating as not in cooldown: {:#}",
                    e
                );
                false
            }
        }
    }

    pub fn record_reply(&self, conversation_id: &str, persona_id: &str) {
        self.record_reply_at(conversation_id, persona_id, now_ms());
    }

    pub fn record_reply_at(&self, conversation_id: &str, persona_id: &str, at: i64) {
        if let Err(e) = self
            .repo
            .record_reply_at(conversation_id, self.key(persona_id), at)
        {
            tracing::warn!(conversation = conversation_id, "failed to record cooldown: {:#}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    struct BrokenRepo;

    impl CooldownRepository for BrokenRepo {
        fn last_reply_at(&self, _: &str, _: &str) -> Result<Option<i64>> {
            anyhow::bail!("database is locked")
        }
        fn record_reply_at(&self, _: &str, _: &str, _: i64) -> Result<()> {
            anyhow::bail!("database is locked")
        }
    }

    fn tracker(scope: CooldownScope) -> Result<CooldownTracker> {
        let db = Arc::new(Database::in_memory()?);
        Ok(CooldownTracker::new(db, CooldownTracker::DEFAULT_WINDOW, scope))
    }

    #[test]
    fn test_fresh_conversation_not_cooling() -> Result<()> {
        let cooldowns = tracker(CooldownScope::Conversation)?;
        assert!(!cooldowns.is_in_cooldown("lobby", "p-1"));
        Ok(())
    }

    #[test]
    fn test_recent_reply_cools_conversation() -> Result<()> {
        let cooldowns = tracker(CooldownScope::Conversation)?;
        cooldowns.record_reply("lobby", "p-1");

        assert!(cooldowns.is_in_cooldown("lobby", "p-1"));
        assert!(cooldowns.is_in_cooldown("lobby", "p-2"));
        assert!(!cooldowns.is_in_cooldown("other", "p-1"));
        Ok(())
    }

    #[test]
    fn test_per_persona_scope() -> Result<()> {
        let cooldowns = tracker(CooldownScope::Persona)?;
        cooldowns.record_reply("lobby", "p-1");

        assert!(cooldowns.is_in_cooldown("lobby", "p-1"));
        assert!(!cooldowns.is_in_cooldown("lobby", "p-2"));
        Ok(())
    }

    #[test]
    fn test_window_elapses() -> Result<()> {
        let cooldowns = tracker(CooldownScope::Conversation)?;
        let long_ago = now_ms() - CooldownTracker::DEFAULT_WINDOW.as_millis() as i64 - 1;
        cooldowns.record_reply_at("lobby", "p-1", long_ago);
        assert!(!cooldowns.is_in_cooldown("lobby", "p-1"));
        Ok(())
    }

    #[test]
    fn test_older_record_does_not_shorten_cooldown() -> Result<()> {
        let cooldowns = tracker(CooldownScope::Conversation)?;
        cooldowns.record_reply("lobby", "p-1");
        cooldowns.record_reply_at("lobby", "p-1", 0);
        assert!(cooldowns.is_in_cooldown("lobby", "p-1"));
        Ok(())
    }

    #[test]
    fn test_huge_window_saturates() -> Result<()> {
        let db = Arc::new(Database::in_memory()?);
        let cooldowns =
            CooldownTracker::new(db, Duration::from_secs(u64::MAX), CooldownScope::Conversation);
        cooldowns.record_reply_at("lobby", "p-1", 0);
        assert!(cooldowns.is_in_cooldown("lobby", "p-1"));
        Ok(())
    }

    #[test]
    fn test_storage_error_fails_open() {
        let cooldowns = CooldownTracker::new(
            Arc::new(BrokenRepo),
            CooldownTracker::DEFAULT_WINDOW,
            CooldownScope::Conversation,
        );
        cooldowns.record_reply("lobby", "p-1");
        assert!(!cooldowns.is_in_cooldown("lobby", "p-1"));
    }
}
