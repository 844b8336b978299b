//! Trigger signals and prompt assembly
//!
//! Everything the orchestrator needs to know about a conversation at the
//! moment a message arrives: the scorer's inputs, and the prompt handed to
//! the completion backend.

use std::collections::{BTreeSet, HashMap};
use std::fmt::Write as _;
use std::time::Duration;

use anyhow::Result;

use crate::completion::CompletionRequest;
use crate::db::messages::{Author, Message, MessageStore};
use crate::db::personas::Persona;
use crate::scorer;

/// A qualifying message plus what we derived from its surroundings.
/// Never persisted.
#[derive(Debug, Clone)]
pub struct TriggerEvent {
    pub message: Message,
    /// Messages in the burst window, the trigger included
    pub recent_message_count: u32,
    /// Gap between the trigger and the message before it
    pub since_last_activity: Duration,
}

impl TriggerEvent {
    /// Gather signals for `message` from the store
    pub fn derive(
        messages: &dyn MessageStore,
        message: Message,
        burst_window: Duration,
    ) -> Result<Self> {
        let since_ms = message.created_at - burst_window.as_millis() as i64;
        let recent_message_count =
            messages.count_messages_since(&message.conversation_id, since_ms, message.seq)?;

        let since_last_activity = messages
            .message_before(&message.conversation_id, message.seq)?
            .map(|prev| millis(message.created_at - prev.created_at))
            .unwrap_or(Duration::ZERO);

        Ok(Self {
            message,
            recent_message_count,
            since_last_activity,
        })
    }

    /// Reply probability for one persona
    pub fn score_for(&self, persona: &Persona, now: i64) -> u8 {
        let since_last_reply = persona.last_reply_at.map(|at| millis(now - at));
        scorer::score(
            persona.engagement_percent,
            self.recent_message_count,
            since_last_reply,
            &self.message.content,
            self.since_last_activity,
        )
    }
}

fn millis(ms: i64) -> Duration {
    Duration::from_millis(ms.max(0) as u64)
}

/// Human-friendly age: "just now", "3m ago", "2h ago", "4d ago"
pub fn relative_age(age_ms: i64) -> String {
    let secs = age_ms.max(0) / 1000;
    match secs {
        0..=59 => "just now".to_string(),
        60..=3599 => format!("{}m ago", secs / 60),
        3600..=86_399 => format!("{}h ago", secs / 3600),
        _ => format!("{}d ago", secs / 86_400),
    }
}

/// Build the completion prompt for `persona` from a chronological window.
///
/// `others` are the conversation's other personas, used for naming
/// speakers and listing participants.
pub fn build_request(
    persona: &Persona,
    others: &[Persona],
    window: &[Message],
    now: i64,
) -> CompletionRequest {
    let labels: HashMap<&str, &str> = others
        .iter()
        .chain(std::iter::once(persona))
        .map(|p| (p.id.as_str(), p.label()))
        .collect();

    let mut participants: BTreeSet<String> = others
        .iter()
        .filter(|p| p.id != persona.id)
        .map(|p| p.label().to_string())
        .collect();
    for message in window {
        if let Author::Human(user) = &message.author {
            participants.insert(user.clone());
        }
    }

    let mut system_prompt = format!(
        "You are {}, a participant in a group chat.",
        persona.label()
    );
    if let Some(personality) = persona.personality.as_deref().filter(|s| !s.is_empty()) {
        let _ = write!(system_prompt, " Personality: {}.", personality.trim_end_matches('.'));
    }
    if let Some(tone) = persona.tone.as_deref().filter(|s| !s.is_empty()) {
        let _ = write!(system_prompt, " Tone: {}.", tone.trim_end_matches('.'));
    }
    if !participants.is_empty() {
        let names: Vec<_> = participants.into_iter().collect();
        let _ = write!(system_prompt, " Others in the chat: {}.", names.join(", "));
    }
    system_prompt.push_str(
        " Reply with one short chat message in your own voice. Do not prefix it with your name.",
    );

    let mut transcript = String::new();
    for message in window {
        let speaker = match &message.author {
            Author::Human(user) => user.as_str(),
            Author::Persona(id) => labels.get(id.as_str()).copied().unwrap_or("persona"),
        };
        let _ = writeln!(
            transcript,
            "[{}] {}: {}",
            relative_age(now - message.created_at),
            speaker,
            message.content
        );
    }

    CompletionRequest {
        conversation_id: persona.conversation_id.clone(),
        persona_id: persona.id.clone(),
        system_prompt,
        transcript,
    }
}

/// Tidy generated text: trim, and drop a "Name:" echo the model sometimes adds
pub fn clean_reply(text: &str, persona: &Persona) -> String {
    let trimmed = text.trim();
    for name in [persona.label(), persona.name.as_str()] {
        if let Some(rest) = strip_prefix_ignore_case(trimmed, name) {
            if let Some(rest) = rest.strip_prefix(':') {
                return rest.trim().to_string();
            }
        }
    }
    trimmed.to_string()
}

fn strip_prefix_ignore_case<'a>(text: &'a str, prefix: &str) -> Option<&'a str> {
    let head = text.get(..prefix.len())?;
    head.eq_ignore_ascii_case(prefix).then(|| &text[prefix.len()..])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    const MIN_MS: i64 = 60_000;

    fn sage() -> Persona {
        let mut p = Persona::new("lobby", "sage");
        p.display_name = Some("Sage".to_string());
        p.personality = Some("curious and kind".to_string());
        p.tone = Some("playful".to_string());
        p
    }

    #[test]
    fn test_relative_age() {
        assert_eq!(relative_age(-5), "just now");
        assert_eq!(relative_age(59_000), "just now");
        assert_eq!(relative_age(3 * MIN_MS), "3m ago");
        assert_eq!(relative_age(2 * 60 * MIN_MS), "2h ago");
        assert_eq!(relative_age(4 * 24 * 60 * MIN_MS), "4d ago");
    }

    #[test]
    fn test_derive_signals() -> Result<()> {
        let db = Database::in_memory()?;
        let now = crate::db::now_ms();

        let mut old = Message::human("lobby", "amy", "anyone around");
        old.created_at = now - 40 * MIN_MS;
        db.insert_message(&old)?;

        let mut trigger = Message::human("lobby", "bob", "hello?");
        trigger.created_at = now;
        trigger.seq = db.insert_message(&trigger)?;

        let event = TriggerEvent::derive(&db, trigger, Duration::from_secs(300))?;
        assert_eq!(event.recent_message_count, 1);
        assert_eq!(event.since_last_activity, Duration::from_millis(40 * MIN_MS as u64));

        // 25 base + 30 question + 15 stale
        let mut persona = sage();
        persona.engagement_percent = 25;
        assert_eq!(event.score_for(&persona, now), 70);

        persona.last_reply_at = Some(now - 2 * MIN_MS);
        assert_eq!(event.score_for(&persona, now), 50);
        Ok(())
    }

    #[test]
    fn test_first_message_has_no_gap() -> Result<()> {
        let db = Database::in_memory()?;
        let mut trigger = Message::human("lobby", "amy", "hi");
        trigger.seq = db.insert_message(&trigger)?;

        let event = TriggerEvent::derive(&db, trigger, Duration::from_secs(300))?;
        assert_eq!(event.since_last_activity, Duration::ZERO);
        assert_eq!(event.recent_message_count, 1);
        Ok(())
    }

    #[test]
    fn test_build_request() {
        let persona = sage();
        let mut other = Persona::new("lobby", "critic");
        other.display_name = Some("Critic".to_string());
        let now = 10 * 60 * MIN_MS;

        let mut first = Message::human("lobby", "amy", "what should we cook");
        first.created_at = now - 5 * MIN_MS;
        let mut second = Message::persona("lobby", other.id.clone(), "not soup");
        second.created_at = now - 2 * MIN_MS;
        let mut third = Message::human("lobby", "bob", "why not soup?");
        third.created_at = now;

        let request = build_request(
            &persona,
            &[persona.clone(), other.clone()],
            &[first, second, third],
            now,
        );

        assert_eq!(request.persona_id, persona.id);
        assert!(request.system_prompt.starts_with("You are Sage"));
        assert!(request.system_prompt.contains("Personality: curious and kind."));
        assert!(request.system_prompt.contains("Tone: playful."));
        assert!(request.system_prompt.contains("Others in the chat: Critic, amy, bob."));
        assert_eq!(
            request.transcript,
            "[5m ago] amy: what should we cook\n[2m ago] Critic: not soup\n[just now] bob: why not soup?\n"
        );
    }

    #[test]
    fn test_clean_reply() {
        let persona = sage();
        assert_eq!(clean_reply("  hello there \n", &persona), "hello there");
        assert_eq!(clean_reply("Sage: hello there", &persona), "hello there");
        assert_eq!(clean_reply("sage:hello", &persona), "hello");
        assert_eq!(clean_reply("Sagebrush grows here", &persona), "Sagebrush grows here");
    }
}
