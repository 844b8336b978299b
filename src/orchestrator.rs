//! Response orchestration
//!
//! Decides whether a persona replies to a message and, if so, produces at
//! most one reply. Both trigger paths (background sources and direct
//! "respond now" calls) come through [`Orchestrator::maybe_engage`], so
//! they share the per-conversation lock.
//!
//! ```text
//! Idle -> LockHeld -> ContextLoaded -> Generating -> Persisting -> Done
//!           |  guard A: last message is a persona reply -> abort
//!           |  cooldown active                          -> abort
//!                                       guard B: a reply landed while
//!                                       generating      -> abort, discard
//! ```
//!
//! The lock is held as a [`crate::lock::LockGuard`], so every exit path
//! releases it, including a caller dropping the future on timeout.

use std::sync::Arc;
use std::time::Duration;

use opentelemetry::KeyValue;
use tracing::instrument;

use crate::completion::{Completion, CompletionService};
use crate::config::EngagementConfig;
use crate::context::{build_request, clean_reply, TriggerEvent};
use crate::cooldown::CooldownTracker;
use crate::db::messages::{Message, MessageStore};
use crate::db::personas::{EngagementMode, Persona, PersonaStore};
use crate::db::{now_ms, Database};
use crate::lock::LockManager;
use crate::scorer;

/// Get or create the outcome counter
fn outcome_counter() -> opentelemetry::metrics::Counter<u64> {
    static COUNTER: std::sync::OnceLock<opentelemetry::metrics::Counter<u64>> =
        std::sync::OnceLock::new();
    COUNTER
        .get_or_init(|| {
            opentelemetry::global::meter("murmur")
                .u64_counter("murmur.engagement.outcomes")
                .with_description("Engagement evaluations by outcome")
                .build()
        })
        .clone()
}

/// How the evaluation was triggered
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invocation {
    /// A new message seen by a trigger source; personas decide for themselves
    Ambient,
    /// A user asked this persona to respond now
    Direct { persona_id: String },
}

/// Why no reply was produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortReason {
    /// Another evaluation holds the conversation's lock
    Busy,
    /// The conversation's last message is already a persona reply
    ConsecutiveReply,
    Cooldown,
    /// A reply landed while this one was generating; ours was discarded
    RaceDetected,
    /// No persona passed its draw
    Declined,
    NoPersona,
    PersonaDisabled,
    NotHumanTrigger,
    EmptyCompletion,
    CompletionFailed(String),
    TookTooLong,
    PersistFailed(String),
    StoreFailed(String),
}

impl AbortReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            AbortReason::Busy => "busy",
            AbortReason::ConsecutiveReply => "consecutive_reply_blocked",
            AbortReason::Cooldown => "cooldown",
            AbortReason::RaceDetected => "race_detected",
            AbortReason::Declined => "declined",
            AbortReason::NoPersona => "no_persona",
            AbortReason::PersonaDisabled => "persona_disabled",
            AbortReason::NotHumanTrigger => "not_human_trigger",
            AbortReason::EmptyCompletion => "empty_completion",
            AbortReason::CompletionFailed(_) => "completion_failed",
            AbortReason::TookTooLong => "took_too_long",
            AbortReason::PersistFailed(_) => "persist_failed",
            AbortReason::StoreFailed(_) => "store_failed",
        }
    }

    /// True failures, as opposed to guards doing their job
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            AbortReason::EmptyCompletion
                | AbortReason::CompletionFailed(_)
                | AbortReason::TookTooLong
                | AbortReason::PersistFailed(_)
                | AbortReason::StoreFailed(_)
        )
    }
}

impl std::fmt::Display for AbortReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AbortReason::CompletionFailed(e)
            | AbortReason::PersistFailed(e)
            | AbortReason::StoreFailed(e) => write!(f, "{}: {}", self.as_str(), e),
            _ => f.write_str(self.as_str()),
        }
    }
}

/// Result of one evaluation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngageOutcome {
    Replied {
        message_id: String,
        persona_id: String,
    },
    Aborted(AbortReason),
}

impl EngageOutcome {
    pub fn is_reply(&self) -> bool {
        matches!(self, EngageOutcome::Replied { .. })
    }

    pub fn abort_reason(&self) -> Option<&AbortReason> {
        match self {
            EngageOutcome::Aborted(reason) => Some(reason),
            EngageOutcome::Replied { .. } => None,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            EngageOutcome::Replied { .. } => "replied",
            EngageOutcome::Aborted(r) if r.is_failure() => "failure",
            EngageOutcome::Aborted(_) => "guard",
        }
    }

    fn label(&self) -> &'static str {
        match self {
            EngageOutcome::Replied { .. } => "replied",
            EngageOutcome::Aborted(r) => r.as_str(),
        }
    }
}

/// Where in the state machine an evaluation stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Idle,
    LockHeld,
    ContextLoaded,
    Generating,
    Persisting,
}

impl Stage {
    fn as_str(&self) -> &'static str {
        match self {
            Stage::Idle => "idle",
            Stage::LockHeld => "lock_held",
            Stage::ContextLoaded => "context_loaded",
            Stage::Generating => "generating",
            Stage::Persisting => "persisting",
        }
    }
}

fn abort(stage: Stage, reason: AbortReason) -> EngageOutcome {
    tracing::debug!(stage = stage.as_str(), reason = reason.as_str(), "aborting");
    EngageOutcome::Aborted(reason)
}

/// Runs the engagement state machine against the stores and a completion backend
#[derive(Clone)]
pub struct Orchestrator {
    messages: Arc<dyn MessageStore>,
    personas: Arc<dyn PersonaStore>,
    locks: LockManager,
    cooldowns: CooldownTracker,
    completion: Arc<dyn CompletionService>,
    settings: EngagementConfig,
}

impl Orchestrator {
    /// Wire everything to one database
    pub fn new(
        db: Arc<Database>,
        completion: Arc<dyn CompletionService>,
        settings: EngagementConfig,
    ) -> Self {
        let locks = LockManager::new(db.clone(), settings.lock_ttl());
        let cooldowns =
            CooldownTracker::new(db.clone(), settings.cooldown(), settings.cooldown_scope);
        Self {
            messages: db.clone(),
            personas: db,
            locks,
            cooldowns,
            completion,
            settings,
        }
    }

    /// Wire from separately supplied collaborators
    pub fn from_parts(
        messages: Arc<dyn MessageStore>,
        personas: Arc<dyn PersonaStore>,
        locks: LockManager,
        cooldowns: CooldownTracker,
        completion: Arc<dyn CompletionService>,
        settings: EngagementConfig,
    ) -> Self {
        Self {
            messages,
            personas,
            locks,
            cooldowns,
            completion,
            settings,
        }
    }

    /// Evaluate `trigger` and produce zero or one persona reply.
    #[instrument(skip(self, trigger), fields(message = %trigger.id))]
    pub async fn maybe_engage(
        &self,
        conversation_id: &str,
        trigger: &Message,
        invocation: Invocation,
    ) -> EngageOutcome {
        let outcome = self.run(conversation_id, trigger, &invocation).await;
        record(conversation_id, &outcome);
        outcome
    }

    /// Synchronous-caller entry: a named persona, bounded by `timeout`.
    ///
    /// On timeout the in-flight evaluation is dropped, which releases the
    /// lock and discards anything generated.
    pub async fn respond_now(
        &self,
        conversation_id: &str,
        trigger: &Message,
        persona_id: &str,
        timeout: Duration,
    ) -> EngageOutcome {
        let invocation = Invocation::Direct {
            persona_id: persona_id.to_string(),
        };
        match tokio::time::timeout(timeout, self.maybe_engage(conversation_id, trigger, invocation))
            .await
        {
            Ok(outcome) => outcome,
            Err(_) => {
                let outcome = EngageOutcome::Aborted(AbortReason::TookTooLong);
                record(conversation_id, &outcome);
                outcome
            }
        }
    }

    async fn run(
        &self,
        conversation_id: &str,
        trigger: &Message,
        invocation: &Invocation,
    ) -> EngageOutcome {
        if trigger.is_persona_reply() {
            return abort(Stage::Idle, AbortReason::NotHumanTrigger);
        }
        if trigger.conversation_id != conversation_id {
            return abort(
                Stage::Idle,
                AbortReason::StoreFailed(format!(
                    "message {} belongs to conversation {}",
                    trigger.id, trigger.conversation_id
                )),
            );
        }

        let persona = match self.select_persona(conversation_id, trigger, invocation) {
            Ok(persona) => persona,
            Err(reason) => return abort(Stage::Idle, reason),
        };

        // Idle -> LockHeld
        let Some(guard) = self.locks.acquire(conversation_id) else {
            return abort(Stage::Idle, AbortReason::Busy);
        };

        if let Err(reason) = self.guard_last_message(conversation_id) {
            return abort(Stage::LockHeld, reason);
        }

        if self.cooldowns.is_in_cooldown(conversation_id, &persona.id) {
            return abort(Stage::LockHeld, AbortReason::Cooldown);
        }

        // LockHeld -> ContextLoaded
        let window = match self
            .messages
            .recent_messages(conversation_id, self.settings.context_window)
        {
            Ok(window) => window,
            Err(e) => return abort(Stage::LockHeld, AbortReason::StoreFailed(format!("{:#}", e))),
        };
        let others = self.personas.list_personas(conversation_id).unwrap_or_else(|e| {
            tracing::warn!(conversation = conversation_id, "failed to list personas: {:#}", e);
            vec![]
        });
        let request = build_request(&persona, &others, &window, now_ms());

        // ContextLoaded -> Generating
        tracing::debug!(
            conversation = conversation_id,
            persona = %persona.name,
            stage = Stage::ContextLoaded.as_str(),
            "requesting completion"
        );
        let generated = match tokio::time::timeout(
            self.settings.completion_timeout(),
            self.completion.complete(request),
        )
        .await
        {
            Ok(Ok(generated)) => generated,
            Ok(Err(e)) => {
                return abort(Stage::Generating, AbortReason::CompletionFailed(e.to_string()))
            }
            Err(_) => return abort(Stage::Generating, AbortReason::TookTooLong),
        };

        let generated = Completion {
            text: generated.text.map(|t| clean_reply(&t, &persona)),
            media: generated.media,
        };
        if generated.is_empty() {
            return abort(Stage::Generating, AbortReason::EmptyCompletion);
        }

        // Guard B: someone else replied while we were generating
        if let Err(reason) = self.guard_last_message(conversation_id) {
            let reason = match reason {
                AbortReason::ConsecutiveReply => AbortReason::RaceDetected,
                other => other,
            };
            return abort(Stage::Generating, reason);
        }

        // Generating -> Persisting -> Done
        let text = generated.text.unwrap_or_default();
        let mut reply = Message::persona(conversation_id, persona.id.clone(), text);
        reply.media = generated.media;
        if let Err(e) = self.messages.insert_message(&reply) {
            return abort(Stage::Persisting, AbortReason::PersistFailed(format!("{:#}", e)));
        }

        self.cooldowns
            .record_reply_at(conversation_id, &persona.id, reply.created_at);
        if let Err(e) = self.personas.set_last_reply_at(&persona.id, reply.created_at) {
            tracing::warn!(persona = %persona.id, "failed to update last_reply_at: {:#}", e);
        }
        guard.release();

        EngageOutcome::Replied {
            message_id: reply.id,
            persona_id: persona.id,
        }
    }

    /// Fails if the conversation's most recent message is a persona reply
    fn guard_last_message(&self, conversation_id: &str) -> Result<(), AbortReason> {
        match self.messages.latest_message(conversation_id) {
            Ok(Some(latest)) if latest.is_persona_reply() => Err(AbortReason::ConsecutiveReply),
            Ok(_) => Ok(()),
            Err(e) => Err(AbortReason::StoreFailed(format!("{:#}", e))),
        }
    }

    fn select_persona(
        &self,
        conversation_id: &str,
        trigger: &Message,
        invocation: &Invocation,
    ) -> Result<Persona, AbortReason> {
        match invocation {
            Invocation::Direct { persona_id } => {
                let persona = self
                    .personas
                    .get_persona(persona_id)
                    .map_err(|e| AbortReason::StoreFailed(format!("{:#}", e)))?
                    .filter(|p| p.conversation_id == conversation_id)
                    .ok_or(AbortReason::NoPersona)?;
                if persona.engagement_mode == EngagementMode::Off {
                    return Err(AbortReason::PersonaDisabled);
                }
                Ok(persona)
            }
            Invocation::Ambient => {
                let personas: Vec<Persona> = self
                    .personas
                    .list_personas(conversation_id)
                    .map_err(|e| AbortReason::StoreFailed(format!("{:#}", e)))?
                    .into_iter()
                    .filter(|p| p.engagement_mode != EngagementMode::Off)
                    .collect();
                if personas.is_empty() {
                    return Err(AbortReason::NoPersona);
                }

                let event = TriggerEvent::derive(
                    self.messages.as_ref(),
                    trigger.clone(),
                    self.settings.burst_window(),
                )
                .map_err(|e| AbortReason::StoreFailed(format!("{:#}", e)))?;

                let now = now_ms();
                let mut rng = rand::thread_rng();
                let qualifiers: Vec<Persona> = personas
                    .into_iter()
                    .filter(|persona| {
                        let mentioned = persona.is_mentioned_in(&trigger.content);
                        match persona.engagement_mode {
                            EngagementMode::Off => false,
                            EngagementMode::MentionOnly => mentioned,
                            EngagementMode::Probabilistic => {
                                if mentioned {
                                    return true;
                                }
                                let score = event.score_for(persona, now);
                                let engaged = scorer::roll(score, &mut rng);
                                tracing::debug!(
                                    persona = %persona.name,
                                    score,
                                    engaged,
                                    "engagement draw"
                                );
                                engaged
                            }
                        }
                    })
                    .collect();

                scorer::pick_one(qualifiers, &mut rng).ok_or(AbortReason::Declined)
            }
        }
    }
}

/// Log and count an outcome. Guards are expected control flow, failures are not.
fn record(conversation_id: &str, outcome: &EngageOutcome) {
    match outcome {
        EngageOutcome::Replied {
            message_id,
            persona_id,
        } => {
            tracing::info!(
                conversation = conversation_id,
                persona = %persona_id,
                message = %message_id,
                "persona replied"
            );
        }
        EngageOutcome::Aborted(reason @ (AbortReason::Declined | AbortReason::NoPersona)) => {
            tracing::debug!(conversation = conversation_id, outcome = reason.as_str(), "no reply");
        }
        EngageOutcome::Aborted(AbortReason::PersistFailed(e)) => {
            tracing::error!(conversation = conversation_id, "dropped generated reply: {}", e);
        }
        EngageOutcome::Aborted(reason) if reason.is_failure() => {
            tracing::warn!(
                conversation = conversation_id,
                outcome = reason.as_str(),
                "engagement failed: {}",
                reason
            );
        }
        EngageOutcome::Aborted(reason) => {
            tracing::info!(
                conversation = conversation_id,
                outcome = reason.as_str(),
                "engagement skipped"
            );
        }
    }

    outcome_counter().add(
        1,
        &[
            KeyValue::new("outcome", outcome.label()),
            KeyValue::new("kind", outcome.kind()),
        ],
    );
}
