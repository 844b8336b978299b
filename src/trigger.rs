//! Trigger sources
//!
//! Candidate messages reach the orchestrator through one of two
//! interchangeable sources:
//!
//! - [`ChangeFeedSource`] pushes inserts from this process's [`MessageFeed`].
//! - [`PollingSource`] scans the shared database on a fixed interval, which
//!   also sees messages written by other processes.
//!
//! Both deliver into a [`CandidateHandler`]; [`EngageHandler`] is the one
//! that runs the orchestrator. Sources may deliver the same message more
//! than once. That is fine: the lock and the last-message guards make an
//! evaluation idempotent.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::backoff::Backoff;
use crate::db::messages::{Message, MessageLog};
use crate::feed::{MessageFeed, MessageFeedReceiver};
use crate::orchestrator::{Invocation, Orchestrator};

/// Messages pulled per polling scan
const SCAN_BATCH: usize = 200;

/// Receives candidate messages from a trigger source
#[async_trait]
pub trait CandidateHandler: Send + Sync {
    async fn on_candidate(&self, message: Message);
}

/// Something that produces candidate messages
pub trait TriggerSource: Send {
    fn name(&self) -> &'static str;

    /// Start delivering candidates to `handler` until `shutdown` fires
    fn on_candidate_message(
        self: Box<Self>,
        handler: Arc<dyn CandidateHandler>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()>;
}

/// Push source backed by the in-process change feed
pub struct ChangeFeedSource {
    rx: MessageFeedReceiver,
}

impl ChangeFeedSource {
    /// Subscribes immediately so nothing inserted after this call is missed
    pub fn new(feed: &MessageFeed) -> Self {
        Self {
            rx: feed.subscribe(),
        }
    }
}

impl TriggerSource for ChangeFeedSource {
    fn name(&self) -> &'static str {
        "feed"
    }

    fn on_candidate_message(
        mut self: Box<Self>,
        handler: Arc<dyn CandidateHandler>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    message = self.rx.recv() => message,
                };
                match message {
                    Some(message) => handler.on_candidate(message).await,
                    None => {
                        tracing::info!("message feed closed");
                        break;
                    }
                }
            }
        })
    }
}

/// Fixed-interval scan of the messages table
pub struct PollingSource {
    log: Arc<dyn MessageLog>,
    interval: Duration,
    /// Highest seq already delivered
    cursor: i64,
    backoff: Backoff,
}

impl PollingSource {
    /// Start from the current end of the table; history is not replayed
    pub fn new(log: Arc<dyn MessageLog>, interval: Duration) -> anyhow::Result<Self> {
        let cursor = log.max_message_seq()?;
        Ok(Self::starting_after(log, interval, cursor))
    }

    pub fn starting_after(log: Arc<dyn MessageLog>, interval: Duration, cursor: i64) -> Self {
        Self {
            log,
            interval,
            cursor,
            backoff: Backoff::new(),
        }
    }

    pub fn cursor(&self) -> i64 {
        self.cursor
    }

    /// Deliver everything after the cursor. Returns how many were delivered.
    pub async fn scan_once(&mut self, handler: &dyn CandidateHandler) -> anyhow::Result<usize> {
        let mut delivered = 0;
        loop {
            let batch = self.log.messages_after(self.cursor, SCAN_BATCH)?;
            let full = batch.len() == SCAN_BATCH;
            for message in batch {
                self.cursor = message.seq;
                handler.on_candidate(message).await;
                delivered += 1;
            }
            if !full {
                return Ok(delivered);
            }
        }
    }

    /// One scan, returning how long to wait before the next.
    ///
    /// A failed scan keeps the cursor where it was and backs off; the next
    /// successful one picks up from there and resets the backoff.
    pub async fn tick(&mut self, handler: &dyn CandidateHandler) -> Duration {
        match self.scan_once(handler).await {
            Ok(_) => {
                self.backoff.reset();
                self.interval
            }
            Err(e) => {
                let wait = self.backoff.next_delay();
                tracing::warn!(
                    cursor = self.cursor,
                    retry_ms = wait.as_millis() as u64,
                    "message scan failed: {:#}",
                    e
                );
                wait
            }
        }
    }
}

impl TriggerSource for PollingSource {
    fn name(&self) -> &'static str {
        "poll"
    }

    fn on_candidate_message(
        mut self: Box<Self>,
        handler: Arc<dyn CandidateHandler>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut wait = self.interval;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(wait) => {}
                }

                wait = self.tick(handler.as_ref()).await;
            }
        })
    }
}

/// Runs an ambient evaluation for each human message, one task per message
pub struct EngageHandler {
    orchestrator: Orchestrator,
    tasks: TaskTracker,
}

impl EngageHandler {
    pub fn new(orchestrator: Orchestrator) -> Self {
        Self {
            orchestrator,
            tasks: TaskTracker::new(),
        }
    }

    /// Wait for in-flight evaluations after the sources have stopped
    pub async fn drain(&self) {
        self.tasks.close();
        self.tasks.wait().await;
    }

    pub fn in_flight(&self) -> usize {
        self.tasks.len()
    }
}

#[async_trait]
impl CandidateHandler for EngageHandler {
    async fn on_candidate(&self, message: Message) {
        if message.is_persona_reply() {
            return;
        }

        let orchestrator = self.orchestrator.clone();
        self.tasks.spawn(async move {
            let conversation_id = message.conversation_id.clone();
            orchestrator
                .maybe_engage(&conversation_id, &message, Invocation::Ambient)
                .await;
        });
    }
}
