//! Per-conversation engagement lock.
//!
//! The lock lives in the backing store, never in process memory, so every
//! murmur process sharing a database sees the same exclusion domain. A row
//! carries its holder and an expiry; holders that crash without releasing
//! are reclaimed once the TTL passes.
//!
//! Storage errors while acquiring count as "not acquired": a missed reply
//! is preferred over a duplicated one.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use uuid::Uuid;

use crate::db::{new_id, now_ms};

/// Storage-level primitives the lock manager is built from.
///
/// `try_insert_lock` must be atomic: it either creates the row or reports
/// a conflict, with no window in between.
pub trait LockRepository: Send + Sync {
    /// Insert a lock row; `Ok(false)` when one already exists
    fn try_insert_lock(&self, conversation_id: &str, holder_id: &str, expires_at: i64) -> Result<bool>;

    /// Delete the row if its expiry is at or before `now`
    fn delete_expired_lock(&self, conversation_id: &str, now: i64) -> Result<bool>;

    /// Delete the row only if `holder_id` still owns it
    fn delete_lock_if_holder(&self, conversation_id: &str, holder_id: &str) -> Result<bool>;
}

/// Acquires and releases engagement locks against a [`LockRepository`].
#[derive(Clone)]
pub struct LockManager {
    repo: Arc<dyn LockRepository>,
    /// Prefix for holder ids minted by this process
    instance_id: String,
    ttl: Duration,
}

impl LockManager {
    /// Long enough to cover a slow completion call
    pub const DEFAULT_TTL: Duration = Duration::from_secs(60);

    pub fn new(repo: Arc<dyn LockRepository>, ttl: Duration) -> Self {
        Self {
            repo,
            instance_id: new_id(),
            ttl,
        }
    }

    /// Take the conversation's lock with a fresh holder identity.
    ///
    /// The returned guard releases the lock when dropped.
    pub fn acquire(&self, conversation_id: &str) -> Option<LockGuard> {
        let holder_id = format!("{}:{}", self.instance_id, Uuid::new_v4());
        if self.acquire_as(conversation_id, &holder_id) {
            Some(LockGuard {
                manager: self.clone(),
                conversation_id: conversation_id.to_string(),
                holder_id,
                released: false,
            })
        } else {
            None
        }
    }

    /// Try to take the lock for `holder_id`.
    ///
    /// On conflict, clears an expired row and retries exactly once.
    pub fn acquire_as(&self, conversation_id: &str, holder_id: &str) -> bool {
        let ttl_ms = i64::try_from(self.ttl.as_millis()).unwrap_or(i64::MAX);

        match self
            .repo
            .try_insert_lock(conversation_id, holder_id, now_ms().saturating_add(ttl_ms))
        {
            Ok(true) => return true,
            Ok(false) => {}
            Err(e) => {
                tracing::warn!(conversation = conversation_id, "lock insert failed: {:#}", e);
                return false;
            }
        }

        let now = now_ms();
        match self.repo.delete_expired_lock(conversation_id, now) {
            Ok(true) => {
                tracing::info!(conversation = conversation_id, "reclaimed expired engagement lock")
            }
            Ok(false) => {}
            Err(e) => {
                tracing::warn!(conversation = conversation_id, "expired lock cleanup failed: {:#}", e);
                return false;
            }
        }

        match self
            .repo
            .try_insert_lock(conversation_id, holder_id, now.saturating_add(ttl_ms))
        {
            Ok(acquired) => acquired,
            Err(e) => {
                tracing::warn!(conversation = conversation_id, "lock insert retry failed: {:#}", e);
                false
            }
        }
    }

    /// Release the lock if `holder_id` still owns it. Returns whether a row was removed.
    pub fn release_as(&self, conversation_id: &str, holder_id: &str) -> bool {
        match self.repo.delete_lock_if_holder(conversation_id, holder_id) {
            Ok(removed) => {
                if !removed {
                    tracing::debug!(
                        conversation = conversation_id,
                        holder = holder_id,
                        "lock already gone or taken over"
                    );
                }
                removed
            }
            Err(e) => {
                // the TTL will clear it
                tracing::warn!(conversation = conversation_id, "lock release failed: {:#}", e);
                false
            }
        }
    }
}

/// Scoped ownership of a conversation's lock.
pub struct LockGuard {
    manager: LockManager,
    conversation_id: String,
    holder_id: String,
    released: bool,
}

impl LockGuard {
    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub fn holder_id(&self) -> &str {
        &self.holder_id
    }

    /// Release now rather than at end of scope
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if !self.released {
            self.released = true;
            self.manager.release_as(&self.conversation_id, &self.holder_id);
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.release_inner();
    }
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("conversation_id", &self.conversation_id)
            .field("holder_id", &self.holder_id)
            .finish()
    }
}
