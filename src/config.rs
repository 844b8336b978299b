//! Service configuration
//!
//! Loaded from `murmur.toml`; every field has a default so an absent or
//! partial file still yields a runnable configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::cooldown::CooldownScope;
use crate::paths;

/// Top-level configuration file structure
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Path to sqlite database (MURMUR_DB overrides)
    pub db_path: Option<String>,
    /// Respond-now HTTP listen address; empty disables the server
    pub listen_addr: String,
    pub engagement: EngagementConfig,
    pub trigger: TriggerConfig,
    pub completion: CompletionConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: None,
            listen_addr: "127.0.0.1:7878".to_string(),
            engagement: EngagementConfig::default(),
            trigger: TriggerConfig::default(),
            completion: CompletionConfig::default(),
        }
    }
}

/// Timing and sizing for the engagement path
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngagementConfig {
    pub lock_ttl_secs: u64,
    pub cooldown_secs: u64,
    pub cooldown_scope: CooldownScope,
    /// Messages of history handed to the completion backend
    pub context_window: usize,
    /// Window for the "recent messages" burst signal
    pub burst_window_secs: u64,
    pub completion_timeout_secs: u64,
    pub respond_now_timeout_secs: u64,
}

impl Default for EngagementConfig {
    fn default() -> Self {
        Self {
            lock_ttl_secs: 60,
            cooldown_secs: 30,
            cooldown_scope: CooldownScope::Conversation,
            context_window: 20,
            burst_window_secs: 300,
            completion_timeout_secs: 45,
            respond_now_timeout_secs: 60,
        }
    }
}

impl EngagementConfig {
    /// The lock has to outlive the completion call it protects
    pub fn validate(&self) -> Result<()> {
        if self.completion_timeout_secs >= self.lock_ttl_secs {
            anyhow::bail!(
                "engagement.lock_ttl_secs ({}) must be greater than completion_timeout_secs ({})",
                self.lock_ttl_secs,
                self.completion_timeout_secs
            );
        }
        Ok(())
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    pub fn burst_window(&self) -> Duration {
        Duration::from_secs(self.burst_window_secs)
    }

    pub fn completion_timeout(&self) -> Duration {
        Duration::from_secs(self.completion_timeout_secs)
    }

    pub fn respond_now_timeout(&self) -> Duration {
        Duration::from_secs(self.respond_now_timeout_secs)
    }
}

/// Which trigger source feeds the orchestrator
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    /// Push from this process's change feed
    #[default]
    Feed,
    /// Fixed-interval scan of the shared database
    Poll,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TriggerConfig {
    pub source: TriggerKind,
    pub poll_interval_ms: u64,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            source: TriggerKind::Feed,
            poll_interval_ms: 2000,
        }
    }
}

impl TriggerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// OpenAI-compatible completion backend
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CompletionConfig {
    pub endpoint: String,
    pub model: String,
    /// Name of the env var holding the API key, if the backend needs one
    pub api_key_env: Option<String>,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:11434/v1".to_string(),
            model: "qwen3:8b".to_string(),
            api_key_env: Some("OPENAI_API_KEY".to_string()),
        }
    }
}

impl Config {
    /// Load config from a TOML file, falling back to defaults if it is missing
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::warn!("config not found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;

        let config = Self::parse(&content)
            .with_context(|| format!("failed to parse {}", path.display()))?;

        tracing::info!("loaded config from {}", path.display());
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.engagement.validate()?;
        Ok(config)
    }

    /// Resolved database path: MURMUR_DB, then the config file, then XDG default
    pub fn db_path(&self) -> PathBuf {
        if std::env::var_os(paths::DB_ENV).is_some() {
            return paths::db_path();
        }
        match &self.db_path {
            Some(path) => PathBuf::from(path),
            None => paths::db_path(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.engagement.lock_ttl(), Duration::from_secs(60));
        assert_eq!(config.engagement.cooldown(), Duration::from_secs(30));
        assert_eq!(config.engagement.cooldown_scope, CooldownScope::Conversation);
        assert_eq!(config.trigger.source, TriggerKind::Feed);
    }

    #[test]
    fn test_partial_file() -> Result<()> {
        let config = Config::parse(
            r#"
            listen_addr = ""

            [engagement]
            cooldown_secs = 10
            cooldown_scope = "persona"

            [trigger]
            source = "poll"
            "#,
        )?;

        assert!(config.listen_addr.is_empty());
        assert_eq!(config.engagement.cooldown_secs, 10);
        assert_eq!(config.engagement.cooldown_scope, CooldownScope::Persona);
        assert_eq!(config.engagement.lock_ttl_secs, 60);
        assert_eq!(config.trigger.source, TriggerKind::Poll);
        assert_eq!(config.trigger.poll_interval_ms, 2000);
        assert_eq!(config.completion.model, "qwen3:8b");
        Ok(())
    }

    #[test]
    fn test_lock_ttl_must_cover_completion() {
        let err = Config::parse(
            "[engagement]\nlock_ttl_secs = 30\ncompletion_timeout_secs = 30",
        )
        .expect_err("ttl equal to the completion timeout");
        assert!(err.to_string().contains("lock_ttl_secs"), "{err}");

        assert!(Config::parse("[engagement]\nlock_ttl_secs = 10").is_err());
        assert!(Config::parse("[engagement]\nlock_ttl_secs = 46").is_ok());
        assert!(EngagementConfig::default().validate().is_ok());
    }

    #[test]
    fn test_bad_value_rejected() {
        assert!(Config::parse("[trigger]\nsource = \"carrier-pigeon\"").is_err());
    }

    #[test]
    fn test_missing_file_uses_defaults() -> Result<()> {
        let path = std::env::temp_dir().join(format!("murmur-missing-{}.toml", uuid::Uuid::new_v4()));
        let config = Config::load(&path)?;
        assert_eq!(config.engagement.context_window, 20);
        Ok(())
    }
}
