//! murmur - persona engagement daemon
//!
//! Watches conversations for new human messages, lets personas decide
//! whether to reply, and serves the respond-now HTTP endpoint. Run as many
//! copies against one database as you like; use `source = "poll"` so each
//! one sees the others' writes.

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use murmur::completion::OpenAiCompletion;
use murmur::config::{Config, TriggerKind};
use murmur::db::Database;
use murmur::http::{self, HttpState};
use murmur::orchestrator::Orchestrator;
use murmur::paths;
use murmur::telemetry::Telemetry;
use murmur::trigger::{ChangeFeedSource, EngageHandler, PollingSource, TriggerSource};

#[tokio::main]
async fn main() -> Result<()> {
    let telemetry = Telemetry::init("murmur=info")?;
    paths::log_paths();

    let config = Config::load(paths::config_path()).context("failed to load config")?;

    let db_path = config.db_path();
    paths::ensure_db_dir(&db_path)?;
    info!("opening database at {}", db_path.display());
    let db = Arc::new(Database::open(&db_path).context("failed to open database")?);

    let completion = Arc::new(OpenAiCompletion::from_config(&config.completion));
    info!(
        url = completion.url(),
        model = %config.completion.model,
        "completion backend configured"
    );

    let orchestrator = Orchestrator::new(db.clone(), completion, config.engagement.clone());
    let handler = Arc::new(EngageHandler::new(orchestrator.clone()));
    let shutdown = CancellationToken::new();

    let source: Box<dyn TriggerSource> = match config.trigger.source {
        TriggerKind::Feed => Box::new(ChangeFeedSource::new(db.feed())),
        TriggerKind::Poll => Box::new(PollingSource::new(
            db.clone(),
            config.trigger.poll_interval(),
        )?),
    };
    info!(source = source.name(), "starting trigger source");
    let source_task = source.on_candidate_message(handler.clone(), shutdown.clone());

    let http_task = if config.listen_addr.is_empty() {
        None
    } else {
        let addr = config
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen_addr {:?}", config.listen_addr))?;
        let state = Arc::new(HttpState {
            messages: db.clone(),
            orchestrator,
            timeout: config.engagement.respond_now_timeout(),
        });
        let task = http::serve(addr, state, shutdown.clone()).await?;
        info!(%addr, "respond-now endpoint listening");
        Some(task)
    };

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("shutting down");
    shutdown.cancel();

    let _ = source_task.await;
    if let Some(task) = http_task {
        let _ = task.await;
    }
    info!(in_flight = handler.in_flight(), "waiting for in-flight evaluations");
    handler.drain().await;

    telemetry.shutdown();
    Ok(())
}
