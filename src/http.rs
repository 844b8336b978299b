//! Respond-now HTTP surface
//!
//! Lets a client ask a specific persona to reply immediately. Goes through
//! the same orchestrator entry point as the background triggers, so it is
//! mutually exclusive with them per conversation.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::db::messages::MessageStore;
use crate::orchestrator::{AbortReason, EngageOutcome, Orchestrator};

/// Shared state for HTTP handlers
pub struct HttpState {
    /// Where triggering messages are looked up
    pub messages: Arc<dyn MessageStore>,
    pub orchestrator: Orchestrator,
    /// Bound on one respond-now call
    pub timeout: Duration,
}

#[derive(Debug, Deserialize)]
pub struct RespondRequest {
    pub persona_id: String,
    /// Message to respond to; defaults to the conversation's latest
    pub message_id: Option<String>,
}

/// HTTP status for an engagement outcome
pub fn status_for(outcome: &EngageOutcome) -> StatusCode {
    match outcome {
        EngageOutcome::Replied { .. } => StatusCode::OK,
        EngageOutcome::Aborted(reason) => match reason {
            AbortReason::Busy
            | AbortReason::Cooldown
            | AbortReason::ConsecutiveReply
            | AbortReason::RaceDetected => StatusCode::TOO_MANY_REQUESTS,
            AbortReason::TookTooLong => StatusCode::GATEWAY_TIMEOUT,
            AbortReason::NoPersona => StatusCode::NOT_FOUND,
            r if r.is_failure() => StatusCode::BAD_GATEWAY,
            _ => StatusCode::CONFLICT,
        },
    }
}

fn outcome_body(outcome: &EngageOutcome) -> Value {
    match outcome {
        EngageOutcome::Replied {
            message_id,
            persona_id,
        } => json!({
            "status": "replied",
            "message_id": message_id,
            "persona_id": persona_id,
        }),
        EngageOutcome::Aborted(reason) => json!({
            "status": "aborted",
            "reason": reason.as_str(),
            "detail": reason.to_string(),
        }),
    }
}

async fn respond(
    State(state): State<Arc<HttpState>>,
    Path(conversation_id): Path<String>,
    Json(request): Json<RespondRequest>,
) -> (StatusCode, Json<Value>) {
    let lookup = match &request.message_id {
        Some(id) => state
            .messages
            .get_message(id)
            .map(|m| m.filter(|m| m.conversation_id == conversation_id)),
        None => state.messages.latest_message(&conversation_id),
    };

    let trigger = match lookup {
        Ok(Some(message)) => message,
        Ok(None) => {
            return (
                StatusCode::NOT_FOUND,
                Json(json!({ "status": "error", "reason": "message_not_found" })),
            )
        }
        Err(e) => {
            tracing::warn!(conversation = %conversation_id, "message lookup failed: {:#}", e);
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "status": "error", "reason": "store_failed" })),
            );
        }
    };

    let outcome = state
        .orchestrator
        .respond_now(&conversation_id, &trigger, &request.persona_id, state.timeout)
        .await;

    (status_for(&outcome), Json(outcome_body(&outcome)))
}

async fn health() -> &'static str {
    "ok"
}

pub fn router(state: Arc<HttpState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/conversations/{id}/respond", post(respond))
        .with_state(state)
}

/// Bind and serve until `shutdown` fires
pub async fn serve(
    addr: SocketAddr,
    state: Arc<HttpState>,
    shutdown: CancellationToken,
) -> Result<JoinHandle<()>> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    let app = router(state);

    let handle = tokio::spawn(async move {
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await;
        if let Err(e) = result {
            tracing::error!("http server error: {}", e);
        }
    });

    Ok(handle)
}
