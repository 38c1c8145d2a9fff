//! Conversation, usage, and health routes, plus the buffered chat variant.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tokio_stream::StreamExt;
use tracing::{error, info, warn};

use persona_gate_agent::{run_turn, StreamEvent, TurnPacing};
use persona_gate_core::conversation::StoredMessage;

use crate::auth::authenticate;
use crate::rate_limit::RateLimitStatus;
use crate::state::AppState;
use crate::stream::parse_message;

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({ "error": "Unauthorized" })),
    )
        .into_response()
}

fn internal_error() -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": "Internal server error" })),
    )
        .into_response()
}

fn usage_fields(status: &RateLimitStatus) -> serde_json::Value {
    json!({
        "minuteRemaining": status.minute_remaining,
        "dayRemaining": status.day_remaining,
        "resetMinute": status.reset_minute,
        "resetDay": status.reset_day,
    })
}

/// POST /chat — the buffered variant: same turn, same single persistence
/// write, response delivered as one JSON document.
pub async fn chat(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: String,
) -> Response {
    let Some(caller) = authenticate(&state.verifier, &headers) else {
        return unauthorized();
    };

    let rate = state.limiter.check(&caller.user_id);
    if !rate.allowed {
        warn!(user = %caller.user_id, "Rate limit exceeded");
        return (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({
                "error": "Rate limit exceeded",
                "minuteRemaining": rate.minute_remaining,
                "dayRemaining": rate.day_remaining,
                "resetMinute": rate.reset_minute,
                "resetDay": rate.reset_day,
            })),
        )
            .into_response();
    }

    let Some(message) = parse_message(&body) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "Invalid message" })),
        )
            .into_response();
    };

    let prior_history = match state.store.get(&caller.user_id).await {
        Ok(conversation) => conversation.map(|c| c.agent_history).unwrap_or_default(),
        Err(e) => {
            error!(error = %e, user = %caller.user_id, "Conversation load failed");
            return internal_error();
        }
    };

    let started = Instant::now();
    let definition = state.definition_for(&caller);
    let mut events = run_turn(
        state.runner.clone(),
        definition,
        message.clone(),
        prior_history,
        TurnPacing::immediate(),
    );

    while let Some(event) = events.next().await {
        match event {
            StreamEvent::Content { .. } => {}
            StreamEvent::Done {
                full_text,
                updated_history,
            } => {
                if let Err(e) = state
                    .store
                    .append_turn(
                        &caller.user_id,
                        StoredMessage::user(message.clone()),
                        StoredMessage::assistant(full_text.clone()),
                        updated_history,
                    )
                    .await
                {
                    error!(error = %e, user = %caller.user_id, "Persistence failed after turn");
                    return internal_error();
                }

                info!(user = %caller.user_id, latency_ms = started.elapsed().as_millis() as u64, "Turn persisted");
                return (
                    StatusCode::OK,
                    Json(json!({
                        "response": full_text,
                        "latencyMs": started.elapsed().as_millis() as u64,
                        "usage": {
                            "minuteRemaining": rate.minute_remaining.saturating_sub(1),
                            "dayRemaining": rate.day_remaining.saturating_sub(1),
                            "resetMinute": rate.reset_minute,
                            "resetDay": rate.reset_day,
                        }
                    })),
                )
                    .into_response();
            }
            StreamEvent::Error { message } => {
                return (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "error": message })),
                )
                    .into_response();
            }
        }
    }

    // The driver guarantees a terminal event; reaching here means the
    // stream was dropped without one.
    internal_error()
}

/// GET /conversation — display messages plus a usage snapshot.
pub async fn conversation(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let Some(caller) = authenticate(&state.verifier, &headers) else {
        return unauthorized();
    };

    let conversation = match state.store.get(&caller.user_id).await {
        Ok(conversation) => conversation,
        Err(e) => {
            error!(error = %e, user = %caller.user_id, "Conversation load failed");
            return internal_error();
        }
    };
    let usage = state.limiter.snapshot(&caller.user_id);

    (
        StatusCode::OK,
        Json(json!({
            "messages": conversation.map(|c| c.messages).unwrap_or_default(),
            "usage": usage_fields(&usage),
        })),
    )
        .into_response()
}

/// POST /conversation/clear — delete the stored conversation.
pub async fn clear_conversation(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Response {
    let Some(caller) = authenticate(&state.verifier, &headers) else {
        return unauthorized();
    };

    if let Err(e) = state.store.clear(&caller.user_id).await {
        error!(error = %e, user = %caller.user_id, "Conversation clear failed");
        return internal_error();
    }

    info!(user = %caller.user_id, "Conversation cleared");
    (StatusCode::OK, Json(json!({ "success": true }))).into_response()
}

/// GET /usage — quota snapshot plus message count.
pub async fn usage(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let Some(caller) = authenticate(&state.verifier, &headers) else {
        return unauthorized();
    };

    let conversation = match state.store.get(&caller.user_id).await {
        Ok(conversation) => conversation,
        Err(e) => {
            error!(error = %e, user = %caller.user_id, "Conversation load failed");
            return internal_error();
        }
    };
    let status = state.limiter.snapshot(&caller.user_id);

    let mut body = usage_fields(&status);
    body["messageCount"] = json!(conversation.map(|c| c.messages.len()).unwrap_or(0));
    (StatusCode::OK, Json(body)).into_response()
}

/// GET /health
pub async fn health() -> Response {
    (
        StatusCode::OK,
        Json(json!({
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION"),
        })),
    )
        .into_response()
}
