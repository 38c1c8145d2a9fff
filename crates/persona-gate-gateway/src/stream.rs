//! Transport adapter — bridges the driver's event sequence onto an SSE
//! response and performs the turn's single persistence write.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt;
use tracing::{error, info, warn};

use persona_gate_agent::{run_turn, StreamEvent, TurnPacing};
use persona_gate_core::conversation::StoredMessage;
use persona_gate_tools::CallerIdentity;

use crate::auth::authenticate;
use crate::rate_limit::RateLimitStatus;
use crate::state::AppState;

/// POST /chat-stream — run one turn and stream it as SSE.
///
/// Preconditions short-circuit in order: principal, quota, message. Once
/// the stream opens, every failure becomes a terminal `error` frame.
pub async fn chat_stream(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: String,
) -> Response {
    let Some(caller) = authenticate(&state.verifier, &headers) else {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "Unauthorized" })),
        )
            .into_response();
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

    // One read per turn, before the stream opens; a store failure here is
    // still a pre-stream rejection.
    let prior_history = match state.store.get(&caller.user_id).await {
        Ok(conversation) => conversation.map(|c| c.agent_history).unwrap_or_default(),
        Err(e) => {
            error!(error = %e, user = %caller.user_id, "Conversation load failed");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "Internal server error" })),
            )
                .into_response();
        }
    };

    info!(user = %caller.user_id, "Starting chat turn");

    let (frame_tx, frame_rx) = mpsc::unbounded_channel::<String>();
    let turn = tokio::spawn(run_and_persist(
        state.clone(),
        caller,
        message,
        prior_history,
        rate,
        frame_tx,
    ));

    // Default policy: the spawned turn outlives the connection, so the
    // answer is persisted even if nobody is watching. When configured
    // otherwise, dropping the response body aborts the turn.
    let guard = TurnGuard {
        handle: (!state.config.finish_on_disconnect()).then_some(turn),
    };

    let frames = UnboundedReceiverStream::new(frame_rx).map(move |frame| {
        let _held_until_stream_drop = &guard;
        Ok::<_, std::convert::Infallible>(frame)
    });

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .body(Body::from_stream(frames))
        .expect("static response headers are valid")
}

/// The turn body: forward frames as events arrive, persist exactly once on
/// `Done` (before the terminal frame), persist nothing otherwise.
async fn run_and_persist(
    state: Arc<AppState>,
    caller: CallerIdentity,
    message: String,
    prior_history: Vec<serde_json::Value>,
    rate: RateLimitStatus,
    tx: mpsc::UnboundedSender<String>,
) {
    let definition = state.definition_for(&caller);
    let pacing = TurnPacing::from_config(&state.config);
    let mut events = run_turn(
        state.runner.clone(),
        definition,
        message.clone(),
        prior_history,
        pacing,
    );

    while let Some(event) = events.next().await {
        match event {
            StreamEvent::Content { text } => {
                // Send failures mean the client went away; keep consuming
                // so the turn reaches its terminal event.
                let _ = tx.send(sse_frame(&json!({ "type": "content", "content": text })));
            }

            StreamEvent::Done {
                full_text,
                updated_history,
            } => {
                let persisted = state
                    .store
                    .append_turn(
                        &caller.user_id,
                        StoredMessage::user(message.clone()),
                        StoredMessage::assistant(full_text),
                        updated_history,
                    )
                    .await;

                match persisted {
                    Ok(_) => {
                        info!(user = %caller.user_id, "Turn persisted");
                        let _ = tx.send(sse_frame(&json!({
                            "type": "done",
                            "usage": {
                                "minuteRemaining": rate.minute_remaining.saturating_sub(1),
                                "dayRemaining": rate.day_remaining.saturating_sub(1),
                            }
                        })));
                    }
                    Err(e) => {
                        // The write failed, so the client must not see `done`.
                        error!(error = %e, user = %caller.user_id, "Persistence failed after turn");
                        let _ = tx.send(sse_frame(&json!({
                            "type": "error",
                            "error": "Failed to save conversation",
                        })));
                    }
                }
                break;
            }

            StreamEvent::Error { message } => {
                let _ = tx.send(sse_frame(&json!({ "type": "error", "error": message })));
                break;
            }
        }
    }
}

/// Aborts the in-flight turn when dropped, if armed.
struct TurnGuard {
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl Drop for TurnGuard {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

pub(crate) fn parse_message(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    let message = value.get("message")?.as_str()?;
    if message.is_empty() {
        None
    } else {
        Some(message.to_string())
    }
}

pub(crate) fn sse_frame(payload: &serde_json::Value) -> String {
    format!("data: {payload}\n\n")
}
