//! End-to-end route tests with a scripted runner and in-memory store.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use hmac::{Hmac, Mac};
use serde_json::{json, Value};
use sha2::Sha256;
use tower::ServiceExt;

use persona_gate_core::config::Config;
use persona_gate_core::store::{ConversationStore, MemoryConversationStore};
use persona_gate_gateway::{app, AppState};
use persona_gate_runner::{AgentDefinition, AgentRunner, RunOutcome, RunnerEvent};

/// Replays one scripted event sequence per invocation, counting runs.
struct ScriptedRunner {
    scripts: Mutex<Vec<Vec<anyhow::Result<RunnerEvent>>>>,
    runs: Arc<AtomicUsize>,
}

impl ScriptedRunner {
    fn new(scripts: Vec<Vec<anyhow::Result<RunnerEvent>>>) -> (Self, Arc<AtomicUsize>) {
        let runs = Arc::new(AtomicUsize::new(0));
        (
            Self {
                scripts: Mutex::new(scripts),
                runs: runs.clone(),
            },
            runs,
        )
    }
}

#[async_trait]
impl AgentRunner for ScriptedRunner {
    async fn run(
        &self,
        _definition: &AgentDefinition,
        _history: &[Value],
    ) -> anyhow::Result<RunOutcome> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        let mut scripts = self.scripts.lock().unwrap();
        let script = if scripts.is_empty() {
            vec![Ok(RunnerEvent::Completed { new_items: vec![] })]
        } else {
            scripts.remove(0)
        };
        Ok(RunOutcome::Events(Box::pin(futures::stream::iter(script))))
    }
}

fn happy_script() -> Vec<anyhow::Result<RunnerEvent>> {
    vec![
        Ok(RunnerEvent::Delta { content: "Hi".into() }),
        Ok(RunnerEvent::Delta { content: "Hi there".into() }),
        Ok(RunnerEvent::Completed { new_items: vec![] }),
    ]
}

fn test_config() -> Config {
    json5::from_str(
        r#"{
            auth: {
                tokens: [{
                    token: "secret-token",
                    user_id: "u1",
                    name: "Jess Chen",
                    email: "jess@example.com",
                }],
            },
            limits: { per_minute: 5, per_day: 100 },
            pacing: { delta_delay_ms: 0, chunk_delay_ms: 0 },
            calendar: { webhook_secret: "hook-secret" },
        }"#,
    )
    .unwrap()
}

struct TestHarness {
    app: axum::Router,
    store: Arc<dyn ConversationStore>,
    runs: Arc<AtomicUsize>,
}

fn harness_with(config: Config, scripts: Vec<Vec<anyhow::Result<RunnerEvent>>>) -> TestHarness {
    let store: Arc<dyn ConversationStore> =
        Arc::new(MemoryConversationStore::new(Duration::from_secs(600)));
    let (runner, runs) = ScriptedRunner::new(scripts);
    let state = Arc::new(AppState::new(
        Arc::new(config),
        store.clone(),
        Arc::new(runner),
    ));
    TestHarness {
        app: app(state),
        store,
        runs,
    }
}

fn harness(scripts: Vec<Vec<anyhow::Result<RunnerEvent>>>) -> TestHarness {
    harness_with(test_config(), scripts)
}

fn chat_request(token: Option<&str>, body: &str) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/chat-stream")
        .header("content-type", "application/json");
    if let Some(token) = token {
        builder = builder.header("authorization", format!("Bearer {token}"));
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

fn get_request(uri: &str) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(uri)
        .header("authorization", "Bearer secret-token")
        .body(Body::empty())
        .unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

async fn body_frames(response: axum::response::Response) -> Vec<Value> {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let raw = String::from_utf8(bytes.to_vec()).unwrap();
    raw.split("\n\n")
        .filter(|frame| !frame.is_empty())
        .map(|frame| {
            serde_json::from_str(
                frame
                    .strip_prefix("data: ")
                    .expect("every frame starts with the data field"),
            )
            .unwrap()
        })
        .collect()
}

#[tokio::test]
async fn rejects_missing_principal_with_401() {
    let harness = harness(vec![happy_script()]);
    let response = harness
        .app
        .oneshot(chat_request(None, r#"{"message":"Hi"}"#))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(body_json(response).await["error"], "Unauthorized");
    assert_eq!(harness.runs.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn rejects_invalid_message_with_400() {
    let harness = harness(vec![happy_script()]);
    let response = harness
        .app
        .oneshot(chat_request(Some("secret-token"), r#"{"message":""}"#))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["error"], "Invalid message");
    assert_eq!(harness.runs.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn exhausted_quota_never_reaches_the_runner() {
    let mut config = test_config();
    config.limits.as_mut().unwrap().per_minute = Some(0);
    let harness = harness_with(config, vec![happy_script()]);

    let response = harness
        .app
        .oneshot(chat_request(Some("secret-token"), r#"{"message":"Hi"}"#))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    let body = body_json(response).await;
    assert_eq!(body["error"], "Rate limit exceeded");
    assert_eq!(body["minuteRemaining"], 0);
    assert_eq!(harness.runs.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn streams_content_then_done_and_persists_once() {
    let harness = harness(vec![happy_script()]);
    let response = harness
        .app
        .oneshot(chat_request(Some("secret-token"), r#"{"message":"Hi"}"#))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()["content-type"].to_str().unwrap(),
        "text/event-stream"
    );

    let frames = body_frames(response).await;
    let contents: String = frames
        .iter()
        .filter(|f| f["type"] == "content")
        .map(|f| f["content"].as_str().unwrap())
        .collect();
    assert_eq!(contents, "Hi there");

    let done = frames.last().unwrap();
    assert_eq!(done["type"], "done");
    // 5/minute, one consumed by this turn, one more displayed as spent.
    assert_eq!(done["usage"]["minuteRemaining"], 3);

    let stored = harness.store.get("u1").await.unwrap().unwrap();
    assert_eq!(stored.messages.len(), 2);
    assert_eq!(stored.messages[0].content, "Hi");
    assert_eq!(stored.messages[1].content, "Hi there");
    assert_eq!(stored.agent_history.len(), 2);
    assert_eq!(stored.agent_history[1]["role"], "assistant");
}

#[tokio::test]
async fn turn_error_leaves_the_store_untouched() {
    let harness = harness(vec![vec![
        Ok(RunnerEvent::Delta { content: "Partial".into() }),
        Err(anyhow::anyhow!("upstream reset")),
    ]]);

    let response = harness
        .app
        .oneshot(chat_request(Some("secret-token"), r#"{"message":"Hi"}"#))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let frames = body_frames(response).await;
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0]["type"], "content");
    assert_eq!(frames[0]["content"], "Partial");
    assert_eq!(frames[1]["type"], "error");

    assert!(harness.store.get("u1").await.unwrap().is_none());
}

#[tokio::test]
async fn buffered_chat_returns_the_full_response() {
    let harness = harness(vec![happy_script()]);
    let request = Request::builder()
        .method("POST")
        .uri("/chat")
        .header("authorization", "Bearer secret-token")
        .header("content-type", "application/json")
        .body(Body::from(r#"{"message":"Hi"}"#))
        .unwrap();

    let response = harness.app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert_eq!(body["response"], "Hi there");
    assert!(body["usage"]["minuteRemaining"].is_number());

    let stored = harness.store.get("u1").await.unwrap().unwrap();
    assert_eq!(stored.messages.len(), 2);
}

#[tokio::test]
async fn conversation_route_returns_messages_and_usage() {
    let harness = harness(vec![happy_script()]);
    // Seed via one chat turn. Drain the SSE body so the detached turn task
    // reaches `Done` and persists before we query downstream routes.
    let seed = harness
        .app
        .clone()
        .oneshot(chat_request(Some("secret-token"), r#"{"message":"Hi"}"#))
        .await
        .unwrap();
    let _ = body_frames(seed).await;

    let response = harness.app.oneshot(get_request("/conversation")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert_eq!(body["messages"].as_array().unwrap().len(), 2);
    assert_eq!(body["messages"][0]["role"], "user");
    assert!(body["usage"]["minuteRemaining"].is_number());
}

#[tokio::test]
async fn usage_route_is_read_only() {
    let harness = harness(vec![]);

    let first = body_json(
        harness
            .app
            .clone()
            .oneshot(get_request("/usage"))
            .await
            .unwrap(),
    )
    .await;
    let second = body_json(harness.app.oneshot(get_request("/usage")).await.unwrap()).await;

    assert_eq!(first["minuteRemaining"], 5);
    assert_eq!(second["minuteRemaining"], 5);
    assert_eq!(first["messageCount"], 0);
}

#[tokio::test]
async fn clear_route_empties_the_conversation() {
    let harness = harness(vec![happy_script()]);
    // Drain the SSE body so the detached turn task persists before we assert.
    let seed = harness
        .app
        .clone()
        .oneshot(chat_request(Some("secret-token"), r#"{"message":"Hi"}"#))
        .await
        .unwrap();
    let _ = body_frames(seed).await;
    assert!(harness.store.get("u1").await.unwrap().is_some());

    let request = Request::builder()
        .method("POST")
        .uri("/conversation/clear")
        .header("authorization", "Bearer secret-token")
        .body(Body::empty())
        .unwrap();
    let response = harness.app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["success"], true);
    assert!(harness.store.get("u1").await.unwrap().is_none());
}

#[tokio::test]
async fn second_turn_feeds_prior_history_back_to_the_runner() {
    let harness = harness(vec![
        happy_script(),
        vec![
            Ok(RunnerEvent::Delta { content: "Again".into() }),
            Ok(RunnerEvent::Completed { new_items: vec![] }),
        ],
    ]);

    // Drain each SSE body so the detached turn tasks persist in order: turn
    // two reads turn one's history at handler entry, so turn one must land
    // first.
    let first = harness
        .app
        .clone()
        .oneshot(chat_request(Some("secret-token"), r#"{"message":"Hi"}"#))
        .await
        .unwrap();
    let _ = body_frames(first).await;
    let second = harness
        .app
        .oneshot(chat_request(Some("secret-token"), r#"{"message":"More"}"#))
        .await
        .unwrap();
    let _ = body_frames(second).await;

    let stored = harness.store.get("u1").await.unwrap().unwrap();
    assert_eq!(stored.messages.len(), 4);
    // Two turns, four history items: user/assistant per turn.
    assert_eq!(stored.agent_history.len(), 4);
    assert_eq!(stored.agent_history[2]["content"], "More");
}

#[tokio::test]
async fn webhook_verifies_signatures() {
    let body = r#"{"triggerEvent":"BOOKING_CREATED","payload":{"booking":{"uid":"bk_1","start":"2030-01-10T01:00:00.000Z"}}}"#;
    let mut mac = Hmac::<Sha256>::new_from_slice(b"hook-secret").unwrap();
    mac.update(body.as_bytes());
    let signature = hex::encode(mac.finalize().into_bytes());

    let harness = harness(vec![]);
    let valid = Request::builder()
        .method("POST")
        .uri("/webhooks/calendar")
        .header("x-cal-signature-256", &signature)
        .body(Body::from(body))
        .unwrap();
    let response = harness.app.clone().oneshot(valid).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["received"], true);

    let forged = Request::builder()
        .method("POST")
        .uri("/webhooks/calendar")
        .header("x-cal-signature-256", "deadbeef")
        .body(Body::from(body))
        .unwrap();
    let response = harness.app.oneshot(forged).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn health_reports_ok() {
    let harness = harness(vec![]);
    let request = Request::builder()
        .method("GET")
        .uri("/health")
        .body(Body::empty())
        .unwrap();

    let response = harness.app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["status"], "ok");
}
