//! Hosted agent runner — drives the remote model endpoint and executes the
//! tool-calling loop against the tool bridge.
//!
//! Speaks an OpenAI-compatible chat-completions wire format. In streaming
//! mode the run is driven on a background task and surfaced as
//! [`RunOutcome::Events`]; in non-streaming mode one request/response cycle
//! per tool iteration produces a [`RunOutcome::Final`].

use std::collections::BTreeMap;

use anyhow::anyhow;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

use persona_gate_core::config::Config;
use persona_gate_tools::ToolOutput;

use crate::sse::sse_stream;
use crate::{AgentDefinition, AgentRunner, CompletedRun, RunOutcome, RunnerEvent};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

#[derive(Clone)]
pub struct HostedRunner {
    base_url: String,
    api_key: Option<String>,
    stream: bool,
    max_tool_iterations: u32,
    http: reqwest::Client,
}

impl HostedRunner {
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
        stream: bool,
        max_tool_iterations: u32,
    ) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            stream,
            max_tool_iterations,
            http: reqwest::Client::new(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        let runner = config.runner.as_ref();
        Self::new(
            runner
                .and_then(|r| r.base_url.clone())
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            runner.and_then(|r| r.resolve_api_key()),
            config.runner_streams(),
            config.max_tool_iterations(),
        )
    }

    async fn post_completion(
        &self,
        definition: &AgentDefinition,
        items: &[Value],
        stream: bool,
    ) -> anyhow::Result<reqwest::Response> {
        let body = build_request_body(definition, items, stream);

        let mut request = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(anyhow!("runner API error: {status} - {detail}"));
        }
        Ok(response)
    }

    /// Streaming loop: forward content deltas as they arrive, execute tool
    /// calls between iterations, emit `Completed` with this turn's items.
    async fn drive_streaming(
        self,
        definition: AgentDefinition,
        mut items: Vec<Value>,
        tx: mpsc::UnboundedSender<anyhow::Result<RunnerEvent>>,
    ) -> anyhow::Result<()> {
        let mut new_items: Vec<Value> = Vec::new();

        for iteration in 0..self.max_tool_iterations {
            debug!(iteration, "Runner loop iteration");

            let response = self.post_completion(&definition, &items, true).await?;
            let mut events = std::pin::pin!(sse_stream(response));

            let mut text = String::new();
            let mut tool_calls: BTreeMap<usize, ToolCallAccumulator> = BTreeMap::new();
            let mut finish_reason: Option<String> = None;

            while let Some(event) = events.next().await {
                let event = event?;
                if event.data == "[DONE]" {
                    break;
                }
                let chunk: StreamChunk = match serde_json::from_str(&event.data) {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        debug!(%e, "Skipping unparseable stream chunk");
                        continue;
                    }
                };

                for choice in chunk.choices {
                    if let Some(content) = choice.delta.content {
                        if !content.is_empty() {
                            text.push_str(&content);
                            let _ = tx.send(Ok(RunnerEvent::Delta { content }));
                        }
                    }
                    for delta in choice.delta.tool_calls.unwrap_or_default() {
                        let acc = tool_calls.entry(delta.index).or_default();
                        if let Some(id) = delta.id {
                            acc.id = id;
                        }
                        if let Some(function) = delta.function {
                            if let Some(name) = function.name {
                                acc.name = name;
                            }
                            if let Some(arguments) = function.arguments {
                                acc.arguments.push_str(&arguments);
                            }
                        }
                    }
                    if let Some(reason) = choice.finish_reason {
                        finish_reason = Some(reason);
                    }
                }
            }

            if finish_reason.as_deref() == Some("tool_calls") && !tool_calls.is_empty() {
                let calls: Vec<ToolCallAccumulator> = tool_calls.into_values().collect();
                let assistant_item = assistant_tool_call_item(&text, &calls);
                items.push(assistant_item.clone());
                new_items.push(assistant_item);

                for call in &calls {
                    let result_item = execute_tool(&definition, call).await;
                    items.push(result_item.clone());
                    new_items.push(result_item);
                }
                continue;
            }

            if !text.is_empty() {
                new_items.push(json!({ "role": "assistant", "content": text }));
            }
            let _ = tx.send(Ok(RunnerEvent::Completed { new_items }));
            return Ok(());
        }

        Err(anyhow!(
            "runner exceeded {} tool iterations",
            self.max_tool_iterations
        ))
    }

    /// Monolithic loop: one buffered request per iteration, final text only.
    async fn run_buffered(
        &self,
        definition: &AgentDefinition,
        history: &[Value],
    ) -> anyhow::Result<CompletedRun> {
        let mut items = history.to_vec();
        let mut new_items: Vec<Value> = Vec::new();

        for iteration in 0..self.max_tool_iterations {
            debug!(iteration, "Runner loop iteration (buffered)");

            let response = self.post_completion(definition, &items, false).await?;
            let completion: Completion = response.json().await?;
            let choice = completion
                .choices
                .into_iter()
                .next()
                .ok_or_else(|| anyhow!("runner returned no choices"))?;

            let tool_calls = choice.message.tool_calls.unwrap_or_default();
            if choice.finish_reason.as_deref() == Some("tool_calls") && !tool_calls.is_empty() {
                let calls: Vec<ToolCallAccumulator> = tool_calls
                    .into_iter()
                    .map(|call| ToolCallAccumulator {
                        id: call.id,
                        name: call.function.name,
                        arguments: call.function.arguments,
                    })
                    .collect();

                let text = choice.message.content.unwrap_or_default();
                let assistant_item = assistant_tool_call_item(&text, &calls);
                items.push(assistant_item.clone());
                new_items.push(assistant_item);

                for call in &calls {
                    let result_item = execute_tool(definition, call).await;
                    items.push(result_item.clone());
                    new_items.push(result_item);
                }
                continue;
            }

            let output = choice.message.content.unwrap_or_default();
            if !output.is_empty() {
                new_items.push(json!({ "role": "assistant", "content": output }));
            }
            return Ok(CompletedRun { output, new_items });
        }

        Err(anyhow!(
            "runner exceeded {} tool iterations",
            self.max_tool_iterations
        ))
    }
}

#[async_trait]
impl AgentRunner for HostedRunner {
    async fn run(
        &self,
        definition: &AgentDefinition,
        history: &[Value],
    ) -> anyhow::Result<RunOutcome> {
        if self.stream {
            let (tx, rx) = mpsc::unbounded_channel();
            let runner = self.clone();
            let definition = definition.clone();
            let items = history.to_vec();

            tokio::spawn(async move {
                let failures = tx.clone();
                if let Err(e) = runner.drive_streaming(definition, items, tx).await {
                    let _ = failures.send(Err(e));
                }
            });

            Ok(RunOutcome::Events(Box::pin(UnboundedReceiverStream::new(
                rx,
            ))))
        } else {
            Ok(RunOutcome::Final(
                self.run_buffered(definition, history).await?,
            ))
        }
    }
}

// --- Wire types ---

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCallDelta>>,
}

#[derive(Debug, Deserialize)]
struct ToolCallDelta {
    index: usize,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<FunctionDelta>,
}

#[derive(Debug, Default, Deserialize)]
struct FunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Completion {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    #[serde(default)]
    message: CompletionMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct CompletionMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCall>>,
}

#[derive(Debug, Deserialize)]
struct ToolCall {
    id: String,
    function: FunctionCall,
}

#[derive(Debug, Deserialize)]
struct FunctionCall {
    name: String,
    arguments: String,
}

/// Accumulates tool call data across streaming deltas.
#[derive(Debug, Clone, Default)]
struct ToolCallAccumulator {
    id: String,
    name: String,
    arguments: String,
}

// --- Helpers ---

fn build_request_body(definition: &AgentDefinition, items: &[Value], stream: bool) -> Value {
    let mut messages = Vec::with_capacity(items.len() + 1);
    messages.push(json!({ "role": "system", "content": definition.instructions }));
    messages.extend(items.iter().cloned());

    let mut body = serde_json::Map::new();
    body.insert("model".into(), json!(definition.model));
    body.insert("messages".into(), json!(messages));
    body.insert("stream".into(), json!(stream));
    if !definition.tools.is_empty() {
        body.insert("tools".into(), json!(definition.tools.to_model_tools()));
    }
    if let Some(caller) = &definition.tool_context.caller {
        body.insert("user".into(), json!(caller.user_id));
    }

    Value::Object(body)
}

fn assistant_tool_call_item(text: &str, calls: &[ToolCallAccumulator]) -> Value {
    json!({
        "role": "assistant",
        "content": if text.is_empty() { Value::Null } else { Value::String(text.to_string()) },
        "tool_calls": calls
            .iter()
            .map(|call| json!({
                "id": call.id,
                "type": "function",
                "function": { "name": call.name, "arguments": call.arguments },
            }))
            .collect::<Vec<_>>(),
    })
}

async fn execute_tool(definition: &AgentDefinition, call: &ToolCallAccumulator) -> Value {
    info!(tool = %call.name, "Executing tool");

    let params: Value = serde_json::from_str(&call.arguments).unwrap_or_else(|_| json!({}));
    let output = match definition.tools.get(&call.name) {
        Some(tool) => match tool.execute(params, &definition.tool_context).await {
            Ok(output) => output,
            Err(e) => {
                warn!(%e, tool = %call.name, "Tool execution error");
                ToolOutput::error(format!("Tool error: {e}"))
            }
        },
        None => ToolOutput::error(format!("Unknown tool: {}", call.name)),
    };

    json!({
        "role": "tool",
        "tool_call_id": call.id,
        "content": output.content,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use persona_gate_tools::cal_client::{CalendarClient, RetryPolicy};
    use persona_gate_tools::{builtin_tools, CallerIdentity, ToolContext};
    use std::sync::Arc;

    fn test_definition() -> AgentDefinition {
        AgentDefinition {
            instructions: "Be yourself.".into(),
            model: "test-model".into(),
            tools: Arc::new(builtin_tools()),
            tool_context: ToolContext {
                caller: Some(CallerIdentity {
                    user_id: "u1".into(),
                    name: None,
                    email: None,
                }),
                calendar: Arc::new(CalendarClient::new(
                    "http://127.0.0.1:9",
                    None,
                    None,
                    RetryPolicy::default(),
                )),
                config: Arc::new(persona_gate_core::config::Config::default()),
            },
        }
    }

    #[test]
    fn request_body_leads_with_system_instructions() {
        let definition = test_definition();
        let items = vec![json!({ "role": "user", "content": "Hi" })];
        let body = build_request_body(&definition, &items, true);

        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][0]["content"], "Be yourself.");
        assert_eq!(body["messages"][1]["content"], "Hi");
        assert_eq!(body["stream"], true);
        assert_eq!(body["user"], "u1");
        assert!(body["tools"].is_array());
    }

    #[test]
    fn request_body_omits_tools_when_registry_is_empty() {
        let mut definition = test_definition();
        definition.tools = Arc::new(persona_gate_tools::ToolRegistry::new());
        let body = build_request_body(&definition, &[], false);

        assert!(body.get("tools").is_none());
        assert_eq!(body["stream"], false);
    }

    #[test]
    fn assistant_item_carries_accumulated_tool_calls() {
        let calls = vec![ToolCallAccumulator {
            id: "call_1".into(),
            name: "get_caller_identity".into(),
            arguments: "{}".into(),
        }];
        let item = assistant_tool_call_item("", &calls);

        assert_eq!(item["role"], "assistant");
        assert!(item["content"].is_null());
        assert_eq!(item["tool_calls"][0]["function"]["name"], "get_caller_identity");
    }

    #[tokio::test]
    async fn unknown_tool_produces_error_result_item() {
        let definition = test_definition();
        let call = ToolCallAccumulator {
            id: "call_9".into(),
            name: "no_such_tool".into(),
            arguments: "{}".into(),
        };
        let item = execute_tool(&definition, &call).await;

        assert_eq!(item["role"], "tool");
        assert_eq!(item["tool_call_id"], "call_9");
        assert!(item["content"].as_str().unwrap().contains("Unknown tool"));
    }
}
