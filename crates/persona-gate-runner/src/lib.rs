//! Remote agent runner — the execution engine at its interface boundary.
//!
//! The runner is an opaque collaborator: it takes a persona definition plus
//! the opaque history items and produces either a native event stream or a
//! monolithic final result. Downstream code only ever consumes the
//! [`RunOutcome`] abstraction and must support both shapes.

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;

use persona_gate_tools::{ToolContext, ToolRegistry};

pub mod hosted;
pub mod sse;

pub use hosted::HostedRunner;

/// A raw event from the runner's native stream.
#[derive(Debug, Clone)]
pub enum RunnerEvent {
    /// Incremental content. Successive payloads may legally be a pure
    /// suffix, the accumulated text plus a suffix, or the full text so
    /// far; consumers must not assume which.
    Delta { content: String },

    /// The run finished. `new_items` are the opaque structured items
    /// generated this turn (may be empty).
    Completed { new_items: Vec<serde_json::Value> },
}

pub type RunnerEventStream = Pin<Box<dyn Stream<Item = anyhow::Result<RunnerEvent>> + Send>>;

/// The two shapes a runner invocation may produce.
pub enum RunOutcome {
    /// Native incremental stream.
    Events(RunnerEventStream),

    /// Monolithic result; downstream synthesizes the client-facing stream.
    Final(CompletedRun),
}

#[derive(Debug, Clone)]
pub struct CompletedRun {
    pub output: String,
    pub new_items: Vec<serde_json::Value>,
}

/// Everything the runner needs for one turn: the persona, the model, and
/// the tool bridge with its per-turn context. The caller identity rides in
/// `tool_context`, threaded explicitly per run rather than through globals.
#[derive(Clone)]
pub struct AgentDefinition {
    pub instructions: String,
    pub model: String,
    pub tools: Arc<ToolRegistry>,
    pub tool_context: ToolContext,
}

/// The remote agent execution engine.
#[async_trait]
pub trait AgentRunner: Send + Sync {
    /// Drive one run over the given history. Each invocation is a fresh
    /// turn; a returned stream is single-consumer and not restartable.
    async fn run(
        &self,
        definition: &AgentDefinition,
        history: &[serde_json::Value],
    ) -> anyhow::Result<RunOutcome>;
}
