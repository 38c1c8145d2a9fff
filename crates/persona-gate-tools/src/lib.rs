//! Tool bridge — callable operations the remote agent may invoke.
//!
//! Each operation implements the [`Tool`] trait. Tools receive an explicit
//! per-turn [`ToolContext`] carrying the authenticated caller; there is no
//! ambient "current user" state anywhere in this crate.

use std::sync::Arc;

use async_trait::async_trait;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use persona_gate_core::config::Config;

pub mod cal_client;
pub mod calendar;
pub mod identity;

pub use cal_client::{CalendarClient, RetryPolicy};

/// The authenticated principal driving the current turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallerIdentity {
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

/// Context provided to tools during execution, constructed fresh per turn.
#[derive(Clone)]
pub struct ToolContext {
    pub caller: Option<CallerIdentity>,
    pub calendar: Arc<CalendarClient>,
    pub config: Arc<Config>,
}

impl ToolContext {
    /// The IANA timezone used for slot display, falling back to the
    /// configured default when the string does not parse.
    pub fn display_timezone(&self) -> Tz {
        self.config
            .calendar_timezone()
            .parse()
            .unwrap_or(chrono_tz::Australia::Sydney)
    }
}

/// Output from a tool execution. The content string is relayed to the agent
/// conversationally; `is_error` marks descriptive failures that should not
/// abort the turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolOutput {
    pub content: String,
    pub is_error: bool,
}

impl ToolOutput {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: true,
        }
    }
}

/// The core tool trait. Every bridge operation implements this.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Tool name as exposed to the agent (e.g., "book_meeting").
    fn name(&self) -> &str;

    /// JSON Schema describing the tool's parameters.
    fn parameters_schema(&self) -> serde_json::Value;

    /// Human-readable description for the agent.
    fn description(&self) -> &str;

    /// Execute the tool with the given parameters.
    async fn execute(
        &self,
        params: serde_json::Value,
        context: &ToolContext,
    ) -> anyhow::Result<ToolOutput>;
}

/// Registry of available tools.
#[derive(Default)]
pub struct ToolRegistry {
    tools: Vec<Box<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Box<dyn Tool>) {
        self.tools.push(tool);
    }

    pub fn get(&self, name: &str) -> Option<&dyn Tool> {
        self.tools.iter().find(|t| t.name() == name).map(|t| t.as_ref())
    }

    pub fn list(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.name()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Generate tool definitions for the runner request.
    pub fn to_model_tools(&self) -> Vec<serde_json::Value> {
        self.tools
            .iter()
            .map(|t| {
                serde_json::json!({
                    "type": "function",
                    "function": {
                        "name": t.name(),
                        "description": t.description(),
                        "parameters": t.parameters_schema(),
                    }
                })
            })
            .collect()
    }
}

/// The standard bridge: calendar operations plus caller identity.
pub fn builtin_tools() -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(Box::new(calendar::CurrentDateTimeTool));
    registry.register(Box::new(calendar::CheckAvailabilityTool));
    registry.register(Box::new(calendar::BookMeetingTool));
    registry.register(Box::new(identity::GetCallerIdentityTool));
    registry
}
