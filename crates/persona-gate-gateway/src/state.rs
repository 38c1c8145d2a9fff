//! Gateway shared state.

use std::sync::Arc;

use persona_gate_core::config::Config;
use persona_gate_core::store::ConversationStore;
use persona_gate_runner::{AgentDefinition, AgentRunner};
use persona_gate_tools::{builtin_tools, CalendarClient, CallerIdentity, ToolContext, ToolRegistry};

use crate::auth::TokenVerifier;
use crate::rate_limit::RateLimiter;

/// Shared state accessible from all handlers.
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<dyn ConversationStore>,
    pub limiter: RateLimiter,
    pub runner: Arc<dyn AgentRunner>,
    pub tools: Arc<ToolRegistry>,
    pub calendar: Arc<CalendarClient>,
    pub verifier: TokenVerifier,
}

impl AppState {
    pub fn new(
        config: Arc<Config>,
        store: Arc<dyn ConversationStore>,
        runner: Arc<dyn AgentRunner>,
    ) -> Self {
        let limiter = RateLimiter::new(config.per_minute_limit(), config.per_day_limit());
        let verifier = TokenVerifier::from_config(&config);
        let calendar = Arc::new(CalendarClient::from_config(&config));

        Self {
            config,
            store,
            limiter,
            runner,
            tools: Arc::new(builtin_tools()),
            calendar,
            verifier,
        }
    }

    /// Per-turn agent definition with the caller threaded into the tool
    /// context.
    pub fn definition_for(&self, caller: &CallerIdentity) -> AgentDefinition {
        AgentDefinition {
            instructions: self.config.runner_instructions(),
            model: self.config.runner_model(),
            tools: self.tools.clone(),
            tool_context: ToolContext {
                caller: Some(caller.clone()),
                calendar: self.calendar.clone(),
                config: self.config.clone(),
            },
        }
    }
}
