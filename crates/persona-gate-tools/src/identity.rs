//! Caller identity tool — exposes the authenticated principal to the agent.

use async_trait::async_trait;
use serde_json::json;

use crate::{Tool, ToolContext, ToolOutput};

/// Tool: name/email of the authenticated caller, for pre-filling bookings.
///
/// The identity comes from the per-turn context resolved at the gateway
/// boundary; this tool performs no lookups of its own.
pub struct GetCallerIdentityTool;

#[async_trait]
impl Tool for GetCallerIdentityTool {
    fn name(&self) -> &str {
        "get_caller_identity"
    }

    fn description(&self) -> &str {
        "Get the authenticated user's name and email. Use this before booking \
         a meeting to pre-fill attendee information, and always ask the user \
         to confirm the details before proceeding."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {}
        })
    }

    async fn execute(
        &self,
        _params: serde_json::Value,
        context: &ToolContext,
    ) -> anyhow::Result<ToolOutput> {
        let payload = match &context.caller {
            Some(caller) => json!({
                "name": caller.name.clone().unwrap_or_default(),
                "email": caller.email.clone().unwrap_or_default(),
                "has_name": caller.name.is_some(),
                "has_email": caller.email.is_some(),
            }),
            None => json!({
                "name": "",
                "email": "",
                "has_name": false,
                "has_email": false,
                "error": "User not authenticated",
            }),
        };

        Ok(ToolOutput::text(serde_json::to_string(&payload)?))
    }
}
