//! Conversation model — display messages plus the opaque agent history.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

/// A single display message, in insertion (= display) order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl StoredMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Per-user conversation state.
///
/// `messages` and `agent_history` are two projections of the same
/// conversation: `messages` is what the UI renders, `agent_history` is the
/// ordered sequence of structured items understood only by the remote
/// runner. The history is round-tripped verbatim: never reordered,
/// filtered, or rebuilt from `messages`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationState {
    pub user_id: String,
    pub messages: Vec<StoredMessage>,
    pub agent_history: Vec<serde_json::Value>,
    pub updated_at: DateTime<Utc>,
}

impl ConversationState {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            messages: Vec::new(),
            agent_history: Vec::new(),
            updated_at: Utc::now(),
        }
    }

    /// Apply one completed turn: exactly one user entry, one assistant
    /// entry, and the new authoritative agent history.
    pub fn apply_turn(
        &mut self,
        user_msg: StoredMessage,
        assistant_msg: StoredMessage,
        new_agent_history: Vec<serde_json::Value>,
    ) {
        self.messages.push(user_msg);
        self.messages.push(assistant_msg);
        self.agent_history = new_agent_history;
        self.updated_at = Utc::now();
    }
}
