//! Conversation store — KV persistence with a fixed retention window.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use tracing::debug;

use crate::conversation::{ConversationState, StoredMessage};
use crate::error::{PersonaGateError, Result};

/// Storage boundary for per-user conversation state.
///
/// A turn reads once (at turn start) and writes once (at turn end, success
/// path only) through `append_turn`, which is the single mutation point:
/// one user entry, one assistant entry, and the replacement agent history,
/// committed together.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Fetch the state for a user. Entries past the retention window are
    /// treated as absent.
    async fn get(&self, user_id: &str) -> Result<Option<ConversationState>>;

    /// Commit one completed turn and refresh the retention window.
    async fn append_turn(
        &self,
        user_id: &str,
        user_msg: StoredMessage,
        assistant_msg: StoredMessage,
        new_agent_history: Vec<serde_json::Value>,
    ) -> Result<ConversationState>;

    /// Delete the state for a user.
    async fn clear(&self, user_id: &str) -> Result<()>;
}

/// In-memory store with per-entry expiry.
pub struct MemoryConversationStore {
    ttl: Duration,
    entries: Mutex<HashMap<String, MemoryEntry>>,
}

struct MemoryEntry {
    state: ConversationState,
    expires_at: Instant,
}

impl MemoryConversationStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, MemoryEntry>> {
        self.entries
            .lock()
            .expect("conversation store mutex should not be poisoned")
    }
}

#[async_trait]
impl ConversationStore for MemoryConversationStore {
    async fn get(&self, user_id: &str) -> Result<Option<ConversationState>> {
        let mut entries = self.lock();
        match entries.get(user_id) {
            Some(entry) if entry.expires_at > Instant::now() => Ok(Some(entry.state.clone())),
            Some(_) => {
                entries.remove(user_id);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn append_turn(
        &self,
        user_id: &str,
        user_msg: StoredMessage,
        assistant_msg: StoredMessage,
        new_agent_history: Vec<serde_json::Value>,
    ) -> Result<ConversationState> {
        let mut entries = self.lock();
        let now = Instant::now();

        let mut state = match entries.remove(user_id) {
            Some(entry) if entry.expires_at > now => entry.state,
            _ => ConversationState::new(user_id),
        };
        state.apply_turn(user_msg, assistant_msg, new_agent_history);

        entries.insert(
            user_id.to_string(),
            MemoryEntry {
                state: state.clone(),
                expires_at: now + self.ttl,
            },
        );
        Ok(state)
    }

    async fn clear(&self, user_id: &str) -> Result<()> {
        self.lock().remove(user_id);
        Ok(())
    }
}

/// File-backed store — one JSON document per user.
///
/// Layout: `<base>/<hash>.json`, where the hash keeps arbitrary user ids
/// filesystem-safe. The retention window is enforced from the stored
/// `updated_at` on load.
pub struct JsonConversationStore {
    base: PathBuf,
    ttl: Duration,
}

impl JsonConversationStore {
    pub fn new(base: PathBuf, ttl: Duration) -> Self {
        Self { base, ttl }
    }

    /// Default store location: `~/.persona_gate/conversations/`
    pub fn default_path() -> PathBuf {
        crate::config::data_dir().join("conversations")
    }

    fn entry_path(&self, user_id: &str) -> PathBuf {
        self.base.join(format!("{}.json", hash_user_id(user_id)))
    }

    fn expired(&self, state: &ConversationState) -> bool {
        let age = Utc::now().signed_duration_since(state.updated_at);
        age.to_std().map(|a| a > self.ttl).unwrap_or(false)
    }

    async fn load(&self, user_id: &str) -> Result<Option<ConversationState>> {
        let path = self.entry_path(user_id);
        if !path.exists() {
            return Ok(None);
        }
        let data = tokio::fs::read_to_string(&path).await?;
        let state: ConversationState = serde_json::from_str(&data)
            .map_err(|e| PersonaGateError::Store(format!("corrupt conversation entry: {e}")))?;

        if self.expired(&state) {
            tokio::fs::remove_file(&path).await?;
            debug!(user = %user_id, "Expired conversation removed");
            return Ok(None);
        }
        Ok(Some(state))
    }

    async fn save(&self, state: &ConversationState) -> Result<()> {
        tokio::fs::create_dir_all(&self.base).await?;
        let path = self.entry_path(&state.user_id);
        let data = serde_json::to_string(state)?;

        // Atomic write: write to temp then rename
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, data.as_bytes()).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

#[async_trait]
impl ConversationStore for JsonConversationStore {
    async fn get(&self, user_id: &str) -> Result<Option<ConversationState>> {
        self.load(user_id).await
    }

    async fn append_turn(
        &self,
        user_id: &str,
        user_msg: StoredMessage,
        assistant_msg: StoredMessage,
        new_agent_history: Vec<serde_json::Value>,
    ) -> Result<ConversationState> {
        let mut state = self
            .load(user_id)
            .await?
            .unwrap_or_else(|| ConversationState::new(user_id));
        state.apply_turn(user_msg, assistant_msg, new_agent_history);
        self.save(&state).await?;
        debug!(user = %user_id, messages = state.messages.len(), "Saved conversation");
        Ok(state)
    }

    async fn clear(&self, user_id: &str) -> Result<()> {
        let path = self.entry_path(user_id);
        if path.exists() {
            tokio::fs::remove_file(&path).await?;
        }
        debug!(user = %user_id, "Cleared conversation");
        Ok(())
    }
}

/// Stable filesystem-safe hash for a user id.
fn hash_user_id(user_id: &str) -> String {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    user_id.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}
