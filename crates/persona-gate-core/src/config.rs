//! Configuration loading and validation.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Top-level PersonaGate configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server: Option<ServerConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub limits: Option<LimitsConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation: Option<ConversationConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub runner: Option<RunnerConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub pacing: Option<PacingConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub calendar: Option<CalendarConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// When true (the default), an in-flight turn runs to completion and is
    /// persisted even if the client disconnects mid-stream.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_on_disconnect: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Static bearer-token table. The identity provider itself is external;
    /// this is the boundary shim used for self-hosting and tests.
    #[serde(default)]
    pub tokens: Vec<TokenEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenEntry {
    pub token: String,
    pub user_id: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LimitsConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub per_minute: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub per_day: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConversationConfig {
    /// Retention window for stored conversations, in seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl_secs: Option<u64>,

    /// Directory for the file-backed store. When unset, conversations are
    /// kept in memory only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<String>,
}

/// Configuration for the hosted agent runner endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunnerConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// When false, the runner is driven in its monolithic (non-streaming)
    /// shape and the driver synthesizes the client-facing stream.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tool_iterations: Option<u32>,

    /// Persona instructions, inline.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,

    /// Persona instructions loaded from a file (takes priority over inline).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions_file: Option<String>,
}

impl RunnerConfig {
    /// Resolve the API key: check `api_key` field first, then `api_key_env`.
    pub fn resolve_api_key(&self) -> Option<String> {
        resolve_secret_field(&self.api_key, &self.api_key_env)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PacingConfig {
    /// Delay between forwarded fragments from a native runner stream.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delta_delay_ms: Option<u64>,

    /// Delay between synthesized word-group chunks.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk_delay_ms: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub words_per_chunk: Option<usize>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CalendarConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_type_id: Option<u64>,

    /// IANA timezone used for slot display.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,

    /// Minimum booking notice, in hours.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_lead_hours: Option<i64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub slot_minutes: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhook_secret: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhook_secret_env: Option<String>,
}

impl CalendarConfig {
    pub fn resolve_api_key(&self) -> Option<String> {
        resolve_secret_field(&self.api_key, &self.api_key_env)
    }

    pub fn resolve_webhook_secret(&self) -> Option<String> {
        resolve_secret_field(&self.webhook_secret, &self.webhook_secret_env)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default tracing filter directive (e.g. "persona_gate=debug").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
}

/// Resolve a secret: check the direct value first, then the env-var reference.
pub fn resolve_secret_field(direct: &Option<String>, env_var: &Option<String>) -> Option<String> {
    if let Some(val) = direct {
        if !val.is_empty() {
            return Some(val.clone());
        }
    }
    if let Some(env) = env_var {
        if let Ok(val) = std::env::var(env) {
            if !val.is_empty() {
                return Some(val);
            }
        }
    }
    None
}

/// Substitute `${ENV_VAR}` patterns in a string with their environment variable values.
fn substitute_env_vars(input: &str) -> String {
    let re = regex::Regex::new(r"\$\{([^}]+)\}").unwrap();
    re.replace_all(input, |caps: &regex::Captures| {
        let var_name = &caps[1];
        std::env::var(var_name).unwrap_or_default()
    })
    .into_owned()
}

/// Resolve the PersonaGate data directory: `~/.persona_gate/`
pub fn data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".persona_gate")
}

impl Config {
    /// Load config from a JSON5 file, substituting `${ENV_VAR}` references.
    pub fn load(path: &Path) -> crate::error::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path).map_err(crate::error::PersonaGateError::Io)?;
        let substituted = substitute_env_vars(&raw);

        let config: Config = json5::from_str(&substituted)
            .map_err(|e| crate::error::PersonaGateError::Config(e.to_string()))?;

        Ok(config)
    }

    /// Default config file location: `~/.persona_gate/config.json5`
    pub fn default_path() -> PathBuf {
        data_dir().join("config.json5")
    }

    pub fn bind_addr(&self) -> String {
        self.server
            .as_ref()
            .and_then(|s| s.bind.clone())
            .unwrap_or_else(|| "0.0.0.0".to_string())
    }

    pub fn port(&self) -> u16 {
        self.server.as_ref().and_then(|s| s.port).unwrap_or(8787)
    }

    pub fn finish_on_disconnect(&self) -> bool {
        self.server
            .as_ref()
            .and_then(|s| s.finish_on_disconnect)
            .unwrap_or(true)
    }

    pub fn per_minute_limit(&self) -> u32 {
        self.limits.as_ref().and_then(|l| l.per_minute).unwrap_or(10)
    }

    pub fn per_day_limit(&self) -> u32 {
        self.limits.as_ref().and_then(|l| l.per_day).unwrap_or(100)
    }

    /// Conversation retention window in seconds (default: 7 days).
    pub fn conversation_ttl_secs(&self) -> u64 {
        self.conversation
            .as_ref()
            .and_then(|c| c.ttl_secs)
            .unwrap_or(60 * 60 * 24 * 7)
    }

    pub fn conversation_data_dir(&self) -> Option<PathBuf> {
        self.conversation
            .as_ref()
            .and_then(|c| c.data_dir.as_deref())
            .map(|d| PathBuf::from(shellexpand::tilde(d).into_owned()))
    }

    pub fn runner_model(&self) -> String {
        self.runner
            .as_ref()
            .and_then(|r| r.model.clone())
            .unwrap_or_else(|| "gpt-4o-mini".to_string())
    }

    pub fn runner_streams(&self) -> bool {
        self.runner.as_ref().and_then(|r| r.stream).unwrap_or(true)
    }

    pub fn max_tool_iterations(&self) -> u32 {
        self.runner
            .as_ref()
            .and_then(|r| r.max_tool_iterations)
            .unwrap_or(10)
    }

    /// Persona instructions: file takes priority, then inline, then a
    /// minimal built-in default.
    pub fn runner_instructions(&self) -> String {
        if let Some(runner) = &self.runner {
            if let Some(path) = &runner.instructions_file {
                let expanded = shellexpand::tilde(path).into_owned();
                if let Ok(text) = std::fs::read_to_string(&expanded) {
                    return text;
                }
                tracing::warn!(path = %expanded, "Could not read instructions file, falling back");
            }
            if let Some(inline) = &runner.instructions {
                return inline.clone();
            }
        }
        "You are a helpful professional assistant answering questions about \
         your own career and experience, in first person."
            .to_string()
    }

    pub fn delta_delay_ms(&self) -> u64 {
        self.pacing.as_ref().and_then(|p| p.delta_delay_ms).unwrap_or(30)
    }

    pub fn chunk_delay_ms(&self) -> u64 {
        self.pacing.as_ref().and_then(|p| p.chunk_delay_ms).unwrap_or(80)
    }

    pub fn words_per_chunk(&self) -> usize {
        self.pacing
            .as_ref()
            .and_then(|p| p.words_per_chunk)
            .unwrap_or(4)
            .max(1)
    }

    pub fn calendar_timezone(&self) -> String {
        self.calendar
            .as_ref()
            .and_then(|c| c.timezone.clone())
            .unwrap_or_else(|| "Australia/Sydney".to_string())
    }

    pub fn min_lead_hours(&self) -> i64 {
        self.calendar
            .as_ref()
            .and_then(|c| c.min_lead_hours)
            .unwrap_or(24)
    }

    pub fn slot_minutes(&self) -> u32 {
        self.calendar.as_ref().and_then(|c| c.slot_minutes).unwrap_or(15)
    }
}
