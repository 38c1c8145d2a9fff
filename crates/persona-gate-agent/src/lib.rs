//! Agent stream driver — drives exactly one conversational turn.
//!
//! The driver invokes the remote runner, normalizes its raw output into a
//! deduplicated, ordered [`StreamEvent`] sequence, and reconciles the
//! authoritative history for persistence. It works identically over both
//! runner shapes: a native incremental stream is deduplicated in place,
//! and a monolithic result is re-chunked into word groups so downstream
//! consumers always observe incremental behavior.

use std::time::Duration;

use persona_gate_core::config::Config;

pub mod chunk;
pub mod dedup;
pub mod driver;

pub use driver::run_turn;

/// Canonical event sequence for one turn: zero or more `Content` fragments
/// followed by exactly one terminal `Done` or `Error`.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// A fragment of assistant output, never repeating previously
    /// delivered text (except under the verbatim fallback, which prefers
    /// a visible duplicate over dropped data).
    Content { text: String },

    /// Terminal success: the complete assistant message and the new
    /// authoritative history to persist.
    Done {
        full_text: String,
        updated_history: Vec<serde_json::Value>,
    },

    /// Terminal failure: no partial content should be treated as committed.
    Error { message: String },
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Content { .. })
    }
}

/// Typing-cadence policy. Zeroing every field is valid and makes the
/// driver emit as fast as the runner produces.
#[derive(Debug, Clone, Copy)]
pub struct TurnPacing {
    /// Delay between forwarded fragments from a native stream.
    pub delta_delay: Duration,
    /// Delay between synthesized word-group chunks.
    pub chunk_delay: Duration,
    pub words_per_chunk: usize,
}

impl TurnPacing {
    pub const fn immediate() -> Self {
        Self {
            delta_delay: Duration::ZERO,
            chunk_delay: Duration::ZERO,
            words_per_chunk: 4,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self {
            delta_delay: Duration::from_millis(config.delta_delay_ms()),
            chunk_delay: Duration::from_millis(config.chunk_delay_ms()),
            words_per_chunk: config.words_per_chunk(),
        }
    }
}
