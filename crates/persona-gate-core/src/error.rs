use thiserror::Error;

#[derive(Debug, Error)]
pub enum PersonaGateError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Auth error: {0}")]
    Auth(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Runner error: {0}")]
    Runner(String),

    #[error("Tool error: {0}")]
    Tool(String),

    #[error("Gateway error: {0}")]
    Gateway(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, PersonaGateError>;
