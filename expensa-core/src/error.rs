use thiserror::Error;

/// Startup and wiring failures. Per-concern errors convert into this with `?`.
#[derive(Error, Debug)]
pub enum ExpensaError {
    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Invalid setting {key}: {reason}")]
    InvalidSetting { key: &'static str, reason: String },

    #[error("Store error: {0}")]
    Store(#[from] crate::store::StoreError),

    #[error("Model client error: {0}")]
    Llm(#[from] crate::llm::LlmError),
}
