use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::error::ExpensaError;
use crate::llm::{ModelConfig, DEFAULT_BASE_URL};

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ExpensaConfig {
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub model: ModelSettings,
    #[serde(default)]
    pub extraction: ExtractionSettings,
    #[serde(default)]
    pub http: HttpConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServiceConfig {
    pub log_level: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Connection string. Normally supplied through `DATABASE_URL`.
    pub url: Option<String>,
    pub max_connections: u32,
    pub acquire_timeout_seconds: u64,
    /// Connections older than this are closed and reopened.
    pub max_lifetime_seconds: u64,
    pub connect_retries: usize,
    pub connect_retry_delay_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 30,
            acquire_timeout_seconds: 30,
            max_lifetime_seconds: 3600,
            connect_retries: 3,
            connect_retry_delay_ms: 1000,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ModelSettings {
    pub model: Option<String>,
    pub base_url: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub max_retries: usize,
    pub retry_delay_ms: u64,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            model: None,
            base_url: DEFAULT_BASE_URL.to_string(),
            max_tokens: 4096,
            temperature: 0.7,
            max_retries: 3,
            retry_delay_ms: 1000,
        }
    }
}

impl ModelSettings {
    /// Build a client config. The API key comes from `GROQ_API_KEY`, the model
    /// from the settings file, then `GROQ_MODEL`, then the built-in default.
    pub fn to_model_config(&self) -> ModelConfig {
        let mut config = ModelConfig::new(None, self.model.clone());
        config.base_url = self.base_url.clone();
        config.max_tokens = self.max_tokens;
        config.temperature = self.temperature;
        config.max_retries = self.max_retries;
        config.retry_delay_ms = self.retry_delay_ms;
        config
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ExtractionSettings {
    pub max_file_size_bytes: u64,
    pub max_file_name_len: usize,
}

impl Default for ExtractionSettings {
    fn default() -> Self {
        Self {
            max_file_size_bytes: 50 * 1024 * 1024,
            max_file_name_len: 255,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct HttpConfig {
    pub host: String,
    pub port: u16,
    /// Number of earlier messages replayed to the model on each turn.
    pub history_window: usize,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8501,
            history_window: 10,
        }
    }
}

impl ExpensaConfig {
    /// Load `path` (optional) layered with `EXPENSA__SECTION__KEY` variables.
    /// `DATABASE_URL` always wins for the connection string.
    pub fn load(path: &str) -> Result<Self, ExpensaError> {
        let config: Self = Self::layered(path)?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    fn layered(path: &str) -> Result<Config, ConfigError> {
        Config::builder()
            .add_source(File::with_name(path).required(false))
            .add_source(
                Environment::with_prefix("EXPENSA")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .set_override_option("database.url", std::env::var("DATABASE_URL").ok())?
            .build()
    }

    /// Reject settings that would make the server unusable.
    pub fn validate(&self) -> Result<(), ExpensaError> {
        if self.extraction.max_file_size_bytes == 0 {
            return Err(ExpensaError::InvalidSetting {
                key: "extraction.max_file_size_bytes",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.database.max_connections == 0 {
            return Err(ExpensaError::InvalidSetting {
                key: "database.max_connections",
                reason: "must be greater than zero".to_string(),
            });
        }
        if !(0.0..=2.0).contains(&self.model.temperature) {
            return Err(ExpensaError::InvalidSetting {
                key: "model.temperature",
                reason: format!("{} is outside 0.0..=2.0", self.model.temperature),
            });
        }
        Ok(())
    }
}
