pub mod config;
pub mod db;
pub mod error;
pub mod llm;
pub mod models;
pub mod retry;
pub mod store;

pub use config::ExpensaConfig;
pub use error::ExpensaError;
pub use llm::{
    ChatBackend, ChatClient, ChatMessage, ChatRole, ConfigUpdate, FragmentStream, LlmError,
    ModelConfig, ModelInfo, DEFAULT_BASE_URL, DEFAULT_MODEL,
};
pub use models::{Conversation, ConversationStats, Message, MessageRole};
pub use store::{ConversationStore, StoreError};
