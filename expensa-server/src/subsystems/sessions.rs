//! Per-session state.
//!
//! Each browser or CLI session owns a [`SessionContext`]: its id, the lazily
//! created conversation row, the displayed transcript and its own model
//! backend. Contexts are handed to the turn pipeline explicitly; the
//! registry is the only place they are stored.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use expensa_core::llm::{ChatBackend, ChatClient, ChatMessage, LlmError, ModelConfig};
use expensa_core::models::MessageRole;
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

pub type SharedSession = Arc<Mutex<SessionContext>>;

/// Creates the model backend for a new session.
pub type BackendFactory = Arc<dyn Fn() -> Result<Arc<dyn ChatBackend>, LlmError> + Send + Sync>;

/// One [`ChatClient`] per session, all starting from `config`.
pub fn client_factory(config: ModelConfig) -> BackendFactory {
    Arc::new(move || -> Result<Arc<dyn ChatBackend>, LlmError> {
        let client = ChatClient::new(config.clone())?;
        Ok(Arc::new(client))
    })
}

/// What was shown to the user about an upload.
#[derive(Debug, Clone, Serialize)]
pub struct FileInfo {
    pub name: Option<String>,
    pub size: u64,
    pub status: &'static str,
    pub text_chars: Option<usize>,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TranscriptEntry {
    pub role: MessageRole,
    pub content: String,
    /// Text the model saw for this entry when it differs from `content`.
    #[serde(skip)]
    pub model_content: Option<String>,
    pub attachment: Option<FileInfo>,
    pub created_at: DateTime<Utc>,
}

pub struct SessionContext {
    pub session_id: Uuid,
    pub conversation_id: Option<i64>,
    pub transcript: Vec<TranscriptEntry>,
    pub backend: Arc<dyn ChatBackend>,
    pub created_at: DateTime<Utc>,
    /// Held for the length of a turn. The context lock itself is only taken
    /// briefly, so reads stay responsive while a reply streams.
    pub turn_gate: Arc<Mutex<()>>,
}

impl SessionContext {
    pub fn new(backend: Arc<dyn ChatBackend>) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            conversation_id: None,
            transcript: Vec::new(),
            backend,
            created_at: Utc::now(),
            turn_gate: Arc::new(Mutex::new(())),
        }
    }

    /// The last `window` transcript entries as model messages, oldest first.
    pub fn history_messages(&self, window: usize) -> Vec<ChatMessage> {
        let start = self.transcript.len().saturating_sub(window);
        self.transcript[start..]
            .iter()
            .map(|entry| {
                let content = entry.model_content.as_deref().unwrap_or(&entry.content);
                ChatMessage::new(entry.role.into(), content)
            })
            .collect()
    }

    pub fn record(
        &mut self,
        role: MessageRole,
        content: impl Into<String>,
        model_content: Option<String>,
        attachment: Option<FileInfo>,
    ) {
        self.transcript.push(TranscriptEntry {
            role,
            content: content.into(),
            model_content,
            attachment,
            created_at: Utc::now(),
        });
    }
}

pub struct SessionRegistry {
    sessions: RwLock<HashMap<Uuid, SharedSession>>,
    factory: BackendFactory,
}

impl SessionRegistry {
    pub fn new(factory: BackendFactory) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            factory,
        }
    }

    pub async fn create(&self) -> Result<(Uuid, SharedSession), LlmError> {
        let backend = (self.factory)()?;
        let context = SessionContext::new(backend);
        let session_id = context.session_id;
        let shared = Arc::new(Mutex::new(context));

        self.sessions.write().await.insert(session_id, shared.clone());
        tracing::info!(%session_id, "Session created");
        Ok((session_id, shared))
    }

    pub async fn get(&self, session_id: &Uuid) -> Option<SharedSession> {
        self.sessions.read().await.get(session_id).cloned()
    }

    pub async fn remove(&self, session_id: &Uuid) -> Option<SharedSession> {
        let removed = self.sessions.write().await.remove(session_id);
        if removed.is_some() {
            tracing::info!(%session_id, "Session removed");
        }
        removed
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
