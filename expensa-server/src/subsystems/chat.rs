//! Turn pipeline: upload → extraction → model stream → persistence.
//!
//! A turn holds its session's turn gate from start to finish, so turns
//! within one session never interleave. The context itself is locked only
//! to read history and to record the finished exchange. Store failures are
//! reported as
//! [`TurnEvent::Warning`] and never withhold the reply.

use std::pin::Pin;
use std::sync::Arc;

use expensa_core::llm::ChatMessage;
use expensa_core::models::MessageRole;
use expensa_core::store::{ConversationStore, StoreError};
use expensa_ingest::{DocumentExtractor, ExtractOutcome, UploadedFile};
use futures::{Stream, StreamExt};
use uuid::Uuid;

use super::sessions::{FileInfo, SharedSession};

pub type TurnStream = Pin<Box<dyn Stream<Item = TurnEvent> + Send>>;

#[derive(Debug, Clone)]
pub struct TurnInput {
    pub prompt: String,
    pub upload: Option<UploadedFile>,
}

#[derive(Debug, Clone)]
pub enum TurnEvent {
    Document(FileInfo),
    Fragment(String),
    Warning(String),
    Done {
        reply: String,
        conversation_id: Option<i64>,
    },
}

impl TurnEvent {
    pub fn name(&self) -> &'static str {
        match self {
            TurnEvent::Document(_) => "document",
            TurnEvent::Fragment(_) => "fragment",
            TurnEvent::Warning(_) => "warning",
            TurnEvent::Done { .. } => "done",
        }
    }

    pub fn payload(&self) -> serde_json::Value {
        match self {
            TurnEvent::Document(info) => serde_json::json!(info),
            TurnEvent::Fragment(text) => serde_json::json!({ "text": text }),
            TurnEvent::Warning(message) => serde_json::json!({ "message": message }),
            TurnEvent::Done {
                reply,
                conversation_id,
            } => serde_json::json!({
                "reply": reply,
                "conversation_id": conversation_id,
            }),
        }
    }
}

/// Dependencies shared by every turn.
pub struct ChatService {
    pub store: Option<ConversationStore>,
    pub extractor: DocumentExtractor,
    pub history_window: usize,
}

/// `"{prompt}\n\nDocument Content:\n{text}"`, or the bare prompt.
pub fn combine_prompt(prompt: &str, document_text: Option<&str>) -> String {
    match document_text {
        Some(text) => format!("{prompt}\n\nDocument Content:\n{text}"),
        None => prompt.to_string(),
    }
}

pub fn describe_upload(file: &UploadedFile, outcome: &ExtractOutcome) -> FileInfo {
    let name = file.name.clone();
    let size = file.size();

    match outcome {
        ExtractOutcome::Text(text) => {
            let text_chars = text.chars().count();
            FileInfo {
                message: format!(
                    "File Uploaded: {}\nSize: {} bytes\nExtracted Text Length: {} characters",
                    name.as_deref().unwrap_or("(unnamed)"),
                    size,
                    text_chars
                ),
                name,
                size,
                status: outcome.kind(),
                text_chars: Some(text_chars),
            }
        }
        ExtractOutcome::Rejected(rejection) => FileInfo {
            message: format!("Could not extract text from the uploaded file. {rejection}"),
            name,
            size,
            status: outcome.kind(),
            text_chars: None,
        },
        other => FileInfo {
            message: other.to_string(),
            name,
            size,
            status: other.kind(),
            text_chars: None,
        },
    }
}

/// Find the conversation for this session, creating it on first use.
pub async fn ensure_conversation(
    store: &ConversationStore,
    session_id: &Uuid,
) -> Result<i64, StoreError> {
    let key = session_id.to_string();
    if let Some(existing) = store.conversation_by_session_id(&key).await? {
        return Ok(existing.id);
    }
    store
        .create_conversation(&key, Some(serde_json::json!({ "source": "expensa-server" })))
        .await
}

pub fn run_turn(service: Arc<ChatService>, session: SharedSession, input: TurnInput) -> TurnStream {
    Box::pin(async_stream::stream! {
        let turn_gate = session.lock().await.turn_gate.clone();
        let _turn = turn_gate.lock_owned().await;

        let (session_id, mut conversation_id, backend) = {
            let ctx = session.lock().await;
            (ctx.session_id, ctx.conversation_id, ctx.backend.clone())
        };

        let prompt = input.prompt.trim().to_string();
        if prompt.is_empty() {
            yield TurnEvent::Warning("Please enter a message.".to_string());
            return;
        }

        if let (Some(store), None) = (&service.store, conversation_id) {
            match ensure_conversation(store, &session_id).await {
                Ok(id) => {
                    conversation_id = Some(id);
                    session.lock().await.conversation_id = Some(id);
                }
                Err(e) => {
                    tracing::warn!(%session_id, error = %e, "Could not initialize conversation");
                    yield TurnEvent::Warning(format!("Could not initialize database connection: {e}"));
                }
            }
        }

        let mut attachment = None;
        let mut document_text = None;
        let mut file_data = None;
        if let Some(file) = &input.upload {
            let outcome = service.extractor.extract(file).await;
            let info = describe_upload(file, &outcome);
            tracing::info!(%session_id, status = info.status, size = info.size, "Processed upload");

            if outcome.was_processed() {
                file_data = Some(file.bytes.clone());
            }
            document_text = outcome.text().map(str::to_string);
            attachment = Some(info.clone());
            yield TurnEvent::Document(info);
        }

        let combined = combine_prompt(&prompt, document_text.as_deref());
        let mut messages = session.lock().await.history_messages(service.history_window);
        messages.push(ChatMessage::user(combined.clone()));

        let mut reply = String::new();
        let mut fragments = backend.chat_completion_stream(messages);
        while let Some(fragment) = fragments.next().await {
            reply.push_str(&fragment);
            yield TurnEvent::Fragment(fragment);
        }
        drop(fragments);

        let model_content = (combined != prompt).then_some(combined);
        {
            let mut ctx = session.lock().await;
            ctx.record(MessageRole::User, prompt.clone(), model_content, attachment);
            if !reply.is_empty() {
                ctx.record(MessageRole::Assistant, reply.clone(), None, None);
            }
        }
        if reply.is_empty() {
            yield TurnEvent::Warning("The assistant returned an empty reply.".to_string());
        }

        if let (Some(store), Some(conversation_id)) = (&service.store, conversation_id) {
            if let Err(e) = store
                .save_message(conversation_id, MessageRole::User, &prompt, file_data.as_deref())
                .await
            {
                tracing::warn!(conversation_id, error = %e, "Could not save message");
                yield TurnEvent::Warning(format!("Could not save message to database: {e}"));
            }

            if !reply.is_empty() {
                if let Err(e) = store
                    .save_message(conversation_id, MessageRole::Assistant, &reply, None)
                    .await
                {
                    tracing::warn!(conversation_id, error = %e, "Could not save response");
                    yield TurnEvent::Warning(format!("Could not save response to database: {e}"));
                }
            }
        }

        tracing::info!(%session_id, reply_chars = reply.chars().count(), "Turn complete");
        yield TurnEvent::Done {
            reply,
            conversation_id,
        };
    })
}
