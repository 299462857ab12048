//! Expensa HTTP API
//!
//! Axum server for the expense assistant. Each endpoint has a thin axum
//! handler that delegates to an inner function returning
//! `(StatusCode, serde_json::Value)`, so the logic is testable without
//! going through the router.
//!
//! Endpoints:
//! - GET    /health                 — health check with DB status
//! - GET    /version                — server version info
//! - POST   /sessions               — start a session
//! - GET    /sessions/:id           — HTML transcript
//! - GET    /sessions/:id/messages  — message history (JSON)
//! - POST   /sessions/:id/turns     — multipart prompt + file, SSE reply
//! - PATCH  /sessions/:id/config    — update model settings
//! - GET    /sessions/:id/stats     — message counts
//! - DELETE /sessions/:id           — delete session and conversation

use std::convert::Infallible;
use std::sync::Arc;

use anyhow::Result;
use axum::extract::{DefaultBodyLimit, Multipart, Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use expensa_core::llm::ConfigUpdate;
use expensa_core::models::ConversationStats;
use expensa_core::store::ConversationStore;
use expensa_core::ExpensaConfig;
use expensa_ingest::{file_extension, UploadedFile};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::render::{render_transcript, TranscriptView};
use crate::subsystems::chat::{ensure_conversation, run_turn, ChatService, TurnInput, TurnStream};
use crate::subsystems::sessions::{SessionRegistry, SharedSession};

/// Extensions the upload form accepts. Narrower than what the extractor knows.
pub const ACCEPTED_UPLOAD_EXTENSIONS: [&str; 6] = [".pdf", ".png", ".jpg", ".jpeg", ".txt", ".csv"];

const DEFAULT_MESSAGE_LIMIT: i64 = 50;

/// Multipart overhead allowed on top of the configured file size limit.
const MULTIPART_SLACK_BYTES: usize = 1024 * 1024;

/// Shared state for all HTTP handlers
pub struct HttpState {
    pub config: ExpensaConfig,
    pub sessions: SessionRegistry,
    pub chat: Arc<ChatService>,
}

impl HttpState {
    pub fn store(&self) -> Option<&ConversationStore> {
        self.chat.store.as_ref()
    }
}

/// Build the Axum router with all endpoints
pub fn build_router(state: Arc<HttpState>) -> Router {
    let body_limit = usize::try_from(state.config.extraction.max_file_size_bytes)
        .unwrap_or(usize::MAX)
        .saturating_add(MULTIPART_SLACK_BYTES);

    Router::new()
        .route("/health", get(health_handler))
        .route("/version", get(version_handler))
        .route("/sessions", post(create_session_handler))
        .route(
            "/sessions/:id",
            get(transcript_handler).delete(delete_session_handler),
        )
        .route("/sessions/:id/messages", get(messages_handler))
        .route(
            "/sessions/:id/turns",
            post(turn_handler).layer(DefaultBodyLimit::max(body_limit)),
        )
        .route("/sessions/:id/config", patch(config_handler))
        .route("/sessions/:id/stats", get(stats_handler))
        .with_state(state)
}

/// Start the HTTP server on the configured address.
/// Gracefully shuts down when the broadcast shutdown signal fires.
pub async fn start_http_server(
    state: Arc<HttpState>,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let addr = format!("{}:{}", state.config.http.host, state.config.http.port);

    let app = build_router(state);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Expensa HTTP API listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
            tracing::info!("HTTP server shutting down...");
        })
        .await?;

    Ok(())
}

// ============================================================================
// Request / Response DTOs
// ============================================================================

#[derive(Debug, Deserialize, Default)]
pub struct MessagesQuery {
    pub limit: Option<i64>,
}

/// A parsed turn form. Both fields are optional at this stage.
#[derive(Debug, Default)]
pub struct TurnRequest {
    pub prompt: Option<String>,
    pub file: Option<UploadedFile>,
}

/// Standard HTTP error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub status: String,
}

impl ErrorResponse {
    pub fn new(msg: impl Into<String>) -> Self {
        Self {
            error: msg.into(),
            status: "error".to_string(),
        }
    }
}

fn error_body(status: StatusCode, msg: impl Into<String>) -> (StatusCode, serde_json::Value) {
    (status, serde_json::json!(ErrorResponse::new(msg)))
}

fn session_not_found(id: &Uuid) -> (StatusCode, serde_json::Value) {
    error_body(StatusCode::NOT_FOUND, format!("session {} not found", id))
}

// ============================================================================
// Inner (directly testable) business logic functions
// ============================================================================

/// Inner health check — queries the store when one is configured.
pub async fn health_inner(state: &HttpState) -> (StatusCode, serde_json::Value) {
    let sessions = state.sessions.len().await;

    let Some(store) = state.store() else {
        return (
            StatusCode::OK,
            serde_json::json!({
                "status": "degraded",
                "version": env!("CARGO_PKG_VERSION"),
                "postgresql": "unavailable",
                "sessions": sessions,
            }),
        );
    };

    match store.health_check().await {
        Ok(pg_ver) => (
            StatusCode::OK,
            serde_json::json!({
                "status": "healthy",
                "version": env!("CARGO_PKG_VERSION"),
                "postgresql": pg_ver,
                "sessions": sessions,
            }),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            serde_json::json!({
                "status": "unhealthy",
                "error": e.to_string(),
            }),
        ),
    }
}

/// Inner version — returns version info (pure, no IO).
pub fn version_inner() -> serde_json::Value {
    serde_json::json!({
        "version": env!("CARGO_PKG_VERSION"),
        "protocol": "expensa/1",
    })
}

/// Inner create session — registers a context and, if possible, its conversation.
pub async fn create_session_inner(state: &HttpState) -> (StatusCode, serde_json::Value) {
    let (session_id, session) = match state.sessions.create().await {
        Ok(created) => created,
        Err(e) => {
            tracing::error!(error = %e, "Failed to create session");
            return error_body(StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
        }
    };

    let mut warning = None;
    let mut conversation_id = None;
    if let Some(store) = state.store() {
        match ensure_conversation(store, &session_id).await {
            Ok(id) => {
                session.lock().await.conversation_id = Some(id);
                conversation_id = Some(id);
            }
            Err(e) => {
                tracing::warn!(%session_id, error = %e, "Could not initialize conversation");
                warning = Some(format!("Could not initialize database connection: {}", e));
            }
        }
    }

    (
        StatusCode::CREATED,
        serde_json::json!({
            "session_id": session_id,
            "conversation_id": conversation_id,
            "warning": warning,
        }),
    )
}

/// Inner messages — persisted history when available, else the in-memory transcript.
pub async fn messages_inner(
    state: &HttpState,
    session_id: Uuid,
    query: MessagesQuery,
) -> (StatusCode, serde_json::Value) {
    let Some(session) = state.sessions.get(&session_id).await else {
        return session_not_found(&session_id);
    };
    let limit = query.limit.unwrap_or(DEFAULT_MESSAGE_LIMIT).max(0);
    let ctx = session.lock().await;

    if let (Some(store), Some(conversation_id)) = (state.store(), ctx.conversation_id) {
        return match store.list_messages(conversation_id, limit).await {
            Ok(messages) => {
                let items: Vec<serde_json::Value> = messages
                    .iter()
                    .map(|m| {
                        serde_json::json!({
                            "id": m.id,
                            "role": m.role,
                            "content": m.content,
                            "created_at": m.created_at,
                            "has_file": m.file_data.is_some(),
                        })
                    })
                    .collect();
                (
                    StatusCode::OK,
                    serde_json::json!({
                        "source": "database",
                        "conversation_id": conversation_id,
                        "messages": items,
                    }),
                )
            }
            Err(e) => error_body(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        };
    }

    let take = usize::try_from(limit).unwrap_or(usize::MAX);
    let items: Vec<serde_json::Value> = ctx
        .transcript
        .iter()
        .take(take)
        .map(|entry| {
            serde_json::json!({
                "role": entry.role,
                "content": entry.content,
                "created_at": entry.created_at,
                "has_file": entry.attachment.is_some(),
            })
        })
        .collect();

    (
        StatusCode::OK,
        serde_json::json!({
            "source": "session",
            "conversation_id": null,
            "messages": items,
        }),
    )
}

/// Inner config update — merges recognised model settings.
pub async fn config_inner(
    state: &HttpState,
    session_id: Uuid,
    update: ConfigUpdate,
) -> (StatusCode, serde_json::Value) {
    let Some(session) = state.sessions.get(&session_id).await else {
        return session_not_found(&session_id);
    };
    let backend = session.lock().await.backend.clone();
    backend.update_config(update);
    (StatusCode::OK, serde_json::json!(backend.model_info()))
}

/// Inner stats — message counts for the session's conversation.
pub async fn stats_inner(state: &HttpState, session_id: Uuid) -> (StatusCode, serde_json::Value) {
    let Some(session) = state.sessions.get(&session_id).await else {
        return session_not_found(&session_id);
    };
    let ctx = session.lock().await;

    if let (Some(store), Some(conversation_id)) = (state.store(), ctx.conversation_id) {
        return match store.conversation_stats(conversation_id).await {
            Ok(stats) => (StatusCode::OK, serde_json::json!(stats)),
            Err(e) => error_body(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        };
    }

    let mut stats = ConversationStats::default();
    for entry in &ctx.transcript {
        stats.total_messages += 1;
        match entry.role {
            expensa_core::MessageRole::User => stats.user_messages += 1,
            expensa_core::MessageRole::Assistant => stats.assistant_messages += 1,
        }
    }
    (StatusCode::OK, serde_json::json!(stats))
}

/// Inner delete — drops the session and cascades its conversation.
pub async fn delete_session_inner(
    state: &HttpState,
    session_id: Uuid,
) -> (StatusCode, serde_json::Value) {
    let Some(session) = state.sessions.get(&session_id).await else {
        return session_not_found(&session_id);
    };
    let conversation_id = session.lock().await.conversation_id;

    // The session stays registered until its conversation is gone, so a
    // failed delete can be retried.
    let mut conversation_deleted = false;
    if let (Some(store), Some(id)) = (state.store(), conversation_id) {
        match store.delete_conversation(id).await {
            Ok(deleted) => conversation_deleted = deleted,
            Err(e) => {
                tracing::warn!(conversation_id = id, error = %e, "Failed to delete conversation");
                return error_body(StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
            }
        }
    }
    state.sessions.remove(&session_id).await;

    (
        StatusCode::OK,
        serde_json::json!({
            "deleted": true,
            "conversation_deleted": conversation_deleted,
        }),
    )
}

/// Inner transcript — renders the session as HTML.
pub async fn transcript_inner(
    state: &HttpState,
    session_id: Uuid,
) -> Result<String, (StatusCode, serde_json::Value)> {
    let Some(session) = state.sessions.get(&session_id).await else {
        return Err(session_not_found(&session_id));
    };
    let ctx = session.lock().await;
    let view = TranscriptView {
        session_id: session_id.to_string(),
        conversation_id: ctx.conversation_id,
        model: ctx.backend.model_info().model,
        messages: &ctx.transcript,
    };
    render_transcript(&view).map_err(|e| {
        tracing::error!(error = %e, "Failed to render transcript");
        error_body(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    })
}

/// Inner turn — validates the form and starts the pipeline.
pub async fn turn_inner(
    state: &HttpState,
    session_id: Uuid,
    req: TurnRequest,
) -> Result<TurnStream, (StatusCode, serde_json::Value)> {
    let session: SharedSession = match state.sessions.get(&session_id).await {
        Some(s) => s,
        None => return Err(session_not_found(&session_id)),
    };

    let prompt = match req.prompt {
        Some(p) if !p.trim().is_empty() => p,
        _ => {
            return Err(error_body(
                StatusCode::BAD_REQUEST,
                "prompt field is required",
            ))
        }
    };

    if let Some(file) = &req.file {
        let ext = file.name.as_deref().map(file_extension).unwrap_or_default();
        if !ACCEPTED_UPLOAD_EXTENSIONS.contains(&ext.as_str()) {
            return Err(error_body(
                StatusCode::UNSUPPORTED_MEDIA_TYPE,
                format!(
                    "unsupported upload type '{}'; accepted: {}",
                    ext,
                    ACCEPTED_UPLOAD_EXTENSIONS.join(" ")
                ),
            ));
        }
    }

    Ok(run_turn(
        state.chat.clone(),
        session,
        TurnInput {
            prompt,
            upload: req.file,
        },
    ))
}

// ============================================================================
// Axum handler wrappers (thin — delegate to inner functions)
// ============================================================================

pub async fn health_handler(State(state): State<Arc<HttpState>>) -> impl IntoResponse {
    let (status, body) = health_inner(&state).await;
    (status, Json(body))
}

pub async fn version_handler() -> impl IntoResponse {
    (StatusCode::OK, Json(version_inner()))
}

pub async fn create_session_handler(State(state): State<Arc<HttpState>>) -> impl IntoResponse {
    let (status, body) = create_session_inner(&state).await;
    (status, Json(body))
}

pub async fn transcript_handler(
    State(state): State<Arc<HttpState>>,
    Path(id): Path<Uuid>,
) -> Response {
    match transcript_inner(&state, id).await {
        Ok(html) => Html(html).into_response(),
        Err((status, body)) => (status, Json(body)).into_response(),
    }
}

pub async fn messages_handler(
    State(state): State<Arc<HttpState>>,
    Path(id): Path<Uuid>,
    Query(query): Query<MessagesQuery>,
) -> impl IntoResponse {
    let (status, body) = messages_inner(&state, id, query).await;
    (status, Json(body))
}

pub async fn turn_handler(
    State(state): State<Arc<HttpState>>,
    Path(id): Path<Uuid>,
    multipart: Multipart,
) -> Response {
    let req = match read_turn_form(multipart).await {
        Ok(req) => req,
        Err((status, body)) => return (status, Json(body)).into_response(),
    };

    match turn_inner(&state, id, req).await {
        Ok(events) => {
            let sse = events.map(|event| {
                Ok::<_, Infallible>(
                    Event::default()
                        .event(event.name())
                        .data(event.payload().to_string()),
                )
            });
            Sse::new(sse).keep_alive(KeepAlive::default()).into_response()
        }
        Err((status, body)) => (status, Json(body)).into_response(),
    }
}

pub async fn config_handler(
    State(state): State<Arc<HttpState>>,
    Path(id): Path<Uuid>,
    Json(update): Json<ConfigUpdate>,
) -> impl IntoResponse {
    let (status, body) = config_inner(&state, id, update).await;
    (status, Json(body))
}

pub async fn stats_handler(
    State(state): State<Arc<HttpState>>,
    Path(id): Path<Uuid>,
) -> impl IntoResponse {
    let (status, body) = stats_inner(&state, id).await;
    (status, Json(body))
}

pub async fn delete_session_handler(
    State(state): State<Arc<HttpState>>,
    Path(id): Path<Uuid>,
) -> impl IntoResponse {
    let (status, body) = delete_session_inner(&state, id).await;
    (status, Json(body))
}

// ============================================================================
// Helpers
// ============================================================================

/// Collect the `prompt` and `file` parts of a turn form. Other parts are ignored.
pub async fn read_turn_form(
    mut multipart: Multipart,
) -> std::result::Result<TurnRequest, (StatusCode, serde_json::Value)> {
    let mut req = TurnRequest::default();

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => return Err(error_body(e.status(), e.body_text())),
        };

        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "prompt" => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| error_body(e.status(), e.body_text()))?;
                req.prompt = Some(text);
            }
            "file" => {
                let file_name = field.file_name().map(str::to_string);
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| error_body(e.status(), e.body_text()))?;
                // Browsers send an empty part when no file was chosen.
                if file_name.as_deref().unwrap_or_default().is_empty() && bytes.is_empty() {
                    continue;
                }
                req.file = Some(UploadedFile {
                    name: file_name,
                    bytes,
                });
            }
            other => tracing::debug!(field = other, "Ignoring unknown form field"),
        }
    }

    Ok(req)
}

// ============================================================================
// Unit Tests — call inner functions directly
// ============================================================================
