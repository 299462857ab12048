//! HTML rendering for session transcripts.

use std::sync::OnceLock;

use minijinja::{AutoEscape, Environment};
use serde::Serialize;

use crate::subsystems::sessions::TranscriptEntry;

pub const TRANSCRIPT_TPL: &str = include_str!("../assets/transcript.html.jinja");
const TRANSCRIPT: &str = "transcript.html";

static GLOBAL_ENV: OnceLock<Environment<'static>> = OnceLock::new();

fn init_environment() -> Environment<'static> {
    let mut env = Environment::new();
    // Model output and extracted document text are untrusted.
    env.set_auto_escape_callback(|_| AutoEscape::Html);

    if let Err(e) = env.add_template(TRANSCRIPT, TRANSCRIPT_TPL) {
        tracing::error!(error = %e, "Failed to load transcript template");
    }
    env
}

pub fn get_environment() -> &'static Environment<'static> {
    GLOBAL_ENV.get_or_init(init_environment)
}

#[derive(Debug, Serialize)]
pub struct TranscriptView<'a> {
    pub session_id: String,
    pub conversation_id: Option<i64>,
    pub model: String,
    pub messages: &'a [TranscriptEntry],
}

pub fn render_transcript(view: &TranscriptView<'_>) -> Result<String, minijinja::Error> {
    let tpl = get_environment().get_template(TRANSCRIPT)?;
    tpl.render(view)
}
