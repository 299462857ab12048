//! expensa-cli — terminal front end for the Expensa document assistant
//!
//! Talks to a running `expensa-server` over HTTP. A chat turn posts the
//! prompt (and optionally one document) and prints the streamed reply as
//! it arrives.
//!
//! # Subcommands
//! - `chat [--file <path>] [--session <id>] <prompt>` — send one turn
//! - `status`                                         — show server health

use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::Deserialize;

const DEFAULT_SERVER: &str = "http://127.0.0.1:8501";

// ============================================================================
// CLI Definition
// ============================================================================

#[derive(Debug, Parser)]
#[command(
    name = "expensa-cli",
    version,
    about = "Expensa — ask questions about expense documents from the terminal"
)]
struct Cli {
    /// Expensa HTTP server URL (overrides EXPENSA_URL env var)
    #[arg(long, env = "EXPENSA_URL", default_value = DEFAULT_SERVER)]
    server: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Send a prompt, optionally with a document attached
    Chat {
        /// Question or instruction for the assistant
        prompt: String,

        /// Document to upload with the prompt (pdf, png, jpg, jpeg, txt, csv)
        #[arg(short, long)]
        file: Option<String>,

        /// Continue an existing session instead of starting a new one
        #[arg(short, long)]
        session: Option<String>,
    },

    /// Show server health
    Status,
}

// ============================================================================
// Wire Types
// ============================================================================

#[derive(Debug, Deserialize)]
struct SessionCreated {
    session_id: String,
    #[serde(default)]
    conversation_id: Option<i64>,
    #[serde(default)]
    warning: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DocumentPayload {
    #[serde(default)]
    name: Option<String>,
    status: String,
    #[serde(default)]
    text_chars: Option<usize>,
    #[serde(default)]
    message: Option<String>,
}

/// One server-sent event from the turn stream.
#[derive(Debug, Clone, PartialEq)]
pub struct SseEvent {
    pub event: String,
    pub data: String,
}

/// Incremental SSE decoder: feed lines, get complete events back.
#[derive(Debug, Default)]
pub struct SseDecoder {
    event: Option<String>,
    data: Vec<String>,
}

impl SseDecoder {
    /// Feed one line (without its trailing newline). A blank line ends
    /// the current event.
    pub fn push_line(&mut self, line: &str) -> Option<SseEvent> {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.is_empty() {
            return self.flush();
        }
        if line.starts_with(':') {
            return None;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            _ => {}
        }
        None
    }

    fn flush(&mut self) -> Option<SseEvent> {
        if self.data.is_empty() && self.event.is_none() {
            return None;
        }
        let event = SseEvent {
            event: self.event.take().unwrap_or_else(|| "message".to_string()),
            data: self.data.join("\n"),
        };
        self.data.clear();
        Some(event)
    }
}

/// Human-readable line for a `document` event.
pub fn describe_document(data: &str) -> String {
    let Ok(doc) = serde_json::from_str::<DocumentPayload>(data) else {
        return format!("[document] {data}");
    };
    let name = doc.name.as_deref().unwrap_or("(unnamed)");
    match (doc.status.as_str(), doc.text_chars, doc.message) {
        ("text", Some(chars), _) => {
            format!("[document] {}: extracted {} characters", name, chars)
        }
        (_, _, Some(message)) => format!("[document] {}: {}", name, message),
        (status, _, None) => format!("[document] {}: {}", name, status),
    }
}

// ============================================================================
// HTTP Client Calls
// ============================================================================

fn create_session(client: &reqwest::blocking::Client, server: &str) -> anyhow::Result<String> {
    let url = format!("{}/sessions", server);
    let resp = client.post(&url).send()?;
    if !resp.status().is_success() {
        let status = resp.status();
        let body = resp.text().unwrap_or_default();
        anyhow::bail!("server returned {} creating session: {}", status, body);
    }
    let created: SessionCreated = resp.json()?;
    if let Some(warning) = created.warning {
        eprintln!("expensa-cli: {}", warning);
    }
    if let Some(id) = created.conversation_id {
        eprintln!("Session {} (conversation {})", created.session_id, id);
    } else {
        eprintln!("Session {}", created.session_id);
    }
    Ok(created.session_id)
}

/// Post one turn and stream the reply to stdout.
fn do_chat(
    server: &str,
    prompt: &str,
    file: Option<&str>,
    session: Option<String>,
) -> anyhow::Result<()> {
    // Model calls can retry for a while; no overall timeout on the stream
    let client = reqwest::blocking::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .timeout(None)
        .build()?;

    let session_id = match session {
        Some(id) => id,
        None => create_session(&client, server)?,
    };

    let mut form = reqwest::blocking::multipart::Form::new().text("prompt", prompt.to_string());
    if let Some(path) = file {
        let bytes = std::fs::read(path)
            .map_err(|e| anyhow::anyhow!("cannot read {}: {}", path, e))?;
        let name = Path::new(path)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.to_string());
        form = form.part("file", reqwest::blocking::multipart::Part::bytes(bytes).file_name(name));
    }

    let url = format!("{}/sessions/{}/turns", server, session_id);
    let resp = match client.post(&url).multipart(form).send() {
        Ok(r) => r,
        Err(e) => {
            eprintln!("expensa-cli: connection failed to {}: {}", url, e);
            std::process::exit(1);
        }
    };

    if !resp.status().is_success() {
        let status = resp.status();
        let body = resp.text().unwrap_or_default();
        eprintln!("expensa-cli: server returned {}: {}", status, body);
        std::process::exit(1);
    }

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    let mut decoder = SseDecoder::default();
    let mut finished = false;

    for line in BufReader::new(resp).lines() {
        let Some(event) = decoder.push_line(&line?) else {
            continue;
        };
        let data: serde_json::Value = serde_json::from_str(&event.data).unwrap_or_default();
        match event.event.as_str() {
            "document" => eprintln!("{}", describe_document(&event.data)),
            "fragment" => {
                write!(out, "{}", data["text"].as_str().unwrap_or(""))?;
                out.flush()?;
            }
            "warning" => eprintln!(
                "expensa-cli: warning: {}",
                data["message"].as_str().unwrap_or(&event.data)
            ),
            "done" => {
                writeln!(out)?;
                finished = true;
            }
            _ => {}
        }
    }

    if !finished {
        writeln!(out)?;
        anyhow::bail!("stream ended before the reply completed");
    }
    eprintln!("-- session {}", session_id);
    Ok(())
}

/// Show the server status by calling GET /health.
fn do_status(server: &str) -> anyhow::Result<()> {
    let client = reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()?;

    let url = format!("{}/health", server);
    let resp = client.get(&url).send();

    match resp {
        Ok(r) if r.status().is_success() => {
            let body: serde_json::Value = r.json().unwrap_or_default();
            println!("Expensa server: {}", body["status"].as_str().unwrap_or("unknown"));
            println!("Version:        {}", body["version"].as_str().unwrap_or("?"));
            println!("PostgreSQL:     {}", body["postgresql"].as_str().unwrap_or("?"));
            println!("Sessions:       {}", body["sessions"].as_u64().unwrap_or(0));
        }
        Ok(r) => {
            let status = r.status();
            eprintln!("expensa-cli: server unhealthy (HTTP {})", status);
            std::process::exit(1);
        }
        Err(e) => {
            eprintln!("expensa-cli: cannot reach {}: {}", url, e);
            std::process::exit(1);
        }
    }

    Ok(())
}

// ============================================================================
// Main
// ============================================================================

fn main() {
    let cli = Cli::parse();
    let server = cli.server.trim_end_matches('/').to_string();

    let result = match cli.command {
        Commands::Chat { prompt, file, session } => {
            do_chat(&server, &prompt, file.as_deref(), session)
        }
        Commands::Status => do_status(&server),
    };

    if let Err(e) = result {
        eprintln!("expensa-cli: {}", e);
        std::process::exit(1);
    }
}

// ============================================================================
// Tests
// ============================================================================
