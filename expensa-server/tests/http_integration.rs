//! HTTP integration tests for the Expensa API
//!
//! The model API is a wiremock server; no database is required. Requests go
//! through the full router with `oneshot`.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use expensa_core::llm::ModelConfig;
use expensa_core::ExpensaConfig;
use expensa_ingest::DocumentExtractor;
use expensa_server::http::{build_router, HttpState};
use expensa_server::subsystems::chat::ChatService;
use expensa_server::subsystems::sessions::{client_factory, SessionRegistry};
use lopdf::content::{Content, Operation};
use lopdf::{dictionary, Document, Object, Stream};
use serde_json::{json, Value};
use tower::ServiceExt;
use wiremock::matchers::{body_partial_json, body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const BOUNDARY: &str = "expensa-test-boundary";

fn model_config(base_url: &str) -> ModelConfig {
    ModelConfig {
        api_key: "test-api-key".to_string(),
        model: "llama-3.3-70b-versatile".to_string(),
        max_tokens: 4096,
        temperature: 0.7,
        max_retries: 2,
        retry_delay_ms: 5,
        base_url: base_url.to_string(),
    }
}

/// Router with a fresh registry and no store, talking to `llm`.
fn make_app(llm: &MockServer) -> Router {
    let state = Arc::new(HttpState {
        config: ExpensaConfig::default(),
        sessions: SessionRegistry::new(client_factory(model_config(&llm.uri()))),
        chat: Arc::new(ChatService {
            store: None,
            extractor: DocumentExtractor::default(),
            history_window: 10,
        }),
    });
    build_router(state)
}

fn sse_body(fragments: &[&str]) -> String {
    let mut body = String::new();
    for fragment in fragments {
        let chunk = json!({ "choices": [{ "index": 0, "delta": { "content": fragment } }] });
        body.push_str(&format!("data: {}\n\n", chunk));
    }
    body.push_str("data: [DONE]\n\n");
    body
}

/// A one-page PDF per entry, each with a single line of Courier text.
fn build_pdf(pages: &[&str]) -> Vec<u8> {
    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();
    let font_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Courier",
    });
    let resources_id = doc.add_object(dictionary! {
        "Font" => dictionary! { "F1" => font_id },
    });

    let mut kids: Vec<Object> = Vec::new();
    for line in pages {
        let content = Content {
            operations: vec![
                Operation::new("BT", vec![]),
                Operation::new("Tf", vec!["F1".into(), 12.into()]),
                Operation::new("Td", vec![72.into(), 720.into()]),
                Operation::new("Tj", vec![Object::string_literal(*line)]),
                Operation::new("ET", vec![]),
            ],
        };
        let content_id = doc.add_object(Stream::new(dictionary! {}, content.encode().unwrap()));
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "Contents" => content_id,
        });
        kids.push(page_id.into());
    }

    let count = kids.len() as i64;
    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => count,
            "Resources" => resources_id,
            "MediaBox" => vec![0.into(), 0.into(), 612.into(), 792.into()],
        }),
    );
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);

    let mut buf = Vec::new();
    doc.save_to(&mut buf).unwrap();
    buf
}

fn multipart_body(prompt: &str, file: Option<(&str, &[u8])>) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(
        format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"prompt\"\r\n\r\n{prompt}\r\n"
        )
        .as_bytes(),
    );
    if let Some((name, bytes)) = file {
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{name}\"\r\nContent-Type: application/octet-stream\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(bytes);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
    body
}

async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Vec<u8>) {
    let resp = app.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, body.to_vec())
}

async fn create_session(app: &Router) -> String {
    let req = Request::builder()
        .method("POST")
        .uri("/sessions")
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(app, req).await;
    assert_eq!(status, StatusCode::CREATED);
    let json: Value = serde_json::from_slice(&body).unwrap();
    json["session_id"].as_str().unwrap().to_string()
}

fn turn_request(session_id: &str, body: Vec<u8>) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(format!("/sessions/{}/turns", session_id))
        .header(
            "content-type",
            format!("multipart/form-data; boundary={}", BOUNDARY),
        )
        .body(Body::from(body))
        .unwrap()
}

/// (event name, JSON payload) pairs in arrival order.
fn parse_sse(body: &[u8]) -> Vec<(String, Value)> {
    let text = String::from_utf8_lossy(body);
    let mut events = Vec::new();
    for block in text.split("\n\n") {
        let mut name = None;
        let mut data = String::new();
        for line in block.lines() {
            if let Some(rest) = line.strip_prefix("event:") {
                name = Some(rest.trim().to_string());
            } else if let Some(rest) = line.strip_prefix("data:") {
                data.push_str(rest.trim_start());
            }
        }
        if let Some(name) = name {
            events.push((name, serde_json::from_str(&data).unwrap_or(Value::Null)));
        }
    }
    events
}

// ===========================================================================
// TEST 1: GET /version via oneshot — returns version and protocol
// ===========================================================================
#[tokio::test]
async fn test_version_endpoint() {
    let llm = MockServer::start().await;
    let app = make_app(&llm);

    let req = Request::builder()
        .method("GET")
        .uri("/version")
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&app, req).await;
    assert_eq!(status, StatusCode::OK);

    let json: Value = serde_json::from_slice(&body).unwrap();
    assert!(json["version"].is_string());
    assert_eq!(json["protocol"], "expensa/1");
}

// ===========================================================================
// TEST 2: report.pdf + "Summarize expenses" — document event, fragments, done
// ===========================================================================
#[tokio::test]
async fn test_pdf_upload_turn_end_to_end() {
    let llm = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_partial_json(json!({ "stream": true })))
        .and(body_string_contains("Summarize expenses\\n\\nDocument Content:"))
        .and(body_string_contains("Airfare 412.00"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                .set_body_string(sse_body(&["Total ", "expenses: ", "$530.25"])),
        )
        .expect(1)
        .mount(&llm)
        .await;

    let app = make_app(&llm);
    let session_id = create_session(&app).await;

    let pdf = build_pdf(&["Airfare 412.00", "Hotel 118.25"]);
    let (status, body) = send(
        &app,
        turn_request(
            &session_id,
            multipart_body("Summarize expenses", Some(("report.pdf", pdf.as_slice()))),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let events = parse_sse(&body);
    let names: Vec<&str> = events.iter().map(|(n, _)| n.as_str()).collect();
    assert_eq!(names, vec!["document", "fragment", "fragment", "fragment", "done"]);

    let document = &events[0].1;
    assert_eq!(document["name"], "report.pdf");
    assert_eq!(document["status"], "text");
    assert_eq!(document["size"], pdf.len() as u64);

    let streamed: String = events
        .iter()
        .filter(|(n, _)| n == "fragment")
        .map(|(_, p)| p["text"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(streamed, "Total expenses: $530.25");
    assert_eq!(events[4].1["reply"], streamed);

    // Without a store the transcript lives in the session
    let req = Request::builder()
        .uri(format!("/sessions/{}/messages", session_id))
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&app, req).await;
    assert_eq!(status, StatusCode::OK);
    let json: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["messages"][0]["content"], "Summarize expenses");
    assert_eq!(json["messages"][0]["has_file"], true);
    assert_eq!(json["messages"][1]["content"], "Total expenses: $530.25");
}

// ===========================================================================
// TEST 3: rate-limited model — single high-demand fragment, turn still ends
// ===========================================================================
#[tokio::test]
async fn test_rate_limited_turn_yields_placeholder() {
    let llm = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(429))
        .expect(3)
        .mount(&llm)
        .await;

    let app = make_app(&llm);
    let session_id = create_session(&app).await;

    let (status, body) = send(&app, turn_request(&session_id, multipart_body("hi", None))).await;
    assert_eq!(status, StatusCode::OK);

    let events = parse_sse(&body);
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].0, "fragment");
    assert_eq!(
        events[0].1["text"],
        expensa_core::llm::HIGH_DEMAND_MESSAGE
    );
    assert_eq!(events[1].0, "done");
}

// ===========================================================================
// TEST 4: unaccepted upload type is refused before the model is called
// ===========================================================================
#[tokio::test]
async fn test_unaccepted_upload_is_415() {
    let llm = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&llm)
        .await;

    let app = make_app(&llm);
    let session_id = create_session(&app).await;

    let (status, body) = send(
        &app,
        turn_request(
            &session_id,
            multipart_body("run this", Some(("payload.exe", b"MZ".as_slice()))),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::UNSUPPORTED_MEDIA_TYPE);
    let json: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["status"], "error");
}

// ===========================================================================
// TEST 5: transcript HTML escapes model output
// ===========================================================================
#[tokio::test]
async fn test_transcript_escapes_model_output() {
    let llm = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200).set_body_string(sse_body(&["<img src=x onerror=alert(1)>"])),
        )
        .mount(&llm)
        .await;

    let app = make_app(&llm);
    let session_id = create_session(&app).await;
    let _ = send(&app, turn_request(&session_id, multipart_body("hello", None))).await;

    let req = Request::builder()
        .uri(format!("/sessions/{}", session_id))
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&app, req).await;
    assert_eq!(status, StatusCode::OK);

    let html = String::from_utf8(body).unwrap();
    assert!(html.contains("&lt;img"));
    assert!(!html.contains("<img src=x"));
}

// ===========================================================================
// TEST 6: PATCH config then stats and delete
// ===========================================================================
#[tokio::test]
async fn test_config_stats_and_delete() {
    let llm = MockServer::start().await;
    let app = make_app(&llm);
    let session_id = create_session(&app).await;

    let req = Request::builder()
        .method("PATCH")
        .uri(format!("/sessions/{}/config", session_id))
        .header("content-type", "application/json")
        .body(Body::from(
            json!({ "temperature": 0.2, "model": "llama-3.1-8b-instant", "top_k": 3 }).to_string(),
        ))
        .unwrap();
    let (status, body) = send(&app, req).await;
    assert_eq!(status, StatusCode::OK);
    let info: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(info["model"], "llama-3.1-8b-instant");
    assert_eq!(info["max_tokens"], 4096);
    assert_eq!(info["provider"], "Groq");

    let req = Request::builder()
        .uri(format!("/sessions/{}/stats", session_id))
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&app, req).await;
    assert_eq!(status, StatusCode::OK);
    let stats: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(stats["total_messages"], 0);

    let req = Request::builder()
        .method("DELETE")
        .uri(format!("/sessions/{}", session_id))
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&app, req).await;
    assert_eq!(status, StatusCode::OK);

    let req = Request::builder()
        .uri(format!("/sessions/{}/stats", session_id))
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&app, req).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

// ===========================================================================
// TEST 7: malformed session id is a client error
// ===========================================================================
#[tokio::test]
async fn test_malformed_session_id() {
    let llm = MockServer::start().await;
    let app = make_app(&llm);

    let req = Request::builder()
        .uri("/sessions/not-a-uuid/stats")
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&app, req).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}
