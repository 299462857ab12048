//! PDF text extraction with a primary and a fallback parser.
//!
//! lopdf reads the document page by page first. If it errors or finds no
//! text, pdf-extract reads the same bytes again from the start. Both run on
//! the blocking pool; a parser panic surfaces as a join error and is treated
//! like any other failure.

use bytes::Bytes;
use lopdf::Document;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::outcome::{ExtractOutcome, FormatCategory, Notice};

#[derive(Error, Debug)]
pub enum PdfError {
    #[error("failed to load PDF: {0}")]
    Load(String),

    #[error("failed to read page {page}: {reason}")]
    Page { page: u32, reason: String },

    #[error("PDF parser task failed: {0}")]
    Task(String),
}

/// Produces raw text for every page of a PDF, in page order.
pub trait PageSource: Send + Sync {
    fn name(&self) -> &'static str;

    fn page_texts(&self, bytes: &[u8]) -> Result<Vec<String>, PdfError>;
}

/// Per-page text via lopdf's content-stream interpreter.
pub struct LopdfPages;

impl PageSource for LopdfPages {
    fn name(&self) -> &'static str {
        "lopdf"
    }

    fn page_texts(&self, bytes: &[u8]) -> Result<Vec<String>, PdfError> {
        let doc = Document::load_mem(bytes).map_err(|e| PdfError::Load(e.to_string()))?;

        doc.get_pages()
            .keys()
            .map(|&page| {
                doc.extract_text(&[page]).map_err(|e| PdfError::Page {
                    page,
                    reason: e.to_string(),
                })
            })
            .collect()
    }
}

/// Per-page text via pdf-extract.
pub struct PdfExtractPages;

impl PageSource for PdfExtractPages {
    fn name(&self) -> &'static str {
        "pdf-extract"
    }

    fn page_texts(&self, bytes: &[u8]) -> Result<Vec<String>, PdfError> {
        pdf_extract::extract_text_from_mem_by_pages(bytes).map_err(|e| PdfError::Load(e.to_string()))
    }
}

/// Trimmed non-empty pages joined by a blank line, or `None` if there are none.
fn join_pages(pages: &[String]) -> Option<String> {
    let parts: Vec<&str> = pages
        .iter()
        .map(|p| p.trim())
        .filter(|p| !p.is_empty())
        .collect();

    if parts.is_empty() {
        None
    } else {
        Some(parts.join("\n\n"))
    }
}

async fn read_pages(source: Arc<dyn PageSource>, bytes: Bytes) -> Result<Vec<String>, PdfError> {
    tokio::task::spawn_blocking(move || source.page_texts(&bytes))
        .await
        .map_err(|e| PdfError::Task(e.to_string()))?
}

#[derive(Clone)]
pub struct PdfExtractor {
    primary: Arc<dyn PageSource>,
    fallback: Arc<dyn PageSource>,
}

impl PdfExtractor {
    pub fn new() -> Self {
        Self::with_sources(Arc::new(LopdfPages), Arc::new(PdfExtractPages))
    }

    pub fn with_sources(primary: Arc<dyn PageSource>, fallback: Arc<dyn PageSource>) -> Self {
        Self { primary, fallback }
    }

    pub async fn extract(&self, bytes: Bytes) -> ExtractOutcome {
        match read_pages(self.primary.clone(), bytes.clone()).await {
            Ok(pages) => {
                if let Some(text) = join_pages(&pages) {
                    info!(source = self.primary.name(), pages = pages.len(), "Extracted PDF text");
                    return ExtractOutcome::Text(text);
                }
                debug!(source = self.primary.name(), "No text found, trying fallback");
            }
            Err(e) => {
                warn!(source = self.primary.name(), error = %e, "PDF parser failed, trying fallback");
            }
        }

        match read_pages(self.fallback.clone(), bytes).await {
            Ok(pages) => match join_pages(&pages) {
                Some(text) => {
                    info!(source = self.fallback.name(), pages = pages.len(), "Extracted PDF text using fallback");
                    ExtractOutcome::Text(text)
                }
                None => {
                    warn!("No text content found in PDF");
                    ExtractOutcome::Notice(Notice::NoPdfText)
                }
            },
            Err(e) => {
                tracing::error!(source = self.fallback.name(), error = %e, "Fallback PDF parser also failed");
                ExtractOutcome::Failed {
                    category: FormatCategory::Pdf,
                    reason: e.to_string(),
                }
            }
        }
    }
}

impl Default for PdfExtractor {
    fn default() -> Self {
        Self::new()
    }
}
