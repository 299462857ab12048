//! Upload validation and format dispatch.

use bytes::Bytes;
use expensa_core::config::ExtractionSettings;
use std::collections::BTreeMap;
use tracing::{info, warn};

use crate::outcome::{ExtractOutcome, FormatCategory, Notice, Rejection};
use crate::pdf::PdfExtractor;
use crate::text;

/// Extensions refused outright, regardless of content.
pub const DENIED_EXTENSIONS: [&str; 7] = [".exe", ".bat", ".cmd", ".com", ".scr", ".vbs", ".js"];

/// An upload held entirely in memory.
#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub name: Option<String>,
    pub bytes: Bytes,
}

impl UploadedFile {
    pub fn new(name: impl Into<String>, bytes: impl Into<Bytes>) -> Self {
        Self {
            name: Some(name.into()),
            bytes: bytes.into(),
        }
    }

    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }
}

#[derive(Debug, Clone)]
pub struct ExtractionConfig {
    pub max_file_size: u64,
    pub max_name_len: usize,
    pub denied_extensions: Vec<String>,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self::from(&ExtractionSettings::default())
    }
}

impl From<&ExtractionSettings> for ExtractionConfig {
    fn from(settings: &ExtractionSettings) -> Self {
        Self {
            max_file_size: settings.max_file_size_bytes,
            max_name_len: settings.max_file_name_len,
            denied_extensions: DENIED_EXTENSIONS.iter().map(|e| e.to_string()).collect(),
        }
    }
}

/// Lowercased final extension including the dot, or `""`.
///
/// Leading dots belong to the name: `.env` has no extension.
pub fn file_extension(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let stem = base.trim_start_matches('.');
    match stem.rfind('.') {
        Some(idx) => stem[idx..].to_lowercase(),
        None => String::new(),
    }
}

pub fn category_for(name: &str) -> Option<FormatCategory> {
    let ext = file_extension(name);
    FormatCategory::ALL
        .into_iter()
        .find(|category| category.extensions().contains(&ext.as_str()))
}

pub fn is_format_supported(name: &str) -> bool {
    category_for(name).is_some()
}

/// Every recognised extension, grouped by category.
pub fn supported_formats() -> BTreeMap<&'static str, Vec<&'static str>> {
    FormatCategory::ALL
        .into_iter()
        .map(|category| (category.as_str(), category.extensions().to_vec()))
        .collect()
}

pub struct DocumentExtractor {
    config: ExtractionConfig,
    pdf: PdfExtractor,
}

impl DocumentExtractor {
    pub fn new(config: ExtractionConfig) -> Self {
        Self::with_pdf_extractor(config, PdfExtractor::new())
    }

    pub fn with_pdf_extractor(config: ExtractionConfig, pdf: PdfExtractor) -> Self {
        info!(
            max_file_size = config.max_file_size,
            "Document processor initialized"
        );
        Self { config, pdf }
    }

    pub fn config(&self) -> &ExtractionConfig {
        &self.config
    }

    /// Checks size, name and extension. Never touches the payload.
    pub fn validate(&self, file: &UploadedFile) -> Result<(), Rejection> {
        let size = file.size();
        if size > self.config.max_file_size {
            warn!(size, "File too large");
            return Err(Rejection::TooLarge {
                size,
                max: self.config.max_file_size,
            });
        }

        let name = match file.name.as_deref() {
            Some(name) if !name.is_empty() => name,
            _ => {
                warn!("Invalid file name: missing");
                return Err(Rejection::MissingName);
            }
        };

        let len = name.chars().count();
        if len > self.config.max_name_len {
            warn!(len, "Invalid file name: too long");
            return Err(Rejection::NameTooLong {
                len,
                max: self.config.max_name_len,
            });
        }

        let ext = file_extension(name);
        if self.config.denied_extensions.iter().any(|d| *d == ext) {
            warn!(extension = %ext, "Suspicious file extension");
            return Err(Rejection::DeniedExtension(ext));
        }

        Ok(())
    }

    pub async fn extract(&self, file: &UploadedFile) -> ExtractOutcome {
        if let Err(rejection) = self.validate(file) {
            return ExtractOutcome::Rejected(rejection);
        }

        let name = file.name.as_deref().unwrap_or_default();
        let Some(category) = category_for(name) else {
            let ext = file_extension(name);
            warn!(extension = %ext, "Unsupported file format");
            return ExtractOutcome::Notice(Notice::Unsupported(ext));
        };

        match category {
            FormatCategory::Pdf => self.pdf.extract(file.bytes.clone()).await,
            FormatCategory::Text => text::extract_text(&file.bytes),
            FormatCategory::Image => {
                info!("Image text extraction requested (OCR not yet implemented)");
                ExtractOutcome::Notice(Notice::OcrUnavailable)
            }
            FormatCategory::Spreadsheet => {
                info!("Spreadsheet text extraction requested (not yet implemented)");
                ExtractOutcome::Notice(Notice::SpreadsheetUnavailable)
            }
        }
    }
}

impl Default for DocumentExtractor {
    fn default() -> Self {
        Self::new(ExtractionConfig::default())
    }
}
