//! Result types for document extraction.

use std::fmt;

/// Broad format family an extension belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FormatCategory {
    Pdf,
    Image,
    Text,
    Spreadsheet,
}

impl FormatCategory {
    pub const ALL: [FormatCategory; 4] = [
        FormatCategory::Pdf,
        FormatCategory::Image,
        FormatCategory::Text,
        FormatCategory::Spreadsheet,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FormatCategory::Pdf => "pdf",
            FormatCategory::Image => "image",
            FormatCategory::Text => "text",
            FormatCategory::Spreadsheet => "spreadsheet",
        }
    }

    /// Lowercase extensions, with leading dot.
    pub fn extensions(&self) -> &'static [&'static str] {
        match self {
            FormatCategory::Pdf => &[".pdf"],
            FormatCategory::Image => &[".png", ".jpg", ".jpeg", ".gif", ".bmp", ".tiff"],
            FormatCategory::Text => &[".txt", ".csv", ".md"],
            FormatCategory::Spreadsheet => &[".xlsx", ".xls", ".ods"],
        }
    }
}

impl fmt::Display for FormatCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why an upload was refused before any content was read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    TooLarge { size: u64, max: u64 },
    MissingName,
    NameTooLong { len: usize, max: usize },
    DeniedExtension(String),
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::TooLarge { size, max } => {
                write!(f, "File too large: {size} bytes (limit {max} bytes)")
            }
            Rejection::MissingName => f.write_str("Invalid file name: name is missing"),
            Rejection::NameTooLong { len, max } => {
                write!(f, "Invalid file name: {len} characters (limit {max})")
            }
            Rejection::DeniedExtension(ext) => write!(f, "Suspicious file extension: {ext}"),
        }
    }
}

/// Placeholder returned when no usable text exists but nothing failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    Unsupported(String),
    NoPdfText,
    EmptyFile,
    OcrUnavailable,
    SpreadsheetUnavailable,
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Notice::Unsupported(ext) => write!(
                f,
                "Unsupported file format: {ext}. Please upload a PDF, image, or text file."
            ),
            Notice::NoPdfText => {
                f.write_str("No text content could be extracted from this PDF file.")
            }
            Notice::EmptyFile => f.write_str("The uploaded file appears to be empty."),
            Notice::OcrUnavailable => f.write_str(
                "Image text extraction (OCR) is not yet implemented. Please upload a PDF or text file instead.",
            ),
            Notice::SpreadsheetUnavailable => f.write_str(
                "Spreadsheet text extraction is not yet implemented. Please export as CSV or upload a PDF file instead.",
            ),
        }
    }
}

/// Outcome of [`crate::DocumentExtractor::extract`].
///
/// Only `Text` carries document content. The other variants render to a
/// message for the user via `Display`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtractOutcome {
    Text(String),
    Rejected(Rejection),
    Notice(Notice),
    Failed {
        category: FormatCategory,
        reason: String,
    },
}

impl ExtractOutcome {
    /// The extracted document text, if any.
    pub fn text(&self) -> Option<&str> {
        match self {
            ExtractOutcome::Text(text) => Some(text),
            _ => None,
        }
    }

    /// `false` only when validation refused the upload.
    pub fn was_processed(&self) -> bool {
        !matches!(self, ExtractOutcome::Rejected(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ExtractOutcome::Text(_) => "text",
            ExtractOutcome::Rejected(_) => "rejected",
            ExtractOutcome::Notice(_) => "notice",
            ExtractOutcome::Failed { .. } => "failed",
        }
    }
}

impl fmt::Display for ExtractOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExtractOutcome::Text(text) => f.write_str(text),
            ExtractOutcome::Rejected(rejection) => rejection.fmt(f),
            ExtractOutcome::Notice(notice) => notice.fmt(f),
            ExtractOutcome::Failed { category, reason } => match category {
                FormatCategory::Pdf => write!(f, "Error extracting text from PDF: {reason}"),
                FormatCategory::Text => write!(f, "Error reading file content: {reason}"),
                other => write!(f, "Error processing {other} file: {reason}"),
            },
        }
    }
}
