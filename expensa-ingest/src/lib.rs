//! # expensa-ingest
//!
//! Turns an uploaded expense document into plain text for the model prompt.
//!
//! | Category | Extensions | Handling |
//! |----------|------------|----------|
//! | PDF | `.pdf` | lopdf per page, pdf-extract as fallback |
//! | Text | `.txt` `.csv` `.md` | UTF-8, Latin-1, then Windows-1252 |
//! | Image | `.png` `.jpg` `.jpeg` `.gif` `.bmp` `.tiff` | placeholder (no OCR) |
//! | Spreadsheet | `.xlsx` `.xls` `.ods` | placeholder |
//!
//! [`DocumentExtractor::extract`] never fails; everything that is not text
//! comes back as an [`ExtractOutcome`] variant with a user-facing message.

pub mod extractor;
pub mod outcome;
pub mod pdf;
pub mod text;

pub use extractor::{
    category_for, file_extension, is_format_supported, supported_formats, DocumentExtractor,
    ExtractionConfig, UploadedFile, DENIED_EXTENSIONS,
};
pub use outcome::{ExtractOutcome, FormatCategory, Notice, Rejection};
pub use pdf::{LopdfPages, PageSource, PdfError, PdfExtractPages, PdfExtractor};
