//! Plain-text decoding.
//!
//! Decoding order: UTF-8, then Latin-1, then Windows-1252 with undecodable
//! bytes dropped. Latin-1 maps every byte to U+0000..=U+00FF, so in
//! practice the chain ends there.

use encoding_rs::WINDOWS_1252;

use crate::outcome::{ExtractOutcome, Notice};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextEncoding {
    Utf8,
    Latin1,
    Windows1252,
}

/// Bytes Windows-1252 leaves undefined.
const CP1252_UNDEFINED: [u8; 5] = [0x81, 0x8D, 0x8F, 0x90, 0x9D];

pub fn decode_text(bytes: &[u8]) -> (String, TextEncoding) {
    if let Some(text) = decode_utf8(bytes) {
        return (text, TextEncoding::Utf8);
    }
    if let Some(text) = decode_latin1(bytes) {
        return (text, TextEncoding::Latin1);
    }
    (decode_windows_1252_lossy(bytes), TextEncoding::Windows1252)
}

fn decode_utf8(bytes: &[u8]) -> Option<String> {
    let text = std::str::from_utf8(bytes).ok()?;
    Some(text.strip_prefix('\u{feff}').unwrap_or(text).to_string())
}

fn decode_latin1(bytes: &[u8]) -> Option<String> {
    Some(encoding_rs::mem::decode_latin1(bytes).into_owned())
}

fn decode_windows_1252_lossy(bytes: &[u8]) -> String {
    let filtered: Vec<u8> = bytes
        .iter()
        .copied()
        .filter(|b| !CP1252_UNDEFINED.contains(b))
        .collect();
    let (text, _had_errors) = WINDOWS_1252.decode_without_bom_handling(&filtered);
    text.into_owned()
}

pub fn extract_text(bytes: &[u8]) -> ExtractOutcome {
    let (text, encoding) = decode_text(bytes);
    let trimmed = text.trim();

    if trimmed.is_empty() {
        tracing::warn!("Empty text content in file");
        return ExtractOutcome::Notice(Notice::EmptyFile);
    }

    tracing::info!(?encoding, chars = trimmed.chars().count(), "Extracted text from file");
    ExtractOutcome::Text(trimmed.to_string())
}
