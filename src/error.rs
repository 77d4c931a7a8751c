//! Fatal import errors.
//!
//! Anything listed here aborts the whole import and the caller has to start
//! over from the original file. Per-field and per-relation problems never
//! surface as an [`ImportError`]; they are collected as
//! [`ImportIssue`](crate::coerce::ImportIssue) diagnostics instead.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ImportError {
    #[error("CSV file contains no data rows")]
    EmptyFile,

    #[error("CSV tokenizer error: {message}")]
    Tokenizer { message: String },

    #[error("Failed to decode input as {encoding}")]
    Decode { encoding: &'static str },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ImportError>;

/// Tokenizer messages mentioning any of these are treated as fatal; all other
/// tokenizer complaints are recoverable warnings.
const FATAL_MARKERS: &[&str] = &["fatal", "error", "unclosed"];

pub fn is_fatal_tokenizer_message(message: &str) -> bool {
    let lowered = message.to_lowercase();
    FATAL_MARKERS.iter().any(|marker| lowered.contains(marker))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_markers_are_case_insensitive_substrings() {
        assert!(is_fatal_tokenizer_message("Unclosed quoted field"));
        assert!(is_fatal_tokenizer_message("CSV parse ERROR at line 3"));
        assert!(!is_fatal_tokenizer_message("Too few fields: expected 4"));
    }
}
