//! Text extraction for uploaded documents.
//!
//! Uploads arrive as raw bytes plus a content type; this module returns
//! plain UTF-8 text for the chunker. PDF is the primary format of the
//! product; plain text and markdown pass through unchanged.

use crate::error::PipelineError;

pub const MIME_PDF: &str = "application/pdf";
pub const MIME_TEXT: &str = "text/plain";
pub const MIME_MARKDOWN: &str = "text/markdown";

/// Extract plain text from document bytes.
///
/// Unsupported content types and undecodable bytes are caller errors:
/// the document can never ingest successfully, so retrying is pointless.
pub fn extract_text(bytes: &[u8], content_type: &str) -> Result<String, PipelineError> {
    match content_type {
        MIME_PDF => pdf_extract::extract_text_from_mem(bytes)
            .map_err(|e| PipelineError::InvalidInput(format!("PDF extraction failed: {e}"))),
        MIME_TEXT | MIME_MARKDOWN => String::from_utf8(bytes.to_vec())
            .map_err(|e| PipelineError::InvalidInput(format!("not valid UTF-8: {e}"))),
        other => Err(PipelineError::InvalidInput(format!(
            "unsupported content-type: {other}"
        ))),
    }
}

/// Guess a content type from the storage key's extension.
pub fn content_type_for_key(key: &str) -> &'static str {
    let ext = key.rsplit('.').next().unwrap_or("");
    match ext.to_ascii_lowercase().as_str() {
        "pdf" => MIME_PDF,
        "md" | "markdown" => MIME_MARKDOWN,
        _ => MIME_TEXT,
    }
}
