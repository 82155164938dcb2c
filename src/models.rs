//! Core data models flowing through the ingestion and retrieval pipeline.

use serde::{Deserialize, Serialize};

/// Ingestion status of a document. Transitions are monotonic:
/// `Pending → Processing → {Ready | Failed}`. A finished document never
/// regresses except through an explicit re-ingestion, which overwrites
/// prior chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DocumentStatus {
    Pending,
    Processing,
    Ready,
    Failed,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Pending => "PENDING",
            DocumentStatus::Processing => "PROCESSING",
            DocumentStatus::Ready => "READY",
            DocumentStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(DocumentStatus::Pending),
            "PROCESSING" => Some(DocumentStatus::Processing),
            "READY" => Some(DocumentStatus::Ready),
            "FAILED" => Some(DocumentStatus::Failed),
            _ => None,
        }
    }
}

/// An uploaded document registered for ingestion.
#[derive(Debug, Clone, Serialize)]
pub struct Document {
    pub id: String,
    pub owner_id: String,
    /// Key used to fetch the raw bytes from blob storage.
    pub storage_key: String,
    pub title: Option<String>,
    pub status: DocumentStatus,
    /// Failure detail when `status == Failed`.
    pub error: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// A contiguous text segment of a document's extracted body.
/// Immutable after ingestion; deleted with the owning document.
#[derive(Debug, Clone, Serialize)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub chunk_index: i64,
    pub text: String,
    pub token_count: i64,
    pub hash: String,
}

/// One turn in a document's chat thread. Append-only.
#[derive(Debug, Clone, Serialize)]
pub struct Message {
    pub id: String,
    pub document_id: String,
    pub is_user: bool,
    pub text: String,
    /// Unix milliseconds; pagination orders by this descending.
    pub created_at: i64,
}

/// One page of messages, newest first, with an opaque continuation cursor.
#[derive(Debug, Clone, Serialize)]
pub struct MessagePage {
    pub messages: Vec<Message>,
    pub next_cursor: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trip() {
        for s in [
            DocumentStatus::Pending,
            DocumentStatus::Processing,
            DocumentStatus::Ready,
            DocumentStatus::Failed,
        ] {
            assert_eq!(DocumentStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(DocumentStatus::parse("DONE"), None);
    }
}
