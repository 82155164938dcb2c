//! Error taxonomy for the ingestion and answer pipeline.
//!
//! Every component reports failures through [`PipelineError`] so the
//! orchestrator and request handlers can decide, from the variant alone,
//! whether to retry, surface a validation message, or mark a document
//! `FAILED`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Caller error. Never retried; surfaced as a validation message.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Transient upstream failure (network, 5xx). Retried with backoff.
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// Upstream 429. Retried with backoff.
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// Missing document, chunk, or cursor. Surfaced as a 404-equivalent.
    #[error("not found: {0}")]
    NotFound(String),

    /// The document is not `READY`, so there is no index to answer from.
    #[error("document not ready: {0}")]
    NotReady(String),

    /// The prompt overflowed a token budget, ours or the upstream model's.
    #[error("context too large: {0}")]
    ContextTooLarge(String),

    /// Unexpected internal invariant violation. Logged, never swallowed.
    #[error("fatal: {0}")]
    Fatal(String),

    /// Relational store failure.
    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),
}

impl PipelineError {
    /// True for failures worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            PipelineError::UpstreamUnavailable(_) | PipelineError::RateLimited(_)
        )
    }
}
