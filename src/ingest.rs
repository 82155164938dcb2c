//! Ingestion orchestration.
//!
//! Drives one document through fetch → extract → chunk → embed → index,
//! tracking the `PENDING → PROCESSING → {READY | FAILED}` state machine.
//! The status field is the lease: a run only proceeds after atomically
//! claiming `PENDING → PROCESSING`, so at most one run is active per
//! document. Embedding batches are issued concurrently up to a bounded
//! parallelism and reassembled in chunk order before indexing — overlap
//! context depends on adjacent chunks staying correctly ordered.

use futures_util::{StreamExt, TryStreamExt};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use uuid::Uuid;

use crate::chunk::ChunkSplitter;
use crate::config::{ChunkingConfig, EmbeddingConfig};
use crate::embedding::{backoff_delay, Embedder};
use crate::error::PipelineError;
use crate::extract::{content_type_for_key, extract_text};
use crate::models::Chunk;
use crate::storage::BlobStorage;
use crate::store::Store;

/// Outcome of one orchestration attempt.
#[derive(Debug, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Chunks committed, document marked `READY`.
    Ready,
    /// The lease was not claimable (already running, or finished).
    NotClaimed,
    /// The document was deleted while the run was in flight; nothing kept.
    DeletedMidRun,
}

pub struct Orchestrator {
    store: Store,
    storage: Arc<dyn BlobStorage>,
    embedder: Arc<dyn Embedder>,
    chunking: ChunkingConfig,
    batch_size: usize,
    parallelism: usize,
    max_retries: u32,
}

impl Orchestrator {
    pub fn new(
        store: Store,
        storage: Arc<dyn BlobStorage>,
        embedder: Arc<dyn Embedder>,
        chunking: ChunkingConfig,
        embedding: &EmbeddingConfig,
    ) -> Self {
        Self {
            store,
            storage,
            embedder,
            chunking,
            batch_size: embedding.batch_size.max(1),
            parallelism: embedding.parallelism.max(1),
            max_retries: embedding.max_retries,
        }
    }

    /// Run ingestion for one document.
    ///
    /// Unrecoverable failures mark the document `FAILED` (with the error
    /// recorded) and are also returned to the caller. Re-running after a
    /// crash re-extracts and re-chunks from scratch; stale chunks from the
    /// interrupted run are discarded at commit, never merged.
    pub async fn run(&self, document_id: &str) -> Result<IngestOutcome, PipelineError> {
        if !self.store.claim_processing(document_id).await? {
            tracing::debug!(%document_id, "ingestion lease not claimed");
            return Ok(IngestOutcome::NotClaimed);
        }
        tracing::info!(%document_id, "ingestion started");

        match self.ingest(document_id).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                tracing::error!(%document_id, error = %e, "ingestion failed");
                self.store.mark_failed(document_id, &e.to_string()).await?;
                Err(e)
            }
        }
    }

    async fn ingest(&self, document_id: &str) -> Result<IngestOutcome, PipelineError> {
        let doc = self.store.get_document(document_id).await?;

        let bytes = self.storage.fetch(&doc.storage_key).await?;
        let content_type = content_type_for_key(&doc.storage_key);
        let text = extract_text(&bytes, content_type)?;

        let splitter = ChunkSplitter::new(
            &text,
            self.chunking.max_tokens,
            self.chunking.overlap_tokens,
        )?;
        let chunks: Vec<Chunk> = splitter
            .map(|piece| Chunk {
                id: Uuid::new_v4().to_string(),
                document_id: document_id.to_string(),
                chunk_index: piece.index,
                hash: format!("{:x}", Sha256::digest(piece.text.as_bytes())),
                token_count: piece.token_count as i64,
                text: piece.text,
            })
            .collect();

        let vectors = self.embed_ordered(&chunks).await?;

        if self
            .store
            .commit_ingestion(document_id, &chunks, &vectors)
            .await?
        {
            tracing::info!(%document_id, chunks = chunks.len(), "ingestion ready");
            Ok(IngestOutcome::Ready)
        } else {
            tracing::info!(%document_id, "document deleted mid-run, aborting");
            Ok(IngestOutcome::DeletedMidRun)
        }
    }

    /// Embed all chunks in batches, up to `parallelism` batches in flight,
    /// reassembling results in original chunk order.
    async fn embed_ordered(&self, chunks: &[Chunk]) -> Result<Vec<Vec<f32>>, PipelineError> {
        let batches: Vec<Vec<String>> = chunks
            .chunks(self.batch_size)
            .map(|batch| batch.iter().map(|c| c.text.clone()).collect())
            .collect();

        let nested: Vec<Vec<Vec<f32>>> = futures_util::stream::iter(batches.into_iter().map(
            |batch| {
                let embedder = Arc::clone(&self.embedder);
                let max_retries = self.max_retries;
                async move { embed_batch_with_retry(embedder.as_ref(), &batch, max_retries).await }
            },
        ))
        .buffered(self.parallelism)
        .try_collect()
        .await?;

        Ok(nested.into_iter().flatten().collect())
    }
}

/// Retry one embedding batch on transient failures with exponential
/// backoff; everything else propagates immediately.
async fn embed_batch_with_retry(
    embedder: &dyn Embedder,
    texts: &[String],
    max_retries: u32,
) -> Result<Vec<Vec<f32>>, PipelineError> {
    let mut last_err = None;
    for attempt in 0..=max_retries {
        if attempt > 0 {
            tokio::time::sleep(backoff_delay(attempt)).await;
        }
        match embedder.embed(texts).await {
            Ok(vectors) => return Ok(vectors),
            Err(e) if e.is_transient() => {
                tracing::warn!(attempt, error = %e, "embedding batch failed, will retry");
                last_err = Some(e);
            }
            Err(e) => return Err(e),
        }
    }
    Err(last_err
        .unwrap_or_else(|| PipelineError::UpstreamUnavailable("retries exhausted".to_string())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingEmbedder {
        calls: AtomicU32,
        fail_first: u32,
    }

    #[async_trait]
    impl Embedder for CountingEmbedder {
        fn model_name(&self) -> &str {
            "counting"
        }
        fn dims(&self) -> usize {
            2
        }
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, PipelineError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                return Err(PipelineError::UpstreamUnavailable("flaky".to_string()));
            }
            Ok(texts.iter().map(|_| vec![1.0, 0.0]).collect())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retry_recovers_from_transient_failures() {
        let embedder = CountingEmbedder {
            calls: AtomicU32::new(0),
            fail_first: 2,
        };
        let texts = vec!["a".to_string(), "b".to_string()];
        let vectors = embed_batch_with_retry(&embedder, &texts, 5).await.unwrap();
        assert_eq!(vectors.len(), 2);
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_gives_up_after_bounded_attempts() {
        let embedder = CountingEmbedder {
            calls: AtomicU32::new(0),
            fail_first: u32::MAX,
        };
        let err = embed_batch_with_retry(&embedder, &["a".to_string()], 2)
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_transient_errors_fail_immediately() {
        struct Rejecting;
        #[async_trait]
        impl Embedder for Rejecting {
            fn model_name(&self) -> &str {
                "rejecting"
            }
            fn dims(&self) -> usize {
                2
            }
            async fn embed(&self, _: &[String]) -> Result<Vec<Vec<f32>>, PipelineError> {
                Err(PipelineError::InvalidInput("too long".to_string()))
            }
        }
        let err = embed_batch_with_retry(&Rejecting, &["a".to_string()], 5)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::InvalidInput(_)));
    }
}
