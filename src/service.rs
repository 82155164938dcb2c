//! The pipeline facade exposed to the surrounding application.
//!
//! Wires the store, vector index, orchestrator, and synthesizer together
//! and exposes the operations the product surface needs: register, ingest,
//! poll status, ask (streaming), list messages, delete. Ingestion runs as
//! a detached background task per document; the triggering call returns as
//! soon as the document is known to exist.

use std::sync::Arc;

use sqlx::SqlitePool;

use crate::config::Config;
use crate::embedding::Embedder;
use crate::error::PipelineError;
use crate::index::VectorIndex;
use crate::ingest::Orchestrator;
use crate::models::{Document, DocumentStatus, MessagePage};
use crate::retrieve::Retriever;
use crate::storage::BlobStorage;
use crate::store::Store;
use crate::synthesize::{CompletionProvider, Synthesizer, TokenStream};

#[derive(Clone)]
pub struct Pipeline {
    store: Store,
    orchestrator: Arc<Orchestrator>,
    synthesizer: Arc<Synthesizer>,
}

impl Pipeline {
    pub fn new(
        pool: SqlitePool,
        storage: Arc<dyn BlobStorage>,
        embedder: Arc<dyn Embedder>,
        completer: Arc<dyn CompletionProvider>,
        config: &Config,
    ) -> Self {
        let store = Store::new(pool.clone());
        let index = VectorIndex::new(pool);
        let orchestrator = Arc::new(Orchestrator::new(
            store.clone(),
            storage,
            Arc::clone(&embedder),
            config.chunking.clone(),
            &config.embedding,
        ));
        let retriever = Retriever::new(embedder, index, store.clone());
        let synthesizer = Arc::new(Synthesizer::new(
            store.clone(),
            retriever,
            completer,
            config.retrieval.top_k,
            config.synthesis.clone(),
        ));

        Self {
            store,
            orchestrator,
            synthesizer,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Register an uploaded file for ingestion. The document starts
    /// `PENDING`; call [`start_ingestion`](Self::start_ingestion) to kick
    /// off processing.
    pub async fn register_document(
        &self,
        owner_id: &str,
        storage_key: &str,
        title: Option<&str>,
    ) -> Result<Document, PipelineError> {
        self.store.create_document(owner_id, storage_key, title).await
    }

    /// Fire-and-forget ingestion. Returns once the document is verified to
    /// exist; the run proceeds in a background task. A duplicate call while
    /// a run is active loses the status lease and becomes a no-op.
    pub async fn start_ingestion(&self, document_id: &str) -> Result<(), PipelineError> {
        self.store.get_document(document_id).await?;

        let orchestrator = Arc::clone(&self.orchestrator);
        let document_id = document_id.to_string();
        tokio::spawn(async move {
            // Outcome and failure are logged by the orchestrator itself.
            let _ = orchestrator.run(&document_id).await;
        });
        Ok(())
    }

    /// Run ingestion to completion on the calling task. Used by the CLI,
    /// which wants the outcome; the server path uses
    /// [`start_ingestion`](Self::start_ingestion) instead.
    pub async fn run_ingestion(
        &self,
        document_id: &str,
    ) -> Result<crate::ingest::IngestOutcome, PipelineError> {
        self.orchestrator.run(document_id).await
    }

    /// Re-ingest from scratch. With `force`, a finished (`READY`/`FAILED`)
    /// or stuck document is reset to `PENDING` first; the new run
    /// overwrites all prior chunks.
    pub async fn reingest(&self, document_id: &str, force: bool) -> Result<(), PipelineError> {
        if force {
            self.store.reset_to_pending(document_id).await?;
        }
        self.start_ingestion(document_id).await
    }

    pub async fn get_status(&self, document_id: &str) -> Result<DocumentStatus, PipelineError> {
        self.store.get_status(document_id).await
    }

    pub async fn get_document(&self, document_id: &str) -> Result<Document, PipelineError> {
        self.store.get_document(document_id).await
    }

    /// All documents belonging to one owner, newest first.
    pub async fn list_documents(&self, owner_id: &str) -> Result<Vec<Document>, PipelineError> {
        self.store.list_documents(owner_id).await
    }

    /// Ask a question about a `READY` document; returns a token stream the
    /// caller consumes incrementally. Dropping the stream cancels upstream
    /// model consumption.
    pub async fn ask_question(
        &self,
        document_id: &str,
        question: &str,
    ) -> Result<TokenStream, PipelineError> {
        self.synthesizer.answer(document_id, question).await
    }

    pub async fn list_messages(
        &self,
        document_id: &str,
        cursor: Option<&str>,
        limit: Option<i64>,
    ) -> Result<MessagePage, PipelineError> {
        self.store.list_messages(document_id, cursor, limit).await
    }

    /// Delete a document and everything it owns (chunks, vectors,
    /// messages). Safe while ingestion is in flight: the run aborts at
    /// commit without resurrecting data.
    pub async fn delete_document(&self, document_id: &str) -> Result<(), PipelineError> {
        self.store.delete_document(document_id).await
    }
}
