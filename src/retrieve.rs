//! Question-time retrieval.
//!
//! Embeds the user's question, asks the vector index for the top-k chunks of
//! the target document, and hydrates the hits back to chunk text. No hidden
//! randomness: for a fixed index state, identical inputs give identical
//! output. Component errors propagate unchanged.

use std::sync::Arc;

use crate::embedding::{embed_query, Embedder};
use crate::error::PipelineError;
use crate::index::VectorIndex;
use crate::models::Chunk;
use crate::store::Store;

#[derive(Clone)]
pub struct Retriever {
    embedder: Arc<dyn Embedder>,
    index: VectorIndex,
    store: Store,
}

impl Retriever {
    pub fn new(embedder: Arc<dyn Embedder>, index: VectorIndex, store: Store) -> Self {
        Self {
            embedder,
            index,
            store,
        }
    }

    /// Top-`k` chunks of `document_id` most similar to `question`, best
    /// first.
    pub async fn retrieve(
        &self,
        document_id: &str,
        question: &str,
        k: usize,
    ) -> Result<Vec<Chunk>, PipelineError> {
        if question.trim().is_empty() {
            return Err(PipelineError::InvalidInput(
                "question must not be empty".to_string(),
            ));
        }

        let query_vec = embed_query(self.embedder.as_ref(), question).await?;
        let hits = self.index.query(document_id, &query_vec, k).await?;
        let ids: Vec<String> = hits.into_iter().map(|h| h.chunk_id).collect();
        self.store.get_chunks_by_ids(&ids).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrate::run_migrations;
    use crate::models::Chunk as ChunkModel;
    use async_trait::async_trait;
    use sha2::{Digest, Sha256};

    /// Deterministic embedder: vector derived from the text's SHA-256, so
    /// identical text embeds identically and self-similarity is exactly 1.
    struct HashEmbedder;

    pub fn hash_vector(text: &str) -> Vec<f32> {
        let digest = Sha256::digest(text.as_bytes());
        digest[..8]
            .iter()
            .map(|&b| (b as f32 - 127.5) / 127.5)
            .collect()
    }

    #[async_trait]
    impl Embedder for HashEmbedder {
        fn model_name(&self) -> &str {
            "hash-test"
        }
        fn dims(&self) -> usize {
            8
        }
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, PipelineError> {
            Ok(texts.iter().map(|t| hash_vector(t)).collect())
        }
    }

    async fn setup() -> (Retriever, Store, VectorIndex) {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        run_migrations(&pool).await.unwrap();
        let store = Store::new(pool.clone());
        let index = VectorIndex::new(pool);
        let retriever = Retriever::new(Arc::new(HashEmbedder), index.clone(), store.clone());
        (retriever, store, index)
    }

    async fn index_chunks(store: &Store, doc_id: &str, texts: &[&str]) -> Vec<ChunkModel> {
        store.claim_processing(doc_id).await.unwrap();
        let chunks: Vec<ChunkModel> = texts
            .iter()
            .enumerate()
            .map(|(i, t)| ChunkModel {
                id: format!("{doc_id}-c{i}"),
                document_id: doc_id.to_string(),
                chunk_index: i as i64,
                text: t.to_string(),
                token_count: t.split_whitespace().count() as i64,
                hash: format!("h{i}"),
            })
            .collect();
        let vectors: Vec<Vec<f32>> = texts.iter().map(|t| hash_vector(t)).collect();
        store.commit_ingestion(doc_id, &chunks, &vectors).await.unwrap();
        chunks
    }

    #[tokio::test]
    async fn chunk_text_retrieves_itself_top_one() {
        let (retriever, store, _) = setup().await;
        let doc = store.create_document("u1", "k", None).await.unwrap();
        index_chunks(
            &store,
            &doc.id,
            &["alpha facts here", "beta facts here", "gamma facts here"],
        )
        .await;

        let chunks = retriever
            .retrieve(&doc.id, "beta facts here", 1)
            .await
            .unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "beta facts here");
        assert_eq!(chunks[0].chunk_index, 1);
    }

    #[tokio::test]
    async fn deterministic_for_fixed_index_state() {
        let (retriever, store, _) = setup().await;
        let doc = store.create_document("u1", "k", None).await.unwrap();
        index_chunks(&store, &doc.id, &["one two", "three four", "five six"]).await;

        let a = retriever.retrieve(&doc.id, "three four", 3).await.unwrap();
        let b = retriever.retrieve(&doc.id, "three four", 3).await.unwrap();
        let ids_a: Vec<&str> = a.iter().map(|c| c.id.as_str()).collect();
        let ids_b: Vec<&str> = b.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids_a, ids_b);
    }

    #[tokio::test]
    async fn unindexed_document_propagates_not_found() {
        let (retriever, store, _) = setup().await;
        let doc = store.create_document("u1", "k", None).await.unwrap();
        let err = retriever.retrieve(&doc.id, "anything", 3).await.unwrap_err();
        assert!(matches!(err, PipelineError::NotFound(_)));
    }

    #[tokio::test]
    async fn empty_question_rejected() {
        let (retriever, store, _) = setup().await;
        let doc = store.create_document("u1", "k", None).await.unwrap();
        let err = retriever.retrieve(&doc.id, "   ", 3).await.unwrap_err();
        assert!(matches!(err, PipelineError::InvalidInput(_)));
    }
}
