//! Vector index over SQLite.
//!
//! Stores one embedding per chunk in the `chunk_vectors` table and answers
//! nearest-neighbor queries by brute-force cosine similarity over a single
//! document's vectors. Every operation is scoped by `document_id`, so a
//! shared table never leaks chunks across documents.
//!
//! Ties on similarity are broken by ascending chunk sequence index, so
//! earlier document context wins.

use sqlx::{Row, SqlitePool};

use crate::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use crate::error::PipelineError;

/// One query hit: chunk id plus cosine similarity score.
#[derive(Debug, Clone)]
pub struct IndexHit {
    pub chunk_id: String,
    pub chunk_index: i64,
    pub score: f32,
}

#[derive(Clone)]
pub struct VectorIndex {
    pool: SqlitePool,
}

impl VectorIndex {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert or replace a chunk's vector.
    pub async fn upsert(
        &self,
        document_id: &str,
        chunk_id: &str,
        chunk_index: i64,
        vector: &[f32],
    ) -> Result<(), PipelineError> {
        sqlx::query(
            r#"
            INSERT INTO chunk_vectors (chunk_id, document_id, chunk_index, embedding)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(chunk_id) DO UPDATE SET
                document_id = excluded.document_id,
                chunk_index = excluded.chunk_index,
                embedding = excluded.embedding
            "#,
        )
        .bind(chunk_id)
        .bind(document_id)
        .bind(chunk_index)
        .bind(vec_to_blob(vector))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Top-`k` chunks of one document by cosine similarity to `query_vec`.
    ///
    /// Returns fewer than `k` hits only when the document has fewer indexed
    /// chunks, and `NotFound` when it has none at all — callers treat that
    /// as "no context available", not a hard error.
    pub async fn query(
        &self,
        document_id: &str,
        query_vec: &[f32],
        k: usize,
    ) -> Result<Vec<IndexHit>, PipelineError> {
        let rows = sqlx::query(
            "SELECT chunk_id, chunk_index, embedding FROM chunk_vectors WHERE document_id = ?",
        )
        .bind(document_id)
        .fetch_all(&self.pool)
        .await?;

        if rows.is_empty() {
            return Err(PipelineError::NotFound(format!(
                "no indexed chunks for document {document_id}"
            )));
        }

        let mut hits: Vec<IndexHit> = rows
            .iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                IndexHit {
                    chunk_id: row.get("chunk_id"),
                    chunk_index: row.get("chunk_index"),
                    score: cosine_similarity(query_vec, &blob_to_vec(&blob)),
                }
            })
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.chunk_index.cmp(&b.chunk_index))
        });
        hits.truncate(k);
        Ok(hits)
    }

    /// Remove every vector belonging to a document.
    pub async fn delete_document(&self, document_id: &str) -> Result<(), PipelineError> {
        sqlx::query("DELETE FROM chunk_vectors WHERE document_id = ?")
            .bind(document_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrate::run_migrations;

    async fn test_index() -> VectorIndex {
        // A shared-nothing :memory: pool would give each connection its own
        // database, so cap the pool at a single connection.
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        run_migrations(&pool).await.unwrap();
        VectorIndex::new(pool)
    }

    #[tokio::test]
    async fn query_returns_most_similar_first() {
        let index = test_index().await;
        index.upsert("d1", "c0", 0, &[1.0, 0.0]).await.unwrap();
        index.upsert("d1", "c1", 1, &[0.0, 1.0]).await.unwrap();
        index.upsert("d1", "c2", 2, &[0.7, 0.7]).await.unwrap();

        let hits = index.query("d1", &[1.0, 0.0], 2).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].chunk_id, "c0");
        assert_eq!(hits[1].chunk_id, "c2");
    }

    #[tokio::test]
    async fn never_leaks_across_documents() {
        let index = test_index().await;
        index.upsert("d1", "a0", 0, &[1.0, 0.0]).await.unwrap();
        index.upsert("d2", "b0", 0, &[1.0, 0.0]).await.unwrap();
        index.upsert("d2", "b1", 1, &[0.9, 0.1]).await.unwrap();

        let hits = index.query("d1", &[1.0, 0.0], 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk_id, "a0");
    }

    #[tokio::test]
    async fn ties_broken_by_earlier_chunk_index() {
        let index = test_index().await;
        // Insert out of order; identical vectors score identically.
        index.upsert("d1", "c5", 5, &[1.0, 0.0]).await.unwrap();
        index.upsert("d1", "c1", 1, &[1.0, 0.0]).await.unwrap();
        index.upsert("d1", "c3", 3, &[1.0, 0.0]).await.unwrap();

        let hits = index.query("d1", &[1.0, 0.0], 3).await.unwrap();
        let order: Vec<i64> = hits.iter().map(|h| h.chunk_index).collect();
        assert_eq!(order, vec![1, 3, 5]);
    }

    #[tokio::test]
    async fn never_returns_more_than_k() {
        let index = test_index().await;
        for i in 0..10 {
            index
                .upsert("d1", &format!("c{i}"), i, &[1.0, i as f32])
                .await
                .unwrap();
        }
        let hits = index.query("d1", &[1.0, 0.0], 3).await.unwrap();
        assert_eq!(hits.len(), 3);
    }

    #[tokio::test]
    async fn empty_document_is_not_found() {
        let index = test_index().await;
        let err = index.query("ghost", &[1.0], 5).await.unwrap_err();
        assert!(matches!(err, PipelineError::NotFound(_)));
    }

    #[tokio::test]
    async fn delete_document_removes_all_vectors() {
        let index = test_index().await;
        index.upsert("d1", "c0", 0, &[1.0]).await.unwrap();
        index.upsert("d2", "x0", 0, &[1.0]).await.unwrap();
        index.delete_document("d1").await.unwrap();

        assert!(index.query("d1", &[1.0], 5).await.is_err());
        assert_eq!(index.query("d2", &[1.0], 5).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn upsert_replaces_existing_vector() {
        let index = test_index().await;
        index.upsert("d1", "c0", 0, &[1.0, 0.0]).await.unwrap();
        index.upsert("d1", "c0", 0, &[0.0, 1.0]).await.unwrap();

        let hits = index.query("d1", &[0.0, 1.0], 1).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert!((hits[0].score - 1.0).abs() < 1e-6);
    }
}
