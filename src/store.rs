//! Relational store for documents, chunks, and messages.
//!
//! All status transitions are guarded in SQL so they stay monotonic under
//! concurrency: a run claims `PENDING → PROCESSING` atomically (the lease
//! that keeps ingestion single-flight per document), and the `READY` /
//! `FAILED` updates only apply while the row is still `PROCESSING`. A
//! document deleted mid-run makes those guarded updates affect zero rows,
//! which the orchestrator treats as "abort, keep nothing".

use chrono::Utc;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::embedding::vec_to_blob;
use crate::error::PipelineError;
use crate::models::{Chunk, Document, DocumentStatus, Message, MessagePage};

/// Page size bounds for message listing, matching the product contract.
const MESSAGE_LIMIT_DEFAULT: i64 = 10;
const MESSAGE_LIMIT_MAX: i64 = 100;

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

fn document_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Document, PipelineError> {
    let status_str: String = row.get("status");
    let status = DocumentStatus::parse(&status_str)
        .ok_or_else(|| PipelineError::Fatal(format!("corrupt status: {status_str}")))?;

    Ok(Document {
        id: row.get("id"),
        owner_id: row.get("owner_id"),
        storage_key: row.get("storage_key"),
        title: row.get("title"),
        status,
        error: row.get("error"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

impl Store {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ============ Documents ============

    pub async fn create_document(
        &self,
        owner_id: &str,
        storage_key: &str,
        title: Option<&str>,
    ) -> Result<Document, PipelineError> {
        if owner_id.trim().is_empty() || storage_key.trim().is_empty() {
            return Err(PipelineError::InvalidInput(
                "owner_id and storage_key must not be empty".to_string(),
            ));
        }

        let now = Utc::now().timestamp_millis();
        let doc = Document {
            id: Uuid::new_v4().to_string(),
            owner_id: owner_id.to_string(),
            storage_key: storage_key.to_string(),
            title: title.map(|t| t.to_string()),
            status: DocumentStatus::Pending,
            error: None,
            created_at: now,
            updated_at: now,
        };

        sqlx::query(
            r#"
            INSERT INTO documents (id, owner_id, storage_key, title, status, error, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, NULL, ?, ?)
            "#,
        )
        .bind(&doc.id)
        .bind(&doc.owner_id)
        .bind(&doc.storage_key)
        .bind(&doc.title)
        .bind(doc.status.as_str())
        .bind(doc.created_at)
        .bind(doc.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(doc)
    }

    pub async fn get_document(&self, id: &str) -> Result<Document, PipelineError> {
        let row = sqlx::query(
            "SELECT id, owner_id, storage_key, title, status, error, created_at, updated_at \
             FROM documents WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| PipelineError::NotFound(format!("document not found: {id}")))?;

        document_from_row(&row)
    }

    /// All documents belonging to one owner, newest first. An owner with no
    /// documents gets an empty list, not an error.
    pub async fn list_documents(&self, owner_id: &str) -> Result<Vec<Document>, PipelineError> {
        let rows = sqlx::query(
            "SELECT id, owner_id, storage_key, title, status, error, created_at, updated_at \
             FROM documents WHERE owner_id = ? ORDER BY created_at DESC, id DESC",
        )
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(document_from_row).collect()
    }

    pub async fn get_status(&self, id: &str) -> Result<DocumentStatus, PipelineError> {
        Ok(self.get_document(id).await?.status)
    }

    /// Atomically claim `PENDING → PROCESSING`. Returns false when the
    /// document is in any other state (including already claimed).
    pub async fn claim_processing(&self, id: &str) -> Result<bool, PipelineError> {
        let result = sqlx::query(
            "UPDATE documents SET status = 'PROCESSING', error = NULL, updated_at = ? \
             WHERE id = ? AND status = 'PENDING'",
        )
        .bind(Utc::now().timestamp_millis())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Reset a document to `PENDING` for explicit re-ingestion. The new run
    /// overwrites prior chunks wholesale, so this is the only sanctioned way
    /// out of `READY` / `FAILED`.
    pub async fn reset_to_pending(&self, id: &str) -> Result<(), PipelineError> {
        let result = sqlx::query(
            "UPDATE documents SET status = 'PENDING', error = NULL, updated_at = ? WHERE id = ?",
        )
        .bind(Utc::now().timestamp_millis())
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(PipelineError::NotFound(format!("document not found: {id}")));
        }
        Ok(())
    }

    /// Record a terminal ingestion failure. Guarded on `PROCESSING` so a
    /// concurrently deleted document stays deleted.
    pub async fn mark_failed(&self, id: &str, error: &str) -> Result<(), PipelineError> {
        sqlx::query(
            "UPDATE documents SET status = 'FAILED', error = ?, updated_at = ? \
             WHERE id = ? AND status = 'PROCESSING'",
        )
        .bind(error)
        .bind(Utc::now().timestamp_millis())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Replace a document's chunk set and vectors and flip it to `READY`,
    /// all in one transaction. Stale chunks from any interrupted run are
    /// discarded, never merged. Returns false (after rolling back) when the
    /// document vanished or left `PROCESSING` mid-run.
    pub async fn commit_ingestion(
        &self,
        document_id: &str,
        chunks: &[Chunk],
        vectors: &[Vec<f32>],
    ) -> Result<bool, PipelineError> {
        if chunks.len() != vectors.len() {
            return Err(PipelineError::Fatal(format!(
                "{} chunks but {} vectors",
                chunks.len(),
                vectors.len()
            )));
        }

        let mut tx = self.pool.begin().await?;

        // The guarded status flip comes first: chunks reference documents by
        // foreign key, so a document deleted mid-run must be detected before
        // any chunk row is written.
        let result = sqlx::query(
            "UPDATE documents SET status = 'READY', updated_at = ? \
             WHERE id = ? AND status = 'PROCESSING'",
        )
        .bind(Utc::now().timestamp_millis())
        .bind(document_id)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query("DELETE FROM chunk_vectors WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM chunks WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;

        for (chunk, vector) in chunks.iter().zip(vectors.iter()) {
            sqlx::query(
                "INSERT INTO chunks (id, document_id, chunk_index, text, token_count, hash) \
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(&chunk.id)
            .bind(&chunk.document_id)
            .bind(chunk.chunk_index)
            .bind(&chunk.text)
            .bind(chunk.token_count)
            .bind(&chunk.hash)
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                "INSERT INTO chunk_vectors (chunk_id, document_id, chunk_index, embedding) \
                 VALUES (?, ?, ?, ?)",
            )
            .bind(&chunk.id)
            .bind(&chunk.document_id)
            .bind(chunk.chunk_index)
            .bind(vec_to_blob(vector))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(true)
    }

    /// Purge a document and everything it owns. Safe while ingestion is in
    /// flight: the run's guarded `READY` update will then hit zero rows and
    /// roll back instead of resurrecting data.
    pub async fn delete_document(&self, id: &str) -> Result<(), PipelineError> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query("DELETE FROM documents WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(PipelineError::NotFound(format!("document not found: {id}")));
        }

        sqlx::query("DELETE FROM messages WHERE document_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM chunk_vectors WHERE document_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM chunks WHERE document_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    // ============ Chunks ============

    pub async fn chunk_count(&self, document_id: &str) -> Result<i64, PipelineError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks WHERE document_id = ?")
            .bind(document_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Hydrate chunk rows for the given ids, preserving the requested order.
    pub async fn get_chunks_by_ids(&self, ids: &[String]) -> Result<Vec<Chunk>, PipelineError> {
        let mut chunks = Vec::with_capacity(ids.len());
        for id in ids {
            let row = sqlx::query(
                "SELECT id, document_id, chunk_index, text, token_count, hash \
                 FROM chunks WHERE id = ?",
            )
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("chunk not found: {id}")))?;

            chunks.push(Chunk {
                id: row.get("id"),
                document_id: row.get("document_id"),
                chunk_index: row.get("chunk_index"),
                text: row.get("text"),
                token_count: row.get("token_count"),
                hash: row.get("hash"),
            });
        }
        Ok(chunks)
    }

    // ============ Messages ============

    pub async fn append_message(
        &self,
        document_id: &str,
        is_user: bool,
        text: &str,
    ) -> Result<Message, PipelineError> {
        let msg = Message {
            id: Uuid::new_v4().to_string(),
            document_id: document_id.to_string(),
            is_user,
            text: text.to_string(),
            created_at: Utc::now().timestamp_millis(),
        };

        sqlx::query(
            "INSERT INTO messages (id, document_id, is_user, text, created_at) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&msg.id)
        .bind(&msg.document_id)
        .bind(msg.is_user as i64)
        .bind(&msg.text)
        .bind(msg.created_at)
        .execute(&self.pool)
        .await?;

        Ok(msg)
    }

    /// List messages newest-first with an opaque cursor.
    ///
    /// The cursor is the id of the first row of the requested page
    /// (inclusive); `next_cursor` is the id of the row that would start the
    /// following page. Fetches `limit + 1` rows and pops the extra one, so
    /// pages never overlap.
    pub async fn list_messages(
        &self,
        document_id: &str,
        cursor: Option<&str>,
        limit: Option<i64>,
    ) -> Result<MessagePage, PipelineError> {
        // Documents must exist before their thread can be read.
        self.get_document(document_id).await?;

        let limit = limit
            .unwrap_or(MESSAGE_LIMIT_DEFAULT)
            .clamp(1, MESSAGE_LIMIT_MAX);

        let rows = match cursor {
            None => {
                sqlx::query(
                    "SELECT id, document_id, is_user, text, created_at FROM messages \
                     WHERE document_id = ? \
                     ORDER BY created_at DESC, id DESC LIMIT ?",
                )
                .bind(document_id)
                .bind(limit + 1)
                .fetch_all(&self.pool)
                .await?
            }
            Some(cursor_id) => {
                let anchor = sqlx::query(
                    "SELECT created_at, id FROM messages WHERE id = ? AND document_id = ?",
                )
                .bind(cursor_id)
                .bind(document_id)
                .fetch_optional(&self.pool)
                .await?
                .ok_or_else(|| PipelineError::NotFound(format!("unknown cursor: {cursor_id}")))?;

                let anchor_ts: i64 = anchor.get("created_at");
                let anchor_id: String = anchor.get("id");

                sqlx::query(
                    "SELECT id, document_id, is_user, text, created_at FROM messages \
                     WHERE document_id = ? \
                       AND (created_at < ? OR (created_at = ? AND id <= ?)) \
                     ORDER BY created_at DESC, id DESC LIMIT ?",
                )
                .bind(document_id)
                .bind(anchor_ts)
                .bind(anchor_ts)
                .bind(&anchor_id)
                .bind(limit + 1)
                .fetch_all(&self.pool)
                .await?
            }
        };

        let mut messages: Vec<Message> = rows
            .iter()
            .map(|row| {
                let is_user: i64 = row.get("is_user");
                Message {
                    id: row.get("id"),
                    document_id: row.get("document_id"),
                    is_user: is_user != 0,
                    text: row.get("text"),
                    created_at: row.get("created_at"),
                }
            })
            .collect();

        let next_cursor = if messages.len() as i64 > limit {
            messages.pop().map(|m| m.id)
        } else {
            None
        };

        Ok(MessagePage {
            messages,
            next_cursor,
        })
    }
}
