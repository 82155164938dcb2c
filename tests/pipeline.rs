//! End-to-end pipeline tests: real SQLite on disk, filesystem storage, and
//! deterministic in-process providers standing in for the embedding and
//! completion APIs.

use async_trait::async_trait;
use futures_util::StreamExt;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use paperchat::chunk::chunk_text;
use paperchat::config::{
    ChunkingConfig, CompletionConfig, Config, DbConfig, EmbeddingConfig, RetrievalConfig,
    ServerConfig, StorageConfig, SynthesisConfig,
};
use paperchat::db;
use paperchat::embedding::{Embedder, OpenAiEmbedder};
use paperchat::error::PipelineError;
use paperchat::index::VectorIndex;
use paperchat::ingest::IngestOutcome;
use paperchat::migrate::run_migrations;
use paperchat::models::DocumentStatus;
use paperchat::retrieve::Retriever;
use paperchat::service::Pipeline;
use paperchat::storage::FsStorage;
use paperchat::store::Store;
use paperchat::synthesize::{CompletionProvider, PromptMessage, TokenStream};

const MAX_TOKENS: usize = 20;
const OVERLAP: usize = 5;

// ============ Deterministic providers ============

fn hash_vector(text: &str) -> Vec<f32> {
    let digest = Sha256::digest(text.as_bytes());
    digest[..8]
        .iter()
        .map(|&b| (b as f32 - 127.5) / 127.5)
        .collect()
}

struct HashEmbedder;

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

/// Fails the first `fail_first` calls with a transient error, then behaves
/// like [`HashEmbedder`].
struct FlakyEmbedder {
    calls: AtomicU32,
    fail_first: u32,
}

#[async_trait]
impl Embedder for FlakyEmbedder {
    fn model_name(&self) -> &str {
        "flaky-test"
    }
    fn dims(&self) -> usize {
        8
    }
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, PipelineError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) < self.fail_first {
            return Err(PipelineError::UpstreamUnavailable("flaky".to_string()));
        }
        Ok(texts.iter().map(|t| hash_vector(t)).collect())
    }
}

/// Blocks inside `embed` until released, so a test can interleave other
/// operations with an in-flight ingestion run.
struct GatedEmbedder {
    gate: Arc<tokio::sync::Notify>,
}

#[async_trait]
impl Embedder for GatedEmbedder {
    fn model_name(&self) -> &str {
        "gated-test"
    }
    fn dims(&self) -> usize {
        8
    }
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, PipelineError> {
        self.gate.notified().await;
        Ok(texts.iter().map(|t| hash_vector(t)).collect())
    }
}

/// Streams a fixed token script and stops.
struct ScriptedCompleter {
    tokens: Vec<&'static str>,
}

#[async_trait]
impl CompletionProvider for ScriptedCompleter {
    async fn stream_completion(
        &self,
        _messages: &[PromptMessage],
    ) -> Result<TokenStream, PipelineError> {
        let tokens: Vec<Result<String, PipelineError>> =
            self.tokens.iter().map(|t| Ok(t.to_string())).collect();
        Ok(Box::pin(futures_util::stream::iter(tokens)))
    }
}

/// Streams tokens forever; only a dropped consumer stops it.
struct EndlessCompleter;

#[async_trait]
impl CompletionProvider for EndlessCompleter {
    async fn stream_completion(
        &self,
        _messages: &[PromptMessage],
    ) -> Result<TokenStream, PipelineError> {
        Ok(Box::pin(futures_util::stream::unfold(0u64, |n| async move {
            tokio::time::sleep(Duration::from_millis(1)).await;
            Some((Ok(format!("tok{n} ")), n + 1))
        })))
    }
}

// ============ Harness ============

struct Harness {
    pipeline: Pipeline,
    store: Store,
    pool: sqlx::SqlitePool,
    _dir: tempfile::TempDir,
}

fn test_config(dir: &tempfile::TempDir) -> Config {
    Config {
        db: DbConfig {
            path: dir.path().join("chat.sqlite"),
        },
        storage: StorageConfig {
            root: dir.path().join("uploads"),
        },
        chunking: ChunkingConfig {
            max_tokens: MAX_TOKENS,
            overlap_tokens: OVERLAP,
        },
        embedding: EmbeddingConfig::default(),
        completion: CompletionConfig::default(),
        retrieval: RetrievalConfig { top_k: 2 },
        synthesis: SynthesisConfig::default(),
        server: ServerConfig {
            bind: "127.0.0.1:0".to_string(),
        },
    }
}

async fn harness(
    embedder: Arc<dyn Embedder>,
    completer: Arc<dyn CompletionProvider>,
    files: &[(&str, &str)],
) -> Harness {
    harness_with_chunking(embedder, completer, files, MAX_TOKENS, OVERLAP).await
}

async fn harness_with_chunking(
    embedder: Arc<dyn Embedder>,
    completer: Arc<dyn CompletionProvider>,
    files: &[(&str, &str)],
    max_tokens: usize,
    overlap_tokens: usize,
) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = test_config(&dir);
    cfg.chunking = ChunkingConfig {
        max_tokens,
        overlap_tokens,
    };

    std::fs::create_dir_all(&cfg.storage.root).unwrap();
    for (key, body) in files {
        std::fs::write(cfg.storage.root.join(key), body).unwrap();
    }

    let pool = db::connect(&cfg.db.path).await.unwrap();
    run_migrations(&pool).await.unwrap();

    let storage = Arc::new(FsStorage::new(cfg.storage.root.clone()));
    let pipeline = Pipeline::new(pool.clone(), storage, embedder, completer, &cfg);
    let store = Store::new(pool.clone());

    Harness {
        pipeline,
        store,
        pool,
        _dir: dir,
    }
}

/// A ~90-token document with no sentence or paragraph breaks, so chunk
/// boundaries are exactly the hard cuts.
fn fixture_text() -> String {
    (0..90).map(|i| format!("word{i}")).collect::<Vec<_>>().join(" ")
}

// ============ Tests ============

#[tokio::test]
async fn ingest_reaches_ready_with_expected_chunks() {
    let text = fixture_text();
    let h = harness(
        Arc::new(HashEmbedder),
        Arc::new(ScriptedCompleter { tokens: vec![] }),
        &[("doc.txt", &text)],
    )
    .await;

    let doc = h
        .pipeline
        .register_document("u1", "doc.txt", Some("Fixture"))
        .await
        .unwrap();
    assert_eq!(doc.status, DocumentStatus::Pending);

    let outcome = h.pipeline.run_ingestion(&doc.id).await.unwrap();
    assert_eq!(outcome, IngestOutcome::Ready);
    assert_eq!(
        h.pipeline.get_status(&doc.id).await.unwrap(),
        DocumentStatus::Ready
    );

    let expected = chunk_text(&text, MAX_TOKENS, OVERLAP).unwrap();
    assert_eq!(
        h.store.chunk_count(&doc.id).await.unwrap(),
        expected.len() as i64
    );
}

#[tokio::test]
async fn five_chunk_document_full_lifecycle() {
    // 800 words at max_tokens=200 / overlap=20 hard-cut into exactly five
    // chunks: starts at 0, 180, 360, 540, 720.
    let text = (0..800).map(|i| format!("word{i}")).collect::<Vec<_>>().join(" ");
    let h = harness_with_chunking(
        Arc::new(HashEmbedder),
        Arc::new(ScriptedCompleter { tokens: vec![] }),
        &[("doc.txt", &text)],
        200,
        20,
    )
    .await;

    let doc = h
        .pipeline
        .register_document("u1", "doc.txt", None)
        .await
        .unwrap();
    assert_eq!(
        h.pipeline.run_ingestion(&doc.id).await.unwrap(),
        IngestOutcome::Ready
    );
    assert_eq!(
        h.pipeline.get_status(&doc.id).await.unwrap(),
        DocumentStatus::Ready
    );
    assert_eq!(h.store.chunk_count(&doc.id).await.unwrap(), 5);

    // Chunk 2's own text retrieves chunk 2 as the top hit.
    let pieces = chunk_text(&text, 200, 20).unwrap();
    assert_eq!(pieces.len(), 5);
    let retriever = Retriever::new(
        Arc::new(HashEmbedder),
        VectorIndex::new(h.pool.clone()),
        h.store.clone(),
    );
    let hits = retriever.retrieve(&doc.id, &pieces[2].text, 1).await.unwrap();
    assert_eq!(hits[0].chunk_index, 2);
}

#[tokio::test]
async fn reingest_is_idempotent() {
    let text = fixture_text();
    let h = harness(
        Arc::new(HashEmbedder),
        Arc::new(ScriptedCompleter { tokens: vec![] }),
        &[("doc.txt", &text)],
    )
    .await;
    let doc = h
        .pipeline
        .register_document("u1", "doc.txt", None)
        .await
        .unwrap();

    assert_eq!(
        h.pipeline.run_ingestion(&doc.id).await.unwrap(),
        IngestOutcome::Ready
    );
    let first_count = h.store.chunk_count(&doc.id).await.unwrap();

    // A second run without a reset cannot claim the lease.
    assert_eq!(
        h.pipeline.run_ingestion(&doc.id).await.unwrap(),
        IngestOutcome::NotClaimed
    );

    // A forced re-run replaces the chunk set wholesale, same count.
    h.store.reset_to_pending(&doc.id).await.unwrap();
    assert_eq!(
        h.pipeline.run_ingestion(&doc.id).await.unwrap(),
        IngestOutcome::Ready
    );
    assert_eq!(h.store.chunk_count(&doc.id).await.unwrap(), first_count);
}

#[tokio::test]
async fn indexed_chunk_retrieves_itself_after_full_ingest() {
    let text = fixture_text();
    let h = harness(
        Arc::new(HashEmbedder),
        Arc::new(ScriptedCompleter { tokens: vec![] }),
        &[("doc.txt", &text)],
    )
    .await;
    let doc = h
        .pipeline
        .register_document("u1", "doc.txt", None)
        .await
        .unwrap();
    h.pipeline.run_ingestion(&doc.id).await.unwrap();

    let pieces = chunk_text(&text, MAX_TOKENS, OVERLAP).unwrap();
    assert!(pieces.len() >= 3);

    let retriever = Retriever::new(
        Arc::new(HashEmbedder),
        VectorIndex::new(h.pool.clone()),
        h.store.clone(),
    );
    // Querying with a chunk's exact text must rank that chunk first.
    let hits = retriever.retrieve(&doc.id, &pieces[2].text, 1).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].chunk_index, 2);
    assert_eq!(hits[0].text, pieces[2].text);
}

// Runs in real time: the retry backoff sleeps cannot be paused alongside
// an on-disk connection pool without tripping its acquire timeout.
#[tokio::test]
async fn transient_embedding_failures_are_retried_to_ready() {
    let text = fixture_text();
    let embedder = Arc::new(FlakyEmbedder {
        calls: AtomicU32::new(0),
        fail_first: 2,
    });
    let h = harness(
        embedder.clone(),
        Arc::new(ScriptedCompleter { tokens: vec![] }),
        &[("doc.txt", &text)],
    )
    .await;
    let doc = h
        .pipeline
        .register_document("u1", "doc.txt", None)
        .await
        .unwrap();

    assert_eq!(
        h.pipeline.run_ingestion(&doc.id).await.unwrap(),
        IngestOutcome::Ready
    );
    assert_eq!(embedder.calls.load(Ordering::SeqCst), 3);
    // All chunks indexed despite the failed attempts.
    let expected = chunk_text(&text, MAX_TOKENS, OVERLAP).unwrap();
    assert_eq!(
        h.store.chunk_count(&doc.id).await.unwrap(),
        expected.len() as i64
    );
}

#[tokio::test]
async fn ingestion_failure_marks_failed_and_blocks_ask() {
    // Storage key points at nothing.
    let h = harness(
        Arc::new(HashEmbedder),
        Arc::new(ScriptedCompleter { tokens: vec![] }),
        &[],
    )
    .await;
    let doc = h
        .pipeline
        .register_document("u1", "missing.pdf", None)
        .await
        .unwrap();

    let err = h.pipeline.run_ingestion(&doc.id).await.unwrap_err();
    assert!(matches!(err, PipelineError::NotFound(_)));

    let failed = h.pipeline.get_document(&doc.id).await.unwrap();
    assert_eq!(failed.status, DocumentStatus::Failed);
    assert!(failed.error.is_some());

    let ask_err = h
        .pipeline
        .ask_question(&doc.id, "anything?")
        .await
        .err()
        .unwrap();
    assert!(matches!(ask_err, PipelineError::NotReady(_)));
}

#[tokio::test]
async fn ask_before_ingestion_is_not_ready() {
    let h = harness(
        Arc::new(HashEmbedder),
        Arc::new(ScriptedCompleter { tokens: vec![] }),
        &[],
    )
    .await;
    let doc = h
        .pipeline
        .register_document("u1", "doc.txt", None)
        .await
        .unwrap();

    let err = h
        .pipeline
        .ask_question(&doc.id, "too early?")
        .await
        .err()
        .unwrap();
    assert!(matches!(err, PipelineError::NotReady(_)));
}

#[tokio::test]
async fn full_answer_stream_persists_both_messages() {
    let text = fixture_text();
    let h = harness(
        Arc::new(HashEmbedder),
        Arc::new(ScriptedCompleter {
            tokens: vec!["It", " is", " word42."],
        }),
        &[("doc.txt", &text)],
    )
    .await;
    let doc = h
        .pipeline
        .register_document("u1", "doc.txt", None)
        .await
        .unwrap();
    h.pipeline.run_ingestion(&doc.id).await.unwrap();

    let mut stream = h
        .pipeline
        .ask_question(&doc.id, "what is the answer")
        .await
        .unwrap();
    let mut answer = String::new();
    while let Some(token) = stream.next().await {
        answer.push_str(&token.unwrap());
    }
    assert_eq!(answer, "It is word42.");

    // The assistant message lands after the stream ends; poll briefly.
    let mut page = h.pipeline.list_messages(&doc.id, None, None).await.unwrap();
    for _ in 0..50 {
        if page.messages.len() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        page = h.pipeline.list_messages(&doc.id, None, None).await.unwrap();
    }

    assert_eq!(page.messages.len(), 2);
    // Newest first: assistant answer, then the user question.
    assert!(!page.messages[0].is_user);
    assert_eq!(page.messages[0].text, "It is word42.");
    assert!(page.messages[1].is_user);
    assert_eq!(page.messages[1].text, "what is the answer");
}

#[tokio::test]
async fn dropped_answer_stream_cancels_without_persisting() {
    let text = fixture_text();
    let h = harness(
        Arc::new(HashEmbedder),
        Arc::new(EndlessCompleter),
        &[("doc.txt", &text)],
    )
    .await;
    let doc = h
        .pipeline
        .register_document("u1", "doc.txt", None)
        .await
        .unwrap();
    h.pipeline.run_ingestion(&doc.id).await.unwrap();

    let mut stream = h
        .pipeline
        .ask_question(&doc.id, "never ending?")
        .await
        .unwrap();
    let first = stream.next().await.unwrap().unwrap();
    assert!(first.starts_with("tok"));
    drop(stream);

    // Give the forwarding task time to observe the cancellation.
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Only the user's question was persisted; no partial answer.
    let page = h.pipeline.list_messages(&doc.id, None, None).await.unwrap();
    assert_eq!(page.messages.len(), 1);
    assert!(page.messages[0].is_user);
}

#[tokio::test]
async fn delete_during_ingestion_keeps_nothing() {
    let text = fixture_text();
    let gate = Arc::new(tokio::sync::Notify::new());
    let h = harness(
        Arc::new(GatedEmbedder { gate: gate.clone() }),
        Arc::new(ScriptedCompleter { tokens: vec![] }),
        &[("doc.txt", &text)],
    )
    .await;
    let doc = h
        .pipeline
        .register_document("u1", "doc.txt", None)
        .await
        .unwrap();

    let pipeline = h.pipeline.clone();
    let id = doc.id.clone();
    let run = tokio::spawn(async move { pipeline.run_ingestion(&id).await });

    // Wait for the run to claim the lease.
    loop {
        if h.pipeline.get_status(&doc.id).await.unwrap() == DocumentStatus::Processing {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    // While the run is mid-flight the document answers NotReady, never
    // silently from an empty index.
    let ask_err = h
        .pipeline
        .ask_question(&doc.id, "too soon?")
        .await
        .err()
        .unwrap();
    assert!(matches!(ask_err, PipelineError::NotReady(_)));

    h.pipeline.delete_document(&doc.id).await.unwrap();
    gate.notify_one();

    let outcome = run.await.unwrap().unwrap();
    assert_eq!(outcome, IngestOutcome::DeletedMidRun);

    assert!(matches!(
        h.pipeline.get_document(&doc.id).await.unwrap_err(),
        PipelineError::NotFound(_)
    ));
    assert_eq!(h.store.chunk_count(&doc.id).await.unwrap(), 0);
}

#[tokio::test]
async fn delete_unknown_document_is_not_found() {
    let h = harness(
        Arc::new(HashEmbedder),
        Arc::new(ScriptedCompleter { tokens: vec![] }),
        &[],
    )
    .await;
    assert!(matches!(
        h.pipeline.delete_document("ghost").await.unwrap_err(),
        PipelineError::NotFound(_)
    ));
}

// ============ OpenAI embedding provider against a mock server ============

fn openai_test_config(base_url: String, max_retries: u32) -> EmbeddingConfig {
    EmbeddingConfig {
        provider: "openai".to_string(),
        model: Some("text-embedding-3-small".to_string()),
        dims: Some(4),
        base_url,
        batch_size: 64,
        max_retries,
        parallelism: 1,
        timeout_secs: 5,
    }
}

#[tokio::test]
async fn openai_embedder_parses_successful_response() {
    let server = httpmock::MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(httpmock::Method::POST)
                .path("/v1/embeddings")
                .header("Authorization", "Bearer test-key")
                .json_body_partial(r#"{"model": "text-embedding-3-small"}"#);
            then.status(200).json_body(serde_json::json!({
                "data": [
                    {"index": 0, "embedding": [1.0, 0.0, 0.0, 0.0]},
                    {"index": 1, "embedding": [0.0, 1.0, 0.0, 0.0]},
                ]
            }));
        })
        .await;

    std::env::set_var("OPENAI_API_KEY", "test-key");
    let embedder = OpenAiEmbedder::new(&openai_test_config(server.url("/v1"), 0)).unwrap();

    let vectors = embedder
        .embed(&["first".to_string(), "second".to_string()])
        .await
        .unwrap();
    assert_eq!(vectors, vec![vec![1.0, 0.0, 0.0, 0.0], vec![0.0, 1.0, 0.0, 0.0]]);
    mock.assert_async().await;
}

#[tokio::test]
async fn openai_embedder_maps_rate_limiting() {
    let server = httpmock::MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(httpmock::Method::POST).path("/v1/embeddings");
            then.status(429).body("slow down");
        })
        .await;

    std::env::set_var("OPENAI_API_KEY", "test-key");
    let embedder = OpenAiEmbedder::new(&openai_test_config(server.url("/v1"), 0)).unwrap();

    let err = embedder.embed(&["text".to_string()]).await.unwrap_err();
    assert!(matches!(err, PipelineError::RateLimited(_)));
    assert!(err.is_transient());
}

// The orchestrator owns retrying; the provider makes exactly one upstream
// call per `embed`, whatever max_retries says.
#[tokio::test]
async fn openai_embedder_makes_one_call_per_embed() {
    let server = httpmock::MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(httpmock::Method::POST).path("/v1/embeddings");
            then.status(500).body("boom");
        })
        .await;

    std::env::set_var("OPENAI_API_KEY", "test-key");
    let embedder = OpenAiEmbedder::new(&openai_test_config(server.url("/v1"), 5)).unwrap();

    let err = embedder.embed(&["text".to_string()]).await.unwrap_err();
    assert!(matches!(err, PipelineError::UpstreamUnavailable(_)));
    mock.assert_hits_async(1).await;
}
