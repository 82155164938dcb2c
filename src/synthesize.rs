//! Answer synthesis: prompt assembly and streamed completion.
//!
//! Builds a bounded prompt from system instructions, the retrieved chunks,
//! and recent conversation history (oldest turns dropped first when over
//! budget), then streams the model's answer tokens to the caller. The
//! assistant [`Message`] is persisted only after the stream completes
//! without error; tokens already delivered before a mid-stream failure are
//! never clawed back. Dropping the returned stream cancels upstream
//! consumption.

use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::chunk::count_tokens;
use crate::config::{CompletionConfig, SynthesisConfig};
use crate::embedding::backoff_delay;
use crate::error::PipelineError;
use crate::models::{Chunk, DocumentStatus, Message};
use crate::retrieve::Retriever;
use crate::store::Store;

/// Streamed answer tokens. Ends with `None` on success or `Some(Err)` on a
/// mid-stream failure.
pub type TokenStream = Pin<Box<dyn Stream<Item = Result<String, PipelineError>> + Send>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone)]
pub struct PromptMessage {
    pub role: Role,
    pub content: String,
}

/// Chat-completion backend that streams answer tokens.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    async fn stream_completion(
        &self,
        messages: &[PromptMessage],
    ) -> Result<TokenStream, PipelineError>;
}

const SYSTEM_INSTRUCTIONS: &str = "You are a helpful assistant answering questions about an \
uploaded document. Answer using only the provided context. If the context does not contain \
the answer, say you don't know.";

/// Assemble the bounded prompt.
///
/// System instructions plus retrieved context are mandatory; with the
/// question they must fit `max_prompt_tokens` or the call fails with
/// `ContextTooLarge` (the caller can shrink k or ask a narrower question).
/// History gets whatever remains, capped at `history_tokens`, dropping the
/// oldest turns first. `history` must be ordered oldest first.
pub fn build_prompt(
    chunks: &[Chunk],
    history: &[Message],
    question: &str,
    cfg: &SynthesisConfig,
) -> Result<Vec<PromptMessage>, PipelineError> {
    let mut system = String::from(SYSTEM_INSTRUCTIONS);
    if !chunks.is_empty() {
        system.push_str("\n\nContext:\n");
        for chunk in chunks {
            system.push_str("\n---\n");
            system.push_str(&chunk.text);
        }
    }

    let fixed_tokens = count_tokens(&system) + count_tokens(question);
    if fixed_tokens > cfg.max_prompt_tokens {
        return Err(PipelineError::ContextTooLarge(format!(
            "prompt needs {fixed_tokens} tokens, budget is {}",
            cfg.max_prompt_tokens
        )));
    }

    let history_budget = cfg
        .history_tokens
        .min(cfg.max_prompt_tokens - fixed_tokens);

    // Walk newest-to-oldest so the most recent turns survive, then restore
    // chronological order.
    let mut kept: Vec<&Message> = Vec::new();
    let mut used = 0usize;
    for msg in history.iter().rev() {
        let cost = count_tokens(&msg.text);
        if used + cost > history_budget {
            break;
        }
        used += cost;
        kept.push(msg);
    }
    kept.reverse();

    let mut messages = Vec::with_capacity(kept.len() + 2);
    messages.push(PromptMessage {
        role: Role::System,
        content: system,
    });
    for msg in kept {
        messages.push(PromptMessage {
            role: if msg.is_user { Role::User } else { Role::Assistant },
            content: msg.text.clone(),
        });
    }
    messages.push(PromptMessage {
        role: Role::User,
        content: question.to_string(),
    });

    Ok(messages)
}

/// How many recent messages to consider for prompt history. The token
/// budget usually trims further.
const HISTORY_FETCH_LIMIT: i64 = 50;

pub struct Synthesizer {
    store: Store,
    retriever: Retriever,
    completer: Arc<dyn CompletionProvider>,
    top_k: usize,
    cfg: SynthesisConfig,
}

impl Synthesizer {
    pub fn new(
        store: Store,
        retriever: Retriever,
        completer: Arc<dyn CompletionProvider>,
        top_k: usize,
        cfg: SynthesisConfig,
    ) -> Self {
        Self {
            store,
            retriever,
            completer,
            top_k,
            cfg,
        }
    }

    /// Answer `question` about a `READY` document, streaming tokens.
    ///
    /// The user's question is persisted immediately; the assistant's answer
    /// only after a complete, non-erroring stream. A document still
    /// `PENDING`/`PROCESSING` (or `FAILED`) reports `NotReady` instead of
    /// silently answering from an empty index.
    pub async fn answer(
        &self,
        document_id: &str,
        question: &str,
    ) -> Result<TokenStream, PipelineError> {
        if question.trim().is_empty() {
            return Err(PipelineError::InvalidInput(
                "question must not be empty".to_string(),
            ));
        }

        let doc = self.store.get_document(document_id).await?;
        match doc.status {
            DocumentStatus::Ready => {}
            DocumentStatus::Pending | DocumentStatus::Processing => {
                return Err(PipelineError::NotReady(format!(
                    "document {document_id} is still ingesting"
                )));
            }
            DocumentStatus::Failed => {
                return Err(PipelineError::NotReady(format!(
                    "document {document_id} failed ingestion"
                )));
            }
        }

        let mut history = self
            .store
            .list_messages(document_id, None, Some(HISTORY_FETCH_LIMIT))
            .await?
            .messages;
        history.reverse(); // oldest first for prompt assembly

        // A READY document normally has indexed chunks; an empty index means
        // no usable context, not a hard failure.
        let chunks = match self
            .retriever
            .retrieve(document_id, question, self.top_k)
            .await
        {
            Ok(chunks) => chunks,
            Err(PipelineError::NotFound(_)) => Vec::new(),
            Err(e) => return Err(e),
        };

        let prompt = build_prompt(&chunks, &history, question, &self.cfg)?;

        self.store.append_message(document_id, true, question).await?;

        let mut upstream = self.completer.stream_completion(&prompt).await?;

        let (tx, rx) = mpsc::channel::<Result<String, PipelineError>>(32);
        let store = self.store.clone();
        let document_id = document_id.to_string();

        tokio::spawn(async move {
            let mut answer = String::new();
            let mut failed = false;

            while let Some(item) = upstream.next().await {
                match item {
                    Ok(token) => {
                        answer.push_str(&token);
                        if tx.send(Ok(token)).await.is_err() {
                            // Caller went away; dropping `upstream` below
                            // stops model consumption.
                            tracing::debug!(%document_id, "answer stream cancelled by caller");
                            return;
                        }
                    }
                    Err(e) => {
                        failed = true;
                        let _ = tx.send(Err(e)).await;
                        break;
                    }
                }
            }

            if !failed {
                if let Err(e) = store.append_message(&document_id, false, &answer).await {
                    tracing::error!(%document_id, error = %e, "failed to persist answer");
                }
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

// ============ OpenAI-compatible streaming completer ============

/// Streams `POST {base_url}/chat/completions` with `stream: true`, parsing
/// server-sent events into answer tokens. Connect-phase failures are
/// retried with backoff; once tokens are flowing, a failure surfaces as a
/// mid-stream error (partial output stands).
pub struct OpenAiCompleter {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    max_retries: u32,
}

impl OpenAiCompleter {
    pub fn new(config: &CompletionConfig) -> Result<Self, PipelineError> {
        let model = config.model.clone().ok_or_else(|| {
            PipelineError::InvalidInput("completion.model required for openai provider".to_string())
        })?;
        let api_key = std::env::var("OPENAI_API_KEY").map_err(|_| {
            PipelineError::InvalidInput("OPENAI_API_KEY environment variable not set".to_string())
        })?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| PipelineError::Fatal(format!("http client init failed: {e}")))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            model,
            max_retries: config.max_retries,
        })
    }

    async fn connect(
        &self,
        messages: &[PromptMessage],
    ) -> Result<reqwest::Response, PipelineError> {
        let body = serde_json::json!({
            "model": self.model,
            "stream": true,
            "messages": messages.iter().map(|m| serde_json::json!({
                "role": m.role.as_str(),
                "content": m.content,
            })).collect::<Vec<_>>(),
        });

        let resp = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| PipelineError::UpstreamUnavailable(e.to_string()))?;

        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }

        let detail = resp.text().await.unwrap_or_default();
        if status.as_u16() == 429 {
            Err(PipelineError::RateLimited(format!("chat API: {detail}")))
        } else if status.is_server_error() {
            Err(PipelineError::UpstreamUnavailable(format!(
                "chat API {status}: {detail}"
            )))
        } else if status.as_u16() == 413 {
            Err(PipelineError::ContextTooLarge(format!(
                "chat API {status}: {detail}"
            )))
        } else {
            Err(PipelineError::InvalidInput(format!(
                "chat API {status}: {detail}"
            )))
        }
    }
}

#[async_trait]
impl CompletionProvider for OpenAiCompleter {
    async fn stream_completion(
        &self,
        messages: &[PromptMessage],
    ) -> Result<TokenStream, PipelineError> {
        let mut last_err = None;
        let mut resp = None;
        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                tokio::time::sleep(backoff_delay(attempt)).await;
            }
            match self.connect(messages).await {
                Ok(r) => {
                    resp = Some(r);
                    break;
                }
                Err(e) if e.is_transient() => {
                    tracing::warn!(attempt, error = %e, "completion connect failed, will retry");
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        let resp = match resp {
            Some(r) => r,
            None => {
                return Err(last_err.unwrap_or_else(|| {
                    PipelineError::UpstreamUnavailable("retries exhausted".to_string())
                }))
            }
        };

        let (tx, rx) = mpsc::channel::<Result<String, PipelineError>>(32);
        tokio::spawn(async move {
            let mut bytes = resp.bytes_stream();
            let mut buf: Vec<u8> = Vec::new();

            'outer: while let Some(part) = bytes.next().await {
                let part = match part {
                    Ok(b) => b,
                    Err(e) => {
                        let _ = tx
                            .send(Err(PipelineError::UpstreamUnavailable(e.to_string())))
                            .await;
                        return;
                    }
                };
                buf.extend_from_slice(&part);

                while let Some(line) = take_sse_line(&mut buf) {
                    let Some(payload) = line.strip_prefix("data:") else {
                        continue;
                    };
                    let payload = payload.trim();
                    if payload == "[DONE]" {
                        break 'outer;
                    }
                    let Ok(json) = serde_json::from_str::<serde_json::Value>(payload) else {
                        continue;
                    };
                    let token = json
                        .pointer("/choices/0/delta/content")
                        .and_then(|v| v.as_str())
                        .unwrap_or("");
                    if !token.is_empty() && tx.send(Ok(token.to_string())).await.is_err() {
                        // Receiver dropped; closing the response aborts the
                        // upstream request.
                        return;
                    }
                }
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

/// Pop one newline-terminated line off the byte buffer, trimmed and
/// lossily decoded. Bytes after the last newline stay buffered, so a
/// multi-byte character split across network chunks is only decoded once
/// it is complete.
fn take_sse_line(buf: &mut Vec<u8>) -> Option<String> {
    let pos = buf.iter().position(|&b| b == b'\n')?;
    let line: Vec<u8> = buf.drain(..=pos).collect();
    Some(String::from_utf8_lossy(&line).trim().to_string())
}

/// No-op provider used when completions are not configured.
pub struct DisabledCompleter;

#[async_trait]
impl CompletionProvider for DisabledCompleter {
    async fn stream_completion(
        &self,
        _messages: &[PromptMessage],
    ) -> Result<TokenStream, PipelineError> {
        Err(PipelineError::InvalidInput(
            "completion provider is disabled; set [completion] provider in config".to_string(),
        ))
    }
}

/// Create the configured [`CompletionProvider`].
pub fn create_completer(
    config: &CompletionConfig,
) -> Result<Arc<dyn CompletionProvider>, PipelineError> {
    match config.provider.as_str() {
        "openai" => Ok(Arc::new(OpenAiCompleter::new(config)?)),
        "disabled" => Ok(Arc::new(DisabledCompleter)),
        other => Err(PipelineError::InvalidInput(format!(
            "unknown completion provider: {other}"
        ))),
    }
}
