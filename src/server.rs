//! HTTP API server.
//!
//! Exposes the pipeline to the web application: register an upload, poll
//! ingestion status, page through the chat thread, ask a question (chunked
//! streaming response), and delete a document.
//!
//! # Endpoints
//!
//! | Method   | Path | Description |
//! |----------|------|-------------|
//! | `POST`   | `/documents` | Register an upload and start ingestion |
//! | `GET`    | `/documents` | List an owner's documents (`owner_id` query) |
//! | `POST`   | `/documents/{id}/ingest` | Re-run ingestion (`force` resets first) |
//! | `GET`    | `/documents/{id}/status` | Ingestion status |
//! | `GET`    | `/documents/{id}/messages` | Page through the chat thread |
//! | `POST`   | `/documents/{id}/ask` | Ask a question; streams answer tokens |
//! | `DELETE` | `/documents/{id}` | Delete the document and everything it owns |
//! | `GET`    | `/health` | Health check (returns version) |
//!
//! # Error Contract
//!
//! All error responses use a JSON envelope:
//!
//! ```json
//! { "error": { "code": "not_ready", "message": "document d1 is still ingesting" } }
//! ```
//!
//! Codes: `bad_request` (400), `not_found` (404), `not_ready` (409),
//! `context_too_large` (413), `upstream_unavailable` (503), `internal` (500).
//!
//! Client disconnect during an `ask` stream drops the response body, which
//! cancels upstream model consumption.

use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::config::Config;
use crate::error::PipelineError;
use crate::models::{Document, DocumentStatus, MessagePage};
use crate::service::Pipeline;

#[derive(Clone)]
struct AppState {
    pipeline: Arc<Pipeline>,
}

/// Start the HTTP server on the configured bind address. Runs until the
/// process is terminated.
pub async fn run_server(config: &Config, pipeline: Pipeline) -> anyhow::Result<()> {
    let state = AppState {
        pipeline: Arc::new(pipeline),
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/documents", post(handle_register).get(handle_list_documents))
        .route("/documents/{id}/ingest", post(handle_ingest))
        .route("/documents/{id}/status", get(handle_status))
        .route("/documents/{id}/messages", get(handle_messages))
        .route("/documents/{id}/ask", post(handle_ask))
        .route("/documents/{id}", delete(handle_delete))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(state);

    tracing::info!(bind = %config.server.bind, "server listening");
    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<PipelineError> for AppError {
    fn from(e: PipelineError) -> Self {
        let (status, code) = match &e {
            PipelineError::InvalidInput(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            PipelineError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            PipelineError::NotReady(_) => (StatusCode::CONFLICT, "not_ready"),
            PipelineError::ContextTooLarge(_) => {
                (StatusCode::PAYLOAD_TOO_LARGE, "context_too_large")
            }
            PipelineError::UpstreamUnavailable(_) | PipelineError::RateLimited(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, "upstream_unavailable")
            }
            PipelineError::Fatal(_) | PipelineError::Store(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal")
            }
        };
        AppError {
            status,
            code,
            message: e.to_string(),
        }
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ POST /documents ============

#[derive(Deserialize)]
struct RegisterRequest {
    owner_id: String,
    storage_key: String,
    #[serde(default)]
    title: Option<String>,
}

/// Register an upload and kick off ingestion. Returns immediately with the
/// `PENDING` document; poll the status endpoint for progress.
async fn handle_register(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<Document>), AppError> {
    let doc = state
        .pipeline
        .register_document(&req.owner_id, &req.storage_key, req.title.as_deref())
        .await?;
    state.pipeline.start_ingestion(&doc.id).await?;
    Ok((StatusCode::CREATED, Json(doc)))
}

// ============ GET /documents ============

#[derive(Deserialize)]
struct DocumentsQuery {
    owner_id: String,
}

async fn handle_list_documents(
    State(state): State<AppState>,
    Query(query): Query<DocumentsQuery>,
) -> Result<Json<Vec<Document>>, AppError> {
    let docs = state.pipeline.list_documents(&query.owner_id).await?;
    Ok(Json(docs))
}

// ============ POST /documents/{id}/ingest ============

#[derive(Deserialize)]
struct IngestRequest {
    #[serde(default)]
    force: bool,
}

async fn handle_ingest(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Option<Json<IngestRequest>>,
) -> Result<StatusCode, AppError> {
    let force = body.map(|Json(b)| b.force).unwrap_or(false);
    state.pipeline.reingest(&id, force).await?;
    Ok(StatusCode::ACCEPTED)
}

// ============ GET /documents/{id}/status ============

#[derive(Serialize)]
struct StatusResponse {
    status: DocumentStatus,
    error: Option<String>,
}

async fn handle_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<StatusResponse>, AppError> {
    let doc = state.pipeline.get_document(&id).await?;
    Ok(Json(StatusResponse {
        status: doc.status,
        error: doc.error,
    }))
}

// ============ GET /documents/{id}/messages ============

#[derive(Deserialize)]
struct MessagesQuery {
    cursor: Option<String>,
    limit: Option<i64>,
}

async fn handle_messages(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<MessagesQuery>,
) -> Result<Json<MessagePage>, AppError> {
    let page = state
        .pipeline
        .list_messages(&id, query.cursor.as_deref(), query.limit)
        .await?;
    Ok(Json(page))
}

// ============ POST /documents/{id}/ask ============

#[derive(Deserialize)]
struct AskRequest {
    question: String,
}

/// Stream the answer as a chunked plain-text body. Errors before the first
/// token map to the JSON error envelope; a mid-stream failure terminates
/// the body (tokens already sent stand).
async fn handle_ask(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<AskRequest>,
) -> Result<Response, AppError> {
    let stream = state.pipeline.ask_question(&id, &req.question).await?;

    let response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(Body::from_stream(stream))
        .map_err(|e| AppError::from(PipelineError::Fatal(e.to_string())))?;
    Ok(response)
}

// ============ DELETE /documents/{id} ============

async fn handle_delete(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    state.pipeline.delete_document(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}
