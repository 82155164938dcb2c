//! paperchat: retrieval-augmented chat over uploaded documents.
//!
//! The pipeline ingests a document (PDF, Markdown, or plain text), splits
//! it into overlapping chunks, embeds each chunk, and stores the vectors
//! in SQLite. At question time it embeds the question, retrieves the
//! closest chunks for that document, assembles a budgeted prompt with
//! recent chat history, and streams the model's answer back token by
//! token while persisting the conversation.
//!
//! ```text
//!   upload ──► storage ──► extract ──► chunk ──► embed ──► index
//!                                                            │
//!   question ──► embed ──► retrieve ◄────────────────────────┘
//!                             │
//!                             ▼
//!                     prompt + history ──► completion ──► token stream
//! ```
//!
//! | Module | Responsibility |
//! |--------|----------------|
//! | [`chunk`] | Token-window splitter with overlap and boundary snapping |
//! | [`config`] | TOML configuration with validation |
//! | [`db`] / [`migrate`] | SQLite pool and schema |
//! | [`embedding`] | Embedding providers and vector utilities |
//! | [`extract`] | Text extraction per content type |
//! | [`index`] | Per-document cosine-similarity vector search |
//! | [`ingest`] | Ingestion orchestration and the document state machine |
//! | [`models`] | Shared row types |
//! | [`retrieve`] | Question-to-chunks retrieval |
//! | [`server`] | HTTP API |
//! | [`service`] | Pipeline facade wiring the components together |
//! | [`storage`] | Uploaded-file access |
//! | [`store`] | Document, chunk, and message persistence |
//! | [`synthesize`] | Prompt assembly and streaming answer synthesis |

pub mod chunk;
pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod extract;
pub mod index;
pub mod ingest;
pub mod migrate;
pub mod models;
pub mod retrieve;
pub mod server;
pub mod service;
pub mod storage;
pub mod store;
pub mod synthesize;
