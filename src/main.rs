//! # paperchat CLI
//!
//! The `paperchat` binary drives the document-chat pipeline: database
//! initialization, document registration and ingestion, status polling,
//! asking questions, browsing chat history, and running the HTTP server.
//!
//! ## Usage
//!
//! ```bash
//! paperchat --config ./config/paperchat.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `paperchat init` | Create the SQLite database and run schema migrations |
//! | `paperchat register <owner> <key>` | Register an uploaded file for ingestion |
//! | `paperchat ingest <id>` | Run ingestion for a document |
//! | `paperchat documents <owner>` | List an owner's documents |
//! | `paperchat status <id>` | Show a document's ingestion status |
//! | `paperchat ask <id> "<question>"` | Ask a question; streams the answer |
//! | `paperchat messages <id>` | Page through a document's chat history |
//! | `paperchat delete <id>` | Delete a document and everything it owns |
//! | `paperchat serve` | Start the HTTP API server |
//!
//! ## Examples
//!
//! ```bash
//! # Initialize the database
//! paperchat init --config ./config/paperchat.toml
//!
//! # Register and ingest an uploaded PDF
//! paperchat register user-1 papers/attention.pdf --title "Attention Is All You Need"
//! paperchat ingest 7d9f...
//!
//! # Ask about it
//! paperchat ask 7d9f... "What problem does multi-head attention solve?"
//!
//! # Serve the HTTP API
//! paperchat serve --config ./config/paperchat.toml
//! ```

use clap::{Parser, Subcommand};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use futures_util::StreamExt;

use paperchat::config::{self, Config};
use paperchat::db;
use paperchat::embedding::create_embedder;
use paperchat::ingest::IngestOutcome;
use paperchat::migrate;
use paperchat::service::Pipeline;
use paperchat::storage::FsStorage;
use paperchat::synthesize::create_completer;

/// paperchat CLI — retrieval-augmented chat over uploaded documents.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/paperchat.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "paperchat",
    about = "paperchat — retrieval-augmented chat over uploaded documents",
    version,
    long_about = "paperchat ingests uploaded documents (PDF, Markdown, plain text), splits them \
    into overlapping chunks, embeds and indexes the chunks in SQLite, and answers questions \
    about a document with a streaming, retrieval-grounded model response."
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/paperchat.toml`. Database, storage, chunking,
    /// provider, and server settings are read from this file.
    #[arg(long, global = true, default_value = "./config/paperchat.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and all required tables (documents,
    /// chunks, chunk_vectors, messages). Idempotent — running it multiple
    /// times is safe.
    Init,

    /// Register an uploaded file for ingestion.
    ///
    /// Creates a `PENDING` document row pointing at a file under the
    /// configured storage root and prints its id. Run `ingest` next.
    Register {
        /// Owner identifier the document belongs to.
        owner: String,

        /// Storage key (path under the storage root, e.g. `papers/a.pdf`).
        key: String,

        /// Human-readable title.
        #[arg(long)]
        title: Option<String>,
    },

    /// Run ingestion for a document.
    ///
    /// Fetches the file, extracts text, chunks, embeds, and indexes it,
    /// then marks the document `READY`. Requires an embedding provider.
    Ingest {
        /// Document id.
        id: String,

        /// Reset a finished or stuck document to `PENDING` first and
        /// re-ingest from scratch.
        #[arg(long)]
        force: bool,
    },

    /// Show a document's ingestion status.
    Status {
        /// Document id.
        id: String,
    },

    /// List an owner's documents, newest first.
    Documents {
        /// Owner identifier.
        owner: String,
    },

    /// Ask a question about a `READY` document.
    ///
    /// Streams the answer to stdout as it is generated. Both the question
    /// and the completed answer are persisted to the chat history.
    Ask {
        /// Document id.
        id: String,

        /// The question to ask.
        question: String,
    },

    /// Page through a document's chat history, newest first.
    Messages {
        /// Document id.
        id: String,

        /// Resume from a cursor returned by a previous page.
        #[arg(long)]
        cursor: Option<String>,

        /// Messages per page (1-100).
        #[arg(long)]
        limit: Option<i64>,
    },

    /// Delete a document and everything it owns (chunks, vectors, messages).
    Delete {
        /// Document id.
        id: String,
    },

    /// Start the HTTP API server.
    ///
    /// Binds to the address configured in `[server].bind` and serves the
    /// document, ask, and messages endpoints.
    Serve,
}

/// Connect, migrate, and wire the full pipeline from config.
async fn build_pipeline(cfg: &Config) -> anyhow::Result<Pipeline> {
    let pool = db::connect(&cfg.db.path).await?;
    migrate::run_migrations(&pool).await?;

    let storage = Arc::new(FsStorage::new(cfg.storage.root.clone()));
    let embedder = create_embedder(&cfg.embedding)?;
    let completer = create_completer(&cfg.completion)?;

    Ok(Pipeline::new(pool, storage, embedder, completer, cfg))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            let pool = db::connect(&cfg.db.path).await?;
            migrate::run_migrations(&pool).await?;
            println!("Database initialized successfully.");
        }
        Commands::Register { owner, key, title } => {
            let pipeline = build_pipeline(&cfg).await?;
            let doc = pipeline
                .register_document(&owner, &key, title.as_deref())
                .await?;
            println!("{}", doc.id);
        }
        Commands::Ingest { id, force } => {
            let pipeline = build_pipeline(&cfg).await?;
            if force {
                pipeline.store().reset_to_pending(&id).await?;
            }
            match pipeline.run_ingestion(&id).await? {
                IngestOutcome::Ready => {
                    let count = pipeline.store().chunk_count(&id).await?;
                    println!("Document {id} ready ({count} chunks).");
                }
                IngestOutcome::NotClaimed => {
                    println!(
                        "Document {id} is not PENDING (already running or finished). \
                         Use --force to re-ingest."
                    );
                }
                IngestOutcome::DeletedMidRun => {
                    println!("Document {id} was deleted while ingesting; nothing kept.");
                }
            }
        }
        Commands::Status { id } => {
            let pipeline = build_pipeline(&cfg).await?;
            let doc = pipeline.get_document(&id).await?;
            match doc.error {
                Some(err) => println!("{}: {}", doc.status.as_str(), err),
                None => println!("{}", doc.status.as_str()),
            }
        }
        Commands::Documents { owner } => {
            let pipeline = build_pipeline(&cfg).await?;
            for doc in pipeline.list_documents(&owner).await? {
                let title = doc.title.as_deref().unwrap_or("-");
                println!("{}  {:<10}  {}", doc.id, doc.status.as_str(), title);
            }
        }
        Commands::Ask { id, question } => {
            let pipeline = build_pipeline(&cfg).await?;
            let mut stream = pipeline.ask_question(&id, &question).await?;

            let mut stdout = std::io::stdout();
            while let Some(token) = stream.next().await {
                let token = token?;
                stdout.write_all(token.as_bytes())?;
                stdout.flush()?;
            }
            println!();
        }
        Commands::Messages { id, cursor, limit } => {
            let pipeline = build_pipeline(&cfg).await?;
            let page = pipeline
                .list_messages(&id, cursor.as_deref(), limit)
                .await?;
            for msg in &page.messages {
                let who = if msg.is_user { "user" } else { "assistant" };
                println!("[{who}] {}", msg.text);
            }
            if let Some(cursor) = page.next_cursor {
                println!("-- next page: --cursor {cursor}");
            }
        }
        Commands::Delete { id } => {
            let pipeline = build_pipeline(&cfg).await?;
            pipeline.delete_document(&id).await?;
            println!("Deleted {id}.");
        }
        Commands::Serve => {
            let pipeline = build_pipeline(&cfg).await?;
            paperchat::server::run_server(&cfg, pipeline).await?;
        }
    }

    Ok(())
}
