//! # Snapmind CLI (`snap`)
//!
//! ## Usage
//!
//! ```bash
//! snap --config ./config/snap.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `snap init` | Create the SQLite database and run schema migrations |
//! | `snap submit [TEXT] [--file F] [--url U]` | Chunk and index a document |
//! | `snap search "<query>"` | Hybrid search over indexed passages |
//! | `snap ask "<question>"` | Grounded answer with citations |
//! | `snap docs` | List documents |
//! | `snap get <id>` | Show a document and its passages |
//! | `snap delete <id>` | Delete a document from both indices |
//! | `snap serve` | Start the HTTP server |
//!
//! Logs go to stderr and are filtered with `RUST_LOG` (default
//! `snapmind=info`).

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use snapmind::{ask, config, get, ingest, migrate, search, server};

/// Snapmind: hybrid retrieval with citation-safe answers.
#[derive(Parser)]
#[command(
    name = "snap",
    about = "Snapmind: hybrid retrieval engine for grounded, citation-safe question answering",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/snap.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Idempotent.
    Init,

    /// Submit a document for chunking and dual indexing.
    ///
    /// Re-submitting the same URL replaces the previous version; identical
    /// content is skipped.
    Submit {
        /// Document text. Omit to read from --file.
        text: Option<String>,

        /// Read the document text from this file.
        #[arg(long, short)]
        file: Option<PathBuf>,

        /// Source address of the document.
        #[arg(long)]
        url: Option<String>,
    },

    /// Search indexed passages.
    Search {
        query: String,

        /// hybrid, vector, or keyword. Defaults to `[retrieval] mode`.
        #[arg(long)]
        mode: Option<String>,

        /// Maximum number of results. Defaults to `[retrieval] top_k`.
        #[arg(long)]
        top_k: Option<usize>,

        /// Restrict to one document id.
        #[arg(long)]
        doc: Option<String>,
    },

    /// Ask a question answered only from indexed passages.
    Ask {
        question: String,

        /// Restrict to one document id.
        #[arg(long)]
        doc: Option<String>,

        /// Print the answer as it is generated.
        #[arg(long)]
        stream: bool,
    },

    /// List documents.
    Docs,

    /// Show a document and its indexed passages.
    Get { id: String },

    /// Delete a document and its index entries.
    Delete { id: String },

    /// Start the HTTP server on `[server] bind`.
    Serve,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("snapmind=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Submit { text, file, url } => {
            ingest::run_submit(&cfg, text, file.as_deref(), url.as_deref()).await?;
        }
        Commands::Search {
            query,
            mode,
            top_k,
            doc,
        } => {
            search::run_search(&cfg, &query, mode.as_deref(), top_k, doc).await?;
        }
        Commands::Ask {
            question,
            doc,
            stream,
        } => {
            ask::run_ask(&cfg, &question, doc, stream).await?;
        }
        Commands::Docs => {
            get::run_docs(&cfg).await?;
        }
        Commands::Get { id } => {
            get::run_get(&cfg, &id).await?;
        }
        Commands::Delete { id } => {
            get::run_delete(&cfg, &id).await?;
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
    }

    Ok(())
}
