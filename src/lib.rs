//! # Snapmind
//!
//! A hybrid retrieval engine for grounded, citation-safe question answering.
//!
//! Submitted text is split into passages, and every passage is written to a
//! vector index and a lexical index under one stable block id. A question
//! runs both lookups concurrently, fuses the two rankings, and hands the
//! generator a context block in which each passage carries its `[block-id]`
//! marker. Markers in the answer are then resolved back to the passages they
//! name, and unknown ones are reported as unverified.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────┐   ┌─────────────┐   ┌──────────────────┐
//! │  submit   │──▶│  Chunker    │──▶│  Dual Indexer    │
//! │ text+url  │   │ (core)      │   │ vector + FTS5    │
//! └───────────┘   └─────────────┘   └────────┬─────────┘
//!                                            │ SQLite
//! ┌───────────┐   ┌─────────────┐   ┌────────▼─────────┐
//! │   ask     │──▶│ Orchestrator│──▶│ Retrieval Engine │
//! │ CLI/HTTP  │   │ gate+stream │   │ fuse (core)      │
//! └───────────┘   └──────┬──────┘   └──────────────────┘
//!                        ▼
//!                 citations (core) ⇄ generator
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! snap init
//! snap submit --file article.md --url https://example.com/article
//! snap search "ownership rules" --mode hybrid
//! snap ask "What does the borrow checker enforce?" --stream
//! snap serve
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`sqlite_store`] | SQLite implementation of the core `Store` |
//! | [`embedding`] | Embedding providers |
//! | [`generation`] | Prompt construction and chat-completion providers |
//! | [`retry`] | Bounded exponential backoff |
//! | [`cancel`] | Cooperative cancellation |
//! | [`indexer`] | Dual (vector + lexical) indexing with rollback |
//! | [`ingest`] | Document submission |
//! | [`retrieval`] | Concurrent lookups and fusion |
//! | [`cache`] | Semantic search cache |
//! | [`orchestrator`] | Question-answering turns |
//! | [`server`] | HTTP API |
//!
//! The pure, runtime-agnostic pieces (models, chunking, lexical scoring,
//! fusion, citations, the `Store` trait) live in the `snapmind-core` crate.

pub mod ask;
pub mod cache;
pub mod cancel;
pub mod config;
pub mod db;
pub mod embedding;
pub mod generation;
pub mod get;
pub mod indexer;
pub mod ingest;
pub mod migrate;
pub mod orchestrator;
pub mod retrieval;
pub mod retry;
pub mod search;
pub mod server;
pub mod sqlite_store;
