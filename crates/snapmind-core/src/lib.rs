//! # Snapmind Core
//!
//! Runtime-agnostic logic for the Snapmind hybrid retrieval engine: data
//! models, chunking, lexical scoring, rank fusion, citation assembly, and the
//! store and embedder abstractions.
//!
//! This crate contains no tokio, sqlx, network, or filesystem dependencies.
//! Anything that needs a runtime (timeouts, worker pools, HTTP providers,
//! SQLite) lives in the `snapmind` application crate.
//!
//! ## Pipeline
//!
//! ```text
//! text ──▶ chunk ──▶ Passage ──▶ (Store: vector + lexical)
//!                                        │
//! query ─────────────────────────────────┤
//!                                        ▼
//!                          fusion::fuse ──▶ FusedResult
//!                                        │
//!                   citation::assemble_context ──▶ generator
//!                                        │
//!                   citation::extract_citations ◀── answer
//! ```

pub mod address;
pub mod chunk;
pub mod citation;
pub mod embedding;
pub mod error;
pub mod fusion;
pub mod lexical;
pub mod models;
pub mod store;

pub use error::{Error, Result};
