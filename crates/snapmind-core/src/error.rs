//! Error taxonomy shared by every stage of the pipeline.
//!
//! Failures are scoped to the smallest affected unit: an embedding or write
//! failure belongs to one passage, a timeout to one query turn. Degraded
//! search and unverifiable citations are reported as flags on successful
//! outcomes, not through this type.

use thiserror::Error;

/// Convenience alias used throughout the core crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    /// The content acquisition collaborator could not supply usable text.
    #[error("acquisition failed: {0}")]
    Acquisition(String),

    /// The embedding service failed (after any retries the caller applied).
    #[error("embedding failed: {0}")]
    Embedding(String),

    /// A vector or lexical index write failed.
    #[error("index write failed for {block_id}: {message}")]
    IndexWrite { block_id: String, message: String },

    /// The requested scope has no indexed passages.
    #[error("nothing indexed for scope {scope}")]
    NotIndexed { scope: String },

    #[error("invalid fusion weights: {0}")]
    InvalidWeights(String),

    #[error("invalid block id: {0}")]
    InvalidBlockId(String),

    #[error("invalid passage: {0}")]
    InvalidPassage(String),

    /// Storage-layer failure (corruption, connection loss, schema mismatch).
    #[error("storage error: {0}")]
    Storage(String),

    #[error("generation failed: {0}")]
    Generation(String),

    /// A provider is switched off in configuration. Never retried.
    #[error("{0} provider is disabled")]
    Disabled(&'static str),

    #[error("{operation} timed out after {millis} ms")]
    Timeout { operation: &'static str, millis: u64 },

    #[error("cancelled")]
    Cancelled,
}

impl Error {
    /// Wrap any displayable storage failure.
    pub fn storage(err: impl std::fmt::Display) -> Self {
        Error::Storage(err.to_string())
    }

    /// Wrap any displayable embedding failure.
    pub fn embedding(err: impl std::fmt::Display) -> Self {
        Error::Embedding(err.to_string())
    }

    /// True for failures that are worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Embedding(_) | Error::Timeout { .. })
    }
}
