//! Storage abstraction for Snapmind.
//!
//! The [`Store`] trait is the persistence seam for both indices: a vector
//! index (upsert by block id, nearest-neighbor with a document filter) and a
//! lexical index (upsert by block id, rank-scored match with the same
//! filter), plus the document records that own them.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::Result;
use crate::fusion::Candidate;
use crate::models::{BlockId, Document, IndexStatus, Passage};

/// Lightweight document listing entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DocumentSummary {
    pub id: String,
    pub source_url: Option<String>,
    pub status: IndexStatus,
    pub ingested_at: DateTime<Utc>,
    /// Passages present in both indices.
    pub passage_count: usize,
}

/// The text each index holds for one block id. Used to check that both
/// entries refer to byte-identical text.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexedText {
    pub vector_text: Option<String>,
    pub lexical_text: Option<String>,
}

impl IndexedText {
    /// True when both entries exist and hold the same bytes.
    pub fn is_consistent(&self) -> bool {
        matches!((&self.vector_text, &self.lexical_text), (Some(v), Some(l)) if v == l)
    }
}

/// Abstract storage backend.
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`upsert_document`](Store::upsert_document) | Insert or overwrite a document record |
/// | [`upsert_vector`](Store::upsert_vector) / [`upsert_lexical`](Store::upsert_lexical) | Write one passage into one index |
/// | [`remove_passage`](Store::remove_passage) | Roll a passage out of both indices |
/// | [`clear_passages`](Store::clear_passages) | Drop every passage of a document before re-indexing |
/// | [`vector_search`](Store::vector_search) | Cosine nearest-neighbor search |
/// | [`lexical_search`](Store::lexical_search) | Rank-scored term match |
/// | [`count_indexed_passages`](Store::count_indexed_passages) | Backs the "no index, no answer" gate |
#[async_trait]
pub trait Store: Send + Sync {
    /// Insert or overwrite a document, keyed by its id.
    async fn upsert_document(&self, doc: &Document) -> Result<()>;

    async fn get_document(&self, id: &str) -> Result<Option<Document>>;

    /// Update only the indexing status of a document.
    async fn set_document_status(&self, id: &str, status: IndexStatus) -> Result<()>;

    async fn list_documents(&self) -> Result<Vec<DocumentSummary>>;

    /// Delete a document and every passage it owns from both indices.
    ///
    /// The block high-water mark survives so that [`next_block`](Store::next_block)
    /// never hands out a retired id. Returns `false` if no such document.
    async fn delete_document(&self, id: &str) -> Result<bool>;

    /// First block number that has never been issued for `document_id`.
    async fn next_block(&self, document_id: &str) -> Result<u64>;

    /// Write a passage's embedding into the vector index.
    async fn upsert_vector(&self, passage: &Passage, vector: &[f32], model: &str) -> Result<()>;

    /// Write a passage's text into the lexical index.
    async fn upsert_lexical(&self, passage: &Passage) -> Result<()>;

    /// Remove one passage from both indices. Missing entries are not an error.
    async fn remove_passage(&self, block_id: &BlockId) -> Result<()>;

    /// Remove every passage of a document from both indices.
    async fn clear_passages(&self, document_id: &str) -> Result<()>;

    /// Passages of a document present in both indices, by ordinal.
    async fn list_passages(&self, document_id: &str) -> Result<Vec<Passage>>;

    async fn indexed_text(&self, block_id: &BlockId) -> Result<IndexedText>;

    /// Nearest-neighbor search returning up to `limit` candidates whose
    /// cosine similarity is at least `min_similarity`, best first.
    async fn vector_search(
        &self,
        query_vec: &[f32],
        document_id: Option<&str>,
        limit: usize,
        min_similarity: f64,
    ) -> Result<Vec<Candidate>>;

    /// Rank-scored match over normalized query terms, best first. Scores are
    /// saturated into `[0, 1)`. An empty term list yields no candidates.
    async fn lexical_search(
        &self,
        terms: &[String],
        document_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Candidate>>;

    /// Passages present in both indices, optionally scoped to one document.
    async fn count_indexed_passages(&self, document_id: Option<&str>) -> Result<usize>;
}
