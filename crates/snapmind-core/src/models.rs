//! Core data models for Snapmind.
//!
//! These types represent the documents, passages, and fused results that flow
//! through indexing and retrieval. Invariants are enforced by the
//! constructors: a [`Passage`] cannot be built with a block id that names a
//! different document, and a [`BlockId`] always has the
//! `<doc-id>-block-<n>` shape.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::address::normalize_address;
use crate::error::{Error, Result};

const BLOCK_SEPARATOR: &str = "-block-";

/// Indexing lifecycle of a [`Document`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexStatus {
    Pending,
    Indexed,
    Failed,
}

impl IndexStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IndexStatus::Pending => "pending",
            IndexStatus::Indexed => "indexed",
            IndexStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for IndexStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IndexStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(IndexStatus::Pending),
            "indexed" => Ok(IndexStatus::Indexed),
            "failed" => Ok(IndexStatus::Failed),
            other => Err(Error::Storage(format!("unknown index status: {}", other))),
        }
    }
}

/// One ingested source.
///
/// The `id` is derived from the normalized source address, so re-submitting
/// the same page overwrites the existing document instead of creating a new
/// one. `next_block` is the block-number high-water mark: block ids handed
/// out for this document are always `< next_block`, which is how retired ids
/// are kept from being reissued after re-ingestion or deletion.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Document {
    pub id: String,
    pub source_url: Option<String>,
    pub body: String,
    pub content_hash: String,
    pub ingested_at: DateTime<Utc>,
    pub status: IndexStatus,
    pub next_block: u64,
}

impl Document {
    /// Build a pending document from acquired text and an optional address.
    ///
    /// The address is normalized before the id is derived.
    pub fn new(source_url: Option<&str>, body: &str, ingested_at: DateTime<Utc>) -> Self {
        let source_url = source_url
            .map(normalize_address)
            .filter(|addr| !addr.is_empty());
        Self {
            id: document_id_for(source_url.as_deref(), body),
            source_url,
            body: body.to_string(),
            content_hash: content_hash(body),
            ingested_at,
            status: IndexStatus::Pending,
            next_block: 0,
        }
    }
}

/// Derive a stable document id.
///
/// With an address: `doc-` + the first 16 hex chars of SHA-256 over the
/// normalized address. Without one, the content itself is hashed.
pub fn document_id_for(normalized_address: Option<&str>, body: &str) -> String {
    let key = match normalized_address {
        Some(addr) => format!("url:{}", addr),
        None => format!("text:{}", body),
    };
    let digest = content_hash(&key);
    format!("doc-{}", &digest[..16])
}

/// SHA-256 hex digest of `text`.
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Stable key naming one passage within one document: `<doc-id>-block-<n>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BlockId(String);

impl BlockId {
    pub fn new(document_id: &str, number: u64) -> Self {
        BlockId(format!("{}{}{}", document_id, BLOCK_SEPARATOR, number))
    }

    /// Parse a block id, validating its `<doc-id>-block-<n>` shape.
    pub fn parse(raw: &str) -> Result<Self> {
        let (doc, number) = raw
            .rsplit_once(BLOCK_SEPARATOR)
            .ok_or_else(|| Error::InvalidBlockId(raw.to_string()))?;
        if doc.is_empty() || number.is_empty() || !number.bytes().all(|b| b.is_ascii_digit()) {
            return Err(Error::InvalidBlockId(raw.to_string()));
        }
        number
            .parse::<u64>()
            .map_err(|_| Error::InvalidBlockId(raw.to_string()))?;
        Ok(BlockId(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The document this block belongs to.
    pub fn document_id(&self) -> &str {
        self.0
            .rsplit_once(BLOCK_SEPARATOR)
            .map(|(doc, _)| doc)
            .unwrap_or_default()
    }

    /// The block number (`n` in `<doc-id>-block-<n>`).
    pub fn number(&self) -> u64 {
        self.0
            .rsplit_once(BLOCK_SEPARATOR)
            .and_then(|(_, n)| n.parse().ok())
            .unwrap_or_default()
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for BlockId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        BlockId::parse(&value)
    }
}

impl From<BlockId> for String {
    fn from(id: BlockId) -> Self {
        id.0
    }
}

/// A contiguous, semantically bounded slice of a document's text.
///
/// Immutable once built. `hash` is the SHA-256 of `text` and is what the
/// vector and lexical index entries are checked against for drift.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Passage {
    block_id: BlockId,
    document_id: String,
    ordinal: u32,
    text: String,
    hash: String,
    heading: Option<String>,
}

impl Passage {
    /// Build a passage, enforcing that the text is non-empty and that the
    /// block id belongs to `document_id`.
    pub fn new(
        block_id: BlockId,
        document_id: &str,
        ordinal: u32,
        text: impl Into<String>,
        heading: Option<String>,
    ) -> Result<Self> {
        let text = text.into();
        if text.trim().is_empty() {
            return Err(Error::InvalidPassage(format!("{} has empty text", block_id)));
        }
        if block_id.document_id() != document_id {
            return Err(Error::InvalidPassage(format!(
                "{} does not belong to document {}",
                block_id, document_id
            )));
        }
        let hash = content_hash(&text);
        Ok(Self {
            block_id,
            document_id: document_id.to_string(),
            ordinal,
            text,
            hash,
            heading,
        })
    }

    pub fn block_id(&self) -> &BlockId {
        &self.block_id
    }

    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    /// Position within the current content of the document, starting at 0.
    pub fn ordinal(&self) -> u32 {
        self.ordinal
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }

    pub fn heading(&self) -> Option<&str> {
        self.heading.as_deref()
    }
}

/// One entry of a fused ranking. Created per query, never persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FusedResult {
    pub block_id: BlockId,
    pub document_id: String,
    pub text: String,
    pub heading: Option<String>,
    /// Cosine similarity, or `0.0` when absent from the vector candidates.
    pub vector_score: f64,
    /// Raw lexical rank score, or `0.0` when absent from the lexical candidates.
    pub lexical_score: f64,
    pub combined_score: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_id_roundtrip() {
        let id = BlockId::new("doc-abc", 7);
        assert_eq!(id.as_str(), "doc-abc-block-7");
        assert_eq!(id.document_id(), "doc-abc");
        assert_eq!(id.number(), 7);
        assert_eq!(BlockId::parse("doc-abc-block-7").unwrap(), id);
    }

    #[test]
    fn test_block_id_rejects_malformed() {
        assert!(BlockId::parse("doc-abc").is_err());
        assert!(BlockId::parse("-block-3").is_err());
        assert!(BlockId::parse("doc-block-x").is_err());
        assert!(BlockId::parse("doc-block-").is_err());
    }

    #[test]
    fn test_block_id_with_hyphenated_document() {
        let id = BlockId::parse("doc-1-block-2-block-12").unwrap();
        assert_eq!(id.document_id(), "doc-1-block-2");
        assert_eq!(id.number(), 12);
    }

    #[test]
    fn test_passage_rejects_foreign_block() {
        let err = Passage::new(BlockId::new("doc-a", 0), "doc-b", 0, "text", None);
        assert!(matches!(err, Err(Error::InvalidPassage(_))));
    }

    #[test]
    fn test_passage_rejects_empty_text() {
        let err = Passage::new(BlockId::new("doc-a", 0), "doc-a", 0, "  \n ", None);
        assert!(err.is_err());
    }

    #[test]
    fn test_passage_hash_matches_text() {
        let p = Passage::new(BlockId::new("doc-a", 0), "doc-a", 0, "hello", None).unwrap();
        assert_eq!(p.hash(), content_hash("hello"));
    }

    #[test]
    fn test_document_id_from_normalized_address() {
        let now = Utc::now();
        let a = Document::new(Some("https://Example.com/page/"), "one", now);
        let b = Document::new(Some("https://example.com/page?x=1"), "two", now);
        let c = Document::new(Some("https://example.com:443/docs/../page"), "three", now);
        assert_eq!(a.id, b.id);
        assert_eq!(a.id, c.id);
        assert_eq!(a.source_url.as_deref(), Some("https://example.com/page"));
        assert!(a.id.starts_with("doc-"));
        assert_eq!(a.id.len(), 4 + 16);
    }

    #[test]
    fn test_document_id_without_address_uses_content() {
        let now = Utc::now();
        let a = Document::new(None, "same text", now);
        let b = Document::new(None, "same text", now);
        let c = Document::new(None, "other text", now);
        assert_eq!(a.id, b.id);
        assert_ne!(a.id, c.id);
    }

    #[test]
    fn test_status_parse() {
        assert_eq!("indexed".parse::<IndexStatus>().unwrap(), IndexStatus::Indexed);
        assert!("bogus".parse::<IndexStatus>().is_err());
    }
}
