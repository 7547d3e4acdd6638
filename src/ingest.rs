//! Document submission: normalize, chunk, and dual-index one document.
//!
//! Re-submitting the same address replaces the document in place. When the
//! content hash is unchanged and the previous run indexed cleanly, the
//! submission is a no-op. Otherwise every prior passage is removed and the
//! new text is chunked starting at the document's block high-water mark, so
//! block ids handed out earlier are never issued again.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use serde::Serialize;
use tracing::info;

use snapmind_core::chunk::Chunker;
use snapmind_core::embedding::Embedder;
use snapmind_core::error::{Error, Result};
use snapmind_core::models::{Document, IndexStatus};
use snapmind_core::store::Store;

use crate::cache::SemanticCache;
use crate::cancel::CancellationToken;
use crate::config::Config;
use crate::db;
use crate::embedding::create_embedder;
use crate::indexer::{DualIndexer, IndexingResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestOutcome {
    /// Every passage is in both indices.
    Indexed,
    /// Identical content was already indexed; nothing was written.
    Unchanged,
    /// The text was empty or too short to yield a passage.
    NothingToIndex,
    /// At least one passage could not be indexed.
    Failed,
    /// Most passages could not be indexed, so none were kept.
    Abandoned,
}

impl IngestOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            IngestOutcome::Indexed => "indexed",
            IngestOutcome::Unchanged => "unchanged",
            IngestOutcome::NothingToIndex => "nothing_to_index",
            IngestOutcome::Failed => "failed",
            IngestOutcome::Abandoned => "abandoned",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestReport {
    pub document_id: String,
    pub source_url: Option<String>,
    pub outcome: IngestOutcome,
    /// Passages currently indexed for the document.
    pub passages: usize,
    pub indexing: IndexingResult,
}

pub struct Ingestor {
    store: Arc<dyn Store>,
    indexer: DualIndexer,
    chunker: Chunker,
    cache: Option<Arc<SemanticCache>>,
}

impl Ingestor {
    pub fn new(store: Arc<dyn Store>, embedder: Arc<dyn Embedder>, config: &Config) -> Self {
        let indexer = DualIndexer::new(store.clone(), embedder, config);
        Self::from_parts(store, indexer, Chunker::new(config.chunk_config()))
    }

    pub fn from_parts(store: Arc<dyn Store>, indexer: DualIndexer, chunker: Chunker) -> Self {
        Self {
            store,
            indexer,
            chunker,
            cache: None,
        }
    }

    /// Invalidate `cache` whenever a submission changes the indexed corpus.
    pub fn with_cache(mut self, cache: Arc<SemanticCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Submit acquired text with its optional source address.
    pub async fn submit(
        &self,
        text: &str,
        source_url: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<IngestReport> {
        let body = normalize_text(text);
        if body.contains('\0') {
            return Err(Error::Acquisition(
                "submitted text contains NUL bytes".into(),
            ));
        }

        let mut doc = Document::new(source_url, &body, Utc::now());

        if let Some(existing) = self.store.get_document(&doc.id).await? {
            if existing.content_hash == doc.content_hash && existing.status == IndexStatus::Indexed
            {
                let passages = self.store.count_indexed_passages(Some(&doc.id)).await?;
                info!(document_id = %doc.id, passages, "content unchanged, skipping");
                return Ok(IngestReport {
                    document_id: existing.id,
                    source_url: existing.source_url,
                    outcome: IngestOutcome::Unchanged,
                    passages,
                    indexing: IndexingResult::default(),
                });
            }
        }

        let first_block = self.store.next_block(&doc.id).await?;
        self.invalidate_cache();
        self.store.clear_passages(&doc.id).await?;
        doc.next_block = first_block;
        self.store.upsert_document(&doc).await?;

        let (indexing, next_block) = {
            let mut passages = self.chunker.chunk(&doc.id, &doc.body, first_block);
            let indexing = self.indexer.index(&doc.id, passages.by_ref(), cancel).await?;
            (indexing, passages.next_block())
        };

        doc.next_block = next_block;
        doc.status = indexing.status();
        self.store.upsert_document(&doc).await?;
        self.invalidate_cache();

        let outcome = if indexing.total() == 0 {
            IngestOutcome::NothingToIndex
        } else if indexing.failed.is_empty() {
            IngestOutcome::Indexed
        } else if indexing.majority_failed() {
            IngestOutcome::Abandoned
        } else {
            IngestOutcome::Failed
        };

        info!(
            document_id = %doc.id,
            outcome = outcome.as_str(),
            first_block,
            next_block,
            "document submitted"
        );

        Ok(IngestReport {
            document_id: doc.id,
            source_url: doc.source_url,
            outcome,
            passages: indexing.succeeded.len(),
            indexing,
        })
    }

    /// Runs before and after indexing. A search during indexing may cache a
    /// partial view.
    fn invalidate_cache(&self) {
        if let Some(cache) = &self.cache {
            cache.invalidate();
        }
    }
}

/// `snap submit`: index text given inline or read from a file.
pub async fn run_submit(
    config: &Config,
    text: Option<String>,
    file: Option<&Path>,
    url: Option<&str>,
) -> anyhow::Result<()> {
    let text = match (text, file) {
        (Some(text), _) => text,
        (None, Some(path)) => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?,
        (None, None) => anyhow::bail!("either TEXT or --file is required"),
    };

    let store = Arc::new(db::open_store(config).await?);
    let embedder = create_embedder(&config.embedding)?;
    let ingestor = Ingestor::new(store.clone() as Arc<dyn Store>, embedder, config);
    let report = ingestor
        .submit(&text, url, &CancellationToken::new())
        .await
        .context("submission failed")?;
    store.close().await;

    println!("submit");
    println!("  document: {}", report.document_id);
    if let Some(url) = &report.source_url {
        println!("  source_url: {}", url);
    }
    println!("  outcome: {}", report.outcome.as_str());
    println!("  passages indexed: {}", report.passages);
    for failure in &report.indexing.failed {
        println!("  failed {}: {}", failure.block_id, failure.reason);
    }
    if !report.indexing.withdrawn.is_empty() {
        println!("  withdrawn: {}", report.indexing.withdrawn.len());
    }
    match report.outcome {
        IngestOutcome::Abandoned => anyhow::bail!(
            "document abandoned: {} of {} passages failed to index",
            report.indexing.failed.len(),
            report.indexing.total()
        ),
        IngestOutcome::Failed => anyhow::bail!(
            "{} of {} passages failed to index",
            report.indexing.failed.len(),
            report.indexing.total()
        ),
        _ => {}
    }
    Ok(())
}

/// Unify line endings and trim surrounding whitespace.
pub fn normalize_text(text: &str) -> String {
    text.replace("\r\n", "\n").replace('\r', "\n").trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_text() {
        assert_eq!(normalize_text("  a\r\nb\rc \n"), "a\nb\nc");
        assert_eq!(normalize_text("\n\n"), "");
    }

    #[test]
    fn test_outcome_names() {
        assert_eq!(IngestOutcome::NothingToIndex.as_str(), "nothing_to_index");
        assert_eq!(IngestOutcome::Abandoned.as_str(), "abandoned");
        assert_eq!(
            serde_json::to_string(&IngestOutcome::NothingToIndex).unwrap(),
            "\"nothing_to_index\""
        );
    }
}
