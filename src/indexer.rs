//! Dual indexing: every passage goes into the vector index and the lexical
//! index under the same block id, or into neither.
//!
//! Passages of one document are processed concurrently, at most
//! `indexing.max_workers` at a time. Per passage:
//!
//! 1. Embed with bounded exponential backoff ([`with_backoff`]), each
//!    attempt limited by `embedding.timeout_secs`.
//! 2. Write the vector entry.
//! 3. Write the lexical entry.
//!
//! A failure at any step removes whatever was written for that block id and
//! records the passage as failed; sibling passages carry on. The document
//! status is written once, after every passage has finished: `indexed` when
//! nothing failed, `failed` otherwise.
//!
//! When more than half of a document's passages fail, the document is
//! abandoned: the passages that did succeed are withdrawn from both indices
//! so the document cannot ground an answer.

use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{self, StreamExt};
use serde::Serialize;
use tracing::{debug, info, warn};

use snapmind_core::embedding::Embedder;
use snapmind_core::error::{Error, Result};
use snapmind_core::models::{BlockId, IndexStatus, Passage};
use snapmind_core::store::Store;

use crate::cancel::CancellationToken;
use crate::config::Config;
use crate::retry::{with_backoff, RetryPolicy};

/// A passage that could not be indexed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PassageFailure {
    pub block_id: BlockId,
    pub reason: String,
}

/// Outcome of indexing one document's passages.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IndexingResult {
    /// Block ids present in both indices, in passage order.
    pub succeeded: Vec<BlockId>,
    /// Block ids present in neither index, in passage order.
    pub failed: Vec<PassageFailure>,
    /// Block ids that were indexed and then withdrawn because the document
    /// was abandoned.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub withdrawn: Vec<BlockId>,
}

impl IndexingResult {
    pub fn total(&self) -> usize {
        self.succeeded.len() + self.failed.len() + self.withdrawn.len()
    }

    /// The document status this result implies.
    pub fn status(&self) -> IndexStatus {
        if self.failed.is_empty() {
            IndexStatus::Indexed
        } else {
            IndexStatus::Failed
        }
    }

    /// More than half of the passages failed. Such a document is abandoned.
    pub fn majority_failed(&self) -> bool {
        self.failed.len() * 2 > self.total()
    }
}

pub struct DualIndexer {
    store: Arc<dyn Store>,
    embedder: Arc<dyn Embedder>,
    policy: RetryPolicy,
    embed_timeout: Duration,
    max_workers: usize,
}

impl DualIndexer {
    pub fn new(store: Arc<dyn Store>, embedder: Arc<dyn Embedder>, config: &Config) -> Self {
        Self {
            store,
            embedder,
            policy: RetryPolicy::from(&config.indexing),
            embed_timeout: Duration::from_secs(config.embedding.timeout_secs),
            max_workers: config.indexing.max_workers.max(1),
        }
    }

    /// Override the retry policy (tests use millisecond backoffs).
    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Index `passages` for `document_id` and record the resulting status.
    ///
    /// Per-passage failures are reported in the result; only a failure to
    /// write the document status is returned as an error.
    pub async fn index<I>(
        &self,
        document_id: &str,
        passages: I,
        cancel: &CancellationToken,
    ) -> Result<IndexingResult>
    where
        I: IntoIterator<Item = Passage>,
    {
        let mut outcomes: Vec<(u32, std::result::Result<BlockId, PassageFailure>)> =
            stream::iter(passages)
                .map(|passage| async move {
                    let ordinal = passage.ordinal();
                    (ordinal, self.index_passage(&passage, cancel).await)
                })
                .buffer_unordered(self.max_workers)
                .collect()
                .await;
        outcomes.sort_by_key(|(ordinal, _)| *ordinal);

        let mut result = IndexingResult::default();
        for (_, outcome) in outcomes {
            match outcome {
                Ok(block_id) => result.succeeded.push(block_id),
                Err(failure) => result.failed.push(failure),
            }
        }

        if result.majority_failed() {
            self.store.clear_passages(document_id).await?;
            result.withdrawn = std::mem::take(&mut result.succeeded);
            warn!(
                document_id,
                failed = result.failed.len(),
                withdrawn = result.withdrawn.len(),
                "majority of passages failed, document abandoned"
            );
        }

        let status = result.status();
        self.store.set_document_status(document_id, status).await?;

        if result.failed.is_empty() {
            info!(
                document_id,
                passages = result.succeeded.len(),
                "document indexed"
            );
        } else {
            warn!(
                document_id,
                succeeded = result.succeeded.len(),
                failed = result.failed.len(),
                majority_failed = result.majority_failed(),
                "document indexing incomplete"
            );
        }
        Ok(result)
    }

    async fn index_passage(
        &self,
        passage: &Passage,
        cancel: &CancellationToken,
    ) -> std::result::Result<BlockId, PassageFailure> {
        let block_id = passage.block_id().clone();
        match self.write_both(passage, cancel).await {
            Ok(()) => {
                debug!(block_id = %block_id, "passage indexed");
                Ok(block_id)
            }
            Err(err) => {
                warn!(block_id = %block_id, error = %err, "passage failed, rolling back");
                if let Err(rollback) = self.store.remove_passage(&block_id).await {
                    warn!(block_id = %block_id, error = %rollback, "rollback failed");
                }
                Err(PassageFailure {
                    block_id,
                    reason: err.to_string(),
                })
            }
        }
    }

    async fn write_both(&self, passage: &Passage, cancel: &CancellationToken) -> Result<()> {
        let embedder = &self.embedder;
        let text = passage.text();
        let vector = with_backoff(&self.policy, "embedding", self.embed_timeout, cancel, || {
            embedder.embed(text)
        })
        .await?;

        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        self.store
            .upsert_vector(passage, &vector, self.embedder.model_name())
            .await?;
        self.store.upsert_lexical(passage).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use snapmind_core::chunk::{chunk, ChunkConfig};
    use snapmind_core::models::Document;
    use snapmind_core::store::memory::InMemoryStore;
    use snapmind_core::store::IndexedText;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedEmbedder;

    #[async_trait]
    impl Embedder for FixedEmbedder {
        fn model_name(&self) -> &str {
            "fixed"
        }
        fn dims(&self) -> usize {
            2
        }
        async fn embed(&self, text: &str) -> Result<Vec<f32>> {
            if text.contains("poison") {
                Err(Error::Embedding("refused".into()))
            } else {
                Ok(vec![1.0, text.len() as f32])
            }
        }
    }

    fn test_config() -> Config {
        toml::from_str("[db]\npath = \"unused.sqlite\"\n").unwrap()
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 2,
            base_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(1),
        }
    }

    fn passages(doc_id: &str, texts: &[&str]) -> Vec<Passage> {
        texts
            .iter()
            .enumerate()
            .map(|(i, t)| {
                Passage::new(BlockId::new(doc_id, i as u64), doc_id, i as u32, *t, None).unwrap()
            })
            .collect()
    }

    async fn setup() -> (Arc<InMemoryStore>, DualIndexer, Document) {
        let store = Arc::new(InMemoryStore::new());
        let doc = Document::new(Some("https://example.com/a"), "body", Utc::now());
        store.upsert_document(&doc).await.unwrap();
        let indexer = DualIndexer::new(store.clone(), Arc::new(FixedEmbedder), &test_config())
            .with_policy(fast_policy());
        (store, indexer, doc)
    }

    #[tokio::test]
    async fn test_all_passages_indexed() {
        let (store, indexer, doc) = setup().await;
        let text = "First paragraph with enough words to be a passage.\n\nSecond one.";
        let result = indexer
            .index(
                &doc.id,
                chunk(&doc.id, text, &ChunkConfig::default()),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(result.failed, vec![]);
        assert_eq!(result.status(), IndexStatus::Indexed);
        let stored = store.get_document(&doc.id).await.unwrap().unwrap();
        assert_eq!(stored.status, IndexStatus::Indexed);
        assert_eq!(
            store.count_indexed_passages(Some(&doc.id)).await.unwrap(),
            result.succeeded.len()
        );
    }

    #[tokio::test]
    async fn test_failed_passage_isolated_and_absent_from_both_indices() {
        let (store, indexer, doc) = setup().await;
        let input = passages(&doc.id, &["good one", "poison pill", "good two"]);
        let result = indexer
            .index(&doc.id, input, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.succeeded.len(), 2);
        assert_eq!(result.failed.len(), 1);
        assert_eq!(result.failed[0].block_id, BlockId::new(&doc.id, 1));
        assert!(!result.majority_failed());

        let text = store
            .indexed_text(&BlockId::new(&doc.id, 1))
            .await
            .unwrap();
        assert_eq!(text.vector_text, None);
        assert_eq!(text.lexical_text, None);

        let stored = store.get_document(&doc.id).await.unwrap().unwrap();
        assert_eq!(stored.status, IndexStatus::Failed);
    }

    #[tokio::test]
    async fn test_majority_failure_withdraws_survivors() {
        let (store, indexer, doc) = setup().await;
        let input = passages(&doc.id, &["poison a", "poison b", "good c"]);
        let result = indexer
            .index(&doc.id, input, &CancellationToken::new())
            .await
            .unwrap();

        assert!(result.majority_failed());
        assert!(result.succeeded.is_empty());
        assert_eq!(result.failed.len(), 2);
        assert_eq!(result.withdrawn, vec![BlockId::new(&doc.id, 2)]);
        assert_eq!(result.total(), 3);
        assert_eq!(store.count_indexed_passages(Some(&doc.id)).await.unwrap(), 0);

        let text = store
            .indexed_text(&BlockId::new(&doc.id, 2))
            .await
            .unwrap();
        assert_eq!(text, IndexedText::default());

        let stored = store.get_document(&doc.id).await.unwrap().unwrap();
        assert_eq!(stored.status, IndexStatus::Failed);
    }

    #[tokio::test]
    async fn test_even_split_is_not_majority() {
        let (store, indexer, doc) = setup().await;
        let input = passages(&doc.id, &["poison a", "good b"]);
        let result = indexer
            .index(&doc.id, input, &CancellationToken::new())
            .await
            .unwrap();
        assert!(!result.majority_failed());
        assert!(result.withdrawn.is_empty());
        assert_eq!(store.count_indexed_passages(Some(&doc.id)).await.unwrap(), 1);
    }

    /// Tracks how many embed calls are running at once.
    #[derive(Default)]
    struct GaugeEmbedder {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl Embedder for GaugeEmbedder {
        fn model_name(&self) -> &str {
            "gauge"
        }
        fn dims(&self) -> usize {
            2
        }
        async fn embed(&self, text: &str) -> Result<Vec<f32>> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(vec![1.0, text.len() as f32])
        }
    }

    #[tokio::test]
    async fn test_worker_pool_is_bounded() {
        let store = Arc::new(InMemoryStore::new());
        let doc = Document::new(Some("https://example.com/pool"), "body", Utc::now());
        store.upsert_document(&doc).await.unwrap();
        let config: Config =
            toml::from_str("[db]\npath = \"unused.sqlite\"\n\n[indexing]\nmax_workers = 2\n")
                .unwrap();
        let embedder = Arc::new(GaugeEmbedder::default());
        let indexer = DualIndexer::new(store.clone(), embedder.clone(), &config);

        let texts: Vec<String> = (0..8).map(|i| format!("passage {}", i)).collect();
        let refs: Vec<&str> = texts.iter().map(String::as_str).collect();
        let result = indexer
            .index(&doc.id, passages(&doc.id, &refs), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.succeeded.len(), 8);
        let peak = embedder.peak.load(Ordering::SeqCst);
        assert!(peak <= 2, "peak concurrency {}", peak);
        assert!(peak >= 1);
    }

    #[tokio::test]
    async fn test_cancelled_run_indexes_nothing() {
        let (store, indexer, doc) = setup().await;
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = indexer
            .index(&doc.id, passages(&doc.id, &["a b c", "d e f"]), &cancel)
            .await
            .unwrap();
        assert!(result.succeeded.is_empty());
        assert_eq!(result.failed.len(), 2);
        assert_eq!(store.count_indexed_passages(Some(&doc.id)).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_empty_input_marks_indexed() {
        let (store, indexer, doc) = setup().await;
        let result = indexer
            .index(&doc.id, Vec::new(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.total(), 0);
        let stored = store.get_document(&doc.id).await.unwrap().unwrap();
        assert_eq!(stored.status, IndexStatus::Indexed);
    }
}
