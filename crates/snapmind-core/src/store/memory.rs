//! In-memory [`Store`] implementation for tests and embedding in other
//! processes.
//!
//! Uses `HashMap`s behind `std::sync::RwLock`. Vector search is brute-force
//! cosine similarity; lexical search scores the filtered passages with
//! [`LexicalScorer`].

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;

use crate::embedding::cosine_similarity;
use crate::error::{Error, Result};
use crate::fusion::Candidate;
use crate::lexical::LexicalScorer;
use crate::models::{BlockId, Document, IndexStatus, Passage};

use super::{DocumentSummary, IndexedText, Store};

struct StoredVector {
    passage: Passage,
    vector: Vec<f32>,
    _model: String,
}

#[derive(Default)]
struct State {
    docs: HashMap<String, Document>,
    /// Block high-water marks of deleted documents.
    tombstones: HashMap<String, u64>,
    vectors: HashMap<BlockId, StoredVector>,
    lexical: HashMap<BlockId, Passage>,
}

impl State {
    fn is_indexed(&self, block_id: &BlockId) -> bool {
        self.vectors.contains_key(block_id) && self.lexical.contains_key(block_id)
    }

    fn indexed_in<'a>(&'a self, document_id: Option<&'a str>) -> impl Iterator<Item = &'a Passage> {
        self.lexical
            .values()
            .filter(move |p| document_id.map_or(true, |d| p.document_id() == d))
            .filter(move |p| self.vectors.contains_key(p.block_id()))
    }
}

/// In-memory store.
#[derive(Default)]
pub struct InMemoryStore {
    state: RwLock<State>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, State>> {
        self.state
            .read()
            .map_err(|_| Error::Storage("in-memory store lock poisoned".into()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, State>> {
        self.state
            .write()
            .map_err(|_| Error::Storage("in-memory store lock poisoned".into()))
    }
}

fn candidate(passage: &Passage, score: f64) -> Candidate {
    Candidate {
        block_id: passage.block_id().clone(),
        document_id: passage.document_id().to_string(),
        score,
        text: passage.text().to_string(),
        heading: passage.heading().map(str::to_string),
    }
}

fn sort_best_first(candidates: &mut [Candidate]) {
    candidates.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.block_id.cmp(&b.block_id))
    });
}

#[async_trait]
impl Store for InMemoryStore {
    async fn upsert_document(&self, doc: &Document) -> Result<()> {
        let mut state = self.write()?;
        state.tombstones.remove(&doc.id);
        state.docs.insert(doc.id.clone(), doc.clone());
        Ok(())
    }

    async fn get_document(&self, id: &str) -> Result<Option<Document>> {
        Ok(self.read()?.docs.get(id).cloned())
    }

    async fn set_document_status(&self, id: &str, status: IndexStatus) -> Result<()> {
        let mut state = self.write()?;
        match state.docs.get_mut(id) {
            Some(doc) => {
                doc.status = status;
                Ok(())
            }
            None => Err(Error::Storage(format!("no such document: {}", id))),
        }
    }

    async fn list_documents(&self) -> Result<Vec<DocumentSummary>> {
        let state = self.read()?;
        let mut docs: Vec<DocumentSummary> = state
            .docs
            .values()
            .map(|doc| DocumentSummary {
                id: doc.id.clone(),
                source_url: doc.source_url.clone(),
                status: doc.status,
                ingested_at: doc.ingested_at,
                passage_count: state.indexed_in(Some(&doc.id)).count(),
            })
            .collect();
        docs.sort_by(|a, b| b.ingested_at.cmp(&a.ingested_at).then(a.id.cmp(&b.id)));
        Ok(docs)
    }

    async fn delete_document(&self, id: &str) -> Result<bool> {
        let mut state = self.write()?;
        let Some(doc) = state.docs.remove(id) else {
            return Ok(false);
        };
        state.vectors.retain(|_, v| v.passage.document_id() != id);
        state.lexical.retain(|_, p| p.document_id() != id);
        state.tombstones.insert(doc.id, doc.next_block);
        Ok(true)
    }

    async fn next_block(&self, document_id: &str) -> Result<u64> {
        let state = self.read()?;
        let live = state.docs.get(document_id).map(|d| d.next_block);
        let retired = state.tombstones.get(document_id).copied();
        Ok(live.into_iter().chain(retired).max().unwrap_or(0))
    }

    async fn upsert_vector(&self, passage: &Passage, vector: &[f32], model: &str) -> Result<()> {
        let mut state = self.write()?;
        state.vectors.insert(
            passage.block_id().clone(),
            StoredVector {
                passage: passage.clone(),
                vector: vector.to_vec(),
                _model: model.to_string(),
            },
        );
        Ok(())
    }

    async fn upsert_lexical(&self, passage: &Passage) -> Result<()> {
        let mut state = self.write()?;
        state
            .lexical
            .insert(passage.block_id().clone(), passage.clone());
        Ok(())
    }

    async fn remove_passage(&self, block_id: &BlockId) -> Result<()> {
        let mut state = self.write()?;
        state.vectors.remove(block_id);
        state.lexical.remove(block_id);
        Ok(())
    }

    async fn clear_passages(&self, document_id: &str) -> Result<()> {
        let mut state = self.write()?;
        state
            .vectors
            .retain(|_, v| v.passage.document_id() != document_id);
        state.lexical.retain(|_, p| p.document_id() != document_id);
        Ok(())
    }

    async fn list_passages(&self, document_id: &str) -> Result<Vec<Passage>> {
        let state = self.read()?;
        let mut passages: Vec<Passage> = state.indexed_in(Some(document_id)).cloned().collect();
        passages.sort_by_key(|p| p.ordinal());
        Ok(passages)
    }

    async fn indexed_text(&self, block_id: &BlockId) -> Result<IndexedText> {
        let state = self.read()?;
        Ok(IndexedText {
            vector_text: state
                .vectors
                .get(block_id)
                .map(|v| v.passage.text().to_string()),
            lexical_text: state.lexical.get(block_id).map(|p| p.text().to_string()),
        })
    }

    async fn vector_search(
        &self,
        query_vec: &[f32],
        document_id: Option<&str>,
        limit: usize,
        min_similarity: f64,
    ) -> Result<Vec<Candidate>> {
        let state = self.read()?;
        let mut candidates: Vec<Candidate> = state
            .vectors
            .values()
            .filter(|sv| document_id.map_or(true, |d| sv.passage.document_id() == d))
            .filter(|sv| state.is_indexed(sv.passage.block_id()))
            .map(|sv| {
                let sim = cosine_similarity(query_vec, &sv.vector) as f64;
                candidate(&sv.passage, sim)
            })
            .filter(|c| c.score >= min_similarity)
            .collect();
        sort_best_first(&mut candidates);
        candidates.truncate(limit);
        Ok(candidates)
    }

    async fn lexical_search(
        &self,
        terms: &[String],
        document_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Candidate>> {
        if terms.is_empty() {
            return Ok(Vec::new());
        }
        let state = self.read()?;
        let in_scope: Vec<&Passage> = state.indexed_in(document_id).collect();
        let scorer = LexicalScorer::new(terms, in_scope.iter().map(|p| p.text()));
        let mut candidates: Vec<Candidate> = in_scope
            .iter()
            .filter_map(|p| {
                let score = scorer.score(p.text());
                (score > 0.0).then(|| candidate(p, score))
            })
            .collect();
        sort_best_first(&mut candidates);
        candidates.truncate(limit);
        Ok(candidates)
    }

    async fn count_indexed_passages(&self, document_id: Option<&str>) -> Result<usize> {
        Ok(self.read()?.indexed_in(document_id).count())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::lexical::normalize_query;

    fn passage(doc: &str, n: u64, text: &str) -> Passage {
        Passage::new(BlockId::new(doc, n), doc, n as u32, text, None).unwrap()
    }

    async fn index(store: &InMemoryStore, p: &Passage, v: &[f32]) {
        store.upsert_vector(p, v, "test").await.unwrap();
        store.upsert_lexical(p).await.unwrap();
    }

    #[tokio::test]
    async fn test_vector_search_filters_and_ranks() {
        let store = InMemoryStore::new();
        index(&store, &passage("doc-a", 0, "alpha"), &[1.0, 0.0]).await;
        index(&store, &passage("doc-a", 1, "beta"), &[0.7, 0.7]).await;
        index(&store, &passage("doc-b", 0, "gamma"), &[1.0, 0.0]).await;

        let all = store.vector_search(&[1.0, 0.0], None, 10, 0.3).await.unwrap();
        assert_eq!(all.len(), 3);
        assert!(all[0].score >= all[2].score);

        let scoped = store
            .vector_search(&[1.0, 0.0], Some("doc-a"), 10, 0.9)
            .await
            .unwrap();
        assert_eq!(scoped.len(), 1);
        assert_eq!(scoped[0].block_id.as_str(), "doc-a-block-0");
    }

    #[tokio::test]
    async fn test_lexical_search_matches_terms() {
        let store = InMemoryStore::new();
        index(&store, &passage("doc-a", 0, "tokio runtime internals"), &[1.0]).await;
        index(&store, &passage("doc-a", 1, "garden vegetables"), &[1.0]).await;

        let hits = store
            .lexical_search(&normalize_query("tokio"), None, 10)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].score > 0.0 && hits[0].score < 1.0);
        assert!(store.lexical_search(&[], None, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_half_indexed_passage_is_invisible() {
        let store = InMemoryStore::new();
        let p = passage("doc-a", 0, "orphan text");
        store.upsert_lexical(&p).await.unwrap();
        assert_eq!(store.count_indexed_passages(None).await.unwrap(), 0);
        assert!(store
            .lexical_search(&normalize_query("orphan"), None, 10)
            .await
            .unwrap()
            .is_empty());

        store.remove_passage(p.block_id()).await.unwrap();
        assert_eq!(store.indexed_text(p.block_id()).await.unwrap(), IndexedText::default());
    }

    #[tokio::test]
    async fn test_delete_keeps_high_water_mark() {
        let store = InMemoryStore::new();
        let mut doc = Document::new(Some("https://example.com/a"), "body", Utc::now());
        doc.next_block = 4;
        store.upsert_document(&doc).await.unwrap();
        index(&store, &passage(&doc.id, 3, "text"), &[1.0]).await;

        assert!(store.delete_document(&doc.id).await.unwrap());
        assert!(!store.delete_document(&doc.id).await.unwrap());
        assert_eq!(store.next_block(&doc.id).await.unwrap(), 4);
        assert_eq!(store.count_indexed_passages(Some(&doc.id)).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_indexed_text_consistency() {
        let store = InMemoryStore::new();
        let p = passage("doc-a", 0, "same bytes");
        index(&store, &p, &[1.0]).await;
        assert!(store.indexed_text(p.block_id()).await.unwrap().is_consistent());
    }
}
