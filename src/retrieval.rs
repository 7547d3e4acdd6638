//! Query-time retrieval: two independent lookups fused into one ranking.
//!
//! The vector branch (query embedding followed by nearest-neighbor lookup)
//! and the lexical branch run concurrently, each under its own timeout.
//! When the vector branch fails or times out the search continues on the
//! lexical candidates alone and the outcome is flagged degraded. The reverse
//! also holds: a failed lexical lookup degrades to vector-only. Only when
//! both branches fail is the search itself an error.
//!
//! With a [`SemanticCache`] attached, the query is embedded before either
//! lookup starts. A cache hit returns the stored outcome; otherwise the
//! embedding is reused by the vector branch and a non-degraded outcome is
//! cached under it.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, warn};

use snapmind_core::embedding::Embedder;
use snapmind_core::error::{Error, Result};
use snapmind_core::fusion::{fuse, Candidate, FusionParams, SearchMode};
use snapmind_core::lexical::normalize_query;
use snapmind_core::models::FusedResult;
use snapmind_core::store::Store;

use crate::cache::SemanticCache;
use crate::cancel::CancellationToken;
use crate::config::Config;

#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub query: String,
    /// Restrict candidates to one document.
    pub document_id: Option<String>,
    pub params: FusionParams,
}

/// Which strategy was unavailable for a degraded search, and why.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "strategy", content = "reason", rename_all = "snake_case")]
pub enum Degradation {
    /// Query embedding or vector lookup failed; results are lexical-only.
    Vector(String),
    /// Lexical lookup failed; results are vector-only.
    Lexical(String),
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SearchOutcome {
    pub results: Vec<FusedResult>,
    pub degraded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub degradation: Option<Degradation>,
}

pub struct RetrievalEngine {
    store: Arc<dyn Store>,
    embedder: Arc<dyn Embedder>,
    query_embedding_timeout: Duration,
    vector_timeout: Duration,
    lexical_timeout: Duration,
    cache: Option<Arc<SemanticCache>>,
}

impl RetrievalEngine {
    pub fn new(store: Arc<dyn Store>, embedder: Arc<dyn Embedder>, config: &Config) -> Self {
        Self {
            store,
            embedder,
            query_embedding_timeout: Duration::from_millis(config.timeouts.query_embedding_ms),
            vector_timeout: Duration::from_millis(config.timeouts.vector_ms),
            lexical_timeout: Duration::from_millis(config.timeouts.lexical_ms),
            cache: None,
        }
    }

    pub fn with_cache(mut self, cache: Arc<SemanticCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Number of passages present in both indices for `document_id` (or
    /// across all documents).
    pub async fn indexed_passages(&self, document_id: Option<&str>) -> Result<usize> {
        self.store.count_indexed_passages(document_id).await
    }

    pub async fn search(
        &self,
        request: &SearchRequest,
        cancel: &CancellationToken,
    ) -> Result<SearchOutcome> {
        request.params.validate()?;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            outcome = self.run(request) => outcome,
        }
    }

    async fn run(&self, request: &SearchRequest) -> Result<SearchOutcome> {
        let params = &request.params;
        let scope = request.document_id.as_deref();
        let limit = params.candidate_limit();
        let terms = normalize_query(&request.query);

        let mut prepared: Option<Result<Vec<f32>>> = None;
        let mut cache_key: Option<Vec<f32>> = None;
        if let Some(cache) = self.cache.as_ref().filter(|_| params.mode.uses_vector()) {
            match self.embed_query(&request.query).await {
                Ok(query_vec) => {
                    if let Some(hit) = cache.get(&query_vec, scope, params) {
                        debug!(query = %request.query, "search served from cache");
                        return Ok(hit);
                    }
                    cache_key = Some(query_vec.clone());
                    prepared = Some(Ok(query_vec));
                }
                Err(err) => prepared = Some(Err(err)),
            }
        }

        let vector_branch = async {
            if params.mode.uses_vector() {
                let candidates = self
                    .vector_candidates(
                        &request.query,
                        prepared,
                        scope,
                        limit,
                        params.min_similarity,
                    )
                    .await;
                Some(candidates)
            } else {
                None
            }
        };
        let lexical_branch = async {
            if params.mode.uses_lexical() {
                Some(self.lexical_candidates(&terms, scope, limit).await)
            } else {
                None
            }
        };
        let (vector, lexical) = tokio::join!(vector_branch, lexical_branch);

        let mut fusion = params.clone();
        let mut degradation = None;

        let vector = match vector {
            Some(Ok(candidates)) => candidates,
            Some(Err(err)) => {
                warn!(error = %err, "vector branch unavailable, continuing lexical-only");
                degradation = Some(Degradation::Vector(err.to_string()));
                Vec::new()
            }
            None => Vec::new(),
        };

        let lexical = match lexical {
            Some(Ok(candidates)) => candidates,
            Some(Err(err)) => {
                if degradation.is_some() {
                    return Err(err);
                }
                warn!(error = %err, "lexical branch unavailable, continuing vector-only");
                degradation = Some(Degradation::Lexical(err.to_string()));
                Vec::new()
            }
            // Vector-only mode falls back to the lexical index when the
            // vector branch is down.
            None if degradation.is_some() => {
                fusion.mode = SearchMode::Keyword;
                self.lexical_candidates(&terms, scope, limit).await?
            }
            None => Vec::new(),
        };

        let results = fuse(&vector, &lexical, &fusion);
        debug!(
            query = %request.query,
            vector_candidates = vector.len(),
            lexical_candidates = lexical.len(),
            results = results.len(),
            degraded = degradation.is_some(),
            "search complete"
        );

        let outcome = SearchOutcome {
            results,
            degraded: degradation.is_some(),
            degradation,
        };
        if let (Some(cache), Some(query_vec)) = (&self.cache, cache_key) {
            if !outcome.degraded {
                cache.insert(query_vec, scope, params, &outcome);
            }
        }
        Ok(outcome)
    }

    async fn embed_query(&self, query: &str) -> Result<Vec<f32>> {
        bounded(
            "query embedding",
            self.query_embedding_timeout,
            self.embedder.embed(query),
        )
        .await
    }

    /// `prepared` carries an embedding attempt made before the lookups
    /// started; without one the query is embedded here.
    async fn vector_candidates(
        &self,
        query: &str,
        prepared: Option<Result<Vec<f32>>>,
        scope: Option<&str>,
        limit: usize,
        min_similarity: f64,
    ) -> Result<Vec<Candidate>> {
        let query_vec = match prepared {
            Some(embedded) => embedded?,
            None => self.embed_query(query).await?,
        };
        bounded(
            "vector lookup",
            self.vector_timeout,
            self.store.vector_search(&query_vec, scope, limit, min_similarity),
        )
        .await
    }

    async fn lexical_candidates(
        &self,
        terms: &[String],
        scope: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Candidate>> {
        if terms.is_empty() {
            return Ok(Vec::new());
        }
        bounded(
            "lexical lookup",
            self.lexical_timeout,
            self.store.lexical_search(terms, scope, limit),
        )
        .await
    }
}

async fn bounded<T>(
    operation: &'static str,
    limit: Duration,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout {
            operation,
            millis: limit.as_millis() as u64,
        }),
    }
}
