//! Rank fusion of vector and lexical candidates.
//!
//! The two candidate lists are joined into an explicit map keyed by block
//! id with zero fill: a block that only one strategy found keeps a `0.0`
//! for the other component and is never excluded for it.
//!
//! # Weighted fusion (default)
//!
//! ```text
//! combined = vector_score × vector_weight
//!          + min(lexical_score × lexical_scale, 1) × keyword_weight
//! ```
//!
//! Vector candidates below `min_similarity` are dropped before the join.
//!
//! # Reciprocal rank fusion
//!
//! `combined = Σ 1 / (k + rank)` over the lists the block appears in, with
//! 1-based ranks. Component scores are still reported as-is.
//!
//! Either way the output is sorted by combined score (descending), then
//! vector score (descending), then block id (ascending), and truncated to
//! `top_k`.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::models::{BlockId, FusedResult};

/// Relative weights of the two retrieval strategies.
///
/// Both must be finite and non-negative, and at least one must be positive.
/// They need not sum to 1.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FusionWeights {
    vector: f64,
    keyword: f64,
}

impl FusionWeights {
    pub fn new(vector: f64, keyword: f64) -> Result<Self> {
        for (name, w) in [("vector", vector), ("keyword", keyword)] {
            if !w.is_finite() || w < 0.0 {
                return Err(Error::InvalidWeights(format!(
                    "{} weight must be finite and non-negative, got {}",
                    name, w
                )));
            }
        }
        if vector == 0.0 && keyword == 0.0 {
            return Err(Error::InvalidWeights(
                "vector and keyword weights cannot both be zero".into(),
            ));
        }
        Ok(Self { vector, keyword })
    }

    pub fn vector(&self) -> f64 {
        self.vector
    }

    pub fn keyword(&self) -> f64 {
        self.keyword
    }
}

impl Default for FusionWeights {
    fn default() -> Self {
        Self {
            vector: 0.7,
            keyword: 0.3,
        }
    }
}

/// Which retrieval strategies take part in a search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchMode {
    #[default]
    Hybrid,
    Vector,
    Keyword,
}

impl SearchMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SearchMode::Hybrid => "hybrid",
            SearchMode::Vector => "vector",
            SearchMode::Keyword => "keyword",
        }
    }

    pub fn uses_vector(&self) -> bool {
        matches!(self, SearchMode::Hybrid | SearchMode::Vector)
    }

    pub fn uses_lexical(&self) -> bool {
        matches!(self, SearchMode::Hybrid | SearchMode::Keyword)
    }
}

impl fmt::Display for SearchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SearchMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "hybrid" => Ok(SearchMode::Hybrid),
            "vector" | "semantic" => Ok(SearchMode::Vector),
            "keyword" | "lexical" => Ok(SearchMode::Keyword),
            other => Err(Error::InvalidWeights(format!(
                "unknown search mode: {}. Use hybrid, vector, or keyword.",
                other
            ))),
        }
    }
}

/// Score combination rule.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum FusionStrategy {
    #[default]
    Weighted,
    ReciprocalRank { k: u32 },
}

/// Per-call fusion configuration. Threaded explicitly into [`fuse`]; there
/// is no process-wide default beyond [`Default`].
#[derive(Debug, Clone, PartialEq)]
pub struct FusionParams {
    pub mode: SearchMode,
    pub weights: FusionWeights,
    pub strategy: FusionStrategy,
    pub top_k: usize,
    pub min_similarity: f64,
    pub lexical_scale: f64,
}

impl Default for FusionParams {
    fn default() -> Self {
        Self {
            mode: SearchMode::Hybrid,
            weights: FusionWeights::default(),
            strategy: FusionStrategy::Weighted,
            top_k: 10,
            min_similarity: 0.3,
            lexical_scale: 1.0,
        }
    }
}

impl FusionParams {
    /// How many candidates each strategy should fetch.
    pub fn candidate_limit(&self) -> usize {
        self.top_k.saturating_mul(2)
    }

    pub fn validate(&self) -> Result<()> {
        if self.top_k == 0 {
            return Err(Error::InvalidWeights("top_k must be > 0".into()));
        }
        if !(0.0..=1.0).contains(&self.min_similarity) {
            return Err(Error::InvalidWeights(format!(
                "min_similarity must be within [0, 1], got {}",
                self.min_similarity
            )));
        }
        if !self.lexical_scale.is_finite() || self.lexical_scale < 0.0 {
            return Err(Error::InvalidWeights(format!(
                "lexical_scale must be finite and non-negative, got {}",
                self.lexical_scale
            )));
        }
        if let FusionStrategy::ReciprocalRank { k } = self.strategy {
            if k == 0 {
                return Err(Error::InvalidWeights("rrf k must be > 0".into()));
            }
        }
        Ok(())
    }

    /// Weights after applying the search mode: single-strategy modes put all
    /// weight on the active strategy.
    pub fn effective_weights(&self) -> FusionWeights {
        match self.mode {
            SearchMode::Hybrid => self.weights,
            SearchMode::Vector => FusionWeights {
                vector: 1.0,
                keyword: 0.0,
            },
            SearchMode::Keyword => FusionWeights {
                vector: 0.0,
                keyword: 1.0,
            },
        }
    }
}

/// A candidate returned by one retrieval strategy.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub block_id: BlockId,
    pub document_id: String,
    /// Cosine similarity for vector candidates, saturated rank score for
    /// lexical ones.
    pub score: f64,
    pub text: String,
    pub heading: Option<String>,
}

struct Joined<'a> {
    candidate: &'a Candidate,
    vector: f64,
    lexical: f64,
    vector_rank: Option<usize>,
    lexical_rank: Option<usize>,
}

/// Fuse the two candidate lists into at most `params.top_k` results.
pub fn fuse(
    vector: &[Candidate],
    lexical: &[Candidate],
    params: &FusionParams,
) -> Vec<FusedResult> {
    let vector = ranked(
        vector
            .iter()
            .filter(|c| c.score.is_finite() && c.score >= params.min_similarity),
    );
    let lexical = ranked(lexical.iter().filter(|c| c.score.is_finite() && c.score > 0.0));

    let mut joined: HashMap<&BlockId, Joined<'_>> = HashMap::new();
    for (rank, &c) in vector.iter().enumerate() {
        joined.insert(
            &c.block_id,
            Joined {
                candidate: c,
                vector: c.score.clamp(0.0, 1.0),
                lexical: 0.0,
                vector_rank: Some(rank + 1),
                lexical_rank: None,
            },
        );
    }
    for (rank, &c) in lexical.iter().enumerate() {
        let entry = joined.entry(&c.block_id).or_insert(Joined {
            candidate: c,
            vector: 0.0,
            lexical: 0.0,
            vector_rank: None,
            lexical_rank: None,
        });
        entry.lexical = c.score;
        entry.lexical_rank = Some(rank + 1);
    }

    let weights = params.effective_weights();
    let mut results: Vec<FusedResult> = joined
        .into_values()
        .map(|j| {
            let combined = match params.strategy {
                FusionStrategy::Weighted => {
                    let scaled = (j.lexical * params.lexical_scale).min(1.0);
                    j.vector * weights.vector() + scaled * weights.keyword()
                }
                FusionStrategy::ReciprocalRank { k } => {
                    let rrf = |rank: Option<usize>| {
                        rank.map(|r| 1.0 / (k as f64 + r as f64)).unwrap_or(0.0)
                    };
                    rrf(j.vector_rank) + rrf(j.lexical_rank)
                }
            };
            FusedResult {
                block_id: j.candidate.block_id.clone(),
                document_id: j.candidate.document_id.clone(),
                text: j.candidate.text.clone(),
                heading: j.candidate.heading.clone(),
                vector_score: j.vector,
                lexical_score: j.lexical,
                combined_score: combined,
            }
        })
        .collect();

    results.sort_by(compare_fused);
    results.truncate(params.top_k);
    results
}

/// Order one strategy's candidates by score (desc, then block id) keeping
/// only the best entry per block id.
fn ranked<'a>(candidates: impl Iterator<Item = &'a Candidate>) -> Vec<&'a Candidate> {
    let mut best: HashMap<&BlockId, &Candidate> = HashMap::new();
    for c in candidates {
        best.entry(&c.block_id)
            .and_modify(|prev| {
                if c.score > prev.score {
                    *prev = c;
                }
            })
            .or_insert(c);
    }
    let mut list: Vec<&Candidate> = best.into_values().collect();
    list.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.block_id.cmp(&b.block_id))
    });
    list
}

fn compare_fused(a: &FusedResult, b: &FusedResult) -> Ordering {
    b.combined_score
        .total_cmp(&a.combined_score)
        .then_with(|| b.vector_score.total_cmp(&a.vector_score))
        .then_with(|| a.block_id.cmp(&b.block_id))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cand(block: u64, score: f64) -> Candidate {
        Candidate {
            block_id: BlockId::new("doc-t", block),
            document_id: "doc-t".to_string(),
            score,
            text: format!("passage {}", block),
            heading: None,
        }
    }

    fn ids(results: &[FusedResult]) -> Vec<u64> {
        results.iter().map(|r| r.block_id.number()).collect()
    }

    #[test]
    fn test_weights_reject_negative_and_nan() {
        assert!(FusionWeights::new(-0.1, 0.3).is_err());
        assert!(FusionWeights::new(0.7, f64::NAN).is_err());
        assert!(FusionWeights::new(2.0, 5.0).is_ok());
    }

    #[test]
    fn test_weights_reject_all_zero() {
        assert!(matches!(
            FusionWeights::new(0.0, 0.0),
            Err(Error::InvalidWeights(_))
        ));
        assert!(FusionWeights::new(0.0, 1.0).is_ok());
        assert!(FusionWeights::new(1.0, 0.0).is_ok());
    }

    #[test]
    fn test_single_signal_blocks_are_kept() {
        // Block 1 in both, block 2 lexical only, block 3 vector only.
        let vector = vec![cand(1, 0.9), cand(3, 0.8)];
        let lexical = vec![cand(1, 0.6), cand(2, 0.9)];
        let results = fuse(&vector, &lexical, &FusionParams::default());

        assert_eq!(ids(&results), vec![1, 3, 2]);
        let b1 = &results[0];
        assert!(b1.vector_score > 0.0 && b1.lexical_score > 0.0);
        let b3 = &results[1];
        assert_eq!(b3.lexical_score, 0.0);
        assert!((b3.combined_score - 0.8 * 0.7).abs() < 1e-9);
        let b2 = &results[2];
        assert_eq!(b2.vector_score, 0.0);
        assert!((b2.combined_score - 0.9 * 0.3).abs() < 1e-9);
    }

    #[test]
    fn test_min_similarity_drops_weak_vectors() {
        let vector = vec![cand(1, 0.2), cand(2, 0.5)];
        let results = fuse(&vector, &[], &FusionParams::default());
        assert_eq!(ids(&results), vec![2]);
    }

    #[test]
    fn test_truncates_and_sorts() {
        let vector: Vec<_> = (0..30).map(|i| cand(i, 0.3 + i as f64 / 100.0)).collect();
        let params = FusionParams {
            top_k: 5,
            ..FusionParams::default()
        };
        let results = fuse(&vector, &[], &params);
        assert_eq!(results.len(), 5);
        for pair in results.windows(2) {
            assert!(pair[0].combined_score >= pair[1].combined_score);
        }
        assert_eq!(results[0].block_id.number(), 29);
    }

    #[test]
    fn test_ties_break_on_vector_then_block_id() {
        let params = FusionParams {
            weights: FusionWeights::new(1.0, 1.0).unwrap(),
            ..FusionParams::default()
        };
        // Block 5: 0.5 + 0.0, block 4: 0.4 + 0.1, block 2 and 3: identical.
        let vector = vec![cand(5, 0.5), cand(4, 0.4), cand(3, 0.5), cand(2, 0.5)];
        let lexical = vec![cand(4, 0.1)];
        let results = fuse(&vector, &lexical, &params);
        assert_eq!(ids(&results), vec![2, 3, 5, 4]);
    }

    #[test]
    fn test_lexical_scale_caps_at_one() {
        let params = FusionParams {
            lexical_scale: 10.0,
            ..FusionParams::default()
        };
        let results = fuse(&[], &[cand(1, 0.5)], &params);
        assert!((results[0].combined_score - 0.3).abs() < 1e-9);
        assert_eq!(results[0].lexical_score, 0.5);
    }

    #[test]
    fn test_keyword_mode_puts_all_weight_on_lexical() {
        let params = FusionParams {
            mode: SearchMode::Keyword,
            ..FusionParams::default()
        };
        let results = fuse(&[], &[cand(1, 0.4)], &params);
        assert!((results[0].combined_score - 0.4).abs() < 1e-9);
    }

    #[test]
    fn test_rrf_rewards_agreement() {
        let params = FusionParams {
            strategy: FusionStrategy::ReciprocalRank { k: 60 },
            ..FusionParams::default()
        };
        let vector = vec![cand(1, 0.9), cand(2, 0.8)];
        let lexical = vec![cand(2, 0.9), cand(3, 0.8)];
        let results = fuse(&vector, &lexical, &params);
        assert_eq!(results[0].block_id.number(), 2);
        let expected = 1.0 / 62.0 + 1.0 / 61.0;
        assert!((results[0].combined_score - expected).abs() < 1e-12);
    }

    #[test]
    fn test_duplicate_candidates_keep_best() {
        let vector = vec![cand(1, 0.4), cand(1, 0.9)];
        let results = fuse(&vector, &[], &FusionParams::default());
        assert_eq!(results.len(), 1);
        assert!((results[0].vector_score - 0.9).abs() < 1e-9);
    }

    #[test]
    fn test_params_validation() {
        assert!(FusionParams::default().validate().is_ok());
        let bad = FusionParams {
            min_similarity: 1.5,
            ..FusionParams::default()
        };
        assert!(bad.validate().is_err());
        let zero = FusionParams {
            top_k: 0,
            ..FusionParams::default()
        };
        assert!(zero.validate().is_err());
    }

    #[test]
    fn test_mode_parse() {
        assert_eq!("hybrid".parse::<SearchMode>().unwrap(), SearchMode::Hybrid);
        assert_eq!("semantic".parse::<SearchMode>().unwrap(), SearchMode::Vector);
        assert!("fuzzy".parse::<SearchMode>().is_err());
    }
}
