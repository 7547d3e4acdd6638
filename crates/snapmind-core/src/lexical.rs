//! Query normalization and an approximate BM25 scorer.
//!
//! The SQLite backend delegates ranking to FTS5; this module provides the
//! tokenizer both backends agree on and the scorer the in-memory store uses.
//! Scores are saturated into `[0, 1)` with `s / (1 + s)` so they are
//! comparable with the FTS5 mapping applied in the SQLite store. No claim of
//! exact BM25 compliance is made.

use std::collections::{HashMap, HashSet};

const K1: f64 = 1.2;
const B: f64 = 0.75;

const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "but", "by", "do", "does", "for", "from", "has",
    "have", "how", "i", "in", "is", "it", "its", "me", "my", "of", "on", "or", "so", "that",
    "the", "their", "there", "this", "to", "was", "we", "were", "what", "when", "where", "which",
    "who", "why", "will", "with", "you", "your",
];

/// Split `text` into lowercase alphanumeric terms, dropping single
/// characters and stopwords.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.chars().count() >= 2)
        .map(|t| t.to_lowercase())
        .filter(|t| !STOPWORDS.contains(&t.as_str()))
        .collect()
}

/// Reduce a query to its distinct search terms, in first-seen order.
///
/// Returns an empty vector for empty or trivial queries; callers must treat
/// that as "no lexical candidates" rather than "match everything".
pub fn normalize_query(query: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    tokenize(query)
        .into_iter()
        .filter(|t| seen.insert(t.clone()))
        .collect()
}

/// Map an unbounded non-negative rank score onto `[0, 1)`.
pub fn saturate(score: f64) -> f64 {
    if score.is_finite() && score > 0.0 {
        score / (1.0 + score)
    } else {
        0.0
    }
}

/// BM25-style scorer over a fixed corpus snapshot.
///
/// Built once per query from the passages in scope, so document frequencies
/// reflect only the filtered corpus.
#[derive(Debug)]
pub struct LexicalScorer {
    terms: Vec<String>,
    doc_freq: HashMap<String, usize>,
    doc_count: usize,
    avg_len: f64,
}

impl LexicalScorer {
    pub fn new<'a>(query_terms: &[String], corpus: impl IntoIterator<Item = &'a str>) -> Self {
        let wanted: HashSet<&str> = query_terms.iter().map(String::as_str).collect();
        let mut doc_freq: HashMap<String, usize> = HashMap::new();
        let mut doc_count = 0usize;
        let mut total_len = 0usize;

        for text in corpus {
            let tokens = tokenize(text);
            doc_count += 1;
            total_len += tokens.len();
            let distinct: HashSet<&str> = tokens
                .iter()
                .map(String::as_str)
                .filter(|t| wanted.contains(t))
                .collect();
            for term in distinct {
                *doc_freq.entry(term.to_string()).or_default() += 1;
            }
        }

        let avg_len = if doc_count == 0 {
            0.0
        } else {
            total_len as f64 / doc_count as f64
        };

        Self {
            terms: query_terms.to_vec(),
            doc_freq,
            doc_count,
            avg_len,
        }
    }

    /// Saturated score of `text` against the query, `0.0` when no term matches.
    pub fn score(&self, text: &str) -> f64 {
        if self.terms.is_empty() || self.doc_count == 0 {
            return 0.0;
        }
        let tokens = tokenize(text);
        let len = tokens.len() as f64;
        let mut tf: HashMap<&str, usize> = HashMap::new();
        for t in &tokens {
            *tf.entry(t.as_str()).or_default() += 1;
        }

        let n = self.doc_count as f64;
        let norm = if self.avg_len > 0.0 {
            len / self.avg_len
        } else {
            1.0
        };

        let raw: f64 = self
            .terms
            .iter()
            .filter_map(|term| {
                let f = *tf.get(term.as_str())? as f64;
                let df = self.doc_freq.get(term).copied().unwrap_or(0) as f64;
                let idf = ((n - df + 0.5) / (df + 0.5) + 1.0).ln();
                Some(idf * f * (K1 + 1.0) / (f + K1 * (1.0 - B + B * norm)))
            })
            .sum();

        saturate(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize_drops_stopwords_and_short() {
        let tokens = tokenize("What is the Rust borrow-checker? A tool!");
        assert_eq!(tokens, vec!["rust", "borrow", "checker", "tool"]);
    }

    #[test]
    fn test_normalize_query_dedupes() {
        assert_eq!(normalize_query("rust Rust RUST async"), vec!["rust", "async"]);
    }

    #[test]
    fn test_trivial_query_is_empty() {
        assert!(normalize_query("").is_empty());
        assert!(normalize_query("the a of ?!").is_empty());
    }

    #[test]
    fn test_saturate_bounds() {
        assert_eq!(saturate(0.0), 0.0);
        assert_eq!(saturate(-3.0), 0.0);
        assert_eq!(saturate(f64::NAN), 0.0);
        assert!((saturate(1.0) - 0.5).abs() < 1e-12);
        assert!(saturate(1e9) < 1.0);
    }

    #[test]
    fn test_scorer_prefers_matching_text() {
        let corpus = [
            "rust ownership and borrowing rules",
            "python garbage collection",
            "rust async runtimes such as tokio",
        ];
        let terms = normalize_query("rust tokio");
        let scorer = LexicalScorer::new(&terms, corpus.iter().copied());
        let s0 = scorer.score(corpus[0]);
        let s1 = scorer.score(corpus[1]);
        let s2 = scorer.score(corpus[2]);
        assert_eq!(s1, 0.0);
        assert!(s2 > s0, "two matching terms should outrank one");
        assert!(s0 > 0.0 && s2 < 1.0);
    }

    #[test]
    fn test_scorer_empty_corpus() {
        let terms = normalize_query("anything");
        let scorer = LexicalScorer::new(&terms, std::iter::empty());
        assert_eq!(scorer.score("anything at all"), 0.0);
    }
}
