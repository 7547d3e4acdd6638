//! Citation-safe context assembly and answer-side marker resolution.
//!
//! Outbound, [`assemble_context`] renders fused passages into one context
//! block, each wrapped with an inline `[<block-id>]` marker. Inbound,
//! [`extract_citations`] scans generated text for markers and resolves each
//! against the same turn's [`AssembledContext`]. Markers that do not resolve
//! are returned with no passage and count as unverifiable; they never
//! suppress the answer.
//!
//! Only passages that actually made it into the context carry a marker.
//! Passages dropped by the token budget or as near-duplicates are invisible
//! to the generator and cannot be cited.

use std::collections::HashSet;
use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

use crate::models::{BlockId, FusedResult};

const PASSAGE_SEPARATOR: &str = "\n\n---\n\n";

static MARKER_GROUP: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"\[([^\[\]\n]{1,512})\]").ok());

/// Inline reference token for one block id, rendered as `[<block-id>]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct CitationMarker(BlockId);

impl CitationMarker {
    pub fn new(block_id: BlockId) -> Self {
        Self(block_id)
    }

    pub fn block_id(&self) -> &BlockId {
        &self.0
    }
}

impl fmt::Display for CitationMarker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.0)
    }
}

/// Limits applied while assembling context.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContextBudget {
    /// Estimated token ceiling for the rendered context (`chars / 4`).
    pub max_tokens: usize,
    /// Drop passages that repeat, or nearly repeat, one already included.
    pub deduplicate: bool,
    /// Word-set Jaccard similarity above which two passages count as
    /// near-duplicates.
    pub near_duplicate_threshold: f64,
}

impl Default for ContextBudget {
    fn default() -> Self {
        Self {
            max_tokens: 4000,
            deduplicate: true,
            near_duplicate_threshold: 0.9,
        }
    }
}

/// Rough token estimate used for budgeting.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

/// Generation-ready context for one query turn.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AssembledContext {
    text: String,
    entries: Vec<(CitationMarker, FusedResult)>,
    dropped: usize,
}

impl AssembledContext {
    /// The rendered context block handed to the generator.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Markers present in the context, in rank order.
    pub fn markers(&self) -> impl Iterator<Item = &CitationMarker> {
        self.entries.iter().map(|(m, _)| m)
    }

    /// Passages present in the context, in rank order.
    pub fn passages(&self) -> impl Iterator<Item = &FusedResult> {
        self.entries.iter().map(|(_, p)| p)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of fused results left out by deduplication or the budget.
    pub fn dropped(&self) -> usize {
        self.dropped
    }

    pub fn resolve(&self, block_id: &BlockId) -> Option<&FusedResult> {
        self.entries
            .iter()
            .find(|(m, _)| m.block_id() == block_id)
            .map(|(_, p)| p)
    }
}

/// Render fused results into a marked context block.
///
/// Results are taken in rank order. The first passage is always included;
/// later ones are added only while the estimated token total stays within
/// `budget.max_tokens`.
pub fn assemble_context(results: &[FusedResult], budget: &ContextBudget) -> AssembledContext {
    let mut context = AssembledContext::default();
    let mut seen_text: HashSet<String> = HashSet::new();
    let mut seen_words: Vec<HashSet<String>> = Vec::new();
    let mut seen_blocks: HashSet<&BlockId> = HashSet::new();
    let mut sections: Vec<String> = Vec::new();
    let mut used_tokens = 0usize;
    let separator_tokens = estimate_tokens(PASSAGE_SEPARATOR);

    for (i, result) in results.iter().enumerate() {
        if !seen_blocks.insert(&result.block_id) {
            context.dropped += 1;
            continue;
        }
        if budget.deduplicate {
            let words = word_set(&result.text);
            let near = seen_words
                .iter()
                .any(|seen| jaccard(seen, &words) > budget.near_duplicate_threshold);
            if near || !seen_text.insert(dedup_key(&result.text)) {
                context.dropped += 1;
                continue;
            }
            seen_words.push(words);
        }

        let marker = CitationMarker::new(result.block_id.clone());
        let section = render_section(&marker, result);
        let separator = if sections.is_empty() {
            0
        } else {
            separator_tokens
        };
        let cost = estimate_tokens(&section) + separator;
        if !sections.is_empty() && used_tokens + cost > budget.max_tokens {
            context.dropped += results.len() - i;
            break;
        }

        used_tokens += cost;
        sections.push(section);
        context.entries.push((marker, result.clone()));
    }

    context.text = sections.join(PASSAGE_SEPARATOR);
    context
}

fn render_section(marker: &CitationMarker, result: &FusedResult) -> String {
    let source = match &result.heading {
        Some(heading) => format!("{} ({})", result.document_id, heading),
        None => result.document_id.clone(),
    };
    format!("Source: {}\nID: {}\nContent:\n{}", source, marker, result.text)
}

fn dedup_key(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Lowercased words with punctuation removed.
fn word_set(text: &str) -> HashSet<String> {
    text.split_whitespace()
        .map(|w| {
            w.chars()
                .filter(|c| c.is_alphanumeric())
                .flat_map(char::to_lowercase)
                .collect::<String>()
        })
        .filter(|w| !w.is_empty())
        .collect()
}

fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let shared = a.intersection(b).count();
    shared as f64 / (a.len() + b.len() - shared) as f64
}

/// One marker found in generated text.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Citation {
    /// The marker exactly as it appeared, e.g. `[doc-1-block-0]`.
    pub marker: String,
    pub block_id: BlockId,
    /// The cited passage, or `None` if the marker names a block that was not
    /// in this turn's context.
    pub passage: Option<FusedResult>,
}

impl Citation {
    pub fn is_verified(&self) -> bool {
        self.passage.is_some()
    }
}

/// Extract and resolve every block-id marker in `generated`.
///
/// Accepts single markers (`[a-block-1]`) and comma-separated groups
/// (`[a-block-1, a-block-2]`). Bracketed text that is not shaped like a
/// block id is ignored. Each block id is reported once, in order of first
/// appearance.
pub fn extract_citations(generated: &str, context: &AssembledContext) -> Vec<Citation> {
    let Some(re) = MARKER_GROUP.as_ref() else {
        return Vec::new();
    };

    let mut seen: HashSet<BlockId> = HashSet::new();
    let mut citations = Vec::new();

    for cap in re.captures_iter(generated) {
        let Some(group) = cap.get(1) else { continue };
        for part in group.as_str().split(',') {
            let Ok(block_id) = BlockId::parse(part.trim()) else {
                continue;
            };
            if !seen.insert(block_id.clone()) {
                continue;
            }
            citations.push(Citation {
                marker: format!("[{}]", block_id),
                passage: context.resolve(&block_id).cloned(),
                block_id,
            });
        }
    }

    citations
}
