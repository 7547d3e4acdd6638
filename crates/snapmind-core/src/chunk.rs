//! Structure-aware text chunker.
//!
//! Splits normalized document text into [`Passage`]s whose length stays
//! between a configured floor and ceiling. Lengths are measured in UTF-8
//! bytes; every cut is snapped to a char boundary.
//!
//! # Algorithm
//!
//! 1. Segment on structural boundaries: blank lines end a paragraph and a
//!    markdown heading always starts a new segment. Fenced code blocks are
//!    atomic, so blank lines inside them do not split.
//! 2. Merge adjacent segments while the accumulated candidate is below
//!    `min_chars`.
//! 3. Any candidate above `max_chars` is cut inside the window
//!    `[max_chars - lookahead_chars, max_chars]`: at a paragraph break if one
//!    exists there, else at the last sentence end, else with a hard cut at
//!    `max_chars`. The remainder goes back into the merge buffer.
//! 4. A trailing fragment below the floor is folded into the previous
//!    passage when the result still fits under the ceiling.
//!
//! The output is a lazy iterator ([`Passages`]); it is finite, preserves
//! source order, and cannot be restarted. Text shorter than
//! `min_viable_chars` produces no passages at all.
//!
//! # Example
//!
//! ```rust
//! use snapmind_core::chunk::{chunk, ChunkConfig};
//!
//! let config = ChunkConfig::default();
//! let passages: Vec<_> = chunk(
//!     "doc-1",
//!     "# Intro\n\nSnapmind indexes pages for hybrid retrieval and cites its sources.",
//!     &config,
//! )
//! .collect();
//! assert_eq!(passages.len(), 1);
//! assert_eq!(passages[0].block_id().as_str(), "doc-1-block-0");
//! assert_eq!(passages[0].heading(), Some("Intro"));
//! ```

use std::collections::VecDeque;
use std::str::Lines;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::models::{BlockId, Passage};

/// Length bounds for chunking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkConfig {
    /// Floor: small segments are merged until a passage reaches this length.
    pub min_chars: usize,
    /// Ceiling: no passage is longer than this.
    pub max_chars: usize,
    /// How far back from the ceiling to look for a sentence boundary.
    pub lookahead_chars: usize,
    /// Documents whose trimmed text is shorter than this produce nothing.
    pub min_viable_chars: usize,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            min_chars: 200,
            max_chars: 1200,
            lookahead_chars: 200,
            min_viable_chars: 50,
        }
    }
}

impl ChunkConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_chars == 0 {
            return Err(Error::InvalidPassage("max_chars must be > 0".into()));
        }
        if self.min_chars > self.max_chars {
            return Err(Error::InvalidPassage(format!(
                "min_chars ({}) must not exceed max_chars ({})",
                self.min_chars, self.max_chars
            )));
        }
        if self.lookahead_chars >= self.max_chars {
            return Err(Error::InvalidPassage(format!(
                "lookahead_chars ({}) must be smaller than max_chars ({})",
                self.lookahead_chars, self.max_chars
            )));
        }
        Ok(())
    }
}

/// Chunk `text` for `document_id`, numbering blocks from 0.
pub fn chunk<'a>(document_id: &'a str, text: &'a str, config: &ChunkConfig) -> Passages<'a> {
    Chunker::new(config.clone()).chunk(document_id, text, 0)
}

/// Reusable chunker bound to one configuration.
#[derive(Debug, Clone, Default)]
pub struct Chunker {
    config: ChunkConfig,
}

impl Chunker {
    pub fn new(config: ChunkConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ChunkConfig {
        &self.config
    }

    /// Chunk `text`, numbering blocks from `first_block`.
    ///
    /// Re-ingestion passes the document's block high-water mark here so that
    /// ids retired with the previous content are never handed out again.
    pub fn chunk<'a>(&self, document_id: &'a str, text: &'a str, first_block: u64) -> Passages<'a> {
        let viable = text.trim().len() >= self.config.min_viable_chars.max(1);
        Passages {
            document_id,
            config: self.config.clone(),
            segments: Segments::new(text),
            buffer: String::new(),
            buffer_heading: None,
            ready: VecDeque::new(),
            next_block: first_block,
            ordinal: 0,
            exhausted: !viable,
        }
    }
}

/// Lazy, single-pass sequence of passages produced by [`Chunker::chunk`].
///
/// One finished candidate is always held back until the next one exists, so
/// that an undersized tail can still be folded into its predecessor.
pub struct Passages<'a> {
    document_id: &'a str,
    config: ChunkConfig,
    segments: Segments<'a>,
    buffer: String,
    buffer_heading: Option<String>,
    ready: VecDeque<(String, Option<String>)>,
    next_block: u64,
    ordinal: u32,
    exhausted: bool,
}

impl<'a> Passages<'a> {
    /// Block number the next produced passage will receive. After the
    /// iterator is drained this is the document's new high-water mark.
    pub fn next_block(&self) -> u64 {
        self.next_block
    }

    fn push_segment(&mut self, segment: Segment) {
        if self.buffer.is_empty() {
            self.buffer = segment.text;
            self.buffer_heading = segment.heading;
        } else if self.buffer.len() < self.config.min_chars {
            self.buffer.push_str("\n\n");
            self.buffer.push_str(&segment.text);
        } else {
            self.flush();
            self.buffer = segment.text;
            self.buffer_heading = segment.heading;
        }
        self.split_oversized();
    }

    fn split_oversized(&mut self) {
        while self.buffer.len() > self.config.max_chars {
            let cut = find_cut(&self.buffer, self.config.max_chars, self.config.lookahead_chars);
            let head = self.buffer[..cut].trim().to_string();
            let rest = self.buffer[cut..].trim_start().to_string();
            if !head.is_empty() {
                self.ready.push_back((head, self.buffer_heading.clone()));
            }
            self.buffer = rest;
        }
    }

    fn flush(&mut self) {
        let text = std::mem::take(&mut self.buffer);
        let heading = self.buffer_heading.take();
        let text = text.trim();
        if !text.is_empty() {
            self.ready.push_back((text.to_string(), heading));
        }
    }

    fn finish(&mut self) {
        let tail = std::mem::take(&mut self.buffer);
        let heading = self.buffer_heading.take();
        let tail = tail.trim();
        if tail.is_empty() {
            return;
        }
        if tail.len() < self.config.min_chars {
            if let Some((prev, _)) = self.ready.back_mut() {
                if prev.len() + 2 + tail.len() <= self.config.max_chars {
                    prev.push_str("\n\n");
                    prev.push_str(tail);
                    return;
                }
            }
        }
        self.ready.push_back((tail.to_string(), heading));
    }

    fn make(&mut self, text: String, heading: Option<String>) -> Option<Passage> {
        let block_id = BlockId::new(self.document_id, self.next_block);
        let passage = Passage::new(block_id, self.document_id, self.ordinal, text, heading).ok()?;
        self.next_block += 1;
        self.ordinal += 1;
        Some(passage)
    }
}

impl<'a> Iterator for Passages<'a> {
    type Item = Passage;

    fn next(&mut self) -> Option<Passage> {
        loop {
            if self.ready.len() > 1 || (self.exhausted && !self.ready.is_empty()) {
                let (text, heading) = self.ready.pop_front()?;
                match self.make(text, heading) {
                    Some(passage) => return Some(passage),
                    None => continue,
                }
            }
            if self.exhausted {
                return None;
            }
            match self.segments.next() {
                Some(segment) => self.push_segment(segment),
                None => {
                    self.finish();
                    self.exhausted = true;
                }
            }
        }
    }
}

/// A structural unit of the source text.
struct Segment {
    text: String,
    heading: Option<String>,
}

/// Lazy segmentation over lines: paragraphs, heading-led sections, and
/// atomic code fences.
struct Segments<'a> {
    lines: Lines<'a>,
    heading: Option<String>,
    carry: Option<&'a str>,
}

impl<'a> Segments<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            lines: text.lines(),
            heading: None,
            carry: None,
        }
    }
}

impl<'a> Iterator for Segments<'a> {
    type Item = Segment;

    fn next(&mut self) -> Option<Segment> {
        let mut buf: Vec<&str> = Vec::new();
        let mut in_fence = false;

        if let Some(line) = self.carry.take() {
            self.heading = heading_text(line.trim());
            buf.push(line);
        }
        let mut segment_heading = self.heading.clone();

        for line in self.lines.by_ref() {
            let trimmed = line.trim();
            if trimmed.starts_with("```") {
                in_fence = !in_fence;
                buf.push(line);
                continue;
            }
            if in_fence {
                buf.push(line);
                continue;
            }
            if trimmed.is_empty() {
                if buf.is_empty() {
                    continue;
                }
                break;
            }
            if let Some(heading) = heading_text(trimmed) {
                if buf.is_empty() {
                    self.heading = Some(heading);
                    segment_heading = self.heading.clone();
                    buf.push(line);
                    continue;
                }
                self.carry = Some(line);
                break;
            }
            buf.push(line);
        }

        if buf.is_empty() {
            return None;
        }
        Some(Segment {
            text: buf.join("\n").trim().to_string(),
            heading: segment_heading,
        })
    }
}

/// Returns the heading text when `line` is an ATX markdown heading.
fn heading_text(line: &str) -> Option<String> {
    let hashes = line.bytes().take_while(|b| *b == b'#').count();
    if hashes == 0 || hashes > 6 {
        return None;
    }
    let rest = &line[hashes..];
    if !rest.starts_with(' ') {
        return None;
    }
    let title = rest.trim();
    if title.is_empty() {
        None
    } else {
        Some(title.to_string())
    }
}

/// Pick the byte offset at which to cut an oversized candidate.
///
/// Always returns a char boundary in `1..=max` (or the first char boundary
/// when `max` falls inside the first character).
fn find_cut(text: &str, max: usize, lookahead: usize) -> usize {
    let limit = snap_to_char_boundary(text, max);
    let floor = snap_to_char_boundary(text, max.saturating_sub(lookahead));
    let window = &text[floor..limit];

    if let Some(pos) = window.rfind("\n\n") {
        if floor + pos > 0 {
            return floor + pos;
        }
    }

    let bytes = text.as_bytes();
    for (i, b) in window.bytes().enumerate().rev() {
        if matches!(b, b'.' | b'!' | b'?') {
            let after = floor + i + 1;
            let followed_by_space = bytes
                .get(after)
                .map(|c| c.is_ascii_whitespace())
                .unwrap_or(true);
            if followed_by_space {
                return after;
            }
        }
    }

    if limit > 0 {
        limit
    } else {
        text.char_indices()
            .nth(1)
            .map(|(i, _)| i)
            .unwrap_or(text.len())
    }
}

/// Snap a byte index back to the nearest valid UTF-8 char boundary.
fn snap_to_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    let mut i = index;
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config() -> ChunkConfig {
        ChunkConfig {
            min_chars: 40,
            max_chars: 120,
            lookahead_chars: 60,
            min_viable_chars: 10,
        }
    }

    fn texts(passages: &[Passage]) -> Vec<&str> {
        passages.iter().map(|p| p.text()).collect()
    }

    #[test]
    fn test_small_text_single_passage() {
        let passages: Vec<_> =
            chunk("doc1", "Hello, world! This is a tiny page.", &small_config()).collect();
        assert_eq!(passages.len(), 1);
        assert_eq!(passages[0].ordinal(), 0);
        assert_eq!(passages[0].block_id().as_str(), "doc1-block-0");
        assert_eq!(passages[0].text(), "Hello, world! This is a tiny page.");
    }

    #[test]
    fn test_empty_text_yields_nothing() {
        assert_eq!(chunk("doc1", "", &small_config()).count(), 0);
        assert_eq!(chunk("doc1", "   \n\n  ", &small_config()).count(), 0);
    }

    #[test]
    fn test_below_min_viable_yields_nothing() {
        assert_eq!(chunk("doc1", "tiny", &small_config()).count(), 0);
    }

    #[test]
    fn test_small_paragraphs_are_merged() {
        let text = "Alpha one.\n\nBeta two.\n\nGamma three.\n\nDelta four.";
        let passages: Vec<_> = chunk("doc1", text, &small_config()).collect();
        assert_eq!(passages.len(), 1);
        assert!(passages[0].text().contains("Alpha one."));
        assert!(passages[0].text().contains("Delta four."));
    }

    #[test]
    fn test_long_paragraph_split_at_sentence() {
        let sentence = "The quick brown fox jumps over the lazy dog.";
        let text = vec![sentence; 8].join(" ");
        let passages: Vec<_> = chunk("doc1", &text, &small_config()).collect();
        assert!(passages.len() > 1);
        for p in &passages {
            assert!(p.text().len() <= 120, "too long: {}", p.text().len());
            assert!(p.text().ends_with('.'), "not cut at sentence: {:?}", p.text());
        }
    }

    #[test]
    fn test_hard_cut_without_boundary() {
        let text = "x".repeat(300);
        let passages: Vec<_> = chunk("doc1", &text, &small_config()).collect();
        assert!(passages.len() >= 3);
        for p in &passages {
            assert!(p.text().len() <= 120);
        }
        let joined: String = passages.iter().map(|p| p.text()).collect();
        assert_eq!(joined, text);
    }

    #[test]
    fn test_heading_starts_segment_and_sets_metadata() {
        let body = "Words about setup that go on for a while to fill the floor.";
        let text = format!("# Setup\n{}\n## Usage\n{}", body, body);
        let passages: Vec<_> = chunk("doc1", &text, &small_config()).collect();
        assert_eq!(passages.len(), 2);
        assert_eq!(passages[0].heading(), Some("Setup"));
        assert!(passages[0].text().starts_with("# Setup"));
        assert_eq!(passages[1].heading(), Some("Usage"));
        assert!(passages[1].text().starts_with("## Usage"));
    }

    #[test]
    fn test_code_fence_is_atomic() {
        let text = "Intro paragraph that is long enough to stand alone here.\n\n```rust\nfn a() {}\n\nfn b() {}\n```\n\nOutro paragraph that is also long enough to stand alone.";
        let passages: Vec<_> = chunk("doc1", text, &small_config()).collect();
        let with_fence: Vec<_> = passages
            .iter()
            .filter(|p| p.text().contains("```rust"))
            .collect();
        assert_eq!(with_fence.len(), 1);
        assert!(with_fence[0].text().contains("fn a() {}\n\nfn b() {}"));
    }

    #[test]
    fn test_block_numbers_start_at_offset() {
        let text = (0..20)
            .map(|i| format!("Paragraph number {} has several words in it.", i))
            .collect::<Vec<_>>()
            .join("\n\n");
        let chunker = Chunker::new(small_config());
        let passages: Vec<_> = chunker.chunk("doc1", &text, 5).collect();
        for (i, p) in passages.iter().enumerate() {
            assert_eq!(p.ordinal(), i as u32);
            assert_eq!(p.block_id().number(), 5 + i as u64);
        }
    }

    #[test]
    fn test_next_block_is_high_water_mark() {
        let text = "y".repeat(500);
        let chunker = Chunker::new(small_config());
        let mut iter = chunker.chunk("doc1", &text, 3);
        let count = iter.by_ref().count() as u64;
        assert_eq!(iter.next_block(), 3 + count);
    }

    #[test]
    fn test_tail_folded_into_previous() {
        let long = "Sentence that keeps going with content. ".repeat(2);
        let text = format!("{}\n\nEnd.", long.trim());
        let passages: Vec<_> = chunk("doc1", &text, &small_config()).collect();
        assert_eq!(passages.len(), 1);
        assert!(passages[0].text().ends_with("End."));
    }

    #[test]
    fn test_deterministic() {
        let text = "Alpha section text.\n\nBeta section text that is a bit longer than alpha.\n\n# Gamma\n\nDelta paragraph closing out the document with detail.";
        let a: Vec<_> = chunk("doc1", text, &small_config()).collect();
        let b: Vec<_> = chunk("doc1", text, &small_config()).collect();
        assert_eq!(a, b);
        assert_eq!(texts(&a), texts(&b));
    }

    #[test]
    fn test_multibyte_utf8_chars() {
        let text = "┌──────────────────┐\n│ Hello world      │\n└──────────────────┘".repeat(5);
        let passages: Vec<_> = chunk("doc1", &text, &small_config()).collect();
        assert!(!passages.is_empty());
        for p in &passages {
            assert!(p.text().len() <= 120);
        }
    }

    #[test]
    fn test_config_validation() {
        assert!(ChunkConfig::default().validate().is_ok());
        let bad = ChunkConfig {
            min_chars: 500,
            max_chars: 100,
            ..ChunkConfig::default()
        };
        assert!(bad.validate().is_err());
        let bad_lookahead = ChunkConfig {
            lookahead_chars: 1200,
            ..ChunkConfig::default()
        };
        assert!(bad_lookahead.validate().is_err());
    }

    #[test]
    fn test_find_cut_prefers_paragraph_break() {
        let text = format!("{}\n\n{}", "a".repeat(80), "b".repeat(80));
        let cut = find_cut(&text, 120, 60);
        assert_eq!(cut, 80);
    }
}
