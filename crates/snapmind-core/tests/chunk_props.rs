use proptest::prelude::*;

use snapmind_core::chunk::{ChunkConfig, Chunker};

fn config() -> ChunkConfig {
    ChunkConfig {
        min_chars: 50,
        max_chars: 300,
        lookahead_chars: 80,
        min_viable_chars: 1,
    }
}

fn squeeze(text: &str) -> String {
    text.chars().filter(|c| !c.is_whitespace()).collect()
}

fn document() -> impl Strategy<Value = String> {
    let paragraph = prop_oneof![
        "[a-zé]{1,14}( [a-zé]{1,14}){0,60}[.!?]?",
        "# [A-Z][a-z]{2,10}",
        "[a-z]{200,400}",
    ];
    prop::collection::vec(paragraph, 1..16).prop_map(|parts| parts.join("\n\n"))
}

proptest! {
    #[test]
    fn passages_respect_ceiling(text in document()) {
        let chunker = Chunker::new(config());
        for passage in chunker.chunk("doc-p", &text, 0) {
            prop_assert!(passage.text().len() <= 300, "passage of {} bytes", passage.text().len());
            prop_assert!(!passage.text().trim().is_empty());
        }
    }

    #[test]
    fn chunking_is_deterministic(text in document()) {
        let chunker = Chunker::new(config());
        let a: Vec<_> = chunker.chunk("doc-p", &text, 0).collect();
        let b: Vec<_> = chunker.chunk("doc-p", &text, 0).collect();
        prop_assert_eq!(a, b);
    }

    #[test]
    fn passages_cover_input_in_order(text in document()) {
        let chunker = Chunker::new(config());
        let joined: String = chunker
            .chunk("doc-p", &text, 0)
            .map(|p| p.text().to_string())
            .collect();
        prop_assert_eq!(squeeze(&joined), squeeze(&text));
    }

    #[test]
    fn block_numbers_continue_from_high_water_mark(text in document(), first in 0u64..1000) {
        let chunker = Chunker::new(config());
        let mut passages = chunker.chunk("doc-p", &text, first);
        let numbers: Vec<u64> = passages.by_ref().map(|p| p.block_id().number()).collect();
        let expected: Vec<u64> = (first..first + numbers.len() as u64).collect();
        prop_assert_eq!(&numbers, &expected);
        prop_assert_eq!(passages.next_block(), first + numbers.len() as u64);
    }
}
