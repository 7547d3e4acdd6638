//! `snap search`: hybrid search from the command line.

use anyhow::{Context, Result};
use std::sync::Arc;

use snapmind_core::fusion::SearchMode;
use snapmind_core::store::Store;

use crate::cancel::CancellationToken;
use crate::config::Config;
use crate::db;
use crate::embedding::create_embedder;
use crate::generation::DisabledGenerator;
use crate::orchestrator::QueryOrchestrator;
use crate::retrieval::{Degradation, SearchRequest};

/// Run a search and print the ranked passages.
pub async fn run_search(
    config: &Config,
    query: &str,
    mode: Option<&str>,
    top_k: Option<usize>,
    document_id: Option<String>,
) -> Result<()> {
    let mut params = config.fusion_params()?;
    if let Some(mode) = mode {
        params.mode = mode.parse::<SearchMode>()?;
    }
    if let Some(top_k) = top_k {
        params.top_k = top_k;
    }

    let store = Arc::new(db::open_store(config).await?);
    let embedder = create_embedder(&config.embedding)?;
    let orchestrator = QueryOrchestrator::new(
        store.clone() as Arc<dyn Store>,
        embedder,
        Arc::new(DisabledGenerator),
        config,
    );

    let request = SearchRequest {
        query: query.to_string(),
        document_id,
        params,
    };
    let outcome = orchestrator
        .search(&request, &CancellationToken::new())
        .await
        .context("search failed")?;
    store.close().await;

    if let Some(degradation) = &outcome.degradation {
        match degradation {
            Degradation::Vector(reason) => {
                eprintln!(
                    "Warning: semantic search unavailable ({}); results are keyword-only.",
                    reason
                )
            }
            Degradation::Lexical(reason) => {
                eprintln!(
                    "Warning: keyword search unavailable ({}); results are semantic-only.",
                    reason
                )
            }
        }
    }

    if outcome.results.is_empty() {
        println!("No results.");
        return Ok(());
    }

    for (i, result) in outcome.results.iter().enumerate() {
        println!(
            "{}. [{:.3}] {}",
            i + 1,
            result.combined_score,
            result.block_id
        );
        println!(
            "    vector: {:.3}  keyword: {:.3}",
            result.vector_score, result.lexical_score
        );
        if let Some(heading) = &result.heading {
            println!("    heading: {}", heading);
        }
        println!("    {}", snippet(&result.text, 200));
        println!();
    }

    Ok(())
}

/// First `max` characters of `text` on one line.
pub fn snippet(text: &str, max: usize) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    match flat.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &flat[..idx]),
        None => flat,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snippet_flattens_and_truncates() {
        assert_eq!(snippet("a\n\nb  c", 10), "a b c");
        assert_eq!(snippet("abcdef", 3), "abc...");
        assert_eq!(snippet("héllo wörld", 4), "héll...");
    }
}
