//! `snap ask`: grounded question answering from the command line.

use anyhow::Result;
use std::io::Write;
use std::sync::Arc;
use tokio::sync::mpsc;

use snapmind_core::store::Store;

use crate::cancel::CancellationToken;
use crate::config::Config;
use crate::db;
use crate::embedding::create_embedder;
use crate::generation::create_generator;
use crate::orchestrator::{AskOutcome, AskRequest, QueryOrchestrator, ResponseMode, StreamEvent};
use crate::search::snippet;

pub async fn run_ask(
    config: &Config,
    question: &str,
    document_id: Option<String>,
    stream: bool,
) -> Result<()> {
    let store = Arc::new(db::open_store(config).await?);
    let orchestrator = QueryOrchestrator::new(
        store.clone() as Arc<dyn Store>,
        create_embedder(&config.embedding)?,
        create_generator(&config.generation)?,
        config,
    );

    let request = AskRequest {
        question: question.to_string(),
        document_id,
        history: Vec::new(),
        params: config.fusion_params()?,
    };

    // Ctrl-C cancels the turn; retrieval results are still printed.
    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            signal_cancel.cancel();
        }
    });

    let outcome = if stream {
        let (tx, mut rx) = mpsc::channel(64);
        let printer = tokio::spawn(async move {
            let mut stdout = std::io::stdout();
            while let Some(event) = rx.recv().await {
                if let StreamEvent::Token { text } = event {
                    let _ = write!(stdout, "{}", text);
                    let _ = stdout.flush();
                }
            }
        });
        let outcome = orchestrator
            .ask(&request, ResponseMode::Streaming(tx), &cancel)
            .await;
        let _ = printer.await;
        println!();
        outcome?
    } else {
        orchestrator
            .ask(&request, ResponseMode::Buffered, &cancel)
            .await?
    };
    store.close().await;

    match outcome {
        AskOutcome::Answered(answer) => {
            if !stream {
                println!("{}", answer.text);
            }
            if answer.grounding.degraded {
                eprintln!("Warning: answer was grounded on a degraded (single-strategy) search.");
            }
            println!();
            println!("--- Citations ({}) ---", answer.citations.len());
            for citation in &answer.citations {
                match &citation.passage {
                    Some(passage) => {
                        println!("{} {}", citation.marker, snippet(&passage.text, 120))
                    }
                    None => println!("{} (unverified: not in context)", citation.marker),
                }
            }
        }
        AskOutcome::Unanswered {
            grounding, error, ..
        } => {
            eprintln!("Warning: no answer generated: {}", error);
            println!("--- Retrieved context ({} passages) ---", grounding.context.len());
            for (marker, passage) in grounding.context.markers().zip(grounding.context.passages()) {
                println!("{} {}", marker, snippet(&passage.text, 120));
            }
        }
    }

    Ok(())
}
