//! Per-question coordination: gate, retrieve, assemble, generate, respond.
//!
//! A turn moves through [`TurnState`]s in order. `Gathering` checks that
//! the requested scope has indexed passages and stops the turn with
//! [`Error::NotIndexed`] when it has none. Retrieval and assembly failures
//! fail the turn; a generation failure, timeout, or cancellation does not
//! discard what retrieval produced and yields [`AskOutcome::Unanswered`]
//! carrying the grounding instead.
//!
//! Buffered and streaming turns share the same retrieval and assembly; a
//! streaming turn emits [`StreamEvent::Citations`] before any text.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use snapmind_core::citation::{
    assemble_context, extract_citations, AssembledContext, Citation, ContextBudget,
};
use snapmind_core::embedding::Embedder;
use snapmind_core::error::{Error, Result};
use snapmind_core::fusion::FusionParams;
use snapmind_core::models::{BlockId, FusedResult};
use snapmind_core::store::Store;

use crate::cache::SemanticCache;
use crate::cancel::CancellationToken;
use crate::config::Config;
use crate::generation::{ChatMessage, GenerationRequest, Generator};
use crate::retrieval::{Degradation, RetrievalEngine, SearchOutcome, SearchRequest};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnState {
    Gathering,
    Retrieving,
    Assembling,
    Generating,
    Responding,
}

impl TurnState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TurnState::Gathering => "gathering",
            TurnState::Retrieving => "retrieving",
            TurnState::Assembling => "assembling",
            TurnState::Generating => "generating",
            TurnState::Responding => "responding",
        }
    }
}

impl fmt::Display for TurnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct AskRequest {
    pub question: String,
    pub document_id: Option<String>,
    pub history: Vec<ChatMessage>,
    pub params: FusionParams,
}

/// How the answer is delivered.
pub enum ResponseMode {
    /// The full answer is returned once generation finishes.
    Buffered,
    /// Events are sent as the turn progresses; the outcome is still
    /// returned at the end.
    Streaming(mpsc::Sender<StreamEvent>),
}

/// What retrieval produced for a turn.
#[derive(Debug, Clone, Serialize)]
pub struct Grounding {
    pub results: Vec<FusedResult>,
    pub context: AssembledContext,
    pub degraded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub degradation: Option<Degradation>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Answer {
    pub text: String,
    pub citations: Vec<Citation>,
    /// Markers in `text` that name no passage of this turn's context.
    pub unverified: usize,
    pub grounding: Grounding,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AskOutcome {
    Answered(Answer),
    /// Generation did not complete. Retrieval results are still surfaced.
    Unanswered {
        grounding: Grounding,
        stage: TurnState,
        error: String,
    },
}

/// A passage as announced at the start of a streamed answer.
#[derive(Debug, Clone, Serialize)]
pub struct CitedPassage {
    pub marker: String,
    pub block_id: BlockId,
    pub document_id: String,
    pub heading: Option<String>,
    pub combined_score: f64,
}

/// One NDJSON line of a streamed answer.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Citations {
        passages: Vec<CitedPassage>,
        degraded: bool,
    },
    Token {
        text: String,
    },
    Done {
        citations: Vec<Citation>,
        unverified: usize,
    },
    Error {
        code: String,
        message: String,
    },
    NotIndexed {
        scope: String,
    },
}

impl StreamEvent {
    fn citations(grounding: &Grounding) -> Self {
        let passages = grounding
            .context
            .markers()
            .zip(grounding.context.passages())
            .map(|(marker, passage)| CitedPassage {
                marker: marker.to_string(),
                block_id: passage.block_id.clone(),
                document_id: passage.document_id.clone(),
                heading: passage.heading.clone(),
                combined_score: passage.combined_score,
            })
            .collect();
        StreamEvent::Citations {
            passages,
            degraded: grounding.degraded,
        }
    }
}

/// Machine-readable code for an error, shared by the HTTP and stream
/// surfaces.
pub fn error_code(err: &Error) -> &'static str {
    match err {
        Error::NotIndexed { .. } => "not_indexed",
        Error::Timeout { .. } => "timeout",
        Error::Cancelled => "cancelled",
        Error::InvalidWeights(_)
        | Error::InvalidBlockId(_)
        | Error::InvalidPassage(_)
        | Error::Acquisition(_) => "bad_request",
        _ => "internal",
    }
}

pub struct QueryOrchestrator {
    retrieval: RetrievalEngine,
    generator: Arc<dyn Generator>,
    budget: ContextBudget,
    generation_timeout: Duration,
}

impl QueryOrchestrator {
    pub fn new(
        store: Arc<dyn Store>,
        embedder: Arc<dyn Embedder>,
        generator: Arc<dyn Generator>,
        config: &Config,
    ) -> Self {
        Self {
            retrieval: RetrievalEngine::new(store, embedder, config),
            generator,
            budget: config.context_budget(),
            generation_timeout: Duration::from_secs(config.generation.timeout_secs),
        }
    }

    /// Serve repeated and paraphrased searches from `cache`.
    pub fn with_cache(mut self, cache: Arc<SemanticCache>) -> Self {
        self.retrieval = self.retrieval.with_cache(cache);
        self
    }

    /// Gated search without generation.
    pub async fn search(
        &self,
        request: &SearchRequest,
        cancel: &CancellationToken,
    ) -> Result<SearchOutcome> {
        self.gather(request.document_id.as_deref()).await?;
        self.retrieval.search(request, cancel).await
    }

    /// Run one question-answering turn.
    ///
    /// Returns [`Error::NotIndexed`] when the scope has no indexed
    /// passages. In streaming mode the same condition is also announced as
    /// a [`StreamEvent::NotIndexed`] event.
    pub async fn ask(
        &self,
        request: &AskRequest,
        mode: ResponseMode,
        cancel: &CancellationToken,
    ) -> Result<AskOutcome> {
        let events = match &mode {
            ResponseMode::Buffered => None,
            ResponseMode::Streaming(tx) => Some(tx.clone()),
        };

        let result = self.run_turn(request, events.as_ref(), cancel).await;

        if let (Some(tx), Err(err)) = (&events, &result) {
            let event = match err {
                Error::NotIndexed { scope } => StreamEvent::NotIndexed {
                    scope: scope.clone(),
                },
                other => StreamEvent::Error {
                    code: error_code(other).to_string(),
                    message: other.to_string(),
                },
            };
            let _ = tx.send(event).await;
        }
        result
    }

    async fn run_turn(
        &self,
        request: &AskRequest,
        events: Option<&mpsc::Sender<StreamEvent>>,
        cancel: &CancellationToken,
    ) -> Result<AskOutcome> {
        let scope = request.document_id.as_deref();

        enter(TurnState::Gathering);
        self.gather(scope).await?;

        enter(TurnState::Retrieving);
        let search = SearchRequest {
            query: request.question.clone(),
            document_id: request.document_id.clone(),
            params: request.params.clone(),
        };
        let outcome = self.retrieval.search(&search, cancel).await?;

        enter(TurnState::Assembling);
        let context = assemble_context(&outcome.results, &self.budget);
        let grounding = Grounding {
            results: outcome.results,
            context,
            degraded: outcome.degraded,
            degradation: outcome.degradation,
        };
        if let Some(tx) = events {
            let _ = tx.send(StreamEvent::citations(&grounding)).await;
        }

        enter(TurnState::Generating);
        let generation = GenerationRequest {
            context: grounding.context.text().to_string(),
            question: request.question.clone(),
            history: request.history.clone(),
        };
        let generated = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            text = self.generate(&generation, events) => text,
        };

        let text = match generated {
            Ok(text) => text,
            Err(err) => {
                warn!(error = %err, "generation failed, returning retrieval results only");
                if let Some(tx) = events {
                    let _ = tx
                        .send(StreamEvent::Error {
                            code: error_code(&err).to_string(),
                            message: err.to_string(),
                        })
                        .await;
                }
                return Ok(AskOutcome::Unanswered {
                    grounding,
                    stage: TurnState::Generating,
                    error: err.to_string(),
                });
            }
        };

        enter(TurnState::Responding);
        let citations = extract_citations(&text, &grounding.context);
        let unverified = citations.iter().filter(|c| !c.is_verified()).count();
        if unverified > 0 {
            warn!(unverified, "answer cites blocks outside its context");
        }
        info!(
            citations = citations.len(),
            unverified,
            degraded = grounding.degraded,
            "question answered"
        );

        if let Some(tx) = events {
            let _ = tx
                .send(StreamEvent::Done {
                    citations: citations.clone(),
                    unverified,
                })
                .await;
        }

        Ok(AskOutcome::Answered(Answer {
            text,
            citations,
            unverified,
            grounding,
        }))
    }

    async fn gather(&self, scope: Option<&str>) -> Result<()> {
        let indexed = self.retrieval.indexed_passages(scope).await?;
        if indexed == 0 {
            let scope = scope.unwrap_or("all documents").to_string();
            info!(scope = %scope, "nothing indexed for scope");
            return Err(Error::NotIndexed { scope });
        }
        Ok(())
    }

    async fn generate(
        &self,
        request: &GenerationRequest,
        events: Option<&mpsc::Sender<StreamEvent>>,
    ) -> Result<String> {
        let limit = self.generation_timeout;
        let timed_out = || Error::Timeout {
            operation: "generation",
            millis: limit.as_millis() as u64,
        };

        let Some(events) = events else {
            return tokio::time::timeout(limit, self.generator.generate(request))
                .await
                .map_err(|_| timed_out())?;
        };

        let (tx, mut rx) = mpsc::channel::<String>(64);
        let produce = async {
            tokio::time::timeout(limit, self.generator.generate_stream(request, tx))
                .await
                .map_err(|_| timed_out())?
        };
        let forward = async {
            while let Some(text) = rx.recv().await {
                if events.send(StreamEvent::Token { text }).await.is_err() {
                    break;
                }
            }
        };
        let (result, ()) = tokio::join!(produce, forward);
        result
    }
}

fn enter(state: TurnState) {
    debug!(state = %state, "turn state");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(
            error_code(&Error::NotIndexed {
                scope: "doc-x".into()
            }),
            "not_indexed"
        );
        assert_eq!(
            error_code(&Error::Timeout {
                operation: "generation",
                millis: 5
            }),
            "timeout"
        );
        assert_eq!(error_code(&Error::InvalidWeights("neg".into())), "bad_request");
        assert_eq!(error_code(&Error::Storage("io".into())), "internal");
    }

    #[test]
    fn test_stream_event_tags() {
        let json = serde_json::to_value(StreamEvent::Token { text: "hi".into() }).unwrap();
        assert_eq!(json["type"], "token");
        assert_eq!(json["text"], "hi");
        let json = serde_json::to_value(StreamEvent::NotIndexed {
            scope: "doc-a".into(),
        })
        .unwrap();
        assert_eq!(json["type"], "not_indexed");
    }
}
