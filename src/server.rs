//! HTTP API.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/documents` | Submit text (and optional source address) for indexing |
//! | `GET`  | `/documents` | List documents |
//! | `GET`  | `/documents/{id}` | One document with its indexed passages |
//! | `DELETE` | `/documents/{id}` | Delete a document and both of its index entries |
//! | `POST` | `/search` | Hybrid search without generation |
//! | `POST` | `/ask` | Buffered answer with resolved citations |
//! | `POST` | `/ask/stream` | Streamed answer as NDJSON events |
//! | `GET`  | `/health` | Health check (version, and cache counters when enabled) |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "not_indexed", "message": "nothing indexed for scope doc-1a2b" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `not_indexed` (409),
//! `timeout` (408), `internal` (500).
//!
//! # Streaming
//!
//! `POST /ask/stream` answers with `application/x-ndjson`. The first event
//! is `citations` (or `not_indexed`), followed by `token` events and a final
//! `done` or `error`. Closing the connection cancels the turn.
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted for browser clients.

use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use futures_util::stream;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::mpsc;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use snapmind_core::embedding::Embedder;
use snapmind_core::error::Error;
use snapmind_core::fusion::{FusionParams, FusionWeights, SearchMode};
use snapmind_core::models::{BlockId, IndexStatus};
use snapmind_core::store::{DocumentSummary, Store};

use crate::cache::{CacheStats, SemanticCache};
use crate::cancel::CancellationToken;
use crate::config::Config;
use crate::db;
use crate::embedding::create_embedder;
use crate::generation::{create_generator, ChatMessage, Generator};
use crate::ingest::{IngestReport, Ingestor};
use crate::orchestrator::{error_code, AskOutcome, AskRequest, QueryOrchestrator, ResponseMode};
use crate::retrieval::{SearchOutcome, SearchRequest};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    config: Arc<Config>,
    store: Arc<dyn Store>,
    ingestor: Arc<Ingestor>,
    orchestrator: Arc<QueryOrchestrator>,
    cache: Option<Arc<SemanticCache>>,
}

impl AppState {
    /// Wire the engine over `store`. When `[cache]` is enabled, one semantic
    /// cache is shared by search and invalidated by submissions and deletes.
    pub fn new(
        config: &Config,
        store: Arc<dyn Store>,
        embedder: Arc<dyn Embedder>,
        generator: Arc<dyn Generator>,
    ) -> Self {
        let cache = SemanticCache::from_config(&config.cache);
        let mut ingestor = Ingestor::new(store.clone(), embedder.clone(), config);
        let mut orchestrator = QueryOrchestrator::new(store.clone(), embedder, generator, config);
        if let Some(cache) = &cache {
            ingestor = ingestor.with_cache(cache.clone());
            orchestrator = orchestrator.with_cache(cache.clone());
        }
        Self {
            config: Arc::new(config.clone()),
            store,
            ingestor: Arc::new(ingestor),
            orchestrator: Arc::new(orchestrator),
            cache,
        }
    }
}

/// Build the router over `state`.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/documents", post(handle_submit).get(handle_list))
        .route(
            "/documents/{id}",
            get(handle_get_document).delete(handle_delete),
        )
        .route("/search", post(handle_search))
        .route("/ask", post(handle_ask))
        .route("/ask/stream", post(handle_ask_stream))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(state)
}

/// Starts the HTTP server on `[server].bind` over the SQLite store.
///
/// Runs until the process is terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let store: Arc<dyn Store> = Arc::new(db::open_store(config).await?);
    let embedder = create_embedder(&config.embedding)?;
    let generator = create_generator(&config.generation)?;
    let app = router(AppState::new(config, store, embedder, generator));

    let bind_addr = config.server.bind.clone();
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!(bind = %bind_addr, "server listening");
    println!("Snapmind server listening on http://{}", bind_addr);
    axum::serve(listener, app).await?;

    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request",
        message: message.into(),
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found",
        message: message.into(),
    }
}

fn internal(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal",
        message: message.into(),
    }
}

impl From<Error> for AppError {
    fn from(err: Error) -> Self {
        let message = err.to_string();
        match error_code(&err) {
            "not_indexed" => AppError {
                status: StatusCode::CONFLICT,
                code: "not_indexed",
                message,
            },
            "timeout" => AppError {
                status: StatusCode::REQUEST_TIMEOUT,
                code: "timeout",
                message,
            },
            "bad_request" => bad_request(message),
            _ => internal(message),
        }
    }
}

// ============ Query options ============

/// Per-call overrides of the `[retrieval]` defaults.
#[derive(Debug, Default, Deserialize)]
struct QueryOptions {
    #[serde(default)]
    mode: Option<String>,
    #[serde(default)]
    top_k: Option<usize>,
    #[serde(default)]
    vector_weight: Option<f64>,
    #[serde(default)]
    keyword_weight: Option<f64>,
}

impl QueryOptions {
    fn params(&self, config: &Config) -> Result<FusionParams, AppError> {
        let mut params = config
            .fusion_params()
            .map_err(|e| internal(format!("{:#}", e)))?;
        if let Some(mode) = &self.mode {
            params.mode = mode
                .parse::<SearchMode>()
                .map_err(|e| bad_request(e.to_string()))?;
        }
        if let Some(top_k) = self.top_k {
            params.top_k = top_k;
        }
        if self.vector_weight.is_some() || self.keyword_weight.is_some() {
            params.weights = FusionWeights::new(
                self.vector_weight.unwrap_or(params.weights.vector()),
                self.keyword_weight.unwrap_or(params.weights.keyword()),
            )?;
        }
        params.validate()?;
        Ok(params)
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    cache: Option<CacheStats>,
}

async fn handle_health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        cache: state.cache.as_ref().map(|cache| cache.stats()),
    })
}

// ============ /documents ============

#[derive(Deserialize)]
struct SubmitRequest {
    text: String,
    #[serde(default)]
    url: Option<String>,
}

async fn handle_submit(
    State(state): State<AppState>,
    Json(req): Json<SubmitRequest>,
) -> Result<Json<IngestReport>, AppError> {
    let report = state
        .ingestor
        .submit(&req.text, req.url.as_deref(), &CancellationToken::new())
        .await?;
    Ok(Json(report))
}

#[derive(Serialize)]
struct DocumentList {
    documents: Vec<DocumentSummary>,
}

async fn handle_list(State(state): State<AppState>) -> Result<Json<DocumentList>, AppError> {
    let documents = state.store.list_documents().await?;
    Ok(Json(DocumentList { documents }))
}

#[derive(Serialize)]
struct DocumentView {
    id: String,
    source_url: Option<String>,
    status: IndexStatus,
    ingested_at: DateTime<Utc>,
    content_hash: String,
    passages: Vec<PassageView>,
}

#[derive(Serialize)]
struct PassageView {
    block_id: BlockId,
    ordinal: u32,
    heading: Option<String>,
    text: String,
}

async fn handle_get_document(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<DocumentView>, AppError> {
    let doc = state
        .store
        .get_document(&id)
        .await?
        .ok_or_else(|| not_found(format!("document not found: {}", id)))?;
    let passages = state
        .store
        .list_passages(&id)
        .await?
        .into_iter()
        .map(|p| PassageView {
            block_id: p.block_id().clone(),
            ordinal: p.ordinal(),
            heading: p.heading().map(str::to_string),
            text: p.text().to_string(),
        })
        .collect();
    Ok(Json(DocumentView {
        id: doc.id,
        source_url: doc.source_url,
        status: doc.status,
        ingested_at: doc.ingested_at,
        content_hash: doc.content_hash,
        passages,
    }))
}

async fn handle_delete(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    if !state.store.delete_document(&id).await? {
        return Err(not_found(format!("document not found: {}", id)));
    }
    if let Some(cache) = &state.cache {
        cache.invalidate();
    }
    info!(document_id = %id, "document deleted");
    Ok(Json(serde_json::json!({ "deleted": id })))
}

// ============ POST /search ============

#[derive(Deserialize)]
struct SearchBody {
    query: String,
    #[serde(default)]
    document_id: Option<String>,
    #[serde(flatten)]
    options: QueryOptions,
}

async fn handle_search(
    State(state): State<AppState>,
    Json(body): Json<SearchBody>,
) -> Result<Json<SearchOutcome>, AppError> {
    if body.query.trim().is_empty() {
        return Err(bad_request("query must not be empty"));
    }
    let request = SearchRequest {
        params: body.options.params(&state.config)?,
        query: body.query,
        document_id: body.document_id,
    };
    let outcome = state
        .orchestrator
        .search(&request, &CancellationToken::new())
        .await?;
    Ok(Json(outcome))
}

// ============ POST /ask, /ask/stream ============

#[derive(Deserialize)]
struct AskBody {
    question: String,
    #[serde(default)]
    document_id: Option<String>,
    #[serde(default)]
    history: Vec<ChatMessage>,
    #[serde(flatten)]
    options: QueryOptions,
}

impl AskBody {
    fn into_request(self, config: &Config) -> Result<AskRequest, AppError> {
        if self.question.trim().is_empty() {
            return Err(bad_request("question must not be empty"));
        }
        Ok(AskRequest {
            params: self.options.params(config)?,
            question: self.question,
            document_id: self.document_id,
            history: self.history,
        })
    }
}

async fn handle_ask(
    State(state): State<AppState>,
    Json(body): Json<AskBody>,
) -> Result<Json<AskOutcome>, AppError> {
    let request = body.into_request(&state.config)?;
    let outcome = state
        .orchestrator
        .ask(&request, ResponseMode::Buffered, &CancellationToken::new())
        .await?;
    Ok(Json(outcome))
}

/// Cancels the turn when the response stream is dropped.
struct CancelOnDrop(CancellationToken);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

async fn handle_ask_stream(
    State(state): State<AppState>,
    Json(body): Json<AskBody>,
) -> Result<Response, AppError> {
    let request = body.into_request(&state.config)?;
    let cancel = CancellationToken::new();
    let (tx, rx) = mpsc::channel(64);

    let orchestrator = state.orchestrator.clone();
    let turn_cancel = cancel.clone();
    tokio::spawn(async move {
        // Failures have already been sent as events.
        let _ = orchestrator
            .ask(&request, ResponseMode::Streaming(tx), &turn_cancel)
            .await;
    });

    let events = stream::unfold((rx, CancelOnDrop(cancel)), |(mut rx, guard)| async move {
        let event = rx.recv().await?;
        let mut line = serde_json::to_string(&event).unwrap_or_else(|e| {
            format!(
                r#"{{"type":"error","code":"internal","message":"{}"}}"#,
                e.to_string().replace('"', "'")
            )
        });
        line.push('\n');
        Some((Ok::<_, Infallible>(line), (rx, guard)))
    });

    Ok((
        [(header::CONTENT_TYPE, "application/x-ndjson")],
        Body::from_stream(events),
    )
        .into_response())
}
