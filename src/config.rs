//! TOML configuration.
//!
//! Every section except `[db]` is optional and falls back to the defaults
//! below. [`load_config`] parses and validates; the typed views
//! ([`Config::chunk_config`], [`Config::fusion_params`],
//! [`Config::context_budget`]) are what the engine components consume.
//!
//! ```toml
//! [db]
//! path = "./data/snapmind.sqlite"
//!
//! [retrieval]
//! top_k = 10
//! vector_weight = 0.7
//! keyword_weight = 0.3
//!
//! [embedding]
//! provider = "openai"
//! model = "text-embedding-3-small"
//! dims = 1536
//! ```

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use snapmind_core::chunk::ChunkConfig;
use snapmind_core::citation::ContextBudget;
use snapmind_core::fusion::{FusionParams, FusionStrategy, FusionWeights, SearchMode};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub indexing: IndexingConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub timeouts: TimeoutsConfig,
    #[serde(default)]
    pub context: ContextConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub cache: CacheConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_min_chars")]
    pub min_chars: usize,
    #[serde(default = "default_max_chars")]
    pub max_chars: usize,
    #[serde(default = "default_lookahead_chars")]
    pub lookahead_chars: usize,
    #[serde(default = "default_min_viable_chars")]
    pub min_viable_chars: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            min_chars: default_min_chars(),
            max_chars: default_max_chars(),
            lookahead_chars: default_lookahead_chars(),
            min_viable_chars: default_min_viable_chars(),
        }
    }
}

fn default_min_chars() -> usize {
    200
}
fn default_max_chars() -> usize {
    1200
}
fn default_lookahead_chars() -> usize {
    200
}
fn default_min_viable_chars() -> usize {
    50
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_vector_weight")]
    pub vector_weight: f64,
    #[serde(default = "default_keyword_weight")]
    pub keyword_weight: f64,
    #[serde(default = "default_min_similarity")]
    pub min_similarity: f64,
    #[serde(default = "default_lexical_scale")]
    pub lexical_scale: f64,
    #[serde(default = "default_mode")]
    pub mode: String,
    #[serde(default = "default_fusion")]
    pub fusion: String,
    #[serde(default = "default_rrf_k")]
    pub rrf_k: u32,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            vector_weight: default_vector_weight(),
            keyword_weight: default_keyword_weight(),
            min_similarity: default_min_similarity(),
            lexical_scale: default_lexical_scale(),
            mode: default_mode(),
            fusion: default_fusion(),
            rrf_k: default_rrf_k(),
        }
    }
}

fn default_top_k() -> usize {
    10
}
fn default_vector_weight() -> f64 {
    0.7
}
fn default_keyword_weight() -> f64 {
    0.3
}
fn default_min_similarity() -> f64 {
    0.3
}
fn default_lexical_scale() -> f64 {
    1.0
}
fn default_mode() -> String {
    "hybrid".to_string()
}
fn default_fusion() -> String {
    "weighted".to_string()
}
fn default_rrf_k() -> u32 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL for Ollama or an OpenAI-compatible endpoint.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_max_input_chars")]
    pub max_input_chars: usize,
    #[serde(default = "default_embed_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            url: None,
            max_input_chars: default_max_input_chars(),
            timeout_secs: default_embed_timeout_secs(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_max_input_chars() -> usize {
    8000
}
fn default_embed_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexingConfig {
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            max_attempts: default_max_attempts(),
            base_backoff_ms: default_base_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

fn default_max_workers() -> usize {
    3
}
fn default_max_attempts() -> u32 {
    3
}
fn default_base_backoff_ms() -> u64 {
    250
}
fn default_max_backoff_ms() -> u64 {
    4000
}

#[derive(Debug, Deserialize, Clone)]
pub struct GenerationConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    /// Name of the environment variable holding the API key.
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_generation_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            url: None,
            api_key_env: None,
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            timeout_secs: default_generation_timeout_secs(),
        }
    }
}

impl GenerationConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_temperature() -> f32 {
    0.7
}
fn default_max_tokens() -> u32 {
    2000
}
fn default_generation_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct TimeoutsConfig {
    #[serde(default = "default_lookup_ms")]
    pub vector_ms: u64,
    #[serde(default = "default_lookup_ms")]
    pub lexical_ms: u64,
    #[serde(default = "default_query_embedding_ms")]
    pub query_embedding_ms: u64,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            vector_ms: default_lookup_ms(),
            lexical_ms: default_lookup_ms(),
            query_embedding_ms: default_query_embedding_ms(),
        }
    }
}

fn default_lookup_ms() -> u64 {
    5000
}
fn default_query_embedding_ms() -> u64 {
    10_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct ContextConfig {
    #[serde(default = "default_context_tokens")]
    pub max_tokens: usize,
    #[serde(default = "default_true")]
    pub deduplicate: bool,
    #[serde(default = "default_near_duplicate")]
    pub near_duplicate_threshold: f64,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_context_tokens(),
            deduplicate: true,
            near_duplicate_threshold: default_near_duplicate(),
        }
    }
}

fn default_near_duplicate() -> f64 {
    0.9
}

fn default_context_tokens() -> usize {
    4000
}
fn default_true() -> bool {
    true
}

/// Semantic search cache, used by the HTTP server.
#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Minimum cosine similarity between query embeddings for a hit.
    #[serde(default = "default_cache_similarity")]
    pub similarity_threshold: f64,
    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "default_cache_entries")]
    pub max_entries: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            similarity_threshold: default_cache_similarity(),
            ttl_secs: default_cache_ttl_secs(),
            max_entries: default_cache_entries(),
        }
    }
}

fn default_cache_similarity() -> f64 {
    0.95
}
fn default_cache_ttl_secs() -> u64 {
    3600
}
fn default_cache_entries() -> u64 {
    1000
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7331".to_string()
}

impl Config {
    pub fn chunk_config(&self) -> ChunkConfig {
        ChunkConfig {
            min_chars: self.chunking.min_chars,
            max_chars: self.chunking.max_chars,
            lookahead_chars: self.chunking.lookahead_chars,
            min_viable_chars: self.chunking.min_viable_chars,
        }
    }

    /// Fusion parameters from `[retrieval]`. Only valid after [`load_config`]
    /// has accepted the file.
    pub fn fusion_params(&self) -> Result<FusionParams> {
        let r = &self.retrieval;
        let strategy = match r.fusion.as_str() {
            "weighted" => FusionStrategy::Weighted,
            "rrf" => FusionStrategy::ReciprocalRank { k: r.rrf_k },
            other => bail!("Unknown retrieval.fusion: '{}'. Must be weighted or rrf.", other),
        };
        let params = FusionParams {
            mode: r.mode.parse::<SearchMode>()?,
            weights: FusionWeights::new(r.vector_weight, r.keyword_weight)?,
            strategy,
            top_k: r.top_k,
            min_similarity: r.min_similarity,
            lexical_scale: r.lexical_scale,
        };
        params.validate()?;
        Ok(params)
    }

    pub fn context_budget(&self) -> ContextBudget {
        ContextBudget {
            max_tokens: self.context.max_tokens,
            deduplicate: self.context.deduplicate,
            near_duplicate_threshold: self.context.near_duplicate_threshold,
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    config
        .chunk_config()
        .validate()
        .context("Invalid [chunking] section")?;

    // Retrieval: weights, mode, fusion rule, bounds
    config
        .fusion_params()
        .context("Invalid [retrieval] section")?;

    if config.context.max_tokens == 0 {
        bail!("context.max_tokens must be > 0");
    }
    if !(0.0..=1.0).contains(&config.context.near_duplicate_threshold) {
        bail!("context.near_duplicate_threshold must be within [0, 1]");
    }

    let indexing = &config.indexing;
    if indexing.max_workers == 0 {
        bail!("indexing.max_workers must be > 0");
    }
    if indexing.max_attempts == 0 {
        bail!("indexing.max_attempts must be > 0");
    }
    if indexing.base_backoff_ms > indexing.max_backoff_ms {
        bail!("indexing.base_backoff_ms must not exceed indexing.max_backoff_ms");
    }

    let timeouts = &config.timeouts;
    if timeouts.vector_ms == 0 || timeouts.lexical_ms == 0 || timeouts.query_embedding_ms == 0 {
        bail!("timeouts must be > 0");
    }

    let cache = &config.cache;
    if !(cache.similarity_threshold > 0.0 && cache.similarity_threshold <= 1.0) {
        bail!("cache.similarity_threshold must be within (0, 1]");
    }
    if cache.enabled && (cache.ttl_secs == 0 || cache.max_entries == 0) {
        bail!("cache.ttl_secs and cache.max_entries must be > 0 when the cache is enabled");
    }

    match config.embedding.provider.as_str() {
        "disabled" | "openai" | "ollama" | "local" => {}
        other => bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, ollama, or local.",
            other
        ),
    }
    if config.embedding.is_enabled() && config.embedding.provider != "local" {
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.model.is_none() {
            bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
    }
    if config.embedding.max_input_chars == 0 {
        bail!("embedding.max_input_chars must be > 0");
    }

    match config.generation.provider.as_str() {
        "disabled" | "openai" | "mistral" | "ollama" => {}
        other => bail!(
            "Unknown generation provider: '{}'. Must be disabled, openai, mistral, or ollama.",
            other
        ),
    }
    if config.generation.is_enabled() && config.generation.model.is_none() {
        bail!(
            "generation.model must be specified when provider is '{}'",
            config.generation.provider
        );
    }
    if !(0.0..=2.0).contains(&config.generation.temperature) {
        bail!("generation.temperature must be within [0, 2]");
    }

    Ok(())
}
