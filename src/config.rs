//! TOML configuration.
//!
//! Loaded once at startup by [`load_config`] and validated before anything
//! touches the database or a provider. Every section except `[db]` has
//! defaults, so a minimal file is:
//!
//! ```toml
//! [db]
//! path = "./data/docent.sqlite"
//! ```

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use docent_core::chunk::{DEFAULT_MAX_TOKENS, DEFAULT_OVERLAP_TOKENS};
use docent_core::retrieval::{DEFAULT_LIMIT, DEFAULT_MIN_SIMILARITY};

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
    pub llm: LlmConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    #[serde(default = "default_overlap")]
    pub overlap_tokens: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_tokens: DEFAULT_MAX_TOKENS,
            overlap_tokens: DEFAULT_OVERLAP_TOKENS,
        }
    }
}

fn default_max_tokens() -> usize {
    DEFAULT_MAX_TOKENS
}
fn default_overlap() -> usize {
    DEFAULT_OVERLAP_TOKENS
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default = "default_min_similarity")]
    pub min_similarity: f64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            limit: DEFAULT_LIMIT,
            min_similarity: DEFAULT_MIN_SIMILARITY,
        }
    }
}

fn default_limit() -> usize {
    DEFAULT_LIMIT
}
fn default_min_similarity() -> f64 {
    DEFAULT_MIN_SIMILARITY
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL for Ollama or an OpenAI-compatible endpoint.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            model: None,
            dims: None,
            url: None,
            batch_size: default_batch_size(),
            max_retries: 0,
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_embedding_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    docent_core::embedding::DEFAULT_MAX_BATCH
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default = "default_llm_provider")]
    pub provider: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_llm_max_tokens")]
    pub max_tokens: u32,
    /// Bound on each read from the upstream token stream.
    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_history_turns")]
    pub history_turns: usize,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_llm_provider(),
            model: default_llm_model(),
            url: None,
            temperature: default_temperature(),
            max_tokens: default_llm_max_tokens(),
            timeout_secs: default_llm_timeout(),
            history_turns: default_history_turns(),
        }
    }
}

fn default_llm_provider() -> String {
    "disabled".to_string()
}
fn default_llm_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_temperature() -> f32 {
    0.7
}
fn default_llm_max_tokens() -> u32 {
    1024
}
fn default_llm_timeout() -> u64 {
    60
}
fn default_history_turns() -> usize {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_crawl_max_pages")]
    pub crawl_max_pages: usize,
    #[serde(default = "default_crawl_timeout")]
    pub crawl_timeout_secs: u64,
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            crawl_max_pages: default_crawl_max_pages(),
            crawl_timeout_secs: default_crawl_timeout(),
            max_upload_bytes: default_max_upload_bytes(),
        }
    }
}

fn default_workers() -> usize {
    4
}
fn default_crawl_max_pages() -> usize {
    1
}
fn default_crawl_timeout() -> u64 {
    20
}
fn default_max_upload_bytes() -> usize {
    20 * 1024 * 1024
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Origins allowed to call the API from a browser. Empty denies all.
    #[serde(default)]
    pub allowed_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            allowed_origins: Vec::new(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7340".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct RateLimitConfig {
    #[serde(default = "default_rate_requests")]
    pub requests: u32,
    #[serde(default = "default_rate_window")]
    pub window_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests: default_rate_requests(),
            window_secs: default_rate_window(),
        }
    }
}

fn default_rate_requests() -> u32 {
    30
}
fn default_rate_window() -> u64 {
    60
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

/// Parse and validate a configuration document.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.chunking.max_tokens == 0 {
        bail!("chunking.max_tokens must be > 0");
    }
    if config.chunking.overlap_tokens >= config.chunking.max_tokens {
        bail!("chunking.overlap_tokens must be smaller than chunking.max_tokens");
    }

    if config.retrieval.limit == 0 {
        bail!("retrieval.limit must be >= 1");
    }
    if !(-1.0..=1.0).contains(&config.retrieval.min_similarity) {
        bail!("retrieval.min_similarity must be in [-1.0, 1.0]");
    }

    match config.embedding.provider.as_str() {
        "disabled" | "openai" | "ollama" | "local" => {}
        other => bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, ollama, or local.",
            other
        ),
    }
    if config.embedding.is_enabled() && config.embedding.provider != "local" {
        if config.embedding.dims.unwrap_or(0) == 0 {
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
    if config.embedding.batch_size == 0 {
        bail!("embedding.batch_size must be > 0");
    }

    match config.llm.provider.as_str() {
        "disabled" | "openai" | "ollama" => {}
        other => bail!(
            "Unknown llm provider: '{}'. Must be disabled, openai, or ollama.",
            other
        ),
    }
    if config.llm.history_turns == 0 {
        bail!("llm.history_turns must be >= 1");
    }
    if config.llm.timeout_secs == 0 {
        bail!("llm.timeout_secs must be > 0");
    }

    if config.ingest.workers == 0 {
        bail!("ingest.workers must be >= 1");
    }
    if config.ingest.crawl_max_pages == 0 {
        bail!("ingest.crawl_max_pages must be >= 1");
    }

    if config.rate_limit.requests == 0 || config.rate_limit.window_secs == 0 {
        bail!("rate_limit.requests and rate_limit.window_secs must be > 0");
    }

    Ok(())
}
