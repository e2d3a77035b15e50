//! TOML configuration.
//!
//! A [`Config`] value is loaded once at startup with [`load_config`] and
//! passed by reference into every component constructor. Every section has
//! defaults, so an empty file is a valid (if not very useful) configuration.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Upper bound on rows written to the index per batch.
pub const MAX_STORE_BATCH: usize = 5000;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub validator: ValidatorConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub prompts: PromptsConfig,
    #[serde(default)]
    pub templates: TemplatesConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    /// `"sqlite"` (durable) or `"memory"` (process lifetime).
    #[serde(default = "default_store_backend")]
    pub backend: String,
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
    #[serde(default = "default_collection_name")]
    pub collection_name: String,
    #[serde(default = "default_store_batch_size")]
    pub batch_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_store_backend(),
            path: default_store_path(),
            collection_name: default_collection_name(),
            batch_size: default_store_batch_size(),
        }
    }
}

fn default_store_backend() -> String {
    "sqlite".to_string()
}
fn default_store_path() -> PathBuf {
    PathBuf::from("./data/templates.sqlite")
}
fn default_collection_name() -> String {
    "nuclei_templates".to_string()
}
fn default_store_batch_size() -> usize {
    MAX_STORE_BATCH
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
        }
    }
}

fn default_chunk_size() -> usize {
    1000
}
fn default_chunk_overlap() -> usize {
    200
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_max_retrieved_docs")]
    pub max_retrieved_docs: usize,
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f64,
    /// Characters of template body shown per match in formatted context.
    #[serde(default = "default_context_char_budget")]
    pub context_char_budget: usize,
    /// Candidate multiplier for the severity/tag filtered queries.
    #[serde(default = "default_filter_fanout")]
    pub filter_fanout: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            max_retrieved_docs: default_max_retrieved_docs(),
            similarity_threshold: default_similarity_threshold(),
            context_char_budget: default_context_char_budget(),
            filter_fanout: default_filter_fanout(),
        }
    }
}

fn default_max_retrieved_docs() -> usize {
    5
}
fn default_similarity_threshold() -> f64 {
    0.7
}
fn default_context_char_budget() -> usize {
    800
}
fn default_filter_fanout() -> usize {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_disabled")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_embedding_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_embedding_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_disabled(),
            model: None,
            dims: None,
            url: None,
            batch_size: default_embedding_batch_size(),
            max_retries: default_embedding_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_disabled() -> String {
    "disabled".to_string()
}
fn default_embedding_batch_size() -> usize {
    64
}
fn default_embedding_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    /// `"disabled"`, `"openai"` or `"gemini"`.
    #[serde(default = "default_disabled")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub url: Option<String>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_disabled(),
            model: None,
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            timeout_secs: default_timeout_secs(),
            url: None,
        }
    }
}

fn default_temperature() -> f32 {
    0.7
}
fn default_max_tokens() -> u32 {
    2000
}

#[derive(Debug, Deserialize, Clone)]
pub struct ValidatorConfig {
    #[serde(default = "default_validator_binary")]
    pub binary: PathBuf,
    #[serde(default = "default_validate_args")]
    pub validate_args: Vec<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            binary: default_validator_binary(),
            validate_args: default_validate_args(),
            timeout_secs: default_timeout_secs(),
            probe_timeout_secs: default_probe_timeout_secs(),
        }
    }
}

fn default_validator_binary() -> PathBuf {
    PathBuf::from("nuclei")
}
fn default_validate_args() -> Vec<String> {
    vec!["--validate".to_string(), "--verbose".to_string()]
}
fn default_probe_timeout_secs() -> u64 {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct GenerationConfig {
    #[serde(default = "default_generation_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_true")]
    pub validation_required: bool,
    #[serde(default = "default_preview_docs")]
    pub preview_docs: usize,
    #[serde(default = "default_preview_chars")]
    pub preview_chars: usize,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_retries: default_generation_max_retries(),
            validation_required: true,
            preview_docs: default_preview_docs(),
            preview_chars: default_preview_chars(),
        }
    }
}

fn default_generation_max_retries() -> u32 {
    3
}
fn default_true() -> bool {
    true
}
fn default_preview_docs() -> usize {
    3
}
fn default_preview_chars() -> usize {
    200
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct PromptsConfig {
    #[serde(default)]
    pub system_path: Option<PathBuf>,
    #[serde(default)]
    pub user_template_path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TemplatesConfig {
    #[serde(default = "default_templates_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
}

impl Default for TemplatesConfig {
    fn default() -> Self {
        Self {
            dir: default_templates_dir(),
            include_globs: default_include_globs(),
            exclude_globs: Vec::new(),
            follow_symlinks: false,
        }
    }
}

fn default_templates_dir() -> PathBuf {
    PathBuf::from("./rag_data/nuclei-templates")
}
fn default_include_globs() -> Vec<String> {
    vec!["**/*.yaml".to_string(), "**/*.yml".to_string()]
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

/// Check cross-field invariants. Called by [`load_config`]; also useful for
/// configurations built in code.
pub fn validate(config: &Config) -> Result<()> {
    match config.store.backend.as_str() {
        "sqlite" | "memory" => {}
        other => bail!(
            "Unknown store backend: '{}'. Must be sqlite or memory.",
            other
        ),
    }
    if config.store.batch_size == 0 || config.store.batch_size > MAX_STORE_BATCH {
        bail!("store.batch_size must be in 1..={}", MAX_STORE_BATCH);
    }
    if config.store.collection_name.trim().is_empty() {
        bail!("store.collection_name must not be empty");
    }

    if config.chunking.chunk_size == 0 {
        bail!("chunking.chunk_size must be > 0");
    }
    if config.chunking.chunk_overlap >= config.chunking.chunk_size {
        bail!("chunking.chunk_overlap must be smaller than chunking.chunk_size");
    }

    if config.retrieval.max_retrieved_docs == 0 {
        bail!("retrieval.max_retrieved_docs must be >= 1");
    }
    if !(0.0..=1.0).contains(&config.retrieval.similarity_threshold) {
        bail!("retrieval.similarity_threshold must be in [0.0, 1.0]");
    }
    if config.retrieval.filter_fanout == 0 {
        bail!("retrieval.filter_fanout must be >= 1");
    }

    if config.embedding.is_enabled() {
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
    match config.embedding.provider.as_str() {
        "disabled" | "openai" | "ollama" => {}
        other => bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, or ollama.",
            other
        ),
    }

    match config.llm.provider.as_str() {
        "disabled" | "openai" | "gemini" => {}
        other => bail!(
            "Unknown llm provider: '{}'. Must be disabled, openai, or gemini.",
            other
        ),
    }
    if config.llm.timeout_secs == 0 {
        bail!("llm.timeout_secs must be > 0");
    }

    if config.validator.timeout_secs == 0 || config.validator.probe_timeout_secs == 0 {
        bail!("validator timeouts must be > 0");
    }

    if config.generation.max_retries == 0 {
        bail!("generation.max_retries must be >= 1");
    }

    Ok(())
}
