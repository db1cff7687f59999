use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub rag: RagConfig,
    #[serde(default)]
    pub classifier: ClassifierConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    #[serde(default = "default_max_chunk_lines")]
    pub max_chunk_lines: usize,
    #[serde(default = "default_tokens_per_char")]
    pub tokens_per_char: f64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_chunk_lines: default_max_chunk_lines(),
            tokens_per_char: default_tokens_per_char(),
        }
    }
}

fn default_max_chunk_lines() -> usize {
    1000
}
fn default_tokens_per_char() -> f64 {
    0.25
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embed_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_embedding_dim")]
    pub dim: usize,
    #[serde(default = "default_embedding_max_chars")]
    pub max_chars: usize,
    #[serde(default = "default_inter_call_delay_ms")]
    pub inter_call_delay_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embed_provider(),
            model: None,
            url: None,
            dim: default_embedding_dim(),
            max_chars: default_embedding_max_chars(),
            inter_call_delay_ms: default_inter_call_delay_ms(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_embed_provider() -> String {
    "disabled".to_string()
}
fn default_embedding_dim() -> usize {
    768
}
fn default_embedding_max_chars() -> usize {
    20_000
}
fn default_inter_call_delay_ms() -> u64 {
    100
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_search_min_similarity")]
    pub default_min_similarity: f64,
    #[serde(default = "default_search_limit")]
    pub default_limit: i64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            default_min_similarity: default_search_min_similarity(),
            default_limit: default_search_limit(),
        }
    }
}

fn default_search_min_similarity() -> f64 {
    0.7
}
fn default_search_limit() -> i64 {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct RagConfig {
    #[serde(default = "default_rag_max_cases")]
    pub max_cases: i64,
    #[serde(default = "default_rag_min_similarity")]
    pub min_similarity: f64,
}

impl Default for RagConfig {
    fn default() -> Self {
        Self {
            max_cases: default_rag_max_cases(),
            min_similarity: default_rag_min_similarity(),
        }
    }
}

fn default_rag_max_cases() -> i64 {
    3
}
fn default_rag_min_similarity() -> f64 {
    0.6
}

#[derive(Debug, Deserialize, Clone)]
pub struct ClassifierConfig {
    /// Priority assigned to INTENTIONAL failures: 0 sorts them highest,
    /// 5 ranks them below real test/build/runtime/infra issues.
    #[serde(default = "default_intentional_priority")]
    pub intentional_priority: i64,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            intentional_priority: default_intentional_priority(),
        }
    }
}

fn default_intentional_priority() -> i64 {
    0
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default = "default_llm_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_llm_provider(),
            model: None,
            url: None,
            max_retries: default_max_retries(),
            timeout_secs: default_llm_timeout_secs(),
        }
    }
}

fn default_llm_provider() -> String {
    "mock".to_string()
}
fn default_llm_timeout_secs() -> u64 {
    120
}

#[derive(Debug, Deserialize, Clone)]
pub struct QueueConfig {
    #[serde(default = "default_lock_secs")]
    pub lock_secs: i64,
    #[serde(default = "default_max_stalled_retries")]
    pub max_stalled_retries: i64,
    #[serde(default = "default_backoff_initial_ms")]
    pub backoff_initial_ms: i64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            lock_secs: default_lock_secs(),
            max_stalled_retries: default_max_stalled_retries(),
            backoff_initial_ms: default_backoff_initial_ms(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

fn default_lock_secs() -> i64 {
    600
}
fn default_max_stalled_retries() -> i64 {
    3
}
fn default_backoff_initial_ms() -> i64 {
    2000
}
fn default_sweep_interval_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ProviderConfig {
    /// Log-archive URL template with `{repo}` and `{run_id}` placeholders,
    /// e.g. `https://api.github.com/repos/{repo}/actions/runs/{run_id}/logs`.
    #[serde(default)]
    pub logs_url_template: Option<String>,
    /// Environment variable holding the bearer token for archive downloads.
    #[serde(default)]
    pub token_env: Option<String>,
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
    "127.0.0.1:7410".to_string()
}

impl Config {
    /// A self-contained config for one-shot analysis and tests: temp-style
    /// relative DB path, mock LLM, embeddings disabled.
    pub fn minimal() -> Self {
        Self {
            db: DbConfig {
                path: PathBuf::from("./data/triage.sqlite"),
            },
            pipeline: PipelineConfig::default(),
            embedding: EmbeddingConfig::default(),
            retrieval: RetrievalConfig::default(),
            rag: RagConfig::default(),
            classifier: ClassifierConfig::default(),
            llm: LlmConfig::default(),
            queue: QueueConfig::default(),
            provider: ProviderConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    if config.pipeline.max_chunk_lines == 0 {
        anyhow::bail!("pipeline.max_chunk_lines must be > 0");
    }
    if config.pipeline.tokens_per_char <= 0.0 {
        anyhow::bail!("pipeline.tokens_per_char must be > 0");
    }

    if !(0.0..=1.0).contains(&config.rag.min_similarity) {
        anyhow::bail!("rag.min_similarity must be in [0.0, 1.0]");
    }
    if config.rag.max_cases < 0 {
        anyhow::bail!("rag.max_cases must be >= 0");
    }
    if !(0.0..=1.0).contains(&config.retrieval.default_min_similarity) {
        anyhow::bail!("retrieval.default_min_similarity must be in [0.0, 1.0]");
    }

    match config.classifier.intentional_priority {
        0 | 5 => {}
        other => anyhow::bail!(
            "classifier.intentional_priority must be 0 or 5, got {}",
            other
        ),
    }

    if config.embedding.is_enabled() {
        if config.embedding.dim == 0 {
            anyhow::bail!(
                "embedding.dim must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.max_chars == 0 {
            anyhow::bail!("embedding.max_chars must be > 0");
        }
    }

    match config.embedding.provider.as_str() {
        "disabled" | "openai" | "ollama" | "mock" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, ollama, or mock.",
            other
        ),
    }

    match config.llm.provider.as_str() {
        "openai" | "ollama" | "mock" => {}
        other => anyhow::bail!(
            "Unknown llm provider: '{}'. Must be openai, ollama, or mock.",
            other
        ),
    }

    if config.queue.lock_secs < 1 {
        anyhow::bail!("queue.lock_secs must be >= 1");
    }
    if config.queue.max_stalled_retries < 0 {
        anyhow::bail!("queue.max_stalled_retries must be >= 0");
    }

    Ok(config)
}
