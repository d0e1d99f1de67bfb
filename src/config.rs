use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub gmail: Option<GmailConfig>,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub answer: AnswerConfig,
    #[serde(default)]
    pub workers: WorkersConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

/// Ingestion policy and retry settings.
///
/// `exclude_labels` is the spam/promotional predicate: a message carrying
/// any of these provider labels never becomes a MessageRecord. Empty by
/// default; the policy is an explicit user decision.
#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    #[serde(default)]
    pub exclude_labels: Vec<String>,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            exclude_labels: Vec::new(),
            page_size: default_page_size(),
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
        }
    }
}

fn default_page_size() -> usize {
    500
}
fn default_max_retries() -> u32 {
    5
}
fn default_backoff_base_ms() -> u64 {
    500
}
fn default_backoff_max_ms() -> u64 {
    60_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct GmailConfig {
    /// Gmail user id; `"me"` addresses the token owner.
    #[serde(default = "default_gmail_user")]
    pub user_id: String,
    /// Environment variable holding an already-issued OAuth bearer token.
    #[serde(default = "default_token_env")]
    pub token_env: String,
    #[serde(default = "default_gmail_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub include_spam_trash: bool,
    /// Cap on in-flight HTTP requests.
    #[serde(default = "default_gmail_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_requests_per_second")]
    pub requests_per_second: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_gmail_user() -> String {
    "me".to_string()
}
fn default_token_env() -> String {
    "GMAIL_ACCESS_TOKEN".to_string()
}
fn default_gmail_base_url() -> String {
    "https://gmail.googleapis.com/gmail/v1".to_string()
}
fn default_gmail_concurrency() -> usize {
    20
}
fn default_requests_per_second() -> u32 {
    50
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    /// `"message"` (one chunk per email) or `"paragraph"`.
    #[serde(default = "default_strategy")]
    pub strategy: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            strategy: default_strategy(),
            max_tokens: default_max_tokens(),
        }
    }
}

fn default_strategy() -> String {
    "message".to_string()
}
fn default_max_tokens() -> usize {
    700
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Operator-controlled version tag folded into the model version, so a
    /// provider-side model update can be forced into a re-index.
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "disabled".to_string(),
            model: None,
            dims: None,
            version: None,
            url: None,
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_timeout_secs() -> u64 {
    30
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
        }
    }
}

fn default_top_k() -> usize {
    8
}

#[derive(Debug, Deserialize, Clone)]
pub struct AnswerConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for AnswerConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct WorkersConfig {
    /// A claim older than this is considered abandoned by a crashed worker.
    #[serde(default = "default_claim_ttl_secs")]
    pub claim_ttl_secs: i64,
    #[serde(default)]
    pub worker_id: Option<String>,
    /// Provider fetches a worker keeps in flight at once.
    #[serde(default = "default_worker_concurrency")]
    pub concurrency: usize,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            claim_ttl_secs: default_claim_ttl_secs(),
            worker_id: None,
            concurrency: default_worker_concurrency(),
        }
    }
}

fn default_claim_ttl_secs() -> i64 {
    600
}
fn default_worker_concurrency() -> usize {
    8
}

impl WorkersConfig {
    /// Identity used for claims; unique per process unless configured.
    pub fn worker_id(&self) -> String {
        self.worker_id
            .clone()
            .unwrap_or_else(|| format!("worker-{}", uuid::Uuid::new_v4()))
    }
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
    "127.0.0.1:7341".to_string()
}

impl Config {
    /// Configuration with every optional section at its default.
    pub fn with_db_path(path: impl Into<PathBuf>) -> Self {
        Self {
            db: DbConfig { path: path.into() },
            ingest: IngestConfig::default(),
            gmail: None,
            chunking: ChunkingConfig::default(),
            embedding: EmbeddingConfig::default(),
            retrieval: RetrievalConfig::default(),
            answer: AnswerConfig::default(),
            workers: WorkersConfig::default(),
            server: ServerConfig::default(),
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

pub fn validate(config: &Config) -> Result<()> {
    if config.chunking.max_tokens == 0 {
        anyhow::bail!("chunking.max_tokens must be > 0");
    }
    match config.chunking.strategy.as_str() {
        "message" | "paragraph" => {}
        other => anyhow::bail!(
            "Unknown chunking strategy: '{}'. Must be message or paragraph.",
            other
        ),
    }

    if config.retrieval.top_k == 0 {
        anyhow::bail!("retrieval.top_k must be >= 1");
    }

    if config.ingest.page_size == 0 {
        anyhow::bail!("ingest.page_size must be > 0");
    }

    if config.workers.claim_ttl_secs <= 0 {
        anyhow::bail!("workers.claim_ttl_secs must be > 0");
    }
    if config.workers.concurrency == 0 {
        anyhow::bail!("workers.concurrency must be > 0");
    }

    if let Some(gmail) = &config.gmail {
        if gmail.concurrency == 0 {
            anyhow::bail!("gmail.concurrency must be > 0");
        }
        if gmail.requests_per_second == 0 {
            anyhow::bail!("gmail.requests_per_second must be > 0");
        }
    }

    match config.embedding.provider.as_str() {
        "disabled" | "local" => {}
        "openai" | "ollama" => {
            if config.embedding.model.is_none() {
                anyhow::bail!(
                    "embedding.model must be specified when provider is '{}'",
                    config.embedding.provider
                );
            }
            if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
                anyhow::bail!(
                    "embedding.dims must be > 0 when provider is '{}'",
                    config.embedding.provider
                );
            }
        }
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, ollama, or local.",
            other
        ),
    }

    match config.answer.provider.as_str() {
        "disabled" => {}
        "openai" => {
            if config.answer.model.is_none() {
                anyhow::bail!("answer.model must be specified when provider is 'openai'");
            }
        }
        other => anyhow::bail!(
            "Unknown answer provider: '{}'. Must be disabled or openai.",
            other
        ),
    }

    Ok(())
}
