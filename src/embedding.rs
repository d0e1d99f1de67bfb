//! Embedding provider abstraction and implementations.
//!
//! Defines the [`EmbeddingProvider`] trait and concrete implementations:
//! - **[`DisabledProvider`]**: fails every call; used when embeddings are not configured.
//! - **[`OpenAIProvider`]**: `POST /v1/embeddings` on the OpenAI API.
//! - **[`OllamaProvider`]**: `POST /api/embed` on a local Ollama instance.
//! - **`LocalProvider`**: in-process inference via fastembed (feature
//!   `local-embeddings-fastembed`).
//!
//! Providers make a single attempt per call and classify failures as
//! [`ProviderError`]; the indexer owns retry and backoff.
//!
//! Also provides the vector utilities the pipeline relies on:
//! - [`fingerprint`]: hash over chunk text and model version
//! - [`dot_product`]: the retrieval similarity
//! - [`vec_to_blob`] / [`blob_to_vec`]: little-endian f32 BLOB encoding
//!
//! # Model version
//!
//! Every provider reports a `model_version()` of the form
//! `<provider>/<model>` with an optional `@<version>` suffix taken from
//! `embedding.version`. Vectors produced under different model versions are
//! never compared; changing it requires an explicit re-index.

use anyhow::{bail, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use std::time::Duration;

use crate::config::EmbeddingConfig;
use crate::error::ProviderError;

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Returns the model identifier (e.g. `"text-embedding-3-small"`).
    fn model_name(&self) -> &str;
    /// Returns the embedding vector dimensionality (e.g. `1536`).
    fn dims(&self) -> usize;
    /// Identity of the vector space this provider embeds into.
    fn model_version(&self) -> &str;

    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError>;
}

fn model_version_for(config: &EmbeddingConfig, model: &str) -> String {
    match &config.version {
        Some(version) => format!("{}/{}@{}", config.provider, model, version),
        None => format!("{}/{}", config.provider, model),
    }
}

/// The model version the configured provider would report, without
/// constructing it (no credentials needed). `None` when disabled.
pub fn configured_model_version(config: &EmbeddingConfig) -> Option<String> {
    if !config.is_enabled() {
        return None;
    }
    let model = match (config.provider.as_str(), &config.model) {
        (_, Some(model)) => model.clone(),
        ("local", None) => "all-minilm-l6-v2".to_string(),
        (_, None) => return None,
    };
    Some(model_version_for(config, &model))
}

// ============ Disabled Provider ============

/// A no-op embedding provider that always returns errors.
pub struct DisabledProvider;

#[async_trait]
impl EmbeddingProvider for DisabledProvider {
    fn model_name(&self) -> &str {
        "disabled"
    }
    fn dims(&self) -> usize {
        0
    }
    fn model_version(&self) -> &str {
        "disabled"
    }

    async fn embed(&self, _text: &str) -> Result<Vec<f32>, ProviderError> {
        Err(ProviderError::Fatal(
            "embedding provider is disabled".to_string(),
        ))
    }
}

// ============ OpenAI Provider ============

/// Embedding provider using the OpenAI API.
///
/// Requires the `OPENAI_API_KEY` environment variable to be set.
pub struct OpenAIProvider {
    client: reqwest::Client,
    api_key: String,
    model: String,
    dims: usize,
    model_version: String,
}

impl OpenAIProvider {
    /// # Errors
    ///
    /// Returns an error if `model` or `dims` is not set in config,
    /// or if `OPENAI_API_KEY` is not in the environment.
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for OpenAI provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow::anyhow!("embedding.dims required for OpenAI provider"))?;
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            api_key,
            model_version: model_version_for(config, &model),
            model,
            dims,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAIProvider {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }
    fn model_version(&self) -> &str {
        &self.model_version
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        let body = serde_json::json!({
            "model": self.model,
            "input": [text],
        });
        let response = self
            .client
            .post("https://api.openai.com/v1/embeddings")
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;
        let json = read_json(response, "OpenAI").await?;
        let vector = parse_openai_response(&json)?;
        check_dims(vector, self.dims)
    }
}

/// Extract `data[0].embedding` from an OpenAI embeddings response.
fn parse_openai_response(json: &serde_json::Value) -> Result<Vec<f32>, ProviderError> {
    json.pointer("/data/0/embedding")
        .and_then(|e| e.as_array())
        .map(|values| values_to_vec(values))
        .ok_or_else(|| {
            ProviderError::Fatal("Invalid OpenAI response: missing embedding".to_string())
        })
}

// ============ Ollama Provider ============

/// Embedding provider using a local Ollama instance.
///
/// Calls `POST /api/embed` on the configured URL (default:
/// `http://localhost:11434`); the model must already be pulled.
pub struct OllamaProvider {
    client: reqwest::Client,
    url: String,
    model: String,
    dims: usize,
    model_version: String,
}

impl OllamaProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for Ollama provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow::anyhow!("embedding.dims required for Ollama provider"))?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| "http://localhost:11434".to_string());
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            url: url.trim_end_matches('/').to_string(),
            model_version: model_version_for(config, &model),
            model,
            dims,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OllamaProvider {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }
    fn model_version(&self) -> &str {
        &self.model_version
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        let body = serde_json::json!({
            "model": self.model,
            "input": [text],
        });
        let response = self
            .client
            .post(format!("{}/api/embed", self.url))
            .json(&body)
            .send()
            .await?;
        let json = read_json(response, "Ollama").await?;
        let vector = parse_ollama_response(&json)?;
        check_dims(vector, self.dims)
    }
}

fn parse_ollama_response(json: &serde_json::Value) -> Result<Vec<f32>, ProviderError> {
    json.pointer("/embeddings/0")
        .and_then(|e| e.as_array())
        .map(|values| values_to_vec(values))
        .ok_or_else(|| {
            ProviderError::Fatal("Invalid Ollama response: missing embeddings array".to_string())
        })
}

// ============ Local Provider (fastembed) ============

/// In-process embedding via fastembed. The model is downloaded on first
/// use and kept loaded for the life of the provider.
#[cfg(feature = "local-embeddings-fastembed")]
pub struct LocalProvider {
    model_name: String,
    dims: usize,
    model_version: String,
    model: std::sync::Arc<std::sync::Mutex<Option<fastembed::TextEmbedding>>>,
}

#[cfg(feature = "local-embeddings-fastembed")]
impl LocalProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model_name = config
            .model
            .clone()
            .unwrap_or_else(|| "all-minilm-l6-v2".to_string());
        // Validate the name up front.
        fastembed_model(&model_name).map_err(|e| anyhow::anyhow!(e.to_string()))?;
        let dims = config.dims.unwrap_or(match model_name.as_str() {
            "bge-base-en-v1.5" | "nomic-embed-text-v1.5" => 768,
            "bge-large-en-v1.5" => 1024,
            _ => 384,
        });

        Ok(Self {
            model_version: model_version_for(config, &model_name),
            model_name,
            dims,
            model: Default::default(),
        })
    }
}

#[cfg(feature = "local-embeddings-fastembed")]
fn fastembed_model(name: &str) -> Result<fastembed::EmbeddingModel, ProviderError> {
    match name {
        "all-minilm-l6-v2" => Ok(fastembed::EmbeddingModel::AllMiniLML6V2),
        "bge-small-en-v1.5" => Ok(fastembed::EmbeddingModel::BGESmallENV15),
        "bge-base-en-v1.5" => Ok(fastembed::EmbeddingModel::BGEBaseENV15),
        "bge-large-en-v1.5" => Ok(fastembed::EmbeddingModel::BGELargeENV15),
        "nomic-embed-text-v1.5" => Ok(fastembed::EmbeddingModel::NomicEmbedTextV15),
        other => Err(ProviderError::Fatal(format!(
            "Unknown local embedding model: '{}'",
            other
        ))),
    }
}

#[cfg(feature = "local-embeddings-fastembed")]
#[async_trait]
impl EmbeddingProvider for LocalProvider {
    fn model_name(&self) -> &str {
        &self.model_name
    }
    fn dims(&self) -> usize {
        self.dims
    }
    fn model_version(&self) -> &str {
        &self.model_version
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        let slot = self.model.clone();
        let name = self.model_name.clone();
        let text = text.to_string();

        let vector = tokio::task::spawn_blocking(move || -> Result<Vec<f32>, ProviderError> {
            let mut guard = slot
                .lock()
                .map_err(|_| ProviderError::Fatal("local embedding model poisoned".to_string()))?;
            if guard.is_none() {
                let model = fastembed::TextEmbedding::try_new(fastembed::InitOptions::new(
                    fastembed_model(&name)?,
                ))
                .map_err(|e| {
                    ProviderError::Fatal(format!("Failed to initialize local model: {}", e))
                })?;
                *guard = Some(model);
            }
            let model = guard
                .as_mut()
                .ok_or_else(|| ProviderError::Fatal("local model missing".to_string()))?;
            model
                .embed(vec![text], None)
                .map_err(|e| ProviderError::Fatal(format!("Local embedding failed: {}", e)))?
                .into_iter()
                .next()
                .ok_or_else(|| ProviderError::Fatal("Empty embedding response".to_string()))
        })
        .await
        .map_err(|e| ProviderError::Fatal(e.to_string()))??;

        check_dims(vector, self.dims)
    }
}

// ============ Shared helpers ============

async fn read_json(
    response: reqwest::Response,
    service: &str,
) -> Result<serde_json::Value, ProviderError> {
    let status = response.status();
    if status.is_success() {
        return response
            .json()
            .await
            .map_err(|e| ProviderError::Fatal(format!("Invalid {} response: {}", service, e)));
    }

    if status == StatusCode::TOO_MANY_REQUESTS {
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        return Err(ProviderError::RateLimited { retry_after });
    }

    let body = response.text().await.unwrap_or_default();
    let message = format!("{} API error {}: {}", service, status, body);
    if status.is_server_error() {
        Err(ProviderError::Transient(message))
    } else {
        Err(ProviderError::Fatal(message))
    }
}

fn values_to_vec(values: &[serde_json::Value]) -> Vec<f32> {
    values
        .iter()
        .map(|v| v.as_f64().unwrap_or(0.0) as f32)
        .collect()
}

fn check_dims(vector: Vec<f32>, dims: usize) -> Result<Vec<f32>, ProviderError> {
    if vector.len() != dims {
        return Err(ProviderError::Fatal(format!(
            "embedding has {} dimensions, expected {}",
            vector.len(),
            dims
        )));
    }
    Ok(vector)
}

/// Create the appropriate [`EmbeddingProvider`] based on configuration.
///
/// | Config Value | Provider |
/// |-------------|----------|
/// | `"disabled"` | [`DisabledProvider`] |
/// | `"openai"` | [`OpenAIProvider`] |
/// | `"ollama"` | [`OllamaProvider`] |
/// | `"local"` | `LocalProvider` (feature `local-embeddings-fastembed`) |
pub fn create_provider(config: &EmbeddingConfig) -> Result<Box<dyn EmbeddingProvider>> {
    match config.provider.as_str() {
        "disabled" => Ok(Box::new(DisabledProvider)),
        "openai" => Ok(Box::new(OpenAIProvider::new(config)?)),
        "ollama" => Ok(Box::new(OllamaProvider::new(config)?)),
        #[cfg(feature = "local-embeddings-fastembed")]
        "local" => Ok(Box::new(LocalProvider::new(config)?)),
        #[cfg(not(feature = "local-embeddings-fastembed"))]
        "local" => bail!("Local embedding provider requires --features local-embeddings-fastembed"),
        other => bail!("Unknown embedding provider: {}", other),
    }
}

/// Embedding fingerprint: SHA-256 over the model version and the text,
/// hex encoded. Changes whenever either input changes.
pub fn fingerprint(text: &str, model_version: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(model_version.as_bytes());
    hasher.update([0u8]);
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Dot-product similarity. Vectors of different lengths score `f32::MIN`
/// so they sort last.
pub fn dot_product(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return f32::MIN;
    }
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Encode a float vector as a BLOB (little-endian f32 bytes).
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}
