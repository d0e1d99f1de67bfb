//! Answer generator collaborators.
//!
//! The generator turns a query plus retrieved chunks into prose. It never
//! decides citations: the assembler attaches the citations of the chunks it
//! passed in, so nothing is parsed out of model output.

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::time::Duration;

use crate::config::AnswerConfig;
use crate::error::ProviderError;
use crate::models::CitedChunk;

#[async_trait]
pub trait AnswerGenerator: Send + Sync {
    /// `None` when no generator is configured; retrieval still returns the
    /// cited chunks.
    async fn generate(
        &self,
        query: &str,
        chunks: &[CitedChunk],
    ) -> Result<Option<String>, ProviderError>;
}

/// Returns no text. Used when `answer.provider = "disabled"`.
pub struct DisabledGenerator;

#[async_trait]
impl AnswerGenerator for DisabledGenerator {
    async fn generate(
        &self,
        _query: &str,
        _chunks: &[CitedChunk],
    ) -> Result<Option<String>, ProviderError> {
        Ok(None)
    }
}

/// OpenAI chat completions. Requires `OPENAI_API_KEY`.
pub struct OpenAIGenerator {
    client: reqwest::Client,
    api_key: String,
    model: String,
}

impl OpenAIGenerator {
    pub fn new(config: &AnswerConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("answer.model required for OpenAI provider"))?;
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            api_key,
            model,
        })
    }
}

#[async_trait]
impl AnswerGenerator for OpenAIGenerator {
    async fn generate(
        &self,
        query: &str,
        chunks: &[CitedChunk],
    ) -> Result<Option<String>, ProviderError> {
        let response = self
            .client
            .post("https://api.openai.com/v1/chat/completions")
            .bearer_auth(&self.api_key)
            .json(&serde_json::json!({
                "model": self.model,
                "temperature": 0,
                "messages": [
                    {
                        "role": "system",
                        "content": "Answer the question using only the numbered email excerpts. Refer to excerpts by their number. If the excerpts do not contain the answer, say so."
                    },
                    {
                        "role": "user",
                        "content": build_prompt(query, chunks)
                    }
                ]
            }))
            .send()
            .await?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(ProviderError::RateLimited { retry_after: None });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = format!("OpenAI API error {}: {}", status, body);
            return Err(if status.is_server_error() {
                ProviderError::Transient(message)
            } else {
                ProviderError::Fatal(message)
            });
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ProviderError::Fatal(format!("Invalid OpenAI response: {}", e)))?;
        Ok(json
            .pointer("/choices/0/message/content")
            .and_then(|c| c.as_str())
            .map(|c| c.trim().to_string()))
    }
}

/// Numbered excerpts in retrieval order, each with its provenance.
pub fn build_prompt(query: &str, chunks: &[CitedChunk]) -> String {
    let mut prompt = String::new();
    for (i, chunk) in chunks.iter().enumerate() {
        let date = chrono::DateTime::from_timestamp(chunk.citation.date, 0)
            .map(|dt| dt.format("%Y-%m-%d").to_string())
            .unwrap_or_default();
        prompt.push_str(&format!(
            "[{}] From: {} | Date: {} | Subject: {}\n{}\n\n",
            i + 1,
            chunk.citation.from,
            date,
            chunk.citation.subject,
            chunk.text
        ));
    }
    prompt.push_str(&format!("Question: {}", query));
    prompt
}

pub fn create_generator(config: &AnswerConfig) -> Result<Box<dyn AnswerGenerator>> {
    match config.provider.as_str() {
        "disabled" => Ok(Box::new(DisabledGenerator)),
        "openai" => Ok(Box::new(OpenAIGenerator::new(config)?)),
        other => bail!("Unknown answer provider: {}", other),
    }
}
