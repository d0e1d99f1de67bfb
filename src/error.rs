//! Typed error taxonomy.
//!
//! Orchestration code returns `anyhow::Result`; these enums cover the
//! cases callers need to match on: whether a provider failure is worth
//! retrying, why a retrieval was refused, and why a casefile could not be
//! created.

use std::time::Duration;

/// Failure reported by a mail, embedding, or answer provider.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// Timeouts, connection resets, 5xx responses.
    #[error("transient provider error: {0}")]
    Transient(String),
    /// The provider asked us to slow down.
    #[error("rate limited by provider")]
    RateLimited { retry_after: Option<Duration> },
    /// Anything a retry cannot fix (bad request, auth failure, bad payload).
    #[error("provider error: {0}")]
    Fatal(String),
}

impl ProviderError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ProviderError::Fatal(_))
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_request() {
            ProviderError::Transient(err.to_string())
        } else {
            ProviderError::Fatal(err.to_string())
        }
    }
}

/// Why a scoped retrieval could not be answered.
#[derive(Debug, thiserror::Error)]
pub enum RetrievalError {
    #[error("unknown casefile: {0}")]
    UnknownCasefile(String),
    #[error("query must not be empty")]
    EmptyQuery,
    #[error("k must be >= 1")]
    InvalidTopK,
    #[error(
        "embedding model mismatch: query uses '{query_model}' but casefile is embedded with {}",
        casefile_models.join(", ")
    )]
    VersionMismatch {
        query_model: String,
        casefile_models: Vec<String>,
    },
    #[error("query embedding failed: {0}")]
    Embedding(#[from] ProviderError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Why a casefile could not be created or expanded.
#[derive(Debug, thiserror::Error)]
pub enum CasefileError {
    #[error("casefile must have at least one member")]
    Empty,
    #[error("{} member message(s) are not in the message store: {}", .0.len(), .0.join(", "))]
    UnknownMembers(Vec<String>),
    #[error("unknown casefile: {0}")]
    NotFound(String),
    #[error("expansion adds no new messages to casefile {0}")]
    NothingToAdd(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<sqlx::Error> for CasefileError {
    fn from(err: sqlx::Error) -> Self {
        CasefileError::Other(err.into())
    }
}

impl From<sqlx::Error> for RetrievalError {
    fn from(err: sqlx::Error) -> Self {
        RetrievalError::Other(err.into())
    }
}
