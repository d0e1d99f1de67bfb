//! HTTP API over the pipeline.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Health check (returns version) |
//! | `GET`  | `/clusters` | Current clusters, recomputed per request |
//! | `GET`  | `/casefiles/{id}/status` | Member states and embedding coverage |
//! | `POST` | `/casefiles/{id}/ask` | Cited answer scoped to one casefile |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "not_found", "message": "unknown casefile: 42" } }
//! ```
//!
//! Error codes: `bad_request` (400), `embeddings_disabled` (400),
//! `not_found` (404), `version_mismatch` (409), `provider_error` (502),
//! `internal` (500).
//!
//! The server only reads pipeline state; ingestion, enrichment, and
//! embedding run from the CLI.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::answer::{create_generator, AnswerGenerator};
use crate::cluster::{load_clusters, Cluster};
use crate::config::Config;
use crate::db;
use crate::embedding::{create_provider, EmbeddingProvider};
use crate::error::RetrievalError;
use crate::retrieve::{Answer, Assembler};
use crate::retry::RetryPolicy;
use crate::status::{casefile_status, CasefileStatus};
use crate::store::MessageStore;
use crate::vector_store::SqliteVectorStore;

#[derive(Clone)]
pub struct AppState {
    config: Arc<Config>,
    pool: SqlitePool,
    /// `None` when embeddings are disabled; `/ask` then answers 400.
    provider: Option<Arc<dyn EmbeddingProvider>>,
    generator: Arc<dyn AnswerGenerator>,
}

impl AppState {
    pub fn new(
        config: Config,
        pool: SqlitePool,
        provider: Option<Arc<dyn EmbeddingProvider>>,
        generator: Arc<dyn AnswerGenerator>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            pool,
            provider,
            generator,
        }
    }

    fn store(&self) -> MessageStore {
        MessageStore::new(self.pool.clone(), self.config.workers.claim_ttl_secs)
    }
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/clusters", get(handle_clusters))
        .route("/casefiles/{id}/status", get(handle_status))
        .route("/casefiles/{id}/ask", post(handle_ask))
        .layer(cors)
        .with_state(state)
}

/// `cf serve`: bind to `[server].bind` and serve until the process exits.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let pool = db::connect(config).await?;
    let provider: Option<Arc<dyn EmbeddingProvider>> = if config.embedding.is_enabled() {
        Some(Arc::from(create_provider(&config.embedding)?))
    } else {
        None
    };
    let generator: Arc<dyn AnswerGenerator> = Arc::from(create_generator(&config.answer)?);

    let bind_addr = config.server.bind.clone();
    let app = router(AppState::new(config.clone(), pool, provider, generator));

    println!("Casefile server listening on http://{}", bind_addr);
    tracing::info!(bind = %bind_addr, "server started");

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
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

pub struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl AppError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }
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

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        tracing::error!(error = %err, "request failed");
        AppError::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", err.to_string())
    }
}

impl From<RetrievalError> for AppError {
    fn from(err: RetrievalError) -> Self {
        let message = err.to_string();
        match err {
            RetrievalError::EmptyQuery | RetrievalError::InvalidTopK => {
                AppError::new(StatusCode::BAD_REQUEST, "bad_request", message)
            }
            RetrievalError::UnknownCasefile(_) => {
                AppError::new(StatusCode::NOT_FOUND, "not_found", message)
            }
            RetrievalError::VersionMismatch { .. } => {
                AppError::new(StatusCode::CONFLICT, "version_mismatch", message)
            }
            RetrievalError::Embedding(_) => {
                AppError::new(StatusCode::BAD_GATEWAY, "provider_error", message)
            }
            RetrievalError::Other(e) => e.into(),
        }
    }
}

// ============ Handlers ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

#[derive(Serialize)]
struct ClustersResponse {
    clusters: Vec<Cluster>,
}

async fn handle_clusters(State(state): State<AppState>) -> Result<Json<ClustersResponse>, AppError> {
    let clusters = load_clusters(&state.store()).await?;
    Ok(Json(ClustersResponse { clusters }))
}

async fn handle_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<CasefileStatus>, AppError> {
    let vectors = SqliteVectorStore::new(state.pool.clone());
    let model_version = state.provider.as_ref().map(|p| p.model_version().to_string());
    casefile_status(&state.store(), &vectors, &id, model_version.as_deref())
        .await?
        .map(Json)
        .ok_or_else(|| {
            AppError::new(
                StatusCode::NOT_FOUND,
                "not_found",
                format!("unknown casefile: {}", id),
            )
        })
}

#[derive(Deserialize)]
pub struct AskRequest {
    pub query: String,
    #[serde(default)]
    pub k: Option<usize>,
}

async fn handle_ask(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<AskRequest>,
) -> Result<Json<Answer>, AppError> {
    let Some(provider) = state.provider.as_deref() else {
        return Err(AppError::new(
            StatusCode::BAD_REQUEST,
            "embeddings_disabled",
            "asking requires an embedding provider",
        ));
    };

    let store = state.store();
    let vectors = SqliteVectorStore::new(state.pool.clone());
    let embedding = &state.config.embedding;
    let assembler = Assembler::new(
        &store,
        &vectors,
        provider,
        state.generator.as_ref(),
        RetryPolicy::new(
            embedding.max_retries,
            embedding.backoff_base_ms,
            embedding.backoff_max_ms,
        ),
        state.config.retrieval.top_k,
    );

    let answer = assembler.ask(&id, &request.query, request.k).await?;
    Ok(Json(answer))
}
