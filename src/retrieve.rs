//! Retrieval & answer assembler.
//!
//! Embeds a query, retrieves the nearest chunks of exactly one casefile,
//! and assembles a cited answer:
//!
//! ```text
//! query ──embed──▶ vector ──query(casefile, model)──▶ hits
//!       ──drop stale fingerprints──▶ cited chunks ──generate──▶ answer text
//! ```
//!
//! Retrieval reads only committed embedding records and never waits on
//! workers. An incompletely embedded casefile still answers; the coverage
//! annotation says how much of it was searchable.

use anyhow::Result;
use serde::Serialize;

use crate::answer::{self, AnswerGenerator};
use crate::casefile;
use crate::config::Config;
use crate::db;
use crate::embed_cmd::{compute_coverage, Coverage};
use crate::embedding::{self, EmbeddingProvider};
use crate::error::RetrievalError;
use crate::models::{Citation, CitedChunk};
use crate::retry::{with_backoff, RetryPolicy};
use crate::store::MessageStore;
use crate::vector_store::{SqliteVectorStore, VectorStore};

#[derive(Debug, Clone, Serialize)]
pub struct Answer {
    pub casefile_id: String,
    pub query: String,
    /// Generated prose; `None` when no generator is configured or it failed.
    pub text: Option<String>,
    pub chunks: Vec<CitedChunk>,
    /// One per cited message, in retrieval order.
    pub citations: Vec<Citation>,
    pub coverage: Coverage,
    pub model_version: String,
}

impl Answer {
    pub fn is_complete(&self) -> bool {
        self.coverage.is_complete()
    }
}

pub struct Assembler<'a> {
    store: &'a MessageStore,
    vectors: &'a dyn VectorStore,
    provider: &'a dyn EmbeddingProvider,
    generator: &'a dyn AnswerGenerator,
    retry: RetryPolicy,
    top_k: usize,
}

impl<'a> Assembler<'a> {
    pub fn new(
        store: &'a MessageStore,
        vectors: &'a dyn VectorStore,
        provider: &'a dyn EmbeddingProvider,
        generator: &'a dyn AnswerGenerator,
        retry: RetryPolicy,
        top_k: usize,
    ) -> Self {
        Self {
            store,
            vectors,
            provider,
            generator,
            retry,
            top_k,
        }
    }

    pub async fn ask(
        &self,
        casefile_id: &str,
        query: &str,
        k: Option<usize>,
    ) -> Result<Answer, RetrievalError> {
        let query = query.trim();
        if query.is_empty() {
            return Err(RetrievalError::EmptyQuery);
        }
        if k == Some(0) {
            return Err(RetrievalError::InvalidTopK);
        }
        if casefile::get(self.store.pool(), casefile_id).await?.is_none() {
            return Err(RetrievalError::UnknownCasefile(casefile_id.to_string()));
        }

        let model_version = self.provider.model_version().to_string();
        let versions = self.vectors.model_versions(casefile_id).await?;
        if !versions.is_empty() && !versions.contains(&model_version) {
            return Err(RetrievalError::VersionMismatch {
                query_model: model_version,
                casefile_models: versions,
            });
        }

        let query_vector =
            with_backoff(&self.retry, "embed query", || self.provider.embed(query)).await?;

        let k = k.unwrap_or(self.top_k);
        let hits = self
            .vectors
            .query(casefile_id, &model_version, &query_vector, k)
            .await?;
        let hit_ids: Vec<String> = hits.iter().map(|h| h.chunk_id.clone()).collect();
        let mut current = self.store.chunks_by_ids(&hit_ids).await?;

        let mut chunks = Vec::with_capacity(hits.len());
        for hit in hits {
            let Some(chunk) = current.remove(&hit.chunk_id) else {
                tracing::debug!(chunk_id = %hit.chunk_id, "hit for a deleted chunk");
                continue;
            };
            if chunk.embedding_fingerprint.as_deref() != Some(hit.fingerprint.as_str()) {
                tracing::debug!(chunk_id = %hit.chunk_id, "hit with a stale fingerprint");
                continue;
            }
            chunks.push(CitedChunk {
                chunk_id: chunk.chunk_id,
                score: hit.score,
                thread_id: chunk.thread_id,
                position_in_thread: chunk.position_in_thread,
                citation: Citation {
                    message_id: chunk.message_id,
                    date: chunk.date,
                    subject: chunk.subject,
                    from: chunk.from,
                },
                text: chunk.text,
            });
        }

        let text = if chunks.is_empty() {
            None
        } else {
            match with_backoff(&self.retry, "generate answer", || {
                self.generator.generate(query, &chunks)
            })
            .await
            {
                Ok(text) => text,
                Err(e) => {
                    tracing::warn!(error = %e, "answer generation failed, returning citations only");
                    None
                }
            }
        };

        let mut citations: Vec<Citation> = Vec::new();
        for chunk in &chunks {
            if !citations
                .iter()
                .any(|c| c.message_id == chunk.citation.message_id)
            {
                citations.push(chunk.citation.clone());
            }
        }

        let coverage =
            compute_coverage(self.store, self.vectors, casefile_id, &model_version).await?;

        Ok(Answer {
            casefile_id: casefile_id.to_string(),
            query: query.to_string(),
            text,
            chunks,
            citations,
            coverage,
            model_version,
        })
    }
}

/// `cf ask <casefile_id> "<query>" [--k]`
pub async fn run_ask(config: &Config, casefile_id: &str, query: &str, k: Option<usize>) -> Result<()> {
    if !config.embedding.is_enabled() {
        anyhow::bail!("Asking requires embeddings. Set [embedding] provider in config.");
    }

    let provider = embedding::create_provider(&config.embedding)?;
    let generator = answer::create_generator(&config.answer)?;
    let pool = db::connect(config).await?;
    let store = MessageStore::new(pool.clone(), config.workers.claim_ttl_secs);
    let vectors = SqliteVectorStore::new(pool.clone());
    let assembler = Assembler::new(
        &store,
        &vectors,
        provider.as_ref(),
        generator.as_ref(),
        RetryPolicy::new(
            config.embedding.max_retries,
            config.embedding.backoff_base_ms,
            config.embedding.backoff_max_ms,
        ),
        config.retrieval.top_k,
    );

    let answer = assembler.ask(casefile_id, query, k).await;
    pool.close().await;
    let answer = answer?;

    if let Some(text) = &answer.text {
        println!("{}\n", text);
    }

    if answer.chunks.is_empty() {
        println!("No results.");
    }
    for (i, chunk) in answer.chunks.iter().enumerate() {
        let date = chrono::DateTime::from_timestamp(chunk.citation.date, 0)
            .map(|dt| dt.format("%Y-%m-%d").to_string())
            .unwrap_or_default();
        println!(
            "{}. [{:.2}] {} | {} | {}",
            i + 1,
            chunk.score,
            date,
            chunk.citation.from,
            chunk.citation.subject
        );
        println!("    message: {}", chunk.citation.message_id);
        let snippet: String = chunk.text.chars().take(200).collect();
        println!("    {}", snippet.replace('\n', " "));
        println!();
    }

    println!(
        "coverage: {} of {} messages embedded{}",
        answer.coverage.embedded,
        answer.coverage.total,
        if answer.is_complete() { "" } else { " (incomplete)" }
    );
    Ok(())
}
