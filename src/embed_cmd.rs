//! Embedding indexer.
//!
//! Embeds the chunks of one casefile, skipping every chunk whose stored
//! fingerprint already matches its current text and model version. A
//! fully embedded casefile re-indexed with no changes makes zero provider
//! calls. When another casefile already holds a vector for the identical
//! fingerprint, that vector is copied instead of calling the provider.
//!
//! Records produced under a different model version are left alone and
//! reported as stale; only a `reindex` run replaces them.

use anyhow::{bail, Result};
use serde::Serialize;
use std::collections::{HashMap, HashSet};

use crate::casefile;
use crate::config::Config;
use crate::db;
use crate::embedding::{self, fingerprint, EmbeddingProvider};
use crate::models::{Chunk, EmbeddingRecord, ProcessingState};
use crate::retry::{with_backoff, RetryPolicy};
use crate::store::MessageStore;
use crate::vector_store::{SqliteVectorStore, StoredFingerprint, VectorStore};

/// How many member messages of a casefile are fully embedded under a
/// model version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Coverage {
    pub embedded: usize,
    pub total: usize,
}

impl Coverage {
    pub fn is_complete(&self) -> bool {
        self.embedded == self.total
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct IndexReport {
    pub casefile_id: String,
    pub model_version: String,
    pub chunks: usize,
    /// Vectors obtained from the embedding provider.
    pub embedded: u64,
    /// Vectors copied from an identical fingerprint.
    pub reused: u64,
    pub up_to_date: u64,
    /// Records under another model version, left for `reindex`.
    pub stale_model: u64,
    pub skipped_claimed: u64,
    /// Records whose chunk no longer exists.
    pub pruned: u64,
    /// Chunks that exhausted retries; they stay `CHUNKED`.
    pub failed: Vec<String>,
    pub coverage: Option<Coverage>,
    pub ready: bool,
}

pub struct EmbeddingIndexer<'a> {
    store: &'a MessageStore,
    vectors: &'a dyn VectorStore,
    provider: &'a dyn EmbeddingProvider,
    retry: RetryPolicy,
    worker_id: String,
}

impl<'a> EmbeddingIndexer<'a> {
    pub fn new(
        store: &'a MessageStore,
        vectors: &'a dyn VectorStore,
        provider: &'a dyn EmbeddingProvider,
        retry: RetryPolicy,
        worker_id: impl Into<String>,
    ) -> Self {
        Self {
            store,
            vectors,
            provider,
            retry,
            worker_id: worker_id.into(),
        }
    }

    pub async fn run(&self, casefile_id: &str, reindex: bool) -> Result<IndexReport> {
        if casefile::get(self.store.pool(), casefile_id).await?.is_none() {
            bail!("unknown casefile: {}", casefile_id);
        }

        let model_version = self.provider.model_version().to_string();
        let chunks = self.store.chunks_for_casefile(casefile_id).await?;
        let stored = self.vectors.fingerprints(casefile_id).await?;

        let mut report = IndexReport {
            casefile_id: casefile_id.to_string(),
            model_version: model_version.clone(),
            chunks: chunks.len(),
            ..Default::default()
        };

        let live: HashSet<&str> = chunks.iter().map(|c| c.chunk_id.as_str()).collect();
        let orphans: Vec<String> = stored
            .keys()
            .filter(|id| !live.contains(id.as_str()))
            .cloned()
            .collect();
        if !orphans.is_empty() {
            report.pruned = self.vectors.delete_chunks(&orphans).await?;
        }

        for chunk in &chunks {
            let fp = fingerprint(&chunk.text, &model_version);
            match stored.get(&chunk.chunk_id) {
                Some(existing) if existing.fingerprint == fp => {
                    // A crash between upsert and mark_embedded leaves the
                    // chunk unmarked; finish the transition under a claim.
                    if chunk.embedding_fingerprint.as_deref() != Some(fp.as_str())
                        && !self.finish_unmarked(chunk, &fp).await?
                    {
                        report.skipped_claimed += 1;
                        continue;
                    }
                    report.up_to_date += 1;
                    continue;
                }
                Some(existing) if existing.model_version != model_version && !reindex => {
                    tracing::debug!(
                        chunk_id = %chunk.chunk_id,
                        stored = %existing.model_version,
                        "record from another model version"
                    );
                    report.stale_model += 1;
                    continue;
                }
                _ => {}
            }

            self.index_chunk(casefile_id, chunk, &fp, &mut report).await?;
        }

        let coverage =
            compute_coverage(self.store, self.vectors, casefile_id, &model_version).await?;
        report.ready = report.failed.is_empty()
            && report.stale_model == 0
            && report.skipped_claimed == 0
            && coverage.is_complete();
        report.coverage = Some(coverage);

        tracing::info!(
            casefile_id,
            embedded = report.embedded,
            reused = report.reused,
            up_to_date = report.up_to_date,
            failed = report.failed.len(),
            ready = report.ready,
            "embedding run finished"
        );
        Ok(report)
    }

    /// Record an existing matching vector on an unmarked chunk.
    async fn finish_unmarked(&self, chunk: &Chunk, fp: &str) -> Result<bool> {
        if !self.store.claim_chunk(&chunk.chunk_id, &self.worker_id).await? {
            return Ok(false);
        }
        let marked = self
            .store
            .mark_embedded(&chunk.chunk_id, &self.worker_id, &chunk.text, fp)
            .await?;
        if !marked {
            self.store
                .release_chunk_claim(&chunk.chunk_id, &self.worker_id)
                .await?;
        }
        Ok(marked)
    }

    async fn index_chunk(
        &self,
        casefile_id: &str,
        chunk: &Chunk,
        fp: &str,
        report: &mut IndexReport,
    ) -> Result<()> {
        if !self.store.claim_chunk(&chunk.chunk_id, &self.worker_id).await? {
            tracing::debug!(chunk_id = %chunk.chunk_id, "chunk claimed by another worker");
            report.skipped_claimed += 1;
            return Ok(());
        }

        let (vector, reused) = match self.vectors.find_vector(fp).await? {
            Some(vector) => (vector, true),
            None => {
                let result = with_backoff(&self.retry, "embed", || {
                    self.provider.embed(&chunk.text)
                })
                .await;
                match result {
                    Ok(vector) => (vector, false),
                    Err(e) => {
                        tracing::warn!(chunk_id = %chunk.chunk_id, error = %e, "embedding failed");
                        self.store
                            .release_chunk_claim(&chunk.chunk_id, &self.worker_id)
                            .await?;
                        report.failed.push(chunk.chunk_id.clone());
                        return Ok(());
                    }
                }
            }
        };

        self.vectors
            .upsert(&EmbeddingRecord {
                chunk_id: chunk.chunk_id.clone(),
                casefile_id: casefile_id.to_string(),
                vector,
                fingerprint: fp.to_string(),
                model_version: self.provider.model_version().to_string(),
            })
            .await?;

        if !self
            .store
            .mark_embedded(&chunk.chunk_id, &self.worker_id, &chunk.text, fp)
            .await?
        {
            // Re-synced or re-chunked while we were embedding: the vector
            // describes text the chunk no longer holds.
            tracing::debug!(chunk_id = %chunk.chunk_id, "chunk replaced during embedding");
            self.vectors
                .delete_chunks(std::slice::from_ref(&chunk.chunk_id))
                .await?;
            report.skipped_claimed += 1;
            return Ok(());
        }

        if reused {
            report.reused += 1;
        } else {
            report.embedded += 1;
        }
        Ok(())
    }
}

/// Count member messages whose every chunk has a current record under
/// `model_version` in this casefile.
pub async fn compute_coverage(
    store: &MessageStore,
    vectors: &dyn VectorStore,
    casefile_id: &str,
    model_version: &str,
) -> Result<Coverage> {
    let members = store.records_for_casefile(casefile_id).await?;
    let stored = vectors.fingerprints(casefile_id).await?;

    let mut by_message: HashMap<String, Vec<Chunk>> = HashMap::new();
    for chunk in store.chunks_for_casefile(casefile_id).await? {
        by_message.entry(chunk.message_id.clone()).or_default().push(chunk);
    }

    let is_current = |chunk: &Chunk| {
        stored.get(&chunk.chunk_id).is_some_and(|s: &StoredFingerprint| {
            s.model_version == model_version
                && s.fingerprint == fingerprint(&chunk.text, model_version)
        })
    };

    let embedded = members
        .iter()
        .filter(|m| m.processing_state == ProcessingState::Embedded)
        .filter(|m| {
            by_message
                .get(&m.message_id)
                .is_some_and(|chunks| !chunks.is_empty() && chunks.iter().all(|c| is_current(c)))
        })
        .count();

    Ok(Coverage {
        embedded,
        total: members.len(),
    })
}

/// `cf embed <casefile_id> [--reindex]`
pub async fn run_embed(config: &Config, casefile_id: &str, reindex: bool) -> Result<()> {
    if !config.embedding.is_enabled() {
        bail!("Embedding provider is disabled. Set [embedding] provider in config.");
    }

    let provider = embedding::create_provider(&config.embedding)?;
    let pool = db::connect(config).await?;
    let store = MessageStore::new(pool.clone(), config.workers.claim_ttl_secs);
    let vectors = SqliteVectorStore::new(pool.clone());
    let retry = RetryPolicy::new(
        config.embedding.max_retries,
        config.embedding.backoff_base_ms,
        config.embedding.backoff_max_ms,
    );

    let indexer = EmbeddingIndexer::new(
        &store,
        &vectors,
        provider.as_ref(),
        retry,
        config.workers.worker_id(),
    );
    let report = indexer.run(casefile_id, reindex).await?;

    println!("embed {}", casefile_id);
    println!("  model: {}", report.model_version);
    println!("  chunks: {}", report.chunks);
    println!("  embedded: {}", report.embedded);
    println!("  reused: {}", report.reused);
    println!("  up to date: {}", report.up_to_date);
    if report.stale_model > 0 {
        println!(
            "  stale model: {} (run with --reindex to re-embed)",
            report.stale_model
        );
    }
    if report.skipped_claimed > 0 {
        println!("  claimed by other workers: {}", report.skipped_claimed);
    }
    if report.pruned > 0 {
        println!("  pruned: {}", report.pruned);
    }
    if !report.failed.is_empty() {
        println!("  failed: {}", report.failed.len());
    }
    if let Some(coverage) = report.coverage {
        println!(
            "  coverage: {} of {} messages embedded",
            coverage.embedded, coverage.total
        );
    }
    println!("  ready: {}", if report.ready { "yes" } else { "no" });

    pool.close().await;
    Ok(())
}
