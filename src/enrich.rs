//! Enrichment worker.
//!
//! Given a casefile, brings every member message from `METADATA_SYNCED`
//! to `CHUNKED`: claim, fetch the raw body, decode and clean it, chunk it,
//! then `mark_body_fetched` and `mark_chunked`.
//!
//! Safe to re-run. Members at `CHUNKED` or later are skipped without a
//! provider call; a member left at `BODY_FETCHED` by an interrupted run is
//! re-chunked from its stored body without re-fetching. A claim lost to
//! another worker is a skip, not an error.
//!
//! Members are processed with up to `concurrency` in flight; each produces
//! a partial report that is folded into the run's report.

use anyhow::{bail, Result};
use futures::stream::{self, StreamExt};
use serde::Serialize;

use crate::casefile;
use crate::chunk::{build_chunks, create_strategy, ChunkStrategy};
use crate::config::Config;
use crate::db;
use crate::extract;
use crate::mail::{create_mail_provider, MailProvider};
use crate::models::{MessageRecord, ProcessingState};
use crate::retry::{with_backoff, RetryPolicy};
use crate::store::{content_hash, MessageStore};
use crate::vector_store::{SqliteVectorStore, VectorStore};

#[derive(Debug, Clone, Default, Serialize)]
pub struct EnrichReport {
    pub members: usize,
    /// Bodies fetched from the provider.
    pub fetched: u64,
    /// Messages re-chunked from a stored body.
    pub recovered: u64,
    pub chunks_written: u64,
    /// Members already at `CHUNKED` or later.
    pub already_done: u64,
    pub skipped_claimed: u64,
    /// Refresh only: bodies whose content hash changed.
    pub changed: u64,
    /// Refresh only: bodies confirmed unchanged.
    pub unchanged: u64,
    pub failed: Vec<String>,
}

impl EnrichReport {
    fn absorb(&mut self, other: EnrichReport) {
        self.fetched += other.fetched;
        self.recovered += other.recovered;
        self.chunks_written += other.chunks_written;
        self.already_done += other.already_done;
        self.skipped_claimed += other.skipped_claimed;
        self.changed += other.changed;
        self.unchanged += other.unchanged;
        self.failed.extend(other.failed);
    }
}

pub struct EnrichmentWorker<'a> {
    store: &'a MessageStore,
    provider: &'a dyn MailProvider,
    vectors: &'a dyn VectorStore,
    strategy: &'a dyn ChunkStrategy,
    retry: RetryPolicy,
    worker_id: String,
    concurrency: usize,
}

impl<'a> EnrichmentWorker<'a> {
    pub fn new(
        store: &'a MessageStore,
        provider: &'a dyn MailProvider,
        vectors: &'a dyn VectorStore,
        strategy: &'a dyn ChunkStrategy,
        retry: RetryPolicy,
        worker_id: impl Into<String>,
    ) -> Self {
        Self {
            store,
            provider,
            vectors,
            strategy,
            retry,
            worker_id: worker_id.into(),
            concurrency: 1,
        }
    }

    /// Process up to `n` members at once.
    pub fn with_concurrency(mut self, n: usize) -> Self {
        self.concurrency = n.max(1);
        self
    }

    pub async fn run(&self, casefile_id: &str) -> Result<EnrichReport> {
        let members = self.members(casefile_id).await?;
        let partials: Vec<Result<EnrichReport>> = stream::iter(&members)
            .map(|record| self.enrich_one(record))
            .buffer_unordered(self.concurrency)
            .collect()
            .await;
        let report = fold_reports(members.len(), partials)?;

        tracing::info!(
            casefile_id,
            fetched = report.fetched,
            recovered = report.recovered,
            already_done = report.already_done,
            failed = report.failed.len(),
            "enrichment run finished"
        );
        Ok(report)
    }

    /// Re-fetch the bodies of processed members and re-process only those
    /// whose content hash changed. Their chunks and embedding records are
    /// invalidated first.
    pub async fn refresh(&self, casefile_id: &str) -> Result<EnrichReport> {
        let members = self.members(casefile_id).await?;
        let partials: Vec<Result<EnrichReport>> = stream::iter(&members)
            .filter(|record| {
                std::future::ready(record.processing_state >= ProcessingState::BodyFetched)
            })
            .map(|record| self.refresh_one(record))
            .buffer_unordered(self.concurrency)
            .collect()
            .await;
        let report = fold_reports(members.len(), partials)?;

        tracing::info!(
            casefile_id,
            changed = report.changed,
            unchanged = report.unchanged,
            failed = report.failed.len(),
            "refresh finished"
        );
        Ok(report)
    }

    async fn enrich_one(&self, record: &MessageRecord) -> Result<EnrichReport> {
        let mut report = EnrichReport::default();
        match record.processing_state {
            ProcessingState::Discovered => {
                tracing::debug!(message_id = %record.message_id, "member has no metadata yet");
            }
            ProcessingState::MetadataSynced => self.fetch_and_chunk(record, &mut report).await?,
            ProcessingState::BodyFetched => self.rechunk_stored(record, &mut report).await?,
            ProcessingState::Chunked | ProcessingState::Embedded => report.already_done += 1,
        }
        Ok(report)
    }

    async fn refresh_one(&self, record: &MessageRecord) -> Result<EnrichReport> {
        let mut report = EnrichReport::default();
        let Some(raw) = self.fetch_body(&record.message_id).await else {
            report.failed.push(record.message_id.clone());
            return Ok(report);
        };
        report.fetched += 1;

        if record.content_hash.as_deref() == Some(content_hash(&raw).as_str()) {
            report.unchanged += 1;
            return Ok(report);
        }

        let invalidated = self.store.resync(&record.message_id).await?;
        self.vectors.delete_chunks(&invalidated).await?;
        report.changed += 1;
        tracing::info!(
            message_id = %record.message_id,
            invalidated = invalidated.len(),
            "body changed upstream, re-synced"
        );

        if !self
            .store
            .claim_body_fetch(&record.message_id, &self.worker_id)
            .await?
        {
            report.skipped_claimed += 1;
            return Ok(report);
        }
        self.store_and_chunk(record, &raw, &mut report).await?;
        Ok(report)
    }

    async fn members(&self, casefile_id: &str) -> Result<Vec<MessageRecord>> {
        if casefile::get(self.store.pool(), casefile_id).await?.is_none() {
            bail!("unknown casefile: {}", casefile_id);
        }
        self.store.records_for_casefile(casefile_id).await
    }

    async fn fetch_and_chunk(&self, record: &MessageRecord, report: &mut EnrichReport) -> Result<()> {
        let message_id = &record.message_id;
        if !self.store.claim_body_fetch(message_id, &self.worker_id).await? {
            tracing::debug!(message_id, "body fetch claimed by another worker");
            report.skipped_claimed += 1;
            return Ok(());
        }

        let Some(raw) = self.fetch_body(message_id).await else {
            self.store.release_claim(message_id, &self.worker_id).await?;
            report.failed.push(message_id.clone());
            return Ok(());
        };
        report.fetched += 1;
        self.store_and_chunk(record, &raw, report).await
    }

    /// Fetch with backoff; `None` once retries are exhausted.
    async fn fetch_body(&self, message_id: &str) -> Option<Vec<u8>> {
        match with_backoff(&self.retry, "get_body", || self.provider.get_body(message_id)).await {
            Ok(raw) => Some(raw),
            Err(e) => {
                tracing::warn!(message_id, error = %e, "body fetch failed");
                None
            }
        }
    }

    /// Persist a fetched body under the caller's claim, then chunk it.
    async fn store_and_chunk(
        &self,
        record: &MessageRecord,
        raw: &[u8],
        report: &mut EnrichReport,
    ) -> Result<()> {
        if !self
            .store
            .mark_body_fetched(&record.message_id, &self.worker_id, raw)
            .await?
        {
            // Claim expired and was taken over.
            report.skipped_claimed += 1;
            return Ok(());
        }
        self.chunk_body(record, raw, report).await
    }

    async fn rechunk_stored(&self, record: &MessageRecord, report: &mut EnrichReport) -> Result<()> {
        let Some(raw) = self.store.stored_body(&record.message_id).await? else {
            tracing::warn!(message_id = %record.message_id, "body_fetched without a stored body");
            report.failed.push(record.message_id.clone());
            return Ok(());
        };
        report.recovered += 1;
        self.chunk_body(record, &raw, report).await
    }

    async fn chunk_body(
        &self,
        record: &MessageRecord,
        raw: &[u8],
        report: &mut EnrichReport,
    ) -> Result<()> {
        let text = match extract::clean_body(raw) {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(message_id = %record.message_id, error = %e, "body could not be decoded");
                report.failed.push(record.message_id.clone());
                return Ok(());
            }
        };

        let position = self.store.thread_position(&record.message_id).await?;
        let chunks = build_chunks(self.strategy, record, position, &text);
        if self.store.mark_chunked(&record.message_id, &chunks).await? {
            report.chunks_written += chunks.len() as u64;
        } else {
            tracing::debug!(message_id = %record.message_id, "already chunked by another worker");
        }
        Ok(())
    }
}

fn fold_reports(members: usize, partials: Vec<Result<EnrichReport>>) -> Result<EnrichReport> {
    let mut report = EnrichReport {
        members,
        ..Default::default()
    };
    for partial in partials {
        report.absorb(partial?);
    }
    report.failed.sort();
    Ok(report)
}

/// `cf enrich <casefile_id> [--refresh]`
pub async fn run_enrich(config: &Config, casefile_id: &str, refresh: bool) -> Result<()> {
    let provider = create_mail_provider(config)?;
    let pool = db::connect(config).await?;
    let store = MessageStore::new(pool.clone(), config.workers.claim_ttl_secs);
    let vectors = SqliteVectorStore::new(pool.clone());
    let strategy = create_strategy(&config.chunking);
    let retry = RetryPolicy::new(
        config.ingest.max_retries,
        config.ingest.backoff_base_ms,
        config.ingest.backoff_max_ms,
    );

    let worker = EnrichmentWorker::new(
        &store,
        provider.as_ref(),
        &vectors,
        strategy.as_ref(),
        retry,
        config.workers.worker_id(),
    )
    .with_concurrency(config.workers.concurrency);
    let report = if refresh {
        worker.refresh(casefile_id).await?
    } else {
        worker.run(casefile_id).await?
    };

    println!("enrich {}{}", casefile_id, if refresh { " (refresh)" } else { "" });
    println!("  members: {}", report.members);
    println!("  bodies fetched: {}", report.fetched);
    if refresh {
        println!("  changed: {}", report.changed);
        println!("  unchanged: {}", report.unchanged);
    } else {
        println!("  recovered from stored body: {}", report.recovered);
        println!("  already chunked: {}", report.already_done);
    }
    println!("  chunks written: {}", report.chunks_written);
    if report.skipped_claimed > 0 {
        println!("  claimed by other workers: {}", report.skipped_claimed);
    }
    if !report.failed.is_empty() {
        println!("  failed: {}", report.failed.join(", "));
    }

    pool.close().await;
    Ok(())
}
