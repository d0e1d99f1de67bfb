//! Ingestion worker.
//!
//! Pulls message ids and metadata from a [`MailProvider`] and upserts them
//! into the [`MessageStore`]. Bodies are never touched here.
//!
//! Runs are finite and restartable. The checkpoint for a provider is
//! committed after every page, so an interrupted run resumes from the last
//! committed page token (at-least-once; `upsert_metadata` absorbs
//! duplicates). When a listing completes, the page token is cleared and the
//! highest message date seen becomes the `since` bound of the next run.
//!
//! A message whose metadata fetch exhausts retries is recorded as
//! `DISCOVERED` and retried at the start of the next run, so one bad
//! message never blocks the checkpoint.
//!
//! Metadata for a page is fetched with up to `concurrency` requests in
//! flight; results are applied to the store in listing order.

use anyhow::{bail, Result};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use sqlx::{Row, SqlitePool};

use crate::config::{Config, IngestConfig};
use crate::db;
use crate::error::ProviderError;
use crate::mail::{create_mail_provider, ListCursor, MailProvider};
use crate::models::MessageMetadata;
use crate::retry::{with_backoff, RetryPolicy};
use crate::store::{MessageStore, UpsertOutcome};
use crate::vector_store::{SqliteVectorStore, VectorStore};

/// Re-list this much history before the high-water mark on incremental runs;
/// providers can deliver messages whose date predates the previous run.
const SINCE_OVERLAP_SECS: i64 = 86_400;

/// Decides whether a message becomes a MessageRecord at all. Returns
/// `true` to keep.
pub type IngestFilter = Box<dyn Fn(&MessageMetadata) -> bool + Send + Sync>;

/// Filter that drops messages carrying any of the given provider labels
/// (e.g. `SPAM`, `CATEGORY_PROMOTIONS`).
pub fn label_filter(exclude_labels: Vec<String>) -> IngestFilter {
    Box::new(move |meta: &MessageMetadata| {
        !meta
            .labels
            .iter()
            .any(|label| exclude_labels.iter().any(|ex| ex.eq_ignore_ascii_case(label)))
    })
}

#[derive(Debug, Clone)]
pub struct IngestOptions {
    /// Ignore the checkpoint and list the whole mailbox.
    pub full: bool,
    /// Stop after this many listed ids.
    pub limit: Option<usize>,
    pub page_size: usize,
    /// Metadata fetches in flight at once.
    pub concurrency: usize,
    pub retry: RetryPolicy,
}

impl IngestOptions {
    pub fn from_config(config: &Config) -> Self {
        let ingest: &IngestConfig = &config.ingest;
        Self {
            full: false,
            limit: None,
            page_size: ingest.page_size,
            concurrency: config.workers.concurrency,
            retry: RetryPolicy::new(
                ingest.max_retries,
                ingest.backoff_base_ms,
                ingest.backoff_max_ms,
            ),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestReport {
    pub listed: u64,
    pub created: u64,
    pub updated: u64,
    pub resynced: u64,
    pub excluded: u64,
    /// Metadata fetch failed; left as `DISCOVERED` for the next run.
    pub deferred: u64,
    /// `DISCOVERED` records from earlier runs that are now synced.
    pub recovered: u64,
    pub pages: u64,
    /// The listing reached its end (not cut short by `limit`).
    pub completed: bool,
}

/// Persisted listing position for one provider.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Checkpoint {
    pub page_token: Option<String>,
    pub since: Option<i64>,
    /// Highest message date seen by the run in progress.
    pub run_high_water: Option<i64>,
}

pub struct IngestionWorker<'a> {
    store: &'a MessageStore,
    provider: &'a dyn MailProvider,
    /// Re-sync drops vector records of the chunks it invalidates.
    vectors: &'a dyn VectorStore,
    filter: IngestFilter,
    options: IngestOptions,
}

impl<'a> IngestionWorker<'a> {
    pub fn new(
        store: &'a MessageStore,
        provider: &'a dyn MailProvider,
        vectors: &'a dyn VectorStore,
        filter: IngestFilter,
        options: IngestOptions,
    ) -> Self {
        Self {
            store,
            provider,
            vectors,
            filter,
            options,
        }
    }

    /// Run one ingestion pass, tracked as a sync job.
    ///
    /// Fails without doing anything if another run for the same provider is
    /// already active.
    pub async fn run(&self) -> Result<IngestReport> {
        let pool = self.store.pool();
        let job_id = begin_job(pool, self.provider.name()).await?;
        let mut report = IngestReport::default();

        let result = self.run_inner(&mut report).await;
        let processed = (report.listed + report.recovered) as i64;
        match &result {
            Ok(()) => finish_job(pool, &job_id, "succeeded", processed, None).await?,
            Err(e) => {
                finish_job(pool, &job_id, "failed", processed, Some(&e.to_string())).await?;
            }
        }
        result?;

        tracing::info!(
            provider = self.provider.name(),
            listed = report.listed,
            created = report.created,
            resynced = report.resynced,
            excluded = report.excluded,
            deferred = report.deferred,
            "ingestion run finished"
        );
        Ok(report)
    }

    async fn run_inner(&self, report: &mut IngestReport) -> Result<()> {
        // Retry the backlog of ids whose metadata never arrived.
        let backlog = self.store.discovered_ids(self.options.page_size).await?;
        let fetched = self.fetch_all(&backlog).await;
        for (message_id, result) in backlog.iter().zip(fetched) {
            if let Some(date) = self.apply(message_id, result, report).await? {
                report.recovered += 1;
                tracing::debug!(message_id, date, "recovered discovered message");
            }
        }

        let pool = self.store.pool();
        let provider = self.provider.name();
        let mut checkpoint = if self.options.full {
            Checkpoint::default()
        } else {
            load_checkpoint(pool, provider).await?
        };

        loop {
            let cursor = ListCursor {
                page_token: checkpoint.page_token.clone(),
                since: checkpoint.since.map(|s| s - SINCE_OVERLAP_SECS),
            };
            let page = with_backoff(&self.options.retry, "list_message_ids", || {
                self.provider
                    .list_message_ids(&cursor, self.options.page_size)
            })
            .await?;
            report.pages += 1;

            let listed = page.message_ids.len();
            let take = self.options.limit.map_or(listed, |limit| {
                limit.saturating_sub(report.listed as usize).min(listed)
            });
            let batch = &page.message_ids[..take];
            report.listed += take as u64;

            let fetched = self.fetch_all(batch).await;
            for (message_id, result) in batch.iter().zip(fetched) {
                if let Some(date) = self.apply(message_id, result, report).await? {
                    checkpoint.run_high_water =
                        Some(checkpoint.run_high_water.map_or(date, |hw| hw.max(date)));
                }
            }

            if take < listed {
                // Partial page: keep the current token so the next run
                // re-lists it.
                return Ok(());
            }

            match page.next_page_token {
                Some(token) => {
                    checkpoint.page_token = Some(token);
                    save_checkpoint(pool, provider, &checkpoint).await?;
                }
                None => {
                    checkpoint = Checkpoint {
                        page_token: None,
                        since: checkpoint.run_high_water.or(checkpoint.since),
                        run_high_water: None,
                    };
                    save_checkpoint(pool, provider, &checkpoint).await?;
                    report.completed = true;
                    return Ok(());
                }
            }
        }
    }

    async fn fetch_metadata(&self, message_id: &str) -> Result<MessageMetadata, ProviderError> {
        with_backoff(&self.options.retry, "get_metadata", || {
            self.provider.get_metadata(message_id)
        })
        .await
    }

    /// Fetch metadata for `ids` concurrently. Results keep the order of `ids`.
    async fn fetch_all(&self, ids: &[String]) -> Vec<Result<MessageMetadata, ProviderError>> {
        stream::iter(ids)
            .map(|id| self.fetch_metadata(id))
            .buffered(self.options.concurrency.max(1))
            .collect()
            .await
    }

    /// Filter and upsert one fetched message. Returns the message date when
    /// a record was written.
    async fn apply(
        &self,
        message_id: &str,
        fetched: Result<MessageMetadata, ProviderError>,
        report: &mut IngestReport,
    ) -> Result<Option<i64>> {
        let meta = match fetched {
            Ok(meta) => meta,
            Err(e) => {
                tracing::warn!(message_id, error = %e, "metadata fetch failed, deferring");
                self.store.record_discovered(message_id).await?;
                report.deferred += 1;
                return Ok(None);
            }
        };

        if meta.message_id != message_id {
            bail!(
                "provider returned metadata for '{}' when asked for '{}'",
                meta.message_id,
                message_id
            );
        }

        if !(self.filter)(&meta) {
            self.store.forget_discovered(message_id).await?;
            report.excluded += 1;
            return Ok(None);
        }

        match self.store.upsert_metadata(&meta).await? {
            UpsertOutcome::Created => report.created += 1,
            UpsertOutcome::Updated => report.updated += 1,
            UpsertOutcome::Resynced { invalidated_chunks } => {
                let dropped = self.vectors.delete_chunks(&invalidated_chunks).await?;
                tracing::info!(
                    message_id,
                    invalidated = invalidated_chunks.len(),
                    vectors_dropped = dropped,
                    "message edited upstream, re-synced"
                );
                report.resynced += 1;
            }
        }
        Ok(Some(meta.date))
    }
}

/// `cf sync [--full] [--limit N]`
pub async fn run_sync(config: &Config, full: bool, limit: Option<usize>) -> Result<()> {
    let provider = create_mail_provider(config)?;
    let pool = db::connect(config).await?;
    let store = MessageStore::new(pool.clone(), config.workers.claim_ttl_secs);
    let vectors = SqliteVectorStore::new(pool.clone());

    let mut options = IngestOptions::from_config(config);
    options.full = full;
    options.limit = limit;

    let worker = IngestionWorker::new(
        &store,
        provider.as_ref(),
        &vectors,
        label_filter(config.ingest.exclude_labels.clone()),
        options,
    );
    let report = worker.run().await;
    pool.close().await;
    let report = report?;

    println!("sync {}{}", provider.name(), if full { " (full)" } else { "" });
    println!("  listed: {}", report.listed);
    println!("  created: {}", report.created);
    println!("  updated: {}", report.updated);
    println!("  re-synced: {}", report.resynced);
    println!("  excluded: {}", report.excluded);
    if report.recovered > 0 {
        println!("  recovered: {}", report.recovered);
    }
    if report.deferred > 0 {
        println!("  deferred: {} (retried next run)", report.deferred);
    }
    println!(
        "  checkpoint: {}",
        if report.completed { "listing complete" } else { "saved mid-listing" }
    );
    Ok(())
}

pub async fn load_checkpoint(pool: &SqlitePool, provider: &str) -> Result<Checkpoint> {
    let row = sqlx::query(
        "SELECT page_token, since_ts, run_high_water FROM checkpoints WHERE provider = ?",
    )
    .bind(provider)
    .fetch_optional(pool)
    .await?;

    Ok(match row {
        Some(row) => Checkpoint {
            page_token: row.try_get("page_token")?,
            since: row.try_get("since_ts")?,
            run_high_water: row.try_get("run_high_water")?,
        },
        None => Checkpoint::default(),
    })
}

async fn save_checkpoint(pool: &SqlitePool, provider: &str, checkpoint: &Checkpoint) -> Result<()> {
    let now = chrono::Utc::now().timestamp();
    sqlx::query(
        r#"
        INSERT INTO checkpoints (provider, page_token, since_ts, run_high_water, updated_at)
        VALUES (?, ?, ?, ?, ?)
        ON CONFLICT(provider) DO UPDATE SET
            page_token = excluded.page_token,
            since_ts = excluded.since_ts,
            run_high_water = excluded.run_high_water,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(provider)
    .bind(&checkpoint.page_token)
    .bind(checkpoint.since)
    .bind(checkpoint.run_high_water)
    .bind(now)
    .execute(pool)
    .await?;

    Ok(())
}

/// Jobs left `running` longer than this are treated as crashed.
const JOB_STALE_SECS: i64 = 6 * 3600;

/// Register a running sync job, refusing if one is already active for the
/// provider.
async fn begin_job(pool: &SqlitePool, provider: &str) -> Result<String> {
    let now = chrono::Utc::now().timestamp();
    sqlx::query(
        "UPDATE sync_jobs SET status = 'abandoned', finished_at = ? WHERE provider = ? AND status = 'running' AND started_at < ?",
    )
    .bind(now)
    .bind(provider)
    .bind(now - JOB_STALE_SECS)
    .execute(pool)
    .await?;

    let job_id = uuid::Uuid::new_v4().to_string();
    let result = sqlx::query(
        r#"
        INSERT INTO sync_jobs (job_id, provider, status, started_at)
        SELECT ?, ?, 'running', ?
        WHERE NOT EXISTS (
            SELECT 1 FROM sync_jobs WHERE provider = ? AND status = 'running'
        )
        "#,
    )
    .bind(&job_id)
    .bind(provider)
    .bind(now)
    .bind(provider)
    .execute(pool)
    .await?;

    if result.rows_affected() != 1 {
        bail!("a sync job for '{}' is already running", provider);
    }
    Ok(job_id)
}

async fn finish_job(
    pool: &SqlitePool,
    job_id: &str,
    status: &str,
    progress: i64,
    error: Option<&str>,
) -> Result<()> {
    sqlx::query(
        "UPDATE sync_jobs SET status = ?, progress_current = ?, error_message = ?, finished_at = ? WHERE job_id = ?",
    )
    .bind(status)
    .bind(progress)
    .bind(error)
    .bind(chrono::Utc::now().timestamp())
    .bind(job_id)
    .execute(pool)
    .await?;
    Ok(())
}
