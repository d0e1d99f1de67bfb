//! Pipeline status and casefile readiness.
//!
//! `cf status` without an id summarises the whole store: how many messages
//! sit in each processing state and when the mailbox was last synced. With
//! a casefile id it reports member states, chunk count, and embedding
//! coverage under the configured model, so a user can tell whether the
//! casefile is ready to query.

use anyhow::Result;
use serde::Serialize;
use sqlx::Row;

use crate::casefile;
use crate::config::Config;
use crate::db;
use crate::embed_cmd::{compute_coverage, Coverage};
use crate::embedding::configured_model_version;
use crate::models::ProcessingState;
use crate::store::MessageStore;
use crate::vector_store::{SqliteVectorStore, VectorStore};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StateCount {
    pub state: ProcessingState,
    pub count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CasefileStatus {
    pub casefile_id: String,
    pub name: String,
    pub version: i64,
    pub parent_id: Option<String>,
    pub members: usize,
    /// Member count per processing state, in pipeline order.
    pub states: Vec<StateCount>,
    pub chunks: usize,
    /// The configured embedding model version, if any.
    pub model_version: Option<String>,
    pub coverage: Option<Coverage>,
    /// Model versions holding records for this casefile.
    pub indexed_versions: Vec<String>,
    /// Indexed versions other than the configured one.
    pub stale_versions: Vec<String>,
    pub ready: bool,
}

/// Status of one casefile, or `None` if it does not exist.
pub async fn casefile_status(
    store: &MessageStore,
    vectors: &dyn VectorStore,
    casefile_id: &str,
    model_version: Option<&str>,
) -> Result<Option<CasefileStatus>> {
    let Some(casefile) = casefile::get(store.pool(), casefile_id).await? else {
        return Ok(None);
    };

    let members = store.records_for_casefile(casefile_id).await?;
    let states = ProcessingState::ALL
        .into_iter()
        .map(|state| StateCount {
            state,
            count: members.iter().filter(|m| m.processing_state == state).count() as i64,
        })
        .collect();
    let chunks = store.chunks_for_casefile(casefile_id).await?.len();

    let indexed_versions = vectors.model_versions(casefile_id).await?;
    let stale_versions = indexed_versions
        .iter()
        .filter(|v| Some(v.as_str()) != model_version)
        .cloned()
        .collect::<Vec<_>>();

    let coverage = match model_version {
        Some(version) => Some(compute_coverage(store, vectors, casefile_id, version).await?),
        None => None,
    };
    let ready = coverage.is_some_and(|c| c.is_complete()) && stale_versions.is_empty();

    Ok(Some(CasefileStatus {
        casefile_id: casefile.casefile_id,
        name: casefile.name,
        version: casefile.version,
        parent_id: casefile.parent_id,
        members: members.len(),
        states,
        chunks,
        model_version: model_version.map(str::to_string),
        coverage,
        indexed_versions,
        stale_versions,
        ready,
    }))
}

/// `cf status [<casefile_id>]`
pub async fn run_status(config: &Config, casefile_id: Option<&str>) -> Result<()> {
    let pool = db::connect(config).await?;
    let store = MessageStore::new(pool.clone(), config.workers.claim_ttl_secs);

    match casefile_id {
        Some(id) => {
            let vectors = SqliteVectorStore::new(pool.clone());
            let model_version = configured_model_version(&config.embedding);
            let status = casefile_status(&store, &vectors, id, model_version.as_deref()).await?;
            pool.close().await;
            match status {
                Some(status) => print_casefile_status(&status),
                None => anyhow::bail!("unknown casefile: {}", id),
            }
        }
        None => {
            print_overview(config, &store).await?;
            pool.close().await;
        }
    }
    Ok(())
}

fn print_casefile_status(status: &CasefileStatus) {
    println!("Casefile {} ({})", status.casefile_id, status.name);
    print!("  version:   {}", status.version);
    match &status.parent_id {
        Some(parent) => println!(" (expanded from {})", parent),
        None => println!(),
    }
    println!("  members:   {}", status.members);
    for s in &status.states {
        if s.count > 0 {
            println!("    {:<16} {:>6}", s.state, s.count);
        }
    }
    println!("  chunks:    {}", status.chunks);
    match (&status.model_version, status.coverage) {
        (Some(model), Some(coverage)) => {
            println!("  model:     {}", model);
            println!(
                "  coverage:  {} / {} messages embedded",
                coverage.embedded, coverage.total
            );
        }
        _ => println!("  model:     (embedding disabled)"),
    }
    if !status.stale_versions.is_empty() {
        println!(
            "  stale:     {} (run `cf embed --reindex`)",
            status.stale_versions.join(", ")
        );
    }
    println!("  ready:     {}", if status.ready { "yes" } else { "no" });
}

async fn print_overview(config: &Config, store: &MessageStore) -> Result<()> {
    let pool = store.pool();
    let counts = store.state_counts().await?;
    let total: i64 = counts.iter().map(|(_, n)| n).sum();

    let casefiles: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM casefiles")
        .fetch_one(pool)
        .await?;
    let chunks: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
        .fetch_one(pool)
        .await?;
    let embeddings: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM embeddings")
        .fetch_one(pool)
        .await?;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("Casefile: pipeline status");
    println!("=========================");
    println!();
    println!("  Database:    {}", config.db.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!();
    println!("  Messages:    {}", total);
    for (state, count) in &counts {
        println!("    {:<16} {:>6}", state, count);
    }
    println!("  Casefiles:   {}", casefiles);
    println!("  Chunks:      {}", chunks);
    println!("  Embeddings:  {}", embeddings);

    let checkpoints = sqlx::query("SELECT provider, page_token, updated_at FROM checkpoints")
        .fetch_all(pool)
        .await?;
    if !checkpoints.is_empty() {
        println!();
        println!("  {:<16} {:<20} {}", "PROVIDER", "LAST SYNC", "LISTING");
        println!("  {}", "-".repeat(52));
        for row in &checkpoints {
            let provider: String = row.try_get("provider")?;
            let page_token: Option<String> = row.try_get("page_token")?;
            let updated_at: i64 = row.try_get("updated_at")?;
            println!(
                "  {:<16} {:<20} {}",
                provider,
                format_ts_relative(updated_at),
                if page_token.is_some() { "interrupted" } else { "complete" }
            );
        }
    }

    let last_job = sqlx::query(
        "SELECT status, progress_current, error_message FROM sync_jobs ORDER BY started_at DESC LIMIT 1",
    )
    .fetch_optional(pool)
    .await?;
    if let Some(job) = last_job {
        let status: String = job.try_get("status")?;
        let progress: i64 = job.try_get("progress_current")?;
        let error: Option<String> = job.try_get("error_message")?;
        println!();
        print!("  Last sync job: {} ({} messages)", status, progress);
        match error {
            Some(e) => println!(": {}", e),
            None => println!(),
        }
    }

    println!();
    Ok(())
}

fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Unix timestamp as a relative string ("3 hours ago").
fn format_ts_relative(ts: i64) -> String {
    let delta = chrono::Utc::now().timestamp() - ts;
    if delta < 0 {
        return format_ts_iso(ts);
    }

    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        format_ts_iso(ts)
    }
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MB");
    }

    #[test]
    fn test_format_ts_relative() {
        let now = chrono::Utc::now().timestamp();
        assert_eq!(format_ts_relative(now), "just now");
        assert_eq!(format_ts_relative(now - 7200), "2 hours ago");
        assert_eq!(format_ts_relative(now - 86400), "1 day ago");
    }
}
