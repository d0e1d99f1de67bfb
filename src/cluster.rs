//! Clustering engine.
//!
//! A pure, recomputed view over the message store: messages are grouped by
//! normalized sender domain, then by thread within each domain. Nothing is
//! persisted here; only converting a cluster into a casefile writes state.
//!
//! A thread whose messages come from several domains belongs to the domain
//! of its earliest message (ties on date broken by `message_id`). The
//! ambiguity is logged at `debug` and never blocks clustering.

use anyhow::Result;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::config::Config;
use crate::db;
use crate::models::{MessageRecord, ProcessingState};
use crate::store::MessageStore;

/// A candidate casefile: every synced message of the threads assigned to
/// one correspondent domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Cluster {
    pub domain: String,
    pub thread_ids: Vec<String>,
    pub message_ids: Vec<String>,
    pub thread_count: usize,
    pub message_count: usize,
    pub first_date: i64,
    pub last_date: i64,
}

/// Group records into clusters.
///
/// Records before `METADATA_SYNCED` are ignored. Output is ordered by
/// message count (descending), then domain, so it is stable across runs.
pub fn compute_clusters(records: &[MessageRecord]) -> Vec<Cluster> {
    let mut threads: HashMap<&str, Vec<&MessageRecord>> = HashMap::new();
    for record in records {
        if record.processing_state < ProcessingState::MetadataSynced {
            continue;
        }
        threads.entry(&record.thread_id).or_default().push(record);
    }

    let mut by_domain: BTreeMap<String, Vec<Vec<&MessageRecord>>> = BTreeMap::new();
    for (thread_id, mut messages) in threads {
        messages.sort_by(|a, b| {
            a.date
                .cmp(&b.date)
                .then_with(|| a.message_id.cmp(&b.message_id))
        });

        let domain = sender_domain(&messages[0].sender);
        let domains: BTreeSet<String> = messages.iter().map(|m| sender_domain(&m.sender)).collect();
        if domains.len() > 1 {
            tracing::debug!(
                thread_id,
                assigned = %domain,
                candidates = ?domains,
                "thread spans several domains"
            );
        }
        by_domain.entry(domain).or_default().push(messages);
    }

    let mut clusters: Vec<Cluster> = by_domain
        .into_iter()
        .map(|(domain, mut threads)| {
            // Threads in order of their first message.
            threads.sort_by(|a, b| {
                a[0].date
                    .cmp(&b[0].date)
                    .then_with(|| a[0].message_id.cmp(&b[0].message_id))
            });
            let thread_ids: Vec<String> = threads.iter().map(|t| t[0].thread_id.clone()).collect();
            let messages: Vec<&MessageRecord> = threads.into_iter().flatten().collect();
            Cluster {
                domain,
                thread_count: thread_ids.len(),
                thread_ids,
                message_count: messages.len(),
                first_date: messages.iter().map(|m| m.date).min().unwrap_or(0),
                last_date: messages.iter().map(|m| m.date).max().unwrap_or(0),
                message_ids: messages.iter().map(|m| m.message_id.clone()).collect(),
            }
        })
        .collect();

    clusters.sort_by(|a, b| {
        b.message_count
            .cmp(&a.message_count)
            .then_with(|| a.domain.cmp(&b.domain))
    });
    clusters
}

/// Recompute clusters from the current contents of the store.
pub async fn load_clusters(store: &MessageStore) -> Result<Vec<Cluster>> {
    let records = store.list_synced().await?;
    Ok(compute_clusters(&records))
}

/// `cf clusters`
pub async fn run_clusters(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    let store = MessageStore::new(pool.clone(), config.workers.claim_ttl_secs);
    let clusters = load_clusters(&store).await?;
    pool.close().await;

    if clusters.is_empty() {
        println!("No clusters. Run `cf sync` first.");
        return Ok(());
    }

    println!(
        "{:<32} {:>8} {:>9}   {:<10}   {:<10}",
        "DOMAIN", "THREADS", "MESSAGES", "FIRST", "LAST"
    );
    println!("{}", "-".repeat(78));
    for cluster in &clusters {
        let domain = if cluster.domain.is_empty() {
            "(no domain)"
        } else {
            cluster.domain.as_str()
        };
        println!(
            "{:<32} {:>8} {:>9}   {:<10}   {:<10}",
            domain,
            cluster.thread_count,
            cluster.message_count,
            format_date(cluster.first_date),
            format_date(cluster.last_date)
        );
    }
    println!();
    println!("Create a casefile with `cf casefile create --cluster <domain>`.");
    Ok(())
}

fn format_date(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d").to_string())
        .unwrap_or_default()
}

/// Lowercased domain of a `From` header value such as
/// `"Alice Smith" <Alice@Example.COM>` or `bob@y.com`.
///
/// Returns an empty string for a header with no address.
pub fn sender_domain(sender: &str) -> String {
    let address = match (sender.rfind('<'), sender.rfind('>')) {
        (Some(start), Some(end)) if start < end => &sender[start + 1..end],
        _ => sender,
    };
    address
        .trim()
        .rsplit_once('@')
        .map(|(_, domain)| domain.trim().trim_end_matches('.').to_lowercase())
        .unwrap_or_default()
}
