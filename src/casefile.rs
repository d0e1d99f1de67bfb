//! Casefile persistence.
//!
//! A casefile is an immutable, named set of member messages. Creation
//! validates every member and commits in a single transaction; a failed
//! validation commits nothing. Growing a casefile is [`expand`], which
//! produces a new casefile (version + 1, `parent_id` set) and leaves the
//! original untouched.

use anyhow::Result;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use std::collections::BTreeSet;

use crate::cluster::{load_clusters, Cluster};
use crate::config::Config;
use crate::db;
use crate::error::CasefileError;
use crate::models::{Casefile, ProcessingState};
use crate::store::MessageStore;

/// Create a casefile from member message ids. Duplicates are collapsed.
///
/// Every member must already be in the message store with synced metadata.
pub async fn create(
    pool: &SqlitePool,
    name: &str,
    message_ids: &[String],
) -> Result<Casefile, CasefileError> {
    let members: BTreeSet<String> = message_ids.iter().cloned().collect();
    if members.is_empty() {
        return Err(CasefileError::Empty);
    }

    let mut tx = pool.begin().await?;
    let casefile = insert_casefile(&mut tx, name, 1, None, &members).await?;
    tx.commit().await?;

    tracing::info!(
        casefile_id = %casefile.casefile_id,
        members = casefile.member_message_ids.len(),
        "casefile created"
    );
    Ok(casefile)
}

/// Convert a cluster into a casefile, named after its domain unless a name
/// is given.
pub async fn create_from_cluster(
    pool: &SqlitePool,
    cluster: &Cluster,
    name: Option<&str>,
) -> Result<Casefile, CasefileError> {
    let name = name.map(str::to_string).unwrap_or_else(|| cluster.domain.clone());
    create(pool, &name, &cluster.message_ids).await
}

/// Derive a new casefile containing the members of `casefile_id` plus
/// `add_ids`.
pub async fn expand(
    pool: &SqlitePool,
    casefile_id: &str,
    add_ids: &[String],
) -> Result<Casefile, CasefileError> {
    let mut tx = pool.begin().await?;

    let parent = sqlx::query("SELECT name, version FROM casefiles WHERE casefile_id = ?")
        .bind(casefile_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| CasefileError::NotFound(casefile_id.to_string()))?;
    let name: String = parent.try_get("name")?;
    let version: i64 = parent.try_get("version")?;

    let mut members: BTreeSet<String> = member_ids(&mut tx, casefile_id).await?.into_iter().collect();
    let before = members.len();
    members.extend(add_ids.iter().cloned());
    if members.len() == before {
        return Err(CasefileError::NothingToAdd(casefile_id.to_string()));
    }

    let casefile = insert_casefile(&mut tx, &name, version + 1, Some(casefile_id), &members).await?;
    tx.commit().await?;

    tracing::info!(
        parent = casefile_id,
        casefile_id = %casefile.casefile_id,
        version = casefile.version,
        added = members.len() - before,
        "casefile expanded"
    );
    Ok(casefile)
}

pub async fn get(pool: &SqlitePool, casefile_id: &str) -> Result<Option<Casefile>> {
    let row = sqlx::query("SELECT * FROM casefiles WHERE casefile_id = ?")
        .bind(casefile_id)
        .fetch_optional(pool)
        .await?;
    let Some(row) = row else {
        return Ok(None);
    };

    let members: Vec<String> = sqlx::query_scalar(
        "SELECT message_id FROM casefile_members WHERE casefile_id = ? ORDER BY message_id",
    )
    .bind(casefile_id)
    .fetch_all(pool)
    .await?;
    Ok(Some(casefile_from_row(&row, members)?))
}

/// All casefiles, newest first.
pub async fn list(pool: &SqlitePool) -> Result<Vec<Casefile>> {
    let rows = sqlx::query("SELECT * FROM casefiles ORDER BY created_at DESC, casefile_id")
        .fetch_all(pool)
        .await?;

    let mut casefiles = Vec::with_capacity(rows.len());
    for row in rows {
        let casefile_id: String = row.try_get("casefile_id")?;
        let members: Vec<String> = sqlx::query_scalar(
            "SELECT message_id FROM casefile_members WHERE casefile_id = ? ORDER BY message_id",
        )
        .bind(&casefile_id)
        .fetch_all(pool)
        .await?;
        casefiles.push(casefile_from_row(&row, members)?);
    }
    Ok(casefiles)
}

/// `cf casefile create (--cluster <domain> | --message <id>...) [--name]`
pub async fn run_create(
    config: &Config,
    name: Option<&str>,
    cluster_domain: Option<&str>,
    message_ids: &[String],
) -> Result<()> {
    let pool = db::connect(config).await?;
    let result = match cluster_domain {
        Some(domain) => {
            let store = MessageStore::new(pool.clone(), config.workers.claim_ttl_secs);
            let clusters = load_clusters(&store).await?;
            match clusters.iter().find(|c| c.domain.eq_ignore_ascii_case(domain)) {
                Some(cluster) => create_from_cluster(&pool, cluster, name).await,
                None => {
                    pool.close().await;
                    anyhow::bail!("no cluster for domain '{}'", domain);
                }
            }
        }
        None => create(&pool, name.unwrap_or("untitled"), message_ids).await,
    };
    pool.close().await;

    let casefile = result?;
    println!(
        "Created casefile {} '{}' with {} message(s).",
        casefile.casefile_id,
        casefile.name,
        casefile.member_message_ids.len()
    );
    Ok(())
}

/// `cf casefile expand <id> --message <id>...`
pub async fn run_expand(config: &Config, casefile_id: &str, add_ids: &[String]) -> Result<()> {
    let pool = db::connect(config).await?;
    let result = expand(&pool, casefile_id, add_ids).await;
    pool.close().await;

    let casefile = result?;
    println!(
        "Created casefile {} (version {} of '{}') with {} message(s).",
        casefile.casefile_id,
        casefile.version,
        casefile.name,
        casefile.member_message_ids.len()
    );
    Ok(())
}

/// `cf casefile list`
pub async fn run_list(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    let casefiles = list(&pool).await?;
    pool.close().await;

    if casefiles.is_empty() {
        println!("No casefiles.");
        return Ok(());
    }

    println!("{:<38} {:<24} {:>4} {:>8}", "ID", "NAME", "VER", "MEMBERS");
    println!("{}", "-".repeat(78));
    for cf in &casefiles {
        println!(
            "{:<38} {:<24} {:>4} {:>8}",
            cf.casefile_id,
            cf.name,
            cf.version,
            cf.member_message_ids.len()
        );
    }
    Ok(())
}

/// `cf casefile show <id>`: the casefile and its members, oldest first.
pub async fn run_show(config: &Config, casefile_id: &str) -> Result<()> {
    let pool = db::connect(config).await?;
    let casefile = get(&pool, casefile_id).await?;
    let Some(casefile) = casefile else {
        pool.close().await;
        anyhow::bail!("unknown casefile: {}", casefile_id);
    };
    let store = MessageStore::new(pool.clone(), config.workers.claim_ttl_secs);
    let members = store.records_for_casefile(casefile_id).await?;
    pool.close().await;

    println!("{} '{}' (version {})", casefile.casefile_id, casefile.name, casefile.version);
    if let Some(parent) = &casefile.parent_id {
        println!("expanded from {}", parent);
    }
    println!();
    for m in &members {
        let date = chrono::DateTime::from_timestamp(m.date, 0)
            .map(|dt| dt.format("%Y-%m-%d").to_string())
            .unwrap_or_default();
        println!(
            "{}  {:<16} {}  {}",
            date, m.processing_state, m.sender, m.subject
        );
        println!("            {}", m.message_id);
    }
    Ok(())
}

async fn insert_casefile(
    tx: &mut Transaction<'_, Sqlite>,
    name: &str,
    version: i64,
    parent_id: Option<&str>,
    members: &BTreeSet<String>,
) -> Result<Casefile, CasefileError> {
    let mut unknown = Vec::new();
    for message_id in members {
        let state: Option<String> =
            sqlx::query_scalar("SELECT processing_state FROM messages WHERE message_id = ?")
                .bind(message_id)
                .fetch_optional(&mut **tx)
                .await?;
        // A DISCOVERED placeholder has no metadata yet; it cannot be a member.
        let synced = state.as_deref().is_some_and(|s| s != ProcessingState::Discovered.as_str());
        if !synced {
            unknown.push(message_id.clone());
        }
    }
    if !unknown.is_empty() {
        return Err(CasefileError::UnknownMembers(unknown));
    }

    let casefile_id = uuid::Uuid::new_v4().to_string();
    let created_at = chrono::Utc::now().timestamp();

    sqlx::query(
        "INSERT INTO casefiles (casefile_id, name, version, parent_id, created_at) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(&casefile_id)
    .bind(name)
    .bind(version)
    .bind(parent_id)
    .bind(created_at)
    .execute(&mut **tx)
    .await?;

    for message_id in members {
        sqlx::query("INSERT INTO casefile_members (casefile_id, message_id) VALUES (?, ?)")
            .bind(&casefile_id)
            .bind(message_id)
            .execute(&mut **tx)
            .await?;
    }

    Ok(Casefile {
        casefile_id,
        name: name.to_string(),
        version,
        parent_id: parent_id.map(str::to_string),
        member_message_ids: members.iter().cloned().collect(),
        created_at,
    })
}

async fn member_ids(tx: &mut Transaction<'_, Sqlite>, casefile_id: &str) -> Result<Vec<String>> {
    let ids = sqlx::query_scalar("SELECT message_id FROM casefile_members WHERE casefile_id = ?")
        .bind(casefile_id)
        .fetch_all(&mut **tx)
        .await?;
    Ok(ids)
}

fn casefile_from_row(row: &SqliteRow, member_message_ids: Vec<String>) -> Result<Casefile> {
    Ok(Casefile {
        casefile_id: row.try_get("casefile_id")?,
        name: row.try_get("name")?,
        version: row.try_get("version")?,
        parent_id: row.try_get("parent_id")?,
        member_message_ids,
        created_at: row.try_get("created_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrate::migrate_pool;
    use crate::models::MessageMetadata;
    use crate::store::MessageStore;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn seeded_pool(ids: &[&str]) -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        migrate_pool(&pool).await.unwrap();
        let store = MessageStore::new(pool.clone(), 600);
        for (i, id) in ids.iter().enumerate() {
            store
                .upsert_metadata(&MessageMetadata {
                    message_id: id.to_string(),
                    thread_id: "t".into(),
                    sender: "alice@x.com".into(),
                    recipients: vec![],
                    subject: "s".into(),
                    snippet: String::new(),
                    date: i as i64,
                    labels: vec![],
                })
                .await
                .unwrap();
        }
        pool
    }

    fn ids(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let pool = seeded_pool(&["m1", "m2"]).await;
        let cf = create(&pool, "Lease", &ids(&["m2", "m1", "m2"])).await.unwrap();
        assert_eq!(cf.version, 1);
        assert_eq!(cf.member_message_ids, vec!["m1", "m2"]);

        let loaded = get(&pool, &cf.casefile_id).await.unwrap().unwrap();
        assert_eq!(loaded.name, "Lease");
        assert_eq!(loaded.member_message_ids, vec!["m1", "m2"]);
        assert!(loaded.parent_id.is_none());
    }

    #[tokio::test]
    async fn test_unknown_member_commits_nothing() {
        let pool = seeded_pool(&["m1"]).await;
        let err = create(&pool, "x", &ids(&["m1", "ghost"])).await.unwrap_err();
        match err {
            CasefileError::UnknownMembers(missing) => assert_eq!(missing, vec!["ghost"]),
            other => panic!("unexpected error: {other}"),
        }
        assert!(list(&pool).await.unwrap().is_empty());
        let members: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM casefile_members")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(members, 0);
    }

    #[tokio::test]
    async fn test_discovered_placeholder_is_not_a_valid_member() {
        let pool = seeded_pool(&[]).await;
        MessageStore::new(pool.clone(), 600)
            .record_discovered("pending")
            .await
            .unwrap();
        assert!(matches!(
            create(&pool, "x", &ids(&["pending"])).await,
            Err(CasefileError::UnknownMembers(_))
        ));
    }

    #[tokio::test]
    async fn test_empty_casefile_rejected() {
        let pool = seeded_pool(&[]).await;
        assert!(matches!(create(&pool, "x", &[]).await, Err(CasefileError::Empty)));
    }

    #[tokio::test]
    async fn test_expand_creates_new_version() {
        let pool = seeded_pool(&["m1", "m2", "m3"]).await;
        let v1 = create(&pool, "Lease", &ids(&["m1"])).await.unwrap();
        let v2 = expand(&pool, &v1.casefile_id, &ids(&["m2", "m3"])).await.unwrap();

        assert_ne!(v1.casefile_id, v2.casefile_id);
        assert_eq!(v2.version, 2);
        assert_eq!(v2.parent_id.as_deref(), Some(v1.casefile_id.as_str()));
        assert_eq!(v2.member_message_ids, vec!["m1", "m2", "m3"]);

        // The original is untouched.
        let original = get(&pool, &v1.casefile_id).await.unwrap().unwrap();
        assert_eq!(original.member_message_ids, vec!["m1"]);
        assert_eq!(list(&pool).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_expand_without_new_members_fails() {
        let pool = seeded_pool(&["m1"]).await;
        let v1 = create(&pool, "Lease", &ids(&["m1"])).await.unwrap();
        assert!(matches!(
            expand(&pool, &v1.casefile_id, &ids(&["m1"])).await,
            Err(CasefileError::NothingToAdd(_))
        ));
        assert!(matches!(
            expand(&pool, "missing", &ids(&["m1"])).await,
            Err(CasefileError::NotFound(_))
        ));
    }
}
