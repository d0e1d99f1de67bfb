use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate_pool(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create every table and index. Idempotent.
pub async fn migrate_pool(pool: &SqlitePool) -> Result<()> {
    // MessageRecord Store
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS messages (
            message_id TEXT PRIMARY KEY,
            thread_id TEXT NOT NULL,
            sender TEXT NOT NULL,
            recipients_json TEXT NOT NULL DEFAULT '[]',
            subject TEXT NOT NULL DEFAULT '',
            snippet TEXT NOT NULL DEFAULT '',
            date INTEGER NOT NULL DEFAULT 0,
            labels_json TEXT NOT NULL DEFAULT '[]',
            processing_state TEXT NOT NULL,
            content_hash TEXT,
            claimed_by TEXT,
            claimed_at INTEGER,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS message_bodies (
            message_id TEXT PRIMARY KEY,
            raw_body BLOB NOT NULL,
            fetched_at INTEGER NOT NULL,
            FOREIGN KEY (message_id) REFERENCES messages(message_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS casefiles (
            casefile_id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            version INTEGER NOT NULL DEFAULT 1,
            parent_id TEXT,
            created_at INTEGER NOT NULL,
            FOREIGN KEY (parent_id) REFERENCES casefiles(casefile_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS casefile_members (
            casefile_id TEXT NOT NULL,
            message_id TEXT NOT NULL,
            PRIMARY KEY (casefile_id, message_id),
            FOREIGN KEY (casefile_id) REFERENCES casefiles(casefile_id),
            FOREIGN KEY (message_id) REFERENCES messages(message_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunks (
            chunk_id TEXT PRIMARY KEY,
            message_id TEXT NOT NULL,
            chunk_index INTEGER NOT NULL,
            strategy TEXT NOT NULL,
            thread_id TEXT NOT NULL,
            sender TEXT NOT NULL,
            date INTEGER NOT NULL,
            subject TEXT NOT NULL,
            text TEXT NOT NULL,
            position_in_thread INTEGER,
            embedding_fingerprint TEXT,
            claimed_by TEXT,
            claimed_at INTEGER,
            UNIQUE(message_id, chunk_index),
            FOREIGN KEY (message_id) REFERENCES messages(message_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Vector store. Not foreign-keyed to chunks: it is a separate
    // collaborator and is pruned explicitly on re-sync.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS embeddings (
            chunk_id TEXT NOT NULL,
            casefile_id TEXT NOT NULL,
            model_version TEXT NOT NULL,
            dims INTEGER NOT NULL,
            fingerprint TEXT NOT NULL,
            vector BLOB NOT NULL,
            created_at INTEGER NOT NULL,
            PRIMARY KEY (chunk_id, casefile_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS checkpoints (
            provider TEXT PRIMARY KEY,
            page_token TEXT,
            since_ts INTEGER,
            run_high_water INTEGER,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sync_jobs (
            job_id TEXT PRIMARY KEY,
            provider TEXT NOT NULL,
            status TEXT NOT NULL,
            progress_current INTEGER NOT NULL DEFAULT 0,
            error_message TEXT,
            started_at INTEGER NOT NULL,
            finished_at INTEGER
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_messages_state ON messages(processing_state)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_messages_thread ON messages(thread_id, date)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_message_id ON chunks(message_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_embeddings_casefile ON embeddings(casefile_id)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_sync_jobs_provider ON sync_jobs(provider, status)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
