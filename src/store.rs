//! MessageRecord Store: the durable ground truth for per-message
//! processing state.
//!
//! Every state write is a conditional `UPDATE ... WHERE processing_state = ?`
//! so that two workers racing on the same message cannot both win. The
//! store also persists the chunks produced for a message, because chunk
//! replacement and the `BODY_FETCHED → CHUNKED` transition must commit
//! together.
//!
//! ```text
//! DISCOVERED → METADATA_SYNCED → BODY_FETCHED → CHUNKED → EMBEDDED
//!                    ▲                                       │
//!                    └──────────────── resync ───────────────┘
//! ```

use anyhow::{bail, Result};
use sha2::{Digest, Sha256};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqliteConnection, SqlitePool, Transaction};
use std::collections::{BTreeSet, HashMap};

use crate::models::{Chunk, MessageMetadata, MessageRecord, ProcessingState};

/// Labels that flip on ordinary reading and must not count as an edit.
const VOLATILE_LABELS: &[&str] = &["UNREAD", "STARRED", "IMPORTANT"];

/// Result of [`MessageStore::upsert_metadata`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// No record existed for this message id.
    Created,
    /// Metadata merged; processing state kept or promoted from `DISCOVERED`.
    Updated,
    /// The provider reports an edit: state reset to `METADATA_SYNCED` and
    /// the listed chunks were invalidated.
    Resynced { invalidated_chunks: Vec<String> },
}

pub struct MessageStore {
    pool: SqlitePool,
    claim_ttl_secs: i64,
}

impl MessageStore {
    pub fn new(pool: SqlitePool, claim_ttl_secs: i64) -> Self {
        Self {
            pool,
            claim_ttl_secs,
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn stale_claim_cutoff(&self) -> i64 {
        now() - self.claim_ttl_secs
    }

    // ============ Ingestion ============

    /// Record a listed message id whose metadata is not yet known.
    ///
    /// Returns `true` if a new `DISCOVERED` row was created.
    pub async fn record_discovered(&self, message_id: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO messages (message_id, thread_id, sender, processing_state, updated_at)
            VALUES (?, '', '', ?, ?)
            ON CONFLICT(message_id) DO NOTHING
            "#,
        )
        .bind(message_id)
        .bind(ProcessingState::Discovered.as_str())
        .bind(now())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Drop a `DISCOVERED` placeholder whose metadata turned out to be
    /// excluded by the ingestion filter. Records past `DISCOVERED` are kept.
    pub async fn forget_discovered(&self, message_id: &str) -> Result<bool> {
        let result =
            sqlx::query("DELETE FROM messages WHERE message_id = ? AND processing_state = ?")
                .bind(message_id)
                .bind(ProcessingState::Discovered.as_str())
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn discovered_ids(&self, limit: usize) -> Result<Vec<String>> {
        let ids = sqlx::query_scalar(
            "SELECT message_id FROM messages WHERE processing_state = ? ORDER BY message_id LIMIT ?",
        )
        .bind(ProcessingState::Discovered.as_str())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    /// Merge provider metadata into the store, keyed by `message_id`.
    ///
    /// Idempotent. A record already past `METADATA_SYNCED` keeps its state
    /// and only refreshes mutable fields, unless its `date` or non-volatile
    /// labels changed, which is treated as a provider-side edit (re-sync).
    pub async fn upsert_metadata(&self, meta: &MessageMetadata) -> Result<UpsertOutcome> {
        let mut tx = self.pool.begin().await?;
        let recipients_json = serde_json::to_string(&meta.recipients)?;
        let labels_json = serde_json::to_string(&meta.labels)?;
        let ts = now();

        let existing = sqlx::query(
            "SELECT processing_state, date, labels_json FROM messages WHERE message_id = ?",
        )
        .bind(&meta.message_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = existing else {
            sqlx::query(
                r#"
                INSERT INTO messages (message_id, thread_id, sender, recipients_json, subject,
                                      snippet, date, labels_json, processing_state, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&meta.message_id)
            .bind(&meta.thread_id)
            .bind(&meta.sender)
            .bind(&recipients_json)
            .bind(&meta.subject)
            .bind(&meta.snippet)
            .bind(meta.date)
            .bind(&labels_json)
            .bind(ProcessingState::MetadataSynced.as_str())
            .bind(ts)
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;
            return Ok(UpsertOutcome::Created);
        };

        let state: ProcessingState = row.try_get::<String, _>("processing_state")?.parse()?;
        let stored_date: i64 = row.try_get("date")?;
        let stored_labels: Vec<String> =
            serde_json::from_str(&row.try_get::<String, _>("labels_json")?)?;

        let edited = state > ProcessingState::MetadataSynced
            && (stored_date != meta.date
                || stable_labels(&stored_labels) != stable_labels(&meta.labels));

        let outcome = if edited {
            let invalidated = invalidate_downstream(&mut tx, &meta.message_id).await?;
            UpsertOutcome::Resynced {
                invalidated_chunks: invalidated,
            }
        } else {
            UpsertOutcome::Updated
        };

        if state <= ProcessingState::MetadataSynced || edited {
            // Full merge; a DISCOVERED placeholder is promoted here.
            sqlx::query(
                r#"
                UPDATE messages SET
                    thread_id = ?, sender = ?, recipients_json = ?, subject = ?, snippet = ?,
                    date = ?, labels_json = ?, processing_state = ?, updated_at = ?
                WHERE message_id = ?
                "#,
            )
            .bind(&meta.thread_id)
            .bind(&meta.sender)
            .bind(&recipients_json)
            .bind(&meta.subject)
            .bind(&meta.snippet)
            .bind(meta.date)
            .bind(&labels_json)
            .bind(ProcessingState::MetadataSynced.as_str())
            .bind(ts)
            .bind(&meta.message_id)
            .execute(&mut *tx)
            .await?;
        } else {
            // State is ahead of the incoming record: mutable fields only.
            sqlx::query(
                r#"
                UPDATE messages SET
                    recipients_json = ?, subject = ?, snippet = ?, labels_json = ?, updated_at = ?
                WHERE message_id = ?
                "#,
            )
            .bind(&recipients_json)
            .bind(&meta.subject)
            .bind(&meta.snippet)
            .bind(&labels_json)
            .bind(ts)
            .bind(&meta.message_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(outcome)
    }

    /// Explicit re-sync: reset a message to `METADATA_SYNCED`, dropping its
    /// stored body and chunks. Returns the invalidated chunk ids so callers
    /// can prune the vector store.
    pub async fn resync(&self, message_id: &str) -> Result<Vec<String>> {
        let mut tx = self.pool.begin().await?;
        let invalidated = invalidate_downstream(&mut tx, message_id).await?;
        sqlx::query(
            r#"
            UPDATE messages SET processing_state = ?, claimed_by = NULL, claimed_at = NULL,
                                updated_at = ?
            WHERE message_id = ? AND processing_state NOT IN (?, ?)
            "#,
        )
        .bind(ProcessingState::MetadataSynced.as_str())
        .bind(now())
        .bind(message_id)
        .bind(ProcessingState::Discovered.as_str())
        .bind(ProcessingState::MetadataSynced.as_str())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(invalidated)
    }

    // ============ Reads ============

    pub async fn get(&self, message_id: &str) -> Result<Option<MessageRecord>> {
        let row = sqlx::query("SELECT * FROM messages WHERE message_id = ?")
            .bind(message_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(record_from_row).transpose()
    }

    /// All records with known metadata (state `METADATA_SYNCED` or later).
    pub async fn list_synced(&self) -> Result<Vec<MessageRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM messages WHERE processing_state != ? ORDER BY date, message_id",
        )
        .bind(ProcessingState::Discovered.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(record_from_row).collect()
    }

    pub async fn records_for_casefile(&self, casefile_id: &str) -> Result<Vec<MessageRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT m.* FROM messages m
            JOIN casefile_members cm ON cm.message_id = m.message_id
            WHERE cm.casefile_id = ?
            ORDER BY m.date, m.message_id
            "#,
        )
        .bind(casefile_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(record_from_row).collect()
    }

    pub async fn state_counts(&self) -> Result<Vec<(ProcessingState, i64)>> {
        let rows = sqlx::query(
            "SELECT processing_state, COUNT(*) AS n FROM messages GROUP BY processing_state",
        )
        .fetch_all(&self.pool)
        .await?;
        let mut by_state: HashMap<ProcessingState, i64> = HashMap::new();
        for row in rows {
            let state: ProcessingState = row.try_get::<String, _>("processing_state")?.parse()?;
            by_state.insert(state, row.try_get("n")?);
        }
        Ok(ProcessingState::ALL
            .into_iter()
            .map(|s| (s, by_state.get(&s).copied().unwrap_or(0)))
            .collect())
    }

    /// 1-based ordinal of the message within its thread, by date.
    pub async fn thread_position(&self, message_id: &str) -> Result<Option<i64>> {
        let position: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT 1 + (
                SELECT COUNT(*) FROM messages o
                WHERE o.thread_id = m.thread_id
                  AND o.processing_state != ?
                  AND (o.date < m.date OR (o.date = m.date AND o.message_id < m.message_id))
            )
            FROM messages m WHERE m.message_id = ?
            "#,
        )
        .bind(ProcessingState::Discovered.as_str())
        .bind(message_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(position)
    }

    // ============ Body fetch ============

    /// Atomically claim a message for body fetching.
    ///
    /// Succeeds only if the message is strictly `METADATA_SYNCED` and no
    /// other worker holds a live claim. A lost claim is not an error: the
    /// caller skips the message.
    pub async fn claim_body_fetch(&self, message_id: &str, worker: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE messages SET claimed_by = ?, claimed_at = ?
            WHERE message_id = ? AND processing_state = ?
              AND (claimed_by IS NULL OR claimed_by = ? OR claimed_at < ?)
            "#,
        )
        .bind(worker)
        .bind(now())
        .bind(message_id)
        .bind(ProcessingState::MetadataSynced.as_str())
        .bind(worker)
        .bind(self.stale_claim_cutoff())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn release_claim(&self, message_id: &str, worker: &str) -> Result<()> {
        sqlx::query(
            "UPDATE messages SET claimed_by = NULL, claimed_at = NULL WHERE message_id = ? AND claimed_by = ?",
        )
        .bind(message_id)
        .bind(worker)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// `METADATA_SYNCED → BODY_FETCHED`, storing the raw body and its hash.
    ///
    /// Only the holder of the body-fetch claim may make this transition.
    pub async fn mark_body_fetched(
        &self,
        message_id: &str,
        worker: &str,
        raw_body: &[u8],
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let ts = now();

        if !advance(&mut tx, message_id, ProcessingState::BodyFetched, Some(worker)).await? {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query("UPDATE messages SET content_hash = ? WHERE message_id = ?")
            .bind(content_hash(raw_body))
            .bind(message_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r#"
            INSERT INTO message_bodies (message_id, raw_body, fetched_at) VALUES (?, ?, ?)
            ON CONFLICT(message_id) DO UPDATE SET
                raw_body = excluded.raw_body,
                fetched_at = excluded.fetched_at
            "#,
        )
        .bind(message_id)
        .bind(raw_body)
        .bind(ts)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    pub async fn stored_body(&self, message_id: &str) -> Result<Option<Vec<u8>>> {
        let body = sqlx::query_scalar("SELECT raw_body FROM message_bodies WHERE message_id = ?")
            .bind(message_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(body)
    }

    // ============ Chunks ============

    /// `BODY_FETCHED → CHUNKED`, replacing any chunks previously stored
    /// for the message in the same transaction.
    pub async fn mark_chunked(&self, message_id: &str, chunks: &[Chunk]) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        if !advance(&mut tx, message_id, ProcessingState::Chunked, None).await? {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query("DELETE FROM chunks WHERE message_id = ?")
            .bind(message_id)
            .execute(&mut *tx)
            .await?;

        for chunk in chunks {
            sqlx::query(
                r#"
                INSERT INTO chunks (chunk_id, message_id, chunk_index, strategy, thread_id, sender,
                                    date, subject, text, position_in_thread)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&chunk.chunk_id)
            .bind(&chunk.message_id)
            .bind(chunk.chunk_index)
            .bind(&chunk.strategy)
            .bind(&chunk.thread_id)
            .bind(&chunk.from)
            .bind(chunk.date)
            .bind(&chunk.subject)
            .bind(&chunk.text)
            .bind(chunk.position_in_thread)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(true)
    }

    /// Record the fingerprint a chunk was embedded at. When every chunk of
    /// the parent message carries a fingerprint, `CHUNKED → EMBEDDED`.
    ///
    /// Only the holder of the chunk claim may record it, and only while the
    /// chunk still holds `embedded_text`. Returns `false` otherwise: the
    /// chunk was invalidated or replaced while the vector was computed.
    pub async fn mark_embedded(
        &self,
        chunk_id: &str,
        worker: &str,
        embedded_text: &str,
        fingerprint: &str,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let message_id: Option<String> = sqlx::query_scalar(
            r#"
            UPDATE chunks SET embedding_fingerprint = ?, claimed_by = NULL, claimed_at = NULL
            WHERE chunk_id = ? AND claimed_by = ? AND text = ?
            RETURNING message_id
            "#,
        )
        .bind(fingerprint)
        .bind(chunk_id)
        .bind(worker)
        .bind(embedded_text)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(message_id) = message_id else {
            tx.rollback().await?;
            return Ok(false);
        };

        let remaining: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM chunks WHERE message_id = ? AND embedding_fingerprint IS NULL",
        )
        .bind(&message_id)
        .fetch_one(&mut *tx)
        .await?;

        if remaining == 0 {
            advance(&mut tx, &message_id, ProcessingState::Embedded, None).await?;
        }

        tx.commit().await?;
        Ok(true)
    }

    /// Atomically claim a chunk for embedding; same discipline as
    /// [`claim_body_fetch`](Self::claim_body_fetch).
    pub async fn claim_chunk(&self, chunk_id: &str, worker: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE chunks SET claimed_by = ?, claimed_at = ?
            WHERE chunk_id = ? AND (claimed_by IS NULL OR claimed_by = ? OR claimed_at < ?)
            "#,
        )
        .bind(worker)
        .bind(now())
        .bind(chunk_id)
        .bind(worker)
        .bind(self.stale_claim_cutoff())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn release_chunk_claim(&self, chunk_id: &str, worker: &str) -> Result<()> {
        sqlx::query(
            "UPDATE chunks SET claimed_by = NULL, claimed_at = NULL WHERE chunk_id = ? AND claimed_by = ?",
        )
        .bind(chunk_id)
        .bind(worker)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn chunks_for_message(&self, message_id: &str) -> Result<Vec<Chunk>> {
        let rows = sqlx::query("SELECT * FROM chunks WHERE message_id = ? ORDER BY chunk_index")
            .bind(message_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(chunk_from_row).collect()
    }

    /// Chunks of every member message of a casefile, in thread order.
    pub async fn chunks_for_casefile(&self, casefile_id: &str) -> Result<Vec<Chunk>> {
        let rows = sqlx::query(
            r#"
            SELECT c.* FROM chunks c
            JOIN casefile_members cm ON cm.message_id = c.message_id
            WHERE cm.casefile_id = ?
            ORDER BY c.date, c.message_id, c.chunk_index
            "#,
        )
        .bind(casefile_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(chunk_from_row).collect()
    }

    pub async fn chunks_by_ids(&self, chunk_ids: &[String]) -> Result<HashMap<String, Chunk>> {
        let mut found = HashMap::with_capacity(chunk_ids.len());
        for chunk_id in chunk_ids {
            let row = sqlx::query("SELECT * FROM chunks WHERE chunk_id = ?")
                .bind(chunk_id)
                .fetch_optional(&self.pool)
                .await?;
            if let Some(row) = row {
                let chunk = chunk_from_row(&row)?;
                found.insert(chunk.chunk_id.clone(), chunk);
            }
        }
        Ok(found)
    }
}

/// Conditional forward transition of one message into `to`.
///
/// The expected prior state comes from the legal-transition table, so a
/// write can never skip a stage. With `holder`, the caller's body-fetch
/// claim is required as well. The claim is cleared on success.
async fn advance(
    conn: &mut SqliteConnection,
    message_id: &str,
    to: ProcessingState,
    holder: Option<&str>,
) -> Result<bool> {
    let Some(from) = to.previous() else {
        bail!("no legal transition into {}", to);
    };
    let result = sqlx::query(
        r#"
        UPDATE messages SET processing_state = ?, claimed_by = NULL, claimed_at = NULL,
                            updated_at = ?
        WHERE message_id = ? AND processing_state = ?
          AND (? IS NULL OR claimed_by = ?)
        "#,
    )
    .bind(to.as_str())
    .bind(now())
    .bind(message_id)
    .bind(from.as_str())
    .bind(holder)
    .bind(holder)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// Delete the body and chunks of a message inside an open transaction,
/// returning the ids of the deleted chunks.
async fn invalidate_downstream(
    tx: &mut Transaction<'_, Sqlite>,
    message_id: &str,
) -> Result<Vec<String>> {
    let chunk_ids: Vec<String> =
        sqlx::query_scalar("SELECT chunk_id FROM chunks WHERE message_id = ? ORDER BY chunk_index")
            .bind(message_id)
            .fetch_all(&mut **tx)
            .await?;

    sqlx::query("DELETE FROM chunks WHERE message_id = ?")
        .bind(message_id)
        .execute(&mut **tx)
        .await?;
    sqlx::query("DELETE FROM message_bodies WHERE message_id = ?")
        .bind(message_id)
        .execute(&mut **tx)
        .await?;
    sqlx::query("UPDATE messages SET content_hash = NULL WHERE message_id = ?")
        .bind(message_id)
        .execute(&mut **tx)
        .await?;

    Ok(chunk_ids)
}

fn stable_labels(labels: &[String]) -> BTreeSet<&str> {
    labels
        .iter()
        .map(String::as_str)
        .filter(|l| !VOLATILE_LABELS.contains(l))
        .collect()
}

/// SHA-256 of the raw provider body, hex encoded.
pub fn content_hash(raw_body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(raw_body);
    format!("{:x}", hasher.finalize())
}

fn record_from_row(row: &SqliteRow) -> Result<MessageRecord> {
    Ok(MessageRecord {
        message_id: row.try_get("message_id")?,
        thread_id: row.try_get("thread_id")?,
        sender: row.try_get("sender")?,
        recipients: serde_json::from_str(&row.try_get::<String, _>("recipients_json")?)?,
        subject: row.try_get("subject")?,
        snippet: row.try_get("snippet")?,
        date: row.try_get("date")?,
        labels: serde_json::from_str(&row.try_get::<String, _>("labels_json")?)?,
        processing_state: row.try_get::<String, _>("processing_state")?.parse()?,
        content_hash: row.try_get("content_hash")?,
        updated_at: row.try_get("updated_at")?,
    })
}

pub(crate) fn chunk_from_row(row: &SqliteRow) -> Result<Chunk> {
    Ok(Chunk {
        chunk_id: row.try_get("chunk_id")?,
        message_id: row.try_get("message_id")?,
        chunk_index: row.try_get("chunk_index")?,
        strategy: row.try_get("strategy")?,
        thread_id: row.try_get("thread_id")?,
        from: row.try_get("sender")?,
        date: row.try_get("date")?,
        subject: row.try_get("subject")?,
        text: row.try_get("text")?,
        position_in_thread: row.try_get("position_in_thread")?,
        embedding_fingerprint: row.try_get("embedding_fingerprint")?,
    })
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}
