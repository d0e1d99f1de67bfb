//! Vector store abstraction.
//!
//! Embedding records are keyed by (`chunk_id`, `casefile_id`) and carry
//! the fingerprint and model version they were produced under. Queries are
//! always scoped to one casefile and one model version; a record from any
//! other casefile is never a candidate.
//!
//! Two implementations:
//! - [`SqliteVectorStore`]: the `embeddings` table, brute-force dot product.
//! - [`InMemoryVectorStore`]: `HashMap` behind a `RwLock`, for tests and
//!   throwaway runs.

use anyhow::Result;
use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use std::collections::{BTreeSet, HashMap};
use std::sync::RwLock;

use crate::embedding::{blob_to_vec, dot_product, vec_to_blob};
use crate::models::{EmbeddingRecord, VectorHit};

/// What the store holds for one chunk in one casefile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredFingerprint {
    pub fingerprint: String,
    pub model_version: String,
}

#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Insert or overwrite the record for (`chunk_id`, `casefile_id`).
    async fn upsert(&self, record: &EmbeddingRecord) -> Result<()>;

    /// Stored fingerprints of a casefile, by chunk id.
    async fn fingerprints(&self, casefile_id: &str) -> Result<HashMap<String, StoredFingerprint>>;

    /// A vector already computed for this exact fingerprint, in any casefile.
    async fn find_vector(&self, fingerprint: &str) -> Result<Option<Vec<f32>>>;

    /// Top-`k` records of `casefile_id` under `model_version` by dot
    /// product, best first. Ties break on `chunk_id`.
    async fn query(
        &self,
        casefile_id: &str,
        model_version: &str,
        vector: &[f32],
        k: usize,
    ) -> Result<Vec<VectorHit>>;

    /// Remove every record for these chunks, across casefiles.
    async fn delete_chunks(&self, chunk_ids: &[String]) -> Result<u64>;

    /// Distinct model versions present in a casefile, sorted.
    async fn model_versions(&self, casefile_id: &str) -> Result<Vec<String>>;
}

fn rank(mut hits: Vec<VectorHit>, k: usize) -> Vec<VectorHit> {
    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.chunk_id.cmp(&b.chunk_id))
    });
    hits.truncate(k);
    hits
}

// ============ SQLite ============

pub struct SqliteVectorStore {
    pool: SqlitePool,
}

impl SqliteVectorStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl VectorStore for SqliteVectorStore {
    async fn upsert(&self, record: &EmbeddingRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO embeddings (chunk_id, casefile_id, model_version, dims, fingerprint,
                                    vector, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(chunk_id, casefile_id) DO UPDATE SET
                model_version = excluded.model_version,
                dims = excluded.dims,
                fingerprint = excluded.fingerprint,
                vector = excluded.vector,
                created_at = excluded.created_at
            "#,
        )
        .bind(&record.chunk_id)
        .bind(&record.casefile_id)
        .bind(&record.model_version)
        .bind(record.vector.len() as i64)
        .bind(&record.fingerprint)
        .bind(vec_to_blob(&record.vector))
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fingerprints(&self, casefile_id: &str) -> Result<HashMap<String, StoredFingerprint>> {
        let rows = sqlx::query(
            "SELECT chunk_id, fingerprint, model_version FROM embeddings WHERE casefile_id = ?",
        )
        .bind(casefile_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<(String, StoredFingerprint)> {
                Ok((
                    row.try_get("chunk_id")?,
                    StoredFingerprint {
                        fingerprint: row.try_get("fingerprint")?,
                        model_version: row.try_get("model_version")?,
                    },
                ))
            })
            .collect()
    }

    async fn find_vector(&self, fingerprint: &str) -> Result<Option<Vec<f32>>> {
        let blob: Option<Vec<u8>> =
            sqlx::query_scalar("SELECT vector FROM embeddings WHERE fingerprint = ? LIMIT 1")
                .bind(fingerprint)
                .fetch_optional(&self.pool)
                .await?;
        Ok(blob.map(|b| blob_to_vec(&b)))
    }

    async fn query(
        &self,
        casefile_id: &str,
        model_version: &str,
        vector: &[f32],
        k: usize,
    ) -> Result<Vec<VectorHit>> {
        let rows = sqlx::query(
            r#"
            SELECT chunk_id, fingerprint, vector FROM embeddings
            WHERE casefile_id = ? AND model_version = ?
            "#,
        )
        .bind(casefile_id)
        .bind(model_version)
        .fetch_all(&self.pool)
        .await?;

        let hits = rows
            .iter()
            .map(|row| -> Result<VectorHit> {
                let blob: Vec<u8> = row.try_get("vector")?;
                Ok(VectorHit {
                    chunk_id: row.try_get("chunk_id")?,
                    score: dot_product(vector, &blob_to_vec(&blob)),
                    fingerprint: row.try_get("fingerprint")?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(rank(hits, k))
    }

    async fn delete_chunks(&self, chunk_ids: &[String]) -> Result<u64> {
        let mut deleted = 0;
        for chunk_id in chunk_ids {
            deleted += sqlx::query("DELETE FROM embeddings WHERE chunk_id = ?")
                .bind(chunk_id)
                .execute(&self.pool)
                .await?
                .rows_affected();
        }
        Ok(deleted)
    }

    async fn model_versions(&self, casefile_id: &str) -> Result<Vec<String>> {
        let versions = sqlx::query_scalar(
            "SELECT DISTINCT model_version FROM embeddings WHERE casefile_id = ? ORDER BY model_version",
        )
        .bind(casefile_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(versions)
    }
}

// ============ In-memory ============

#[derive(Default)]
pub struct InMemoryVectorStore {
    records: RwLock<HashMap<(String, String), EmbeddingRecord>>,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned<T>(_: T) -> anyhow::Error {
    anyhow::anyhow!("vector store lock poisoned")
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn upsert(&self, record: &EmbeddingRecord) -> Result<()> {
        let mut records = self.records.write().map_err(poisoned)?;
        records.insert(
            (record.chunk_id.clone(), record.casefile_id.clone()),
            record.clone(),
        );
        Ok(())
    }

    async fn fingerprints(&self, casefile_id: &str) -> Result<HashMap<String, StoredFingerprint>> {
        let records = self.records.read().map_err(poisoned)?;
        Ok(records
            .values()
            .filter(|r| r.casefile_id == casefile_id)
            .map(|r| {
                (
                    r.chunk_id.clone(),
                    StoredFingerprint {
                        fingerprint: r.fingerprint.clone(),
                        model_version: r.model_version.clone(),
                    },
                )
            })
            .collect())
    }

    async fn find_vector(&self, fingerprint: &str) -> Result<Option<Vec<f32>>> {
        let records = self.records.read().map_err(poisoned)?;
        Ok(records
            .values()
            .find(|r| r.fingerprint == fingerprint)
            .map(|r| r.vector.clone()))
    }

    async fn query(
        &self,
        casefile_id: &str,
        model_version: &str,
        vector: &[f32],
        k: usize,
    ) -> Result<Vec<VectorHit>> {
        let records = self.records.read().map_err(poisoned)?;
        let hits = records
            .values()
            .filter(|r| r.casefile_id == casefile_id && r.model_version == model_version)
            .map(|r| VectorHit {
                chunk_id: r.chunk_id.clone(),
                score: dot_product(vector, &r.vector),
                fingerprint: r.fingerprint.clone(),
            })
            .collect();
        Ok(rank(hits, k))
    }

    async fn delete_chunks(&self, chunk_ids: &[String]) -> Result<u64> {
        let mut records = self.records.write().map_err(poisoned)?;
        let before = records.len();
        records.retain(|(chunk_id, _), _| !chunk_ids.contains(chunk_id));
        Ok((before - records.len()) as u64)
    }

    async fn model_versions(&self, casefile_id: &str) -> Result<Vec<String>> {
        let records = self.records.read().map_err(poisoned)?;
        let versions: BTreeSet<String> = records
            .values()
            .filter(|r| r.casefile_id == casefile_id)
            .map(|r| r.model_version.clone())
            .collect();
        Ok(versions.into_iter().collect())
    }
}
