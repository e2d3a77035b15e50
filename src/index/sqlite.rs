//! SQLite-backed [`VectorIndex`].
//!
//! Stores every collection in one database file. Vectors are kept as
//! little-endian f32 BLOBs and searched by brute-force cosine distance,
//! which is adequate for template corpora in the tens of thousands of
//! chunks.
//!
//! Schema:
//!
//! ```text
//! collections(name PK, metric, dims NULL, created_at)
//! chunks(collection, id, text, metadata_json, embedding BLOB, PK(collection, id))
//! ```

use std::path::Path;
use std::str::FromStr;

use anyhow::{bail, Result};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::Row;

use super::{rank_hits, IndexHit, IndexRecord, Metric, VectorIndex};
use crate::embedding::{blob_to_vec, cosine_distance, vec_to_blob};

/// Durable vector index in a single SQLite file.
pub struct SqliteIndex {
    pool: SqlitePool,
}

impl SqliteIndex {
    /// Open (creating if missing) the database at `path` and run migrations.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let index = Self { pool };
        index.migrate().await?;
        Ok(index)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS collections (
                name TEXT PRIMARY KEY,
                metric TEXT NOT NULL,
                dims INTEGER,
                created_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS chunks (
                collection TEXT NOT NULL,
                id TEXT NOT NULL,
                text TEXT NOT NULL,
                metadata_json TEXT NOT NULL DEFAULT '{}',
                embedding BLOB NOT NULL,
                PRIMARY KEY (collection, id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn collection_dims(&self, name: &str) -> Result<Option<usize>> {
        let row = sqlx::query("SELECT dims FROM collections WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let dims: Option<i64> = row.get("dims");
                Ok(dims.map(|d| d as usize))
            }
            None => bail!("collection '{}' does not exist", name),
        }
    }
}

#[async_trait]
impl VectorIndex for SqliteIndex {
    fn backend(&self) -> &str {
        "sqlite"
    }

    async fn collection_exists(&self, name: &str) -> Result<bool> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM collections WHERE name = ?")
            .bind(name)
            .fetch_one(&self.pool)
            .await?;
        Ok(count > 0)
    }

    async fn create_collection(&self, name: &str, metric: Metric) -> Result<()> {
        sqlx::query(
            "INSERT OR IGNORE INTO collections (name, metric, dims, created_at) VALUES (?, ?, NULL, ?)",
        )
        .bind(name)
        .bind(metric.as_str())
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn drop_collection(&self, name: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM chunks WHERE collection = ?")
            .bind(name)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM collections WHERE name = ?")
            .bind(name)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn upsert(&self, name: &str, records: &[IndexRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        let mut dims = self.collection_dims(name).await?;
        for record in records {
            match dims {
                Some(d) if d != record.vector.len() => bail!(
                    "vector for '{}' has {} dimensions, collection '{}' expects {}",
                    record.id,
                    record.vector.len(),
                    name,
                    d
                ),
                Some(_) => {}
                None => dims = Some(record.vector.len()),
            }
        }

        let mut tx = self.pool.begin().await?;

        sqlx::query("UPDATE collections SET dims = ? WHERE name = ? AND dims IS NULL")
            .bind(dims.map(|d| d as i64))
            .bind(name)
            .execute(&mut *tx)
            .await?;

        for record in records {
            sqlx::query(
                r#"
                INSERT INTO chunks (collection, id, text, metadata_json, embedding)
                VALUES (?, ?, ?, ?, ?)
                ON CONFLICT(collection, id) DO UPDATE SET
                    text = excluded.text,
                    metadata_json = excluded.metadata_json,
                    embedding = excluded.embedding
                "#,
            )
            .bind(name)
            .bind(&record.id)
            .bind(&record.text)
            .bind(record.metadata.to_string())
            .bind(vec_to_blob(&record.vector))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn query(&self, name: &str, vector: &[f32], limit: usize) -> Result<Vec<IndexHit>> {
        if !self.collection_exists(name).await? {
            bail!("collection '{}' does not exist", name);
        }

        let rows = sqlx::query(
            "SELECT id, text, metadata_json, embedding FROM chunks WHERE collection = ?",
        )
        .bind(name)
        .fetch_all(&self.pool)
        .await?;

        let mut hits = Vec::with_capacity(rows.len());
        for row in rows {
            let blob: Vec<u8> = row.get("embedding");
            let metadata_json: String = row.get("metadata_json");
            hits.push(IndexHit {
                id: row.get("id"),
                text: row.get("text"),
                metadata: serde_json::from_str(&metadata_json)?,
                distance: cosine_distance(vector, &blob_to_vec(&blob)),
            });
        }

        rank_hits(&mut hits, limit);
        Ok(hits)
    }

    async fn count(&self, name: &str) -> Result<usize> {
        if !self.collection_exists(name).await? {
            bail!("collection '{}' does not exist", name);
        }
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks WHERE collection = ?")
            .bind(name)
            .fetch_one(&self.pool)
            .await?;
        Ok(count as usize)
    }
}
