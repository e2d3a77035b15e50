//! Pluggable vector index backends.
//!
//! The [`VectorIndex`] trait is the narrow storage contract underneath
//! [`VectorStore`](crate::store::VectorStore): named collections of
//! `(id, vector, text, metadata)` rows with nearest-neighbour queries that
//! report cosine *distance*. Chunking, embedding, and similarity thresholds
//! live above this layer.
//!
//! | Backend | Type | Persistence |
//! |---------|------|-------------|
//! | `memory` | [`MemoryIndex`] | process lifetime |
//! | `sqlite` | [`SqliteIndex`] | single SQLite file |
//!
//! Both backends perform exact, brute-force search.

pub mod memory;
pub mod sqlite;

use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::config::{StoreConfig, MAX_STORE_BATCH};

pub use memory::MemoryIndex;
pub use sqlite::SqliteIndex;

/// Distance metric of a collection. Only cosine is supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Metric {
    Cosine,
}

impl Metric {
    pub fn as_str(&self) -> &'static str {
        match self {
            Metric::Cosine => "cosine",
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A row to insert.
#[derive(Debug, Clone)]
pub struct IndexRecord {
    pub id: String,
    pub vector: Vec<f32>,
    pub text: String,
    pub metadata: serde_json::Value,
}

/// A row returned from a query, nearest first.
#[derive(Debug, Clone)]
pub struct IndexHit {
    pub id: String,
    pub text: String,
    pub metadata: serde_json::Value,
    /// Cosine distance in `[0, 2]`.
    pub distance: f32,
}

/// Storage backend for named collections of vectors.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Short backend name used in logs and error messages.
    fn backend(&self) -> &str;

    /// Largest number of records accepted by one [`upsert`](VectorIndex::upsert).
    fn max_batch_size(&self) -> usize {
        MAX_STORE_BATCH
    }

    async fn collection_exists(&self, name: &str) -> Result<bool>;

    /// Create the collection if it does not exist. Existing collections are
    /// left untouched.
    async fn create_collection(&self, name: &str, metric: Metric) -> Result<()>;

    /// Remove the collection and all of its rows. Missing collections are
    /// not an error.
    async fn drop_collection(&self, name: &str) -> Result<()>;

    /// Insert or replace rows by id. All vectors in a collection must share
    /// one dimensionality, fixed by the first insert.
    async fn upsert(&self, name: &str, records: &[IndexRecord]) -> Result<()>;

    /// The `limit` rows nearest to `vector`, ordered by ascending distance.
    async fn query(&self, name: &str, vector: &[f32], limit: usize) -> Result<Vec<IndexHit>>;

    async fn count(&self, name: &str) -> Result<usize>;
}

/// Open the backend named in `[store] backend`.
pub async fn open_index(config: &StoreConfig) -> Result<Arc<dyn VectorIndex>> {
    match config.backend.as_str() {
        "memory" => Ok(Arc::new(MemoryIndex::new())),
        "sqlite" => Ok(Arc::new(SqliteIndex::open(&config.path).await?)),
        other => anyhow::bail!("Unknown store backend: {}", other),
    }
}

/// Sort hits nearest first; ties break on id so results are deterministic.
pub(crate) fn rank_hits(hits: &mut Vec<IndexHit>, limit: usize) {
    hits.sort_by(|a, b| {
        a.distance
            .partial_cmp(&b.distance)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.id.cmp(&b.id))
    });
    hits.truncate(limit);
}
