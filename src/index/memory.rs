//! In-memory [`VectorIndex`] for tests and ephemeral runs.
//!
//! Collections live in a `HashMap` behind `std::sync::RwLock`. Queries are
//! brute-force cosine distance over every stored vector.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;

use super::{rank_hits, IndexHit, IndexRecord, Metric, VectorIndex};
use crate::embedding::cosine_distance;

struct StoredRow {
    vector: Vec<f32>,
    text: String,
    metadata: serde_json::Value,
}

struct MemCollection {
    _metric: Metric,
    dims: Option<usize>,
    rows: BTreeMap<String, StoredRow>,
}

/// Process-lifetime vector index.
pub struct MemoryIndex {
    collections: RwLock<HashMap<String, MemCollection>>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self {
            collections: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemoryIndex {
    fn default() -> Self {
        Self::new()
    }
}

fn poisoned<T>(_: T) -> anyhow::Error {
    anyhow!("memory index lock poisoned")
}

#[async_trait]
impl VectorIndex for MemoryIndex {
    fn backend(&self) -> &str {
        "memory"
    }

    async fn collection_exists(&self, name: &str) -> Result<bool> {
        let collections = self.collections.read().map_err(poisoned)?;
        Ok(collections.contains_key(name))
    }

    async fn create_collection(&self, name: &str, metric: Metric) -> Result<()> {
        let mut collections = self.collections.write().map_err(poisoned)?;
        collections
            .entry(name.to_string())
            .or_insert_with(|| MemCollection {
                _metric: metric,
                dims: None,
                rows: BTreeMap::new(),
            });
        Ok(())
    }

    async fn drop_collection(&self, name: &str) -> Result<()> {
        let mut collections = self.collections.write().map_err(poisoned)?;
        collections.remove(name);
        Ok(())
    }

    async fn upsert(&self, name: &str, records: &[IndexRecord]) -> Result<()> {
        let mut collections = self.collections.write().map_err(poisoned)?;
        let collection = collections
            .get_mut(name)
            .ok_or_else(|| anyhow!("collection '{}' does not exist", name))?;

        let mut dims = collection.dims;
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
        collection.dims = dims;

        for record in records {
            collection.rows.insert(
                record.id.clone(),
                StoredRow {
                    vector: record.vector.clone(),
                    text: record.text.clone(),
                    metadata: record.metadata.clone(),
                },
            );
        }
        Ok(())
    }

    async fn query(&self, name: &str, vector: &[f32], limit: usize) -> Result<Vec<IndexHit>> {
        let collections = self.collections.read().map_err(poisoned)?;
        let collection = collections
            .get(name)
            .ok_or_else(|| anyhow!("collection '{}' does not exist", name))?;

        let mut hits: Vec<IndexHit> = collection
            .rows
            .iter()
            .map(|(id, row)| IndexHit {
                id: id.clone(),
                text: row.text.clone(),
                metadata: row.metadata.clone(),
                distance: cosine_distance(vector, &row.vector),
            })
            .collect();
        rank_hits(&mut hits, limit);
        Ok(hits)
    }

    async fn count(&self, name: &str) -> Result<usize> {
        let collections = self.collections.read().map_err(poisoned)?;
        collections
            .get(name)
            .map(|c| c.rows.len())
            .ok_or_else(|| anyhow!("collection '{}' does not exist", name))
    }
}
