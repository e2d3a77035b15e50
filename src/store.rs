//! The vector store: one named collection of embedded template chunks.
//!
//! [`VectorStore`] ties a [`Chunker`], an [`EmbeddingProvider`], and a
//! [`VectorIndex`] backend together. It owns at most one attached
//! collection at a time.
//!
//! # Lifecycle
//!
//! ```text
//! new ──► initialize ──► add / search / stats / clear
//!              ▲                    │
//!              └──── delete ◄───────┘
//! ```
//!
//! `initialize` is idempotent and single-flight: concurrent callers
//! serialize on an init mutex and all observe the same attached
//! collection. Every other operation fails with
//! [`Error::StoreNotInitialized`] until a collection is attached, except
//! [`clear`](VectorStore::clear), which recreates and attaches it.
//!
//! Reads take a short read lock on the attachment only to resolve the
//! collection name; no lock is held across embedding or index I/O, so a
//! concurrent `clear` may be observed half-way by readers.

use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::chunk::Chunker;
use crate::config::Config;
use crate::embedding::EmbeddingProvider;
use crate::error::{AddError, Error, Result};
use crate::index::{IndexRecord, Metric, VectorIndex};
use crate::models::{ChunkMetadata, ClearStatus, Document, RetrievedMatch, StoreStats};

fn store_err(err: anyhow::Error) -> Error {
    Error::StoreFailure(format!("{:#}", err))
}

/// Chunk, embed, and index template documents; answer similarity queries.
pub struct VectorStore {
    index: Arc<dyn VectorIndex>,
    embedder: Arc<dyn EmbeddingProvider>,
    chunker: Chunker,
    collection_name: String,
    batch_size: usize,
    attached: RwLock<Option<String>>,
    init_lock: Mutex<()>,
}

impl VectorStore {
    pub fn new(
        index: Arc<dyn VectorIndex>,
        embedder: Arc<dyn EmbeddingProvider>,
        chunker: Chunker,
        collection_name: impl Into<String>,
        batch_size: usize,
    ) -> Self {
        Self {
            index,
            embedder,
            chunker,
            collection_name: collection_name.into(),
            batch_size: batch_size.max(1),
            attached: RwLock::new(None),
            init_lock: Mutex::new(()),
        }
    }

    /// Build a store from the `[store]` and `[chunking]` sections.
    pub fn from_config(
        config: &Config,
        index: Arc<dyn VectorIndex>,
        embedder: Arc<dyn EmbeddingProvider>,
    ) -> anyhow::Result<Self> {
        let chunker = Chunker::new(config.chunking.chunk_size, config.chunking.chunk_overlap)?;
        Ok(Self::new(
            index,
            embedder,
            chunker,
            config.store.collection_name.clone(),
            config.store.batch_size,
        ))
    }

    pub fn collection_name(&self) -> &str {
        &self.collection_name
    }

    pub fn embedder(&self) -> &Arc<dyn EmbeddingProvider> {
        &self.embedder
    }

    pub fn backend(&self) -> &str {
        self.index.backend()
    }

    pub async fn is_initialized(&self) -> bool {
        self.attached.read().await.is_some()
    }

    /// Attach to the named collection, creating it with the cosine metric
    /// if it does not exist.
    pub async fn initialize(&self) -> Result<()> {
        if self.is_initialized().await {
            return Ok(());
        }

        let _guard = self.init_lock.lock().await;
        if self.is_initialized().await {
            return Ok(());
        }

        let existed = self
            .index
            .collection_exists(&self.collection_name)
            .await
            .map_err(store_err)?;
        if !existed {
            self.index
                .create_collection(&self.collection_name, Metric::Cosine)
                .await
                .map_err(store_err)?;
        }

        *self.attached.write().await = Some(self.collection_name.clone());
        info!(
            collection = %self.collection_name,
            backend = self.index.backend(),
            created = !existed,
            "Vector store initialized"
        );
        Ok(())
    }

    async fn attached_collection(&self) -> Result<String> {
        self.attached
            .read()
            .await
            .clone()
            .ok_or(Error::StoreNotInitialized)
    }

    fn effective_batch_size(&self) -> usize {
        self.batch_size.min(self.index.max_batch_size()).max(1)
    }

    /// Chunk, embed, and insert `documents`. Returns the number of chunks
    /// written.
    ///
    /// Batches are committed one at a time. If a later batch fails, the
    /// returned [`AddError`] reports how many chunks were already written.
    pub async fn add(&self, documents: &[Document]) -> std::result::Result<usize, AddError> {
        let collection = self
            .attached_collection()
            .await
            .map_err(|e| AddError::new(0, e))?;

        let chunks: Vec<_> = documents
            .iter()
            .flat_map(|doc| self.chunker.chunk_document(doc))
            .collect();
        if chunks.is_empty() {
            return Ok(0);
        }

        let batch_size = self.effective_batch_size();
        let mut committed = 0usize;

        for batch in chunks.chunks(batch_size) {
            let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
            let vectors = self
                .embedder
                .embed(&texts)
                .await
                .map_err(|e| AddError::new(committed, e))?;
            if vectors.len() != batch.len() {
                return Err(AddError::new(
                    committed,
                    Error::EmbeddingFailure(format!(
                        "expected {} vectors, got {}",
                        batch.len(),
                        vectors.len()
                    )),
                ));
            }

            let mut records = Vec::with_capacity(batch.len());
            for (chunk, vector) in batch.iter().zip(vectors) {
                let metadata = serde_json::to_value(&chunk.metadata)
                    .map_err(|e| AddError::new(committed, Error::StoreFailure(e.to_string())))?;
                records.push(IndexRecord {
                    id: chunk.chunk_id.clone(),
                    vector,
                    text: chunk.text.clone(),
                    metadata,
                });
            }

            self.index
                .upsert(&collection, &records)
                .await
                .map_err(|e| AddError::new(committed, store_err(e)))?;

            committed += records.len();
            debug!(batch = records.len(), committed, "Inserted chunk batch");
        }

        info!(
            documents = documents.len(),
            chunks = committed,
            collection = %collection,
            "Added documents to vector store"
        );
        Ok(committed)
    }

    /// Nearest chunks to `query` with similarity at or above `threshold`,
    /// best first.
    pub async fn search(
        &self,
        query: &str,
        max_results: usize,
        threshold: f64,
    ) -> Result<Vec<RetrievedMatch>> {
        let collection = self.attached_collection().await?;
        if max_results == 0 {
            return Ok(Vec::new());
        }

        let vector = self.embedder.embed_one(query).await?;
        let hits = self
            .index
            .query(&collection, &vector, max_results)
            .await
            .map_err(store_err)?;

        let mut matches = Vec::with_capacity(hits.len());
        for hit in hits {
            let similarity = (1.0 - f64::from(hit.distance)).clamp(0.0, 1.0);
            if similarity < threshold {
                continue;
            }
            let metadata: ChunkMetadata = serde_json::from_value(hit.metadata)
                .map_err(|e| Error::StoreFailure(format!("bad metadata for {}: {}", hit.id, e)))?;
            matches.push(RetrievedMatch {
                content: hit.text,
                metadata,
                similarity,
            });
        }

        matches.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        debug!(query_len = query.len(), results = matches.len(), "Vector search");
        Ok(matches)
    }

    pub async fn stats(&self) -> Result<StoreStats> {
        let collection = self.attached_collection().await?;
        let total_chunks = self.index.count(&collection).await.map_err(store_err)?;
        Ok(StoreStats {
            total_chunks,
            collection_name: collection,
        })
    }

    /// Drop and recreate the collection empty. Failures are reported in
    /// the returned status.
    pub async fn clear(&self) -> ClearStatus {
        let name = self.collection_name.clone();
        let result = async {
            self.index.drop_collection(&name).await?;
            self.index.create_collection(&name, Metric::Cosine).await
        }
        .await;

        match result {
            Ok(()) => {
                *self.attached.write().await = Some(name.clone());
                info!(collection = %name, "Collection cleared");
                ClearStatus {
                    success: true,
                    message: format!("Collection '{}' cleared successfully", name),
                    collection_name: name,
                }
            }
            Err(e) => {
                warn!(collection = %name, error = %e, "Failed to clear collection");
                ClearStatus {
                    success: false,
                    message: format!("Failed to clear collection '{}': {:#}", name, e),
                    collection_name: name,
                }
            }
        }
    }

    /// Remove the collection permanently and detach from it.
    pub async fn delete(&self) -> Result<()> {
        let _guard = self.init_lock.lock().await;
        *self.attached.write().await = None;
        self.index
            .drop_collection(&self.collection_name)
            .await
            .map_err(store_err)?;
        info!(collection = %self.collection_name, "Collection deleted");
        Ok(())
    }
}
