//! Bulk ingestion: template directory → vector store.
//!
//! [`ingest_directory`] loads every template under a directory and adds it
//! to the store in batches. [`reload`] is the destructive variant behind
//! `tmpl reload`: it clears the collection first, so readers running at the
//! same time may briefly see an empty or partial corpus.

use std::path::Path;

use anyhow::{bail, Result};
use tracing::info;

use crate::config::TemplatesConfig;
use crate::loader;
use crate::store::VectorStore;

/// Counts from one ingestion run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestReport {
    pub files_loaded: usize,
    pub files_skipped: usize,
    pub chunks_written: usize,
}

/// Load all templates under `dir` and add them to `store`.
///
/// Attaches the store's collection first if needed. Chunk ids are stable,
/// so ingesting an unchanged directory twice does not duplicate rows.
pub async fn ingest_directory(
    store: &VectorStore,
    dir: &Path,
    config: &TemplatesConfig,
) -> Result<IngestReport> {
    store.initialize().await?;

    let loaded = loader::load_directory(dir, config)?;
    let chunks_written = store.add(&loaded.documents).await?;

    Ok(IngestReport {
        files_loaded: loaded.documents.len(),
        files_skipped: loaded.skipped.len(),
        chunks_written,
    })
}

/// Clear the collection, then ingest `dir` from scratch.
///
/// The directory is checked before anything is dropped, so a mistyped path
/// leaves the existing corpus in place.
pub async fn reload(
    store: &VectorStore,
    dir: &Path,
    config: &TemplatesConfig,
) -> Result<IngestReport> {
    if !dir.is_dir() {
        bail!("Templates directory does not exist: {}", dir.display());
    }

    let status = store.clear().await;
    if !status.success {
        bail!("{}", status.message);
    }

    let report = ingest_directory(store, dir, config).await?;
    info!(
        dir = %dir.display(),
        loaded = report.files_loaded,
        skipped = report.files_skipped,
        chunks = report.chunks_written,
        "Reload complete"
    );
    Ok(report)
}
