//! Health overview for `tmpl status`.
//!
//! Gathers validator availability and version, store statistics, and the
//! configured model names into one serializable snapshot. Every probe
//! degrades to a "not available" value instead of failing.

use serde::Serialize;

use crate::llm::LlmProvider;
use crate::models::StoreStats;
use crate::retrieval::RetrievalEngine;
use crate::validator::ValidationRunner;

#[derive(Debug, Clone, Serialize)]
pub struct SystemStatus {
    pub validator_binary: String,
    pub validator_available: bool,
    pub validator_version: Option<String>,
    pub store_backend: String,
    pub store_initialized: bool,
    pub store: Option<StoreStats>,
    pub store_error: Option<String>,
    pub llm_model: String,
    pub embedding_model: String,
}

/// Probe every component once.
pub async fn collect(
    retrieval: &RetrievalEngine,
    validator: &ValidationRunner,
    llm: &dyn LlmProvider,
) -> SystemStatus {
    let validator_version = validator.version().await;
    let store = retrieval.store();

    let (stats, store_error) = match retrieval.stats().await {
        Ok(stats) => (Some(stats), None),
        Err(e) => (None, Some(e.to_string())),
    };

    SystemStatus {
        validator_binary: validator.binary().display().to_string(),
        validator_available: validator_version.is_some(),
        validator_version,
        store_backend: store.backend().to_string(),
        store_initialized: store.is_initialized().await,
        store: stats,
        store_error,
        llm_model: llm.model_name().to_string(),
        embedding_model: store.embedder().model_name().to_string(),
    }
}

/// Human-readable report, one field per line.
pub fn render(status: &SystemStatus) -> String {
    let mut out = String::new();
    out.push_str("Template Harness — Status\n");
    out.push_str("=========================\n\n");
    out.push_str(&format!(
        "  Validator:   {} ({})\n",
        status.validator_binary,
        if status.validator_available {
            status.validator_version.as_deref().unwrap_or("available")
        } else {
            "not available"
        }
    ));
    out.push_str(&format!("  Backend:     {}\n", status.store_backend));
    match (&status.store, &status.store_error) {
        (Some(stats), _) => {
            out.push_str(&format!("  Collection:  {}\n", stats.collection_name));
            out.push_str(&format!("  Chunks:      {}\n", stats.total_chunks));
        }
        (None, Some(err)) => out.push_str(&format!("  Store:       error: {}\n", err)),
        (None, None) => out.push_str("  Store:       not initialized\n"),
    }
    out.push_str(&format!("  LLM model:   {}\n", status.llm_model));
    out.push_str(&format!("  Embeddings:  {}\n", status.embedding_model));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_reports_unavailable_validator() {
        let status = SystemStatus {
            validator_binary: "nuclei".to_string(),
            validator_available: false,
            validator_version: None,
            store_backend: "memory".to_string(),
            store_initialized: true,
            store: Some(StoreStats {
                total_chunks: 42,
                collection_name: "nuclei_templates".to_string(),
            }),
            store_error: None,
            llm_model: "disabled".to_string(),
            embedding_model: "disabled".to_string(),
        };
        let text = render(&status);
        assert!(text.contains("nuclei (not available)"));
        assert!(text.contains("Chunks:      42"));
    }
}
