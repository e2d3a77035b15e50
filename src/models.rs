//! Core data models used throughout the template harness.
//!
//! These types represent the templates, chunks, matches, and results that
//! flow through the ingestion, retrieval, and generation pipeline.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Metadata extracted from a template's `info` block.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TemplateMetadata {
    pub template_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub authors: Vec<String>,
    #[serde(default)]
    pub severity: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub references: Vec<String>,
    #[serde(default)]
    pub source_path: String,
    #[serde(default)]
    pub classification: serde_json::Value,
}

/// One source template file as ingested.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: String,
    pub content: String,
    pub metadata: TemplateMetadata,
}

/// Metadata stored alongside every chunk in the index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    #[serde(flatten)]
    pub template: TemplateMetadata,
    pub chunk_index: usize,
    pub total_chunks: usize,
    pub source_doc_id: String,
}

/// A sub-span of a document's content, the unit stored and searched.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub chunk_id: String,
    pub text: String,
    pub metadata: ChunkMetadata,
}

/// A search hit returned by the vector store.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrievedMatch {
    pub content: String,
    pub metadata: ChunkMetadata,
    /// Cosine similarity in `[0, 1]`, higher is closer.
    pub similarity: f64,
}

/// Collection statistics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoreStats {
    pub total_chunks: usize,
    pub collection_name: String,
}

/// Outcome of a destructive collection reset.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClearStatus {
    pub success: bool,
    pub collection_name: String,
    pub message: String,
}

/// Verdict on a piece of generated content.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn valid() -> Self {
        Self {
            is_valid: true,
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    /// `Err(ValidationFailed)` carrying the findings unless the content
    /// passed.
    pub fn ensure_valid(&self) -> crate::error::Result<()> {
        if self.is_valid {
            return Ok(());
        }
        Err(crate::error::Error::ValidationFailed {
            errors: self.errors.clone(),
            warnings: self.warnings.clone(),
        })
    }

    pub fn invalid(error: impl Into<String>) -> Self {
        Self {
            is_valid: false,
            errors: vec![error.into()],
            warnings: Vec::new(),
        }
    }
}

/// One iteration of the refine loop.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationAttempt {
    pub index: u32,
    pub content: String,
    pub validation: ValidationResult,
}

/// A natural-language generation request plus optional hints.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub prompt: String,
    #[serde(default)]
    pub severity: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub references: Vec<String>,
    /// Endpoint the generated template should be aimed at.
    #[serde(default)]
    pub target: Option<TargetInfo>,
}

/// The HTTP endpoint a template is written for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetInfo {
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    /// URL or form parameter names.
    #[serde(default)]
    pub parameters: Vec<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub cookies: BTreeMap<String, String>,
}

fn default_method() -> String {
    "GET".to_string()
}

impl TargetInfo {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: default_method(),
            parameters: Vec::new(),
            headers: BTreeMap::new(),
            cookies: BTreeMap::new(),
        }
    }
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }
}

/// How a payload was located inside a free-form LLM response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionKind {
    FencedBlock,
    StructuralKeys,
    RawResponse,
}

/// Bookkeeping attached to every generation result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationMetadata {
    pub model: String,
    pub similar_templates_count: usize,
    pub attempts: u32,
    pub extraction: Option<ExtractionKind>,
    pub elapsed_ms: u64,
}

/// Final output of a generation run, successful or not.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationResult {
    pub success: bool,
    pub template_id: String,
    pub content: String,
    pub validation: ValidationResult,
    pub retrieval_context: Vec<String>,
    pub metadata: GenerationMetadata,
    pub created_at: DateTime<Utc>,
}
