//! Template discovery and parsing.
//!
//! Walks a bulk source directory (normally a checkout of the public
//! template repository) and turns each YAML template into a [`Document`].
//!
//! # Configuration
//!
//! ```toml
//! [templates]
//! dir = "./rag_data/nuclei-templates"
//! include_globs = ["**/*.yaml", "**/*.yml"]
//! exclude_globs = ["**/workflows/**"]
//! follow_symlinks = false
//! ```
//!
//! `.git/`, `target/` and `node_modules/` are always excluded.
//!
//! # Parsing
//!
//! | Document field | Source |
//! |----------------|--------|
//! | `id` | top-level `id`, else the file stem |
//! | `metadata.name`, `severity`, `description` | `info.*` |
//! | `metadata.authors`, `tags` | `info.author` / `info.tags`, list or comma-separated string |
//! | `metadata.references` | `info.reference`, list or single string |
//! | `metadata.classification` | `info.classification` as JSON |
//!
//! Files that are not valid YAML are skipped with a warning and counted
//! in [`LoadReport::skipped`].

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde_yaml::Value;
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::config::TemplatesConfig;
use crate::models::{Document, TemplateMetadata};

/// Number of files [`survey`] inspects.
const SURVEY_SAMPLE: usize = 5;

/// Documents parsed from a directory, plus what was skipped.
#[derive(Debug, Default)]
pub struct LoadReport {
    pub documents: Vec<Document>,
    pub skipped: Vec<PathBuf>,
}

/// Result of a quick sanity check over a template directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SurveyReport {
    pub total_files: usize,
    pub sampled: usize,
    pub well_formed: usize,
}

impl SurveyReport {
    /// At least one sampled file looked like a template.
    pub fn looks_valid(&self) -> bool {
        self.well_formed > 0
    }
}

/// List template files under `root` matching the configured globs, sorted.
pub fn discover(root: &Path, config: &TemplatesConfig) -> Result<Vec<PathBuf>> {
    if !root.exists() {
        bail!("Templates directory does not exist: {}", root.display());
    }

    let include_set = build_globset(&config.include_globs)?;

    let mut excludes = vec![
        "**/.git/**".to_string(),
        "**/target/**".to_string(),
        "**/node_modules/**".to_string(),
    ];
    excludes.extend(config.exclude_globs.iter().cloned());
    let exclude_set = build_globset(&excludes)?;

    let mut files = Vec::new();
    for entry in WalkDir::new(root).follow_links(config.follow_symlinks) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(path);
        let rel_str = relative.to_string_lossy();

        if exclude_set.is_match(rel_str.as_ref()) {
            continue;
        }
        if !include_set.is_match(rel_str.as_ref()) {
            continue;
        }
        files.push(path.to_path_buf());
    }

    files.sort();
    Ok(files)
}

/// Parse every template under `root`.
pub fn load_directory(root: &Path, config: &TemplatesConfig) -> Result<LoadReport> {
    let files = discover(root, config)?;
    let mut report = LoadReport::default();

    for path in files {
        match load_template(&path) {
            Ok(doc) => report.documents.push(doc),
            Err(e) => {
                warn!(path = %path.display(), error = %format!("{:#}", e), "Skipping template");
                report.skipped.push(path);
            }
        }
    }

    info!(
        dir = %root.display(),
        loaded = report.documents.len(),
        skipped = report.skipped.len(),
        "Loaded templates"
    );
    Ok(report)
}

/// Read and parse a single template file.
pub fn load_template(path: &Path) -> Result<Document> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    parse_template(&content, &stem, &path.to_string_lossy())
}

/// Parse template text. `fallback_id` is used when the template has no
/// top-level `id`.
pub fn parse_template(content: &str, fallback_id: &str, source_path: &str) -> Result<Document> {
    let value: Value = serde_yaml::from_str(content).context("Invalid YAML")?;
    if !value.is_mapping() {
        bail!("Template is not a YAML mapping");
    }

    let id = value
        .get("id")
        .and_then(scalar_string)
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| fallback_id.to_string());

    let info = value.get("info");

    let metadata = TemplateMetadata {
        template_id: id.clone(),
        name: info_field(info, "name").and_then(scalar_string).unwrap_or_default(),
        authors: info_field(info, "author").map(string_list).unwrap_or_default(),
        severity: info_field(info, "severity").and_then(scalar_string).unwrap_or_default(),
        description: info_field(info, "description")
            .and_then(scalar_string)
            .map(|d| d.trim().to_string())
            .unwrap_or_default(),
        tags: info_field(info, "tags").map(string_list).unwrap_or_default(),
        references: info_field(info, "reference").map(string_list).unwrap_or_default(),
        source_path: source_path.to_string(),
        classification: info_field(info, "classification")
            .and_then(|c| serde_json::to_value(c).ok())
            .unwrap_or(serde_json::Value::Null),
    };

    Ok(Document {
        id,
        content: content.to_string(),
        metadata,
    })
}

/// Sample the first few template files and count how many are mappings
/// declaring both `id` and `info`.
pub fn survey(root: &Path, config: &TemplatesConfig) -> Result<SurveyReport> {
    let files = discover(root, config)?;
    let sample = &files[..files.len().min(SURVEY_SAMPLE)];

    let mut well_formed = 0;
    for path in sample {
        let parsed = std::fs::read_to_string(path)
            .ok()
            .and_then(|text| serde_yaml::from_str::<Value>(&text).ok());
        match parsed {
            Some(v) if v.get("id").is_some() && v.get("info").is_some() => well_formed += 1,
            _ => warn!(path = %path.display(), "Sampled file does not look like a template"),
        }
    }

    Ok(SurveyReport {
        total_files: files.len(),
        sampled: sample.len(),
        well_formed,
    })
}

fn info_field<'a>(info: Option<&'a Value>, key: &str) -> Option<&'a Value> {
    info.and_then(|i| i.get(key))
}

fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn string_list(value: &Value) -> Vec<String> {
    match value {
        Value::Sequence(items) => items.iter().filter_map(scalar_string).collect(),
        Value::String(s) => s
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect(),
        other => scalar_string(other).into_iter().collect(),
    }
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}
