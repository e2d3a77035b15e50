//! Retrieval over the template corpus.
//!
//! [`RetrievalEngine`] wraps a [`VectorStore`] with the configured defaults
//! and two filtered query modes:
//!
//! - [`by_severity`](RetrievalEngine::by_severity) seeds a similarity query
//!   with `"<level> severity"` and keeps matches whose severity equals the
//!   level, ignoring case.
//! - [`by_tags`](RetrievalEngine::by_tags) seeds with the tags themselves and
//!   keeps matches sharing any (or, with [`TagMatch::All`], every) tag,
//!   ignoring case.
//!
//! Both filter *after* the similarity search: they can only return what
//! the first `max_results * filter_fanout` nearest chunks contain, not an
//! exhaustive metadata scan. Both return one match per template: a template
//! split into several chunks is represented by its most similar chunk.
//!
//! [`format_context`] renders matches into the digest that is pasted into
//! generation prompts.

use std::collections::HashSet;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use tracing::{info, warn};

use crate::config::{Config, RetrievalConfig, TemplatesConfig};
use crate::error::{Error, Result};
use crate::ingest::{self, IngestReport};
use crate::models::{RetrievedMatch, StoreStats};
use crate::store::VectorStore;

const RULE_WIDTH: usize = 80;

/// How [`RetrievalEngine::by_tags`] combines the requested tags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TagMatch {
    /// At least one tag in common.
    #[default]
    Any,
    /// Every requested tag present.
    All,
}

impl FromStr for TagMatch {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "any" => Ok(TagMatch::Any),
            "all" => Ok(TagMatch::All),
            other => Err(format!("match mode must be one of: any, all (got '{}')", other)),
        }
    }
}

/// Query-side facade over the vector store.
pub struct RetrievalEngine {
    store: Arc<VectorStore>,
    config: RetrievalConfig,
    templates: TemplatesConfig,
}

impl RetrievalEngine {
    pub fn new(store: Arc<VectorStore>, config: &Config) -> Self {
        Self {
            store,
            config: config.retrieval.clone(),
            templates: config.templates.clone(),
        }
    }

    pub fn store(&self) -> &Arc<VectorStore> {
        &self.store
    }

    /// Similarity search with configured defaults for any missing argument.
    ///
    /// If the store has no attached collection yet it is initialized once
    /// and the search retried once.
    pub async fn search(
        &self,
        query: &str,
        max_results: Option<usize>,
        threshold: Option<f64>,
    ) -> Result<Vec<RetrievedMatch>> {
        let max_results = max_results.unwrap_or(self.config.max_retrieved_docs);
        let threshold = threshold.unwrap_or(self.config.similarity_threshold);

        match self.store.search(query, max_results, threshold).await {
            Err(Error::StoreNotInitialized) => {
                info!("Store not initialized; initializing before retrying search");
                self.store.initialize().await?;
                self.store.search(query, max_results, threshold).await
            }
            other => other,
        }
    }

    /// Templates of the given severity among the nearest matches to
    /// `"<level> severity"`.
    pub async fn by_severity(&self, level: &str, max_results: usize) -> Result<Vec<RetrievedMatch>> {
        let query = format!("{} severity", level);
        let candidates = self
            .search(&query, Some(self.candidate_count(max_results)), Some(0.0))
            .await?;

        let matches = candidates
            .into_iter()
            .filter(|m| m.metadata.template.severity.eq_ignore_ascii_case(level));
        Ok(best_per_template(matches, max_results))
    }

    /// Templates matching `tags` under `mode` among the nearest matches to
    /// the tag list.
    pub async fn by_tags(
        &self,
        tags: &[String],
        max_results: usize,
        mode: TagMatch,
    ) -> Result<Vec<RetrievedMatch>> {
        let wanted: HashSet<String> = tags
            .iter()
            .map(|t| t.trim().to_lowercase())
            .filter(|t| !t.is_empty())
            .collect();
        if wanted.is_empty() {
            return Ok(Vec::new());
        }

        let query = tags.join(" ");
        let candidates = self
            .search(&query, Some(self.candidate_count(max_results)), Some(0.0))
            .await?;

        let matches = candidates.into_iter().filter(|m| {
            let have: HashSet<String> = m
                .metadata
                .template
                .tags
                .iter()
                .map(|t| t.to_lowercase())
                .collect();
            match mode {
                TagMatch::Any => wanted.iter().any(|t| have.contains(t)),
                TagMatch::All => wanted.iter().all(|t| have.contains(t)),
            }
        });
        Ok(best_per_template(matches, max_results))
    }

    fn candidate_count(&self, max_results: usize) -> usize {
        max_results.saturating_mul(self.config.filter_fanout)
    }

    /// Render matches for an LLM prompt.
    pub fn format_context(&self, matches: &[RetrievedMatch]) -> String {
        format_context(matches, self.config.context_char_budget)
    }

    pub async fn stats(&self) -> Result<StoreStats> {
        match self.store.stats().await {
            Err(Error::StoreNotInitialized) => {
                self.store.initialize().await?;
                self.store.stats().await
            }
            other => other,
        }
    }

    /// Clear the collection and re-ingest `dir`, or the configured
    /// templates directory when `dir` is `None`.
    pub async fn reload(&self, dir: Option<&Path>) -> anyhow::Result<IngestReport> {
        let dir = dir.unwrap_or(self.templates.dir.as_path());
        let report = ingest::reload(&self.store, dir, &self.templates).await;
        if let Err(e) = &report {
            warn!(dir = %dir.display(), error = %format!("{:#}", e), "Reload failed");
        }
        report
    }
}

/// Keep the first (most similar) chunk of each template, up to `limit`.
/// Templates are told apart by id and source path.
fn best_per_template(
    matches: impl Iterator<Item = RetrievedMatch>,
    limit: usize,
) -> Vec<RetrievedMatch> {
    let mut seen = HashSet::new();
    matches
        .filter(|m| {
            seen.insert((
                m.metadata.source_doc_id.clone(),
                m.metadata.template.source_path.clone(),
            ))
        })
        .take(limit)
        .collect()
}

/// Render matches as a numbered digest, each body cut to `char_budget`
/// characters with a trailing `...` when truncated.
pub fn format_context(matches: &[RetrievedMatch], char_budget: usize) -> String {
    if matches.is_empty() {
        return "No similar templates found.".to_string();
    }

    let rule = "=".repeat(RULE_WIDTH);
    let mut out = String::new();

    for (i, m) in matches.iter().enumerate() {
        let meta = &m.metadata.template;
        out.push_str(&rule);
        out.push('\n');
        out.push_str(&format!(
            "Template {} (Similarity: {:.2}):\n",
            i + 1,
            m.similarity
        ));
        out.push_str(&format!("- ID: {}\n", or_default(&meta.template_id, "unknown")));
        out.push_str(&format!("- Name: {}\n", or_default(&meta.name, "Unknown")));
        out.push_str(&format!("- Severity: {}\n", or_default(&meta.severity, "Unknown")));
        out.push_str(&format!("- Author: {}\n", join_or(&meta.authors, "Unknown")));
        out.push_str(&format!("- Tags: {}\n", join_or(&meta.tags, "none")));
        out.push_str(&format!(
            "- Description: {}\n",
            or_default(&meta.description, "No description")
        ));
        out.push_str("\nTemplate Content:\n```yaml\n");
        out.push_str(&truncate_chars(&m.content, char_budget));
        out.push_str("\n```\n");
    }

    out
}

/// First `budget` characters of `text`, plus `...` if anything was cut.
pub fn truncate_chars(text: &str, budget: usize) -> String {
    match text.char_indices().nth(budget) {
        Some((byte_idx, _)) => format!("{}...", &text[..byte_idx]),
        None => text.to_string(),
    }
}

fn or_default<'a>(value: &'a str, fallback: &'a str) -> &'a str {
    if value.trim().is_empty() {
        fallback
    } else {
        value
    }
}

fn join_or(values: &[String], fallback: &str) -> String {
    if values.is_empty() {
        fallback.to_string()
    } else {
        values.join(", ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ChunkMetadata, TemplateMetadata};

    fn hit(id: &str, content: &str, similarity: f64) -> RetrievedMatch {
        RetrievedMatch {
            content: content.to_string(),
            metadata: ChunkMetadata {
                template: TemplateMetadata {
                    template_id: id.to_string(),
                    name: format!("{} name", id),
                    severity: "high".to_string(),
                    authors: vec!["pdteam".to_string()],
                    tags: vec!["sqli".to_string(), "login".to_string()],
                    ..Default::default()
                },
                chunk_index: 0,
                total_chunks: 1,
                source_doc_id: id.to_string(),
            },
            similarity,
        }
    }

    #[test]
    fn empty_context_message() {
        assert_eq!(format_context(&[], 800), "No similar templates found.");
    }

    #[test]
    fn context_lists_matches_in_order() {
        let text = format_context(&[hit("first", "id: first", 0.91), hit("second", "id: second", 0.8)], 800);
        let first = text.find("- ID: first").unwrap();
        let second = text.find("- ID: second").unwrap();
        assert!(first < second);
        assert!(text.contains("Template 1 (Similarity: 0.91):"));
        assert!(text.contains("- Author: pdteam"));
        assert!(text.contains("- Tags: sqli, login"));
        assert!(text.contains("- Description: No description"));
    }

    #[test]
    fn long_content_is_truncated_with_marker() {
        let body = "x".repeat(1000);
        let text = format_context(&[hit("big", &body, 0.9)], 800);
        assert!(text.contains(&format!("{}...", "x".repeat(800))));
        assert!(!text.contains(&"x".repeat(801)));
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate_chars("héllo", 2), "hé...");
        assert_eq!(truncate_chars("short", 10), "short");
        assert_eq!(truncate_chars("exact", 5), "exact");
    }

    #[test]
    fn one_match_per_template() {
        let mut second_chunk = hit("a", "id: a part 2", 0.7);
        second_chunk.metadata.chunk_index = 1;
        second_chunk.metadata.total_chunks = 2;
        let matches = vec![hit("a", "id: a", 0.9), hit("b", "id: b", 0.8), second_chunk];

        let kept = best_per_template(matches.clone().into_iter(), 10);
        let ids: Vec<&str> = kept.iter().map(|m| m.metadata.source_doc_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(kept[0].content, "id: a");

        assert_eq!(best_per_template(matches.into_iter(), 1).len(), 1);
    }

    #[test]
    fn tag_match_parses() {
        assert_eq!("any".parse::<TagMatch>(), Ok(TagMatch::Any));
        assert_eq!(" ALL ".parse::<TagMatch>(), Ok(TagMatch::All));
        assert!("some".parse::<TagMatch>().is_err());
        assert_eq!(TagMatch::default(), TagMatch::Any);
    }

    #[test]
    fn formatting_is_deterministic() {
        let matches = vec![hit("a", "id: a", 0.75)];
        assert_eq!(format_context(&matches, 800), format_context(&matches, 800));
    }
}
