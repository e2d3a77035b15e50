//! Payload extraction from free-form LLM responses.
//!
//! Models wrap templates in prose and markdown. [`extract_payload`] tries,
//! in order:
//!
//! 1. the body of the first ```` ```yaml ```` / ```` ```yml ```` fenced block;
//! 2. everything from the first line that opens a top-level template key
//!    (`id:`, `info:`, `variables:`, `requests:`, `http:`, `network:`,
//!    `file:`) up to a closing fence;
//! 3. the whole response.
//!
//! This is a heuristic, not a parser. The returned [`ExtractionKind`] says
//! which path produced the payload.

use serde_yaml::Value;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::ExtractionKind;

const STRUCTURAL_KEYS: [&str; 7] = [
    "id:",
    "info:",
    "variables:",
    "requests:",
    "http:",
    "network:",
    "file:",
];

/// Id reported for failed generations.
pub const FAILED_TEMPLATE_ID: &str = "failed_generation";

/// A payload and how it was located.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extracted {
    pub content: String,
    pub kind: ExtractionKind,
}

/// Locate the template inside `response`.
///
/// Fails with [`Error::ExtractionAmbiguous`] if nothing but whitespace is
/// left.
pub fn extract_payload(response: &str) -> Result<Extracted> {
    if let Some(content) = fenced_block(response) {
        return Ok(Extracted {
            content,
            kind: ExtractionKind::FencedBlock,
        });
    }
    if let Some(content) = from_structural_key(response) {
        return Ok(Extracted {
            content,
            kind: ExtractionKind::StructuralKeys,
        });
    }

    let raw = response.trim();
    if raw.is_empty() {
        return Err(Error::ExtractionAmbiguous);
    }
    Ok(Extracted {
        content: raw.to_string(),
        kind: ExtractionKind::RawResponse,
    })
}

fn fenced_block(response: &str) -> Option<String> {
    let mut lines = response.lines();
    lines.find(|line| {
        let t = line.trim();
        t.starts_with("```yaml") || t.starts_with("```yml")
    })?;

    let body: Vec<&str> = lines.take_while(|line| line.trim() != "```").collect();
    let body = body.join("\n");
    let trimmed = body.trim_matches('\n').trim_end();
    (!trimmed.trim().is_empty()).then(|| trimmed.to_string())
}

fn from_structural_key(response: &str) -> Option<String> {
    let lines: Vec<&str> = response.lines().collect();
    let start = lines
        .iter()
        .position(|line| STRUCTURAL_KEYS.iter().any(|key| line.starts_with(key)))?;

    let body: Vec<&str> = lines[start..]
        .iter()
        .take_while(|line| !line.trim_start().starts_with("```"))
        .copied()
        .collect();
    let body = body.join("\n");
    let trimmed = body.trim_end();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

/// The template's declared top-level `id`, if it parses and has one.
pub fn declared_id(content: &str) -> Option<String> {
    let value: Value = serde_yaml::from_str(content).ok()?;
    match value.get("id")? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Declared id, or `generated_<8 hex>` when there is none.
pub fn template_id(content: &str) -> String {
    declared_id(content).unwrap_or_else(generated_id)
}

fn generated_id() -> String {
    let hex = Uuid::new_v4().simple().to_string();
    format!("generated_{}", &hex[..8])
}
