//! Prompt templates for generation and refinement.
//!
//! The system prompt and the user prompt template can be overridden with
//! files (`[prompts] system_path`, `user_template_path`). User templates
//! may use three placeholders, filled in a single pass so that text
//! inside a value is never re-expanded:
//!
//! | Placeholder | Value |
//! |-------------|-------|
//! | `{prompt}` | the request's natural-language description |
//! | `{hints}` | severity, tags, author and references, one per line |
//! | `{retrieval_context}` | output of [`format_context`](crate::retrieval::format_context) |

use anyhow::{Context, Result};

use crate::config::PromptsConfig;
use crate::models::{GenerationRequest, ValidationResult};

const DEFAULT_SYSTEM_PROMPT: &str = "\
You are an expert author of Nuclei vulnerability-detection templates.
Write a single complete template in YAML. It must declare a unique `id`,
an `info` block (name, author, severity, description, tags) and at least
one protocol section such as `http`. Use matchers that are specific enough
to avoid false positives. Reply with the template inside one ```yaml block.";

const DEFAULT_USER_TEMPLATE: &str = "\
Generate a Nuclei template for the following vulnerability:

{prompt}

{hints}

Similar existing templates for reference:
{retrieval_context}";

/// Why the previous attempt is being refined.
#[derive(Debug, Clone, Copy)]
pub enum RefineFeedback<'a> {
    /// The validator rejected the previous content.
    Validation(&'a ValidationResult),
    /// The previous LLM call failed or produced nothing usable.
    PriorFailure(&'a str),
}

/// System prompt plus user prompt template.
#[derive(Debug, Clone)]
pub struct PromptSet {
    system: String,
    user_template: String,
}

impl Default for PromptSet {
    fn default() -> Self {
        Self {
            system: DEFAULT_SYSTEM_PROMPT.to_string(),
            user_template: DEFAULT_USER_TEMPLATE.to_string(),
        }
    }
}

impl PromptSet {
    pub fn new(system: impl Into<String>, user_template: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            user_template: user_template.into(),
        }
    }

    /// Read override files named in `[prompts]`; missing entries use the
    /// built-in prompts.
    pub fn load(config: &PromptsConfig) -> Result<Self> {
        let mut prompts = Self::default();
        if let Some(path) = &config.system_path {
            prompts.system = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read system prompt: {}", path.display()))?;
        }
        if let Some(path) = &config.user_template_path {
            prompts.user_template = std::fs::read_to_string(path).with_context(|| {
                format!("Failed to read user prompt template: {}", path.display())
            })?;
        }
        Ok(prompts)
    }

    pub fn system(&self) -> &str {
        &self.system
    }

    /// First-attempt user prompt.
    pub fn render_user(&self, request: &GenerationRequest, retrieval_context: &str) -> String {
        let hints = render_hints(request);
        fill(
            &self.user_template,
            &[
                ("prompt", request.prompt.as_str()),
                ("hints", hints.as_str()),
                ("retrieval_context", retrieval_context),
            ],
        )
    }

    /// Follow-up prompt for the next attempt.
    ///
    /// With previous content, the prompt quotes it along with the feedback.
    /// Without it (the first call failed), the original user prompt is
    /// repeated with the failure note appended.
    pub fn render_refine(
        &self,
        request: &GenerationRequest,
        retrieval_context: &str,
        previous: Option<&str>,
        feedback: RefineFeedback<'_>,
    ) -> String {
        let previous = match previous {
            Some(content) => content,
            None => {
                let note = match feedback {
                    RefineFeedback::PriorFailure(reason) => reason.to_string(),
                    RefineFeedback::Validation(result) => result.errors.join("; "),
                };
                return format!(
                    "{}\n\nNote: the previous attempt failed: {}\nReply with one complete template inside a ```yaml block.",
                    self.render_user(request, retrieval_context),
                    note
                );
            }
        };

        let issues = match feedback {
            RefineFeedback::Validation(result) => format!(
                "The generated Nuclei template has validation errors. Please fix the following issues:\n\n\
                 Validation Errors:\n{}\n\nValidation Warnings:\n{}",
                result.errors.join("\n"),
                result.warnings.join("\n")
            ),
            RefineFeedback::PriorFailure(reason) => {
                format!("The previous attempt failed: {}", reason)
            }
        };

        format!(
            "{}\n\nOriginal Template:\n```yaml\n{}\n```\n\n\
             Please provide a corrected version of the template that addresses these issues \
             while keeping its purpose of detecting: {}",
            issues, previous, request.prompt
        )
    }
}

/// Request hints, one `Key: value` line per non-empty hint.
pub fn render_hints(request: &GenerationRequest) -> String {
    let mut lines = Vec::new();
    if let Some(severity) = request.severity.as_deref().filter(|s| !s.is_empty()) {
        lines.push(format!("Severity: {}", severity));
    }
    if !request.tags.is_empty() {
        lines.push(format!("Tags: {}", request.tags.join(", ")));
    }
    if let Some(author) = request.author.as_deref().filter(|s| !s.is_empty()) {
        lines.push(format!("Author: {}", author));
    }
    if !request.references.is_empty() {
        lines.push(format!("References: {}", request.references.join(", ")));
    }
    if let Some(target) = &request.target {
        lines.push(format!("Target URL: {}", target.url));
        lines.push(format!("HTTP Method: {}", target.method.to_uppercase()));
        if !target.parameters.is_empty() {
            lines.push(format!("Parameters: {}", target.parameters.join(", ")));
        }
        if !target.headers.is_empty() {
            let headers: Vec<String> = target
                .headers
                .iter()
                .map(|(name, value)| format!("{}: {}", name, value))
                .collect();
            lines.push(format!("Headers: {}", headers.join("; ")));
        }
        if !target.cookies.is_empty() {
            let cookies: Vec<String> = target
                .cookies
                .iter()
                .map(|(name, value)| format!("{}={}", name, value))
                .collect();
            lines.push(format!("Cookies: {}", cookies.join("; ")));
        }
    }
    lines.join("\n")
}

/// Replace `{name}` placeholders in one pass. Unknown braces are kept.
fn fill(template: &str, vars: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let tail = &rest[open + 1..];
        let hit = vars.iter().find(|(name, _)| {
            tail.starts_with(name) && tail[name.len()..].starts_with('}')
        });
        match hit {
            Some((name, value)) => {
                out.push_str(value);
                rest = &tail[name.len() + 1..];
            }
            None => {
                out.push('{');
                rest = tail;
            }
        }
    }

    out.push_str(rest);
    out
}
