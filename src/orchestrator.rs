//! The generate → validate → refine loop.
//!
//! A run moves through a fixed set of [`Stage`]s. Each stage performs one
//! I/O step and reports a [`StepOutcome`]; the pure function
//! [`next_stage`] picks the following stage:
//!
//! ```text
//! Retrieve ──► Generate ──► Validate ──► Accept
//!                 │  ▲          │
//!                 │  └─ Refine ◄┘ (invalid, budget left)
//!                 ▼
//!               Fail (budget spent, or validator unavailable)
//! ```
//!
//! `max_retries` bounds the number of LLM calls (Generate plus Refine).
//! A failed LLM call, a timeout, or a response with no usable payload
//! moves to Refine with a "previous attempt failed" note while budget
//! remains. A missing validator binary fails the run at once.
//!
//! Retrieval is best-effort: any error there yields an empty context.
//! The caller always gets a [`GenerationResult`]; failures are reported
//! in it rather than as `Err`.
//!
//! Dropping the future returned by [`GenerationOrchestrator::generate`]
//! abandons the run; an in-flight validator child is killed on drop.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{error, info, warn};

use crate::config::{Config, GenerationConfig};
use crate::error::{Error, LlmFailureReason, Result};
use crate::extract::{self, FAILED_TEMPLATE_ID};
use crate::llm::LlmProvider;
use crate::models::{
    ExtractionKind, GenerationMetadata, GenerationRequest, GenerationResult, RetrievedMatch,
    ValidationResult,
};
use crate::prompts::{PromptSet, RefineFeedback};
use crate::retrieval::RetrievalEngine;
use crate::validator::Validator;

/// Where a run currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Retrieve,
    Generate,
    Validate,
    Refine,
    Accept,
    Fail,
}

impl Stage {
    pub fn is_terminal(self) -> bool {
        matches!(self, Stage::Accept | Stage::Fail)
    }
}

/// What the stage just executed produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Retrieved,
    /// The LLM answered and a payload was extracted.
    Generated,
    /// The LLM call failed, timed out, or yielded no payload.
    GenerateFailed,
    Validated { valid: bool },
    /// The validator binary could not be started.
    ValidatorUnavailable,
}

/// Transition function of the refine loop.
///
/// `llm_calls` is the number of Generate/Refine steps already run.
pub fn next_stage(
    stage: Stage,
    outcome: StepOutcome,
    llm_calls: u32,
    max_retries: u32,
    validation_required: bool,
) -> Stage {
    let budget_left = llm_calls < max_retries;
    match (stage, outcome) {
        (Stage::Retrieve, StepOutcome::Retrieved) => Stage::Generate,
        (Stage::Generate | Stage::Refine, StepOutcome::Generated) => {
            if validation_required {
                Stage::Validate
            } else {
                Stage::Accept
            }
        }
        (Stage::Generate | Stage::Refine, StepOutcome::GenerateFailed) if budget_left => {
            Stage::Refine
        }
        (Stage::Validate, StepOutcome::Validated { valid: true }) => Stage::Accept,
        (Stage::Validate, StepOutcome::Validated { valid: false }) if budget_left => Stage::Refine,
        _ => Stage::Fail,
    }
}

/// Mutable state of one run.
#[derive(Default)]
struct RunState {
    matches: Vec<RetrievedMatch>,
    context: String,
    llm_calls: u32,
    content: Option<String>,
    extraction: Option<ExtractionKind>,
    last_failure: Option<String>,
    validation: Option<ValidationResult>,
    tool_unavailable: bool,
}

/// Generates one template per request, retrying against validator
/// feedback.
pub struct GenerationOrchestrator {
    retrieval: Arc<RetrievalEngine>,
    llm: Arc<dyn LlmProvider>,
    validator: Arc<dyn Validator>,
    prompts: PromptSet,
    config: GenerationConfig,
    llm_timeout: Duration,
}

impl GenerationOrchestrator {
    pub fn new(
        retrieval: Arc<RetrievalEngine>,
        llm: Arc<dyn LlmProvider>,
        validator: Arc<dyn Validator>,
        prompts: PromptSet,
        config: &Config,
    ) -> Self {
        Self {
            retrieval,
            llm,
            validator,
            prompts,
            config: config.generation.clone(),
            llm_timeout: Duration::from_secs(config.llm.timeout_secs),
        }
    }

    /// Generate from a bare prompt with no hints.
    pub async fn generate(&self, prompt: &str) -> GenerationResult {
        self.generate_request(&GenerationRequest::new(prompt)).await
    }

    pub async fn generate_request(&self, request: &GenerationRequest) -> GenerationResult {
        let started = Instant::now();
        let max_retries = self.config.max_retries.max(1);
        let mut run = RunState::default();
        let mut stage = Stage::Retrieve;

        info!(prompt = %preview(&request.prompt, 100), "Starting template generation");

        while !stage.is_terminal() {
            let outcome = match stage {
                Stage::Retrieve => self.retrieve(request, &mut run).await,
                Stage::Generate | Stage::Refine => self.call_generate(stage, request, &mut run).await,
                Stage::Validate => self.validate(&mut run).await,
                Stage::Accept | Stage::Fail => break,
            };
            stage = next_stage(
                stage,
                outcome,
                run.llm_calls,
                max_retries,
                self.config.validation_required,
            );
        }

        let elapsed_ms = started.elapsed().as_millis() as u64;
        if stage == Stage::Accept {
            self.accepted(run, elapsed_ms)
        } else {
            self.failed(run, elapsed_ms)
        }
    }

    async fn retrieve(&self, request: &GenerationRequest, run: &mut RunState) -> StepOutcome {
        match self.retrieval.search(&request.prompt, None, None).await {
            Ok(matches) => run.matches = matches,
            Err(e) if e.is_retrieval_fault() => {
                warn!(error = %e, "Retrieval failed; continuing without context");
                run.matches = Vec::new();
            }
            Err(e) => {
                error!(error = %e, "Unexpected retrieval error; continuing without context");
                run.matches = Vec::new();
            }
        }
        run.context = self.retrieval.format_context(&run.matches);
        StepOutcome::Retrieved
    }

    async fn call_generate(
        &self,
        stage: Stage,
        request: &GenerationRequest,
        run: &mut RunState,
    ) -> StepOutcome {
        run.llm_calls += 1;

        let user_prompt = if stage == Stage::Generate {
            self.prompts.render_user(request, &run.context)
        } else {
            let feedback = match (&run.last_failure, &run.validation) {
                (Some(reason), _) => RefineFeedback::PriorFailure(reason),
                (None, Some(validation)) => RefineFeedback::Validation(validation),
                (None, None) => RefineFeedback::PriorFailure("no output was produced"),
            };
            self.prompts
                .render_refine(request, &run.context, run.content.as_deref(), feedback)
        };

        let response = self.call_llm(&user_prompt).await;
        match response.and_then(|text| extract::extract_payload(&text)) {
            Ok(extracted) => {
                run.content = Some(extracted.content);
                run.extraction = Some(extracted.kind);
                run.last_failure = None;
                StepOutcome::Generated
            }
            Err(e) => {
                warn!(attempt = run.llm_calls, error = %e, "Generation attempt failed");
                run.last_failure = Some(e.to_string());
                StepOutcome::GenerateFailed
            }
        }
    }

    async fn call_llm(&self, user_prompt: &str) -> Result<String> {
        let call = self.llm.generate(self.prompts.system(), user_prompt);
        match tokio::time::timeout(self.llm_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(Error::llm(
                LlmFailureReason::Timeout,
                format!("no response within {}s", self.llm_timeout.as_secs()),
            )),
        }
    }

    async fn validate(&self, run: &mut RunState) -> StepOutcome {
        let content = run.content.as_deref().unwrap_or_default();
        let report = self.validator.validate_detailed(content).await;
        let valid = report.result.is_valid;

        if report.is_tool_unavailable() {
            run.tool_unavailable = true;
            run.validation = Some(report.result);
            return StepOutcome::ValidatorUnavailable;
        }

        if !valid {
            warn!(
                attempt = run.llm_calls,
                errors = ?report.result.errors,
                "Generated template failed validation"
            );
        }
        run.validation = Some(report.result);
        StepOutcome::Validated { valid }
    }

    fn previews(&self, matches: &[RetrievedMatch]) -> Vec<String> {
        matches
            .iter()
            .take(self.config.preview_docs)
            .map(|m| format!("{}...", preview(&m.content, self.config.preview_chars)))
            .collect()
    }

    fn metadata(
        &self,
        run: &RunState,
        extraction: Option<ExtractionKind>,
        elapsed_ms: u64,
    ) -> GenerationMetadata {
        GenerationMetadata {
            model: self.llm.model_name().to_string(),
            similar_templates_count: run.matches.len(),
            attempts: run.llm_calls,
            extraction,
            elapsed_ms,
        }
    }

    fn accepted(&self, run: RunState, elapsed_ms: u64) -> GenerationResult {
        let content = run.content.clone().unwrap_or_default();
        let template_id = extract::template_id(&content);
        let validation = if self.config.validation_required {
            run.validation.clone().unwrap_or_else(ValidationResult::valid)
        } else {
            ValidationResult::valid()
        };

        info!(
            template_id = %template_id,
            attempts = run.llm_calls,
            "Template generation succeeded"
        );

        GenerationResult {
            success: true,
            template_id,
            content,
            validation,
            retrieval_context: self.previews(&run.matches),
            metadata: self.metadata(&run, run.extraction, elapsed_ms),
            created_at: Utc::now(),
        }
    }

    fn failed(&self, run: RunState, elapsed_ms: u64) -> GenerationResult {
        let (errors, warnings) = if run.tool_unavailable {
            let validation = run.validation.clone().unwrap_or_default();
            (validation.errors, validation.warnings)
        } else {
            let (last_errors, warnings) = match (&run.last_failure, &run.validation) {
                (Some(reason), _) => (vec![reason.clone()], Vec::new()),
                (None, Some(v)) => (v.errors.clone(), v.warnings.clone()),
                (None, None) => (Vec::new(), Vec::new()),
            };
            let summary = Error::RetriesExhausted {
                attempts: run.llm_calls,
                errors: last_errors.clone(),
            }
            .to_string();
            let mut errors = vec![summary];
            errors.extend(last_errors);
            (errors, warnings)
        };

        warn!(attempts = run.llm_calls, errors = ?errors, "Template generation failed");

        GenerationResult {
            success: false,
            template_id: FAILED_TEMPLATE_ID.to_string(),
            content: String::new(),
            validation: ValidationResult {
                is_valid: false,
                errors,
                warnings,
            },
            retrieval_context: self.previews(&run.matches),
            metadata: self.metadata(&run, None, elapsed_ms),
            created_at: Utc::now(),
        }
    }
}

fn preview(text: &str, chars: usize) -> String {
    text.chars().take(chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX: u32 = 3;

    #[test]
    fn happy_path() {
        assert_eq!(
            next_stage(Stage::Retrieve, StepOutcome::Retrieved, 0, MAX, true),
            Stage::Generate
        );
        assert_eq!(
            next_stage(Stage::Generate, StepOutcome::Generated, 1, MAX, true),
            Stage::Validate
        );
        assert_eq!(
            next_stage(Stage::Validate, StepOutcome::Validated { valid: true }, 1, MAX, true),
            Stage::Accept
        );
    }

    #[test]
    fn skips_validation_when_not_required() {
        assert_eq!(
            next_stage(Stage::Generate, StepOutcome::Generated, 1, MAX, false),
            Stage::Accept
        );
    }

    #[test]
    fn invalid_refines_until_budget_spent() {
        assert_eq!(
            next_stage(Stage::Validate, StepOutcome::Validated { valid: false }, 2, MAX, true),
            Stage::Refine
        );
        assert_eq!(
            next_stage(Stage::Validate, StepOutcome::Validated { valid: false }, 3, MAX, true),
            Stage::Fail
        );
    }

    #[test]
    fn llm_failure_refines_while_budget_left() {
        assert_eq!(
            next_stage(Stage::Generate, StepOutcome::GenerateFailed, 1, MAX, true),
            Stage::Refine
        );
        assert_eq!(
            next_stage(Stage::Refine, StepOutcome::GenerateFailed, 3, MAX, true),
            Stage::Fail
        );
    }

    #[test]
    fn unavailable_validator_fails_immediately() {
        assert_eq!(
            next_stage(Stage::Validate, StepOutcome::ValidatorUnavailable, 1, MAX, true),
            Stage::Fail
        );
    }

    /// Drive the transition function with every outcome sequence and check
    /// that no run makes more than `max_retries` LLM calls.
    #[test]
    fn loop_always_terminates_within_budget() {
        fn walk(stage: Stage, calls: u32, max: u32, depth: u32) {
            assert!(depth < 64, "transition graph has a cycle");
            if stage.is_terminal() {
                return;
            }
            let (outcomes, calls): (Vec<StepOutcome>, u32) = match stage {
                Stage::Retrieve => (vec![StepOutcome::Retrieved], calls),
                Stage::Generate | Stage::Refine => (
                    vec![StepOutcome::Generated, StepOutcome::GenerateFailed],
                    calls + 1,
                ),
                Stage::Validate => (
                    vec![
                        StepOutcome::Validated { valid: true },
                        StepOutcome::Validated { valid: false },
                        StepOutcome::ValidatorUnavailable,
                    ],
                    calls,
                ),
                Stage::Accept | Stage::Fail => unreachable!(),
            };
            assert!(calls <= max, "{} LLM calls with budget {}", calls, max);
            for outcome in outcomes {
                walk(next_stage(stage, outcome, calls, max, true), calls, max, depth + 1);
            }
        }

        for max in 1..=4 {
            walk(Stage::Retrieve, 0, max, 0);
        }
    }

    #[test]
    fn preview_counts_chars() {
        assert_eq!(preview("ééééé", 3), "ééé");
    }
}
