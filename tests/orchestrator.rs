//! The generate → validate → refine loop against scripted collaborators.

mod common;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use common::*;
use tempfile::TempDir;
use template_harness::config::Config;
use template_harness::embedding::EmbeddingProvider;
use template_harness::error::{Error, LlmFailureReason, Result};
use template_harness::index::MemoryIndex;
use template_harness::ingest;
use template_harness::llm::LlmProvider;
use template_harness::models::{ExtractionKind, GenerationRequest, TargetInfo, ValidationResult};
use template_harness::orchestrator::GenerationOrchestrator;
use template_harness::prompts::PromptSet;
use template_harness::retrieval::RetrievalEngine;
use template_harness::store::VectorStore;
use template_harness::validator::{ProcessOutcome, ValidationReport, Validator};

const GOOD_RESPONSE: &str = "Here is the template:\n\n```yaml\nid: login-sqli\ninfo:\n  name: Login SQLi\n  author: tester\n  severity: high\nhttp:\n  - method: GET\n    path:\n      - \"{{BaseURL}}/login\"\n```\n";

/// Replays canned responses and records every user prompt it was sent.
struct ScriptedLlm {
    responses: Mutex<VecDeque<Result<String>>>,
    prompts: Mutex<Vec<String>>,
    delay: Option<Duration>,
}

impl ScriptedLlm {
    fn new(responses: Vec<Result<String>>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.into()),
            prompts: Mutex::new(Vec::new()),
            delay: None,
        })
    }

    fn always(response: &str, times: usize) -> Arc<Self> {
        Self::new((0..times).map(|_| Ok(response.to_string())).collect())
    }

    fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(VecDeque::new()),
            prompts: Mutex::new(Vec::new()),
            delay: Some(delay),
        })
    }

    fn calls(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }

    fn prompt(&self, i: usize) -> String {
        self.prompts.lock().unwrap()[i].clone()
    }
}

#[async_trait]
impl LlmProvider for ScriptedLlm {
    fn model_name(&self) -> &str {
        "scripted"
    }

    async fn generate(&self, _system_prompt: &str, user_prompt: &str) -> Result<String> {
        self.prompts.lock().unwrap().push(user_prompt.to_string());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(Error::llm(LlmFailureReason::Provider, "script exhausted")))
    }
}

/// Returns canned verdicts in order, then "valid" forever.
struct ScriptedValidator {
    verdicts: Mutex<VecDeque<ValidationResult>>,
    calls: AtomicUsize,
}

impl ScriptedValidator {
    fn new(verdicts: Vec<ValidationResult>) -> Arc<Self> {
        Arc::new(Self {
            verdicts: Mutex::new(verdicts.into()),
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl Validator for ScriptedValidator {
    async fn validate_detailed(&self, _content: &str) -> ValidationReport {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let result = self
            .verdicts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(ValidationResult::valid);
        let exit_code = if result.is_valid { 0 } else { 1 };
        ValidationReport {
            outcome: ProcessOutcome::Completed { exit_code },
            result,
        }
    }
}

fn orchestrator(
    cfg: &Config,
    retrieval: Arc<RetrievalEngine>,
    llm: Arc<ScriptedLlm>,
    validator: Arc<dyn Validator>,
) -> GenerationOrchestrator {
    GenerationOrchestrator::new(retrieval, llm, validator, PromptSet::default(), cfg)
}

/// Embedder whose every call fails, as when the embedding service is down.
struct OfflineEmbedder;

#[async_trait]
impl EmbeddingProvider for OfflineEmbedder {
    fn model_name(&self) -> &str {
        "offline"
    }

    fn dims(&self) -> usize {
        DIMS
    }

    async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Err(Error::EmbeddingFailure("connection refused".to_string()))
    }
}

#[tokio::test]
async fn retrieval_fault_degrades_to_empty_context() {
    let cfg = test_config();
    let store = Arc::new(
        VectorStore::from_config(&cfg, Arc::new(MemoryIndex::new()), Arc::new(OfflineEmbedder))
            .unwrap(),
    );
    let engine = Arc::new(RetrievalEngine::new(store, &cfg));

    let fault = engine.search("sql injection", None, None).await.unwrap_err();
    assert!(fault.is_retrieval_fault());

    let llm = ScriptedLlm::always(GOOD_RESPONSE, 1);
    let orch = orchestrator(&cfg, engine, llm.clone(), ScriptedValidator::new(vec![]));
    let result = orch.generate("SQL injection in the login form").await;

    assert!(result.success);
    assert_eq!(result.metadata.similar_templates_count, 0);
    assert!(result.retrieval_context.is_empty());
    assert!(llm.prompt(0).contains("No similar templates found."));
}

#[tokio::test]
async fn valid_first_attempt_is_accepted() {
    let cfg = test_config();
    let llm = ScriptedLlm::always(GOOD_RESPONSE, 1);
    let validator = ScriptedValidator::new(vec![]);
    let orch = orchestrator(&cfg, memory_engine(&cfg), llm.clone(), validator.clone());

    let result = orch.generate("SQL injection in the login form").await;

    assert!(result.success);
    assert_eq!(result.template_id, "login-sqli");
    assert!(result.content.starts_with("id: login-sqli"));
    assert!(result.validation.is_valid);
    assert_eq!(result.metadata.attempts, 1);
    assert_eq!(result.metadata.model, "scripted");
    assert_eq!(result.metadata.extraction, Some(ExtractionKind::FencedBlock));
    assert_eq!(result.metadata.similar_templates_count, 0);
    assert!(result.retrieval_context.is_empty());
    assert_eq!(llm.calls(), 1);
    assert_eq!(validator.calls.load(Ordering::SeqCst), 1);
    assert!(llm.prompt(0).contains("No similar templates found."));
}

#[tokio::test]
async fn invalid_output_is_refined_with_validator_feedback() {
    let cfg = test_config();
    let llm = ScriptedLlm::always(GOOD_RESPONSE, 2);
    let validator = ScriptedValidator::new(vec![ValidationResult::invalid(
        "[ERR] matchers are required",
    )]);
    let orch = orchestrator(&cfg, memory_engine(&cfg), llm.clone(), validator.clone());

    let result = orch.generate("exposed admin panel").await;

    assert!(result.success);
    assert_eq!(result.metadata.attempts, 2);
    assert_eq!(validator.calls.load(Ordering::SeqCst), 2);

    let refine = llm.prompt(1);
    assert!(refine.contains("Validation Errors:\n[ERR] matchers are required"));
    assert!(refine.contains("Original Template:\n```yaml\nid: login-sqli"));
    assert!(refine.contains("exposed admin panel"));
}

#[tokio::test]
async fn llm_failure_is_retried_with_failure_note() {
    let cfg = test_config();
    let llm = ScriptedLlm::new(vec![
        Err(Error::llm(LlmFailureReason::RateLimit, "slow down")),
        Ok(GOOD_RESPONSE.to_string()),
    ]);
    let validator = ScriptedValidator::new(vec![]);
    let orch = orchestrator(&cfg, memory_engine(&cfg), llm.clone(), validator.clone());

    let result = orch.generate("login sqli").await;

    assert!(result.success);
    assert_eq!(result.metadata.attempts, 2);
    assert_eq!(validator.calls.load(Ordering::SeqCst), 1);
    assert!(llm
        .prompt(1)
        .contains("Note: the previous attempt failed: LLM failure (rate_limit): slow down"));
}

#[tokio::test]
async fn exhausted_llm_failures_report_last_error() {
    let cfg = test_config();
    let llm = ScriptedLlm::new(vec![
        Err(Error::llm(LlmFailureReason::Auth, "bad key")),
        Err(Error::llm(LlmFailureReason::Auth, "bad key")),
        Err(Error::llm(LlmFailureReason::Auth, "bad key")),
    ]);
    let validator = ScriptedValidator::new(vec![]);
    let orch = orchestrator(&cfg, memory_engine(&cfg), llm.clone(), validator.clone());

    let result = orch.generate("anything").await;

    assert!(!result.success);
    assert_eq!(result.template_id, "failed_generation");
    assert!(result.content.is_empty());
    assert_eq!(result.metadata.attempts, 3);
    assert_eq!(llm.calls(), 3);
    assert_eq!(validator.calls.load(Ordering::SeqCst), 0);
    assert!(result.validation.errors[0].starts_with("retries exhausted after 3 attempt(s)"));
    assert!(result
        .validation
        .errors
        .iter()
        .any(|e| e.contains("LLM failure (auth): bad key")));
}

#[tokio::test]
async fn empty_response_counts_as_failed_attempt() {
    let cfg = test_config();
    let llm = ScriptedLlm::new(vec![Ok("   \n".to_string()), Ok(GOOD_RESPONSE.to_string())]);
    let validator = ScriptedValidator::new(vec![]);
    let orch = orchestrator(&cfg, memory_engine(&cfg), llm.clone(), validator);

    let result = orch.generate("login sqli").await;

    assert!(result.success);
    assert_eq!(result.metadata.attempts, 2);
    assert!(llm.prompt(1).contains("no structured payload found"));
}

#[tokio::test]
async fn validation_can_be_skipped() {
    let mut cfg = test_config();
    cfg.generation.validation_required = false;
    let llm = ScriptedLlm::always("id: bare\ninfo:\n  name: Bare\n", 1);
    let validator = ScriptedValidator::new(vec![ValidationResult::invalid("never consulted")]);
    let orch = orchestrator(&cfg, memory_engine(&cfg), llm, validator.clone());

    let result = orch.generate("bare").await;

    assert!(result.success);
    assert_eq!(result.template_id, "bare");
    assert!(result.validation.is_valid);
    assert_eq!(result.metadata.extraction, Some(ExtractionKind::StructuralKeys));
    assert_eq!(validator.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn llm_calls_never_exceed_max_retries() {
    for max_retries in 1..=4u32 {
        let mut cfg = test_config();
        cfg.generation.max_retries = max_retries;
        let llm = ScriptedLlm::always(GOOD_RESPONSE, 10);
        let verdicts = (0..10)
            .map(|_| ValidationResult::invalid("still broken"))
            .collect();
        let validator = ScriptedValidator::new(verdicts);
        let orch = orchestrator(&cfg, memory_engine(&cfg), llm.clone(), validator);

        let result = orch.generate("loop").await;

        assert!(!result.success);
        assert_eq!(llm.calls(), max_retries as usize);
        assert_eq!(result.metadata.attempts, max_retries);
    }
}

#[tokio::test]
async fn slow_llm_times_out_each_attempt() {
    let mut cfg = test_config();
    cfg.llm.timeout_secs = 1;
    cfg.generation.max_retries = 2;
    let llm = ScriptedLlm::slow(Duration::from_secs(30));
    let validator = ScriptedValidator::new(vec![]);
    let orch = orchestrator(&cfg, memory_engine(&cfg), llm.clone(), validator);

    let result = orch.generate("slow").await;

    assert!(!result.success);
    assert_eq!(llm.calls(), 2);
    assert!(result
        .validation
        .errors
        .iter()
        .any(|e| e.contains("LLM failure (timeout)")));
}

#[tokio::test]
async fn request_hints_and_retrieved_context_reach_the_prompt() {
    let mut cfg = test_config();
    cfg.retrieval.similarity_threshold = 0.0;
    cfg.generation.preview_docs = 2;
    cfg.generation.preview_chars = 10;
    let engine = memory_engine(&cfg);
    let tmp = TempDir::new().unwrap();
    write_corpus(tmp.path());
    ingest::ingest_directory(engine.store(), tmp.path(), &cfg.templates)
        .await
        .unwrap();

    let llm = ScriptedLlm::always(GOOD_RESPONSE, 1);
    let orch = orchestrator(&cfg, engine, llm.clone(), ScriptedValidator::new(vec![]));

    let request = GenerationRequest {
        prompt: "SQL injection in login".to_string(),
        severity: Some("high".to_string()),
        tags: vec!["sqli".to_string()],
        author: Some("secops".to_string()),
        references: vec![],
        target: Some(TargetInfo {
            url: "https://shop.example/login".to_string(),
            method: "POST".to_string(),
            parameters: vec!["username".to_string(), "password".to_string()],
            headers: [("X-Api-Version".to_string(), "2".to_string())].into_iter().collect(),
            cookies: Default::default(),
        }),
    };
    let result = orch.generate_request(&request).await;

    assert!(result.success);
    assert_eq!(result.metadata.similar_templates_count, 3);
    assert_eq!(result.retrieval_context.len(), 2);
    for preview in &result.retrieval_context {
        assert!(preview.ends_with("..."));
        assert_eq!(preview.chars().count(), 13);
    }

    let prompt = llm.prompt(0);
    assert!(prompt.contains("Severity: high"));
    assert!(prompt.contains("Author: secops"));
    assert!(prompt.contains("Target URL: https://shop.example/login"));
    assert!(prompt.contains("HTTP Method: POST"));
    assert!(prompt.contains("Parameters: username, password"));
    assert!(prompt.contains("Headers: X-Api-Version: 2"));
    assert!(prompt.contains("- ID: sqli-login"));
}

#[cfg(unix)]
mod with_validator_process {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::path::{Path, PathBuf};
    use template_harness::config::ValidatorConfig;
    use template_harness::validator::ValidationRunner;

    fn script(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("fake-nuclei");
        fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn runner(binary: PathBuf) -> Arc<ValidationRunner> {
        Arc::new(ValidationRunner::new(&ValidatorConfig {
            binary,
            ..ValidatorConfig::default()
        }))
    }

    #[tokio::test]
    async fn missing_validator_stops_after_one_attempt() {
        let cfg = test_config();
        let tmp = TempDir::new().unwrap();
        let validator = runner(tmp.path().join("no-such-nuclei"));

        let direct = validator.validate("id: x\n").await;
        assert!(!direct.is_valid);
        assert!(direct.errors[0].contains("binary not found"));

        let llm = ScriptedLlm::always(GOOD_RESPONSE, 3);
        let orch = orchestrator(&cfg, memory_engine(&cfg), llm.clone(), validator);
        let result = orch.generate("login sqli").await;

        assert!(!result.success);
        assert_eq!(result.metadata.attempts, 1);
        assert_eq!(llm.calls(), 1);
        assert!(result.validation.errors[0].contains("binary not found"));
    }

    #[tokio::test]
    async fn persistent_validator_errors_exhaust_retries() {
        let mut cfg = test_config();
        cfg.generation.max_retries = 3;
        let tmp = TempDir::new().unwrap();
        let counter = tmp.path().join("calls");
        let binary = script(
            tmp.path(),
            &format!(
                "echo run >> '{}'\necho 'error: missing info field' >&2\nexit 1",
                counter.display()
            ),
        );

        let llm = ScriptedLlm::always(GOOD_RESPONSE, 5);
        let orch = orchestrator(&cfg, memory_engine(&cfg), llm.clone(), runner(binary));
        let result = orch.generate("login sqli").await;

        assert!(!result.success);
        assert_eq!(result.metadata.attempts, 3);
        assert_eq!(llm.calls(), 3);
        assert_eq!(fs::read_to_string(&counter).unwrap().lines().count(), 3);
        assert!(result
            .validation
            .errors
            .last()
            .unwrap()
            .contains("missing info field"));
    }

    #[tokio::test]
    async fn passing_validator_accepts_generated_template() {
        let cfg = test_config();
        let tmp = TempDir::new().unwrap();
        let binary = script(tmp.path(), "echo '[INF] All templates validated successfully'\nexit 0");

        let llm = ScriptedLlm::always(GOOD_RESPONSE, 1);
        let orch = orchestrator(&cfg, memory_engine(&cfg), llm, runner(binary));
        let result = orch.generate("login sqli").await;

        assert!(result.success);
        assert_eq!(result.template_id, "login-sqli");
        assert!(result.validation.errors.is_empty());
    }
}
