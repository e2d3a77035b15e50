//! Template validation through the external scanner binary.
//!
//! [`ValidationRunner`] writes content to a temporary `.yaml` file and runs
//!
//! ```text
//! <binary> <validate_args...> -t <file>
//! ```
//!
//! under a hard timeout. Every call ends in one of three [`ProcessOutcome`]s:
//!
//! | Outcome | Result |
//! |---------|--------|
//! | `Completed(code)` | stdout/stderr lines classified into errors and warnings |
//! | `TimedOut` | child killed and reaped; one timeout error |
//! | `NotFound` | binary could not be started; one "binary not found" error |
//!
//! A nonzero exit code is never reported as valid: if no output line looks
//! like an error, a generic `validator exited with code N` error is added.
//!
//! [`ValidationRunner::validate_syntax_only`] is a local YAML check that
//! needs no binary. [`ValidationRunner::run_template`] executes a template
//! against a live target instead of only validating it.

use std::ffi::OsString;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_yaml::Value;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::ValidatorConfig;
use crate::error::Error;
use crate::models::ValidationResult;

/// Substrings marking an output line as an error. Checked before warnings.
const ERROR_KEYWORDS: [&str; 4] = ["error", "invalid", "failed", "fatal"];
/// Substrings marking an output line as a warning.
const WARNING_KEYWORDS: [&str; 2] = ["warning", "warn"];
/// Error phrases checked after warnings, so "warning: unable to ..." stays
/// a warning.
const SOFT_ERROR_PHRASES: [&str; 2] = ["could not", "unable to"];

/// How a validator process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ProcessOutcome {
    Completed { exit_code: i32 },
    TimedOut,
    /// The binary could not be started.
    NotFound,
}

/// A [`ValidationResult`] plus how the process ended.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationReport {
    pub outcome: ProcessOutcome,
    pub result: ValidationResult,
}

impl ValidationReport {
    /// The validator itself is unusable, as opposed to the content being bad.
    pub fn is_tool_unavailable(&self) -> bool {
        self.outcome == ProcessOutcome::NotFound
    }
}

/// Judges generated content.
#[async_trait]
pub trait Validator: Send + Sync {
    async fn validate_detailed(&self, content: &str) -> ValidationReport;

    async fn validate(&self, content: &str) -> ValidationResult {
        self.validate_detailed(content).await.result
    }
}

/// Output of [`ValidationRunner::run_template`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TemplateRun {
    /// The scanner exited with code 0.
    pub success: bool,
    pub outcome: ProcessOutcome,
    pub stdout: String,
    pub stderr: String,
}

enum RawRun {
    Completed {
        exit_code: i32,
        stdout: String,
        stderr: String,
    },
    TimedOut,
    NotFound(String),
}

/// Runs the external validator binary.
#[derive(Debug, Clone)]
pub struct ValidationRunner {
    binary: PathBuf,
    validate_args: Vec<String>,
    timeout: Duration,
    probe_timeout: Duration,
}

impl ValidationRunner {
    pub fn new(config: &ValidatorConfig) -> Self {
        Self {
            binary: config.binary.clone(),
            validate_args: config.validate_args.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
            probe_timeout: Duration::from_secs(config.probe_timeout_secs),
        }
    }

    /// Override the validation timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    /// Validate a file already on disk.
    pub async fn validate_file(&self, path: &Path) -> ValidationResult {
        if !path.is_file() {
            return ValidationResult::invalid(format!(
                "template file not found: {}",
                path.display()
            ));
        }
        self.run_validation(path).await.result
    }

    async fn run_validation(&self, target: &Path) -> ValidationReport {
        let mut args: Vec<OsString> = self.validate_args.iter().map(OsString::from).collect();
        args.push(OsString::from("-t"));
        args.push(target.as_os_str().to_os_string());

        debug!(binary = %self.binary.display(), target = %target.display(), "Running validator");

        let report = match self.run(&args, self.timeout).await {
            RawRun::Completed {
                exit_code,
                stdout,
                stderr,
            } => {
                debug!(exit_code, %stdout, %stderr, "Validator finished");
                ValidationReport {
                    outcome: ProcessOutcome::Completed { exit_code },
                    result: classify_output(&stdout, &stderr, exit_code),
                }
            }
            RawRun::TimedOut => {
                warn!(timeout_secs = self.timeout.as_secs(), "Validator timed out; killed");
                ValidationReport {
                    outcome: ProcessOutcome::TimedOut,
                    result: ValidationResult::invalid(
                        Error::ValidatorTimeout(self.timeout).to_string(),
                    ),
                }
            }
            RawRun::NotFound(reason) => {
                warn!(binary = %self.binary.display(), %reason, "Validator binary not found");
                ValidationReport {
                    outcome: ProcessOutcome::NotFound,
                    result: ValidationResult::invalid(
                        Error::ValidatorUnavailable(format!(
                            "binary not found: {} ({})",
                            self.binary.display(),
                            reason
                        ))
                        .to_string(),
                    ),
                }
            }
        };

        info!(
            target = %target.display(),
            valid = report.result.is_valid,
            errors = report.result.errors.len(),
            warnings = report.result.warnings.len(),
            "Validation finished"
        );
        report
    }

    /// Spawn the binary, collect its output, and kill it if `timeout`
    /// elapses first. The child is always reaped before returning.
    async fn run(&self, args: &[OsString], timeout: Duration) -> RawRun {
        let mut cmd = Command::new(&self.binary);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => return RawRun::NotFound(e.to_string()),
        };

        // Drain both pipes while waiting so a chatty child cannot block on a
        // full pipe buffer.
        let mut stdout_task = tokio::spawn(read_pipe(child.stdout.take()));
        let mut stderr_task = tokio::spawn(read_pipe(child.stderr.take()));

        // Waiting and draining share one deadline: a background process
        // that inherited the pipes can hold them open after the child exits.
        let finished = tokio::time::timeout(timeout, async {
            let status = child.wait().await;
            let stdout = (&mut stdout_task).await.unwrap_or_default();
            let stderr = (&mut stderr_task).await.unwrap_or_default();
            (status, stdout, stderr)
        })
        .await;

        match finished {
            Ok((Ok(status), stdout, stderr)) => RawRun::Completed {
                exit_code: status.code().unwrap_or(-1),
                stdout,
                stderr,
            },
            Ok((Err(e), stdout, _)) => RawRun::Completed {
                exit_code: -1,
                stdout,
                stderr: format!("failed to wait for validator: {}", e),
            },
            Err(_) => {
                // kill() sends SIGKILL and waits for the exit status. A child
                // that already exited has been reaped by wait().
                if let Ok(None) = child.try_wait() {
                    if let Err(e) = child.kill().await {
                        warn!(error = %e, "Failed to kill timed-out validator");
                    }
                }
                stdout_task.abort();
                stderr_task.abort();
                RawRun::TimedOut
            }
        }
    }

    /// Run `template` against a live `target`:
    ///
    /// ```text
    /// <binary> -t <template> -target <target> <extra_args...>
    /// ```
    ///
    /// Scanning takes longer than validation, so the deadline is twice the
    /// validation timeout.
    pub async fn run_template(
        &self,
        template: &Path,
        target: &str,
        extra_args: &[String],
    ) -> TemplateRun {
        if !template.is_file() {
            return TemplateRun {
                success: false,
                outcome: ProcessOutcome::NotFound,
                stdout: String::new(),
                stderr: format!("template file not found: {}", template.display()),
            };
        }

        let mut args = vec![
            OsString::from("-t"),
            template.as_os_str().to_os_string(),
            OsString::from("-target"),
            OsString::from(target),
        ];
        args.extend(extra_args.iter().map(OsString::from));

        let timeout = self.timeout.saturating_mul(2);
        debug!(template = %template.display(), url = %target, "Running template");

        let run = match self.run(&args, timeout).await {
            RawRun::Completed {
                exit_code,
                stdout,
                stderr,
            } => TemplateRun {
                success: exit_code == 0,
                outcome: ProcessOutcome::Completed { exit_code },
                stdout,
                stderr,
            },
            RawRun::TimedOut => TemplateRun {
                success: false,
                outcome: ProcessOutcome::TimedOut,
                stdout: String::new(),
                stderr: format!(
                    "template execution timed out after {} seconds",
                    timeout.as_secs()
                ),
            },
            RawRun::NotFound(reason) => TemplateRun {
                success: false,
                outcome: ProcessOutcome::NotFound,
                stdout: String::new(),
                stderr: Error::ValidatorUnavailable(format!(
                    "binary not found: {} ({})",
                    self.binary.display(),
                    reason
                ))
                .to_string(),
            },
        };

        info!(
            template = %template.display(),
            url = %target,
            success = run.success,
            "Template run finished"
        );
        run
    }

    /// Local YAML well-formedness check. Missing `id`/`info` keys are
    /// reported as warnings.
    pub fn validate_syntax_only(&self, content: &str) -> ValidationResult {
        validate_syntax(content)
    }

    /// Version string reported by `<binary> -version`, if the probe
    /// succeeds within the probe timeout.
    pub async fn version(&self) -> Option<String> {
        match self.run(&[OsString::from("-version")], self.probe_timeout).await {
            RawRun::Completed { stdout, stderr, .. } => {
                let combined = format!("{}\n{}", stdout, stderr);
                let line = combined.lines().map(str::trim).find(|line| {
                    line.to_lowercase().contains("nuclei") && line.chars().any(|c| c.is_ascii_digit())
                });
                match line {
                    Some(line) => Some(line.to_string()),
                    None => {
                        let trimmed = combined.trim();
                        (!trimmed.is_empty()).then(|| trimmed.to_string())
                    }
                }
            }
            RawRun::TimedOut => {
                warn!("Validator version probe timed out");
                None
            }
            RawRun::NotFound(reason) => {
                debug!(%reason, "Validator version probe failed");
                None
            }
        }
    }

    pub async fn check_available(&self) -> bool {
        self.version().await.is_some()
    }
}

#[async_trait]
impl Validator for ValidationRunner {
    async fn validate_detailed(&self, content: &str) -> ValidationReport {
        let mut file = match tempfile::Builder::new()
            .prefix("tmpl-validate-")
            .suffix(".yaml")
            .tempfile()
        {
            Ok(file) => file,
            Err(e) => {
                return ValidationReport {
                    outcome: ProcessOutcome::NotFound,
                    result: ValidationResult::invalid(format!(
                        "failed to create temporary file: {}",
                        e
                    )),
                }
            }
        };

        if let Err(e) = write_content(file.as_file_mut(), content) {
            return ValidationReport {
                outcome: ProcessOutcome::NotFound,
                result: ValidationResult::invalid(format!(
                    "failed to write temporary file: {}",
                    e
                )),
            };
        }

        // The temp file is removed when `file` drops, after the run.
        self.run_validation(file.path()).await
    }
}

fn write_content(file: &mut std::fs::File, content: &str) -> std::io::Result<()> {
    file.write_all(content.as_bytes())?;
    file.flush()
}

async fn read_pipe<R: AsyncRead + Unpin>(pipe: Option<R>) -> String {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        let _ = pipe.read_to_end(&mut buf).await;
    }
    String::from_utf8_lossy(&buf).into_owned()
}

/// Sort validator output lines into errors and warnings.
///
/// Lines announcing loaded templates are informational and skipped.
pub fn classify_output(stdout: &str, stderr: &str, exit_code: i32) -> ValidationResult {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    for line in stderr.lines().chain(stdout.lines()) {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let lower = line.to_lowercase();
        if lower.contains("loaded") && lower.contains("template") {
            continue;
        }

        if ERROR_KEYWORDS.iter().any(|k| lower.contains(k)) {
            errors.push(line.to_string());
        } else if WARNING_KEYWORDS.iter().any(|k| lower.contains(k)) {
            warnings.push(line.to_string());
        } else if SOFT_ERROR_PHRASES.iter().any(|k| lower.contains(k)) {
            errors.push(line.to_string());
        }
    }

    if exit_code != 0 && errors.is_empty() {
        errors.push(format!("validator exited with code {}", exit_code));
    }

    ValidationResult {
        is_valid: exit_code == 0 && errors.is_empty(),
        errors,
        warnings,
    }
}

/// Parse `content` as YAML and check for the top-level template keys.
pub fn validate_syntax(content: &str) -> ValidationResult {
    let value: Value = match serde_yaml::from_str(content) {
        Ok(value) => value,
        Err(e) => return ValidationResult::invalid(format!("YAML syntax error: {}", e)),
    };

    let mut result = ValidationResult::valid();
    if !value.is_mapping() {
        result
            .warnings
            .push("top-level document is not a mapping".to_string());
        return result;
    }
    for key in ["id", "info"] {
        if value.get(key).is_none() {
            result
                .warnings
                .push(format!("missing top-level field: {}", key));
        }
    }
    result
}
