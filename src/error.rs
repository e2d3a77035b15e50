//! Error taxonomy for the retrieval and generation pipeline.
//!
//! Component boundaries return [`Error`]; application glue (config loading,
//! template discovery, the CLI) uses `anyhow` and wraps these with context.
//! Business-level outcomes such as rejected content are usually reported as
//! values ([`ValidationResult`](crate::models::ValidationResult),
//! [`GenerationResult`](crate::models::GenerationResult)) rather than errors;
//! the variants here exist so those values can name their cause.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Why an LLM call failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmFailureReason {
    Timeout,
    RateLimit,
    Auth,
    Provider,
}

impl fmt::Display for LlmFailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            LlmFailureReason::Timeout => "timeout",
            LlmFailureReason::RateLimit => "rate_limit",
            LlmFailureReason::Auth => "auth",
            LlmFailureReason::Provider => "provider",
        };
        f.write_str(tag)
    }
}

/// Errors produced by the pipeline components.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// No collection is attached to the vector store.
    #[error("vector store not initialized")]
    StoreNotInitialized,

    /// The embedding provider could not embed the input.
    #[error("embedding failure: {0}")]
    EmbeddingFailure(String),

    /// The index backend rejected an operation.
    #[error("store failure: {0}")]
    StoreFailure(String),

    /// The text-generation provider failed.
    #[error("LLM failure ({reason}): {message}")]
    LlmFailure {
        reason: LlmFailureReason,
        message: String,
    },

    /// The validator binary could not be started.
    #[error("validator unavailable: {0}")]
    ValidatorUnavailable(String),

    /// The validator did not finish within its budget and was killed.
    #[error("validator timed out after {}s", .0.as_secs())]
    ValidatorTimeout(Duration),

    /// The validator rejected the content.
    #[error("validation failed: {}", errors.join("; "))]
    ValidationFailed {
        errors: Vec<String>,
        warnings: Vec<String>,
    },

    /// The LLM response contained no usable payload.
    #[error("no structured payload found in generation output")]
    ExtractionAmbiguous,

    /// The refine loop ran out of attempts.
    #[error("retries exhausted after {attempts} attempt(s): {}", errors.join("; "))]
    RetriesExhausted { attempts: u32, errors: Vec<String> },
}

impl Error {
    pub fn llm(reason: LlmFailureReason, message: impl Into<String>) -> Self {
        Error::LlmFailure {
            reason,
            message: message.into(),
        }
    }

    /// Whether this error came from the retrieval side (embedding or index)
    /// and may be degraded to an empty context.
    pub fn is_retrieval_fault(&self) -> bool {
        matches!(
            self,
            Error::StoreNotInitialized | Error::EmbeddingFailure(_) | Error::StoreFailure(_)
        )
    }
}

/// Convenience result type for pipeline operations.
pub type Result<T> = std::result::Result<T, Error>;

/// A bulk insert that stopped part-way.
///
/// `committed` counts the chunks already written before `source` occurred.
#[derive(Debug, Clone, Error)]
#[error("{source} ({committed} chunk(s) committed before the failure)")]
pub struct AddError {
    pub committed: usize,
    #[source]
    pub source: Error,
}

impl AddError {
    pub fn new(committed: usize, source: Error) -> Self {
        Self { committed, source }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn llm_failure_message_carries_reason_tag() {
        let err = Error::llm(LlmFailureReason::RateLimit, "429 Too Many Requests");
        assert_eq!(
            err.to_string(),
            "LLM failure (rate_limit): 429 Too Many Requests"
        );
    }

    #[test]
    fn retrieval_faults_are_classified() {
        assert!(Error::StoreFailure("disk".into()).is_retrieval_fault());
        assert!(Error::EmbeddingFailure("dims".into()).is_retrieval_fault());
        assert!(!Error::ExtractionAmbiguous.is_retrieval_fault());
    }

    #[test]
    fn rejected_content_converts_to_validation_failed() {
        use crate::models::ValidationResult;

        assert!(ValidationResult::valid().ensure_valid().is_ok());

        let mut rejected = ValidationResult::invalid("error: missing info");
        rejected.warnings.push("warn: deprecated".into());
        match rejected.ensure_valid() {
            Err(Error::ValidationFailed { errors, warnings }) => {
                assert_eq!(errors, vec!["error: missing info"]);
                assert_eq!(warnings, vec!["warn: deprecated"]);
            }
            other => panic!("expected ValidationFailed, got {:?}", other),
        }
        assert_eq!(
            rejected.ensure_valid().unwrap_err().to_string(),
            "validation failed: error: missing info"
        );
    }

    #[test]
    fn add_error_reports_committed_count() {
        let err = AddError::new(5000, Error::StoreFailure("locked".into()));
        assert!(err.to_string().contains("5000 chunk(s) committed"));
    }
}
