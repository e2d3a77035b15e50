//! Text-generation providers.
//!
//! The [`LlmProvider`] trait is the only thing the orchestrator knows about
//! language models: `generate(system, user) -> text`. Implementations:
//!
//! | Config Value | Provider | Endpoint |
//! |--------------|----------|----------|
//! | `"disabled"` | [`DisabledLlm`] | none |
//! | `"openai"` | [`OpenAiChat`] | `POST /v1/chat/completions` |
//! | `"gemini"` | [`GeminiChat`] | `POST /v1beta/models/{model}:generateContent` |
//!
//! Failures carry an [`LlmFailureReason`] derived from the HTTP status:
//! 401/403 → `auth`, 429 → `rate_limit`, client timeouts → `timeout`,
//! everything else → `provider`. Providers do not retry; the refine loop
//! decides what to do next.

use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::{json, Value};

use crate::config::LlmConfig;
use crate::error::{Error, LlmFailureReason, Result};

/// Produces text from a system prompt and a user prompt.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Model identifier reported in generation metadata.
    fn model_name(&self) -> &str;

    async fn generate(&self, system_prompt: &str, user_prompt: &str) -> Result<String>;
}

/// Used when `llm.provider = "disabled"`; every call fails.
pub struct DisabledLlm;

#[async_trait]
impl LlmProvider for DisabledLlm {
    fn model_name(&self) -> &str {
        "disabled"
    }

    async fn generate(&self, _system_prompt: &str, _user_prompt: &str) -> Result<String> {
        Err(Error::llm(
            LlmFailureReason::Provider,
            "llm provider is disabled; set [llm] provider in config",
        ))
    }
}

fn http_client(config: &LlmConfig) -> anyhow::Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs))
        .build()?)
}

fn status_reason(status: StatusCode) -> LlmFailureReason {
    match status.as_u16() {
        401 | 403 => LlmFailureReason::Auth,
        429 => LlmFailureReason::RateLimit,
        408 | 504 => LlmFailureReason::Timeout,
        _ => LlmFailureReason::Provider,
    }
}

fn transport_error(provider: &str, err: reqwest::Error) -> Error {
    let reason = if err.is_timeout() {
        LlmFailureReason::Timeout
    } else {
        LlmFailureReason::Provider
    };
    Error::llm(reason, format!("{} request failed: {}", provider, err))
}

async fn post_json(
    provider: &str,
    request: reqwest::RequestBuilder,
    body: &Value,
) -> Result<Value> {
    let response = request
        .json(body)
        .send()
        .await
        .map_err(|e| transport_error(provider, e))?;

    let status = response.status();
    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        return Err(Error::llm(
            status_reason(status),
            format!("{} API error {}: {}", provider, status, text),
        ));
    }

    response
        .json()
        .await
        .map_err(|e| transport_error(provider, e))
}

// ============ OpenAI ============

/// Chat-completions client. Reads `OPENAI_API_KEY`.
pub struct OpenAiChat {
    model: String,
    api_key: String,
    url: String,
    temperature: f32,
    max_tokens: u32,
    client: reqwest::Client,
}

impl OpenAiChat {
    pub fn new(config: &LlmConfig) -> anyhow::Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow!("OPENAI_API_KEY environment variable not set"))?;
        Ok(Self {
            model: config.model.clone().unwrap_or_else(|| "gpt-4".to_string()),
            api_key,
            url: config
                .url
                .clone()
                .unwrap_or_else(|| "https://api.openai.com".to_string()),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            client: http_client(config)?,
        })
    }
}

#[async_trait]
impl LlmProvider for OpenAiChat {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, system_prompt: &str, user_prompt: &str) -> Result<String> {
        let body = json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": system_prompt },
                { "role": "user", "content": user_prompt },
            ],
            "temperature": self.temperature,
            "max_tokens": self.max_tokens,
        });
        let request = self
            .client
            .post(format!("{}/v1/chat/completions", self.url))
            .bearer_auth(&self.api_key);

        let json = post_json("OpenAI", request, &body).await?;
        parse_openai_chat(&json)
    }
}

/// Text of `choices[0].message.content`.
fn parse_openai_chat(json: &Value) -> Result<String> {
    json.pointer("/choices/0/message/content")
        .and_then(Value::as_str)
        .map(|s| s.trim().to_string())
        .ok_or_else(|| {
            Error::llm(
                LlmFailureReason::Provider,
                "invalid OpenAI response: missing choices[0].message.content",
            )
        })
}

// ============ Gemini ============

/// `generateContent` client. Reads `GEMINI_API_KEY`.
pub struct GeminiChat {
    model: String,
    api_key: String,
    url: String,
    temperature: f32,
    max_tokens: u32,
    client: reqwest::Client,
}

impl GeminiChat {
    pub fn new(config: &LlmConfig) -> anyhow::Result<Self> {
        let api_key = std::env::var("GEMINI_API_KEY")
            .map_err(|_| anyhow!("GEMINI_API_KEY environment variable not set"))?;
        Ok(Self {
            model: config
                .model
                .clone()
                .unwrap_or_else(|| "gemini-2.0-flash".to_string()),
            api_key,
            url: config
                .url
                .clone()
                .unwrap_or_else(|| "https://generativelanguage.googleapis.com".to_string()),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            client: http_client(config)?,
        })
    }
}

#[async_trait]
impl LlmProvider for GeminiChat {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, system_prompt: &str, user_prompt: &str) -> Result<String> {
        let body = json!({
            "systemInstruction": { "parts": [{ "text": system_prompt }] },
            "contents": [{ "role": "user", "parts": [{ "text": user_prompt }] }],
            "generationConfig": {
                "temperature": self.temperature,
                "maxOutputTokens": self.max_tokens,
            },
        });
        let request = self
            .client
            .post(format!(
                "{}/v1beta/models/{}:generateContent",
                self.url, self.model
            ))
            .header("x-goog-api-key", &self.api_key);

        let json = post_json("Gemini", request, &body).await?;
        parse_gemini(&json)
    }
}

/// Concatenated `text` parts of the first candidate.
fn parse_gemini(json: &Value) -> Result<String> {
    let parts = json
        .pointer("/candidates/0/content/parts")
        .and_then(Value::as_array)
        .ok_or_else(|| {
            Error::llm(
                LlmFailureReason::Provider,
                "invalid Gemini response: missing candidates[0].content.parts",
            )
        })?;

    let text: String = parts
        .iter()
        .filter_map(|p| p.get("text").and_then(Value::as_str))
        .collect();
    Ok(text.trim().to_string())
}

/// Instantiate the provider named in `[llm] provider`.
pub fn create_llm(config: &LlmConfig) -> anyhow::Result<Arc<dyn LlmProvider>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledLlm)),
        "openai" => Ok(Arc::new(OpenAiChat::new(config)?)),
        "gemini" => Ok(Arc::new(GeminiChat::new(config)?)),
        other => anyhow::bail!("Unknown llm provider: {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_map_to_reasons() {
        assert_eq!(status_reason(StatusCode::UNAUTHORIZED), LlmFailureReason::Auth);
        assert_eq!(status_reason(StatusCode::FORBIDDEN), LlmFailureReason::Auth);
        assert_eq!(
            status_reason(StatusCode::TOO_MANY_REQUESTS),
            LlmFailureReason::RateLimit
        );
        assert_eq!(
            status_reason(StatusCode::GATEWAY_TIMEOUT),
            LlmFailureReason::Timeout
        );
        assert_eq!(
            status_reason(StatusCode::INTERNAL_SERVER_ERROR),
            LlmFailureReason::Provider
        );
    }

    #[test]
    fn parses_openai_chat_response() {
        let json = json!({
            "choices": [{ "index": 0, "message": { "role": "assistant", "content": "  id: x\n" } }]
        });
        assert_eq!(parse_openai_chat(&json).unwrap(), "id: x");
        assert!(parse_openai_chat(&json!({ "choices": [] })).is_err());
    }

    #[test]
    fn parses_gemini_response() {
        let json = json!({
            "candidates": [{ "content": { "parts": [{ "text": "id: " }, { "text": "y" }] } }]
        });
        assert_eq!(parse_gemini(&json).unwrap(), "id: y");
        assert!(parse_gemini(&json!({})).is_err());
    }

    #[tokio::test]
    async fn disabled_provider_fails() {
        let llm = create_llm(&LlmConfig::default()).unwrap();
        assert_eq!(llm.model_name(), "disabled");
        let err = llm.generate("s", "u").await.unwrap_err();
        assert!(matches!(
            err,
            Error::LlmFailure {
                reason: LlmFailureReason::Provider,
                ..
            }
        ));
    }
}
