use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::credentials::{ApiKey, ModelSpec};

/// Core trait for LLM providers.
///
/// The credential and model are chosen per call: the rotation controller
/// owns that choice, the provider only carries the transport.
#[async_trait::async_trait]
pub trait LlmProvider: Send + Sync {
    /// Generate completion for a given prompt
    async fn generate(
        &self,
        key: &ApiKey,
        model: &ModelSpec,
        request: LlmRequest,
    ) -> Result<LlmResponse, LlmError>;
}

/// Request structure for LLM generation
#[derive(Debug, Clone)]
pub struct LlmRequest {
    pub prompt: String,
    pub max_tokens: Option<usize>,
    pub temperature: Option<f32>,
    pub timeout_seconds: Option<u64>,
}

impl LlmRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            max_tokens: None,
            temperature: None,
            timeout_seconds: None,
        }
    }
}

/// Response from LLM generation
#[derive(Debug, Clone)]
pub struct LlmResponse {
    pub content: String,
    pub usage: UsageMetadata,
    pub model: String,
}

/// Token usage metadata
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsageMetadata {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub total_tokens: usize,
}

/// Failure of a single provider call.
#[derive(Debug, Error)]
pub enum LlmError {
    /// 429 / quota exhausted for the current (key, model)
    #[error("rate limited ({status}): {message}")]
    RateLimited { status: u16, message: String },

    /// The model id is unknown to the provider
    #[error("model not found: {0}")]
    ModelNotFound(String),

    #[error("authentication failed ({status}): {message}")]
    Auth { status: u16, message: String },

    /// Network failure, timeout or 5xx
    #[error("transport error: {0}")]
    Transport(String),

    /// The provider answered but the body could not be used
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("LLM API error {status}: {message}")]
    Api { status: u16, message: String },
}

impl LlmError {
    /// Classify a non-success HTTP answer.
    pub fn from_status(status: u16, body: &str) -> Self {
        let message = body.chars().take(300).collect::<String>();
        let lower = body.to_lowercase();
        match status {
            429 => LlmError::RateLimited { status, message },
            _ if lower.contains("quota") || lower.contains("resource_exhausted") => {
                LlmError::RateLimited { status, message }
            }
            404 => LlmError::ModelNotFound(message),
            401 | 403 => LlmError::Auth { status, message },
            s if s >= 500 => LlmError::Transport(format!("server error {}: {}", s, message)),
            _ => LlmError::Api { status, message },
        }
    }

    /// Errors that move the rotation forward immediately, without local retries.
    pub fn advances_rotation(&self) -> bool {
        matches!(self, LlmError::RateLimited { .. } | LlmError::ModelNotFound(_))
    }

    pub fn is_rate_limit(&self) -> bool {
        matches!(self, LlmError::RateLimited { .. })
    }
}

pub mod remote;

/// Helper to extract JSON from text that might contain markdown backticks or preamble
pub fn extract_json_from_text(text: &str) -> Option<String> {
    // 1. Try to find content between ```json and ```
    if let Some(start) = text.find("```json") {
        let rest = &text[start + 7..];
        if let Some(end) = rest.find("```") {
            return Some(rest[..end].trim().to_string());
        }
    }

    // 2. Try to find content between ``` and ```
    if let Some(start) = text.find("```") {
        let rest = &text[start + 3..];
        if let Some(end) = rest.find("```") {
            return Some(rest[..end].trim().to_string());
        }
    }

    // 3. Try to find the first '{' and last '}'
    if let (Some(start), Some(end)) = (text.find('{'), text.rfind('}')) {
        if start < end {
            return Some(text[start..=end].to_string());
        }
    }

    None
}
