use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use haven_core::error::GatewayError;
use haven_core::types::MessageRole;

use crate::stream::StreamEvent;

/// Wall-clock cap on non-streaming provider calls.
pub const CHAT_TIMEOUT_SECS: u64 = 180;
/// Wall-clock cap on a streaming provider connection.
pub const STREAM_TIMEOUT_SECS: u64 = 600;

/// Provider-independent description of a callable model.
#[derive(Debug, Clone, Serialize)]
pub struct ModelDescriptor {
    pub name: String,
    pub provider: String,
    pub context_window: u32,
    pub capabilities: ModelCapabilities,
    pub status: ModelStatus,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct ModelCapabilities {
    pub streaming: bool,
    pub tools: bool,
    pub reasoning: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelStatus {
    Available,
    Unavailable,
    ResourceExhausted,
}

/// One entry of the ordered history fed to a model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Sampling parameters forwarded to the provider.
#[derive(Debug, Clone)]
pub struct ChatParams {
    pub temperature: Option<f32>,
    pub max_tokens: u32,
    pub stop: Vec<String>,
}

impl Default for ChatParams {
    fn default() -> Self {
        Self {
            temperature: None,
            max_tokens: 1024,
            stop: Vec::new(),
        }
    }
}

/// Provider-attested token counts.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct Usage {
    pub input: u32,
    pub output: u32,
    pub total: u32,
}

impl Usage {
    pub fn new(input: u32, output: u32) -> Self {
        Self {
            input,
            output,
            total: input + output,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }
}

/// Result of a non-streaming chat call.
#[derive(Debug, Clone)]
pub struct ChatOutcome {
    pub content: String,
    pub reasoning: Option<String>,
    pub model: String,
    pub usage: Usage,
    pub finish_reason: String,
}

/// Backend probe result.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderHealth {
    pub ok: bool,
    pub detail: String,
}

/// Common interface over every LLM backend (local host, Anthropic, OpenAI).
///
/// Adapters map wire errors into [`ProviderError`] and never retry
/// internally; retry policy belongs to the caller.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Provider id used in config, routing, and logs.
    fn id(&self) -> &str;

    /// Models this provider currently offers.
    async fn list_models(&self) -> Result<Vec<ModelDescriptor>, ProviderError>;

    /// Token count for `text` under this provider's tokenizer family.
    /// Provider-attested counts win over this estimate when both exist.
    fn count_tokens(&self, model: &str, text: &str) -> u32;

    /// Context window in tokens for `model`.
    fn context_limit(&self, model: &str) -> u32;

    /// Send a full chat request and wait for the complete response.
    async fn chat_once(
        &self,
        model: &str,
        messages: &[ChatMessage],
        params: &ChatParams,
    ) -> Result<ChatOutcome, ProviderError>;

    /// Stream response events through a channel. Events end with `Done` or
    /// `Error`; the adapter stops sending once the receiver is dropped.
    async fn chat_stream(
        &self,
        model: &str,
        messages: &[ChatMessage],
        params: &ChatParams,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), ProviderError>;

    /// Cheap liveness probe against the provider endpoint.
    async fn health(&self) -> ProviderHealth;
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("provider unreachable: {0}")]
    Unreachable(String),

    #[error("provider timed out after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("provider rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("provider rate limited")]
    RateLimited { retry_after_ms: Option<u64> },

    #[error("provider capacity exhausted: {0}")]
    CapacityExhausted(String),

    #[error("provider reported context overflow: {0}")]
    ContextOverflow(String),

    #[error("parse error: {0}")]
    Parse(String),
}

impl ProviderError {
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            ProviderError::Unreachable(_)
                | ProviderError::Timeout { .. }
                | ProviderError::RateLimited { .. }
                | ProviderError::CapacityExhausted(_)
        )
    }

    /// Stable machine code for SSE error frames and envelopes.
    pub fn code(&self) -> &'static str {
        match self {
            ProviderError::Unreachable(_) => "PROVIDER_UNREACHABLE",
            ProviderError::Timeout { .. } => "PROVIDER_TIMEOUT",
            ProviderError::Rejected { .. } => "PROVIDER_REJECTED",
            ProviderError::RateLimited { .. } => "RATE_LIMITED",
            ProviderError::CapacityExhausted(_) => "CAPACITY_EXHAUSTED",
            ProviderError::ContextOverflow(_) => "CONTEXT_OVERFLOW",
            ProviderError::Parse(_) => "PROVIDER_BAD_RESPONSE",
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ProviderError::Timeout {
                seconds: CHAT_TIMEOUT_SECS,
            }
        } else {
            ProviderError::Unreachable(e.to_string())
        }
    }
}

impl From<ProviderError> for GatewayError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::Unreachable(msg) => {
                GatewayError::unavailable("PROVIDER_UNREACHABLE", msg)
            }
            ProviderError::Timeout { seconds } => GatewayError::unavailable(
                "PROVIDER_TIMEOUT",
                format!("provider timed out after {}s", seconds),
            ),
            ProviderError::Rejected { status, message } => GatewayError::validation(
                "PROVIDER_REJECTED",
                format!("provider rejected request ({}): {}", status, message),
            ),
            ProviderError::RateLimited { retry_after_ms } => {
                GatewayError::rate_limited("provider rate limited", retry_after_ms)
            }
            ProviderError::CapacityExhausted(msg) => {
                GatewayError::resource("CAPACITY_EXHAUSTED", msg)
            }
            ProviderError::ContextOverflow(msg) => GatewayError::context_limit(
                serde_json::json!({ "provider_message": msg }),
                vec!["Start a new conversation".to_string()],
            ),
            ProviderError::Parse(msg) => GatewayError::internal(msg),
        }
    }
}

/// Classify a non-success provider HTTP response into a [`ProviderError`].
///
/// Capacity and context conditions are signalled by message text on most
/// backends, so the body is sniffed before falling back to the status code.
pub(crate) fn classify_api_error(
    status: u16,
    body: &str,
    retry_after_ms: Option<u64>,
) -> ProviderError {
    if status == 429 {
        return ProviderError::RateLimited { retry_after_ms };
    }
    let lowered = body.to_ascii_lowercase();
    if lowered.contains("out of memory")
        || lowered.contains("resource_exhausted")
        || lowered.contains("overloaded")
        || lowered.contains("insufficient capacity")
    {
        return ProviderError::CapacityExhausted(truncate(body));
    }
    if lowered.contains("context length")
        || lowered.contains("context window")
        || lowered.contains("maximum context")
        || lowered.contains("too many tokens")
        || lowered.contains("prompt is too long")
    {
        return ProviderError::ContextOverflow(truncate(body));
    }
    if (400..500).contains(&status) {
        return ProviderError::Rejected {
            status,
            message: truncate(body),
        };
    }
    ProviderError::Unreachable(format!("provider returned {}: {}", status, truncate(body)))
}

fn truncate(body: &str) -> String {
    const MAX: usize = 512;
    if body.len() <= MAX {
        return body.to_string();
    }
    let cut = body
        .char_indices()
        .take_while(|(i, _)| *i <= MAX)
        .last()
        .map(|(i, _)| i)
        .unwrap_or(0);
    format!("{}…", &body[..cut])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_rate_limit() {
        let err = classify_api_error(429, "slow down", Some(2000));
        assert!(matches!(
            err,
            ProviderError::RateLimited {
                retry_after_ms: Some(2000)
            }
        ));
        assert!(err.retryable());
    }

    #[test]
    fn classify_capacity_message() {
        let err = classify_api_error(500, "CUDA out of memory", None);
        assert!(matches!(err, ProviderError::CapacityExhausted(_)));
        assert_eq!(err.code(), "CAPACITY_EXHAUSTED");
        assert!(err.retryable());
    }

    #[test]
    fn classify_context_overflow_message() {
        let err = classify_api_error(
            400,
            "this model's maximum context length is 4096 tokens",
            None,
        );
        assert!(matches!(err, ProviderError::ContextOverflow(_)));
        assert!(!err.retryable());
    }

    #[test]
    fn classify_plain_4xx_is_rejected() {
        let err = classify_api_error(422, "bad temperature", None);
        assert!(matches!(err, ProviderError::Rejected { status: 422, .. }));
        assert!(!err.retryable());
        let gw: GatewayError = err.into();
        assert_eq!(gw.status(), 400);
        assert_eq!(gw.code, "PROVIDER_REJECTED");
    }

    #[test]
    fn classify_5xx_is_unavailable() {
        let err = classify_api_error(502, "bad gateway", None);
        assert!(matches!(err, ProviderError::Unreachable(_)));
        let gw: GatewayError = err.into();
        assert_eq!(gw.status(), 503);
        assert!(gw.retryable);
    }
}
