use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use haven_core::config::ProviderConfig;
use haven_core::types::MessageRole;

use crate::provider::{
    classify_api_error, ChatMessage, ChatOutcome, ChatParams, ModelCapabilities, ModelDescriptor,
    ModelStatus, ProviderAdapter, ProviderError, ProviderHealth, Usage, CHAT_TIMEOUT_SECS,
    STREAM_TIMEOUT_SECS,
};
use crate::stream::StreamEvent;
use crate::tokenizer::Tokenizer;

const API_VERSION: &str = "2023-06-01";
const DEFAULT_CONTEXT_WINDOW: u32 = 200_000;

pub struct AnthropicProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    allowed: Vec<String>,
    context_windows: BTreeMap<String, u32>,
    tokenizer: Arc<Tokenizer>,
}

impl AnthropicProvider {
    pub fn new(config: &ProviderConfig, tokenizer: Arc<Tokenizer>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: config.api_key.clone().unwrap_or_default(),
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| "https://api.anthropic.com".to_string()),
            allowed: config.models.clone(),
            context_windows: config.context_windows.clone(),
            tokenizer,
        }
    }

    fn model_allowed(&self, name: &str) -> bool {
        self.allowed.is_empty() || self.allowed.iter().any(|m| m == name)
    }

    fn retry_after_ms(resp: &reqwest::Response) -> Option<u64> {
        resp.headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .map(|s| s * 1000)
    }
}

#[async_trait]
impl ProviderAdapter for AnthropicProvider {
    fn id(&self) -> &str {
        "anthropic"
    }

    async fn list_models(&self) -> Result<Vec<ModelDescriptor>, ProviderError> {
        let url = format!("{}/v1/models", self.base_url);
        let resp = self
            .client
            .get(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .timeout(Duration::from_secs(10))
            .send()
            .await?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(classify_api_error(status, &text, None));
        }

        let list: ModelList = resp
            .json()
            .await
            .map_err(|e| ProviderError::Parse(e.to_string()))?;

        Ok(list
            .data
            .into_iter()
            .filter(|m| self.model_allowed(&m.id))
            .map(|m| ModelDescriptor {
                context_window: self.context_limit(&m.id),
                name: m.id,
                provider: "anthropic".to_string(),
                capabilities: ModelCapabilities {
                    streaming: true,
                    tools: true,
                    reasoning: true,
                },
                status: ModelStatus::Available,
            })
            .collect())
    }

    fn count_tokens(&self, model: &str, text: &str) -> u32 {
        self.tokenizer.count(model, text)
    }

    fn context_limit(&self, model: &str) -> u32 {
        self.context_windows
            .get(model)
            .copied()
            .unwrap_or(DEFAULT_CONTEXT_WINDOW)
    }

    async fn chat_once(
        &self,
        model: &str,
        messages: &[ChatMessage],
        params: &ChatParams,
    ) -> Result<ChatOutcome, ProviderError> {
        let body = build_request_body(model, messages, params, false);
        let url = format!("{}/v1/messages", self.base_url);

        debug!(model, "sending request to Anthropic");

        let resp = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .header("content-type", "application/json")
            .timeout(Duration::from_secs(CHAT_TIMEOUT_SECS))
            .json(&body)
            .send()
            .await?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let retry = Self::retry_after_ms(&resp);
            let text = resp.text().await.unwrap_or_default();
            warn!(status, body = %text, "Anthropic API error");
            return Err(classify_api_error(status, &text, retry));
        }

        let api_resp: ApiResponse = resp
            .json()
            .await
            .map_err(|e| ProviderError::Parse(e.to_string()))?;

        Ok(parse_response(api_resp))
    }

    async fn chat_stream(
        &self,
        model: &str,
        messages: &[ChatMessage],
        params: &ChatParams,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), ProviderError> {
        let mut body = build_request_body(model, messages, params, true);
        body["stream"] = serde_json::json!(true);
        let url = format!("{}/v1/messages", self.base_url);

        debug!(model, "sending streaming request to Anthropic");

        let resp = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .header("content-type", "application/json")
            .timeout(Duration::from_secs(STREAM_TIMEOUT_SECS))
            .json(&body)
            .send()
            .await?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let retry = Self::retry_after_ms(&resp);
            let text = resp.text().await.unwrap_or_default();
            warn!(status, body = %text, "Anthropic streaming API error");
            return Err(classify_api_error(status, &text, retry));
        }

        crate::anthropic_stream::process_stream(resp, tx).await;
        Ok(())
    }

    async fn health(&self) -> ProviderHealth {
        let url = format!("{}/v1/models", self.base_url);
        match self
            .client
            .get(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .timeout(Duration::from_secs(5))
            .send()
            .await
        {
            Ok(resp) if resp.status().is_success() => ProviderHealth {
                ok: true,
                detail: "reachable".to_string(),
            },
            Ok(resp) => ProviderHealth {
                ok: false,
                detail: format!("status {}", resp.status().as_u16()),
            },
            Err(e) => ProviderHealth {
                ok: false,
                detail: e.to_string(),
            },
        }
    }
}

fn build_request_body(
    model: &str,
    messages: &[ChatMessage],
    params: &ChatParams,
    stream: bool,
) -> serde_json::Value {
    // The messages API takes the system prompt as a top-level field, not a
    // message role.
    let system: String = messages
        .iter()
        .filter(|m| m.role == MessageRole::System)
        .map(|m| m.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n");

    let turns: Vec<serde_json::Value> = messages
        .iter()
        .filter(|m| m.role != MessageRole::System)
        .map(|m| {
            serde_json::json!({
                "role": m.role,
                "content": m.content,
            })
        })
        .collect();

    let mut body = serde_json::json!({
        "model": model,
        "max_tokens": params.max_tokens,
        "messages": turns,
        "stream": stream,
    });
    if !system.is_empty() {
        body["system"] = serde_json::json!(system);
    }
    if let Some(t) = params.temperature {
        body["temperature"] = serde_json::json!(t);
    }
    if !params.stop.is_empty() {
        body["stop_sequences"] = serde_json::json!(params.stop);
    }
    body
}

fn parse_response(resp: ApiResponse) -> ChatOutcome {
    let mut text_parts: Vec<String> = Vec::new();
    let mut reasoning_parts: Vec<String> = Vec::new();

    for block in resp.content {
        match block {
            ContentBlock::Text { text } => text_parts.push(text),
            ContentBlock::Thinking { thinking } => reasoning_parts.push(thinking),
            ContentBlock::Unknown => {}
        }
    }

    ChatOutcome {
        content: text_parts.join(""),
        reasoning: if reasoning_parts.is_empty() {
            None
        } else {
            Some(reasoning_parts.join(""))
        },
        model: resp.model,
        usage: Usage::new(resp.usage.input_tokens, resp.usage.output_tokens),
        finish_reason: resp.stop_reason.unwrap_or_default(),
    }
}

// Anthropic API response types (private — deserialization only)

#[derive(Deserialize)]
struct ModelList {
    data: Vec<ModelEntry>,
}

#[derive(Deserialize)]
struct ModelEntry {
    id: String,
}

#[derive(Deserialize)]
struct ApiResponse {
    model: String,
    content: Vec<ContentBlock>,
    stop_reason: Option<String>,
    usage: ApiUsage,
}

#[derive(Deserialize)]
#[serde(tag = "type")]
enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "thinking")]
    Thinking { thinking: String },
    #[serde(other)]
    Unknown,
}

#[derive(Deserialize)]
struct ApiUsage {
    input_tokens: u32,
    output_tokens: u32,
}
