use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use haven_core::config::ProviderConfig;

use crate::provider::{
    classify_api_error, ChatMessage, ChatOutcome, ChatParams, ModelCapabilities, ModelDescriptor,
    ModelStatus, ProviderAdapter, ProviderError, ProviderHealth, Usage, CHAT_TIMEOUT_SECS,
    STREAM_TIMEOUT_SECS,
};
use crate::stream::{parse_sse_line, SseParsed, StreamEvent};
use crate::tokenizer::Tokenizer;

const DEFAULT_CONTEXT_WINDOW: u32 = 128_000;

pub struct OpenAiProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    allowed: Vec<String>,
    context_windows: BTreeMap<String, u32>,
    tokenizer: Arc<Tokenizer>,
}

impl OpenAiProvider {
    pub fn new(config: &ProviderConfig, tokenizer: Arc<Tokenizer>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: config.api_key.clone().unwrap_or_default(),
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| "https://api.openai.com".to_string()),
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
impl ProviderAdapter for OpenAiProvider {
    fn id(&self) -> &str {
        "openai"
    }

    async fn list_models(&self) -> Result<Vec<ModelDescriptor>, ProviderError> {
        let url = format!("{}/v1/models", self.base_url);
        let resp = self
            .client
            .get(&url)
            .bearer_auth(&self.api_key)
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
                provider: "openai".to_string(),
                capabilities: ModelCapabilities {
                    streaming: true,
                    tools: true,
                    reasoning: false,
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
        let url = format!("{}/v1/chat/completions", self.base_url);

        debug!(model, "sending request to OpenAI");

        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .header("content-type", "application/json")
            .timeout(Duration::from_secs(CHAT_TIMEOUT_SECS))
            .json(&body)
            .send()
            .await?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let retry = Self::retry_after_ms(&resp);
            let text = resp.text().await.unwrap_or_default();
            warn!(status, body = %text, "OpenAI API error");
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
        let body = build_request_body(model, messages, params, true);
        let url = format!("{}/v1/chat/completions", self.base_url);

        debug!(model, "sending streaming request to OpenAI");

        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .header("content-type", "application/json")
            .timeout(Duration::from_secs(STREAM_TIMEOUT_SECS))
            .json(&body)
            .send()
            .await?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let retry = Self::retry_after_ms(&resp);
            let text = resp.text().await.unwrap_or_default();
            warn!(status, body = %text, "OpenAI streaming API error");
            return Err(classify_api_error(status, &text, retry));
        }

        process_stream(resp, tx).await;
        Ok(())
    }

    async fn health(&self) -> ProviderHealth {
        let url = format!("{}/v1/models", self.base_url);
        match self
            .client
            .get(&url)
            .bearer_auth(&self.api_key)
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
    let messages: Vec<serde_json::Value> = messages
        .iter()
        .map(|m| {
            serde_json::json!({
                "role": m.role,
                "content": m.content,
            })
        })
        .collect();

    let mut body = serde_json::json!({
        "model": model,
        "messages": messages,
        "max_tokens": params.max_tokens,
        "stream": stream,
    });
    if let Some(t) = params.temperature {
        body["temperature"] = serde_json::json!(t);
    }
    if !params.stop.is_empty() {
        body["stop"] = serde_json::json!(params.stop);
    }
    body
}

fn parse_response(resp: ApiResponse) -> ChatOutcome {
    let choice = resp.choices.into_iter().next();
    let content = choice
        .as_ref()
        .and_then(|c| c.message.content.as_deref())
        .unwrap_or("")
        .to_string();
    let finish_reason = choice.and_then(|c| c.finish_reason).unwrap_or_default();

    let usage = resp
        .usage
        .map(|u| Usage::new(u.prompt_tokens, u.completion_tokens))
        .unwrap_or_default();

    ChatOutcome {
        content,
        reasoning: None,
        model: resp.model,
        usage,
        finish_reason,
    }
}

/// Parse the OpenAI streaming SSE response. Each data line carries a JSON
/// delta object; a literal `data: [DONE]` ends the stream.
async fn process_stream(resp: reqwest::Response, tx: mpsc::Sender<StreamEvent>) {
    use futures_util::StreamExt;

    let mut tokens_in: u32 = 0;
    let mut tokens_out: u32 = 0;
    let mut finish_reason = String::new();
    let mut line_buf = String::new();

    let mut byte_stream = resp.bytes_stream();

    'outer: while let Some(chunk) = byte_stream.next().await {
        let chunk = match chunk {
            Ok(c) => c,
            Err(e) => {
                let err: ProviderError = e.into();
                let _ = tx
                    .send(StreamEvent::Error {
                        code: err.code(),
                        message: err.to_string(),
                        retryable: err.retryable(),
                    })
                    .await;
                return;
            }
        };

        let text = match std::str::from_utf8(&chunk) {
            Ok(t) => t,
            Err(_) => continue,
        };

        line_buf.push_str(text);
        let lines: Vec<&str> = line_buf.split('\n').collect();
        let (complete, remainder) = lines.split_at(lines.len() - 1);
        let remainder = remainder.first().unwrap_or(&"").to_string();

        for line in complete {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            if let Some(SseParsed::Data(data)) = parse_sse_line(line) {
                if data.trim() == "[DONE]" {
                    break 'outer;
                }

                if let Ok(chunk_resp) = serde_json::from_str::<StreamChunk>(&data) {
                    if let Some(usage) = &chunk_resp.usage {
                        tokens_in = usage.prompt_tokens;
                        tokens_out = usage.completion_tokens;
                    }

                    for choice in &chunk_resp.choices {
                        if let Some(reason) = &choice.finish_reason {
                            if !reason.is_empty() {
                                finish_reason = reason.clone();
                            }
                        }
                        if let Some(content) = &choice.delta.content {
                            if !content.is_empty()
                                && tx
                                    .send(StreamEvent::TokenDelta {
                                        text: content.clone(),
                                    })
                                    .await
                                    .is_err()
                            {
                                return; // receiver dropped
                            }
                        }
                    }
                }
            }
        }

        line_buf = remainder;
    }

    if tokens_in > 0 || tokens_out > 0 {
        let _ = tx
            .send(StreamEvent::Usage {
                input: tokens_in,
                output: tokens_out,
                total: tokens_in + tokens_out,
            })
            .await;
    }
    let _ = tx
        .send(StreamEvent::Done {
            finish_reason: if finish_reason.is_empty() {
                "stop".to_string()
            } else {
                finish_reason
            },
        })
        .await;
}

// OpenAI API response types (private — deserialization only)

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
    choices: Vec<Choice>,
    usage: Option<ApiUsage>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct ApiUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

// OpenAI streaming chunk types

#[derive(Deserialize)]
struct StreamChunk {
    choices: Vec<StreamChoice>,
    usage: Option<ApiUsage>,
}

#[derive(Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct StreamDelta {
    content: Option<String>,
}
