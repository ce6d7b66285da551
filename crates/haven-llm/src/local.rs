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
use crate::stream::StreamEvent;
use crate::tokenizer::Tokenizer;

const DEFAULT_CONTEXT_WINDOW: u32 = 4096;

/// Adapter for a local Ollama-style model host.
///
/// The host does not attest token counts up front, so pre-flight counting
/// goes through the shared BPE tokenizer; the final chunk's eval counts are
/// still forwarded as provider-attested usage.
pub struct LocalProvider {
    client: reqwest::Client,
    base_url: String,
    allowed: Vec<String>,
    context_windows: BTreeMap<String, u32>,
    tokenizer: Arc<Tokenizer>,
}

impl LocalProvider {
    pub fn new(config: &ProviderConfig, tokenizer: Arc<Tokenizer>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| "http://localhost:11434".to_string()),
            allowed: config.models.clone(),
            context_windows: config.context_windows.clone(),
            tokenizer,
        }
    }

    fn model_allowed(&self, name: &str) -> bool {
        self.allowed.is_empty() || self.allowed.iter().any(|m| m == name)
    }
}

#[async_trait]
impl ProviderAdapter for LocalProvider {
    fn id(&self) -> &str {
        "local"
    }

    async fn list_models(&self) -> Result<Vec<ModelDescriptor>, ProviderError> {
        let url = format!("{}/api/tags", self.base_url);
        let resp = self
            .client
            .get(&url)
            .timeout(Duration::from_secs(10))
            .send()
            .await?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(classify_api_error(status, &text, None));
        }

        let tags: TagsResponse = resp
            .json()
            .await
            .map_err(|e| ProviderError::Parse(e.to_string()))?;

        Ok(tags
            .models
            .into_iter()
            .filter(|m| self.model_allowed(&m.name))
            .map(|m| ModelDescriptor {
                context_window: self.context_limit(&m.name),
                name: m.name,
                provider: "local".to_string(),
                capabilities: ModelCapabilities {
                    streaming: true,
                    tools: false,
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
        let url = format!("{}/api/chat", self.base_url);

        debug!(model, "sending request to local host");

        let resp = self
            .client
            .post(&url)
            .header("content-type", "application/json")
            .timeout(Duration::from_secs(CHAT_TIMEOUT_SECS))
            .json(&body)
            .send()
            .await?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            warn!(status, body = %text, "local host API error");
            return Err(classify_api_error(status, &text, None));
        }

        let api_resp: ApiResponse = resp
            .json()
            .await
            .map_err(|e| ProviderError::Parse(e.to_string()))?;

        let usage = Usage::new(
            api_resp.prompt_eval_count.unwrap_or(0),
            api_resp.eval_count.unwrap_or(0),
        );
        Ok(ChatOutcome {
            content: api_resp.message.content,
            reasoning: None,
            model: api_resp.model,
            usage,
            finish_reason: api_resp
                .done_reason
                .unwrap_or_else(|| "stop".to_string()),
        })
    }

    async fn chat_stream(
        &self,
        model: &str,
        messages: &[ChatMessage],
        params: &ChatParams,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), ProviderError> {
        let body = build_request_body(model, messages, params, true);
        let url = format!("{}/api/chat", self.base_url);

        debug!(model, "sending streaming request to local host");

        let resp = self
            .client
            .post(&url)
            .header("content-type", "application/json")
            .timeout(Duration::from_secs(STREAM_TIMEOUT_SECS))
            .json(&body)
            .send()
            .await?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            warn!(status, body = %text, "local host streaming API error");
            return Err(classify_api_error(status, &text, None));
        }

        process_stream(resp, tx).await;
        Ok(())
    }

    async fn health(&self) -> ProviderHealth {
        let url = format!("{}/api/tags", self.base_url);
        match self
            .client
            .get(&url)
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

    let mut options = serde_json::json!({
        "num_predict": params.max_tokens,
    });
    if let Some(t) = params.temperature {
        options["temperature"] = serde_json::json!(t);
    }
    if !params.stop.is_empty() {
        options["stop"] = serde_json::json!(params.stop);
    }

    serde_json::json!({
        "model": model,
        "messages": messages,
        "stream": stream,
        "options": options,
    })
}

/// Parse the host's newline-delimited JSON streaming format. Each line is a
/// JSON object; the final line has `done: true` and carries eval counts.
async fn process_stream(resp: reqwest::Response, tx: mpsc::Sender<StreamEvent>) {
    use futures_util::StreamExt;

    let mut tokens_in: u32 = 0;
    let mut tokens_out: u32 = 0;
    let mut finish_reason = String::new();
    let mut line_buf = String::new();

    let mut byte_stream = resp.bytes_stream();

    while let Some(chunk) = byte_stream.next().await {
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

            match serde_json::from_str::<StreamChunk>(line) {
                Ok(chunk_data) => {
                    if chunk_data.done {
                        tokens_in = chunk_data.prompt_eval_count.unwrap_or(0);
                        tokens_out = chunk_data.eval_count.unwrap_or(0);
                        finish_reason =
                            chunk_data.done_reason.unwrap_or_else(|| "stop".to_string());
                    } else {
                        let text = chunk_data.message.content;
                        if !text.is_empty()
                            && tx.send(StreamEvent::TokenDelta { text }).await.is_err()
                        {
                            return; // receiver dropped
                        }
                    }
                }
                Err(e) => {
                    warn!(line, err = %e, "failed to parse local stream chunk");
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

// Local host API response types (private — deserialization only)

#[derive(Deserialize)]
struct TagsResponse {
    models: Vec<TagModel>,
}

#[derive(Deserialize)]
struct TagModel {
    name: String,
}

#[derive(Deserialize)]
struct ApiResponse {
    model: String,
    message: HostMessage,
    done_reason: Option<String>,
    prompt_eval_count: Option<u32>,
    eval_count: Option<u32>,
}

#[derive(Deserialize)]
struct HostMessage {
    content: String,
}

#[derive(Deserialize)]
struct StreamChunk {
    message: HostMessage,
    done: bool,
    done_reason: Option<String>,
    prompt_eval_count: Option<u32>,
    eval_count: Option<u32>,
}
