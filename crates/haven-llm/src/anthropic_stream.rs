use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::stream::{parse_sse_line, SseParsed, StreamEvent};

/// Parse the Anthropic streaming SSE response and emit StreamEvents.
/// Reads the reqwest byte stream, reassembles SSE lines, emits events.
pub async fn process_stream(resp: reqwest::Response, tx: mpsc::Sender<StreamEvent>) {
    use futures_util::StreamExt;

    let mut current_event = String::new();
    let mut tokens_in: u32 = 0;
    let mut tokens_out: u32 = 0;
    let mut stop_reason = String::new();
    let mut line_buf = String::new();

    let mut byte_stream = resp.bytes_stream();

    while let Some(chunk) = byte_stream.next().await {
        let chunk = match chunk {
            Ok(c) => c,
            Err(e) => {
                let _ = tx
                    .send(StreamEvent::Error {
                        code: "PROVIDER_UNREACHABLE",
                        message: e.to_string(),
                        retryable: true,
                    })
                    .await;
                return;
            }
        };

        let text = match std::str::from_utf8(&chunk) {
            Ok(t) => t,
            Err(_) => continue,
        };

        // Multiple SSE lines per chunk; keep the incomplete last line buffered.
        line_buf.push_str(text);
        let lines: Vec<&str> = line_buf.split('\n').collect();
        let (complete, remainder) = lines.split_at(lines.len() - 1);
        let remainder = remainder.first().unwrap_or(&"").to_string();

        for line in complete {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            if let Some(parsed) = parse_sse_line(line) {
                match parsed {
                    SseParsed::Event(ev) => current_event = ev,
                    SseParsed::Data(data) => {
                        if let Some(event) = parse_data_block(
                            &current_event,
                            &data,
                            &mut tokens_in,
                            &mut tokens_out,
                            &mut stop_reason,
                        ) {
                            if tx.send(event).await.is_err() {
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
            finish_reason: if stop_reason.is_empty() {
                "stop".to_string()
            } else {
                stop_reason
            },
        })
        .await;
}

/// Map a single SSE data block to a StreamEvent based on the current event
/// type. Usage fields accumulate across message_start / message_delta.
fn parse_data_block(
    event_type: &str,
    data: &str,
    tokens_in: &mut u32,
    tokens_out: &mut u32,
    stop_reason: &mut String,
) -> Option<StreamEvent> {
    match event_type {
        "message_start" => {
            if let Ok(msg) = serde_json::from_str::<MessageStart>(data) {
                *tokens_in = msg.message.usage.input_tokens;
            }
            None
        }

        "content_block_delta" => {
            if let Ok(delta) = serde_json::from_str::<ContentBlockDelta>(data) {
                match delta.delta.delta_type.as_str() {
                    "text_delta" => {
                        if let Some(text) = delta.delta.text {
                            debug!(len = text.len(), "stream text delta");
                            return Some(StreamEvent::TokenDelta { text });
                        }
                    }
                    "thinking_delta" => {
                        if let Some(text) = delta.delta.thinking {
                            debug!(len = text.len(), "stream thinking delta");
                            return Some(StreamEvent::ReasoningDelta { text });
                        }
                    }
                    other => {
                        debug!(delta_type = other, "unhandled delta type");
                    }
                }
            }
            None
        }

        "message_delta" => {
            if let Ok(delta) = serde_json::from_str::<MessageDelta>(data) {
                *tokens_out = delta.usage.output_tokens;
                if let Some(reason) = delta.delta.stop_reason {
                    *stop_reason = reason;
                }
            }
            None
        }

        "error" => {
            warn!(data, "anthropic stream error");
            Some(StreamEvent::Error {
                code: "PROVIDER_REJECTED",
                message: data.to_string(),
                retryable: false,
            })
        }

        // message_stop, content_block_start/stop, ping — no action needed
        _ => None,
    }
}

// Anthropic SSE data types (private — deserialization only)

#[derive(Deserialize)]
struct MessageStart {
    message: MessageStartInner,
}

#[derive(Deserialize)]
struct MessageStartInner {
    usage: InputUsage,
}

#[derive(Deserialize)]
struct InputUsage {
    input_tokens: u32,
}

#[derive(Deserialize)]
struct ContentBlockDelta {
    delta: DeltaContent,
}

#[derive(Deserialize)]
struct DeltaContent {
    #[serde(rename = "type")]
    delta_type: String,
    text: Option<String>,
    thinking: Option<String>,
}

#[derive(Deserialize)]
struct MessageDelta {
    delta: MessageDeltaInner,
    usage: OutputUsage,
}

#[derive(Deserialize)]
struct MessageDeltaInner {
    stop_reason: Option<String>,
}

#[derive(Deserialize)]
struct OutputUsage {
    output_tokens: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_delta_becomes_token_delta() {
        let mut ti = 0;
        let mut to = 0;
        let mut sr = String::new();
        let event = parse_data_block(
            "content_block_delta",
            r#"{"delta":{"type":"text_delta","text":"Hello"}}"#,
            &mut ti,
            &mut to,
            &mut sr,
        );
        match event {
            Some(StreamEvent::TokenDelta { text }) => assert_eq!(text, "Hello"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn thinking_delta_becomes_reasoning_delta() {
        let mut ti = 0;
        let mut to = 0;
        let mut sr = String::new();
        let event = parse_data_block(
            "content_block_delta",
            r#"{"delta":{"type":"thinking_delta","thinking":"hmm"}}"#,
            &mut ti,
            &mut to,
            &mut sr,
        );
        assert!(matches!(event, Some(StreamEvent::ReasoningDelta { .. })));
    }

    #[test]
    fn usage_accumulates_across_events() {
        let mut ti = 0;
        let mut to = 0;
        let mut sr = String::new();
        parse_data_block(
            "message_start",
            r#"{"message":{"usage":{"input_tokens":12}}}"#,
            &mut ti,
            &mut to,
            &mut sr,
        );
        parse_data_block(
            "message_delta",
            r#"{"delta":{"stop_reason":"end_turn"},"usage":{"output_tokens":34}}"#,
            &mut ti,
            &mut to,
            &mut sr,
        );
        assert_eq!(ti, 12);
        assert_eq!(to, 34);
        assert_eq!(sr, "end_turn");
    }
}
