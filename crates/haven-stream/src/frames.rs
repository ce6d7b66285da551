use serde::Serialize;

use haven_core::error::GatewayError;

/// SSE frames delivered to the browser. Each serializes to the `data:`
/// payload of one `text/event-stream` frame, tagged by `type`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SseFrame {
    ConversationStart {
        conversation_id: String,
        assistant_message_placeholder_id: String,
    },
    ContentDelta {
        content: String,
    },
    ThinkingStart,
    ThinkingDelta {
        content: String,
    },
    ThinkingEnd,
    ToolCallStart {
        tool_call_id: String,
        name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        arguments_partial: Option<String>,
    },
    ToolCallEnd {
        tool_call_id: String,
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        execution_time_ms: u64,
    },
    Usage {
        input_tokens: u32,
        output_tokens: u32,
        total_tokens: u32,
    },
    MessageComplete {
        message: serde_json::Value,
    },
    /// Fatal stream error. Carries the envelope fields, with the error
    /// category under `category` since `type` tags the frame itself.
    Error {
        category: &'static str,
        code: &'static str,
        message: String,
        request_id: String,
        timestamp: String,
    },
    Done,
}

impl SseFrame {
    pub fn error(err: &GatewayError, request_id: &str) -> Self {
        SseFrame::Error {
            category: err.category.as_str(),
            code: err.code,
            message: err.message.clone(),
            request_id: request_id.to_string(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    /// The JSON payload of the frame (what goes after `data: `).
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{\"type\":\"error\"}".to_string())
    }

    /// Full wire rendering including SSE framing.
    pub fn to_wire(&self) -> String {
        format!("data: {}\n\n", self.to_json())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_tag_with_snake_case_type() {
        let frame = SseFrame::ContentDelta {
            content: "Hello".to_string(),
        };
        let json: serde_json::Value = serde_json::from_str(&frame.to_json()).unwrap();
        assert_eq!(json["type"], "content_delta");
        assert_eq!(json["content"], "Hello");
    }

    #[test]
    fn done_frame_is_bare() {
        let json: serde_json::Value = serde_json::from_str(&SseFrame::Done.to_json()).unwrap();
        assert_eq!(json, serde_json::json!({ "type": "done" }));
    }

    #[test]
    fn usage_frame_fields() {
        let frame = SseFrame::Usage {
            input_tokens: 2,
            output_tokens: 2,
            total_tokens: 4,
        };
        let json: serde_json::Value = serde_json::from_str(&frame.to_json()).unwrap();
        assert_eq!(json["type"], "usage");
        assert_eq!(json["total_tokens"], 4);
    }

    #[test]
    fn wire_format_is_sse_framed() {
        let wire = SseFrame::Done.to_wire();
        assert!(wire.starts_with("data: {"));
        assert!(wire.ends_with("\n\n"));
    }

    #[test]
    fn error_frame_carries_envelope_fields() {
        let err = GatewayError::unavailable("PROVIDER_UNREACHABLE", "connect refused");
        let frame = SseFrame::error(&err, "req-9");
        let json: serde_json::Value = serde_json::from_str(&frame.to_json()).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["category"], "service_unavailable");
        assert_eq!(json["code"], "PROVIDER_UNREACHABLE");
        assert_eq!(json["request_id"], "req-9");
    }
}
