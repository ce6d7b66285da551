/// Events emitted while a provider streams a model response.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// Incremental user-visible text from the model.
    TokenDelta { text: String },

    /// Incremental hidden-reasoning content, for providers that expose a
    /// separate channel. Never mixed into the visible content stream.
    ReasoningDelta { text: String },

    /// Model began a tool invocation.
    ToolCallStart {
        id: String,
        name: String,
        arguments_partial: Option<String>,
    },

    /// Tool invocation finished.
    ToolCallEnd {
        id: String,
        success: bool,
        result: Option<String>,
        error: Option<String>,
    },

    /// Provider-attested token counts. Usually arrives once, at or near the
    /// end of the stream.
    Usage { input: u32, output: u32, total: u32 },

    /// Stream completed normally.
    Done { finish_reason: String },

    /// Fatal stream error.
    Error {
        code: &'static str,
        message: String,
        retryable: bool,
    },
}

/// Parse a single SSE line from a provider's streaming API.
/// SSE format: `event: <type>\ndata: <json>\n\n`
pub fn parse_sse_line(line: &str) -> Option<SseParsed> {
    if let Some(event_type) = line.strip_prefix("event: ") {
        Some(SseParsed::Event(event_type.to_string()))
    } else {
        line.strip_prefix("data: ")
            .map(|data| SseParsed::Data(data.to_string()))
    }
}

#[derive(Debug)]
pub enum SseParsed {
    Event(String),
    Data(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_event_and_data_lines() {
        match parse_sse_line("event: message_start") {
            Some(SseParsed::Event(e)) => assert_eq!(e, "message_start"),
            other => panic!("unexpected: {:?}", other),
        }
        match parse_sse_line("data: {\"x\":1}") {
            Some(SseParsed::Data(d)) => assert_eq!(d, "{\"x\":1}"),
            other => panic!("unexpected: {:?}", other),
        }
        assert!(parse_sse_line(": keepalive comment").is_none());
    }
}
