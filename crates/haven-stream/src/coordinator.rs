use std::sync::Arc;
use std::time::Duration;

use futures_util::Stream;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use haven_core::types::MessageId;
use haven_llm::provider::ProviderAdapter;
use haven_llm::{ChatParams, StreamEvent, Usage};
use haven_worker::{JobQueue, PersistAssistantMessage};

use crate::cache::SessionCache;
use crate::error::Result;
use crate::frames::SseFrame;
use crate::session::StreamSession;
use crate::tags::TagStreamParser;

/// Drives the streaming half of a two-phase turn: claim the prepared
/// session, relay provider events as SSE frames, and hand the finished
/// assistant message to the persistence queue.
pub struct StreamCoordinator {
    cache: Arc<SessionCache>,
    queue: JobQueue,
    wallclock_cap: Duration,
}

impl StreamCoordinator {
    pub fn new(cache: Arc<SessionCache>, queue: JobQueue, wallclock_cap: Duration) -> Self {
        Self {
            cache,
            queue,
            wallclock_cap,
        }
    }

    pub fn cache(&self) -> &Arc<SessionCache> {
        &self.cache
    }

    /// Claim a prepared session. Fails with the token-invalid or consumed
    /// error; claiming is the single-use gate.
    pub fn claim(&self, token: &str) -> Result<StreamSession> {
        self.cache.claim(token)
    }

    /// Run a claimed session against its adapter, yielding SSE frames.
    ///
    /// Persistence is enqueued exactly once per turn: on normal completion,
    /// on a terminal error, on the wall-clock cap, or — via drop — when the
    /// client disconnects mid-stream (partial content is kept so the user
    /// sees what was produced).
    pub fn run_stream(
        &self,
        session: StreamSession,
        adapter: Arc<dyn ProviderAdapter>,
        request_id: String,
    ) -> impl Stream<Item = SseFrame> + Send + 'static {
        let cap = self.wallclock_cap;
        let (tx, mut rx) = mpsc::channel::<StreamEvent>(64);

        // Drive the provider in its own task; a terminal adapter error is
        // folded into the event stream.
        {
            let adapter = adapter.clone();
            let model = session.model.clone();
            let history = session.history.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let params = ChatParams::default();
                if let Err(e) = adapter.chat_stream(&model, &history, &params, tx.clone()).await {
                    let _ = tx
                        .send(StreamEvent::Error {
                            code: e.code(),
                            message: e.to_string(),
                            retryable: e.retryable(),
                        })
                        .await;
                }
            });
        }
        drop(tx);

        let placeholder_id = MessageId::new().to_string();
        let mut turn = TurnState {
            queue: self.queue.clone(),
            adapter,
            conversation_id: session.conversation_id.clone(),
            user_message_id: session.user_message_id.clone(),
            model: session.model.clone(),
            content: String::new(),
            reasoning: String::new(),
            raw: String::new(),
            usage: None,
            started: std::time::Instant::now(),
            finished: false,
        };

        async_stream::stream! {
            let mut parser = TagStreamParser::new();
            let mut thinking_open = false;
            let deadline = tokio::time::Instant::now() + cap;

            yield SseFrame::ConversationStart {
                conversation_id: turn.conversation_id.clone(),
                assistant_message_placeholder_id: placeholder_id.clone(),
            };

            loop {
                let next = tokio::select! {
                    ev = rx.recv() => Tick::Event(ev),
                    _ = tokio::time::sleep_until(deadline) => Tick::Deadline,
                };
                let event = match next {
                    Tick::Deadline => {
                        info!(conversation_id = %turn.conversation_id,
                              "stream hit wall-clock cap, closing");
                        yield SseFrame::Error {
                            category: "service_unavailable",
                            code: "PROVIDER_TIMEOUT",
                            message: format!("stream exceeded {}s wall-clock cap", cap.as_secs()),
                            request_id: request_id.clone(),
                            timestamp: chrono::Utc::now().to_rfc3339(),
                        };
                        yield SseFrame::Done;
                        break;
                    }
                    // Channel closed without a Done: provider task died.
                    Tick::Event(None) => break,
                    Tick::Event(Some(event)) => event,
                };

                match event {
                    StreamEvent::TokenDelta { text } => {
                        turn.raw.push_str(&text);
                        let parsed = parser.push(&text);
                        if !parsed.reasoning.is_empty() {
                            if !thinking_open {
                                thinking_open = true;
                                yield SseFrame::ThinkingStart;
                            }
                            turn.reasoning.push_str(&parsed.reasoning);
                            yield SseFrame::ThinkingDelta { content: parsed.reasoning };
                        }
                        if thinking_open && !parser.in_reasoning() {
                            thinking_open = false;
                            yield SseFrame::ThinkingEnd;
                        }
                        if !parsed.visible.is_empty() {
                            turn.content.push_str(&parsed.visible);
                            yield SseFrame::ContentDelta { content: parsed.visible };
                        }
                    }
                    StreamEvent::ReasoningDelta { text } => {
                        if !thinking_open {
                            thinking_open = true;
                            yield SseFrame::ThinkingStart;
                        }
                        turn.reasoning.push_str(&text);
                        yield SseFrame::ThinkingDelta { content: text };
                    }
                    StreamEvent::ToolCallStart { id, name, arguments_partial } => {
                        yield SseFrame::ToolCallStart {
                            tool_call_id: id,
                            name,
                            arguments_partial,
                        };
                    }
                    StreamEvent::ToolCallEnd { id, success, result, error } => {
                        yield SseFrame::ToolCallEnd {
                            tool_call_id: id,
                            success,
                            result,
                            error,
                            execution_time_ms: 0,
                        };
                    }
                    StreamEvent::Usage { input, output, total } => {
                        turn.usage = Some(Usage { input, output, total });
                        yield SseFrame::Usage {
                            input_tokens: input,
                            output_tokens: output,
                            total_tokens: total,
                        };
                    }
                    StreamEvent::Done { finish_reason } => {
                        let rest = parser.finish();
                        if !rest.reasoning.is_empty() {
                            if !thinking_open {
                                thinking_open = true;
                                yield SseFrame::ThinkingStart;
                            }
                            turn.reasoning.push_str(&rest.reasoning);
                            yield SseFrame::ThinkingDelta { content: rest.reasoning };
                        }
                        if thinking_open {
                            yield SseFrame::ThinkingEnd;
                        }
                        if !rest.visible.is_empty() {
                            turn.content.push_str(&rest.visible);
                            yield SseFrame::ContentDelta { content: rest.visible };
                        }

                        let message = turn.assembled_message(&placeholder_id, &finish_reason);
                        turn.finalize();
                        yield SseFrame::MessageComplete { message };
                        yield SseFrame::Done;
                        break;
                    }
                    StreamEvent::Error { code, message, retryable: _ } => {
                        yield SseFrame::Error {
                            category: category_for_code(code),
                            code,
                            message,
                            request_id: request_id.clone(),
                            timestamp: chrono::Utc::now().to_rfc3339(),
                        };
                        yield SseFrame::Done;
                        break;
                    }
                }
            }
            // Interrupted paths fall through here; the TurnState drop
            // persists whatever was produced.
        }
    }
}

enum Tick {
    Event(Option<StreamEvent>),
    Deadline,
}

/// SSE error frames reuse the envelope categories; adapters only report
/// stable codes, so the category is recovered here.
fn category_for_code(code: &str) -> &'static str {
    match code {
        "PROVIDER_UNREACHABLE" | "PROVIDER_TIMEOUT" => "service_unavailable",
        "RATE_LIMITED" => "rate_limit_error",
        "CAPACITY_EXHAUSTED" => "resource_error",
        "CONTEXT_OVERFLOW" => "context_limit_error",
        "PROVIDER_BAD_RESPONSE" => "internal_error",
        _ => "validation_error",
    }
}

/// Accumulated turn output plus everything needed to persist it.
///
/// Enqueues the persistence job at most once — explicitly on completion, or
/// from Drop when the client disconnected mid-stream.
struct TurnState {
    queue: JobQueue,
    adapter: Arc<dyn ProviderAdapter>,
    conversation_id: String,
    user_message_id: String,
    model: String,
    content: String,
    reasoning: String,
    raw: String,
    usage: Option<Usage>,
    started: std::time::Instant,
    finished: bool,
}

impl TurnState {
    fn assembled_message(&self, id: &str, finish_reason: &str) -> serde_json::Value {
        let usage = self.usage.unwrap_or_default();
        let token_count = if usage.total > 0 {
            usage.total
        } else {
            self.adapter.count_tokens(&self.model, &self.content)
        };
        json!({
            "id": id,
            "conversation_id": self.conversation_id,
            "role": "assistant",
            "content": self.content,
            "reasoning": if self.reasoning.is_empty() { serde_json::Value::Null } else { json!(self.reasoning) },
            "token_count": token_count,
            "provider_meta": {
                "model": self.model,
                "input_tokens": usage.input,
                "output_tokens": usage.output,
                "total_tokens": usage.total,
                "elapsed_ms": self.started.elapsed().as_millis() as u64,
                "finish_reason": finish_reason,
                "user_message_id": self.user_message_id,
            },
            "created_at": chrono::Utc::now().to_rfc3339(),
        })
    }

    fn finalize(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        // The claimed cache entry stays behind as a tombstone until its TTL,
        // so a replayed token keeps answering "consumed" after the stream.

        if self.content.is_empty() && self.reasoning.is_empty() {
            debug!(conversation_id = %self.conversation_id,
                   "stream produced no content, nothing to persist");
            return;
        }

        let usage = self.usage.unwrap_or_default();
        let payload = PersistAssistantMessage {
            conversation_id: self.conversation_id.clone(),
            user_message_id: self.user_message_id.clone(),
            content: self.content.clone(),
            reasoning: if self.reasoning.is_empty() {
                None
            } else {
                Some(self.reasoning.clone())
            },
            raw: if self.raw == self.content {
                None
            } else {
                Some(self.raw.clone())
            },
            input_tokens: usage.input,
            output_tokens: usage.output,
            total_tokens: usage.total,
            fallback_token_count: self.adapter.count_tokens(&self.model, &self.content),
            model: self.model.clone(),
            elapsed_ms: self.started.elapsed().as_millis() as u64,
        };
        if let Err(e) = self.queue.enqueue_persist(&payload) {
            error!(conversation_id = %self.conversation_id,
                   "failed to enqueue persistence job: {e}");
        }
    }
}

impl Drop for TurnState {
    fn drop(&mut self) {
        self.finalize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::mint_stream_token;
    use async_trait::async_trait;
    use futures_util::StreamExt;
    use haven_llm::provider::{
        ChatMessage, ChatOutcome, ModelDescriptor, ProviderError, ProviderHealth,
    };
    use rusqlite::Connection;

    /// Adapter that replays a script of events, then optionally hangs.
    struct ScriptedAdapter {
        events: Vec<StreamEvent>,
        hang_after: bool,
    }

    #[async_trait]
    impl ProviderAdapter for ScriptedAdapter {
        fn id(&self) -> &str {
            "scripted"
        }

        async fn list_models(&self) -> std::result::Result<Vec<ModelDescriptor>, ProviderError> {
            Ok(Vec::new())
        }

        fn count_tokens(&self, _model: &str, text: &str) -> u32 {
            text.split_whitespace().count() as u32
        }

        fn context_limit(&self, _model: &str) -> u32 {
            4096
        }

        async fn chat_once(
            &self,
            _model: &str,
            _messages: &[ChatMessage],
            _params: &ChatParams,
        ) -> std::result::Result<ChatOutcome, ProviderError> {
            Err(ProviderError::Unreachable("not scripted".to_string()))
        }

        async fn chat_stream(
            &self,
            _model: &str,
            _messages: &[ChatMessage],
            _params: &ChatParams,
            tx: mpsc::Sender<StreamEvent>,
        ) -> std::result::Result<(), ProviderError> {
            for event in self.events.clone() {
                if tx.send(event).await.is_err() {
                    return Ok(());
                }
            }
            if self.hang_after {
                // Simulate a provider that never finishes.
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            Ok(())
        }

        async fn health(&self) -> ProviderHealth {
            ProviderHealth {
                ok: true,
                detail: String::new(),
            }
        }
    }

    fn coordinator(cap: Duration) -> StreamCoordinator {
        let queue = JobQueue::new(Connection::open_in_memory().unwrap()).unwrap();
        StreamCoordinator::new(Arc::new(SessionCache::new()), queue, cap)
    }

    fn session() -> StreamSession {
        StreamSession {
            token: mint_stream_token(),
            conversation_id: "c1".to_string(),
            principal_id: 1,
            model: "m-small".to_string(),
            history: Vec::new(),
            user_message_id: "u1".to_string(),
            ttl: Duration::from_secs(300),
        }
    }

    fn frame_types(frames: &[SseFrame]) -> Vec<String> {
        frames
            .iter()
            .map(|f| {
                serde_json::from_str::<serde_json::Value>(&f.to_json()).unwrap()["type"]
                    .as_str()
                    .unwrap()
                    .to_string()
            })
            .collect()
    }

    #[tokio::test]
    async fn happy_path_emits_frames_in_order_and_enqueues() {
        let coord = coordinator(Duration::from_secs(600));
        let adapter = Arc::new(ScriptedAdapter {
            events: vec![
                StreamEvent::TokenDelta {
                    text: "Hello".to_string(),
                },
                StreamEvent::TokenDelta {
                    text: " there".to_string(),
                },
                StreamEvent::Usage {
                    input: 2,
                    output: 2,
                    total: 4,
                },
                StreamEvent::Done {
                    finish_reason: "stop".to_string(),
                },
            ],
            hang_after: false,
        });

        let frames: Vec<SseFrame> = coord
            .run_stream(session(), adapter, "req-1".to_string())
            .collect()
            .await;

        assert_eq!(
            frame_types(&frames),
            vec![
                "conversation_start",
                "content_delta",
                "content_delta",
                "usage",
                "message_complete",
                "done"
            ]
        );

        // The assembled message concatenates every content_delta payload.
        let complete: serde_json::Value =
            serde_json::from_str(&frames[4].to_json()).unwrap();
        assert_eq!(complete["message"]["content"], "Hello there");
        assert_eq!(complete["message"]["token_count"], 4);

        // One persistence job, carrying the attested usage.
        let mut jobs = coord.queue.claim_due().unwrap();
        assert_eq!(jobs.len(), 1);
        let payload = jobs.remove(0).payload;
        assert_eq!(payload["content"], "Hello there");
        assert_eq!(payload["total_tokens"], 4);
        assert_eq!(payload["user_message_id"], "u1");
    }

    #[tokio::test]
    async fn thinking_tags_split_into_reasoning_channel() {
        let coord = coordinator(Duration::from_secs(600));
        let adapter = Arc::new(ScriptedAdapter {
            events: vec![
                StreamEvent::TokenDelta {
                    text: "<thin".to_string(),
                },
                StreamEvent::TokenDelta {
                    text: "king>checking</thinking>Four.".to_string(),
                },
                StreamEvent::Done {
                    finish_reason: "stop".to_string(),
                },
            ],
            hang_after: false,
        });

        let frames: Vec<SseFrame> = coord
            .run_stream(session(), adapter, "req-2".to_string())
            .collect()
            .await;

        let types = frame_types(&frames);
        assert_eq!(
            types,
            vec![
                "conversation_start",
                "thinking_start",
                "thinking_delta",
                "thinking_end",
                "content_delta",
                "message_complete",
                "done"
            ]
        );

        let complete: serde_json::Value =
            serde_json::from_str(&frames[5].to_json()).unwrap();
        assert_eq!(complete["message"]["content"], "Four.");
        assert_eq!(complete["message"]["reasoning"], "checking");
    }

    #[tokio::test]
    async fn provider_error_yields_error_then_done() {
        let coord = coordinator(Duration::from_secs(600));
        let adapter = Arc::new(ScriptedAdapter {
            events: vec![
                StreamEvent::TokenDelta {
                    text: "Par".to_string(),
                },
                StreamEvent::Error {
                    code: "PROVIDER_UNREACHABLE",
                    message: "connection reset".to_string(),
                    retryable: true,
                },
            ],
            hang_after: false,
        });

        let frames: Vec<SseFrame> = coord
            .run_stream(session(), adapter, "req-3".to_string())
            .collect()
            .await;

        let types = frame_types(&frames);
        assert_eq!(
            types,
            vec!["conversation_start", "content_delta", "error", "done"]
        );
        let error: serde_json::Value = serde_json::from_str(&frames[2].to_json()).unwrap();
        assert_eq!(error["category"], "service_unavailable");

        // Partial content still reaches the persistence queue.
        let jobs = coord.queue.claim_due().unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].payload["content"], "Par");
    }

    #[tokio::test]
    async fn client_disconnect_persists_partial_content() {
        let coord = coordinator(Duration::from_secs(600));
        let adapter = Arc::new(ScriptedAdapter {
            events: vec![StreamEvent::TokenDelta {
                text: "Par".to_string(),
            }],
            hang_after: true,
        });

        {
            let stream = coord.run_stream(session(), adapter, "req-4".to_string());
            tokio::pin!(stream);
            // Read the first two frames, then drop the stream — the client
            // went away.
            let first = stream.next().await.unwrap();
            let second = stream.next().await.unwrap();
            assert_eq!(frame_types(&[first, second]), vec![
                "conversation_start",
                "content_delta"
            ]);
        }

        let jobs = coord.queue.claim_due().unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].payload["content"], "Par");
        // No attested usage — worker falls back to the local count.
        assert_eq!(jobs[0].payload["total_tokens"], 0);
        assert_eq!(jobs[0].payload["fallback_token_count"], 1);
    }

    #[tokio::test]
    async fn wallclock_cap_closes_the_stream() {
        let coord = coordinator(Duration::from_millis(50));
        let adapter = Arc::new(ScriptedAdapter {
            events: vec![StreamEvent::TokenDelta {
                text: "slow".to_string(),
            }],
            hang_after: true,
        });

        let frames: Vec<SseFrame> = coord
            .run_stream(session(), adapter, "req-5".to_string())
            .collect()
            .await;

        let types = frame_types(&frames);
        assert_eq!(types.last().unwrap(), "done");
        let error: serde_json::Value =
            serde_json::from_str(&frames[types.len() - 2].to_json()).unwrap();
        assert_eq!(error["code"], "PROVIDER_TIMEOUT");

        // Partial content persisted on the capped path too.
        assert_eq!(coord.queue.claim_due().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn empty_stream_enqueues_nothing() {
        let coord = coordinator(Duration::from_secs(600));
        let adapter = Arc::new(ScriptedAdapter {
            events: vec![StreamEvent::Done {
                finish_reason: "stop".to_string(),
            }],
            hang_after: false,
        });

        let _: Vec<SseFrame> = coord
            .run_stream(session(), adapter, "req-6".to_string())
            .collect()
            .await;

        assert!(coord.queue.claim_due().unwrap().is_empty());
    }
}
