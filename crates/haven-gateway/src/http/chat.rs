//! Non-streaming turn — POST /api/chat/conversations/{id}/chat
//!
//! Same pre-flight path as the streaming prepare step (route → context
//! guard → persist user message), but the assistant message is written
//! inline once the provider answers, and both messages come back in one
//! response.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    Extension, Json,
};
use serde::{Deserialize, Serialize};

use haven_core::error::GatewayError;
use haven_core::types::{MessageRole, RequestId};
use haven_llm::registry::RegisteredModel;
use haven_llm::{ChatMessage, ChatParams, Usage};
use haven_store::types::{NewMessage, ProviderMeta};
use haven_store::{Conversation, Message};
use haven_stream::tags::extract_reasoning;

use crate::app::{AppState, CurrentPrincipal};
use crate::error::ApiError;

#[derive(Deserialize)]
pub struct ChatRequest {
    pub message: String,
    /// Required unless the conversation carries a stored model.
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

#[derive(Serialize)]
pub struct ChatResponse {
    pub user_message: Message,
    pub assistant_message: Message,
    pub usage: Usage,
    pub model: String,
}

pub async fn chat_handler(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<CurrentPrincipal>,
    Extension(request_id): Extension<RequestId>,
    Path(id): Path<String>,
    Json(req): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, ApiError> {
    let setup = begin_turn(
        &state,
        principal.0.id,
        &id,
        &req.message,
        req.model.as_deref(),
        req.max_tokens,
    )
    .map_err(|e| ApiError::new(e, &request_id))?;

    let params = ChatParams {
        temperature: req.temperature,
        max_tokens: req.max_tokens.unwrap_or(1024),
        stop: Vec::new(),
    };

    let started = std::time::Instant::now();
    let outcome = setup
        .routed
        .adapter
        .chat_once(&setup.model, &setup.history, &params)
        .await
        .map_err(|e| ApiError::new(e, &request_id))?;

    // Providers without a native reasoning channel emit thinking tags
    // in-band; strip them the same way the streaming path does.
    let (content, reasoning) = match outcome.reasoning {
        Some(reasoning) => (outcome.content.clone(), Some(reasoning)),
        None => {
            let parsed = extract_reasoning(&outcome.content);
            let reasoning = if parsed.reasoning.is_empty() {
                None
            } else {
                Some(parsed.reasoning)
            };
            (parsed.visible, reasoning)
        }
    };

    let token_count = if outcome.usage.total > 0 {
        outcome.usage.total
    } else {
        setup.routed.adapter.count_tokens(&setup.model, &content)
    };

    let assistant_message = state
        .store
        .append_message(
            None,
            &id,
            &NewMessage {
                role: MessageRole::Assistant,
                raw_content: if outcome.content == content {
                    None
                } else {
                    Some(outcome.content)
                },
                content,
                reasoning,
                token_count,
                provider_meta: Some(ProviderMeta {
                    model: Some(outcome.model.clone()),
                    input_tokens: Some(outcome.usage.input),
                    output_tokens: Some(outcome.usage.output),
                    total_tokens: Some(outcome.usage.total),
                    elapsed_ms: Some(started.elapsed().as_millis() as u64),
                    user_message_id: Some(setup.user_message.id.clone()),
                }),
            },
        )
        .map_err(|e| ApiError::new(e, &request_id))?;

    Ok(Json(ChatResponse {
        user_message: setup.user_message,
        assistant_message,
        usage: outcome.usage,
        model: outcome.model,
    }))
}

/// Everything a turn needs before the provider call.
pub(crate) struct TurnSetup {
    pub conversation: Conversation,
    pub routed: RegisteredModel,
    pub model: String,
    pub user_message: Message,
    pub history: Vec<ChatMessage>,
}

/// Shared pre-flight for streaming and non-streaming turns: authorize,
/// resolve the model, run the context guard, and persist the user message.
/// The user message commits before any provider traffic.
pub(crate) fn begin_turn(
    state: &AppState,
    principal_id: i64,
    conversation_id: &str,
    message: &str,
    model_override: Option<&str>,
    max_tokens: Option<u32>,
) -> Result<TurnSetup, GatewayError> {
    let message = message.trim();
    if message.is_empty() {
        return Err(GatewayError::validation(
            "EMPTY_MESSAGE",
            "message must not be empty",
        ));
    }

    let conversation = state
        .store
        .get_conversation_meta(principal_id, conversation_id)?;

    let model = model_override
        .or(conversation.model.as_deref())
        .ok_or_else(|| {
            GatewayError::validation(
                "MODEL_REQUIRED",
                "no model given and the conversation has no stored model",
            )
        })?
        .to_string();

    let routed = state.registry.route(&model)?;

    let incoming_tokens = routed.adapter.count_tokens(&model, message);
    let system_tokens = conversation
        .system_prompt
        .as_deref()
        .map(|p| routed.adapter.count_tokens(&model, p))
        .unwrap_or(0);

    state.guard.check(
        &routed.descriptor,
        conversation.total_tokens,
        incoming_tokens,
        system_tokens,
        max_tokens,
    )?;

    let user_message = state.store.append_message(
        Some(principal_id),
        conversation_id,
        &NewMessage::user(message, incoming_tokens),
    )?;

    let history: Vec<ChatMessage> = state
        .store
        .history_for_model(principal_id, conversation_id)?
        .into_iter()
        .map(|(role, content)| ChatMessage::new(role, content))
        .collect();

    Ok(TurnSetup {
        conversation,
        routed,
        model,
        user_message,
        history,
    })
}
