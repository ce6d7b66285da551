use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    Extension, Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;

use haven_core::error::GatewayError;
use haven_core::types::{MessageRole, RequestId};
use haven_store::types::{ConversationFilter, ConversationPatch, ConversationStatus};
use haven_store::{Conversation, Message};

use crate::app::{AppState, CurrentPrincipal};
use crate::error::ApiError;

#[derive(Deserialize)]
pub struct CreateRequest {
    pub title: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

/// POST /api/chat/conversations
pub async fn create_handler(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<CurrentPrincipal>,
    Extension(request_id): Extension<RequestId>,
    Json(req): Json<CreateRequest>,
) -> Result<Json<Conversation>, ApiError> {
    let conversation = state
        .store
        .create_conversation(
            principal.0.id,
            &req.title,
            req.model.as_deref(),
            req.system_prompt.as_deref(),
            req.metadata,
        )
        .map_err(|e| ApiError::new(e, &request_id))?;
    Ok(Json(conversation))
}

#[derive(Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub status: Option<String>,
    /// Title search text.
    #[serde(default)]
    pub q: Option<String>,
    #[serde(default)]
    pub created_after: Option<String>,
    #[serde(default)]
    pub created_before: Option<String>,
    #[serde(default)]
    pub limit: Option<u32>,
    #[serde(default)]
    pub offset: Option<u32>,
}

/// GET /api/chat/conversations
pub async fn list_handler(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<CurrentPrincipal>,
    Extension(request_id): Extension<RequestId>,
    Query(query): Query<ListQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let status = match query.status.as_deref() {
        None => None,
        Some(raw) => Some(raw.parse::<ConversationStatus>().map_err(|e| {
            ApiError::new(GatewayError::validation("INVALID_FIELD", e), &request_id)
        })?),
    };

    let filter = ConversationFilter {
        status,
        search: query.q,
        created_after: query.created_after,
        created_before: query.created_before,
        limit: query.limit.unwrap_or(0),
        offset: query.offset.unwrap_or(0),
    };

    let conversations = state
        .store
        .list_conversations(principal.0.id, &filter)
        .map_err(|e| ApiError::new(e, &request_id))?;
    Ok(Json(json!({ "conversations": conversations })))
}

#[derive(Serialize)]
pub struct ConversationWithMessages {
    #[serde(flatten)]
    pub conversation: Conversation,
    pub messages: Vec<Message>,
}

/// GET /api/chat/conversations/{id}
pub async fn get_handler(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<CurrentPrincipal>,
    Extension(request_id): Extension<RequestId>,
    Path(id): Path<String>,
) -> Result<Json<ConversationWithMessages>, ApiError> {
    let (conversation, messages) = state
        .store
        .get_conversation(principal.0.id, &id)
        .map_err(|e| ApiError::new(e, &request_id))?;
    Ok(Json(ConversationWithMessages {
        conversation,
        messages,
    }))
}

/// PATCH /api/chat/conversations/{id}
pub async fn update_handler(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<CurrentPrincipal>,
    Extension(request_id): Extension<RequestId>,
    Path(id): Path<String>,
    Json(patch): Json<ConversationPatch>,
) -> Result<Json<Conversation>, ApiError> {
    let conversation = state
        .store
        .update_conversation(principal.0.id, &id, &patch)
        .map_err(|e| ApiError::new(e, &request_id))?;
    Ok(Json(conversation))
}

#[derive(Deserialize)]
pub struct DeleteQuery {
    #[serde(default)]
    pub hard: bool,
}

/// DELETE /api/chat/conversations/{id}?hard=true
pub async fn delete_handler(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<CurrentPrincipal>,
    Extension(request_id): Extension<RequestId>,
    Path(id): Path<String>,
    Query(query): Query<DeleteQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state
        .store
        .delete_conversation(principal.0.id, &id, query.hard)
        .map_err(|e| ApiError::new(e, &request_id))?;
    Ok(Json(json!({ "deleted": true, "hard": query.hard })))
}

#[derive(Deserialize)]
pub struct MessagesQuery {
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub limit: Option<u32>,
    #[serde(default)]
    pub offset: Option<u32>,
}

/// GET /api/chat/conversations/{id}/messages
pub async fn messages_handler(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<CurrentPrincipal>,
    Extension(request_id): Extension<RequestId>,
    Path(id): Path<String>,
    Query(query): Query<MessagesQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let role = match query.role.as_deref() {
        None => None,
        Some(raw) => Some(raw.parse::<MessageRole>().map_err(|e| {
            ApiError::new(GatewayError::validation("INVALID_FIELD", e), &request_id)
        })?),
    };

    let messages = state
        .store
        .list_messages(
            principal.0.id,
            &id,
            role,
            query.limit.unwrap_or(0),
            query.offset.unwrap_or(0),
        )
        .map_err(|e| ApiError::new(e, &request_id))?;
    Ok(Json(json!({ "messages": messages })))
}
