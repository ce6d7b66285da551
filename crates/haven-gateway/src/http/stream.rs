//! Two-phase streaming turn.
//!
//! Phase one (`POST …/prepare-stream`, authenticated) commits the user
//! message and mints a single-use stream token. Phase two
//! (`GET /stream/{token}`, mounted on the auth bypass list) claims the
//! token and relays provider output as SSE; the token itself is the
//! capability.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, State},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse,
    },
    Extension, Json,
};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};

use haven_core::error::GatewayError;
use haven_core::types::RequestId;
use haven_stream::{mint_stream_token, StreamSession};

use crate::app::{AppState, CurrentPrincipal};
use crate::error::ApiError;
use crate::http::chat::begin_turn;

#[derive(Deserialize)]
pub struct PrepareRequest {
    pub message: String,
    /// Mandatory — there is no server default model for streamed turns.
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

#[derive(Serialize)]
pub struct PrepareResponse {
    pub stream_token: String,
    pub stream_url: String,
    pub expires_in: u64,
}

/// POST /api/chat/conversations/{id}/prepare-stream
pub async fn prepare_handler(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<CurrentPrincipal>,
    Extension(request_id): Extension<RequestId>,
    Path(id): Path<String>,
    Json(req): Json<PrepareRequest>,
) -> Result<Json<PrepareResponse>, ApiError> {
    let model = req.model.as_deref().filter(|m| !m.trim().is_empty()).ok_or_else(|| {
        ApiError::new(
            GatewayError::validation("MODEL_REQUIRED", "model is required for prepare-stream"),
            &request_id,
        )
    })?;

    let setup = begin_turn(
        &state,
        principal.0.id,
        &id,
        &req.message,
        Some(model),
        req.max_tokens,
    )
    .map_err(|e| ApiError::new(e, &request_id))?;

    let ttl = Duration::from_secs(state.config.stream.session_ttl_seconds);
    let token = mint_stream_token();
    state.coordinator.cache().insert(StreamSession {
        token: token.clone(),
        conversation_id: setup.conversation.id.clone(),
        principal_id: principal.0.id,
        model: setup.model.clone(),
        history: setup.history,
        user_message_id: setup.user_message.id.clone(),
        ttl,
    });

    Ok(Json(PrepareResponse {
        stream_url: format!("/stream/{}", token),
        stream_token: token,
        expires_in: ttl.as_secs(),
    }))
}

/// GET /stream/{token}
///
/// Claiming marks the token consumed before the first provider byte, so a
/// second GET on the same token fails even while the first is still
/// streaming. Errors after this point are terminal SSE frames, not HTTP
/// statuses.
pub async fn stream_handler(
    State(state): State<Arc<AppState>>,
    Extension(request_id): Extension<RequestId>,
    Path(token): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let session = state
        .coordinator
        .claim(&token)
        .map_err(|e| ApiError::new(e, &request_id))?;

    // A registry miss here means the model vanished between prepare and
    // stream; the claimed token stays consumed either way.
    let routed = state
        .registry
        .route(&session.model)
        .map_err(|e| ApiError::new(e, &request_id))?;

    let frames = state
        .coordinator
        .run_stream(session, routed.adapter, request_id.to_string());
    let sse_stream =
        frames.map(|frame| Ok::<_, std::convert::Infallible>(Event::default().data(frame.to_json())));

    let headers = [
        ("cache-control", "no-cache"),
        ("x-accel-buffering", "no"),
    ];
    Ok((
        headers,
        Sse::new(sse_stream).keep_alive(KeepAlive::default()),
    ))
}
