use std::sync::Arc;

use axum::{extract::State, Json};
use serde_json::json;

use crate::app::AppState;

/// GET /api/llm/models — flattened descriptors from the registry snapshot.
pub async fn models_handler(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(json!({ "models": state.registry.models() }))
}
