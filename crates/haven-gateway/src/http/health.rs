use std::sync::Arc;

use axum::{
    extract::{Path, State},
    Extension, Json,
};
use serde_json::{json, Value};

use haven_core::error::GatewayError;
use haven_core::types::RequestId;

use crate::app::AppState;
use crate::error::ApiError;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// GET /health — liveness probe with server metadata.
pub async fn health_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": VERSION,
        "models": state.registry.models().len(),
        "active_stream_sessions": state.coordinator.cache().len(),
    }))
}

/// GET /health/{service} — per-backend probe.
pub async fn service_health_handler(
    State(state): State<Arc<AppState>>,
    Extension(request_id): Extension<RequestId>,
    Path(service): Path<String>,
) -> Result<Json<Value>, ApiError> {
    match service.as_str() {
        "database" => {
            let ok = state.store.ping().is_ok();
            Ok(Json(json!({
                "ok": ok,
                "detail": if ok { "reachable" } else { "query failed" },
            })))
        }
        "providers" => {
            let mut entries = Vec::new();
            for adapter in state.registry.adapters() {
                let health = adapter.health().await;
                entries.push(json!({
                    "provider": adapter.id(),
                    "ok": health.ok,
                    "detail": health.detail,
                }));
            }
            let ok = entries
                .iter()
                .all(|e| e["ok"].as_bool().unwrap_or(false));
            Ok(Json(json!({ "ok": ok, "providers": entries })))
        }
        "sessions" => Ok(Json(json!({
            "ok": true,
            "active": state.coordinator.cache().len(),
        }))),
        "queue" => {
            let pending = state.queue.depth("pending").unwrap_or(0);
            let dead = state.queue.depth("dead").unwrap_or(0);
            Ok(Json(json!({
                "ok": true,
                "pending": pending,
                "dead": dead,
            })))
        }
        _ => Err(ApiError::new(
            GatewayError::not_found("health probe"),
            &request_id,
        )),
    }
}
