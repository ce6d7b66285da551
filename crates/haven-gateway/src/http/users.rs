use std::sync::Arc;

use axum::{
    extract::{Path, State},
    Extension, Json,
};
use serde::Deserialize;
use serde_json::json;

use haven_core::error::GatewayError;
use haven_core::types::RequestId;

use crate::app::{AppState, CurrentPrincipal};
use crate::error::ApiError;

/// GET /api/users/me
pub async fn me_handler(
    Extension(principal): Extension<CurrentPrincipal>,
) -> Json<serde_json::Value> {
    Json(json!(principal.0))
}

#[derive(Deserialize)]
pub struct UpdateMeRequest {
    pub display_name: String,
}

/// PUT /api/users/me
pub async fn update_me_handler(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<CurrentPrincipal>,
    Extension(request_id): Extension<RequestId>,
    Json(req): Json<UpdateMeRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let name = req.display_name.trim();
    if name.is_empty() {
        return Err(ApiError::new(
            GatewayError::validation("INVALID_FIELD", "display_name: must not be empty"),
            &request_id,
        ));
    }
    let updated = state
        .principals
        .update_profile(principal.0.id, name)
        .map_err(|e| ApiError::new(e, &request_id))?;
    Ok(Json(json!(updated)))
}

/// GET /api/users — admin only.
pub async fn list_handler(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<CurrentPrincipal>,
    Extension(request_id): Extension<RequestId>,
) -> Result<Json<serde_json::Value>, ApiError> {
    require_admin(&principal, &request_id)?;
    let principals = state
        .principals
        .list()
        .map_err(|e| ApiError::new(e, &request_id))?;
    Ok(Json(json!({ "users": principals })))
}

/// GET /api/users/{id} — admin only.
pub async fn get_handler(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<CurrentPrincipal>,
    Extension(request_id): Extension<RequestId>,
    Path(id): Path<i64>,
) -> Result<Json<serde_json::Value>, ApiError> {
    require_admin(&principal, &request_id)?;
    let found = state
        .principals
        .get(id)
        .map_err(|e| ApiError::new(e, &request_id))?
        .ok_or_else(|| ApiError::new(GatewayError::not_found("principal"), &request_id))?;
    Ok(Json(json!(found)))
}

/// DELETE /api/users/{id} — admin only. Soft-deactivation; principals are
/// never hard-deleted.
pub async fn deactivate_handler(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<CurrentPrincipal>,
    Extension(request_id): Extension<RequestId>,
    Path(id): Path<i64>,
) -> Result<Json<serde_json::Value>, ApiError> {
    require_admin(&principal, &request_id)?;
    state
        .principals
        .deactivate(id)
        .map_err(|e| ApiError::new(e, &request_id))?;
    Ok(Json(json!({ "deactivated": true })))
}

fn require_admin(principal: &CurrentPrincipal, request_id: &RequestId) -> Result<(), ApiError> {
    if principal.0.role.is_admin() {
        Ok(())
    } else {
        Err(ApiError::new(
            GatewayError::forbidden("admin role required"),
            request_id,
        ))
    }
}
