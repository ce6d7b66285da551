//! Credential exchange and verification — POST /api/auth/login, /api/auth/verify.
//!
//! Login forwards the resource-owner credentials to the identity provider's
//! token endpoint and mirrors the issued tokens back, together with the
//! locally resolved principal. The gateway never stores passwords.

use std::sync::Arc;

use axum::{extract::State, http::HeaderMap, Extension, Json};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::warn;

use haven_core::error::GatewayError;
use haven_core::types::RequestId;

use crate::app::AppState;
use crate::error::ApiError;
use crate::middleware::extract_bearer;

#[derive(Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Serialize)]
pub struct LoginResponse {
    pub access_token: String,
    pub token_type: String,
    pub expires_in: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    pub user: serde_json::Value,
}

#[derive(Deserialize)]
struct IdpTokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: u64,
    #[serde(default)]
    refresh_token: Option<String>,
}

pub async fn login_handler(
    State(state): State<Arc<AppState>>,
    Extension(request_id): Extension<RequestId>,
    Json(req): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, ApiError> {
    let fail = |e: GatewayError| ApiError::new(e, &request_id);

    let token_url = state.config.jwt.token_url.as_deref().ok_or_else(|| {
        fail(GatewayError::configuration(
            "AUTH_EXCHANGE_DISABLED",
            "jwt.token_url is not configured",
        ))
    })?;

    let form = [
        ("grant_type", "password"),
        ("client_id", state.config.jwt.client_id.as_str()),
        ("username", req.username.as_str()),
        ("password", req.password.as_str()),
    ];

    let resp = state
        .idp_client
        .post(token_url)
        .form(&form)
        .send()
        .await
        .map_err(|e| fail(GatewayError::unavailable("IDP_UNREACHABLE", e.to_string())))?;

    if resp.status().as_u16() == 401 || resp.status().as_u16() == 400 {
        return Err(fail(GatewayError::auth(
            "INVALID_CREDENTIAL",
            "username or password rejected by the identity provider",
        )));
    }
    if !resp.status().is_success() {
        let status = resp.status().as_u16();
        warn!(status, "identity provider token endpoint error");
        return Err(fail(GatewayError::unavailable(
            "IDP_UNREACHABLE",
            format!("identity provider returned {}", status),
        )));
    }

    let tokens: IdpTokenResponse = resp
        .json()
        .await
        .map_err(|e| fail(GatewayError::unavailable("IDP_UNREACHABLE", e.to_string())))?;

    // Verify what the issuer handed us and provision the principal now so
    // the first authenticated request doesn't pay for it.
    let claims = state
        .verifier
        .verify(&tokens.access_token)
        .await
        .map_err(|e| fail(e.into()))?;
    let principal = state
        .principals
        .resolve(&claims)
        .map_err(|e| fail(e.into()))?;

    Ok(Json(LoginResponse {
        access_token: tokens.access_token,
        token_type: "Bearer".to_string(),
        expires_in: tokens.expires_in,
        refresh_token: tokens.refresh_token,
        user: json!(principal),
    }))
}

/// POST /api/auth/verify — reports credential validity without failing the
/// request, which is why this route sits on the auth bypass list.
pub async fn verify_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Json<serde_json::Value> {
    let Some(token) = extract_bearer(&headers) else {
        return Json(json!({ "valid": false }));
    };

    match state.verifier.verify(token).await {
        Ok(claims) => match state.principals.resolve(&claims) {
            Ok(principal) if principal.active => {
                Json(json!({ "valid": true, "user": principal }))
            }
            _ => Json(json!({ "valid": false })),
        },
        Err(_) => Json(json!({ "valid": false })),
    }
}
