use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{HeaderMap, HeaderValue},
    middleware::Next,
    response::{IntoResponse, Response},
};

use haven_core::error::GatewayError;
use haven_core::types::RequestId;

use crate::app::{AppState, CurrentPrincipal};
use crate::error::ApiError;

/// Outermost layer: every request gets a correlation id. An inbound
/// X-Request-ID is honored when well-formed; the id is echoed on the
/// response and lands in every error envelope.
pub async fn request_id_layer(mut req: Request, next: Next) -> Response {
    let request_id = RequestId::from_header(
        req.headers()
            .get("x-request-id")
            .and_then(|v| v.to_str().ok()),
    );
    req.extensions_mut().insert(request_id.clone());

    let mut response = next.run(req).await;
    if let Ok(value) = HeaderValue::from_str(request_id.as_str()) {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}

/// Credential verification for every route not on the bypass list.
///
/// The stream endpoint is bypassed on purpose: its token was minted after
/// an authenticated prepare step and is single-use and short-lived — the
/// token IS the capability.
pub async fn auth_layer(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Response {
    let path = req.uri().path();
    if state
        .config
        .auth
        .bypass_prefixes
        .iter()
        .any(|prefix| path.starts_with(prefix.as_str()))
    {
        return next.run(req).await;
    }

    let request_id = req
        .extensions()
        .get::<RequestId>()
        .cloned()
        .unwrap_or_else(RequestId::generate);

    let Some(token) = extract_bearer(req.headers()) else {
        return ApiError::new(
            GatewayError::auth("INVALID_CREDENTIAL", "missing bearer credential"),
            &request_id,
        )
        .into_response();
    };
    let token = token.to_string();

    let claims = match state.verifier.verify(&token).await {
        Ok(claims) => claims,
        Err(e) => return ApiError::new(e, &request_id).into_response(),
    };

    match state.principals.resolve(&claims) {
        Ok(principal) if principal.active => {
            req.extensions_mut()
                .insert(CurrentPrincipal(Arc::new(principal)));
            next.run(req).await
        }
        Ok(_) => ApiError::new(
            GatewayError::forbidden("principal is deactivated"),
            &request_id,
        )
        .into_response(),
        Err(e) => ApiError::new(e, &request_id).into_response(),
    }
}

pub(crate) fn extract_bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}
