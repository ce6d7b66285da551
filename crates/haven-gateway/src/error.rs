use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

use haven_core::error::GatewayError;
use haven_core::types::RequestId;

/// A [`GatewayError`] paired with the request id it should answer under.
/// The only way a handler failure reaches the wire, so every non-2xx body
/// has the uniform envelope shape.
pub struct ApiError {
    err: GatewayError,
    request_id: RequestId,
}

impl ApiError {
    pub fn new(err: impl Into<GatewayError>, request_id: &RequestId) -> Self {
        Self {
            err: err.into(),
            request_id: request_id.clone(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.err.status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            tracing::error!(request_id = %self.request_id, code = self.err.code,
                            "request failed: {}", self.err);
        } else {
            tracing::debug!(request_id = %self.request_id, code = self.err.code,
                            "request rejected: {}", self.err);
        }
        (status, Json(self.err.to_envelope(self.request_id.as_str()))).into_response()
    }
}
