use serde::Serialize;
use serde_json::json;
use thiserror::Error;

/// Error category — the stable taxonomy every non-2xx response falls into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    ValidationError,
    AuthError,
    NotFound,
    ContextLimitError,
    RateLimitError,
    ModelError,
    ResourceError,
    ServiceUnavailable,
    ConfigurationError,
    InternalError,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::ValidationError => "validation_error",
            ErrorCategory::AuthError => "auth_error",
            ErrorCategory::NotFound => "not_found",
            ErrorCategory::ContextLimitError => "context_limit_error",
            ErrorCategory::RateLimitError => "rate_limit_error",
            ErrorCategory::ModelError => "model_error",
            ErrorCategory::ResourceError => "resource_error",
            ErrorCategory::ServiceUnavailable => "service_unavailable",
            ErrorCategory::ConfigurationError => "configuration_error",
            ErrorCategory::InternalError => "internal_error",
        }
    }
}

/// The one error type that crosses crate boundaries. Per-crate error enums
/// convert into this before reaching a handler, so every failure carries a
/// category, a stable machine code, and the envelope extras.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct GatewayError {
    pub category: ErrorCategory,
    pub code: &'static str,
    pub message: String,
    pub details: Option<serde_json::Value>,
    pub suggestions: Vec<String>,
    pub retryable: bool,
    /// HTTP status when the category alone is not enough (auth 401 vs 403,
    /// model_error 404 vs 422).
    status_override: Option<u16>,
}

impl GatewayError {
    fn new(category: ErrorCategory, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            category,
            code,
            message: message.into(),
            details: None,
            suggestions: Vec::new(),
            retryable: false,
            status_override: None,
        }
    }

    pub fn validation(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::ValidationError, code, message)
    }

    pub fn auth(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::AuthError, code, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::AuthError, "FORBIDDEN", message).with_status(403)
    }

    /// Uniform not-found: the message never reveals whether the resource
    /// exists under another owner.
    pub fn not_found(what: &str) -> Self {
        Self::new(
            ErrorCategory::NotFound,
            "NOT_FOUND",
            format!("{} not found", what),
        )
    }

    pub fn context_limit(details: serde_json::Value, suggestions: Vec<String>) -> Self {
        let mut err = Self::new(
            ErrorCategory::ContextLimitError,
            "CONTEXT_OVERFLOW",
            "request would exceed the model context window",
        );
        err.details = Some(details);
        err.suggestions = suggestions;
        err
    }

    pub fn rate_limited(message: impl Into<String>, retry_after_ms: Option<u64>) -> Self {
        let mut err = Self::new(ErrorCategory::RateLimitError, "RATE_LIMITED", message);
        err.retryable = true;
        if let Some(ms) = retry_after_ms {
            err.details = Some(json!({ "retry_after_ms": ms }));
        }
        err
    }

    pub fn model_not_found(name: &str, suggestions: Vec<String>) -> Self {
        let mut err = Self::new(
            ErrorCategory::ModelError,
            "MODEL_NOT_FOUND",
            format!("model '{}' is not registered", name),
        );
        err.suggestions = suggestions;
        err.status_override = Some(404);
        err
    }

    pub fn model(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::ModelError, code, message)
    }

    pub fn resource(code: &'static str, message: impl Into<String>) -> Self {
        let mut err = Self::new(ErrorCategory::ResourceError, code, message);
        err.retryable = true;
        err
    }

    pub fn unavailable(code: &'static str, message: impl Into<String>) -> Self {
        let mut err = Self::new(ErrorCategory::ServiceUnavailable, code, message);
        err.retryable = true;
        err
    }

    pub fn configuration(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::ConfigurationError, code, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::InternalError, "INTERNAL_ERROR", message)
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status_override = Some(status);
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn with_suggestions(mut self, suggestions: Vec<String>) -> Self {
        self.suggestions = suggestions;
        self
    }

    /// HTTP status for this error.
    pub fn status(&self) -> u16 {
        if let Some(s) = self.status_override {
            return s;
        }
        match self.category {
            ErrorCategory::ValidationError => 400,
            ErrorCategory::AuthError => 401,
            ErrorCategory::NotFound => 404,
            ErrorCategory::ContextLimitError => 413,
            ErrorCategory::RateLimitError => 429,
            ErrorCategory::ModelError => 422,
            ErrorCategory::ResourceError => 503,
            ErrorCategory::ServiceUnavailable => 503,
            ErrorCategory::ConfigurationError => 500,
            ErrorCategory::InternalError => 500,
        }
    }

    /// Render the uniform JSON error body. `details` is dropped outside
    /// development so internal identifiers never leak to clients.
    pub fn to_envelope(&self, request_id: &str) -> serde_json::Value {
        let mut inner = json!({
            "type": self.category.as_str(),
            "code": self.code,
            "message": self.message,
            "request_id": request_id,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        });
        let include_details = self.category == ErrorCategory::ContextLimitError
            || self.category == ErrorCategory::RateLimitError
            || development_mode();
        if include_details {
            if let Some(ref details) = self.details {
                inner["details"] = details.clone();
            }
        }
        if !self.suggestions.is_empty() {
            inner["suggestions"] = json!(self.suggestions);
        }
        json!({ "error": inner })
    }
}

fn development_mode() -> bool {
    std::env::var("HAVEN_ENV").map(|v| v != "production").unwrap_or(true)
}

pub type Result<T> = std::result::Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_maps_to_status() {
        assert_eq!(GatewayError::validation("X", "x").status(), 400);
        assert_eq!(GatewayError::auth("X", "x").status(), 401);
        assert_eq!(GatewayError::forbidden("x").status(), 403);
        assert_eq!(GatewayError::not_found("conversation").status(), 404);
        assert_eq!(
            GatewayError::context_limit(json!({}), Vec::new()).status(),
            413
        );
        assert_eq!(GatewayError::rate_limited("x", None).status(), 429);
        assert_eq!(GatewayError::model_not_found("m", Vec::new()).status(), 404);
        assert_eq!(GatewayError::model("PROVIDER_REJECTED", "x").status(), 422);
        assert_eq!(GatewayError::unavailable("X", "x").status(), 503);
        assert_eq!(GatewayError::configuration("X", "x").status(), 500);
    }

    #[test]
    fn retryable_flags() {
        assert!(GatewayError::rate_limited("x", None).retryable);
        assert!(GatewayError::unavailable("PROVIDER_UNREACHABLE", "x").retryable);
        assert!(GatewayError::resource("CAPACITY_EXHAUSTED", "x").retryable);
        assert!(!GatewayError::validation("X", "x").retryable);
    }

    #[test]
    fn envelope_shape() {
        let err = GatewayError::model_not_found("nope", vec!["m-small".to_string()]);
        let env = err.to_envelope("req-1");
        let inner = &env["error"];
        assert_eq!(inner["type"], "model_error");
        assert_eq!(inner["code"], "MODEL_NOT_FOUND");
        assert_eq!(inner["request_id"], "req-1");
        assert_eq!(inner["suggestions"][0], "m-small");
        assert!(inner["timestamp"].as_str().is_some());
    }

    #[test]
    fn context_limit_envelope_keeps_details() {
        let err = GatewayError::context_limit(
            json!({"projected_total": 4300, "limit": 4096}),
            vec!["Start a new conversation".to_string()],
        );
        let env = err.to_envelope("req-2");
        assert_eq!(env["error"]["details"]["projected_total"], 4300);
    }
}
