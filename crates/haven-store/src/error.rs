use haven_core::error::GatewayError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("conversation not found")]
    ConversationNotFound,

    #[error("invalid {field}: {reason}")]
    Validation {
        field: &'static str,
        reason: String,
    },

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    pub fn validation(field: &'static str, reason: impl Into<String>) -> Self {
        StoreError::Validation {
            field,
            reason: reason.into(),
        }
    }
}

impl From<StoreError> for GatewayError {
    fn from(err: StoreError) -> Self {
        match err {
            // Uniform not_found: non-owners learn nothing about existence.
            StoreError::ConversationNotFound => GatewayError::not_found("conversation"),
            StoreError::Validation { field, reason } => GatewayError::validation(
                "INVALID_FIELD",
                format!("{}: {}", field, reason),
            ),
            StoreError::Database(e) => GatewayError::internal(e.to_string()),
            StoreError::Serialization(e) => GatewayError::internal(e.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
