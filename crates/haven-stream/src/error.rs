use haven_core::error::GatewayError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StreamError {
    /// Token unknown or past its TTL — the caller cannot distinguish the
    /// two, matching how an attacker probing tokens sees them.
    #[error("stream token is invalid or expired")]
    TokenInvalid,

    /// Token was valid but its stream has already begun.
    #[error("stream token has already been consumed")]
    Consumed,
}

impl From<StreamError> for GatewayError {
    fn from(err: StreamError) -> Self {
        match err {
            StreamError::TokenInvalid => GatewayError::auth(
                "STREAM_TOKEN_INVALID",
                "stream token is invalid or expired",
            ),
            StreamError::Consumed => GatewayError::validation(
                "STREAM_CONSUMED",
                "stream token has already been consumed",
            ),
        }
    }
}

pub type Result<T> = std::result::Result<T, StreamError>;
