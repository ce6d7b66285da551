use haven_core::error::GatewayError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("malformed or unsigned credential: {0}")]
    InvalidCredential(String),

    #[error("credential has expired")]
    CredentialExpired,

    #[error("credential rejected: {0}")]
    CredentialRejected(String),

    #[error("unknown signing key: {0}")]
    UnknownKeyId(String),

    #[error("identity provider unreachable: {0}")]
    IdpUnreachable(String),

    #[error("principal not found: {0}")]
    PrincipalNotFound(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
}

impl From<AuthError> for GatewayError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::InvalidCredential(msg) => {
                GatewayError::auth("INVALID_CREDENTIAL", msg)
            }
            AuthError::CredentialExpired => {
                GatewayError::auth("CREDENTIAL_EXPIRED", "credential has expired")
            }
            AuthError::CredentialRejected(msg) => {
                GatewayError::auth("CREDENTIAL_REJECTED", msg)
            }
            AuthError::UnknownKeyId(kid) => GatewayError::auth(
                "INVALID_CREDENTIAL",
                format!("no signing key matches kid '{}'", kid),
            ),
            AuthError::IdpUnreachable(msg) => {
                GatewayError::unavailable("IDP_UNREACHABLE", msg)
            }
            AuthError::PrincipalNotFound(id) => {
                GatewayError::not_found("principal").with_details(serde_json::json!({ "id": id }))
            }
            AuthError::PermissionDenied(msg) => GatewayError::forbidden(msg),
            AuthError::Database(e) => GatewayError::internal(e.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, AuthError>;
