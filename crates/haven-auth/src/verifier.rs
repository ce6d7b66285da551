use jsonwebtoken::{decode, decode_header, DecodingKey, Validation};
use tracing::{debug, warn};

use haven_core::config::JwtConfig;

use crate::claims::Claims;
use crate::error::{AuthError, Result};
use crate::jwks::JwksCache;

/// Source of decoding keys: the issuer's JWKS endpoint, or a static key
/// injected by tests.
enum KeySource {
    Jwks(JwksCache),
    Static(DecodingKey, jsonwebtoken::Algorithm),
}

/// Verifies bearer credentials against the configured issuer.
///
/// Checks signature, `exp`, `nbf` (with configured leeway), `iss`, and `aud`
/// before handing back the extracted claims.
pub struct TokenVerifier {
    key_source: KeySource,
    issuer: String,
    audience: String,
    leeway_seconds: u64,
}

impl TokenVerifier {
    pub fn new(config: &JwtConfig) -> Self {
        Self {
            key_source: KeySource::Jwks(JwksCache::new(config.jwks_url.clone())),
            issuer: config.issuer.clone(),
            audience: config.audience.clone(),
            leeway_seconds: config.leeway_seconds,
        }
    }

    /// Bypass the JWKS cache with a fixed key (tests only).
    pub fn with_static_key(
        config: &JwtConfig,
        key: DecodingKey,
        alg: jsonwebtoken::Algorithm,
    ) -> Self {
        Self {
            key_source: KeySource::Static(key, alg),
            issuer: config.issuer.clone(),
            audience: config.audience.clone(),
            leeway_seconds: config.leeway_seconds,
        }
    }

    /// Verify a bearer token and return its claims.
    pub async fn verify(&self, token: &str) -> Result<Claims> {
        let header = decode_header(token)
            .map_err(|e| AuthError::InvalidCredential(format!("bad token header: {}", e)))?;

        let (decoding_key, algorithm) = match &self.key_source {
            KeySource::Static(key, alg) => (key.clone(), *alg),
            KeySource::Jwks(jwks) => {
                let kid = header.kid.as_deref().ok_or_else(|| {
                    AuthError::InvalidCredential("token header missing 'kid'".to_string())
                })?;
                (jwks.get_key(kid).await?, header.alg)
            }
        };

        let mut validation = Validation::new(algorithm);
        validation.set_issuer(&[&self.issuer]);
        validation.set_audience(&[&self.audience]);
        validation.leeway = self.leeway_seconds;
        validation.validate_nbf = true;

        let token_data =
            decode::<Claims>(token, &decoding_key, &validation).map_err(|e| {
                use jsonwebtoken::errors::ErrorKind;
                let err = match e.kind() {
                    ErrorKind::ExpiredSignature => AuthError::CredentialExpired,
                    ErrorKind::InvalidIssuer => {
                        AuthError::CredentialRejected("issuer mismatch".to_string())
                    }
                    ErrorKind::InvalidAudience => {
                        AuthError::CredentialRejected("audience mismatch".to_string())
                    }
                    ErrorKind::ImmatureSignature => {
                        AuthError::CredentialRejected("token not yet valid".to_string())
                    }
                    _ => AuthError::InvalidCredential(e.to_string()),
                };
                warn!(error = %err, "credential verification failed");
                err
            })?;

        debug!(sub = %token_data.claims.sub, "credential verified");
        Ok(token_data.claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
    use serde_json::json;

    fn test_config() -> JwtConfig {
        JwtConfig {
            issuer: "https://idp.test/realms/haven".to_string(),
            audience: "haven".to_string(),
            jwks_url: "https://idp.test/certs".to_string(),
            leeway_seconds: 30,
            token_url: None,
            client_id: "haven-gateway".to_string(),
        }
    }

    fn verifier() -> TokenVerifier {
        TokenVerifier::with_static_key(
            &test_config(),
            DecodingKey::from_secret(b"test-secret"),
            Algorithm::HS256,
        )
    }

    fn sign(claims: serde_json::Value) -> String {
        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(b"test-secret"),
        )
        .unwrap()
    }

    fn valid_claims() -> serde_json::Value {
        let now = chrono::Utc::now().timestamp();
        json!({
            "sub": "subject-1",
            "iss": "https://idp.test/realms/haven",
            "aud": "haven",
            "exp": now + 600,
            "iat": now,
            "email": "alice@example.com",
            "preferred_username": "alice",
            "realm_access": { "roles": ["user"] },
        })
    }

    #[tokio::test]
    async fn accepts_valid_token() {
        let claims = verifier().verify(&sign(valid_claims())).await.unwrap();
        assert_eq!(claims.sub, "subject-1");
        assert_eq!(claims.preferred_username.as_deref(), Some("alice"));
        assert_eq!(claims.realm_access.roles, vec!["user"]);
    }

    #[tokio::test]
    async fn rejects_expired_token() {
        let mut claims = valid_claims();
        claims["exp"] = json!(chrono::Utc::now().timestamp() - 3600);
        let err = verifier().verify(&sign(claims)).await.unwrap_err();
        assert!(matches!(err, AuthError::CredentialExpired));
    }

    #[tokio::test]
    async fn rejects_wrong_issuer() {
        let mut claims = valid_claims();
        claims["iss"] = json!("https://evil.test");
        let err = verifier().verify(&sign(claims)).await.unwrap_err();
        assert!(matches!(err, AuthError::CredentialRejected(_)));
    }

    #[tokio::test]
    async fn rejects_wrong_audience() {
        let mut claims = valid_claims();
        claims["aud"] = json!("other-service");
        let err = verifier().verify(&sign(claims)).await.unwrap_err();
        assert!(matches!(err, AuthError::CredentialRejected(_)));
    }

    #[tokio::test]
    async fn rejects_garbage() {
        let err = verifier().verify("not-a-token").await.unwrap_err();
        assert!(matches!(err, AuthError::InvalidCredential(_)));
    }

    #[tokio::test]
    async fn rejects_tampered_signature() {
        let token = sign(valid_claims());
        let tampered = format!("{}x", token);
        let err = verifier().verify(&tampered).await.unwrap_err();
        assert!(matches!(err, AuthError::InvalidCredential(_)));
    }
}
