use std::collections::HashMap;
use std::time::{Duration, Instant};

use jsonwebtoken::DecodingKey;
use serde::Deserialize;
use tokio::sync::RwLock;

use crate::error::{AuthError, Result};

/// Key-id misses trigger a refetch, but never more often than this.
const MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(30);

/// Raw JWK as returned by the issuer's JWKS endpoint. Only RSA components
/// are captured; other key types are skipped at refresh time.
#[derive(Debug, Clone, Deserialize)]
struct Jwk {
    kid: Option<String>,
    kty: String,
    #[serde(default)]
    n: Option<String>,
    #[serde(default)]
    e: Option<String>,
}

#[derive(Debug, Deserialize)]
struct JwksResponse {
    keys: Vec<Jwk>,
}

/// Stored raw components so a `DecodingKey` can be rebuilt on demand
/// (`DecodingKey` does not implement Clone).
#[derive(Debug, Clone)]
struct CachedJwk {
    n: String,
    e: String,
}

impl CachedJwk {
    fn to_decoding_key(&self) -> Result<DecodingKey> {
        DecodingKey::from_rsa_components(&self.n, &self.e)
            .map_err(|e| AuthError::InvalidCredential(format!("bad issuer key: {}", e)))
    }
}

struct CacheInner {
    keys: HashMap<String, CachedJwk>,
    last_refresh: Option<Instant>,
}

/// Cache of the issuer's signing keys, indexed by `kid`.
///
/// A requested kid that is not cached triggers one refresh before failing.
/// The initial fetch is lazy: the first verification pays for it, and an
/// unreachable issuer at that point is a retryable service failure rather
/// than a credential rejection.
pub struct JwksCache {
    inner: RwLock<CacheInner>,
    jwks_url: String,
    client: reqwest::Client,
}

impl JwksCache {
    pub fn new(jwks_url: String) -> Self {
        Self {
            inner: RwLock::new(CacheInner {
                keys: HashMap::new(),
                last_refresh: None,
            }),
            jwks_url,
            client: reqwest::Client::new(),
        }
    }

    /// Retrieve the decoding key for `kid`, refreshing once on a miss.
    pub async fn get_key(&self, kid: &str) -> Result<DecodingKey> {
        {
            let cache = self.inner.read().await;
            if let Some(jwk) = cache.keys.get(kid) {
                return jwk.to_decoding_key();
            }
        }

        self.refresh().await?;

        let cache = self.inner.read().await;
        cache
            .keys
            .get(kid)
            .ok_or_else(|| AuthError::UnknownKeyId(kid.to_string()))?
            .to_decoding_key()
    }

    async fn refresh(&self) -> Result<()> {
        // Rate-limit refreshes so a flood of bad kids cannot hammer the issuer.
        {
            let cache = self.inner.read().await;
            if let Some(last) = cache.last_refresh {
                if last.elapsed() < MIN_REFRESH_INTERVAL && !cache.keys.is_empty() {
                    return Ok(());
                }
            }
        }

        let response = self
            .client
            .get(&self.jwks_url)
            .send()
            .await
            .map_err(|e| AuthError::IdpUnreachable(e.to_string()))?;

        let jwks: JwksResponse = response
            .json()
            .await
            .map_err(|e| AuthError::IdpUnreachable(format!("bad JWKS payload: {}", e)))?;

        let mut keys = HashMap::new();
        for jwk in jwks.keys {
            if jwk.kty != "RSA" {
                continue;
            }
            if let (Some(kid), Some(n), Some(e)) = (jwk.kid, jwk.n, jwk.e) {
                keys.insert(kid, CachedJwk { n, e });
            }
        }

        tracing::debug!(count = keys.len(), "JWKS refreshed");

        let mut cache = self.inner.write().await;
        cache.keys = keys;
        cache.last_refresh = Some(Instant::now());
        Ok(())
    }
}
