use std::collections::BTreeMap;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::GatewayError;

pub const DEFAULT_PORT: u16 = 8181;
pub const DEFAULT_BIND: &str = "127.0.0.1";

/// Top-level config (haven.toml + HAVEN_* env overrides).
///
/// Every section carries an explicit schema; unknown keys are rejected at
/// load time rather than silently ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HavenConfig {
    #[serde(default)]
    pub server: ServerConfig,
    pub jwt: JwtConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderConfig>,
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub context: ContextConfig,
    #[serde(default)]
    pub persistence: PersistenceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
        }
    }
}

/// Identity Verifier parameters. The issuer is an external OIDC provider
/// exposing a JWKS endpoint; `token_url` additionally enables the
/// credential-exchange login route.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JwtConfig {
    pub issuer: String,
    pub audience: String,
    pub jwks_url: String,
    #[serde(default = "default_leeway")]
    pub leeway_seconds: u64,
    pub token_url: Option<String>,
    #[serde(default = "default_client_id")]
    pub client_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuthConfig {
    /// Path prefixes that skip credential verification. The stream endpoint
    /// is listed here because its token IS the capability (minted only after
    /// an authenticated prepare step).
    #[serde(default = "default_bypass_prefixes")]
    pub bypass_prefixes: Vec<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            bypass_prefixes: default_bypass_prefixes(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// A single LLM provider slot. Known ids: "local" (Ollama-style host),
/// "anthropic", "openai".
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProviderConfig {
    #[serde(default)]
    pub enabled: bool,
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    /// Allow-list of model names. Empty means every model the provider
    /// reports.
    #[serde(default)]
    pub models: Vec<String>,
    /// Context windows for models the provider cannot report one for,
    /// keyed by model name.
    #[serde(default)]
    pub context_windows: BTreeMap<String, u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RouterConfig {
    /// Collision tie-breaker: when two providers report the same model name,
    /// the provider listed first wins and the other entry is hidden.
    #[serde(default = "default_precedence")]
    pub model_precedence: Vec<String>,
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_seconds: u64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            model_precedence: default_precedence(),
            refresh_interval_seconds: default_refresh_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StreamConfig {
    #[serde(default = "default_session_ttl")]
    pub session_ttl_seconds: u64,
    #[serde(default = "default_wallclock_cap")]
    pub wallclock_cap_seconds: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            session_ttl_seconds: default_session_ttl(),
            wallclock_cap_seconds: default_wallclock_cap(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ContextConfig {
    /// Tokens reserved for model output when checking context fit.
    /// The caller-supplied max_tokens wins when larger.
    #[serde(default = "default_headroom")]
    pub output_headroom_tokens: u32,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            output_headroom_tokens: default_headroom(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PersistenceConfig {
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            poll_interval_ms: default_poll_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryConfig {
    #[serde(default = "default_retry_initial")]
    pub initial_ms: u64,
    #[serde(default = "default_retry_factor")]
    pub factor: u32,
    #[serde(default = "default_retry_max")]
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_ms: default_retry_initial(),
            factor: default_retry_factor(),
            max_attempts: default_retry_max(),
        }
    }
}

fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}
fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_leeway() -> u64 {
    30
}
fn default_client_id() -> String {
    "haven-gateway".to_string()
}
fn default_bypass_prefixes() -> Vec<String> {
    vec![
        "/health".to_string(),
        "/stream/".to_string(),
        "/openapi".to_string(),
        // Login has no credential yet; verify reports {valid:false} itself
        // instead of failing at the middleware.
        "/api/auth/".to_string(),
    ]
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.haven/haven.db", home)
}
fn default_precedence() -> Vec<String> {
    vec![
        "local".to_string(),
        "anthropic".to_string(),
        "openai".to_string(),
    ]
}
fn default_refresh_interval() -> u64 {
    60
}
fn default_session_ttl() -> u64 {
    300
}
fn default_wallclock_cap() -> u64 {
    600
}
fn default_headroom() -> u32 {
    512
}
fn default_poll_interval() -> u64 {
    500
}
fn default_retry_initial() -> u64 {
    1000
}
fn default_retry_factor() -> u32 {
    2
}
fn default_retry_max() -> u32 {
    5
}

impl HavenConfig {
    /// Load config from a TOML file with HAVEN_* env var overrides.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. ~/.haven/haven.toml
    pub fn load(config_path: Option<&str>) -> Result<Self, GatewayError> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: HavenConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("HAVEN_").split("_"))
            .extract()
            .map_err(|e| GatewayError::configuration("INVALID_CONFIG", e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Startup validation beyond what serde can express. A hosted provider
    /// that is enabled but has no credential is a hard failure.
    pub fn validate(&self) -> Result<(), GatewayError> {
        for (id, provider) in &self.providers {
            if !provider.enabled {
                continue;
            }
            let hosted = id != "local";
            if hosted && provider.api_key.as_deref().map(str::trim).unwrap_or("").is_empty() {
                return Err(GatewayError::configuration(
                    "MISSING_PROVIDER_CREDENTIALS",
                    format!("provider '{}' is enabled but has no api_key", id),
                ));
            }
        }
        if self.persistence.retry.max_attempts == 0 {
            return Err(GatewayError::configuration(
                "INVALID_CONFIG",
                "persistence.retry.max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Ids of providers with `enabled = true`, in config order.
    pub fn enabled_providers(&self) -> Vec<&str> {
        self.providers
            .iter()
            .filter(|(_, p)| p.enabled)
            .map(|(id, _)| id.as_str())
            .collect()
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.haven/haven.toml", home)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> HavenConfig {
        HavenConfig {
            server: ServerConfig::default(),
            jwt: JwtConfig {
                issuer: "https://idp.example/realms/haven".to_string(),
                audience: "haven".to_string(),
                jwks_url: "https://idp.example/realms/haven/certs".to_string(),
                leeway_seconds: 30,
                token_url: None,
                client_id: "haven-gateway".to_string(),
            },
            auth: AuthConfig::default(),
            database: DatabaseConfig::default(),
            providers: BTreeMap::new(),
            router: RouterConfig::default(),
            stream: StreamConfig::default(),
            context: ContextConfig::default(),
            persistence: PersistenceConfig::default(),
        }
    }

    #[test]
    fn defaults_are_spec_values() {
        let cfg = minimal();
        assert_eq!(cfg.router.refresh_interval_seconds, 60);
        assert_eq!(cfg.stream.session_ttl_seconds, 300);
        assert_eq!(cfg.stream.wallclock_cap_seconds, 600);
        assert_eq!(cfg.context.output_headroom_tokens, 512);
        assert_eq!(cfg.persistence.retry.initial_ms, 1000);
        assert_eq!(cfg.persistence.retry.factor, 2);
        assert_eq!(cfg.persistence.retry.max_attempts, 5);
    }

    #[test]
    fn enabled_hosted_provider_requires_api_key() {
        let mut cfg = minimal();
        cfg.providers.insert(
            "anthropic".to_string(),
            ProviderConfig {
                enabled: true,
                base_url: None,
                api_key: None,
                models: Vec::new(),
                context_windows: BTreeMap::new(),
            },
        );
        let err = cfg.validate().unwrap_err();
        assert_eq!(err.code, "MISSING_PROVIDER_CREDENTIALS");
    }

    #[test]
    fn local_provider_needs_no_api_key() {
        let mut cfg = minimal();
        cfg.providers.insert(
            "local".to_string(),
            ProviderConfig {
                enabled: true,
                base_url: Some("http://localhost:11434".to_string()),
                api_key: None,
                models: Vec::new(),
                context_windows: BTreeMap::new(),
            },
        );
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let result: Result<HavenConfig, _> = Figment::new()
            .merge(Toml::string(
                r#"
                [jwt]
                issuer = "https://idp.example"
                audience = "haven"
                jwks_url = "https://idp.example/certs"
                not_a_real_key = true
                "#,
            ))
            .extract();
        assert!(result.is_err());
    }
}
