use serde::Deserialize;

/// Claims extracted from a verified credential. Only the fields the gateway
/// acts on are captured; everything else in the token is ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct Claims {
    /// Issuer subject id — the stable external identity key.
    pub sub: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub preferred_username: Option<String>,
    #[serde(default)]
    pub realm_access: RealmAccess,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RealmAccess {
    #[serde(default)]
    pub roles: Vec<String>,
}

impl Claims {
    /// Display name preference: username, then email, then the subject id.
    pub fn display_name(&self) -> &str {
        self.preferred_username
            .as_deref()
            .or(self.email.as_deref())
            .unwrap_or(&self.sub)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_name_fallback_chain() {
        let mut claims: Claims = serde_json::from_value(serde_json::json!({
            "sub": "sub-1",
            "email": "a@example.com",
            "preferred_username": "alice",
        }))
        .unwrap();
        assert_eq!(claims.display_name(), "alice");
        claims.preferred_username = None;
        assert_eq!(claims.display_name(), "a@example.com");
        claims.email = None;
        assert_eq!(claims.display_name(), "sub-1");
    }

    #[test]
    fn missing_realm_access_defaults_empty() {
        let claims: Claims =
            serde_json::from_value(serde_json::json!({ "sub": "s" })).unwrap();
        assert!(claims.realm_access.roles.is_empty());
    }
}
