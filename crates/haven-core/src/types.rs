use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique identifier for a conversation (UUIDv7 — time-sortable for easier
/// log correlation).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConversationId(pub String);

impl ConversationId {
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Default for ConversationId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<String> for ConversationId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ConversationId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Unique identifier for a message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub String);

impl MessageId {
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<String> for MessageId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for MessageId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Per-request correlation id. An inbound X-Request-ID header is honored
/// when it is short and printable; otherwise a fresh UUIDv4 is minted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestId(pub String);

impl RequestId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Accept a client-supplied id only when well-formed: 1..=128 chars,
    /// ASCII alphanumeric plus `-` and `_`.
    pub fn from_header(value: Option<&str>) -> Self {
        match value {
            Some(v)
                if !v.is_empty()
                    && v.len() <= 128
                    && v.chars()
                        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') =>
            {
                Self(v.to_string())
            }
            _ => Self::generate(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Principal role hierarchy: admin > user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PrincipalRole {
    Admin,
    #[default]
    User,
}

impl PrincipalRole {
    pub fn is_admin(&self) -> bool {
        matches!(self, PrincipalRole::Admin)
    }

    /// Map issuer realm roles to the stored role: first match from the fixed
    /// precedence list wins.
    pub fn from_claim_roles<S: AsRef<str>>(roles: &[S]) -> Self {
        for candidate in [PrincipalRole::Admin, PrincipalRole::User] {
            if roles.iter().any(|r| r.as_ref() == candidate.as_str()) {
                return candidate;
            }
        }
        PrincipalRole::User
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PrincipalRole::Admin => "admin",
            PrincipalRole::User => "user",
        }
    }
}

impl fmt::Display for PrincipalRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PrincipalRole {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "admin" => Ok(PrincipalRole::Admin),
            "user" => Ok(PrincipalRole::User),
            other => Err(format!("unknown role: {}", other)),
        }
    }
}

/// Who produced a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
    Tool,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::System => "system",
            MessageRole::Tool => "tool",
        }
    }
}

impl fmt::Display for MessageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MessageRole {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "user" => Ok(MessageRole::User),
            "assistant" => Ok(MessageRole::Assistant),
            "system" => Ok(MessageRole::System),
            "tool" => Ok(MessageRole::Tool),
            other => Err(format!("unknown message role: {}", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_id_honors_well_formed_header() {
        let id = RequestId::from_header(Some("abc-123_XYZ"));
        assert_eq!(id.as_str(), "abc-123_XYZ");
    }

    #[test]
    fn request_id_rejects_malformed_header() {
        let id = RequestId::from_header(Some("has spaces and\nnewlines"));
        assert_ne!(id.as_str(), "has spaces and\nnewlines");
        assert_eq!(RequestId::from_header(None).0.len(), 36);
        let long = "x".repeat(200);
        assert_ne!(RequestId::from_header(Some(&long)).as_str(), long);
    }

    #[test]
    fn role_precedence_prefers_admin() {
        assert_eq!(
            PrincipalRole::from_claim_roles(&["user", "admin"]),
            PrincipalRole::Admin
        );
        assert_eq!(
            PrincipalRole::from_claim_roles(&["user"]),
            PrincipalRole::User
        );
        assert_eq!(
            PrincipalRole::from_claim_roles(&["offline_access", "uma_authorization"]),
            PrincipalRole::User
        );
    }

    #[test]
    fn message_role_round_trips() {
        for role in [
            MessageRole::User,
            MessageRole::Assistant,
            MessageRole::System,
            MessageRole::Tool,
        ] {
            assert_eq!(role.as_str().parse::<MessageRole>().unwrap(), role);
        }
        assert!("robot".parse::<MessageRole>().is_err());
    }
}
