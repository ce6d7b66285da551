use serde::{Deserialize, Serialize};
use std::fmt;

/// Kinds of work the persistence worker consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    PersistAssistantMessage,
    CleanupExpiredSessions,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::PersistAssistantMessage => "persist_assistant_message",
            JobKind::CleanupExpiredSessions => "cleanup_expired_sessions",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "persist_assistant_message" => Ok(JobKind::PersistAssistantMessage),
            "cleanup_expired_sessions" => Ok(JobKind::CleanupExpiredSessions),
            other => Err(format!("unknown job kind: {}", other)),
        }
    }
}

/// Payload for `persist_assistant_message`.
///
/// `user_message_id` is the idempotency key: a second job carrying the same
/// id writes nothing. `fallback_token_count` is the coordinator's local
/// count, used only when the provider attested no usage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistAssistantMessage {
    pub conversation_id: String,
    pub user_message_id: String,
    pub content: String,
    #[serde(default)]
    pub reasoning: Option<String>,
    #[serde(default)]
    pub raw: Option<String>,
    #[serde(default)]
    pub input_tokens: u32,
    #[serde(default)]
    pub output_tokens: u32,
    #[serde(default)]
    pub total_tokens: u32,
    #[serde(default)]
    pub fallback_token_count: u32,
    pub model: String,
    #[serde(default)]
    pub elapsed_ms: u64,
}

/// A claimed row from the jobs table.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,
    pub kind: JobKind,
    pub payload: serde_json::Value,
    pub attempts: u32,
}
