use serde::{Deserialize, Serialize};

use haven_core::types::MessageRole;

/// Conversation lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConversationStatus {
    #[default]
    Active,
    Archived,
    Deleted,
}

impl ConversationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationStatus::Active => "active",
            ConversationStatus::Archived => "archived",
            ConversationStatus::Deleted => "deleted",
        }
    }
}

impl std::str::FromStr for ConversationStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "active" => Ok(ConversationStatus::Active),
            "archived" => Ok(ConversationStatus::Archived),
            "deleted" => Ok(ConversationStatus::Deleted),
            other => Err(format!("unknown conversation status: {}", other)),
        }
    }
}

/// A persistent chat session owned by exactly one principal.
#[derive(Debug, Clone, Serialize)]
pub struct Conversation {
    pub id: String,
    pub principal_id: i64,
    pub title: String,
    pub status: ConversationStatus,
    pub model: Option<String>,
    pub system_prompt: Option<String>,
    pub metadata: serde_json::Value,
    pub message_count: u32,
    pub total_tokens: u64,
    pub created_at: String,
    pub updated_at: String,
}

/// A single utterance. Immutable once written.
#[derive(Debug, Clone, Serialize)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub seq: i64,
    pub role: MessageRole,
    pub content: String,
    pub raw_content: Option<String>,
    pub reasoning: Option<String>,
    pub token_count: u32,
    pub provider_meta: serde_json::Value,
    pub created_at: String,
}

/// Input to `append_message`. Token count may be pre-attested by the
/// provider; the store treats an absent count as zero and leaves the
/// counting policy to the caller.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub role: MessageRole,
    pub content: String,
    pub raw_content: Option<String>,
    pub reasoning: Option<String>,
    pub token_count: u32,
    pub provider_meta: Option<ProviderMeta>,
}

impl NewMessage {
    pub fn user(content: impl Into<String>, token_count: u32) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
            raw_content: None,
            reasoning: None,
            token_count,
            provider_meta: None,
        }
    }

    pub fn system(content: impl Into<String>, token_count: u32) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
            raw_content: None,
            reasoning: None,
            token_count,
            provider_meta: None,
        }
    }
}

/// Provider-returned metadata persisted alongside assistant messages.
/// `user_message_id` doubles as the idempotency key for the persistence
/// worker.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elapsed_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_message_id: Option<String>,
}

/// Filters for conversation listing. Soft-deleted conversations only show
/// up when explicitly asked for via `status`.
#[derive(Debug, Clone, Default)]
pub struct ConversationFilter {
    pub status: Option<ConversationStatus>,
    pub search: Option<String>,
    pub created_after: Option<String>,
    pub created_before: Option<String>,
    pub limit: u32,
    pub offset: u32,
}

/// Partial update for conversation metadata.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConversationPatch {
    pub title: Option<String>,
    pub status: Option<ConversationStatus>,
    pub model: Option<String>,
    pub system_prompt: Option<String>,
    pub metadata: Option<serde_json::Value>,
}
