use std::time::Duration;

use rand::RngCore;

use haven_llm::ChatMessage;

/// Transient record connecting a prepared turn to its SSE delivery.
/// Lives only in the session cache; single-use with a bounded TTL.
#[derive(Debug, Clone)]
pub struct StreamSession {
    pub token: String,
    pub conversation_id: String,
    pub principal_id: i64,
    pub model: String,
    /// Ordered history to feed the model, system prompt included.
    pub history: Vec<ChatMessage>,
    /// Already-persisted user message; doubles as the persistence
    /// idempotency key.
    pub user_message_id: String,
    pub ttl: Duration,
}

/// Mint a stream token: 32 random bytes, hex-encoded (256 bits of entropy,
/// URL-safe by construction).
pub fn mint_stream_token() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_are_long_and_url_safe() {
        let token = mint_stream_token();
        assert_eq!(token.len(), 64);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn tokens_are_unique() {
        let a = mint_stream_token();
        let b = mint_stream_token();
        assert_ne!(a, b);
    }
}
