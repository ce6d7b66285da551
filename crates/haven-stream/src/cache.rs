use std::time::Instant;

use dashmap::DashMap;
use tracing::debug;

use haven_worker::SessionJanitor;

use crate::error::{Result, StreamError};
use crate::session::StreamSession;

/// One cache slot. After a successful claim the session body is taken but
/// the entry stays behind as a tombstone until its TTL, so a replayed token
/// gets the distinct "consumed" error instead of "invalid".
struct Entry {
    session: Option<StreamSession>,
    expires_at: Instant,
}

/// In-process KV cache for stream sessions, keyed by stream token.
///
/// The single source of truth for whether a token is valid, consumed, or
/// expired. Kept behind a narrow surface so a networked KV store could
/// replace it without touching the coordinator.
pub struct SessionCache {
    entries: DashMap<String, Entry>,
}

impl SessionCache {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Store a freshly prepared session under its token.
    pub fn insert(&self, session: StreamSession) {
        let expires_at = Instant::now() + session.ttl;
        let token = session.token.clone();
        self.entries.insert(
            token,
            Entry {
                session: Some(session),
                expires_at,
            },
        );
    }

    /// Atomically claim a session for streaming. Exactly one caller per
    /// token ever receives the session (single-use guarantee); the entry's
    /// lock in the map makes the take atomic.
    pub fn claim(&self, token: &str) -> Result<StreamSession> {
        let mut entry = match self.entries.get_mut(token) {
            Some(e) => e,
            None => return Err(StreamError::TokenInvalid),
        };

        if entry.expires_at <= Instant::now() {
            drop(entry);
            self.entries.remove(token);
            return Err(StreamError::TokenInvalid);
        }

        match entry.session.take() {
            Some(session) => {
                debug!(conversation_id = %session.conversation_id, "stream session claimed");
                Ok(session)
            }
            None => Err(StreamError::Consumed),
        }
    }

    /// Drop a session (and its tombstone) after the stream finishes.
    pub fn remove(&self, token: &str) {
        self.entries.remove(token);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for SessionCache {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionJanitor for SessionCache {
    /// Remove every expired entry. Driven by the worker's periodic cleanup
    /// job; claims also expire lazily, so this only bounds memory.
    fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        before - self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::mint_stream_token;
    use std::time::Duration;

    fn session(ttl: Duration) -> StreamSession {
        StreamSession {
            token: mint_stream_token(),
            conversation_id: "c1".to_string(),
            principal_id: 1,
            model: "m-small".to_string(),
            history: Vec::new(),
            user_message_id: "u1".to_string(),
            ttl,
        }
    }

    #[test]
    fn claim_is_single_use() {
        let cache = SessionCache::new();
        let s = session(Duration::from_secs(300));
        let token = s.token.clone();
        cache.insert(s);

        assert!(cache.claim(&token).is_ok());
        // Second claim on the same token is the distinct consumed error.
        assert!(matches!(cache.claim(&token), Err(StreamError::Consumed)));
    }

    #[test]
    fn unknown_token_is_invalid() {
        let cache = SessionCache::new();
        assert!(matches!(
            cache.claim("no-such-token"),
            Err(StreamError::TokenInvalid)
        ));
    }

    #[test]
    fn expired_token_is_invalid_not_consumed() {
        let cache = SessionCache::new();
        let s = session(Duration::from_millis(1));
        let token = s.token.clone();
        cache.insert(s);
        std::thread::sleep(Duration::from_millis(10));

        assert!(matches!(
            cache.claim(&token),
            Err(StreamError::TokenInvalid)
        ));
        // The expired entry was dropped on the failed claim.
        assert!(cache.is_empty());
    }

    #[test]
    fn sweep_removes_only_expired_entries() {
        let cache = SessionCache::new();
        cache.insert(session(Duration::from_millis(1)));
        let live = session(Duration::from_secs(300));
        let live_token = live.token.clone();
        cache.insert(live);
        std::thread::sleep(Duration::from_millis(10));

        assert_eq!(cache.sweep_expired(), 1);
        assert_eq!(cache.len(), 1);
        assert!(cache.claim(&live_token).is_ok());
    }

    #[test]
    fn remove_clears_tombstone() {
        let cache = SessionCache::new();
        let s = session(Duration::from_secs(300));
        let token = s.token.clone();
        cache.insert(s);
        cache.claim(&token).unwrap();
        cache.remove(&token);
        // With the tombstone gone the token reads as invalid again.
        assert!(matches!(
            cache.claim(&token),
            Err(StreamError::TokenInvalid)
        ));
    }
}
