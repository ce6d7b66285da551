use rusqlite::Connection;

use crate::error::Result;

/// Initialise conversation and message tables with their indices.
///
/// Safe to call on every startup — uses IF NOT EXISTS throughout.
/// `(principal_id, updated_at DESC)` keeps conversation listing O(log N);
/// `(conversation_id, created_at, seq)` preserves insertion order with the
/// per-conversation sequence number as tie-breaker.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS conversations (
            id            TEXT PRIMARY KEY,
            principal_id  INTEGER NOT NULL,
            title         TEXT NOT NULL,
            status        TEXT NOT NULL DEFAULT 'active',
            model         TEXT,
            system_prompt TEXT,
            metadata      TEXT NOT NULL DEFAULT '{}',
            message_count INTEGER NOT NULL DEFAULT 0,
            total_tokens  INTEGER NOT NULL DEFAULT 0,
            created_at    TEXT NOT NULL,
            updated_at    TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_conversations_owner
            ON conversations(principal_id, updated_at DESC);

        CREATE TABLE IF NOT EXISTS messages (
            id              TEXT PRIMARY KEY,
            conversation_id TEXT NOT NULL REFERENCES conversations(id),
            seq             INTEGER NOT NULL,
            role            TEXT NOT NULL,
            content         TEXT NOT NULL,
            raw_content     TEXT,
            reasoning       TEXT,
            token_count     INTEGER NOT NULL DEFAULT 0,
            provider_meta   TEXT NOT NULL DEFAULT '{}',
            created_at      TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_messages_order
            ON messages(conversation_id, created_at, seq);",
    )?;
    Ok(())
}
