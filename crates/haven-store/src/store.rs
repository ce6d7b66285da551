use std::sync::Mutex;

use chrono::SecondsFormat;
use rusqlite::Connection;
use tracing::{debug, instrument};

use haven_core::types::{ConversationId, MessageId, MessageRole};

use crate::error::{Result, StoreError};
use crate::types::{
    Conversation, ConversationFilter, ConversationPatch, ConversationStatus, Message, NewMessage,
};

const MAX_TITLE_LEN: usize = 255;
const DEFAULT_PAGE: u32 = 50;

/// Thread-safe store for conversations and their messages.
///
/// Wraps a single SQLite connection in a `Mutex`; the persistence worker
/// opens its own separate connection to the same file, so web-side and
/// worker-side writes only meet at the database's row locks.
pub struct ConversationStore {
    db: Mutex<Connection>,
}

const CONVERSATION_COLUMNS: &str = "id, principal_id, title, status, model, system_prompt, \
     metadata, message_count, total_tokens, created_at, updated_at";

const MESSAGE_COLUMNS: &str = "id, conversation_id, seq, role, content, raw_content, \
     reasoning, token_count, provider_meta, created_at";

impl ConversationStore {
    /// Wrap an already-open (and `init_db`-initialised) connection.
    pub fn new(conn: Connection) -> Self {
        Self {
            db: Mutex::new(conn),
        }
    }

    /// Create a conversation owned by `principal_id`.
    #[instrument(skip(self, system_prompt, metadata))]
    pub fn create_conversation(
        &self,
        principal_id: i64,
        title: &str,
        model: Option<&str>,
        system_prompt: Option<&str>,
        metadata: Option<serde_json::Value>,
    ) -> Result<Conversation> {
        let title = validate_title(title)?;
        let id = ConversationId::new().to_string();
        let now = now_str();
        let metadata = metadata.unwrap_or_else(|| serde_json::json!({}));

        let conn = self.db.lock().unwrap();
        conn.execute(
            "INSERT INTO conversations
             (id, principal_id, title, status, model, system_prompt, metadata,
              message_count, total_tokens, created_at, updated_at)
             VALUES (?1, ?2, ?3, 'active', ?4, ?5, ?6, 0, 0, ?7, ?7)",
            rusqlite::params![
                id,
                principal_id,
                title,
                model,
                system_prompt,
                metadata.to_string(),
                now
            ],
        )?;

        get_conversation_row(&conn, principal_id, &id)?
            .ok_or(StoreError::ConversationNotFound)
    }

    /// List conversations owned by the principal, most recently updated
    /// first, tie-broken by id. Soft-deleted conversations are excluded
    /// unless the filter asks for them.
    pub fn list_conversations(
        &self,
        principal_id: i64,
        filter: &ConversationFilter,
    ) -> Result<Vec<Conversation>> {
        let mut sql = format!(
            "SELECT {} FROM conversations WHERE principal_id = ?1",
            CONVERSATION_COLUMNS
        );
        let mut params: Vec<Box<dyn rusqlite::types::ToSql>> = vec![Box::new(principal_id)];

        match filter.status {
            Some(status) => {
                params.push(Box::new(status.as_str().to_string()));
                sql.push_str(&format!(" AND status = ?{}", params.len()));
            }
            None => sql.push_str(" AND status != 'deleted'"),
        }
        if let Some(ref search) = filter.search {
            params.push(Box::new(format!("%{}%", search)));
            sql.push_str(&format!(" AND title LIKE ?{}", params.len()));
        }
        if let Some(ref after) = filter.created_after {
            params.push(Box::new(after.clone()));
            sql.push_str(&format!(" AND created_at >= ?{}", params.len()));
        }
        if let Some(ref before) = filter.created_before {
            params.push(Box::new(before.clone()));
            sql.push_str(&format!(" AND created_at <= ?{}", params.len()));
        }

        let limit = if filter.limit == 0 { DEFAULT_PAGE } else { filter.limit };
        params.push(Box::new(limit as i64));
        sql.push_str(&format!(" ORDER BY updated_at DESC, id LIMIT ?{}", params.len()));
        params.push(Box::new(filter.offset as i64));
        sql.push_str(&format!(" OFFSET ?{}", params.len()));

        let conn = self.db.lock().unwrap();
        let mut stmt = conn.prepare(&sql)?;
        let param_refs: Vec<&dyn rusqlite::types::ToSql> =
            params.iter().map(|p| p.as_ref()).collect();
        let rows = stmt.query_map(&param_refs[..], row_to_conversation)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Fetch one conversation with its messages eagerly loaded in insertion
    /// order. Missing and not-owned are indistinguishable.
    pub fn get_conversation(
        &self,
        principal_id: i64,
        id: &str,
    ) -> Result<(Conversation, Vec<Message>)> {
        let conn = self.db.lock().unwrap();
        let conversation = get_conversation_row(&conn, principal_id, id)?
            .ok_or(StoreError::ConversationNotFound)?;
        let messages = list_message_rows(&conn, id, None, u32::MAX, 0)?;
        Ok((conversation, messages))
    }

    /// Fetch the conversation row alone (no messages).
    pub fn get_conversation_meta(&self, principal_id: i64, id: &str) -> Result<Conversation> {
        let conn = self.db.lock().unwrap();
        get_conversation_row(&conn, principal_id, id)?.ok_or(StoreError::ConversationNotFound)
    }

    /// Partial update of conversation fields; bumps `updated_at`.
    #[instrument(skip(self, patch))]
    pub fn update_conversation(
        &self,
        principal_id: i64,
        id: &str,
        patch: &ConversationPatch,
    ) -> Result<Conversation> {
        if let Some(ref title) = patch.title {
            validate_title(title)?;
        }

        let conn = self.db.lock().unwrap();
        let current = get_conversation_row(&conn, principal_id, id)?
            .ok_or(StoreError::ConversationNotFound)?;

        let title = patch.title.as_deref().unwrap_or(&current.title);
        let status = patch.status.unwrap_or(current.status);
        let model = patch.model.as_deref().or(current.model.as_deref());
        let system_prompt = patch
            .system_prompt
            .as_deref()
            .or(current.system_prompt.as_deref());
        let metadata = patch
            .metadata
            .clone()
            .unwrap_or_else(|| current.metadata.clone());
        let now = now_str();

        conn.execute(
            "UPDATE conversations
             SET title = ?1, status = ?2, model = ?3, system_prompt = ?4,
                 metadata = ?5, updated_at = ?6
             WHERE id = ?7 AND principal_id = ?8",
            rusqlite::params![
                title.trim(),
                status.as_str(),
                model,
                system_prompt,
                metadata.to_string(),
                now,
                id,
                principal_id
            ],
        )?;

        get_conversation_row(&conn, principal_id, id)?.ok_or(StoreError::ConversationNotFound)
    }

    /// Soft delete by default (status → deleted); `hard` removes the
    /// conversation and every owned message.
    #[instrument(skip(self))]
    pub fn delete_conversation(&self, principal_id: i64, id: &str, hard: bool) -> Result<()> {
        let mut conn = self.db.lock().unwrap();
        if hard {
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM messages WHERE conversation_id = ?1", [id])?;
            let rows = tx.execute(
                "DELETE FROM conversations WHERE id = ?1 AND principal_id = ?2",
                rusqlite::params![id, principal_id],
            )?;
            if rows == 0 {
                return Err(StoreError::ConversationNotFound);
            }
            tx.commit()?;
        } else {
            let now = now_str();
            let rows = conn.execute(
                "UPDATE conversations SET status = 'deleted', updated_at = ?1
                 WHERE id = ?2 AND principal_id = ?3",
                rusqlite::params![now, id, principal_id],
            )?;
            if rows == 0 {
                return Err(StoreError::ConversationNotFound);
            }
        }
        Ok(())
    }

    /// Append a message and update the cached counters in one transaction.
    ///
    /// This is the only mutator of message state. `principal_id` enforces
    /// ownership on the web path; the persistence worker passes `None`
    /// because its jobs were authorized at prepare time.
    #[instrument(skip(self, message), fields(conversation_id, role = %message.role))]
    pub fn append_message(
        &self,
        principal_id: Option<i64>,
        conversation_id: &str,
        message: &NewMessage,
    ) -> Result<Message> {
        if message.content.is_empty() && message.raw_content.is_none() {
            return Err(StoreError::validation("content", "must not be empty"));
        }

        let id = MessageId::new().to_string();
        let now = now_str();
        let meta_json = match &message.provider_meta {
            Some(meta) => serde_json::to_string(meta)?,
            None => "{}".to_string(),
        };

        let mut conn = self.db.lock().unwrap();
        let tx = conn.transaction()?;

        let owned: Option<i64> = {
            let row = tx.query_row(
                "SELECT principal_id FROM conversations WHERE id = ?1",
                [conversation_id],
                |row| row.get(0),
            );
            match row {
                Ok(owner) => Some(owner),
                Err(rusqlite::Error::QueryReturnedNoRows) => None,
                Err(e) => return Err(StoreError::Database(e)),
            }
        };
        match (owned, principal_id) {
            (None, _) => return Err(StoreError::ConversationNotFound),
            (Some(owner), Some(caller)) if owner != caller => {
                return Err(StoreError::ConversationNotFound)
            }
            _ => {}
        }

        let seq: i64 = tx.query_row(
            "SELECT COALESCE(MAX(seq), 0) + 1 FROM messages WHERE conversation_id = ?1",
            [conversation_id],
            |row| row.get(0),
        )?;

        tx.execute(
            "INSERT INTO messages
             (id, conversation_id, seq, role, content, raw_content, reasoning,
              token_count, provider_meta, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            rusqlite::params![
                id,
                conversation_id,
                seq,
                message.role.as_str(),
                message.content,
                message.raw_content,
                message.reasoning,
                message.token_count,
                meta_json,
                now
            ],
        )?;

        tx.execute(
            "UPDATE conversations
             SET message_count = message_count + 1,
                 total_tokens  = total_tokens + ?1,
                 updated_at    = ?2
             WHERE id = ?3",
            rusqlite::params![message.token_count as i64, now, conversation_id],
        )?;

        tx.commit()?;
        debug!(message_id = %id, seq, "message appended");

        let conn = &*conn;
        get_message_row(conn, &id)?.ok_or(StoreError::ConversationNotFound)
    }

    /// List messages in insertion order with optional role filter and paging.
    pub fn list_messages(
        &self,
        principal_id: i64,
        conversation_id: &str,
        role: Option<MessageRole>,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Message>> {
        let conn = self.db.lock().unwrap();
        if get_conversation_row(&conn, principal_id, conversation_id)?.is_none() {
            return Err(StoreError::ConversationNotFound);
        }
        let limit = if limit == 0 { u32::MAX } else { limit };
        list_message_rows(&conn, conversation_id, role, limit, offset)
    }

    /// Ordered message history as (role, content) pairs for model calls,
    /// system prompt included when the conversation has one.
    pub fn history_for_model(&self, principal_id: i64, conversation_id: &str) -> Result<Vec<(MessageRole, String)>> {
        let (conversation, messages) = self.get_conversation(principal_id, conversation_id)?;
        let mut history = Vec::with_capacity(messages.len() + 1);
        if let Some(prompt) = conversation.system_prompt {
            history.push((MessageRole::System, prompt));
        }
        for m in messages {
            history.push((m.role, m.content));
        }
        Ok(history)
    }

    /// Liveness probe for the health endpoint.
    pub fn ping(&self) -> Result<()> {
        let conn = self.db.lock().unwrap();
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
        Ok(())
    }

    /// Idempotency probe for the persistence worker: does an assistant
    /// message referencing this originating user message already exist?
    pub fn assistant_exists_for(
        &self,
        conversation_id: &str,
        user_message_id: &str,
    ) -> Result<bool> {
        let conn = self.db.lock().unwrap();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM messages
             WHERE conversation_id = ?1 AND role = 'assistant'
               AND json_extract(provider_meta, '$.user_message_id') = ?2",
            rusqlite::params![conversation_id, user_message_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }
}

fn validate_title(title: &str) -> Result<&str> {
    let trimmed = title.trim();
    if trimmed.is_empty() {
        return Err(StoreError::validation("title", "must not be empty"));
    }
    if trimmed.len() > MAX_TITLE_LEN {
        return Err(StoreError::validation(
            "title",
            format!("must be at most {} characters", MAX_TITLE_LEN),
        ));
    }
    Ok(trimmed)
}

/// RFC 3339 with microseconds so same-second writes still order correctly.
fn now_str() -> String {
    chrono::Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn get_conversation_row(
    conn: &Connection,
    principal_id: i64,
    id: &str,
) -> Result<Option<Conversation>> {
    match conn.query_row(
        &format!(
            "SELECT {} FROM conversations WHERE id = ?1 AND principal_id = ?2",
            CONVERSATION_COLUMNS
        ),
        rusqlite::params![id, principal_id],
        row_to_conversation,
    ) {
        Ok(c) => Ok(Some(c)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(StoreError::Database(e)),
    }
}

fn get_message_row(conn: &Connection, id: &str) -> Result<Option<Message>> {
    match conn.query_row(
        &format!("SELECT {} FROM messages WHERE id = ?1", MESSAGE_COLUMNS),
        [id],
        row_to_message,
    ) {
        Ok(m) => Ok(Some(m)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(StoreError::Database(e)),
    }
}

fn list_message_rows(
    conn: &Connection,
    conversation_id: &str,
    role: Option<MessageRole>,
    limit: u32,
    offset: u32,
) -> Result<Vec<Message>> {
    let limit = limit as i64;
    let offset = offset as i64;
    match role {
        Some(r) => {
            let sql = format!(
                "SELECT {} FROM messages WHERE conversation_id = ?1 AND role = ?2
                 ORDER BY created_at, seq LIMIT ?3 OFFSET ?4",
                MESSAGE_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(
                rusqlite::params![conversation_id, r.as_str(), limit, offset],
                row_to_message,
            )?;
            Ok(rows.filter_map(|r| r.ok()).collect())
        }
        None => {
            let sql = format!(
                "SELECT {} FROM messages WHERE conversation_id = ?1
                 ORDER BY created_at, seq LIMIT ?2 OFFSET ?3",
                MESSAGE_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(
                rusqlite::params![conversation_id, limit, offset],
                row_to_message,
            )?;
            Ok(rows.filter_map(|r| r.ok()).collect())
        }
    }
}

fn row_to_conversation(row: &rusqlite::Row<'_>) -> rusqlite::Result<Conversation> {
    use std::str::FromStr;
    let status =
        ConversationStatus::from_str(&row.get::<_, String>(3)?).unwrap_or_default();
    let metadata: serde_json::Value =
        serde_json::from_str(&row.get::<_, String>(6)?).unwrap_or(serde_json::json!({}));
    Ok(Conversation {
        id: row.get(0)?,
        principal_id: row.get(1)?,
        title: row.get(2)?,
        status,
        model: row.get(4)?,
        system_prompt: row.get(5)?,
        metadata,
        message_count: row.get::<_, i64>(7)? as u32,
        total_tokens: row.get::<_, i64>(8)? as u64,
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
    })
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    use std::str::FromStr;
    let role = MessageRole::from_str(&row.get::<_, String>(3)?)
        .unwrap_or(haven_core::types::MessageRole::User);
    let provider_meta: serde_json::Value =
        serde_json::from_str(&row.get::<_, String>(8)?).unwrap_or(serde_json::json!({}));
    Ok(Message {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        seq: row.get(2)?,
        role,
        content: row.get(4)?,
        raw_content: row.get(5)?,
        reasoning: row.get(6)?,
        token_count: row.get::<_, i64>(7)? as u32,
        provider_meta,
        created_at: row.get(9)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ProviderMeta;

    fn store() -> ConversationStore {
        let conn = Connection::open_in_memory().unwrap();
        crate::db::init_db(&conn).unwrap();
        ConversationStore::new(conn)
    }

    fn assistant_message(user_message_id: &str, tokens: u32) -> NewMessage {
        NewMessage {
            role: MessageRole::Assistant,
            content: "Hello there".to_string(),
            raw_content: None,
            reasoning: None,
            token_count: tokens,
            provider_meta: Some(ProviderMeta {
                model: Some("m-small".to_string()),
                input_tokens: Some(2),
                output_tokens: Some(2),
                total_tokens: Some(tokens),
                elapsed_ms: Some(120),
                user_message_id: Some(user_message_id.to_string()),
            }),
        }
    }

    #[test]
    fn create_validates_title() {
        let store = store();
        assert!(matches!(
            store.create_conversation(1, "   ", None, None, None),
            Err(StoreError::Validation { field: "title", .. })
        ));
        let long = "x".repeat(300);
        assert!(store.create_conversation(1, &long, None, None, None).is_err());
    }

    #[test]
    fn counters_track_messages() {
        let store = store();
        let conv = store
            .create_conversation(1, "S1", Some("m-small"), None, None)
            .unwrap();

        let user = store
            .append_message(Some(1), &conv.id, &NewMessage::user("Hi", 1))
            .unwrap();
        store
            .append_message(None, &conv.id, &assistant_message(&user.id, 4))
            .unwrap();

        let (after, messages) = store.get_conversation(1, &conv.id).unwrap();
        assert_eq!(after.message_count, 2);
        assert_eq!(after.total_tokens, 5);
        assert_eq!(messages.len(), 2);
        // message_count and total_tokens equal what the messages say (P1)
        assert_eq!(
            after.total_tokens,
            messages.iter().map(|m| m.token_count as u64).sum::<u64>()
        );
        assert!(after.updated_at >= conv.updated_at);
    }

    #[test]
    fn assistant_follows_user_in_order() {
        let store = store();
        let conv = store.create_conversation(1, "turn", None, None, None).unwrap();
        let user = store
            .append_message(Some(1), &conv.id, &NewMessage::user("Hi", 1))
            .unwrap();
        let assistant = store
            .append_message(None, &conv.id, &assistant_message(&user.id, 4))
            .unwrap();
        assert!(assistant.created_at >= user.created_at);
        assert!(assistant.seq > user.seq);
        assert_eq!(assistant.conversation_id, user.conversation_id);
    }

    #[test]
    fn ownership_is_enforced_uniformly() {
        let store = store();
        let conv = store.create_conversation(1, "mine", None, None, None).unwrap();

        // Non-owner gets the same error as a missing id.
        let err_other = store.get_conversation(2, &conv.id).unwrap_err();
        let err_missing = store.get_conversation(1, "no-such-id").unwrap_err();
        assert!(matches!(err_other, StoreError::ConversationNotFound));
        assert!(matches!(err_missing, StoreError::ConversationNotFound));

        assert!(matches!(
            store.append_message(Some(2), &conv.id, &NewMessage::user("hi", 1)),
            Err(StoreError::ConversationNotFound)
        ));
    }

    #[test]
    fn soft_delete_hides_from_default_listing() {
        let store = store();
        let conv = store.create_conversation(1, "gone", None, None, None).unwrap();
        store.delete_conversation(1, &conv.id, false).unwrap();

        let visible = store
            .list_conversations(1, &ConversationFilter::default())
            .unwrap();
        assert!(visible.is_empty());

        let deleted = store
            .list_conversations(
                1,
                &ConversationFilter {
                    status: Some(ConversationStatus::Deleted),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(deleted.len(), 1);
    }

    #[test]
    fn hard_delete_removes_messages() {
        let store = store();
        let conv = store.create_conversation(1, "purge", None, None, None).unwrap();
        store
            .append_message(Some(1), &conv.id, &NewMessage::user("bye", 1))
            .unwrap();
        store.delete_conversation(1, &conv.id, true).unwrap();
        assert!(store.get_conversation(1, &conv.id).is_err());
    }

    #[test]
    fn listing_sorts_by_updated_at_desc() {
        let store = store();
        let a = store.create_conversation(1, "a", None, None, None).unwrap();
        let b = store.create_conversation(1, "b", None, None, None).unwrap();
        // Touch `a` so it sorts first again.
        store
            .append_message(Some(1), &a.id, &NewMessage::user("bump", 1))
            .unwrap();

        let listed = store
            .list_conversations(1, &ConversationFilter::default())
            .unwrap();
        assert_eq!(listed[0].id, a.id);
        assert_eq!(listed[1].id, b.id);
    }

    #[test]
    fn search_filters_by_title() {
        let store = store();
        store.create_conversation(1, "rust question", None, None, None).unwrap();
        store.create_conversation(1, "dinner plans", None, None, None).unwrap();
        let hits = store
            .list_conversations(
                1,
                &ConversationFilter {
                    search: Some("rust".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].title, "rust question");
    }

    #[test]
    fn update_patch_bumps_updated_at() {
        let store = store();
        let conv = store.create_conversation(1, "old", None, None, None).unwrap();
        let updated = store
            .update_conversation(
                1,
                &conv.id,
                &ConversationPatch {
                    title: Some("new title".to_string()),
                    model: Some("m-large".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(updated.title, "new title");
        assert_eq!(updated.model.as_deref(), Some("m-large"));
        assert!(updated.updated_at >= conv.updated_at);
    }

    #[test]
    fn list_messages_filters_by_role() {
        let store = store();
        let conv = store.create_conversation(1, "roles", None, None, None).unwrap();
        let user = store
            .append_message(Some(1), &conv.id, &NewMessage::user("q", 1))
            .unwrap();
        store
            .append_message(None, &conv.id, &assistant_message(&user.id, 2))
            .unwrap();

        let only_user = store
            .list_messages(1, &conv.id, Some(MessageRole::User), 0, 0)
            .unwrap();
        assert_eq!(only_user.len(), 1);
        assert_eq!(only_user[0].role, MessageRole::User);
    }

    #[test]
    fn assistant_exists_for_detects_duplicates() {
        let store = store();
        let conv = store.create_conversation(1, "idem", None, None, None).unwrap();
        let user = store
            .append_message(Some(1), &conv.id, &NewMessage::user("once", 1))
            .unwrap();
        assert!(!store.assistant_exists_for(&conv.id, &user.id).unwrap());
        store
            .append_message(None, &conv.id, &assistant_message(&user.id, 3))
            .unwrap();
        assert!(store.assistant_exists_for(&conv.id, &user.id).unwrap());
    }

    #[test]
    fn history_includes_system_prompt_first() {
        let store = store();
        let conv = store
            .create_conversation(1, "sys", None, Some("be terse"), None)
            .unwrap();
        store
            .append_message(Some(1), &conv.id, &NewMessage::user("hello", 1))
            .unwrap();
        let history = store.history_for_model(1, &conv.id).unwrap();
        assert_eq!(history[0].0, MessageRole::System);
        assert_eq!(history[0].1, "be terse");
        assert_eq!(history[1].0, MessageRole::User);
    }

    #[test]
    fn empty_content_is_rejected() {
        let store = store();
        let conv = store.create_conversation(1, "v", None, None, None).unwrap();
        assert!(store
            .append_message(Some(1), &conv.id, &NewMessage::user("", 0))
            .is_err());
    }
}
