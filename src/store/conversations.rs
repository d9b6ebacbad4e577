//! Write path: threads, messages, tool calls, usage, expiry

use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info};

use super::{
    now_ms, role_from_sql, Conversation, ConversationState, ConversationStore, StoreError,
    StoredMessage, ToolCallMeta, ToolCallRecord,
};
use crate::llm::{Role, Usage};
use crate::metrics::STORE_SWEPT;
use crate::security::{redact, redact_json};

const CONVERSATION_COLUMNS: &str =
    "id, thread_key, channel, user_id, created_at, updated_at, input_tokens, output_tokens";

fn conversation_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Conversation> {
    Ok(Conversation {
        id: row.get(0)?,
        thread_key: row.get(1)?,
        channel: row.get(2)?,
        user_id: row.get(3)?,
        created_at: row.get(4)?,
        updated_at: row.get(5)?,
        usage: Usage::new(row.get::<_, i64>(6)? as u64, row.get::<_, i64>(7)? as u64),
    })
}

pub(super) fn find_conversation(
    conn: &Connection,
    thread_key: &str,
    channel: &str,
) -> Result<Option<Conversation>, StoreError> {
    let sql = format!(
        "SELECT {} FROM conversations WHERE thread_key = ?1 AND channel = ?2",
        CONVERSATION_COLUMNS
    );
    Ok(conn
        .query_row(&sql, params![thread_key, channel], conversation_from_row)
        .optional()?)
}

/// Most recent `limit` messages, oldest first
pub(super) fn recent_messages(
    conn: &Connection,
    conversation_id: i64,
    limit: usize,
) -> Result<Vec<StoredMessage>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT id, role, content, created_at FROM messages
         WHERE conversation_id = ?1
         ORDER BY id DESC
         LIMIT ?2",
    )?;
    let mut messages = stmt
        .query_map(params![conversation_id, limit as i64], |row| {
            Ok(StoredMessage {
                id: row.get(0)?,
                role: role_from_sql(1, row.get(1)?)?,
                content: row.get(2)?,
                created_at: row.get(3)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    // Reverse so oldest first
    messages.reverse();
    Ok(messages)
}

/// Most recent `limit` tool calls, newest first
pub(super) fn recent_tool_calls(
    conn: &Connection,
    conversation_id: i64,
    limit: usize,
) -> Result<Vec<ToolCallRecord>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT id, conversation_id, tool_name, input, output_preview, timestamp_ms, duration_ms, success
         FROM tool_calls
         WHERE conversation_id = ?1
         ORDER BY id DESC
         LIMIT ?2",
    )?;
    let calls = stmt
        .query_map(params![conversation_id, limit as i64], |row| {
            Ok(ToolCallRecord {
                id: row.get(0)?,
                conversation_id: row.get(1)?,
                tool_name: row.get(2)?,
                input: row.get(3)?,
                output_preview: row.get(4)?,
                timestamp_ms: row.get(5)?,
                duration_ms: row.get(6)?,
                success: row.get::<_, i64>(7)? != 0,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(calls)
}

fn delete_conversation_rows(conn: &Connection, id: i64) -> Result<bool, StoreError> {
    conn.execute("DELETE FROM messages WHERE conversation_id = ?1", params![id])?;
    conn.execute("DELETE FROM tool_calls WHERE conversation_id = ?1", params![id])?;
    let deleted = conn.execute("DELETE FROM conversations WHERE id = ?1", params![id])?;
    Ok(deleted > 0)
}

impl ConversationStore {
    /// Append a user message to the thread, creating it if absent or expired
    ///
    /// # Returns
    /// The conversation and its recent history, including `text`.
    pub fn create_or_get(
        &self,
        thread_key: &str,
        channel: &str,
        user_id: &str,
        text: &str,
    ) -> Result<ConversationState, StoreError> {
        self.create_or_get_at(thread_key, channel, user_id, text, now_ms())
    }

    /// `create_or_get` with an explicit clock
    pub fn create_or_get_at(
        &self,
        thread_key: &str,
        channel: &str,
        user_id: &str,
        text: &str,
        now: i64,
    ) -> Result<ConversationState, StoreError> {
        let mut conn = self.lock_conn();
        let tx = conn.transaction()?;

        let mut existing = find_conversation(&tx, thread_key, channel)?;
        if let Some(stale) = existing.as_ref().filter(|c| now - c.updated_at > self.ttl_ms()) {
            debug!(thread = thread_key, channel, conversation_id = stale.id, "Thread expired, starting fresh");
            delete_conversation_rows(&tx, stale.id)?;
            existing = None;
        }

        let created = existing.is_none();
        let id = match existing {
            Some(conversation) => conversation.id,
            None => {
                tx.execute(
                    "INSERT INTO conversations (thread_key, channel, user_id, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?4)",
                    params![thread_key, channel, user_id, now],
                )?;
                tx.last_insert_rowid()
            }
        };

        tx.execute(
            "INSERT INTO messages (conversation_id, role, content, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![id, Role::User.as_str(), text, now],
        )?;
        tx.execute(
            "UPDATE conversations SET updated_at = ?1 WHERE id = ?2",
            params![now, id],
        )?;

        let conversation = find_conversation(&tx, thread_key, channel)?.ok_or(StoreError::NotFound(id))?;
        let messages = recent_messages(&tx, id, self.config.history_limit.max(1))?;
        tx.commit()?;

        if created {
            info!(thread = thread_key, channel, user = user_id, conversation_id = id, "Conversation created");
        }
        Ok(ConversationState {
            conversation,
            messages,
            created,
        })
    }

    /// Persist the assistant's reply
    pub fn append_assistant(&self, conversation_id: i64, text: &str) -> Result<(), StoreError> {
        let now = now_ms();
        let mut conn = self.lock_conn();
        let tx = conn.transaction()?;
        let updated = tx.execute(
            "UPDATE conversations SET updated_at = ?1 WHERE id = ?2",
            params![now, conversation_id],
        )?;
        if updated == 0 {
            return Err(StoreError::NotFound(conversation_id));
        }
        tx.execute(
            "INSERT INTO messages (conversation_id, role, content, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![conversation_id, Role::Assistant.as_str(), text, now],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Append one tool call to the audit log
    ///
    /// Input and preview are redacted before writing.
    pub fn log_tool_call(
        &self,
        conversation_id: i64,
        tool_name: &str,
        input: &serde_json::Value,
        output_preview: &str,
        meta: ToolCallMeta,
    ) -> Result<i64, StoreError> {
        let mut input = input.clone();
        redact_json(&mut input);
        let preview = redact(output_preview);

        let conn = self.lock_conn();
        conn.execute(
            "INSERT INTO tool_calls
                (conversation_id, tool_name, input, output_preview, timestamp_ms, duration_ms, success)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                conversation_id,
                tool_name,
                input.to_string(),
                &*preview,
                now_ms(),
                meta.duration_ms.map(|d| d as i64),
                meta.success as i64,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Add a turn's tokens to the conversation's running total
    pub fn record_usage(&self, conversation_id: i64, usage: Usage) -> Result<(), StoreError> {
        let conn = self.lock_conn();
        let updated = conn.execute(
            "UPDATE conversations
             SET input_tokens = input_tokens + ?1, output_tokens = output_tokens + ?2
             WHERE id = ?3",
            params![usage.input_tokens as i64, usage.output_tokens as i64, conversation_id],
        )?;
        if updated == 0 {
            return Err(StoreError::NotFound(conversation_id));
        }
        Ok(())
    }

    /// Most recent tool calls for a conversation, newest first
    pub fn tool_calls(&self, conversation_id: i64, limit: usize) -> Result<Vec<ToolCallRecord>, StoreError> {
        let conn = self.lock_conn();
        recent_tool_calls(&conn, conversation_id, limit)
    }

    pub fn conversation(&self, thread_key: &str, channel: &str) -> Result<Option<Conversation>, StoreError> {
        let conn = self.lock_conn();
        find_conversation(&conn, thread_key, channel)
    }

    /// Remove a conversation with its messages and tool calls
    pub fn delete_conversation(&self, conversation_id: i64) -> Result<bool, StoreError> {
        let mut conn = self.lock_conn();
        let tx = conn.transaction()?;
        let deleted = delete_conversation_rows(&tx, conversation_id)?;
        tx.commit()?;
        Ok(deleted)
    }

    /// Delete every conversation idle longer than the TTL
    pub fn sweep_expired(&self) -> Result<usize, StoreError> {
        self.sweep_expired_at(now_ms())
    }

    /// `sweep_expired` with an explicit clock
    pub fn sweep_expired_at(&self, now: i64) -> Result<usize, StoreError> {
        let cutoff = now - self.ttl_ms();
        let mut conn = self.lock_conn();
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM messages WHERE conversation_id IN
                (SELECT id FROM conversations WHERE updated_at < ?1)",
            params![cutoff],
        )?;
        tx.execute(
            "DELETE FROM tool_calls WHERE conversation_id IN
                (SELECT id FROM conversations WHERE updated_at < ?1)",
            params![cutoff],
        )?;
        let swept = tx.execute("DELETE FROM conversations WHERE updated_at < ?1", params![cutoff])?;
        tx.commit()?;

        if swept > 0 {
            STORE_SWEPT.inc_by(swept as u64);
            info!(swept, "Expired conversations removed");
        }
        Ok(swept)
    }

    /// Move a conversation's clock back, for expiry tests
    #[cfg(test)]
    pub(crate) fn backdate(&self, conversation_id: i64, by_ms: i64) -> Result<(), StoreError> {
        let conn = self.lock_conn();
        conn.execute(
            "UPDATE conversations SET updated_at = updated_at - ?1, created_at = created_at - ?1 WHERE id = ?2",
            params![by_ms, conversation_id],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreConfig;
    use serde_json::json;

    fn store() -> ConversationStore {
        ConversationStore::open_in_memory(StoreConfig::default()).unwrap()
    }

    #[test]
    fn test_create_then_append() {
        let store = store();
        let first = store.create_or_get("t1", "ops", "alice", "is nginx up?").unwrap();
        assert!(first.created);
        assert_eq!(first.messages.len(), 1);
        assert!(first.prior_history().is_empty());

        store.append_assistant(first.conversation.id, "yes").unwrap();
        let second = store.create_or_get("t1", "ops", "alice", "and docker?").unwrap();
        assert!(!second.created);
        assert_eq!(second.conversation.id, first.conversation.id);
        let roles: Vec<_> = second.messages.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::User, Role::Assistant, Role::User]);
        assert_eq!(second.prior_history().len(), 2);
    }

    #[test]
    fn test_same_thread_key_different_channel() {
        let store = store();
        let a = store.create_or_get("t1", "ops", "alice", "a").unwrap();
        let b = store.create_or_get("t1", "dev", "alice", "b").unwrap();
        assert_ne!(a.conversation.id, b.conversation.id);
    }

    #[test]
    fn test_expired_thread_starts_fresh() {
        let store = store();
        let first = store.create_or_get("t1", "ops", "alice", "old").unwrap();
        store.backdate(first.conversation.id, 86_400_001 + 1_000).unwrap();

        let again = store.create_or_get("t1", "ops", "alice", "new").unwrap();
        assert!(again.created);
        assert_eq!(again.messages.len(), 1);
        assert_eq!(again.messages[0].content, "new");
    }

    #[test]
    fn test_sweep_expired() {
        let store = store();
        let old = store.create_or_get("old", "ops", "alice", "x").unwrap();
        store
            .log_tool_call(old.conversation.id, "disk_usage", &json!({}), "ok", ToolCallMeta::default())
            .unwrap();
        store.create_or_get("fresh", "ops", "alice", "y").unwrap();
        store.backdate(old.conversation.id, 2 * 86_400_000).unwrap();

        assert_eq!(store.sweep_expired().unwrap(), 1);
        assert!(store.conversation("old", "ops").unwrap().is_none());
        assert!(store.tool_calls(old.conversation.id, 10).unwrap().is_empty());
        assert!(store.conversation("fresh", "ops").unwrap().is_some());
        assert_eq!(store.sweep_expired().unwrap(), 0);
    }

    #[test]
    fn test_tool_calls_newest_first_with_redaction() {
        let store = store();
        let state = store.create_or_get("t", "c", "u", "q").unwrap();
        let id = state.conversation.id;
        store
            .log_tool_call(id, "read_file", &json!({"path": "/etc/app.conf"}), "api_key=abc123", ToolCallMeta {
                duration_ms: Some(12),
                success: true,
            })
            .unwrap();
        store
            .log_tool_call(id, "run_command", &json!({"program": "rm"}), "rejected", ToolCallMeta {
                duration_ms: Some(1),
                success: false,
            })
            .unwrap();

        let calls = store.tool_calls(id, 10).unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].tool_name, "run_command");
        assert!(!calls[0].success);
        assert_eq!(calls[1].output_preview, "api_key=[REDACTED]");
        assert_eq!(calls[1].duration_ms, Some(12));
        assert_eq!(store.tool_calls(id, 1).unwrap().len(), 1);
    }

    #[test]
    fn test_record_usage_accumulates() {
        let store = store();
        let state = store.create_or_get("t", "c", "u", "q").unwrap();
        store.record_usage(state.conversation.id, Usage::new(100, 20)).unwrap();
        store.record_usage(state.conversation.id, Usage::new(50, 5)).unwrap();
        let conversation = store.conversation("t", "c").unwrap().unwrap();
        assert_eq!(conversation.usage, Usage::new(150, 25));
        assert!(matches!(
            store.record_usage(9999, Usage::default()),
            Err(StoreError::NotFound(9999))
        ));
    }

    #[test]
    fn test_delete_conversation() {
        let store = store();
        let state = store.create_or_get("t", "c", "u", "q").unwrap();
        assert!(store.delete_conversation(state.conversation.id).unwrap());
        assert!(!store.delete_conversation(state.conversation.id).unwrap());
        assert!(store.append_assistant(state.conversation.id, "late").is_err());
    }

    #[test]
    fn test_history_limit() {
        let store = ConversationStore::open_in_memory(StoreConfig {
            history_limit: 3,
            ..Default::default()
        })
        .unwrap();
        for i in 0..5 {
            store.create_or_get("t", "c", "u", &format!("q{}", i)).unwrap();
        }
        let state = store.create_or_get("t", "c", "u", "last").unwrap();
        let contents: Vec<_> = state.messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["q3", "q4", "last"]);
    }
}
