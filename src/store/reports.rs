//! Read path: session listing, session detail, aggregate stats

use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

use super::conversations::{find_conversation, recent_messages, recent_tool_calls};
use super::{now_ms, Conversation, ConversationStore, StoreError, StoredMessage, ToolCallRecord};
use crate::llm::Usage;

/// One row of the session list
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSummary {
    pub conversation_id: i64,
    pub thread_key: String,
    pub channel: String,
    pub user_id: String,
    pub created_at: i64,
    pub updated_at: i64,
    pub message_count: i64,
    pub tool_call_count: i64,
    pub usage: Usage,
    /// Updated within the active window
    pub active: bool,
}

/// A session with its history and latest tool calls
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionDetail {
    pub summary: SessionSummary,
    /// Oldest first
    pub messages: Vec<StoredMessage>,
    /// Newest first
    pub tool_calls: Vec<ToolCallRecord>,
}

/// Usage of one tool within the stats window
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolStat {
    pub tool_name: String,
    pub calls: i64,
    pub failures: i64,
    /// Mean over calls with a recorded duration
    pub avg_duration_ms: Option<f64>,
}

/// Aggregate activity over a trailing window
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Stats {
    pub window_hours: u64,
    pub sessions: i64,
    pub messages: i64,
    pub tool_calls: i64,
    pub failed_tool_calls: i64,
    /// Failed / total tool calls, 0.0 when there were none
    pub failure_rate: f64,
    pub usage: Usage,
    pub top_tools: Vec<ToolStat>,
}

const SUMMARY_SELECT: &str = "
    SELECT c.id, c.thread_key, c.channel, c.user_id, c.created_at, c.updated_at,
           c.input_tokens, c.output_tokens,
           (SELECT COUNT(*) FROM messages m WHERE m.conversation_id = c.id),
           (SELECT COUNT(*) FROM tool_calls t WHERE t.conversation_id = c.id)
    FROM conversations c";

fn summary_from_row(row: &rusqlite::Row<'_>, active_since: i64) -> rusqlite::Result<SessionSummary> {
    let updated_at: i64 = row.get(5)?;
    Ok(SessionSummary {
        conversation_id: row.get(0)?,
        thread_key: row.get(1)?,
        channel: row.get(2)?,
        user_id: row.get(3)?,
        created_at: row.get(4)?,
        updated_at,
        usage: Usage::new(row.get::<_, i64>(6)? as u64, row.get::<_, i64>(7)? as u64),
        message_count: row.get(8)?,
        tool_call_count: row.get(9)?,
        active: updated_at >= active_since,
    })
}

fn count(conn: &Connection, sql: &str, since: i64) -> Result<i64, StoreError> {
    Ok(conn.query_row(sql, params![since], |row| row.get(0))?)
}

impl ConversationStore {
    fn active_since(&self, now: i64) -> i64 {
        now - (self.config.active_window_secs as i64).saturating_mul(1000)
    }

    /// Unexpired sessions, most recently updated first
    pub fn list_recent_sessions(
        &self,
        limit: usize,
        user_filter: Option<&str>,
    ) -> Result<Vec<SessionSummary>, StoreError> {
        let now = now_ms();
        let live_since = now - self.ttl_ms();
        let active_since = self.active_since(now);

        let conn = self.lock_conn();
        let sql = format!(
            "{} WHERE c.updated_at >= ?1 AND (?2 IS NULL OR c.user_id = ?2)
             ORDER BY c.updated_at DESC, c.id DESC
             LIMIT ?3",
            SUMMARY_SELECT
        );
        let mut stmt = conn.prepare(&sql)?;
        let sessions = stmt
            .query_map(params![live_since, user_filter, limit as i64], |row| {
                summary_from_row(row, active_since)
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(sessions)
    }

    /// One session with its recent history and last `tool_limit` tool calls
    pub fn session_detail(
        &self,
        thread_key: &str,
        channel: &str,
        tool_limit: usize,
    ) -> Result<Option<SessionDetail>, StoreError> {
        let active_since = self.active_since(now_ms());
        let conn = self.lock_conn();

        let Some(Conversation { id, .. }) = find_conversation(&conn, thread_key, channel)? else {
            return Ok(None);
        };
        let sql = format!("{} WHERE c.id = ?1", SUMMARY_SELECT);
        let summary = conn
            .query_row(&sql, params![id], |row| summary_from_row(row, active_since))
            .optional()?
            .ok_or(StoreError::NotFound(id))?;

        Ok(Some(SessionDetail {
            summary,
            messages: recent_messages(&conn, id, self.config.history_limit.max(1))?,
            tool_calls: recent_tool_calls(&conn, id, tool_limit)?,
        }))
    }

    /// Totals over the last `window_hours`, with the `top_n` busiest tools
    pub fn aggregate_stats(&self, window_hours: u64, top_n: usize) -> Result<Stats, StoreError> {
        let since = now_ms() - (window_hours as i64).saturating_mul(3_600_000);
        let conn = self.lock_conn();

        let sessions = count(&conn, "SELECT COUNT(*) FROM conversations WHERE updated_at >= ?1", since)?;
        let messages = count(&conn, "SELECT COUNT(*) FROM messages WHERE created_at >= ?1", since)?;
        let (tool_calls, failed_tool_calls): (i64, i64) = conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(CASE WHEN success = 0 THEN 1 ELSE 0 END), 0)
             FROM tool_calls WHERE timestamp_ms >= ?1",
            params![since],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        let (input_tokens, output_tokens): (i64, i64) = conn.query_row(
            "SELECT COALESCE(SUM(input_tokens), 0), COALESCE(SUM(output_tokens), 0)
             FROM conversations WHERE updated_at >= ?1",
            params![since],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        let mut stmt = conn.prepare(
            "SELECT tool_name, COUNT(*) AS calls,
                    SUM(CASE WHEN success = 0 THEN 1 ELSE 0 END),
                    AVG(duration_ms)
             FROM tool_calls
             WHERE timestamp_ms >= ?1
             GROUP BY tool_name
             ORDER BY calls DESC, tool_name ASC
             LIMIT ?2",
        )?;
        let top_tools = stmt
            .query_map(params![since, top_n as i64], |row| {
                Ok(ToolStat {
                    tool_name: row.get(0)?,
                    calls: row.get(1)?,
                    failures: row.get(2)?,
                    avg_duration_ms: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let failure_rate = if tool_calls == 0 {
            0.0
        } else {
            failed_tool_calls as f64 / tool_calls as f64
        };

        Ok(Stats {
            window_hours,
            sessions,
            messages,
            tool_calls,
            failed_tool_calls,
            failure_rate,
            usage: Usage::new(input_tokens as u64, output_tokens as u64),
            top_tools,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{StoreConfig, ToolCallMeta};
    use serde_json::json;

    fn store() -> ConversationStore {
        ConversationStore::open_in_memory(StoreConfig::default()).unwrap()
    }

    fn meta(duration_ms: Option<u64>, success: bool) -> ToolCallMeta {
        ToolCallMeta { duration_ms, success }
    }

    #[test]
    fn test_list_recent_sessions_order_and_filter() {
        let store = store();
        let a = store.create_or_get("a", "ops", "alice", "1").unwrap();
        let b = store.create_or_get("b", "ops", "bob", "2").unwrap();
        let c = store.create_or_get("c", "ops", "alice", "3").unwrap();
        store.append_assistant(a.conversation.id, "reply").unwrap();
        store.backdate(b.conversation.id, 2_000).unwrap();
        store.backdate(c.conversation.id, 1_000).unwrap();

        let all = store.list_recent_sessions(10, None).unwrap();
        assert_eq!(all.len(), 3);
        let order: Vec<_> = all.iter().map(|s| s.thread_key.as_str()).collect();
        assert_eq!(order, vec!["a", "c", "b"]);
        assert_eq!(all[0].message_count, 2);
        assert!(all.iter().all(|s| s.active));

        let alice = store.list_recent_sessions(10, Some("alice")).unwrap();
        assert_eq!(alice.len(), 2);
        assert!(alice.iter().all(|s| s.user_id == "alice"));

        assert_eq!(store.list_recent_sessions(1, None).unwrap().len(), 1);
    }

    #[test]
    fn test_list_skips_expired_and_marks_idle() {
        let store = store();
        let old = store.create_or_get("old", "ops", "alice", "1").unwrap();
        let idle = store.create_or_get("idle", "ops", "alice", "2").unwrap();
        store.backdate(old.conversation.id, 2 * 86_400_000).unwrap();
        store.backdate(idle.conversation.id, 600_000).unwrap();

        let sessions = store.list_recent_sessions(10, None).unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].thread_key, "idle");
        assert!(!sessions[0].active);
    }

    #[test]
    fn test_session_detail() {
        let store = store();
        let state = store.create_or_get("t", "ops", "alice", "q").unwrap();
        let id = state.conversation.id;
        for i in 0..5 {
            store
                .log_tool_call(id, &format!("tool_{}", i), &json!({}), "ok", meta(Some(i), true))
                .unwrap();
        }
        store.append_assistant(id, "answer").unwrap();

        let detail = store.session_detail("t", "ops", 3).unwrap().unwrap();
        assert_eq!(detail.summary.tool_call_count, 5);
        assert_eq!(detail.messages.len(), 2);
        let names: Vec<_> = detail.tool_calls.iter().map(|t| t.tool_name.as_str()).collect();
        assert_eq!(names, vec!["tool_4", "tool_3", "tool_2"]);

        assert!(store.session_detail("missing", "ops", 3).unwrap().is_none());
    }

    #[test]
    fn test_aggregate_stats() {
        let store = store();
        let a = store.create_or_get("a", "ops", "alice", "1").unwrap().conversation.id;
        let b = store.create_or_get("b", "ops", "bob", "2").unwrap().conversation.id;
        store.log_tool_call(a, "disk_usage", &json!({}), "ok", meta(Some(10), true)).unwrap();
        store.log_tool_call(a, "disk_usage", &json!({}), "ok", meta(Some(30), true)).unwrap();
        store.log_tool_call(b, "disk_usage", &json!({}), "ok", meta(None, true)).unwrap();
        store.log_tool_call(b, "run_command", &json!({}), "no", meta(Some(5), false)).unwrap();
        store.record_usage(a, Usage::new(100, 10)).unwrap();

        let stats = store.aggregate_stats(24, 5).unwrap();
        assert_eq!(stats.sessions, 2);
        assert_eq!(stats.messages, 2);
        assert_eq!(stats.tool_calls, 4);
        assert_eq!(stats.failed_tool_calls, 1);
        assert!((stats.failure_rate - 0.25).abs() < f64::EPSILON);
        assert_eq!(stats.usage, Usage::new(100, 10));

        assert_eq!(stats.top_tools[0].tool_name, "disk_usage");
        assert_eq!(stats.top_tools[0].calls, 3);
        assert_eq!(stats.top_tools[0].avg_duration_ms, Some(20.0));
        assert_eq!(stats.top_tools[1].failures, 1);

        let top_one = store.aggregate_stats(24, 1).unwrap();
        assert_eq!(top_one.top_tools.len(), 1);
    }

    #[test]
    fn test_stats_empty_store() {
        let stats = store().aggregate_stats(1, 5).unwrap();
        assert_eq!(stats.tool_calls, 0);
        assert_eq!(stats.failure_rate, 0.0);
        assert!(stats.top_tools.is_empty());
    }
}
