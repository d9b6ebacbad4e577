//! Schema creation and additive backfill
//!
//! Stores written by older builds are missing the usage and tool-call
//! outcome columns. Opening one adds them in place with safe defaults.

use rusqlite::Connection;

use super::StoreError;

const CREATE_TABLES: &str = "
    CREATE TABLE IF NOT EXISTS conversations (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        thread_key TEXT NOT NULL,
        channel TEXT NOT NULL,
        user_id TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        input_tokens INTEGER NOT NULL DEFAULT 0,
        output_tokens INTEGER NOT NULL DEFAULT 0,
        UNIQUE (thread_key, channel)
    );

    CREATE TABLE IF NOT EXISTS messages (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        conversation_id INTEGER NOT NULL,
        role TEXT NOT NULL,
        content TEXT NOT NULL,
        created_at INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS tool_calls (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        conversation_id INTEGER NOT NULL,
        tool_name TEXT NOT NULL,
        input TEXT NOT NULL,
        output_preview TEXT NOT NULL,
        timestamp_ms INTEGER NOT NULL,
        duration_ms INTEGER,
        success INTEGER NOT NULL DEFAULT 1
    );
";

const CREATE_INDEXES: &str = "
    CREATE INDEX IF NOT EXISTS idx_conversations_updated ON conversations(updated_at);
    CREATE INDEX IF NOT EXISTS idx_messages_conversation ON messages(conversation_id, id);
    CREATE INDEX IF NOT EXISTS idx_tool_calls_conversation ON tool_calls(conversation_id, id);
    CREATE INDEX IF NOT EXISTS idx_tool_calls_timestamp ON tool_calls(timestamp_ms);
";

/// Columns added after the first release: (table, column, definition)
const BACKFILL: &[(&str, &str, &str)] = &[
    ("conversations", "input_tokens", "INTEGER NOT NULL DEFAULT 0"),
    ("conversations", "output_tokens", "INTEGER NOT NULL DEFAULT 0"),
    ("tool_calls", "duration_ms", "INTEGER"),
    ("tool_calls", "success", "INTEGER NOT NULL DEFAULT 1"),
];

pub(super) fn initialize(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(CREATE_TABLES)?;
    backfill(conn)?;
    conn.execute_batch(CREATE_INDEXES)?;
    Ok(())
}

fn backfill(conn: &Connection) -> Result<(), StoreError> {
    for (table, column, definition) in BACKFILL {
        if !table_has_column(conn, table, column)? {
            tracing::info!(table, column, "Backfilling column");
            conn.execute(
                &format!("ALTER TABLE {} ADD COLUMN {} {}", table, column, definition),
                [],
            )?;
        }
    }
    Ok(())
}

pub(super) fn table_has_column(
    conn: &Connection,
    table: &str,
    column: &str,
) -> Result<bool, StoreError> {
    if !table.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(StoreError::InvalidIdentifier(table.to_string()));
    }
    // PRAGMA takes no bound parameters
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
    let mut rows = stmt.query_map([], |row| row.get::<_, String>(1))?;
    rows.try_fold(false, |found, name| Ok(found || name? == column))
}
