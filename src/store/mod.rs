//! Conversation store
//!
//! Durable per-thread state in SQLite: message history, a tool-call audit
//! log and token usage, keyed by `(thread_key, channel)`.
//!
//! # Lifecycle
//!
//! ```text
//! Absent ──create_or_get──► Active (messages ≥ 1) ──age > TTL──► Expired
//!   ▲                                                               │
//!   └──────────────── sweep_expired / next create_or_get ───────────┘
//! ```
//!
//! The connection runs in WAL mode behind a `std::sync::Mutex`; async callers
//! hop onto the blocking pool with [`call_blocking`].

mod conversations;
mod reports;
mod schema;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::llm::{ChatMessage, Role, Usage};

pub use reports::{SessionDetail, SessionSummary, Stats, ToolStat};

/// Store settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// SQLite database file
    pub path: PathBuf,
    /// Conversations idle longer than this are expired
    pub conversation_ttl_secs: u64,
    /// How often the background sweeper runs
    pub sweep_interval_secs: u64,
    /// Sessions updated within this window are listed as active
    pub active_window_secs: u64,
    /// Most recent messages loaded as history for a turn
    pub history_limit: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("hostscope.db"),
            conversation_ttl_secs: 86_400,
            sweep_interval_secs: 600,
            active_window_secs: 300,
            history_limit: 40,
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("failed to create store directory: {0}")]
    Io(#[from] std::io::Error),

    #[error("conversation {0} not found")]
    NotFound(i64),

    #[error("invalid identifier: {0}")]
    InvalidIdentifier(String),

    #[error("store task failed: {0}")]
    Task(String),
}

impl StoreError {
    pub fn kind(&self) -> &'static str {
        match self {
            StoreError::Sqlite(_) => "sqlite",
            StoreError::Io(_) => "io",
            StoreError::NotFound(_) => "not_found",
            StoreError::InvalidIdentifier(_) => "invalid_identifier",
            StoreError::Task(_) => "task",
        }
    }
}

/// Run a store operation on the blocking thread pool
pub async fn call_blocking<T, F>(store: Arc<ConversationStore>, f: F) -> Result<T, StoreError>
where
    T: Send + 'static,
    F: FnOnce(&ConversationStore) -> Result<T, StoreError> + Send + 'static,
{
    tokio::task::spawn_blocking(move || f(store.as_ref()))
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
}

/// A conversation row
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Conversation {
    pub id: i64,
    pub thread_key: String,
    pub channel: String,
    pub user_id: String,
    /// Unix milliseconds
    pub created_at: i64,
    pub updated_at: i64,
    pub usage: Usage,
}

/// A persisted message
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoredMessage {
    pub id: i64,
    pub role: Role,
    pub content: String,
    pub created_at: i64,
}

impl StoredMessage {
    pub fn to_chat_message(&self) -> ChatMessage {
        match self.role {
            Role::Assistant => ChatMessage::assistant(self.content.clone()),
            Role::System => ChatMessage::system(self.content.clone()),
            _ => ChatMessage::user(self.content.clone()),
        }
    }
}

/// A tool-call audit row
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolCallRecord {
    pub id: i64,
    pub conversation_id: i64,
    pub tool_name: String,
    /// JSON arguments, redacted
    pub input: String,
    pub output_preview: String,
    pub timestamp_ms: i64,
    /// Unknown for rows written before durations were recorded
    pub duration_ms: Option<i64>,
    pub success: bool,
}

/// Outcome details for `log_tool_call`
///
/// The default is an unknown duration and a successful call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ToolCallMeta {
    pub duration_ms: Option<u64>,
    pub success: bool,
}

impl Default for ToolCallMeta {
    fn default() -> Self {
        Self {
            duration_ms: None,
            success: true,
        }
    }
}

/// Result of `create_or_get`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationState {
    pub conversation: Conversation,
    /// History including the message just appended, oldest first
    pub messages: Vec<StoredMessage>,
    /// True when this call started a new conversation
    pub created: bool,
}

impl ConversationState {
    /// Messages before the one just appended, as model input
    pub fn prior_history(&self) -> Vec<ChatMessage> {
        let prior = self.messages.len().saturating_sub(1);
        self.messages[..prior]
            .iter()
            .map(StoredMessage::to_chat_message)
            .collect()
    }
}

/// SQLite-backed conversation store
pub struct ConversationStore {
    conn: Mutex<Connection>,
    config: StoreConfig,
}

impl ConversationStore {
    /// Open (or create) the database at `config.path`
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        if let Some(parent) = config.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&config.path)?;
        Self::with_connection(conn, config)
    }

    /// In-memory store, for tests and dry runs
    pub fn open_in_memory(config: StoreConfig) -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?, config)
    }

    fn with_connection(conn: Connection, config: StoreConfig) -> Result<Self, StoreError> {
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.busy_timeout(Duration::from_secs(5))?;
        schema::initialize(&conn)?;
        tracing::debug!(path = %config.path.display(), "Conversation store opened");
        Ok(Self {
            conn: Mutex::new(conn),
            config,
        })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn lock_conn(&self) -> MutexGuard<'_, Connection> {
        match self.conn.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn ttl_ms(&self) -> i64 {
        (self.config.conversation_ttl_secs as i64).saturating_mul(1000)
    }
}

/// Current time in Unix milliseconds
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn role_from_sql(index: usize, value: String) -> rusqlite::Result<Role> {
    Role::parse(&value)
        .ok_or(rusqlite::Error::InvalidColumnType(index, value, rusqlite::types::Type::Text))
}
