//! Reasoning backend adapter
//!
//! One trait, two transports:
//! - `ChatBackend` talks to an HTTP function-calling API (Ollama `/api/chat`)
//! - `CliBackend` pipes a rendered transcript into a local command-line model
//!
//! The agent loop only sees `ReasoningBackend`, so it behaves the same on
//! either. Backends that cannot report token usage return `usage: None`.
//!
//! # Flow
//!
//! ```text
//! GenerateRequest { messages, tools, model }
//!        │
//!        ▼
//! ReasoningBackend::generate ──✗──► BackendError { Auth | Quota | Capability | ... }
//!        │
//!        ▼
//! Generation { content, tool_calls, usage }
//! ```

pub mod chat;
pub mod cli;
pub mod tool_use;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use chat::ChatBackend;
pub use cli::CliBackend;
pub use tool_use::{ChatMessage, FunctionCall, Role, Tool, ToolCall, ToolFunction};

/// An image supplied alongside a question
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageAttachment {
    /// e.g. "image/png"
    pub media_type: String,
    pub data_base64: String,
}

/// Token usage for one or more backend calls
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl Usage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
        }
    }

    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    pub fn add(&mut self, other: Usage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }
}

/// One generation request
#[derive(Debug, Clone, Copy)]
pub struct GenerateRequest<'a> {
    /// Model override; backends fall back to their configured default
    pub model: Option<&'a str>,
    pub messages: &'a [ChatMessage],
    pub tools: &'a [Tool],
}

impl GenerateRequest<'_> {
    pub fn has_images(&self) -> bool {
        self.messages.iter().any(|m| m.has_images())
    }
}

/// One generation result
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Generation {
    /// Assistant text (may be empty when only tools were requested)
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    pub usage: Option<Usage>,
}

/// Backend failures, classified so callers can give actionable hints
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backend rejected credentials: {0}")]
    Auth(String),

    #[error("backend quota or rate limit exceeded: {0}")]
    Quota(String),

    #[error("backend does not support {0}")]
    Capability(&'static str),

    #[error("backend unreachable: {0}")]
    Transport(String),

    #[error("backend returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("backend returned an invalid response: {0}")]
    InvalidResponse(String),

    #[error("backend timed out after {0:?}")]
    Timeout(Duration),
}

impl BackendError {
    pub fn kind(&self) -> &'static str {
        match self {
            BackendError::Auth(_) => "auth",
            BackendError::Quota(_) => "quota",
            BackendError::Capability(_) => "capability",
            BackendError::Transport(_) => "transport",
            BackendError::Status { .. } => "status",
            BackendError::InvalidResponse(_) => "invalid_response",
            BackendError::Timeout(_) => "timeout",
        }
    }

    /// A short, user-facing next step for this failure
    pub fn hint(&self) -> &'static str {
        match self {
            BackendError::Auth(_) => {
                "The reasoning backend rejected its credentials. Check the API key or CLI login on the server."
            }
            BackendError::Quota(_) => {
                "The reasoning backend is out of quota or rate limited. Try again later or raise the plan limits."
            }
            BackendError::Capability(_) => {
                "The configured reasoning backend cannot handle this input. Remove attachments or switch backends."
            }
            BackendError::Transport(_) | BackendError::Timeout(_) => {
                "The reasoning backend is unreachable or slow. Check that it is running and try again."
            }
            BackendError::Status { .. } | BackendError::InvalidResponse(_) => {
                "The reasoning backend returned an unexpected error. Check the server logs."
            }
        }
    }

    /// Classify a failure from its HTTP status and body text
    pub fn from_status(status: u16, body: impl Into<String>) -> Self {
        let body = body.into();
        match status {
            401 | 403 => BackendError::Auth(body),
            402 | 429 => BackendError::Quota(body),
            _ => classify_text(&body).unwrap_or(BackendError::Status { status, body }),
        }
    }
}

/// Recognize auth and quota failures from error wording alone
///
/// CLI backends only give us stderr, and some HTTP APIs return 400/500 with
/// a quota message in the body.
pub fn classify_text(text: &str) -> Option<BackendError> {
    let lower = text.to_ascii_lowercase();
    let detail = || text.trim().chars().take(300).collect::<String>();

    const AUTH: &[&str] = &[
        "unauthorized",
        "invalid api key",
        "invalid_api_key",
        "authentication",
        "not logged in",
        "please log in",
        "permission denied for model",
    ];
    const QUOTA: &[&str] = &[
        "quota",
        "rate limit",
        "rate_limit",
        "too many requests",
        "usage limit",
        "insufficient credit",
        "billing",
    ];

    if AUTH.iter().any(|needle| lower.contains(needle)) {
        return Some(BackendError::Auth(detail()));
    }
    if QUOTA.iter().any(|needle| lower.contains(needle)) {
        return Some(BackendError::Quota(detail()));
    }
    None
}

/// A reasoning backend the agent loop can drive
#[async_trait]
pub trait ReasoningBackend: Send + Sync {
    /// Short name for logs and metrics
    fn name(&self) -> &str;

    /// Whether image attachments can be sent to this backend
    fn supports_images(&self) -> bool;

    async fn generate(&self, request: &GenerateRequest<'_>) -> Result<Generation, BackendError>;
}
