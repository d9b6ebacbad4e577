//! hostscope - chat-operated server diagnostics
//!
//! Answers operator questions about a Linux host ("why is nginx down?") by
//! letting a reasoning backend call a fixed set of read-only diagnostic tools,
//! each of which runs through a policy-checked process sandbox.
//!
//! # Modules
//!
//! - `sandbox` - allow-listed, shell-free command execution with timeouts and output caps
//! - `tools` - diagnostic tool catalog and router (tool name + JSON input → sandboxed command)
//! - `llm` - reasoning backend adapters (HTTP chat API or local CLI)
//! - `agent` - the bounded generate → tool → generate loop
//! - `store` - SQLite conversation history, tool-call audit log and usage
//! - `security` - rate limiting, daily token budget, secret redaction
//! - `engine` - one turn end to end, with per-thread ordering
//! - `config` - TOML configuration
//! - `metrics` - Prometheus metrics for observability
//! - `tracing` - logging and OpenTelemetry export
//!
//! # Quick Start
//!
//! ```ignore
//! use hostscope::{AppConfig, Engine, Inbound};
//!
//! let config = AppConfig::load("hostscope.toml")?;
//! let engine = Engine::from_config(&config)?;
//!
//! let user = engine.user_config("alice");
//! let outcome = engine
//!     .handle(Inbound::new("thread-1", "ops", "alice", "is nginx running?"), &user)
//!     .await?;
//! println!("{}", outcome.response);
//! ```

pub mod agent;
pub mod config;
pub mod engine;
pub mod llm;
pub mod metrics;
pub mod sandbox;
pub mod security;
pub mod store;
pub mod tools;
pub mod tracing;

// Re-export commonly used types at crate root for convenience
pub use agent::{AgentConfig, AgentController, AgentReply, StopReason};
pub use config::AppConfig;
pub use engine::{Engine, EngineError, Inbound, Reply, Responder, Swept, TurnOutcome};
pub use llm::{BackendError, ReasoningBackend, Usage};
pub use sandbox::{Sandbox, SandboxPolicy};
pub use store::ConversationStore;
pub use tools::{ToolRouter, UserConfig};
