//! Agent module for tool-using server diagnostics
//!
//! This module provides the agent loop that orchestrates:
//! - A reasoning backend (HTTP function calling or a local CLI)
//! - The tool router and its sandboxed commands
//! - Usage accounting and hard caps per question
//!
//! # Architecture
//!
//! ```text
//! Question + history → AgentController → ReasoningBackend::generate (with tools)
//!                  ↓
//!           Tool calls? ── no ──► Done (final answer)
//!                  ↓ yes
//!           ToolRouter::execute, one at a time, in order
//!                  ↓
//!           Sandbox validates → spawns → stdout/stderr/exit_code
//!                  ↓
//!           Redact + truncate → feed back as tool messages
//!                  ↓
//!           Loop, or stop at MaxToolCalls / MaxIterations with an explanation
//! ```

pub mod controller;

pub use controller::{
    AgentConfig, AgentController, AgentError, AgentReply, AskOptions, StopReason, ToolCallTrace,
    DEFAULT_SYSTEM_PROMPT, OUTPUT_PREVIEW_CHARS,
};
