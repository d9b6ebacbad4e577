//! Process sandbox for diagnostic commands
//!
//! This module is the trust boundary for anything that touches the OS:
//! - `policy` - allow-list, sub-verb, flag, path and URL validation
//! - `process` - argv-only spawning with timeout and output cap
//!
//! # Flow
//!
//! ```text
//! Tool Router ──► Sandbox::execute(command, args)
//!                      │
//!                      ├─ SandboxPolicy::validate ──✗──► PolicyViolation (no spawn)
//!                      │
//!                      └─ tokio::process::Command (no shell, stdin closed)
//!                              │
//!                              ├─ timeout ──► kill ──► ExecutionFailure::Timeout
//!                              └─ exit ─────► ExecOutput { stdout, stderr, exit_code }
//! ```

pub mod policy;
pub mod process;

pub use policy::{
    is_http_url, CommandRule, PathRule, PolicyViolation, SandboxPolicy, ValidatedCommand,
    ViolationReason,
};
pub use process::{ExecOptions, ExecOutput, ExecutionFailure, Sandbox, SandboxError};
