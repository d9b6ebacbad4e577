//! Tool router
//!
//! Maps tool names chosen by the model onto sandboxed commands and turns
//! every outcome, including failures, into a `ToolOutcome` the agent loop can
//! hand back to the model. Nothing here returns an error to the caller: an
//! unknown tool, a bad argument or a policy rejection are all results the
//! model should see and recover from.
//!
//! # Flow
//!
//! ```text
//! (name, input) ──► registry lookup ──✗──► "Unknown tool" (is_error)
//!                        │
//!                        ▼
//!                 build_invocation ──✗──► "Invalid input" (is_error)
//!                        │
//!                        ▼
//!                 Sandbox::execute ──✗──► "Rejected by policy" (is_error)
//!                        │
//!                        ▼
//!                 format ► redact ► truncate ──► ToolOutcome
//! ```

pub mod catalog;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

pub use catalog::{build_invocation, Invocation, LogTarget, OutputFormat, ToolKind, MAX_LINES};

use crate::llm::Tool;
use crate::sandbox::{ExecOptions, ExecOutput, Sandbox, SandboxError};
use crate::security::redact;

/// Default cap on tool output returned to the model, in characters
pub const DEFAULT_MAX_OUTPUT_CHARS: usize = 8_000;

/// Per-user settings that affect tool execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserConfig {
    pub user_id: String,
    /// Model override passed to the backend
    #[serde(default)]
    pub model: Option<String>,
    /// Cap on each tool result, in characters
    #[serde(default)]
    pub max_output_chars: Option<usize>,
    /// Whether the generic `run_command` tool is offered
    #[serde(default = "default_true")]
    pub allow_run_command: bool,
}

fn default_true() -> bool {
    true
}

impl UserConfig {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            model: None,
            max_output_chars: None,
            allow_run_command: true,
        }
    }
}

/// Why a tool could not run
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Unknown tool '{0}'")]
    UnknownTool(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Tool '{0}' is disabled for this user")]
    Disabled(&'static str),

    #[error(transparent)]
    Sandbox(#[from] SandboxError),
}

impl ToolError {
    pub fn kind(&self) -> &'static str {
        match self {
            ToolError::UnknownTool(_) => "unknown_tool",
            ToolError::InvalidInput(_) => "invalid_input",
            ToolError::Disabled(_) => "disabled",
            ToolError::Sandbox(e) => e.kind(),
        }
    }
}

/// Result of one tool call, always returned to the model
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolOutcome {
    pub tool_call_id: String,
    pub content: String,
    pub is_error: bool,
}

impl ToolOutcome {
    fn error(tool_call_id: &str, error: &ToolError) -> Self {
        Self {
            tool_call_id: tool_call_id.to_string(),
            content: format!("Error: {}", error),
            is_error: true,
        }
    }
}

/// Name-keyed tool registry in front of the sandbox
pub struct ToolRouter {
    sandbox: Sandbox,
    registry: HashMap<&'static str, ToolKind>,
    max_output_chars: usize,
}

impl ToolRouter {
    pub fn new(sandbox: Sandbox) -> Self {
        Self {
            sandbox,
            registry: ToolKind::ALL.iter().map(|k| (k.name(), *k)).collect(),
            max_output_chars: DEFAULT_MAX_OUTPUT_CHARS,
        }
    }

    pub fn with_max_output_chars(mut self, max_output_chars: usize) -> Self {
        self.max_output_chars = max_output_chars;
        self
    }

    pub fn sandbox(&self) -> &Sandbox {
        &self.sandbox
    }

    pub fn lookup(&self, name: &str) -> Option<ToolKind> {
        self.registry.get(name).copied()
    }

    /// Tool definitions offered to the model for this user
    pub fn catalog(&self, user: &UserConfig) -> Vec<Tool> {
        ToolKind::ALL
            .iter()
            .filter(|kind| user.allow_run_command || **kind != ToolKind::RunCommand)
            .map(|kind| kind.definition())
            .collect()
    }

    /// Run one tool call and render its outcome for the model
    pub async fn execute(
        &self,
        tool_call_id: &str,
        name: &str,
        input: &serde_json::Value,
        user: &UserConfig,
    ) -> ToolOutcome {
        let max_chars = user.max_output_chars.unwrap_or(self.max_output_chars);

        let (content, is_error) = match self.run(name, input, user).await {
            Ok((content, is_error)) => (content, is_error),
            Err(e) => {
                match &e {
                    ToolError::Sandbox(inner) if !inner.is_policy_violation() => {
                        warn!(tool = name, error = %e, "Tool execution failed")
                    }
                    _ => info!(tool = name, kind = e.kind(), error = %e, "Tool call refused"),
                }
                let outcome = ToolOutcome::error(tool_call_id, &e);
                (outcome.content, true)
            }
        };

        let content = truncate_chars(&redact(&content), max_chars);
        ToolOutcome {
            tool_call_id: tool_call_id.to_string(),
            content,
            is_error,
        }
    }

    async fn run(
        &self,
        name: &str,
        input: &serde_json::Value,
        user: &UserConfig,
    ) -> Result<(String, bool), ToolError> {
        let kind = self
            .lookup(name)
            .ok_or_else(|| ToolError::UnknownTool(name.to_string()))?;
        if kind == ToolKind::RunCommand && !user.allow_run_command {
            return Err(ToolError::Disabled(kind.name()));
        }

        let invocation = build_invocation(kind, input)?;
        debug!(tool = name, program = %invocation.program, args = ?invocation.args, "Running tool");

        let output = self
            .sandbox
            .execute(&invocation.program, &invocation.args, ExecOptions::default())
            .await?;

        Ok(render_output(&invocation, &output))
    }
}

/// Render command output for the model, returning (content, is_error)
fn render_output(invocation: &Invocation, output: &ExecOutput) -> (String, bool) {
    let is_error = match invocation.ok_exit_codes {
        Some(codes) => !codes.contains(&output.exit_code),
        None => false,
    };

    let stdout = match invocation.max_stdout_lines {
        Some(max) => output.stdout.lines().take(max).collect::<Vec<_>>().join("\n"),
        None => output.stdout.clone(),
    };

    let mut content = match invocation.format {
        OutputFormat::Json => serde_json::json!({
            "stdout": stdout,
            "stderr": output.stderr,
            "exitCode": output.exit_code,
        })
        .to_string(),
        OutputFormat::Text => {
            let mut text = String::new();
            if is_error {
                text.push_str(&format!("Command exited with code {}\n", output.exit_code));
            }
            text.push_str(stdout.trim_end());
            let stderr = output.stderr.trim_end();
            if !stderr.is_empty() {
                if !text.is_empty() && !text.ends_with('\n') {
                    text.push('\n');
                }
                text.push_str("[stderr]\n");
                text.push_str(stderr);
            }
            if text.is_empty() {
                text.push_str("(no output)");
            }
            text
        }
    };

    if output.truncated {
        content.push_str("\n[output truncated by sandbox]");
    }
    (content, is_error)
}

/// Cap a string at `max` characters, marking what was dropped
pub fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        None => text.to_string(),
        Some((cut, _)) => {
            let dropped = text[cut..].chars().count();
            format!("{}\n... [truncated {} chars]", &text[..cut], dropped)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::{CommandRule, SandboxPolicy};
    use serde_json::json;

    fn router() -> ToolRouter {
        let mut policy = SandboxPolicy::default();
        policy.commands.insert("echo".to_string(), CommandRule::default());
        ToolRouter::new(Sandbox::new(policy))
    }

    fn output(stdout: &str, stderr: &str, exit_code: i32) -> ExecOutput {
        ExecOutput {
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
            exit_code,
            duration_ms: 1.0,
            truncated: false,
        }
    }

    #[tokio::test]
    async fn test_unknown_tool_is_error_result() {
        let outcome = router()
            .execute("call_1", "format_disk", &json!({}), &UserConfig::new("u"))
            .await;
        assert!(outcome.is_error);
        assert_eq!(outcome.tool_call_id, "call_1");
        assert!(outcome.content.contains("Unknown tool 'format_disk'"));
    }

    #[tokio::test]
    async fn test_policy_rejection_is_error_result() {
        let outcome = router()
            .execute(
                "call_2",
                "run_command",
                &json!({"program": "rm", "argv": ["-rf", "/"]}),
                &UserConfig::new("u"),
            )
            .await;
        assert!(outcome.is_error);
        assert!(outcome.content.contains("policy violation for 'rm'"));
    }

    #[tokio::test]
    async fn test_run_command_disabled() {
        let mut user = UserConfig::new("u");
        user.allow_run_command = false;
        let router = router();
        assert!(!router
            .catalog(&user)
            .iter()
            .any(|t| t.function.name == "run_command"));
        let outcome = router
            .execute("c", "run_command", &json!({"program": "echo"}), &user)
            .await;
        assert!(outcome.is_error);
        assert!(outcome.content.contains("disabled"));
    }

    #[tokio::test]
    async fn test_run_command_output_is_redacted_and_capped() {
        let mut user = UserConfig::new("u");
        user.max_output_chars = Some(40);
        let outcome = router()
            .execute(
                "c",
                "run_command",
                &json!({"program": "echo", "argv": ["password=hunter2", "padding padding padding"]}),
                &user,
            )
            .await;
        assert!(!outcome.is_error);
        assert!(!outcome.content.contains("hunter2"));
        assert!(outcome.content.contains("[truncated"));
    }

    #[test]
    fn test_render_text_with_stderr() {
        let inv = build_invocation(ToolKind::ContainerLogs, &json!({"container": "web"})).unwrap();
        let (content, is_error) = render_output(&inv, &output("line 1\n", "warn 1\n", 0));
        assert!(!is_error);
        assert_eq!(content, "line 1\n[stderr]\nwarn 1");
    }

    #[test]
    fn test_render_service_inactive_is_not_error() {
        let inv = build_invocation(ToolKind::ServiceStatus, &json!({"unit": "nginx"})).unwrap();
        let (content, is_error) = render_output(&inv, &output("inactive (dead)", "", 3));
        assert!(!is_error);
        assert_eq!(content, "inactive (dead)");
    }

    #[test]
    fn test_render_nonzero_exit() {
        let inv = build_invocation(ToolKind::DiskUsage, &json!({})).unwrap();
        let (content, is_error) = render_output(&inv, &output("", "df: boom", 1));
        assert!(is_error);
        assert!(content.starts_with("Command exited with code 1"));
    }

    #[test]
    fn test_render_json_and_line_limit() {
        let inv = build_invocation(ToolKind::RunCommand, &json!({"program": "false"})).unwrap();
        let (content, is_error) = render_output(&inv, &output("", "", 1));
        assert!(!is_error);
        let value: serde_json::Value = serde_json::from_str(&content).unwrap();
        assert_eq!(value["exitCode"], 1);

        let inv = build_invocation(ToolKind::ProcessList, &json!({"limit": 2})).unwrap();
        let (content, _) = render_output(&inv, &output("HEAD\na\nb\nc\nd\n", "", 0));
        assert_eq!(content, "HEAD\na\nb");
    }

    #[test]
    fn test_truncate_chars_multibyte() {
        assert_eq!(truncate_chars("héllo", 10), "héllo");
        assert_eq!(truncate_chars("héllo", 2), "hé\n... [truncated 3 chars]");
    }
}
