//! Subprocess CLI backend
//!
//! Runs a local command-line model (e.g. `claude -p`, `llm`, `ollama run`)
//! once per generation. The whole transcript, including the tool catalog,
//! is rendered to text and written to the child's stdin; the reply comes
//! back on stdout. Tool calls are recovered from JSON objects in the reply.
//!
//! CLI tools do not report token counts, so `usage` is always `None`.

use std::fmt::Write as _;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use super::tool_use::{parse_tool_calls_from_text, strip_tool_call_text, ChatMessage, Role, Tool};
use super::{classify_text, BackendError, GenerateRequest, Generation, ReasoningBackend};

/// Settings for the CLI backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CliBackendConfig {
    pub program: String,
    pub args: Vec<String>,
    /// Appended as `<model_flag> <model>` when a model override is requested
    pub model_flag: Option<String>,
    pub timeout_secs: u64,
}

impl Default for CliBackendConfig {
    fn default() -> Self {
        Self {
            program: "claude".to_string(),
            args: vec!["-p".to_string()],
            model_flag: Some("--model".to_string()),
            timeout_secs: 180,
        }
    }
}

pub struct CliBackend {
    config: CliBackendConfig,
}

impl CliBackend {
    pub fn new(config: CliBackendConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CliBackendConfig {
        &self.config
    }

    fn command_args(&self, model: Option<&str>) -> Vec<String> {
        let mut args = self.config.args.clone();
        if let (Some(flag), Some(model)) = (&self.config.model_flag, model) {
            args.push(flag.clone());
            args.push(model.to_string());
        }
        args
    }
}

/// Render messages and tools into a single prompt
pub fn render_transcript(messages: &[ChatMessage], tools: &[Tool]) -> String {
    let mut out = String::new();

    for message in messages.iter().filter(|m| m.role == Role::System) {
        let _ = writeln!(out, "{}\n", message.content.trim());
    }

    if !tools.is_empty() {
        out.push_str("## Tools\n\n");
        out.push_str(
            "To call a tool, reply with ONLY a JSON object of the form \
             {\"name\": \"<tool>\", \"arguments\": {...}} and nothing else. \
             You will receive the result and can then call another tool or answer.\n\n",
        );
        for tool in tools {
            let _ = writeln!(
                out,
                "- {}: {}\n  arguments schema: {}",
                tool.function.name, tool.function.description, tool.function.parameters
            );
        }
        out.push('\n');
    }

    out.push_str("## Conversation\n\n");
    for message in messages.iter().filter(|m| m.role != Role::System) {
        match message.role {
            Role::User => {
                let _ = writeln!(out, "USER: {}\n", message.content);
            }
            Role::Assistant => {
                let _ = write!(out, "ASSISTANT: {}", message.content);
                for call in message.tool_calls.iter().flatten() {
                    let _ = write!(
                        out,
                        "\n{}",
                        serde_json::json!({
                            "name": call.function.name,
                            "arguments": call.function.arguments,
                        })
                    );
                }
                out.push_str("\n\n");
            }
            Role::Tool => {
                let name = message.tool_name.as_deref().unwrap_or("tool");
                let _ = writeln!(out, "TOOL RESULT ({}):\n{}\n", name, message.content);
            }
            Role::System => {}
        }
    }
    out.push_str("ASSISTANT:");
    out
}

#[async_trait]
impl ReasoningBackend for CliBackend {
    fn name(&self) -> &str {
        "cli"
    }

    fn supports_images(&self) -> bool {
        false
    }

    async fn generate(&self, request: &GenerateRequest<'_>) -> Result<Generation, BackendError> {
        if request.has_images() {
            return Err(BackendError::Capability("image attachments"));
        }

        let prompt = render_transcript(request.messages, request.tools);
        let args = self.command_args(request.model);
        let timeout = Duration::from_secs(self.config.timeout_secs);

        debug!(
            program = %self.config.program,
            prompt_bytes = prompt.len(),
            "Spawning CLI backend"
        );

        let mut child = Command::new(&self.config.program)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                BackendError::Transport(format!("failed to start {}: {}", self.config.program, e))
            })?;

        // Write on a separate task so a chatty child cannot fill its stdout pipe
        // while we are still blocked on stdin. Dropping stdin closes the pipe.
        let writer = child.stdin.take().map(|mut stdin| {
            let prompt = prompt.into_bytes();
            tokio::spawn(async move { stdin.write_all(&prompt).await })
        });

        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(|e| BackendError::Transport(e.to_string()))?,
            Err(_) => {
                warn!(program = %self.config.program, ?timeout, "CLI backend timed out");
                return Err(BackendError::Timeout(timeout));
            }
        };

        if let Some(writer) = writer {
            if let Ok(Err(e)) = writer.await {
                debug!(error = %e, "CLI backend closed stdin early");
            }
        }

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        if !output.status.success() {
            let code = output.status.code().unwrap_or(-1);
            warn!(program = %self.config.program, code, "CLI backend exited with error");
            let detail = if stderr.trim().is_empty() { &stdout } else { &stderr };
            return Err(classify_text(detail).unwrap_or_else(|| BackendError::Status {
                status: code.clamp(0, u16::MAX as i32) as u16,
                body: detail.trim().chars().take(500).collect(),
            }));
        }

        // Some CLIs exit 0 but print the failure
        if stdout.trim().is_empty() {
            return Err(classify_text(&stderr).unwrap_or_else(|| {
                BackendError::InvalidResponse("CLI produced no output".to_string())
            }));
        }

        let tool_calls = parse_tool_calls_from_text(&stdout);
        let content = if tool_calls.is_empty() {
            stdout.trim().to_string()
        } else {
            strip_tool_call_text(&stdout)
        };

        Ok(Generation {
            content,
            tool_calls,
            usage: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ToolCall;

    fn backend(program: &str, args: &[&str]) -> CliBackend {
        CliBackend::new(CliBackendConfig {
            program: program.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            model_flag: None,
            timeout_secs: 5,
        })
    }

    #[test]
    fn test_render_transcript() {
        let tools = vec![Tool::function(
            "disk_usage",
            "Show disk usage",
            serde_json::json!({"type": "object", "properties": {}}),
        )];
        let messages = vec![
            ChatMessage::system("You are a server assistant."),
            ChatMessage::user("disk?"),
            ChatMessage::assistant_with_tools(
                "",
                vec![ToolCall::new("disk_usage", serde_json::json!({}))],
            ),
            ChatMessage::tool("/dev/sda1 40%", "disk_usage", "call_1"),
        ];
        let text = render_transcript(&messages, &tools);
        assert!(text.starts_with("You are a server assistant."));
        assert!(text.contains("- disk_usage: Show disk usage"));
        assert!(text.contains("USER: disk?"));
        assert!(text.contains("TOOL RESULT (disk_usage):\n/dev/sda1 40%"));
        assert!(text.ends_with("ASSISTANT:"));
    }

    #[test]
    fn test_model_flag() {
        let backend = CliBackend::new(CliBackendConfig::default());
        assert_eq!(backend.command_args(Some("opus")), vec!["-p", "--model", "opus"]);
        assert_eq!(backend.command_args(None), vec!["-p"]);
    }

    #[tokio::test]
    async fn test_cat_echoes_tool_call() {
        // `cat` echoes the prompt; the rendered instruction contains no tool JSON,
        // so a user message carrying one comes back as a parsed call.
        let backend = backend("cat", &[]);
        let messages = vec![ChatMessage::user(
            r#"{"name": "disk_usage", "arguments": {}}"#,
        )];
        let request = GenerateRequest {
            model: None,
            messages: &messages,
            tools: &[],
        };
        let generation = backend.generate(&request).await.unwrap();
        assert_eq!(generation.tool_calls.len(), 1);
        assert!(generation.usage.is_none());
    }

    #[tokio::test]
    async fn test_nonzero_exit_classified() {
        let backend = backend("sh", &["-c", "echo 'Error: invalid api key' >&2; exit 1"]);
        let messages = vec![ChatMessage::user("hi")];
        let request = GenerateRequest {
            model: None,
            messages: &messages,
            tools: &[],
        };
        let err = backend.generate(&request).await.unwrap_err();
        assert_eq!(err.kind(), "auth");
    }

    #[tokio::test]
    async fn test_images_rejected() {
        let backend = backend("cat", &[]);
        let messages = vec![ChatMessage::user("look").with_images(vec!["aGk=".into()])];
        let request = GenerateRequest {
            model: None,
            messages: &messages,
            tools: &[],
        };
        assert_eq!(backend.generate(&request).await.unwrap_err().kind(), "capability");
    }

    #[tokio::test]
    async fn test_missing_program_is_transport_error() {
        let backend = backend("/nonexistent/hostscope-cli", &[]);
        let messages = vec![ChatMessage::user("hi")];
        let request = GenerateRequest {
            model: None,
            messages: &messages,
            tools: &[],
        };
        assert_eq!(backend.generate(&request).await.unwrap_err().kind(), "transport");
    }
}
