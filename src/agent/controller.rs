//! Agent Controller - main orchestration loop for tool-using diagnostics
//!
//! The AgentController drives one `ReasoningBackend` through rounds of
//! generate → tool calls → execute → feed results back, until the model
//! answers in plain text or a cap is reached. Round counting and cap
//! enforcement live here so both backends share one state machine.

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::llm::{
    BackendError, ChatMessage, GenerateRequest, ImageAttachment, ReasoningBackend, ToolCall, Usage,
};
use crate::metrics::{AGENT_ITERATIONS, AGENT_TOOL_CALLS, AGENT_TURNS, LLM_CALL_TIME, LLM_TOKENS};
use crate::security::redact_json;
use crate::tools::{truncate_chars, ToolRouter, UserConfig};

/// Default system prompt for the diagnostics assistant
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a server diagnostics assistant with read-only \
access to this host through tools. Use tools to check facts before answering; never guess at \
state you can observe. Prefer the specific tools over run_command. Call one tool at a time and \
read its result before deciding the next step. When you have enough information, answer \
concisely in plain text, quoting the relevant lines. You cannot change anything on the server; \
if a fix is needed, describe the commands an operator should run.";

/// Default length of tool output kept in the audit trail
pub const OUTPUT_PREVIEW_CHARS: usize = 500;

/// Configuration for the agent controller
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Model to request; `None` uses the backend's configured default
    pub model: Option<String>,
    /// Maximum number of generation rounds per question
    pub max_iterations: usize,
    /// Maximum number of tool invocations per question
    pub max_tool_calls: usize,
    /// Custom system prompt (uses default if None)
    pub system_prompt: Option<String>,
    /// Length of tool output kept in each `ToolCallTrace`
    pub output_preview_chars: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            model: None,
            max_iterations: 10,
            max_tool_calls: 15,
            system_prompt: None,
            output_preview_chars: OUTPUT_PREVIEW_CHARS,
        }
    }
}

/// Per-question options
#[derive(Debug, Clone, Default)]
pub struct AskOptions {
    /// Images attached to the question
    pub images: Vec<ImageAttachment>,
    /// Correlation id for logs; generated when absent
    pub trace_id: Option<String>,
}

/// How a turn ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The model answered without requesting tools
    Done,
    MaxToolCalls,
    MaxIterations,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            StopReason::Done => "done",
            StopReason::MaxToolCalls => "max_tool_calls",
            StopReason::MaxIterations => "max_iterations",
        }
    }
}

/// Audit record of one tool call
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolCallTrace {
    pub id: String,
    pub name: String,
    /// Arguments with secrets redacted
    pub input: serde_json::Value,
    /// Start of the (already redacted) output
    pub output_preview: String,
    pub duration_ms: u64,
    pub success: bool,
}

/// Result of one question
#[derive(Debug, Clone, Serialize)]
pub struct AgentReply {
    pub response: String,
    pub tool_calls: Vec<ToolCallTrace>,
    pub usage: Usage,
    /// False when the backend could not report token counts
    pub usage_reported: bool,
    pub iterations: usize,
    pub stop: StopReason,
    pub trace_id: String,
}

/// Error type for agent operations
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("reasoning backend failed in round {iteration}: {source}")]
    Provider {
        iteration: usize,
        #[source]
        source: BackendError,
    },
}

impl AgentError {
    pub fn kind(&self) -> &'static str {
        match self {
            AgentError::Provider { source, .. } => source.kind(),
        }
    }

    pub fn hint(&self) -> &'static str {
        match self {
            AgentError::Provider { source, .. } => source.hint(),
        }
    }

    pub fn backend_error(&self) -> &BackendError {
        match self {
            AgentError::Provider { source, .. } => source,
        }
    }
}

/// Agent Controller orchestrating the backend and tool router
pub struct AgentController {
    backend: Arc<dyn ReasoningBackend>,
    router: Arc<ToolRouter>,
    config: AgentConfig,
}

impl AgentController {
    /// Create a new agent controller
    ///
    /// # Arguments
    /// * `backend` - Reasoning backend (HTTP or CLI)
    /// * `router` - Tool router in front of the sandbox
    /// * `config` - Agent configuration
    pub fn new(
        backend: Arc<dyn ReasoningBackend>,
        router: Arc<ToolRouter>,
        config: AgentConfig,
    ) -> Self {
        Self {
            backend,
            router,
            config,
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn backend(&self) -> &Arc<dyn ReasoningBackend> {
        &self.backend
    }

    /// Answer one question
    ///
    /// # Arguments
    /// * `question` - The user's question
    /// * `history` - Earlier user/assistant messages in this thread, oldest first
    /// * `user` - Per-user settings (model override, tool access)
    /// * `options` - Images and trace id
    ///
    /// # Returns
    /// `AgentReply` for both a final answer and a capped turn. Only backend
    /// failures are errors.
    pub async fn ask(
        &self,
        question: &str,
        history: &[ChatMessage],
        user: &UserConfig,
        options: AskOptions,
    ) -> Result<AgentReply, AgentError> {
        let trace_id = options
            .trace_id
            .clone()
            .unwrap_or_else(|| Uuid::now_v7().to_string());
        let model = user.model.as_deref().or(self.config.model.as_deref());

        let root_span = info_span!(
            "agent_turn",
            trace_id = %trace_id,
            user = %user.user_id,
            backend = self.backend.name(),
            otel.name = "agent_turn"
        );

        async {
            if !options.images.is_empty() && !self.backend.supports_images() {
                warn!(backend = self.backend.name(), "Images sent to a backend without image support");
                AGENT_TURNS.with_label_values(&["provider_error"]).inc();
                return Err(AgentError::Provider {
                    iteration: 0,
                    source: BackendError::Capability("image attachments"),
                });
            }

            info!(history = history.len(), images = options.images.len(), "Starting agent turn");

            let tools = self.router.catalog(user);

            // Initialize conversation
            let mut messages = Vec::with_capacity(history.len() + 2);
            let system_prompt = self
                .config
                .system_prompt
                .as_deref()
                .unwrap_or(DEFAULT_SYSTEM_PROMPT);
            messages.push(ChatMessage::system(system_prompt));
            messages.extend(history.iter().cloned());
            messages.push(
                ChatMessage::user(question)
                    .with_images(options.images.iter().map(|i| i.data_base64.clone()).collect()),
            );

            let mut turn = Turn::new(trace_id.clone());

            loop {
                if turn.iterations >= self.config.max_iterations {
                    warn!(iterations = turn.iterations, "Max iterations reached");
                    let notice = format!(
                        "I stopped after {} reasoning rounds (the per-question limit) without reaching a final answer.",
                        self.config.max_iterations
                    );
                    return Ok(turn.finish_capped(&notice, StopReason::MaxIterations));
                }
                turn.iterations += 1;
                let iteration = turn.iterations;

                let llm_span = info_span!("llm_call", iteration, otel.name = "llm_call");
                let call_start = Instant::now();
                let request = GenerateRequest {
                    model,
                    messages: &messages,
                    tools: &tools,
                };
                let generation = match self.backend.generate(&request).instrument(llm_span).await {
                    Ok(generation) => generation,
                    Err(source) => {
                        warn!(iteration, kind = source.kind(), error = %source, "Backend call failed");
                        AGENT_TURNS.with_label_values(&["provider_error"]).inc();
                        return Err(AgentError::Provider { iteration, source });
                    }
                };
                let call_secs = call_start.elapsed().as_secs_f64();
                LLM_CALL_TIME
                    .with_label_values(&[self.backend.name()])
                    .observe(call_secs);
                debug!(
                    iteration,
                    duration_ms = (call_secs * 1000.0) as u64,
                    tool_calls = generation.tool_calls.len(),
                    "LLM call completed"
                );
                turn.record_usage(generation.usage);

                // Images go out with the first request only
                if iteration == 1 {
                    for message in messages.iter_mut() {
                        message.images = None;
                    }
                }

                if !generation.content.trim().is_empty() {
                    turn.last_text = generation.content.clone();
                }

                if generation.tool_calls.is_empty() {
                    info!(iterations = iteration, tool_calls = turn.traces.len(), "Agent turn completed");
                    return Ok(turn.finish(generation.content, StopReason::Done));
                }

                // Give every call an id so results can be matched up
                let tool_calls: Vec<ToolCall> = generation
                    .tool_calls
                    .into_iter()
                    .enumerate()
                    .map(|(i, mut call)| {
                        if call.id.is_none() {
                            call.id = Some(format!("call_{}_{}", iteration, i));
                        }
                        call
                    })
                    .collect();
                messages.push(ChatMessage::assistant_with_tools(
                    generation.content,
                    tool_calls.clone(),
                ));

                // Strictly one after another, in the order the model asked
                for call in tool_calls {
                    if turn.traces.len() >= self.config.max_tool_calls {
                        warn!(tool_calls = turn.traces.len(), "Max tool calls reached");
                        let notice = format!(
                            "I stopped after {} tool calls (the per-question limit) before finishing the investigation.",
                            self.config.max_tool_calls
                        );
                        return Ok(turn.finish_capped(&notice, StopReason::MaxToolCalls));
                    }

                    let (trace, content) = self.run_tool(&call, user).await;
                    messages.push(ChatMessage::tool(content, trace.name.clone(), trace.id.clone()));
                    turn.traces.push(trace);
                }
            }
        }
        .instrument(root_span)
        .await
    }

    /// Execute one call, returning its audit record and the content for the model
    async fn run_tool(&self, call: &ToolCall, user: &UserConfig) -> (ToolCallTrace, String) {
        let id = call.id.clone().unwrap_or_default();
        let name = call.function.name.as_str();

        let exec_span = info_span!("tool_call", tool = %name, otel.name = "tool_call");
        let start = Instant::now();
        let outcome = self
            .router
            .execute(&id, name, &call.function.arguments, user)
            .instrument(exec_span)
            .await;
        let duration_ms = start.elapsed().as_millis() as u64;

        let status = if outcome.is_error { "error" } else { "ok" };
        AGENT_TOOL_CALLS.with_label_values(&[name, status]).inc();

        let mut input = call.function.arguments.clone();
        redact_json(&mut input);
        info!(tool = %name, input = %input, duration_ms, success = !outcome.is_error, "Tool call finished");

        let trace = ToolCallTrace {
            id,
            name: name.to_string(),
            input,
            output_preview: truncate_chars(&outcome.content, self.config.output_preview_chars),
            duration_ms,
            success: !outcome.is_error,
        };
        (trace, outcome.content)
    }
}

/// Loop state for one question
struct Turn {
    iterations: usize,
    traces: Vec<ToolCallTrace>,
    usage: Usage,
    usage_reported: bool,
    last_text: String,
    trace_id: String,
}

impl Turn {
    fn new(trace_id: String) -> Self {
        Self {
            iterations: 0,
            traces: Vec::new(),
            usage: Usage::default(),
            usage_reported: true,
            last_text: String::new(),
            trace_id,
        }
    }

    fn record_usage(&mut self, round: Option<Usage>) {
        match round {
            Some(round) => {
                self.usage.add(round);
                LLM_TOKENS.with_label_values(&["input"]).inc_by(round.input_tokens);
                LLM_TOKENS.with_label_values(&["output"]).inc_by(round.output_tokens);
            }
            None => self.usage_reported = false,
        }
    }

    fn finish_capped(self, notice: &str, stop: StopReason) -> AgentReply {
        let response = capped_response(notice, &self.last_text);
        self.finish(response, stop)
    }

    fn finish(self, response: String, stop: StopReason) -> AgentReply {
        AGENT_TURNS.with_label_values(&[stop.as_str()]).inc();
        AGENT_ITERATIONS.observe(self.iterations as f64);
        AgentReply {
            response,
            tool_calls: self.traces,
            usage: self.usage,
            usage_reported: self.usage_reported,
            iterations: self.iterations,
            stop,
            trace_id: self.trace_id,
        }
    }
}

/// Explain the cap, keeping whatever the model said last
fn capped_response(notice: &str, last_text: &str) -> String {
    if last_text.trim().is_empty() {
        notice.to_string()
    } else {
        format!("{}\n\nWhat I had so far:\n{}", notice, last_text.trim())
    }
}
