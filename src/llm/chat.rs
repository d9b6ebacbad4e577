//! HTTP function-calling backend
//!
//! This module provides a client for Ollama's `/api/chat` endpoint with
//! native tool calling. Token usage comes from `prompt_eval_count` and
//! `eval_count` in the response.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::tool_use::{parse_tool_calls_from_text, strip_tool_call_text, ChatMessage};
use super::{BackendError, GenerateRequest, Generation, ReasoningBackend, Usage};

/// Settings for the HTTP backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatBackendConfig {
    /// Base URL of the server (e.g., "http://localhost:11434")
    pub base_url: String,
    pub model: String,
    pub temperature: f32,
    pub timeout_secs: u64,
    /// Sent as a bearer token when set (for proxies in front of the server)
    pub api_key: Option<String>,
    /// Whether the configured model accepts images
    pub vision: bool,
}

impl Default for ChatBackendConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".to_string(),
            model: "qwen3".to_string(),
            temperature: 0.0,
            timeout_secs: 120,
            api_key: None,
            vision: false,
        }
    }
}

/// Response from /api/chat
#[derive(Debug, Clone, Deserialize)]
struct ChatResponse {
    message: ChatMessage,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    prompt_eval_count: Option<u64>,
    #[serde(default)]
    eval_count: Option<u64>,
}

/// Client for Ollama's /api/chat endpoint with tool support
#[derive(Clone)]
pub struct ChatBackend {
    config: ChatBackendConfig,
    client: reqwest::Client,
}

impl ChatBackend {
    pub fn new(config: ChatBackendConfig) -> Result<Self, BackendError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| BackendError::Transport(e.to_string()))?;
        Ok(Self { config, client })
    }

    pub fn config(&self) -> &ChatBackendConfig {
        &self.config
    }

    fn endpoint(&self) -> String {
        format!("{}/api/chat", self.config.base_url.trim_end_matches('/'))
    }

    fn map_send_error(&self, e: reqwest::Error) -> BackendError {
        if e.is_timeout() {
            BackendError::Timeout(Duration::from_secs(self.config.timeout_secs))
        } else {
            BackendError::Transport(e.to_string())
        }
    }
}

#[async_trait]
impl ReasoningBackend for ChatBackend {
    fn name(&self) -> &str {
        "chat"
    }

    fn supports_images(&self) -> bool {
        self.config.vision
    }

    async fn generate(&self, request: &GenerateRequest<'_>) -> Result<Generation, BackendError> {
        if request.has_images() && !self.supports_images() {
            return Err(BackendError::Capability("image attachments"));
        }

        let model = request.model.unwrap_or(&self.config.model);
        let mut body = serde_json::json!({
            "model": model,
            "messages": request.messages,
            "stream": false,
            "options": {
                "temperature": self.config.temperature
            }
        });
        if !request.tools.is_empty() {
            body["tools"] = serde_json::to_value(request.tools)
                .map_err(|e| BackendError::InvalidResponse(e.to_string()))?;
        }

        let mut http = self.client.post(self.endpoint()).json(&body);
        if let Some(key) = &self.config.api_key {
            http = http.bearer_auth(key);
        }

        let start = Instant::now();
        let response = http.send().await.map_err(|e| self.map_send_error(e))?;
        let status = response.status();
        let text = response.text().await.map_err(|e| self.map_send_error(e))?;
        debug!(
            model,
            status = status.as_u16(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Chat response received"
        );

        if !status.is_success() {
            warn!(model, status = status.as_u16(), "Chat backend returned error status");
            return Err(BackendError::from_status(status.as_u16(), text));
        }
        if text.is_empty() {
            return Err(BackendError::InvalidResponse("empty response body".to_string()));
        }

        let parsed: ChatResponse = serde_json::from_str(&text)
            .map_err(|e| BackendError::InvalidResponse(e.to_string()))?;
        if !parsed.done {
            debug!(model, "Chat response not marked done");
        }

        let usage = match (parsed.prompt_eval_count, parsed.eval_count) {
            (None, None) => None,
            (input, output) => Some(Usage::new(input.unwrap_or(0), output.unwrap_or(0))),
        };

        let mut content = parsed.message.content;
        let mut tool_calls = parsed.message.tool_calls.unwrap_or_default();

        // Some models answer with tool-call JSON in content instead of tool_calls
        if tool_calls.is_empty() {
            let from_text = parse_tool_calls_from_text(&content);
            if !from_text.is_empty() {
                debug!(count = from_text.len(), "Parsed tool calls from content text");
                content = strip_tool_call_text(&content);
                tool_calls = from_text;
            }
        }

        Ok(Generation {
            content,
            tool_calls,
            usage,
        })
    }
}
