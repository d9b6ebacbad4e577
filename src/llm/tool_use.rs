//! Chat wire types with tool calling support
//!
//! These follow Ollama's `/api/chat` message shape, which is also what the
//! CLI backend renders into its prompt.

use serde::{Deserialize, Serialize};

/// Who said it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "system" => Some(Role::System),
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            "tool" => Some(Role::Tool),
            _ => None,
        }
    }
}

/// A message in a chat conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    /// Base64-encoded images (user messages only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub images: Option<Vec<String>>,
    /// Name of the tool that produced this result (tool messages only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: None,
            images: None,
            tool_name: None,
            tool_call_id: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// Assistant reply that requested tools
    pub fn assistant_with_tools(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        let mut message = Self::new(Role::Assistant, content);
        if !tool_calls.is_empty() {
            message.tool_calls = Some(tool_calls);
        }
        message
    }

    /// Result of one tool call, fed back to the model
    pub fn tool(
        content: impl Into<String>,
        tool_name: impl Into<String>,
        tool_call_id: impl Into<String>,
    ) -> Self {
        let mut message = Self::new(Role::Tool, content);
        message.tool_name = Some(tool_name.into());
        message.tool_call_id = Some(tool_call_id.into());
        message
    }

    pub fn with_images(mut self, images: Vec<String>) -> Self {
        if !images.is_empty() {
            self.images = Some(images);
        }
        self
    }

    pub fn has_images(&self) -> bool {
        self.images.as_ref().map(|i| !i.is_empty()).unwrap_or(false)
    }
}

/// A tool call from the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub function: FunctionCall,
}

impl ToolCall {
    pub fn new(name: impl Into<String>, arguments: serde_json::Value) -> Self {
        Self {
            id: None,
            function: FunctionCall {
                name: name.into(),
                arguments,
            },
        }
    }
}

/// Function call details
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    #[serde(default)]
    pub arguments: serde_json::Value,
}

/// Tool definition for the model
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Tool {
    #[serde(rename = "type")]
    pub tool_type: String, // Always "function"
    pub function: ToolFunction,
}

/// Function specification for a tool
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolFunction {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value, // JSON Schema
}

impl Tool {
    pub fn function(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: serde_json::Value,
    ) -> Self {
        Self {
            tool_type: "function".to_string(),
            function: ToolFunction {
                name: name.into(),
                description: description.into(),
                parameters,
            },
        }
    }
}

/// Try to parse tool calls from the response content text
///
/// Used by backends without native tool calling: the model is asked to reply
/// with `{"name": "...", "arguments": {...}}` objects, which may be embedded
/// in surrounding prose or fenced code blocks.
pub fn parse_tool_calls_from_text(content: &str) -> Vec<ToolCall> {
    find_tool_calls(content).into_iter().map(|(_, call)| call).collect()
}

/// Strip tool-call JSON out of a reply, leaving the prose around it
pub fn strip_tool_call_text(content: &str) -> String {
    let mut remaining = String::with_capacity(content.len());
    let mut last = 0;
    for (span, _) in find_tool_calls(content) {
        remaining.push_str(&content[last..span.start]);
        last = span.end;
    }
    remaining.push_str(&content[last..]);
    remaining
        .replace("```json", "")
        .replace("```", "")
        .trim()
        .to_string()
}

/// Top-level JSON objects in `content` that parse as tool calls, with their byte spans
fn find_tool_calls(content: &str) -> Vec<(std::ops::Range<usize>, ToolCall)> {
    let mut tool_calls = Vec::new();
    let mut depth = 0usize;
    let mut start = None;
    let mut in_string = false;
    let mut escaped = false;

    for (i, c) in content.char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' if depth > 0 => in_string = true,
            '{' => {
                if depth == 0 {
                    start = Some(i);
                }
                depth += 1;
            }
            '}' if depth > 0 => {
                depth -= 1;
                if depth == 0 {
                    if let Some(s) = start.take() {
                        if let Some(tool_call) = try_parse_tool_call(&content[s..=i]) {
                            tool_calls.push((s..i + 1, tool_call));
                        }
                    }
                }
            }
            _ => {}
        }
    }

    tool_calls
}

fn try_parse_tool_call(json_str: &str) -> Option<ToolCall> {
    let value = serde_json::from_str::<serde_json::Value>(json_str).ok()?;
    parse_tool_call_from_value(&value)
}

/// Parse a tool call from `{"name": ..., "arguments"|"parameters": {...}}`
fn parse_tool_call_from_value(value: &serde_json::Value) -> Option<ToolCall> {
    // Also accept the native shape: {"function": {"name": ..., "arguments": ...}}
    let value = value.get("function").unwrap_or(value);
    let name = value.get("name").and_then(|n| n.as_str())?;

    let arguments = value
        .get("arguments")
        .or_else(|| value.get("parameters"))
        .cloned()
        .unwrap_or_else(|| serde_json::json!({}));

    // Some models double-encode arguments as a JSON string
    let arguments = match arguments {
        serde_json::Value::String(s) => serde_json::from_str(&s).unwrap_or(serde_json::Value::String(s)),
        other => other,
    };
    if !arguments.is_object() {
        return None;
    }

    Some(ToolCall::new(name, arguments))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bare_json() {
        let calls = parse_tool_calls_from_text(r#"{"name": "disk_usage", "arguments": {}}"#);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].function.name, "disk_usage");
    }

    #[test]
    fn test_parse_embedded_json_with_braces_in_strings() {
        let text = r#"Let me check.
```json
{"name": "container_status", "arguments": {"name": "web"}}
```
and also {"name": "run_command", "arguments": {"program": "docker", "argv": ["ps", "--format", "{{.Names}}"]}}"#;
        let calls = parse_tool_calls_from_text(text);
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1].function.arguments["argv"][2], "{{.Names}}");
    }

    #[test]
    fn test_parse_string_encoded_arguments() {
        let calls = parse_tool_calls_from_text(
            r#"{"function": {"name": "read_log", "arguments": "{\"target\": \"auth\"}"}}"#,
        );
        assert_eq!(calls[0].function.arguments["target"], "auth");
    }

    #[test]
    fn test_plain_text_has_no_calls() {
        assert!(parse_tool_calls_from_text("All containers are healthy.").is_empty());
        assert!(parse_tool_calls_from_text("{not json}").is_empty());
    }

    #[test]
    fn test_strip_tool_call_text() {
        let text = "Checking disk.\n```json\n{\"name\": \"disk_usage\", \"arguments\": {}}\n```";
        assert_eq!(strip_tool_call_text(text), "Checking disk.");
        assert_eq!(strip_tool_call_text("no calls here"), "no calls here");
    }

    #[test]
    fn test_role_round_trip_names() {
        for role in [Role::System, Role::User, Role::Assistant, Role::Tool] {
            assert_eq!(Role::parse(role.as_str()), Some(role));
        }
    }
}
