//! Integration tests for the agent loop
//!
//! A scripted backend stands in for the model: each `generate` call pops the
//! next canned response and records the request it was given.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::json;

use hostscope::agent::{AgentConfig, AgentController, AskOptions, StopReason};
use hostscope::llm::{
    BackendError, ChatMessage, GenerateRequest, Generation, ImageAttachment, ReasoningBackend, Role,
    ToolCall, Usage,
};
use hostscope::sandbox::{CommandRule, Sandbox, SandboxPolicy};
use hostscope::tools::{ToolRouter, UserConfig};

type Step = Result<Generation, BackendError>;

struct ScriptedBackend {
    steps: Mutex<VecDeque<Step>>,
    requests: Mutex<Vec<Vec<ChatMessage>>>,
    images: bool,
}

impl ScriptedBackend {
    fn new(steps: Vec<Step>) -> Self {
        Self {
            steps: Mutex::new(steps.into()),
            requests: Mutex::new(Vec::new()),
            images: false,
        }
    }

    fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    fn request(&self, n: usize) -> Vec<ChatMessage> {
        self.requests.lock().unwrap()[n].clone()
    }
}

#[async_trait]
impl ReasoningBackend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    fn supports_images(&self) -> bool {
        self.images
    }

    async fn generate(&self, request: &GenerateRequest<'_>) -> Result<Generation, BackendError> {
        self.requests.lock().unwrap().push(request.messages.to_vec());
        self.steps
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(answer("out of script", Some(Usage::default()))))
    }
}

fn answer(text: &str, usage: Option<Usage>) -> Generation {
    Generation {
        content: text.to_string(),
        tool_calls: vec![],
        usage,
    }
}

fn calls(text: &str, calls: Vec<ToolCall>, usage: Option<Usage>) -> Generation {
    Generation {
        content: text.to_string(),
        tool_calls: calls,
        usage,
    }
}

fn echo(word: &str) -> ToolCall {
    ToolCall::new("run_command", json!({"program": "echo", "argv": [word]}))
}

fn controller(backend: Arc<ScriptedBackend>, config: AgentConfig) -> AgentController {
    let mut policy = SandboxPolicy::default();
    policy.commands.insert("echo".to_string(), CommandRule::default());
    let router = ToolRouter::new(Sandbox::new(policy));
    AgentController::new(backend, Arc::new(router), config)
}

#[tokio::test]
async fn test_direct_answer() {
    let backend = Arc::new(ScriptedBackend::new(vec![Ok(answer(
        "All services are up.",
        Some(Usage::new(120, 8)),
    ))]));
    let agent = controller(backend.clone(), AgentConfig::default());

    let reply = agent
        .ask("status?", &[], &UserConfig::new("alice"), AskOptions::default())
        .await
        .unwrap();

    assert_eq!(reply.response, "All services are up.");
    assert_eq!(reply.stop, StopReason::Done);
    assert_eq!(reply.iterations, 1);
    assert!(reply.tool_calls.is_empty());
    assert_eq!(reply.usage, Usage::new(120, 8));
    assert!(reply.usage_reported);
    assert!(!reply.trace_id.is_empty());
}

#[tokio::test]
async fn test_tool_result_fed_back() {
    let backend = Arc::new(ScriptedBackend::new(vec![
        Ok(calls("Checking.", vec![echo("pong")], Some(Usage::new(100, 10)))),
        Ok(answer("The echo said pong.", Some(Usage::new(150, 12)))),
    ]));
    let agent = controller(backend.clone(), AgentConfig::default());

    let reply = agent
        .ask("ping?", &[], &UserConfig::new("alice"), AskOptions::default())
        .await
        .unwrap();

    assert_eq!(reply.response, "The echo said pong.");
    assert_eq!(reply.iterations, 2);
    assert_eq!(reply.usage, Usage::new(250, 22));
    assert_eq!(reply.tool_calls.len(), 1);
    let trace = &reply.tool_calls[0];
    assert_eq!(trace.name, "run_command");
    assert_eq!(trace.id, "call_1_0");
    assert!(trace.success);
    assert!(trace.output_preview.contains("pong"));

    // Second request: system, user, assistant(tool call), tool result
    let second = backend.request(1);
    assert_eq!(second.len(), 4);
    assert_eq!(second[2].role, Role::Assistant);
    assert_eq!(second[2].tool_calls.as_ref().map(Vec::len), Some(1));
    assert_eq!(second[3].role, Role::Tool);
    assert_eq!(second[3].tool_call_id.as_deref(), Some("call_1_0"));
    assert!(second[3].content.contains("pong"));
}

#[tokio::test]
async fn test_unknown_tool_error_fed_back() {
    let backend = Arc::new(ScriptedBackend::new(vec![
        Ok(calls("", vec![ToolCall::new("reboot_host", json!({}))], None)),
        Ok(answer("I can't reboot hosts.", None)),
    ]));
    let agent = controller(backend.clone(), AgentConfig::default());

    let reply = agent
        .ask("reboot it", &[], &UserConfig::new("alice"), AskOptions::default())
        .await
        .unwrap();

    assert_eq!(reply.stop, StopReason::Done);
    assert!(!reply.tool_calls[0].success);
    let fed_back = &backend.request(1)[3];
    assert!(fed_back.content.contains("Unknown tool 'reboot_host'"));
}

#[tokio::test]
async fn test_policy_violation_fed_back() {
    let backend = Arc::new(ScriptedBackend::new(vec![
        Ok(calls(
            "",
            vec![ToolCall::new("run_command", json!({"program": "rm", "argv": ["-rf", "/tmp/x"]}))],
            None,
        )),
        Ok(answer("Not allowed.", None)),
    ]));
    let agent = controller(backend.clone(), AgentConfig::default());

    let reply = agent
        .ask("clean tmp", &[], &UserConfig::new("alice"), AskOptions::default())
        .await
        .unwrap();

    assert_eq!(reply.response, "Not allowed.");
    assert!(!reply.tool_calls[0].success);
    assert!(backend.request(1)[3].content.contains("policy violation"));
}

#[tokio::test]
async fn test_max_tool_calls_cap() {
    // One round asking for more calls than the cap allows
    let backend = Arc::new(ScriptedBackend::new(vec![Ok(calls(
        "Disk looks fine so far.",
        vec![echo("a"), echo("b"), echo("c"), echo("d")],
        Some(Usage::new(10, 1)),
    ))]));
    let config = AgentConfig {
        max_tool_calls: 3,
        ..Default::default()
    };
    let agent = controller(backend.clone(), config);

    let reply = agent
        .ask("check everything", &[], &UserConfig::new("alice"), AskOptions::default())
        .await
        .unwrap();

    assert_eq!(reply.stop, StopReason::MaxToolCalls);
    assert_eq!(reply.tool_calls.len(), 3);
    assert!(reply.response.contains("3 tool calls"));
    assert!(reply.response.contains("Disk looks fine so far."));
    assert_eq!(backend.calls(), 1);
}

#[tokio::test]
async fn test_max_iterations_cap() {
    let steps = (0..5)
        .map(|i| Ok(calls("", vec![echo(&i.to_string())], None)))
        .collect();
    let backend = Arc::new(ScriptedBackend::new(steps));
    let config = AgentConfig {
        max_iterations: 2,
        ..Default::default()
    };
    let agent = controller(backend.clone(), config);

    let reply = agent
        .ask("loop", &[], &UserConfig::new("alice"), AskOptions::default())
        .await
        .unwrap();

    assert_eq!(reply.stop, StopReason::MaxIterations);
    assert_eq!(reply.iterations, 2);
    assert_eq!(backend.calls(), 2);
    assert!(reply.response.contains("2 reasoning rounds"));
    // A backend that never reported usage
    assert!(!reply.usage_reported);
}

#[tokio::test]
async fn test_provider_error_aborts() {
    let backend = Arc::new(ScriptedBackend::new(vec![
        Ok(calls("", vec![echo("x")], None)),
        Err(BackendError::Quota("monthly limit reached".to_string())),
    ]));
    let agent = controller(backend.clone(), AgentConfig::default());

    let err = agent
        .ask("hi", &[], &UserConfig::new("alice"), AskOptions::default())
        .await
        .unwrap_err();

    assert_eq!(err.kind(), "quota");
    assert!(err.hint().contains("quota"));
    assert!(err.to_string().contains("round 2"));
}

#[tokio::test]
async fn test_images_rejected_before_any_call() {
    let backend = Arc::new(ScriptedBackend::new(vec![]));
    let agent = controller(backend.clone(), AgentConfig::default());
    let options = AskOptions {
        images: vec![ImageAttachment {
            media_type: "image/png".to_string(),
            data_base64: "iVBORw0KGgo=".to_string(),
        }],
        trace_id: None,
    };

    let err = agent
        .ask("what is this graph?", &[], &UserConfig::new("alice"), options)
        .await
        .unwrap_err();

    assert_eq!(err.kind(), "capability");
    assert_eq!(backend.calls(), 0);
}

#[tokio::test]
async fn test_images_sent_on_first_round_only() {
    let mut scripted = ScriptedBackend::new(vec![
        Ok(calls("", vec![echo("x")], None)),
        Ok(answer("A CPU graph.", None)),
    ]);
    scripted.images = true;
    let backend = Arc::new(scripted);
    let agent = controller(backend.clone(), AgentConfig::default());
    let options = AskOptions {
        images: vec![ImageAttachment {
            media_type: "image/png".to_string(),
            data_base64: "iVBORw0KGgo=".to_string(),
        }],
        trace_id: Some("trace-1".to_string()),
    };

    let reply = agent
        .ask("what is this graph?", &[], &UserConfig::new("alice"), options)
        .await
        .unwrap();

    assert_eq!(reply.trace_id, "trace-1");
    assert!(backend.request(0)[1].has_images());
    assert!(backend.request(1).iter().all(|m| !m.has_images()));
}

#[tokio::test]
async fn test_history_passed_through() {
    let backend = Arc::new(ScriptedBackend::new(vec![Ok(answer("Still fine.", None))]));
    let agent = controller(backend.clone(), AgentConfig::default());
    let history = vec![
        ChatMessage::user("is nginx up?"),
        ChatMessage::assistant("Yes, active for 3 days."),
    ];

    agent
        .ask("and now?", &history, &UserConfig::new("alice"), AskOptions::default())
        .await
        .unwrap();

    let sent = backend.request(0);
    assert_eq!(sent.len(), 4);
    assert_eq!(sent[0].role, Role::System);
    assert_eq!(sent[1].content, "is nginx up?");
    assert_eq!(sent[2].content, "Yes, active for 3 days.");
    assert_eq!(sent[3].content, "and now?");
}

#[tokio::test]
async fn test_run_command_disabled_for_user() {
    let backend = Arc::new(ScriptedBackend::new(vec![
        Ok(calls("", vec![echo("x")], None)),
        Ok(answer("ok", None)),
    ]));
    let agent = controller(backend.clone(), AgentConfig::default());
    let mut user = UserConfig::new("guest");
    user.allow_run_command = false;

    let reply = agent
        .ask("run echo", &[], &user, AskOptions::default())
        .await
        .unwrap();

    assert!(!reply.tool_calls[0].success);
    assert!(backend.request(1)[3].content.contains("run_command"));
}
