//! Turn engine
//!
//! Runs one question end to end:
//!
//! ```text
//! Inbound ──► Governor::admit ──✗──► BudgetExceeded (no backend call)
//!                 │
//!                 ▼
//!           per-thread lock (follow-ups wait for the previous reply)
//!                 │
//!                 ▼
//!           store.create_or_get ──► AgentController::ask ──✗──► Provider (hint)
//!                 │                          │
//!                 │                          ▼
//!                 │            tool calls, reply, usage ──► store
//!                 ▼
//!           Governor::record_usage ──► TurnOutcome
//! ```
//!
//! `dispatch` wraps `handle` for chat front ends: acknowledge, post a
//! placeholder, run the turn in the background, then render the result.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::agent::{AgentController, AgentError, AskOptions, StopReason, ToolCallTrace};
use crate::config::{AppConfig, BackendConfig};
use crate::llm::{BackendError, ChatBackend, CliBackend, ImageAttachment, ReasoningBackend, Usage};
use crate::sandbox::Sandbox;
use crate::security::{Denial, Governor};
use crate::store::{call_blocking, ConversationStore, StoreError, ToolCallMeta};
use crate::tools::{ToolRouter, UserConfig};

/// A new question in a thread
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Inbound {
    pub thread_key: String,
    pub channel: String,
    pub user_id: String,
    pub text: String,
    #[serde(skip)]
    pub image: Option<ImageAttachment>,
}

impl Inbound {
    pub fn new(
        thread_key: impl Into<String>,
        channel: impl Into<String>,
        user_id: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            thread_key: thread_key.into(),
            channel: channel.into(),
            user_id: user_id.into(),
            text: text.into(),
            image: None,
        }
    }

    pub fn with_image(mut self, image: ImageAttachment) -> Self {
        self.image = Some(image);
        self
    }
}

/// Result of a completed turn
#[derive(Debug, Clone, Serialize)]
pub struct TurnOutcome {
    pub conversation_id: i64,
    pub response: String,
    pub tool_calls: Vec<ToolCallTrace>,
    pub usage: Usage,
    pub usage_reported: bool,
    pub iterations: usize,
    pub stop: StopReason,
    pub trace_id: String,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    BudgetExceeded(#[from] Denial),

    #[error(transparent)]
    Provider(#[from] AgentError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("failed to set up reasoning backend: {0}")]
    Backend(#[from] BackendError),
}

impl EngineError {
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::BudgetExceeded(denial) => denial.kind(),
            EngineError::Provider(e) => e.kind(),
            EngineError::Store(e) => e.kind(),
            EngineError::Backend(e) => e.kind(),
        }
    }

    /// Text to show the person who asked
    pub fn user_message(&self) -> String {
        match self {
            EngineError::BudgetExceeded(denial) => denial.to_string(),
            EngineError::Provider(e) => e.hint().to_string(),
            EngineError::Backend(e) => e.hint().to_string(),
            EngineError::Store(_) => {
                "Something went wrong saving this conversation. Please try again.".to_string()
            }
        }
    }
}

/// What a front end renders
#[derive(Debug, Clone, Serialize)]
pub struct Reply {
    pub text: String,
    pub is_error: bool,
    pub metadata: ReplyMetadata,
}

/// Structured details rendered alongside the text
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReplyMetadata {
    pub usage: Usage,
    pub usage_reported: bool,
    pub tool_calls: usize,
    pub iterations: usize,
    pub stop: Option<StopReason>,
    pub error_kind: Option<&'static str>,
    pub trace_id: Option<String>,
}

impl Reply {
    fn from_outcome(outcome: &TurnOutcome) -> Self {
        Self {
            text: outcome.response.clone(),
            is_error: false,
            metadata: ReplyMetadata {
                usage: outcome.usage,
                usage_reported: outcome.usage_reported,
                tool_calls: outcome.tool_calls.len(),
                iterations: outcome.iterations,
                stop: Some(outcome.stop),
                error_kind: None,
                trace_id: Some(outcome.trace_id.clone()),
            },
        }
    }

    fn from_error(error: &EngineError) -> Self {
        Self {
            text: error.user_message(),
            is_error: true,
            metadata: ReplyMetadata {
                error_kind: Some(error.kind()),
                ..Default::default()
            },
        }
    }
}

/// Outbound side of a chat front end
#[async_trait]
pub trait Responder: Send + Sync {
    /// Receipt of the question (e.g. a reaction)
    async fn acknowledge(&self, inbound: &Inbound);

    /// Interim "working on it" message
    async fn placeholder(&self, inbound: &Inbound);

    /// Final answer or error
    async fn render(&self, inbound: &Inbound, reply: Reply);
}

type ThreadId = (String, String);

/// What one sweep removed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Swept {
    pub conversations: usize,
    /// Users with no requests left in their rate-limit window
    pub idle_users: usize,
}

/// Runs turns against one backend, store and governor
pub struct Engine {
    governor: Governor,
    store: Arc<ConversationStore>,
    agent: AgentController,
    allow_run_command: bool,
    thread_locks: Mutex<HashMap<ThreadId, Arc<tokio::sync::Mutex<()>>>>,
}

impl Engine {
    pub fn new(governor: Governor, store: Arc<ConversationStore>, agent: AgentController) -> Self {
        Self {
            governor,
            store,
            agent,
            allow_run_command: true,
            thread_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Wire everything up from configuration
    pub fn from_config(config: &AppConfig) -> Result<Self, EngineError> {
        let backend: Arc<dyn ReasoningBackend> = match &config.backend {
            BackendConfig::Chat(chat) => Arc::new(ChatBackend::new(chat.clone())?),
            BackendConfig::Cli(cli) => Arc::new(CliBackend::new(cli.clone())),
        };
        let router = ToolRouter::new(Sandbox::new(config.sandbox.clone()))
            .with_max_output_chars(config.agent.tool_output_chars);
        let agent = AgentController::new(backend, Arc::new(router), config.agent_config());
        let store = ConversationStore::open(config.store.clone())?;

        let mut engine = Self::new(Governor::new(&config.governor), Arc::new(store), agent);
        engine.allow_run_command = config.agent.allow_run_command;
        Ok(engine)
    }

    pub fn store(&self) -> &Arc<ConversationStore> {
        &self.store
    }

    pub fn governor(&self) -> &Governor {
        &self.governor
    }

    pub fn agent(&self) -> &AgentController {
        &self.agent
    }

    /// Default per-user settings
    pub fn user_config(&self, user_id: &str) -> UserConfig {
        let mut user = UserConfig::new(user_id);
        user.allow_run_command = self.allow_run_command;
        user
    }

    /// Run one question to completion
    pub async fn handle(&self, inbound: Inbound, user: &UserConfig) -> Result<TurnOutcome, EngineError> {
        let span = info_span!(
            "turn",
            user = %inbound.user_id,
            thread = %inbound.thread_key,
            channel = %inbound.channel,
        );
        async {
            self.governor.admit(&inbound.user_id)?;

            let thread: ThreadId = (inbound.thread_key.clone(), inbound.channel.clone());
            let lock = self.thread_lock(&thread);
            let result = {
                let _guard = lock.lock().await;
                self.run_turn(&inbound, user).await
            };
            drop(lock);
            self.release_thread_lock(&thread);

            match &result {
                Ok(outcome) => info!(
                    conversation_id = outcome.conversation_id,
                    stop = outcome.stop.as_str(),
                    tool_calls = outcome.tool_calls.len(),
                    tokens = outcome.usage.total(),
                    "Turn finished"
                ),
                Err(e) => warn!(kind = e.kind(), error = %e, "Turn failed"),
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn run_turn(&self, inbound: &Inbound, user: &UserConfig) -> Result<TurnOutcome, EngineError> {
        let state = {
            let (thread_key, channel, user_id, text) = (
                inbound.thread_key.clone(),
                inbound.channel.clone(),
                inbound.user_id.clone(),
                inbound.text.clone(),
            );
            call_blocking(self.store.clone(), move |store| {
                store.create_or_get(&thread_key, &channel, &user_id, &text)
            })
            .await?
        };
        let conversation_id = state.conversation.id;

        let options = AskOptions {
            images: inbound.image.iter().cloned().collect(),
            trace_id: Some(Uuid::now_v7().to_string()),
        };
        let reply = self
            .agent
            .ask(&inbound.text, &state.prior_history(), user, options)
            .await?;

        // Persist before returning so a follow-up sees this reply as history
        let traces = reply.tool_calls.clone();
        let response = reply.response.clone();
        let usage = reply.usage;
        call_blocking(self.store.clone(), move |store| {
            for trace in &traces {
                store.log_tool_call(
                    conversation_id,
                    &trace.name,
                    &trace.input,
                    &trace.output_preview,
                    ToolCallMeta {
                        duration_ms: Some(trace.duration_ms),
                        success: trace.success,
                    },
                )?;
            }
            store.append_assistant(conversation_id, &response)?;
            store.record_usage(conversation_id, usage)
        })
        .await?;

        self.governor.record_usage(reply.usage.total());

        Ok(TurnOutcome {
            conversation_id,
            response: reply.response,
            tool_calls: reply.tool_calls,
            usage: reply.usage,
            usage_reported: reply.usage_reported,
            iterations: reply.iterations,
            stop: reply.stop,
            trace_id: reply.trace_id,
        })
    }

    /// Acknowledge, post a placeholder, and run the turn in the background
    pub async fn dispatch(
        self: &Arc<Self>,
        inbound: Inbound,
        user: UserConfig,
        responder: Arc<dyn Responder>,
    ) -> JoinHandle<()> {
        responder.acknowledge(&inbound).await;

        let engine = Arc::clone(self);
        tokio::spawn(async move {
            responder.placeholder(&inbound).await;
            let reply = match engine.handle(inbound.clone(), &user).await {
                Ok(outcome) => Reply::from_outcome(&outcome),
                Err(e) => Reply::from_error(&e),
            };
            responder.render(&inbound, reply).await;
        })
    }

    /// Remove idle rate-limit windows, then expired conversations
    pub async fn sweep(&self) -> Result<Swept, StoreError> {
        let idle_users = self.governor.limiter().prune_idle();
        let conversations =
            call_blocking(Arc::clone(&self.store), |store| store.sweep_expired()).await?;
        if conversations > 0 || idle_users > 0 {
            info!(conversations, idle_users, "Sweeper removed expired state");
        }
        Ok(Swept {
            conversations,
            idle_users,
        })
    }

    /// Run [`Engine::sweep`] on the store's sweep interval
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        let period = Duration::from_secs(self.store.config().sweep_interval_secs.max(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if let Err(e) = engine.sweep().await {
                    error!(error = %e, "Sweeper failed");
                }
            }
        })
    }

    fn thread_lock(&self, thread: &ThreadId) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.thread_locks.lock().unwrap_or_else(|p| p.into_inner());
        Arc::clone(locks.entry(thread.clone()).or_default())
    }

    /// Drop the lock entry once nobody else is waiting on it
    fn release_thread_lock(&self, thread: &ThreadId) {
        let mut locks = self.thread_locks.lock().unwrap_or_else(|p| p.into_inner());
        if locks.get(thread).map(|l| Arc::strong_count(l) == 1).unwrap_or(false) {
            locks.remove(thread);
        }
    }

    #[cfg(test)]
    fn tracked_threads(&self) -> usize {
        self.thread_locks.lock().unwrap_or_else(|p| p.into_inner()).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentConfig;
    use crate::llm::{GenerateRequest, Generation};
    use crate::sandbox::SandboxPolicy;
    use crate::security::GovernorConfig;
    use crate::store::StoreConfig;

    struct Echo;

    #[async_trait]
    impl ReasoningBackend for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        fn supports_images(&self) -> bool {
            false
        }

        async fn generate(&self, request: &GenerateRequest<'_>) -> Result<Generation, BackendError> {
            let last = request.messages.last().map(|m| m.content.clone()).unwrap_or_default();
            Ok(Generation {
                content: format!("you said: {} ({} messages)", last, request.messages.len()),
                tool_calls: vec![],
                usage: Some(Usage::new(10, 5)),
            })
        }
    }

    fn engine(governor: GovernorConfig) -> Engine {
        let router = ToolRouter::new(Sandbox::new(SandboxPolicy::default()));
        let agent = AgentController::new(Arc::new(Echo), Arc::new(router), AgentConfig::default());
        let store = ConversationStore::open_in_memory(StoreConfig::default()).unwrap();
        Engine::new(Governor::new(&governor), Arc::new(store), agent)
    }

    #[tokio::test]
    async fn test_follow_up_sees_history() {
        let engine = engine(GovernorConfig::default());
        let user = engine.user_config("alice");
        let first = engine
            .handle(Inbound::new("t", "ops", "alice", "hello"), &user)
            .await
            .unwrap();
        // system + question
        assert_eq!(first.response, "you said: hello (2 messages)");

        let second = engine
            .handle(Inbound::new("t", "ops", "alice", "again"), &user)
            .await
            .unwrap();
        // system + user + assistant + question
        assert_eq!(second.response, "you said: again (4 messages)");
        assert_eq!(second.conversation_id, first.conversation_id);

        let conversation = engine.store().conversation("t", "ops").unwrap().unwrap();
        assert_eq!(conversation.usage, Usage::new(20, 10));
        assert_eq!(engine.governor().budget().used_today(), 30);
        assert_eq!(engine.tracked_threads(), 0);
    }

    #[tokio::test]
    async fn test_rate_limited_before_backend() {
        let engine = engine(GovernorConfig {
            requests_per_window: 1,
            ..Default::default()
        });
        let user = engine.user_config("bob");
        engine.handle(Inbound::new("t", "c", "bob", "1"), &user).await.unwrap();
        let err = engine
            .handle(Inbound::new("t", "c", "bob", "2"), &user)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "rate_limited");
        // Denied question was never stored
        let detail = engine.store().session_detail("t", "c", 10).unwrap().unwrap();
        assert_eq!(detail.messages.len(), 2);
    }

    #[tokio::test]
    async fn test_sweep_prunes_idle_rate_windows() {
        let engine = engine(GovernorConfig {
            window_secs: 1,
            ..Default::default()
        });
        let user = engine.user_config("carol");
        engine.handle(Inbound::new("t", "c", "carol", "hi"), &user).await.unwrap();

        assert_eq!(engine.sweep().await.unwrap(), Swept::default());
        assert_eq!(engine.governor().limiter().in_window("carol"), 1);

        tokio::time::sleep(Duration::from_millis(1_100)).await;
        let swept = engine.sweep().await.unwrap();
        assert_eq!(swept.idle_users, 1);
        assert_eq!(swept.conversations, 0);
    }

    #[tokio::test]
    async fn test_image_on_text_only_backend() {
        let engine = engine(GovernorConfig::default());
        let user = engine.user_config("carol");
        let inbound = Inbound::new("t", "c", "carol", "what is this?").with_image(ImageAttachment {
            media_type: "image/png".to_string(),
            data_base64: "aGk=".to_string(),
        });
        let err = engine.handle(inbound, &user).await.unwrap_err();
        assert_eq!(err.kind(), "capability");
        assert!(err.user_message().contains("cannot handle this input"));
    }

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Responder for Recorder {
        async fn acknowledge(&self, _inbound: &Inbound) {
            self.events.lock().unwrap().push("ack".to_string());
        }

        async fn placeholder(&self, _inbound: &Inbound) {
            self.events.lock().unwrap().push("placeholder".to_string());
        }

        async fn render(&self, _inbound: &Inbound, reply: Reply) {
            self.events.lock().unwrap().push(format!("render:{}:{}", reply.is_error, reply.text));
        }
    }

    #[tokio::test]
    async fn test_dispatch_order() {
        let engine = Arc::new(engine(GovernorConfig::default()));
        let recorder = Arc::new(Recorder::default());
        let user = engine.user_config("dave");
        engine
            .dispatch(Inbound::new("t", "c", "dave", "hi"), user, recorder.clone())
            .await
            .await
            .unwrap();
        let events = recorder.events.lock().unwrap().clone();
        assert_eq!(
            events,
            vec![
                "ack".to_string(),
                "placeholder".to_string(),
                "render:false:you said: hi (2 messages)".to_string()
            ]
        );
    }
}
