//! Prometheus metrics for hostscope
//!
//! All metrics live in the default registry and are registered lazily on
//! first use. `encode_text()` renders them in the text exposition format.
//!
//! # Naming
//!
//! ```text
//! hostscope_<component>_<what>_<unit>
//!   e.g. hostscope_sandbox_executions_total{command="docker",status="success"}
//! ```

use lazy_static::lazy_static;
use prometheus::{
    register_histogram, register_histogram_vec, register_int_counter, register_int_counter_vec,
    register_int_gauge, Encoder, Histogram, HistogramVec, IntCounter, IntCounterVec, IntGauge,
    TextEncoder,
};

lazy_static! {
    // ─────────────────────────────────────────────────────────────────
    // Agent loop
    // ─────────────────────────────────────────────────────────────────
    /// Finished turns by outcome: done, max_tool_calls, max_iterations, provider_error
    pub static ref AGENT_TURNS: IntCounterVec = register_int_counter_vec!(
        "hostscope_agent_turns_total",
        "Agent turns by outcome",
        &["outcome"]
    )
    .expect("register hostscope_agent_turns_total");

    /// Generation rounds per turn
    pub static ref AGENT_ITERATIONS: Histogram = register_histogram!(
        "hostscope_agent_iterations",
        "Generation rounds per turn",
        vec![1.0, 2.0, 3.0, 5.0, 8.0, 13.0, 21.0]
    )
    .expect("register hostscope_agent_iterations");

    /// Tool invocations by tool name and status (ok, error)
    pub static ref AGENT_TOOL_CALLS: IntCounterVec = register_int_counter_vec!(
        "hostscope_agent_tool_calls_total",
        "Tool invocations by tool and status",
        &["tool", "status"]
    )
    .expect("register hostscope_agent_tool_calls_total");

    // ─────────────────────────────────────────────────────────────────
    // Reasoning backend
    // ─────────────────────────────────────────────────────────────────
    /// Backend call latency in seconds
    pub static ref LLM_CALL_TIME: HistogramVec = register_histogram_vec!(
        "hostscope_llm_call_duration_seconds",
        "Reasoning backend call latency",
        &["backend"],
        vec![0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0]
    )
    .expect("register hostscope_llm_call_duration_seconds");

    /// Tokens reported by backends, by direction (input, output)
    pub static ref LLM_TOKENS: IntCounterVec = register_int_counter_vec!(
        "hostscope_llm_tokens_total",
        "Tokens reported by the reasoning backend",
        &["direction"]
    )
    .expect("register hostscope_llm_tokens_total");

    // ─────────────────────────────────────────────────────────────────
    // Sandbox
    // ─────────────────────────────────────────────────────────────────
    pub static ref SANDBOX_EXECUTIONS: IntCounterVec = register_int_counter_vec!(
        "hostscope_sandbox_executions_total",
        "Sandboxed command executions by command and status",
        &["command", "status"]
    )
    .expect("register hostscope_sandbox_executions_total");

    pub static ref SANDBOX_REJECTIONS: IntCounterVec = register_int_counter_vec!(
        "hostscope_sandbox_rejections_total",
        "Commands rejected by sandbox policy",
        &["command"]
    )
    .expect("register hostscope_sandbox_rejections_total");

    // ─────────────────────────────────────────────────────────────────
    // Governor
    // ─────────────────────────────────────────────────────────────────
    pub static ref GOVERNOR_DENIALS: IntCounterVec = register_int_counter_vec!(
        "hostscope_governor_denials_total",
        "Questions denied before any backend call",
        &["reason"]
    )
    .expect("register hostscope_governor_denials_total");

    pub static ref TOKENS_BUDGET_USED: IntGauge = register_int_gauge!(
        "hostscope_tokens_budget_used",
        "Tokens used against today's budget"
    )
    .expect("register hostscope_tokens_budget_used");

    // ─────────────────────────────────────────────────────────────────
    // Conversation store
    // ─────────────────────────────────────────────────────────────────
    pub static ref STORE_SWEPT: IntCounter = register_int_counter!(
        "hostscope_store_swept_conversations_total",
        "Expired conversations removed by the sweeper"
    )
    .expect("register hostscope_store_swept_conversations_total");
}

/// Render every registered metric in Prometheus text format
pub fn encode_text() -> String {
    let encoder = TextEncoder::new();
    let families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&families, &mut buffer) {
        tracing::warn!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8_lossy(&buffer).into_owned()
}
