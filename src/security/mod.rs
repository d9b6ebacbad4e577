//! Admission control and output hygiene
//!
//! This module provides the per-request safeguards around a turn:
//! - Sliding-window rate limiting per user (`rate_limit`)
//! - A daily token budget (`budget`)
//! - The `Governor` that owns both (`governor`)
//! - Best-effort secret redaction for tool output and logs (`redact`)
//!
//! # Order
//!
//! ```text
//! question ──► Governor::admit ──✗──► Denial (no backend call)
//!                   │
//!                   ▼
//!              agent turn ──► tool output ──► redact ──► model / store / logs
//!                   │
//!                   ▼
//!           Governor::record_usage
//! ```

pub mod budget;
pub mod governor;
pub mod rate_limit;
pub mod redact;

pub use budget::TokenBudget;
pub use governor::{Denial, Governor, GovernorConfig};
pub use rate_limit::{RateLimitError, SlidingWindowLimiter};
pub use redact::{redact, redact_json};
