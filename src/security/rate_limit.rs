//! Per-user request rate limiting
//!
//! # Why Rate Limiting?
//!
//! Every question costs a reasoning-backend call plus any number of tool
//! executions on the host. A single chatty user (or a loop in the chat layer)
//! could otherwise run up unbounded cost and load.
//!
//! # Algorithm: Sliding Window Log
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────┐
//! │  SLIDING WINDOW (limit=3, window=60s)                            │
//! │                                                                   │
//! │  time ──────────────────────────────────────────────────►        │
//! │          t1     t2          t3                 now               │
//! │          ●      ●           ●                   ?                │
//! │          │◄──────────── window (60s) ──────────►│                │
//! │                                                   │               │
//! │  Request arrives at `now`:                                        │
//! │    - drop timestamps older than now - window                     │
//! │    - in-window count < limit → record `now`, ALLOW               │
//! │    - otherwise → record nothing, DENY                            │
//! └───────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Unlike a fixed window there is no boundary burst: at most `limit`
//! requests are admitted in ANY trailing window.
//!
//! # Atomicity
//!
//! Counting and recording happen under one lock acquisition, with no
//! suspension point in between. Two concurrent callers competing for the
//! last slot cannot both observe "room available".

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use thiserror::Error;

// ═══════════════════════════════════════════════════════════════════════════
// SlidingWindowLimiter
// ═══════════════════════════════════════════════════════════════════════════
// WHAT IT IS:
//   A thread-safe, per-key rate limiter. Keys are user ids.
//
// HOW TO USE:
//   1. Create with a limit and a window
//   2. Call check_and_record(user) before each request
//   3. If true, proceed; if false, reject
//
// EXAMPLE:
//   let limiter = SlidingWindowLimiter::new(10, Duration::from_secs(60));
//   if limiter.check_and_record("U123") {
//       // Handle request
//   }
// ═══════════════════════════════════════════════════════════════════════════

pub struct SlidingWindowLimiter {
    /// Maximum requests in any trailing window
    limit: usize,

    /// Window length
    window: Duration,

    /// Request timestamps per key, oldest first
    windows: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl SlidingWindowLimiter {
    pub fn new(limit: usize, window: Duration) -> Self {
        Self {
            limit,
            window,
            windows: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, VecDeque<Instant>>> {
        match self.windows.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // check_and_record(key) - Admit or deny one request
    // ═══════════════════════════════════════════════════════════════════════
    // RETURNS:
    //   true  → Request allowed (timestamp recorded)
    //   false → Request denied (nothing recorded)
    // ═══════════════════════════════════════════════════════════════════════
    pub fn check_and_record(&self, key: &str) -> bool {
        self.check_and_record_at(key, Instant::now())
    }

    /// Same as `check_and_record`, with an explicit clock
    pub fn check_and_record_at(&self, key: &str, now: Instant) -> bool {
        let mut windows = self.lock();
        let timestamps = windows.entry(key.to_string()).or_default();
        prune(timestamps, now, self.window);

        if timestamps.len() >= self.limit {
            return false;
        }
        timestamps.push_back(now);
        true
    }

    /// Requests currently counted against `key`
    pub fn in_window(&self, key: &str) -> usize {
        let now = Instant::now();
        let mut windows = self.lock();
        match windows.get_mut(key) {
            Some(timestamps) => {
                prune(timestamps, now, self.window);
                timestamps.len()
            }
            None => 0,
        }
    }

    /// How long until `key` gets a free slot (zero if one is free now)
    pub fn retry_after(&self, key: &str) -> Duration {
        let now = Instant::now();
        let mut windows = self.lock();
        let Some(timestamps) = windows.get_mut(key) else {
            return Duration::ZERO;
        };
        prune(timestamps, now, self.window);
        if timestamps.len() < self.limit {
            return Duration::ZERO;
        }
        timestamps
            .front()
            .map(|oldest| (*oldest + self.window).saturating_duration_since(now))
            .unwrap_or(Duration::ZERO)
    }

    /// Drop keys with no in-window requests. Returns how many were removed.
    pub fn prune_idle(&self) -> usize {
        let now = Instant::now();
        let mut windows = self.lock();
        let before = windows.len();
        windows.retain(|_, timestamps| {
            prune(timestamps, now, self.window);
            !timestamps.is_empty()
        });
        before - windows.len()
    }

    /// Forget all keys
    pub fn reset(&self) {
        self.lock().clear();
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn window(&self) -> Duration {
        self.window
    }
}

fn prune(timestamps: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while let Some(oldest) = timestamps.front() {
        if now.duration_since(*oldest) >= window {
            timestamps.pop_front();
        } else {
            break;
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// RateLimitError
// ═══════════════════════════════════════════════════════════════════════════
// Error returned when a request is rate limited.
// Contains helpful info for the caller.
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Rate limited: {limit} requests per {window:?}. Retry after {retry_after:?}")]
pub struct RateLimitError {
    pub limit: usize,
    pub window: Duration,
    /// How long to wait before retrying
    pub retry_after: Duration,
}
