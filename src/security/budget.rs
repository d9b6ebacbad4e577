//! Daily token budget
//!
//! A single counter keyed by UTC date. It only grows within a day and starts
//! over implicitly the first time it is touched on a new date.

use std::sync::{Mutex, MutexGuard};

use chrono::{NaiveDate, Utc};

#[derive(Debug)]
struct DayCounter {
    day: NaiveDate,
    used: u64,
}

/// Per-UTC-day token counter
#[derive(Debug)]
pub struct TokenBudget {
    limit: u64,
    state: Mutex<DayCounter>,
}

impl TokenBudget {
    pub fn new(limit: u64) -> Self {
        Self {
            limit,
            state: Mutex::new(DayCounter {
                day: today(),
                used: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, DayCounter> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Add tokens to today's total and return the new total
    pub fn record(&self, tokens: u64) -> u64 {
        self.record_on(today(), tokens)
    }

    /// A date earlier than the current day (a turn that started before
    /// midnight) is counted against the current day.
    pub fn record_on(&self, day: NaiveDate, tokens: u64) -> u64 {
        let mut state = self.lock();
        roll(&mut state, day);
        state.used = state.used.saturating_add(tokens);
        state.used
    }

    pub fn used_today(&self) -> u64 {
        self.used_on(today())
    }

    pub fn used_on(&self, day: NaiveDate) -> u64 {
        let mut state = self.lock();
        roll(&mut state, day);
        state.used
    }

    pub fn remaining(&self) -> u64 {
        self.limit.saturating_sub(self.used_today())
    }

    pub fn is_exhausted(&self) -> bool {
        self.used_today() >= self.limit
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn reset(&self) {
        let mut state = self.lock();
        state.day = today();
        state.used = 0;
    }
}

fn today() -> NaiveDate {
    Utc::now().date_naive()
}

/// Move the counter forward to `day`; an earlier date leaves it alone
fn roll(state: &mut DayCounter, day: NaiveDate) {
    if day > state.day {
        state.day = day;
        state.used = 0;
    }
}
