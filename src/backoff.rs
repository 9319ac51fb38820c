//! Per-entry retry bookkeeping
//!
//! The map is an in-memory hint: the durable "needs retry" fact is the
//! entry sitting unacked in the group's pending list. What lives here
//! is the failure count and the earliest next attempt, giving
//! redeliveries their exponential spacing. Stale slots are collected
//! after an idle window.

use crate::config::RetryConfig;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
struct RetryState {
    retry_count: u32,
    next_attempt_at: Instant,
    last_touched: Instant,
}

/// Exponential backoff controller keyed by entry ID.
pub struct BackoffController {
    config: RetryConfig,
    entries: Mutex<HashMap<String, RetryState>>,
}

impl BackoffController {
    #[must_use]
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Delay applied after the `retry_count`-th consecutive failure:
    /// `min(initial * multiplier^(retry_count - 1), max_delay)`.
    #[must_use]
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        if retry_count == 0 {
            return Duration::ZERO;
        }
        let exponent = retry_count.saturating_sub(1);
        let scaled = self.config.initial.as_secs_f64() * self.config.multiplier.powi(exponent as i32);
        Duration::from_secs_f64(scaled.min(self.config.max_delay.as_secs_f64()))
    }

    /// Record a failure; returns the new consecutive failure count.
    pub fn record_failure(&self, entry_id: &str) -> u32 {
        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let now = Instant::now();
        let state = entries.entry(entry_id.to_string()).or_insert(RetryState {
            retry_count: 0,
            next_attempt_at: now,
            last_touched: now,
        });
        state.retry_count += 1;
        state.last_touched = now;
        let count = state.retry_count;
        state.next_attempt_at = now + self.delay_for(count);
        count
    }

    /// Clear state after a success (or terminal routing).
    pub fn record_success(&self, entry_id: &str) {
        self.entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(entry_id);
    }

    /// May the entry still be retried?
    #[must_use]
    pub fn should_retry(&self, entry_id: &str) -> bool {
        self.retry_count(entry_id) <= self.config.max_retries
    }

    /// Has the entry's backoff delay elapsed?
    #[must_use]
    pub fn is_due(&self, entry_id: &str) -> bool {
        self.entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(entry_id)
            .is_none_or(|state| Instant::now() >= state.next_attempt_at)
    }

    #[must_use]
    pub fn retry_count(&self, entry_id: &str) -> u32 {
        self.entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(entry_id)
            .map_or(0, |state| state.retry_count)
    }

    /// Drop slots untouched for longer than `idle`.
    pub fn gc(&self, idle: Duration) {
        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let now = Instant::now();
        entries.retain(|_, state| now.saturating_duration_since(state.last_touched) < idle);
    }

    #[must_use]
    pub fn tracked(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }
}
