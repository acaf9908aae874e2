//! Fixed-window call budgets
//!
//! Every provider/model pair gets a [`RateBudget`]: at most `max_calls`
//! calls and `max_tokens` estimated tokens per window. Callers reserve
//! before each attempt and settle the reservation once the provider reports
//! what it actually used.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::config::RateLimitSettings;

use super::LlmError;

#[derive(Debug)]
struct WindowState {
    started: Instant,
    /// Bumped on every rollover so stale reservations can be told apart
    generation: u64,
    calls: u32,
    tokens: u64,
}

impl WindowState {
    fn roll(&mut self, now: Instant, window: Duration) {
        if now.duration_since(self.started) >= window {
            self.started = now;
            self.generation += 1;
            self.calls = 0;
            self.tokens = 0;
        }
    }
}

/// Capacity taken from a window for one call attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reservation {
    generation: u64,
    tokens: u64,
}

impl Reservation {
    pub fn tokens(&self) -> u64 {
        self.tokens
    }
}

/// Point-in-time view of a budget
#[derive(Debug, Clone, Serialize)]
pub struct BudgetSnapshot {
    pub key: String,
    pub calls_used: u32,
    pub max_calls: u32,
    pub tokens_used: u64,
    pub max_tokens: u64,
    pub resets_in_ms: u64,
}

/// Call budget for one provider/model
#[derive(Debug)]
pub struct RateBudget {
    key: String,
    window: Duration,
    max_calls: u32,
    max_tokens: u64,
    state: Mutex<WindowState>,
}

impl RateBudget {
    pub fn new(key: impl Into<String>, window: Duration, max_calls: u32, max_tokens: u64) -> Self {
        Self {
            key: key.into(),
            window,
            max_calls,
            max_tokens,
            state: Mutex::new(WindowState {
                started: Instant::now(),
                generation: 0,
                calls: 0,
                tokens: 0,
            }),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Reserve one call and `tokens` estimated tokens
    ///
    /// Waits for the window to roll over when it is full. Fails without
    /// waiting when the rollover lies beyond `max_wait`, or when `tokens`
    /// could never fit in a single window.
    pub async fn acquire(&self, tokens: u64, max_wait: Duration) -> Result<Reservation, LlmError> {
        if tokens > self.max_tokens {
            return Err(LlmError::RateLimitExceeded {
                key: self.key.clone(),
                reason: format!(
                    "request needs {} tokens but the window allows {}",
                    tokens, self.max_tokens
                ),
            });
        }

        let deadline = Instant::now() + max_wait;

        loop {
            let rollover = {
                let mut state = self.state.lock().await;
                state.roll(Instant::now(), self.window);

                if state.calls < self.max_calls && state.tokens + tokens <= self.max_tokens {
                    state.calls += 1;
                    state.tokens += tokens;
                    return Ok(Reservation {
                        generation: state.generation,
                        tokens,
                    });
                }
                state.started + self.window
            };

            if rollover > deadline {
                tracing::warn!(
                    budget = %self.key,
                    wait_ms = rollover.saturating_duration_since(Instant::now()).as_millis() as u64,
                    max_wait_ms = max_wait.as_millis() as u64,
                    "Rate budget exhausted"
                );
                return Err(LlmError::RateLimitExceeded {
                    key: self.key.clone(),
                    reason: "window exhausted and rollover exceeds the maximum wait".to_string(),
                });
            }

            tracing::debug!(budget = %self.key, "Rate budget full, waiting for window rollover");
            tokio::time::sleep_until(rollover).await;
        }
    }

    /// Replace a reservation's estimate with the tokens actually used
    ///
    /// Only applies while the window the reservation came from is current.
    pub async fn settle(&self, reservation: Reservation, actual_tokens: u64) {
        let mut state = self.state.lock().await;
        if state.generation != reservation.generation {
            return;
        }
        state.tokens = state.tokens.saturating_sub(reservation.tokens) + actual_tokens;
    }

    pub async fn snapshot(&self) -> BudgetSnapshot {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        state.roll(now, self.window);
        let resets_in = (state.started + self.window).saturating_duration_since(now);

        BudgetSnapshot {
            key: self.key.clone(),
            calls_used: state.calls,
            max_calls: self.max_calls,
            tokens_used: state.tokens,
            max_tokens: self.max_tokens,
            resets_in_ms: resets_in.as_millis() as u64,
        }
    }
}

/// Process-wide registry of budgets, keyed by `provider:model`
#[derive(Debug)]
pub struct RateLimiter {
    settings: RateLimitSettings,
    budgets: Mutex<HashMap<String, Arc<RateBudget>>>,
}

impl RateLimiter {
    pub fn new(settings: RateLimitSettings) -> Self {
        Self {
            settings,
            budgets: Mutex::new(HashMap::new()),
        }
    }

    /// Longest a caller may wait for a window rollover
    pub fn max_wait(&self) -> Duration {
        self.settings.max_wait()
    }

    pub async fn budget_for(&self, provider: &str, model: &str) -> Arc<RateBudget> {
        let key = format!("{}:{}", provider, model);
        let mut budgets = self.budgets.lock().await;
        budgets
            .entry(key.clone())
            .or_insert_with(|| {
                Arc::new(RateBudget::new(
                    key,
                    self.settings.window(),
                    self.settings.max_calls,
                    self.settings.max_tokens,
                ))
            })
            .clone()
    }

    /// Snapshots of every budget, sorted by key
    pub async fn snapshots(&self) -> Vec<BudgetSnapshot> {
        let budgets: Vec<Arc<RateBudget>> = self.budgets.lock().await.values().cloned().collect();
        let mut snapshots = Vec::with_capacity(budgets.len());
        for budget in budgets {
            snapshots.push(budget.snapshot().await);
        }
        snapshots.sort_by(|a, b| a.key.cmp(&b.key));
        snapshots
    }
}
