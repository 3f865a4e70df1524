//! Per-user sliding-window rate limiting.
//!
//! Unlike an HTTP middleware keyed by IP, gateway limits are keyed by user id
//! and checked per event class (location, chat, global). The window slides:
//! each check discards timestamps older than the window before counting.

use crate::config::RateLimitRule;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Clone)]
pub struct UserRateLimiter {
    rule: RateLimitRule,
    state: Arc<Mutex<HashMap<String, VecDeque<Instant>>>>,
}

impl UserRateLimiter {
    pub fn new(rule: RateLimitRule) -> Self {
        Self {
            rule,
            state: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Record one action. Returns false when the user is over the limit; the
    /// rejected action does not consume a slot.
    pub fn check(&self, user_id: &str) -> bool {
        let now = Instant::now();
        let window = self.rule.window();
        let mut state = self.state.lock();
        let timestamps = state.entry(user_id.to_string()).or_default();
        while let Some(front) = timestamps.front() {
            if now.duration_since(*front) >= window {
                timestamps.pop_front();
            } else {
                break;
            }
        }
        if timestamps.len() >= self.rule.points as usize {
            return false;
        }
        timestamps.push_back(now);
        true
    }

    /// Drop users idle for two windows. Called from a background task.
    pub fn cleanup(&self) {
        let now = Instant::now();
        let horizon = self.rule.window() * 2;
        let mut state = self.state.lock();
        state.retain(|_, timestamps| {
            timestamps
                .back()
                .map(|last| now.duration_since(*last) < horizon)
                .unwrap_or(false)
        });
    }

    pub fn window(&self) -> Duration {
        self.rule.window()
    }
}
