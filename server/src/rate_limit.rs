//! In-memory rate limiting for message sends.
//!
//! DESIGN
//! ======
//! Sliding-window counters backed by `HashMap<Uuid, VecDeque<Instant>>`,
//! one window per sending user. All of a user's sessions share the window,
//! so opening more tabs does not raise the ceiling.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::config::SendRateConfig;
use crate::event::ErrorCode;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("send rate limit exceeded (max {limit} messages/{window_secs}s)")]
pub struct RateLimitExceeded {
    pub limit: usize,
    pub window_secs: u64,
}

impl ErrorCode for RateLimitExceeded {
    fn error_code(&self) -> &'static str {
        "E_RATE_LIMITED"
    }

    fn retryable(&self) -> bool {
        true
    }
}

#[derive(Clone)]
pub struct RateLimiter {
    inner: Arc<Mutex<HashMap<Uuid, VecDeque<Instant>>>>,
    config: SendRateConfig,
}

impl RateLimiter {
    #[must_use]
    pub fn new(config: SendRateConfig) -> Self {
        Self { inner: Arc::new(Mutex::new(HashMap::new())), config }
    }

    /// Check the sender's window, then record the send.
    ///
    /// # Errors
    ///
    /// Returns [`RateLimitExceeded`] when the window is already full.
    pub fn check_and_record(&self, user_id: Uuid) -> Result<(), RateLimitExceeded> {
        self.check_and_record_at(user_id, Instant::now())
    }

    fn check_and_record_at(&self, user_id: Uuid, now: Instant) -> Result<(), RateLimitExceeded> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let cfg = self.config;

        let window = inner.entry(user_id).or_default();
        prune_window(window, now, cfg.window);
        if window.len() >= cfg.limit {
            return Err(RateLimitExceeded { limit: cfg.limit, window_secs: cfg.window.as_secs() });
        }
        window.push_back(now);
        Ok(())
    }

    /// Drop users whose windows have fully expired.
    pub fn prune_idle(&self) {
        self.prune_idle_at(Instant::now());
    }

    fn prune_idle_at(&self, now: Instant) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let window = self.config.window;
        inner.retain(|_, deque| {
            prune_window(deque, now, window);
            !deque.is_empty()
        });
    }

    #[cfg(test)]
    fn tracked_users(&self) -> usize {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(SendRateConfig::default())
    }
}

fn prune_window(deque: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while let Some(&front) = deque.front() {
        if now.duration_since(front) > window {
            deque.pop_front();
        } else {
            break;
        }
    }
}

#[cfg(test)]
#[path = "rate_limit_test.rs"]
mod tests;
