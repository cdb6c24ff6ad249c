use dashmap::DashMap;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

// Sliding window limiter - one window of call timestamps per API key
pub struct RateLimiter {
    windows: DashMap<String, VecDeque<Instant>>,
    max_calls: usize,  // cap per key inside one window
    window: Duration,
}

impl RateLimiter {
    pub fn new(max_calls: usize, window: Duration) -> Self {
        Self {
            windows: DashMap::new(),
            max_calls,
            window,
        }
    }

    pub fn admit(&self, key: &str) -> bool {
        self.admit_at(key, Instant::now())
    }

    /// Prune, check and record in one step. The entry guard holds the
    /// shard lock, so two callers can never both see the last free slot.
    pub fn admit_at(&self, key: &str, now: Instant) -> bool {
        let mut calls = self.windows.entry(key.to_string()).or_default();

        while let Some(oldest) = calls.front() {
            if now.saturating_duration_since(*oldest) >= self.window {
                calls.pop_front();
            } else {
                break;
            }
        }

        if calls.len() < self.max_calls {
            calls.push_back(now);
            return true;
        }
        false
    }

    pub fn max_calls(&self) -> usize {
        self.max_calls
    }

    pub fn window(&self) -> Duration {
        self.window
    }
}
