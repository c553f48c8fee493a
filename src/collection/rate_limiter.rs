use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use dashmap::DashMap;
use crate::collection::normalize_name;
use crate::config::RateLimitConfig;
use crate::types::timestamp::{Clock, Timestamp};

struct SlidingWindow {
    max_per_interval: usize,
    interval: Duration,
    timestamps: VecDeque<Timestamp>,
}

impl SlidingWindow {
    fn new(limit: RateLimitConfig) -> Self {
        SlidingWindow {
            max_per_interval: limit.max_requests as usize,
            interval: limit.window,
            timestamps: VecDeque::new(),
        }
    }

    fn evict(&mut self, now: Timestamp) {
        while let Some(&front) = self.timestamps.front() {
            if now.duration_since(front) >= self.interval {
                self.timestamps.pop_front();
            } else {
                break;
            }
        }
    }

    fn check_and_record(&mut self, now: Timestamp) -> bool {
        self.evict(now);

        if self.timestamps.len() >= self.max_per_interval {
            return false;
        }

        self.timestamps.push_back(now);
        true
    }
}

/// Per-source sliding-window limiter. Never blocks: a `false` means "try again later".
pub struct RateLimiter {
    windows: DashMap<String, Mutex<SlidingWindow>>,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        RateLimiter {
            windows: DashMap::new(),
            clock,
        }
    }

    /// Install or replace the budget for a source. Replacing resets its window.
    pub fn configure(&self, source: &str, limit: RateLimitConfig) {
        self.windows.insert(normalize_name(source), Mutex::new(SlidingWindow::new(limit)));
    }

    pub fn try_acquire(&self, source: &str) -> bool {
        let Some(window) = self.windows.get(&normalize_name(source)) else {
            tracing::warn!(source, "No rate limit configured, refusing request");
            return false;
        };
        let now = self.clock.now();
        let mut window = window.lock().unwrap_or_else(PoisonError::into_inner);
        window.check_and_record(now)
    }

    /// Units left in the current window, `None` for an unconfigured source.
    pub fn remaining(&self, source: &str) -> Option<u32> {
        let window = self.windows.get(&normalize_name(source))?;
        let now = self.clock.now();
        let mut window = window.lock().unwrap_or_else(PoisonError::into_inner);
        window.evict(now);
        Some(window.max_per_interval.saturating_sub(window.timestamps.len()) as u32)
    }
}
