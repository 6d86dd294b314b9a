use std::collections::VecDeque;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

/// Sliding-window limiter keyed by phone.
#[derive(Debug)]
pub struct RateLimiter {
    limit: usize,
    window: Duration,
    hits: DashMap<String, VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn per_minute(limit: usize) -> Self {
        Self::new(limit, Duration::from_secs(60))
    }

    pub fn new(limit: usize, window: Duration) -> Self {
        Self {
            limit,
            window,
            hits: DashMap::new(),
        }
    }

    /// Records a hit and reports whether it fits the window. A limit of 0 disables limiting.
    pub fn check(&self, key: &str) -> bool {
        if self.limit == 0 {
            return true;
        }
        let now = Instant::now();
        let mut entry = self.hits.entry(key.to_string()).or_default();
        while entry
            .front()
            .is_some_and(|first| now.duration_since(*first) >= self.window)
        {
            entry.pop_front();
        }
        if entry.len() >= self.limit {
            return false;
        }
        entry.push_back(now);
        true
    }

    /// Drops keys whose window has fully elapsed.
    pub fn cleanup(&self) {
        let now = Instant::now();
        self.hits.retain(|_, hits| {
            hits.back()
                .is_some_and(|last| now.duration_since(*last) < self.window)
        });
    }
}
