//! Timeout budget for a single connection
//!
//! A connection that keeps timing out is worse than a closed one: callers
//! wait out every deadline before failing over. Once `max_timeouts` deadlines
//! expire within `window`, the connection closes itself so the session can
//! reconnect and the region can re-elect.

use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

/// Limits for [`TimeoutWindow`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutPolicy {
    /// Number of timeouts tolerated within the window.
    pub max_timeouts: u32,
    pub window: Duration,
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self {
            max_timeouts: 3,
            window: Duration::from_secs(60),
        }
    }
}

impl TimeoutPolicy {
    pub fn new(max_timeouts: u32, window: Duration) -> Self {
        Self {
            max_timeouts,
            window,
        }
    }
}

/// Sliding window of recent call timeouts.
#[derive(Debug)]
pub struct TimeoutWindow {
    policy: TimeoutPolicy,
    recent: VecDeque<Instant>,
}

impl TimeoutWindow {
    pub fn new(policy: TimeoutPolicy) -> Self {
        Self {
            policy,
            recent: VecDeque::new(),
        }
    }

    /// Record a timeout now. Returns true when the budget is exhausted.
    pub fn record(&mut self) -> bool {
        self.record_at(Instant::now())
    }

    pub fn record_at(&mut self, now: Instant) -> bool {
        self.evict(now);
        self.recent.push_back(now);
        self.recent.len() >= self.policy.max_timeouts.max(1) as usize
    }

    /// Timeouts still inside the window.
    pub fn count_at(&mut self, now: Instant) -> usize {
        self.evict(now);
        self.recent.len()
    }

    pub fn reset(&mut self) {
        self.recent.clear();
    }

    pub fn policy(&self) -> &TimeoutPolicy {
        &self.policy
    }

    fn evict(&mut self, now: Instant) {
        while let Some(front) = self.recent.front() {
            if now.saturating_duration_since(*front) > self.policy.window {
                self.recent.pop_front();
            } else {
                break;
            }
        }
    }
}
