//! Per-session message-rate limiting, shared by both transports.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::constants::RATE_LIMIT_PER_SEC;

/// Sliding one-second window of message timestamps for one session.
#[derive(Debug)]
pub struct RateWindow {
    times: VecDeque<Instant>,
}

impl RateWindow {
    pub fn new() -> Self {
        Self {
            times: VecDeque::with_capacity(RATE_LIMIT_PER_SEC + 1),
        }
    }

    /// Record an inbound frame at `now` and report whether it is within
    /// the per-second ceiling. The offending frame itself is counted, so a
    /// burst does not extend its own window.
    pub fn allow(&mut self, now: Instant) -> bool {
        self.times.push_back(now);
        if self.times.len() > RATE_LIMIT_PER_SEC + 1 {
            self.times.pop_front();
        }
        if self.times.len() > RATE_LIMIT_PER_SEC {
            if let Some(&oldest) = self.times.front() {
                return now.duration_since(oldest) >= Duration::from_secs(1);
            }
        }
        true
    }
}

impl Default for RateWindow {
    fn default() -> Self {
        Self::new()
    }
}
