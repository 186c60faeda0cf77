use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};

use crate::types::RateLimitPolicy;

/// Fixed-window counter for one subscription.
///
/// The count only moves for events that already passed filtering, so a
/// filtered-out event never consumes quota.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RateWindow {
    current_count: u32,
    window_reset_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RateLimiterStats {
    pub max_requests: u32,
    pub window_secs: u64,
    pub current_count: u32,
    pub window_reset_at: Option<DateTime<Utc>>,
}

impl RateWindow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit one event at `now`, or refuse it when the window is full.
    ///
    /// A disabled policy admits everything and leaves the window untouched.
    pub fn try_acquire(&mut self, policy: &RateLimitPolicy, now: DateTime<Utc>) -> bool {
        if !policy.enabled {
            return true;
        }

        let expired = match self.window_reset_at {
            Some(reset_at) => now >= reset_at,
            None => true,
        };
        if expired {
            self.current_count = 0;
            self.window_reset_at = Some(
                now.checked_add_signed(window_length(policy))
                    .unwrap_or(DateTime::<Utc>::MAX_UTC),
            );
        }

        if self.current_count >= policy.max_requests {
            return false;
        }
        self.current_count += 1;
        true
    }

    pub fn current_count(&self) -> u32 {
        self.current_count
    }

    pub fn window_reset_at(&self) -> Option<DateTime<Utc>> {
        self.window_reset_at
    }

    pub fn snapshot(&self, policy: &RateLimitPolicy) -> RateLimiterStats {
        RateLimiterStats {
            max_requests: policy.max_requests,
            window_secs: policy.window_secs,
            current_count: self.current_count,
            window_reset_at: self.window_reset_at,
        }
    }
}

fn window_length(policy: &RateLimitPolicy) -> ChronoDuration {
    let secs = i64::try_from(policy.window_secs).unwrap_or(i64::MAX);
    ChronoDuration::seconds(secs.min(i64::MAX / 1_000))
}
