//! Rolling delivery statistics and the health-driven circuit breaker.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Circuit-breaker classification of a subscription.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Health {
    #[default]
    Healthy,
    Degraded,
    Failing,
    Disabled,
}

/// Thresholds driving health classification.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthThresholds {
    /// Consecutive failed attempts that disable a subscription.
    pub auto_disable_threshold: u32,

    /// Success rate (percent) below which a subscription is failing.
    pub failing_below: f64,

    /// Success rate (percent) below which a subscription is degraded.
    pub degraded_below: f64,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            auto_disable_threshold: 10,
            failing_below: 50.0,
            degraded_below: 80.0,
        }
    }
}

impl HealthThresholds {
    pub fn with_auto_disable_threshold(mut self, threshold: u32) -> Self {
        self.auto_disable_threshold = threshold;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionStatus {
    pub is_active: bool,
    pub health: Health,
    pub consecutive_failures: u32,
    pub disabled_reason: Option<String>,
    pub disabled_at: Option<DateTime<Utc>>,
    pub last_health_check: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Statistics {
    pub total_events: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub success_rate: f64,
    pub average_response_time_ms: f64,
    pub total_payload_bytes: u64,
    pub last_triggered_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
}

impl Default for Statistics {
    fn default() -> Self {
        Self {
            total_events: 0,
            success_count: 0,
            failure_count: 0,
            success_rate: 100.0,
            average_response_time_ms: 0.0,
            total_payload_bytes: 0,
            last_triggered_at: None,
            last_success_at: None,
            last_failure_at: None,
        }
    }
}

impl Statistics {
    fn recompute_success_rate(&mut self) {
        let total = self.success_count + self.failure_count;
        self.success_rate = if total == 0 {
            100.0
        } else {
            self.success_count as f64 / total as f64 * 100.0
        };
    }
}

/// Engine-owned health aggregate of one subscription.
///
/// Every mutation goes through a method here so `is_active`, `health` and
/// the counters can never disagree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionHealth {
    pub status: SubscriptionStatus,
    pub statistics: Statistics,
}

impl SubscriptionHealth {
    pub fn new(active: bool) -> Self {
        Self {
            status: SubscriptionStatus {
                is_active: active,
                health: if active { Health::Healthy } else { Health::Disabled },
                consecutive_failures: 0,
                disabled_reason: None,
                disabled_at: None,
                last_health_check: None,
            },
            statistics: Statistics::default(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.status.is_active
    }

    pub fn health(&self) -> Health {
        self.status.health
    }

    pub fn record_event(&mut self, payload_bytes: usize, now: DateTime<Utc>) {
        self.statistics.total_events += 1;
        self.statistics.total_payload_bytes += payload_bytes as u64;
        self.statistics.last_triggered_at = Some(now);
    }

    pub fn record_success(
        &mut self,
        latency_ms: u64,
        now: DateTime<Utc>,
        thresholds: &HealthThresholds,
    ) {
        let stats = &mut self.statistics;
        stats.success_count += 1;
        stats.average_response_time_ms +=
            (latency_ms as f64 - stats.average_response_time_ms) / stats.success_count as f64;
        stats.last_success_at = Some(now);
        self.status.consecutive_failures = 0;
        self.reclassify(now, thresholds);
    }

    pub fn record_failure(&mut self, now: DateTime<Utc>, thresholds: &HealthThresholds) {
        self.statistics.failure_count += 1;
        self.statistics.last_failure_at = Some(now);
        self.status.consecutive_failures += 1;
        self.reclassify(now, thresholds);
    }

    /// Re-derive `success_rate` and `health` from the counters.
    ///
    /// Auto-disable dominates the success-rate banding.
    pub fn reclassify(&mut self, now: DateTime<Utc>, thresholds: &HealthThresholds) {
        self.statistics.recompute_success_rate();
        self.status.last_health_check = Some(now);

        if self.status.consecutive_failures >= thresholds.auto_disable_threshold {
            if self.status.is_active || self.status.disabled_reason.is_none() {
                self.status.disabled_reason = Some(format!(
                    "auto-disabled after {} consecutive failures",
                    self.status.consecutive_failures
                ));
                self.status.disabled_at = Some(now);
            }
            self.status.is_active = false;
            self.status.health = Health::Disabled;
            return;
        }

        if !self.status.is_active {
            self.status.health = Health::Disabled;
            return;
        }

        let rate = self.statistics.success_rate;
        self.status.health = if rate < thresholds.failing_below {
            Health::Failing
        } else if rate < thresholds.degraded_below {
            Health::Degraded
        } else {
            Health::Healthy
        };
    }

    /// Operator re-enable. Statistics are kept; only the breaker is reset.
    pub fn enable(&mut self, now: DateTime<Utc>) {
        self.status.is_active = true;
        self.status.health = Health::Healthy;
        self.status.consecutive_failures = 0;
        self.status.disabled_reason = None;
        self.status.disabled_at = None;
        self.status.last_health_check = Some(now);
    }

    pub fn disable(&mut self, reason: impl Into<String>, now: DateTime<Utc>) {
        self.status.is_active = false;
        self.status.health = Health::Disabled;
        self.status.disabled_reason = Some(reason.into());
        self.status.disabled_at = Some(now);
        self.status.last_health_check = Some(now);
    }

    pub fn reset_statistics(&mut self, now: DateTime<Utc>, thresholds: &HealthThresholds) {
        self.statistics = Statistics::default();
        self.status.consecutive_failures = 0;
        self.reclassify(now, thresholds);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn thresholds(auto_disable: u32) -> HealthThresholds {
        HealthThresholds::default().with_auto_disable_threshold(auto_disable)
    }

    #[test]
    fn test_success_rate_tracks_counts() {
        let t = thresholds(100);
        let mut health = SubscriptionHealth::new(true);
        assert_eq!(health.statistics.success_rate, 100.0);

        let outcomes = [true, false, true, true, false, false, true];
        for ok in outcomes {
            if ok {
                health.record_success(10, Utc::now(), &t);
            } else {
                health.record_failure(Utc::now(), &t);
            }
            let s = &health.statistics;
            let expected = 100.0 * s.success_count as f64 / (s.success_count + s.failure_count) as f64;
            assert!((s.success_rate - expected).abs() < 1e-9);
        }
    }

    #[test]
    fn test_consecutive_failures_reset_only_on_success() {
        let t = thresholds(100);
        let mut health = SubscriptionHealth::new(true);
        health.record_failure(Utc::now(), &t);
        health.record_failure(Utc::now(), &t);
        assert_eq!(health.status.consecutive_failures, 2);
        health.record_success(5, Utc::now(), &t);
        assert_eq!(health.status.consecutive_failures, 0);
        health.record_failure(Utc::now(), &t);
        assert_eq!(health.status.consecutive_failures, 1);
    }

    #[test]
    fn test_incremental_mean_latency() {
        let t = thresholds(100);
        let mut health = SubscriptionHealth::new(true);
        for latency in [100, 200, 300, 400] {
            health.record_success(latency, Utc::now(), &t);
        }
        assert!((health.statistics.average_response_time_ms - 250.0).abs() < 1e-9);
    }

    #[test]
    fn test_health_banding() {
        let t = thresholds(100);
        let mut health = SubscriptionHealth::new(true);
        for _ in 0..3 {
            health.record_success(1, Utc::now(), &t);
        }
        health.record_failure(Utc::now(), &t);
        // 75%
        assert_eq!(health.health(), Health::Degraded);
        health.record_failure(Utc::now(), &t);
        health.record_failure(Utc::now(), &t);
        // 50%
        assert_eq!(health.health(), Health::Degraded);
        health.record_failure(Utc::now(), &t);
        assert_eq!(health.health(), Health::Failing);
        for _ in 0..20 {
            health.record_success(1, Utc::now(), &t);
        }
        assert_eq!(health.health(), Health::Healthy);
    }

    #[test]
    fn test_auto_disable_dominates() {
        let t = thresholds(3);
        let mut health = SubscriptionHealth::new(true);
        for _ in 0..50 {
            health.record_success(1, Utc::now(), &t);
        }
        for i in 1..=5 {
            health.record_failure(Utc::now(), &t);
            if health.status.consecutive_failures >= 3 {
                assert!(!health.is_active(), "attempt {}", i);
                assert_eq!(health.health(), Health::Disabled);
            } else {
                assert!(health.is_active());
            }
        }
        assert!(health.status.disabled_reason.is_some());
        assert!(health.statistics.success_rate > 80.0);
    }

    #[test]
    fn test_enable_resets_breaker() {
        let t = thresholds(2);
        let mut health = SubscriptionHealth::new(true);
        health.record_failure(Utc::now(), &t);
        health.record_failure(Utc::now(), &t);
        assert_eq!(health.health(), Health::Disabled);

        health.enable(Utc::now());
        assert!(health.is_active());
        assert_eq!(health.health(), Health::Healthy);
        assert_eq!(health.status.consecutive_failures, 0);
        assert!(health.status.disabled_reason.is_none());
        assert_eq!(health.statistics.failure_count, 2);
    }

    #[test]
    fn test_manual_disable_survives_success() {
        let t = thresholds(10);
        let mut health = SubscriptionHealth::new(true);
        health.disable("maintenance", Utc::now());
        health.record_success(3, Utc::now(), &t);
        assert!(!health.is_active());
        assert_eq!(health.health(), Health::Disabled);
        assert_eq!(health.status.disabled_reason.as_deref(), Some("maintenance"));
    }
}
