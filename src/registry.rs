use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};

use crate::error::{EngineError, Rejection};
use crate::filter::{check_eligibility, encode_body, transform_payload};
use crate::health::{HealthThresholds, SubscriptionHealth};
use crate::log_store::{EventLog, EventLogRing};
use crate::rate_limit::RateWindow;
use crate::scheduler::Task;
use crate::types::{DomainEvent, EventId, Subscription, SubscriptionId, WorkspaceId};

/// How an event reaches admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AdmitMode {
    /// Regular domain event: full eligibility and rate limiting.
    Event,
    /// Operator test event: only requires an active subscription.
    Test,
}

pub(crate) enum AdmitResult {
    Accepted {
        log: EventLog,
        task: Task,
        evicted: Vec<EventLog>,
    },
    Rejected(Rejection),
}

/// Mutable, engine-owned state of one subscription.
///
/// Always accessed through the subscription's mutex so outcomes, window
/// bookkeeping and ring eviction are serialized per subscription.
pub(crate) struct SubscriptionState {
    pub config: Arc<Subscription>,
    pub health: SubscriptionHealth,
    pub rate_window: RateWindow,
    pub logs: EventLogRing,
}

impl SubscriptionState {
    pub fn new(config: Subscription, log_capacity: usize, retain_pending: bool) -> Self {
        Self {
            health: SubscriptionHealth::new(config.active),
            config: Arc::new(config),
            rate_window: RateWindow::new(),
            logs: EventLogRing::new(log_capacity, retain_pending),
        }
    }

    /// Engine thresholds with this subscription's override applied.
    pub fn thresholds(&self, defaults: &HealthThresholds) -> HealthThresholds {
        let mut thresholds = defaults.clone();
        if let Some(threshold) = self.config.auto_disable_threshold {
            thresholds.auto_disable_threshold = threshold;
        }
        thresholds
    }

    /// Run eligibility, transform and the rate-limit gate, creating and
    /// claiming a pending log on success.
    pub fn admit(
        &mut self,
        event: &DomainEvent,
        mode: AdmitMode,
        now: DateTime<Utc>,
    ) -> Result<AdmitResult, EngineError> {
        let config = self.config.clone();
        let eligibility = match mode {
            AdmitMode::Event => check_eligibility(&config, self.health.is_active(), event),
            AdmitMode::Test if self.health.is_active() => Ok(()),
            AdmitMode::Test => Err(Rejection::Inactive),
        };
        if let Err(rejection) = eligibility {
            return Ok(AdmitResult::Rejected(rejection));
        }

        let payload = transform_payload(&config, &event.data, now);
        let body = encode_body(config.content_type, &payload)?;

        if mode == AdmitMode::Event && !self.rate_window.try_acquire(&config.rate_limit, now) {
            return Ok(AdmitResult::Rejected(Rejection::RateLimited));
        }

        Ok(self.accept(EventLog::new(event.event_type.clone(), payload, body, now), now))
    }

    /// Append a new pending log and claim its first attempt.
    pub fn accept(&mut self, mut log: EventLog, now: DateTime<Utc>) -> AdmitResult {
        log.in_flight = true;
        self.health.record_event(log.payload_size, now);
        let mut snapshot = log.clone();
        let evicted = self.logs.push(log);
        snapshot.sequence = self.logs.last_sequence();
        let task = Task {
            subscription_id: self.config.id.clone(),
            event_id: snapshot.event_id.clone(),
            attempt: 1,
        };
        let log = snapshot;
        AdmitResult::Accepted { log, task, evicted }
    }

    /// Claim a specific attempt. Fails if the log moved on, is owned by a
    /// worker, or the subscription is inactive.
    pub fn claim(&mut self, event_id: &EventId, attempt: u32) -> bool {
        if !self.health.is_active() {
            return false;
        }
        match self.logs.get_mut(event_id) {
            Some(log) if log.is_pending() && !log.in_flight && log.total_attempts + 1 == attempt => {
                log.in_flight = true;
                true
            }
            _ => false,
        }
    }

    /// Claim every pending log whose retry time has passed.
    pub fn claim_due(&mut self, now: DateTime<Utc>) -> Vec<Task> {
        if !self.health.is_active() {
            return Vec::new();
        }
        let subscription_id = self.config.id.clone();
        self.logs
            .iter_mut()
            .filter(|log| log.is_due(now))
            .map(|log| {
                log.in_flight = true;
                Task {
                    subscription_id: subscription_id.clone(),
                    event_id: log.event_id.clone(),
                    attempt: log.total_attempts + 1,
                }
            })
            .collect()
    }

    /// Give up a claim without attempting, leaving the log for the sweep.
    pub fn release(&mut self, event_id: &EventId, due_at: Option<DateTime<Utc>>) {
        if let Some(log) = self.logs.get_mut(event_id) {
            log.in_flight = false;
            if let Some(due_at) = due_at {
                if log.is_pending() && log.next_retry_at.map(|at| at > due_at).unwrap_or(true) {
                    log.next_retry_at = Some(due_at);
                }
            }
        }
    }
}

pub(crate) type SubscriptionEntry = Arc<Mutex<SubscriptionState>>;

/// Registered subscriptions keyed by id.
#[derive(Default)]
pub(crate) struct Registry {
    entries: RwLock<HashMap<SubscriptionId, SubscriptionEntry>>,
}

impl Registry {
    pub async fn get(&self, id: &SubscriptionId) -> Option<SubscriptionEntry> {
        self.entries.read().await.get(id).cloned()
    }

    pub async fn require(&self, id: &SubscriptionId) -> Result<SubscriptionEntry, EngineError> {
        self.get(id)
            .await
            .ok_or_else(|| EngineError::SubscriptionNotFound(id.clone()))
    }

    pub async fn insert(&self, id: SubscriptionId, state: SubscriptionState) -> Result<(), EngineError> {
        let mut guard = self.entries.write().await;
        if guard.contains_key(&id) {
            return Err(EngineError::DuplicateSubscription(id));
        }
        guard.insert(id, Arc::new(Mutex::new(state)));
        Ok(())
    }

    pub async fn remove(&self, id: &SubscriptionId) -> Option<SubscriptionEntry> {
        self.entries.write().await.remove(id)
    }

    pub async fn contains(&self, id: &SubscriptionId) -> bool {
        self.entries.read().await.contains_key(id)
    }

    pub async fn all(&self) -> Vec<(SubscriptionId, SubscriptionEntry)> {
        self.entries
            .read()
            .await
            .iter()
            .map(|(id, entry)| (id.clone(), entry.clone()))
            .collect()
    }

    /// Subscriptions owned by `workspace_id`.
    pub async fn for_workspace(&self, workspace_id: &WorkspaceId) -> Vec<(SubscriptionId, SubscriptionEntry)> {
        let mut matching = Vec::new();
        for (id, entry) in self.all().await {
            if &entry.lock().await.config.workspace_id == workspace_id {
                matching.push((id, entry));
            }
        }
        matching
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use serde_json::json;

    fn state() -> SubscriptionState {
        let subscription = Subscription::new("wh_1", "ws_1", "https://hooks.example.com", "secret")
            .with_events(["document.updated"])
            .with_rate_limit(2, 60);
        SubscriptionState::new(subscription, 100, false)
    }

    fn event() -> DomainEvent {
        DomainEvent::new("document.updated", "ws_1").with_data(json!({"title": "Q3"}))
    }

    fn accepted(result: AdmitResult) -> (EventLog, Task) {
        match result {
            AdmitResult::Accepted { log, task, .. } => (log, task),
            AdmitResult::Rejected(rejection) => panic!("rejected: {}", rejection),
        }
    }

    #[test]
    fn test_admit_creates_claimed_pending_log() {
        let mut state = state();
        let (log, task) = accepted(state.admit(&event(), AdmitMode::Event, Utc::now()).unwrap());
        assert!(log.is_pending());
        assert!(log.in_flight);
        assert_eq!(task.attempt, 1);
        assert_eq!(log.body, r#"{"title":"Q3"}"#);
        assert_eq!(state.health.statistics.total_events, 1);
        assert_eq!(state.health.statistics.total_payload_bytes, log.body.len() as u64);
    }

    #[test]
    fn test_rejections_leave_no_trace() {
        let mut state = state();
        let other = DomainEvent::new("comment.created", "ws_1");
        match state.admit(&other, AdmitMode::Event, Utc::now()).unwrap() {
            AdmitResult::Rejected(Rejection::NotSubscribed) => {}
            _ => panic!("expected NotSubscribed"),
        }
        assert!(state.logs.is_empty());
        assert_eq!(state.rate_window.current_count(), 0);
        assert_eq!(state.health.statistics.total_events, 0);
    }

    #[test]
    fn test_rate_limited_admission() {
        let mut state = state();
        let now = Utc::now();
        accepted(state.admit(&event(), AdmitMode::Event, now).unwrap());
        accepted(state.admit(&event(), AdmitMode::Event, now).unwrap());
        match state.admit(&event(), AdmitMode::Event, now).unwrap() {
            AdmitResult::Rejected(Rejection::RateLimited) => {}
            _ => panic!("expected RateLimited"),
        }
        assert_eq!(state.logs.len(), 2);

        // Test events bypass the limiter.
        accepted(state.admit(&DomainEvent::new("webhook.test", "ws_1"), AdmitMode::Test, now).unwrap());
    }

    #[test]
    fn test_claims_are_exclusive_and_attempt_guarded() {
        let mut state = state();
        let (log, _) = accepted(state.admit(&event(), AdmitMode::Event, Utc::now()).unwrap());
        assert!(!state.claim(&log.event_id, 1), "already claimed on admission");

        state.release(&log.event_id, None);
        assert!(!state.claim(&log.event_id, 2), "wrong attempt number");
        assert!(state.claim(&log.event_id, 1));
    }

    #[test]
    fn test_claim_due_skips_future_and_inactive() {
        let mut state = state();
        let now = Utc::now();
        let (log, _) = accepted(state.admit(&event(), AdmitMode::Event, now).unwrap());
        state.release(&log.event_id, None);
        if let Some(entry) = state.logs.get_mut(&log.event_id) {
            entry.total_attempts = 1;
            entry.next_retry_at = Some(now + ChronoDuration::seconds(5));
        }

        assert!(state.claim_due(now).is_empty());

        state.health.disable("maintenance", now);
        assert!(state.claim_due(now + ChronoDuration::seconds(10)).is_empty());

        state.health.enable(now);
        let tasks = state.claim_due(now + ChronoDuration::seconds(10));
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].attempt, 2);
        assert!(state.claim_due(now + ChronoDuration::seconds(10)).is_empty());
    }
}
