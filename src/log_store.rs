//! Per-subscription event log history.

use std::collections::{BTreeMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::FailureReason;
use crate::types::EventId;

/// Delivery lifecycle status of one event for one subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventLogStatus {
    Pending,
    Delivered,
    Failed,
    Cancelled,
}

impl EventLogStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, EventLogStatus::Pending)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventLogStatus::Pending => "pending",
            EventLogStatus::Delivered => "delivered",
            EventLogStatus::Failed => "failed",
            EventLogStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    Failed,
    Timeout,
}

/// One HTTP call. Never modified after it is appended.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryAttempt {
    pub attempt_number: u32,
    pub timestamp: DateTime<Utc>,
    pub outcome: AttemptOutcome,
    pub status_code: Option<u16>,
    pub latency_ms: u64,
    pub request_headers: BTreeMap<String, String>,
    pub response_headers: BTreeMap<String, String>,
    pub response_body: Option<String>,
    pub error: Option<String>,
    pub failure: Option<FailureReason>,
}

impl DeliveryAttempt {
    pub fn is_success(&self) -> bool {
        self.outcome == AttemptOutcome::Success
    }
}

/// Delivery record of one event for one subscription.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventLog {
    pub event_id: EventId,
    pub event_type: String,

    /// Creation order within the owning subscription.
    pub sequence: u64,

    pub created_at: DateTime<Utc>,
    pub status: EventLogStatus,
    pub attempts: Vec<DeliveryAttempt>,
    pub total_attempts: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub response_time_ms: Option<u64>,

    /// Transformed payload.
    pub payload: serde_json::Value,

    /// Exact outbound body; signed and resent verbatim on every attempt.
    pub body: String,

    pub payload_size: usize,

    /// Set while a worker owns the next attempt.
    #[serde(skip)]
    pub in_flight: bool,
}

impl EventLog {
    pub fn new(
        event_type: impl Into<String>,
        payload: serde_json::Value,
        body: String,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            event_id: EventId::generate(),
            event_type: event_type.into(),
            sequence: 0,
            created_at,
            status: EventLogStatus::Pending,
            attempts: Vec::new(),
            total_attempts: 0,
            last_attempt_at: None,
            delivered_at: None,
            next_retry_at: None,
            response_time_ms: None,
            payload_size: body.len(),
            payload,
            body,
            in_flight: false,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == EventLogStatus::Pending
    }

    /// Pending, unclaimed and due at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.is_pending()
            && !self.in_flight
            && self.next_retry_at.map(|at| at <= now).unwrap_or(false)
    }
}

/// Aggregates over a trailing window of event logs.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WindowStatistics {
    pub total_events: usize,
    pub delivered: usize,
    pub failed: usize,
    pub pending: usize,
    pub cancelled: usize,
    pub average_attempts: f64,
    pub events_by_type: BTreeMap<String, usize>,
    pub success_rate: f64,
}

/// Bounded, creation-ordered history of event logs.
#[derive(Debug, Clone)]
pub struct EventLogRing {
    logs: VecDeque<EventLog>,
    capacity: usize,
    retain_pending: bool,
    next_sequence: u64,
}

impl EventLogRing {
    pub fn new(capacity: usize, retain_pending: bool) -> Self {
        Self {
            logs: VecDeque::new(),
            capacity: capacity.max(1),
            retain_pending,
            next_sequence: 0,
        }
    }

    /// Append a log, returning whatever had to be evicted to stay bounded.
    pub fn push(&mut self, mut log: EventLog) -> Vec<EventLog> {
        self.next_sequence = self.next_sequence.max(log.sequence);
        self.next_sequence += 1;
        log.sequence = self.next_sequence;
        self.logs.push_back(log);
        self.evict_overflow()
    }

    /// Put back a log loaded from durable storage, keeping its sequence.
    pub fn restore(&mut self, log: EventLog) -> Vec<EventLog> {
        let position = self
            .logs
            .iter()
            .position(|l| l.sequence > log.sequence)
            .unwrap_or(self.logs.len());
        self.next_sequence = self.next_sequence.max(log.sequence);
        self.logs.insert(position, log);
        self.evict_overflow()
    }

    /// Drop the oldest entries until the ring fits its capacity again.
    ///
    /// With `retain_pending`, pending logs are skipped over and the ring may
    /// hold more than `capacity` entries while they remain pending.
    fn evict_overflow(&mut self) -> Vec<EventLog> {
        let mut evicted = Vec::new();
        while self.logs.len() > self.capacity {
            let index = if self.retain_pending {
                match self.logs.iter().position(|l| !l.is_pending()) {
                    Some(index) => index,
                    None => break,
                }
            } else {
                0
            };
            match self.logs.remove(index) {
                Some(log) => evicted.push(log),
                None => break,
            }
        }
        evicted
    }

    /// Sequence assigned to the most recently pushed log.
    pub fn last_sequence(&self) -> u64 {
        self.next_sequence
    }

    pub fn get(&self, event_id: &EventId) -> Option<&EventLog> {
        self.logs.iter().find(|l| &l.event_id == event_id)
    }

    pub fn get_mut(&mut self, event_id: &EventId) -> Option<&mut EventLog> {
        self.logs.iter_mut().find(|l| &l.event_id == event_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &EventLog> {
        self.logs.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut EventLog> {
        self.logs.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.logs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.logs.is_empty()
    }

    pub fn clear(&mut self) {
        self.logs.clear();
    }

    /// Most recent `limit` logs, oldest first.
    pub fn recent(&self, limit: usize) -> Vec<EventLog> {
        let skip = self.logs.len().saturating_sub(limit);
        self.logs.iter().skip(skip).cloned().collect()
    }

    /// Drop logs created before `cutoff`, returning how many went.
    pub fn prune_before(&mut self, cutoff: DateTime<Utc>) -> usize {
        let before = self.logs.len();
        self.logs.retain(|l| l.created_at >= cutoff);
        before - self.logs.len()
    }

    pub fn statistics(&self, since: DateTime<Utc>) -> WindowStatistics {
        let mut stats = WindowStatistics::default();
        let mut attempts = 0u64;

        for log in self.logs.iter().filter(|l| l.created_at >= since) {
            stats.total_events += 1;
            attempts += log.total_attempts as u64;
            match log.status {
                EventLogStatus::Pending => stats.pending += 1,
                EventLogStatus::Delivered => stats.delivered += 1,
                EventLogStatus::Failed => stats.failed += 1,
                EventLogStatus::Cancelled => stats.cancelled += 1,
            }
            *stats.events_by_type.entry(log.event_type.clone()).or_insert(0) += 1;
        }

        if stats.total_events > 0 {
            stats.average_attempts = attempts as f64 / stats.total_events as f64;
            stats.success_rate = stats.delivered as f64 / stats.total_events as f64 * 100.0;
        }
        stats
    }
}
