//! Event log state machine and retry scheduling.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, Notify};
use tokio::time::{sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, warn};

use crate::error::{DeliveryOutcome, EngineError};
use crate::log_store::{DeliveryAttempt, EventLog, EventLogStatus};
use crate::types::{EventId, RetryPolicy, SubscriptionId};
use crate::worker::{metric_inc, WorkerContext};

/// One claimed attempt handed to the worker pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Task {
    pub subscription_id: SubscriptionId,
    pub event_id: EventId,
    pub attempt: u32,
}

/// A retry waiting in the delay heap.
#[derive(Debug)]
pub(crate) struct ScheduledRetry {
    pub task: Task,
    pub ready_at: Instant,
}

/// What an attempt did to its event log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Delivered,
    RetryAt(DateTime<Utc>),
    Failed,
    /// Cancelled while the attempt was in flight; the attempt is still kept.
    Cancelled,
}

/// Record `attempt` on `log` and move it to its next status.
///
/// The attempt is appended before any transition so history is never lost,
/// even for logs cancelled mid-flight.
pub fn apply_attempt(
    log: &mut EventLog,
    attempt: DeliveryAttempt,
    outcome: &DeliveryOutcome,
    policy: &RetryPolicy,
    now: DateTime<Utc>,
) -> Transition {
    let latency_ms = attempt.latency_ms;
    log.attempts.push(attempt);
    log.total_attempts += 1;
    log.last_attempt_at = Some(now);

    if log.status.is_terminal() {
        return Transition::Cancelled;
    }

    match outcome {
        DeliveryOutcome::Delivered => {
            log.status = EventLogStatus::Delivered;
            log.delivered_at = Some(now);
            log.response_time_ms = Some(latency_ms);
            log.next_retry_at = None;
            Transition::Delivered
        }
        DeliveryOutcome::Failed(reason) => {
            if policy.should_retry(log.total_attempts, reason) {
                let delay = policy.delay_after(log.total_attempts);
                let delay_ms = delay.as_millis().min(i64::MAX as u128) as i64;
                let at = now
                    .checked_add_signed(chrono::Duration::milliseconds(delay_ms))
                    .unwrap_or(DateTime::<Utc>::MAX_UTC);
                log.next_retry_at = Some(at);
                Transition::RetryAt(at)
            } else {
                log.status = EventLogStatus::Failed;
                log.next_retry_at = None;
                Transition::Failed
            }
        }
    }
}

/// Cancel a pending log. Terminal logs cannot be cancelled.
pub fn cancel(log: &mut EventLog) -> Result<(), EngineError> {
    if log.status.is_terminal() {
        return Err(EngineError::InvalidTransition(
            log.event_id.clone(),
            log.status.as_str(),
        ));
    }
    log.status = EventLogStatus::Cancelled;
    log.next_retry_at = None;
    Ok(())
}

#[derive(Debug)]
struct TimedTask {
    ready_at: Instant,
    task: Task,
}

impl Eq for TimedTask {}

impl PartialEq for TimedTask {
    fn eq(&self, other: &Self) -> bool {
        self.ready_at.eq(&other.ready_at)
    }
}

impl Ord for TimedTask {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Reverse for min-heap behavior
        other.ready_at.cmp(&self.ready_at)
    }
}

impl PartialOrd for TimedTask {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

/// Random extra delay in `0..=jitter_ms`.
pub(crate) fn jitter_delay(jitter_ms: u64) -> Duration {
    if jitter_ms == 0 {
        return Duration::from_millis(0);
    }
    Duration::from_millis(fastrand::u64(0..=jitter_ms))
}

/// Scheduler task: releases delayed retries when due and periodically
/// sweeps for due logs the heap does not know about (restored, requeued
/// after a full queue, or held while the subscription was disabled).
pub(crate) async fn scheduler_loop(
    ctx: Arc<WorkerContext>,
    mut retry_rx: mpsc::Receiver<ScheduledRetry>,
    ready_tx: mpsc::Sender<Task>,
    shutdown: Arc<Notify>,
) {
    let mut delay_heap: BinaryHeap<TimedTask> = BinaryHeap::new();
    let mut sweep = tokio::time::interval(Duration::from_millis(
        ctx.config.sweep_interval_ms.max(1),
    ));
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let now = Instant::now();
        while delay_heap.peek().map(|t| t.ready_at <= now).unwrap_or(false) {
            if let Some(timed) = delay_heap.pop() {
                release_retry(&ctx, &ready_tx, timed.task).await;
            }
        }

        let next_ready = delay_heap.peek().map(|t| t.ready_at);
        tokio::select! {
            _ = shutdown.notified() => {
                debug!(pending_retries = delay_heap.len(), "scheduler stopping");
                return;
            }
            retry = retry_rx.recv() => match retry {
                Some(retry) => delay_heap.push(TimedTask {
                    ready_at: retry.ready_at,
                    task: retry.task,
                }),
                None => return,
            },
            _ = sleep_until(next_ready.unwrap_or(now)), if next_ready.is_some() => {}
            _ = sweep.tick() => {
                sweep_due(&ctx, &ready_tx).await;
            }
        }
    }
}

async fn release_retry(ctx: &WorkerContext, ready_tx: &mpsc::Sender<Task>, task: Task) {
    let Some(entry) = ctx.registry.get(&task.subscription_id).await else {
        return;
    };
    let claimed = entry.lock().await.claim(&task.event_id, task.attempt);
    if claimed {
        enqueue(ctx, ready_tx, task).await;
    } else {
        debug!(
            subscription_id = %task.subscription_id,
            event_id = %task.event_id,
            attempt = task.attempt,
            "retry superseded"
        );
    }
}

/// Claim and enqueue every due log across all subscriptions.
pub(crate) async fn sweep_due(ctx: &WorkerContext, ready_tx: &mpsc::Sender<Task>) -> usize {
    let now = Utc::now();
    let mut released = 0;
    for (_, entry) in ctx.registry.all().await {
        let tasks = entry.lock().await.claim_due(now);
        for task in tasks {
            enqueue(ctx, ready_tx, task).await;
            released += 1;
        }
    }
    if released > 0 {
        debug!(released, "sweep released due retries");
    }
    released
}

/// Hand a claimed task to the workers without blocking.
///
/// A full or closed queue gives the claim back and marks the log due now so
/// the next sweep retries the hand-off.
pub(crate) async fn enqueue(ctx: &WorkerContext, ready_tx: &mpsc::Sender<Task>, task: Task) {
    let task = match ready_tx.try_send(task) {
        Ok(()) => {
            metric_inc("webhook.queue.enqueued");
            return;
        }
        Err(mpsc::error::TrySendError::Full(task)) => {
            warn!(
                subscription_id = %task.subscription_id,
                event_id = %task.event_id,
                "delivery queue full, deferring to sweep"
            );
            metric_inc("webhook.queue.full");
            task
        }
        Err(mpsc::error::TrySendError::Closed(task)) => task,
    };

    if let Some(entry) = ctx.registry.get(&task.subscription_id).await {
        entry.lock().await.release(&task.event_id, Some(Utc::now()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureReason;
    use crate::log_store::AttemptOutcome;
    use std::collections::BTreeMap;

    fn log() -> EventLog {
        EventLog::new("document.updated", serde_json::json!({}), "{}".to_string(), Utc::now())
    }

    fn attempt(number: u32, success: bool) -> DeliveryAttempt {
        DeliveryAttempt {
            attempt_number: number,
            timestamp: Utc::now(),
            outcome: if success { AttemptOutcome::Success } else { AttemptOutcome::Failed },
            status_code: Some(if success { 200 } else { 500 }),
            latency_ms: 12,
            request_headers: BTreeMap::new(),
            response_headers: BTreeMap::new(),
            response_body: None,
            error: None,
            failure: None,
        }
    }

    fn failed() -> DeliveryOutcome {
        DeliveryOutcome::Failed(FailureReason::ServerError(500))
    }

    #[test]
    fn test_backoff_then_terminal_failure() {
        let policy = RetryPolicy::default();
        let mut log = log();
        let now = Utc::now();

        let first = apply_attempt(&mut log, attempt(1, false), &failed(), &policy, now);
        assert_eq!(first, Transition::RetryAt(now + chrono::Duration::milliseconds(1_000)));

        let second = apply_attempt(&mut log, attempt(2, false), &failed(), &policy, now);
        assert_eq!(second, Transition::RetryAt(now + chrono::Duration::milliseconds(2_000)));

        let third = apply_attempt(&mut log, attempt(3, false), &failed(), &policy, now);
        assert_eq!(third, Transition::Failed);
        assert_eq!(log.status, EventLogStatus::Failed);
        assert_eq!(log.total_attempts, 3);
        assert_eq!(log.attempts.len(), 3);
        assert!(log.next_retry_at.is_none());
    }

    #[test]
    fn test_success_marks_delivered() {
        let mut log = log();
        let now = Utc::now();
        let transition = apply_attempt(
            &mut log,
            attempt(1, true),
            &DeliveryOutcome::Delivered,
            &RetryPolicy::default(),
            now,
        );
        assert_eq!(transition, Transition::Delivered);
        assert_eq!(log.delivered_at, Some(now));
        assert_eq!(log.response_time_ms, Some(12));
    }

    #[test]
    fn test_disabled_retry_fails_immediately() {
        let mut log = log();
        let transition = apply_attempt(&mut log, attempt(1, false), &failed(), &RetryPolicy::none(), Utc::now());
        assert_eq!(transition, Transition::Failed);
    }

    #[test]
    fn test_cancel_keeps_in_flight_attempt() {
        let mut log = log();
        cancel(&mut log).unwrap();
        let transition = apply_attempt(
            &mut log,
            attempt(1, true),
            &DeliveryOutcome::Delivered,
            &RetryPolicy::default(),
            Utc::now(),
        );
        assert_eq!(transition, Transition::Cancelled);
        assert_eq!(log.status, EventLogStatus::Cancelled);
        assert_eq!(log.attempts.len(), 1);
        assert!(log.delivered_at.is_none());

        assert!(matches!(cancel(&mut log), Err(EngineError::InvalidTransition(_, "cancelled"))));
    }

    #[test]
    fn test_delay_heap_is_min_ordered() {
        let base = Instant::now();
        let task = |n: u32| Task {
            subscription_id: SubscriptionId::from("wh"),
            event_id: EventId::from("evt"),
            attempt: n,
        };
        let mut heap = BinaryHeap::new();
        heap.push(TimedTask { ready_at: base + Duration::from_millis(300), task: task(3) });
        heap.push(TimedTask { ready_at: base + Duration::from_millis(100), task: task(1) });
        heap.push(TimedTask { ready_at: base + Duration::from_millis(200), task: task(2) });

        let order: Vec<u32> = std::iter::from_fn(|| heap.pop()).map(|t| t.task.attempt).collect();
        assert_eq!(order, vec![1, 2, 3]);
    }
}
