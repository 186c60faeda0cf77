use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::dispatch::{build_request, execute, CaptureLimits, Transport};
use crate::engine::EngineConfig;
use crate::error::DeliveryOutcome;
use crate::registry::Registry;
use crate::scheduler::{apply_attempt, jitter_delay, ScheduledRetry, Task, Transition};
use crate::storage::Storage;
use crate::types::SubscriptionId;

#[cfg(feature = "metrics")]
pub(crate) fn metric_inc(name: &'static str) {
    metrics::increment_counter!(name);
}

#[cfg(not(feature = "metrics"))]
pub(crate) fn metric_inc(_name: &'static str) {}

#[cfg(feature = "metrics")]
pub(crate) fn metric_inc_subscription(name: &'static str, subscription_id: &SubscriptionId) {
    metrics::increment_counter!(name, "subscription" => subscription_id.0.clone());
}

#[cfg(not(feature = "metrics"))]
pub(crate) fn metric_inc_subscription(_name: &'static str, _subscription_id: &SubscriptionId) {}

/// State shared by the engine handle, the scheduler and every worker.
pub(crate) struct WorkerContext {
    pub registry: Registry,
    pub transport: Arc<dyn Transport>,
    pub storage: Arc<dyn Storage>,
    pub config: EngineConfig,

    /// Failed attempts waiting on backoff go to the scheduler.
    pub retry_tx: mpsc::Sender<ScheduledRetry>,

    pub is_running: AtomicBool,
}

impl WorkerContext {
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    fn capture_limits(&self) -> CaptureLimits {
        CaptureLimits {
            max_body_bytes: self.config.max_response_body_bytes,
            max_headers: self.config.max_recorded_headers,
        }
    }
}

/// Main worker loop.
///
/// Each worker pulls claimed attempts from the shared queue and performs
/// them one at a time. The subscription lock is never held across the
/// HTTP call.
pub(crate) async fn worker_loop(rx: Arc<Mutex<mpsc::Receiver<Task>>>, ctx: Arc<WorkerContext>) {
    loop {
        let task = {
            let mut guard = rx.lock().await;
            guard.recv().await
        };

        let Some(task) = task else { break };

        process_task(task, &ctx).await;
    }
}

/// Perform one claimed attempt and apply its result.
async fn process_task(task: Task, ctx: &WorkerContext) {
    let Some(entry) = ctx.registry.get(&task.subscription_id).await else {
        debug!(subscription_id = %task.subscription_id, "subscription removed, dropping task");
        return;
    };

    let (config, request) = {
        let mut state = entry.lock().await;
        let active = state.health.is_active();
        let running = ctx.is_running();
        let config = state.config.clone();
        let Some(log) = state.logs.get_mut(&task.event_id) else {
            debug!(event_id = %task.event_id, "event log evicted before attempt");
            return;
        };
        if !log.is_pending() {
            log.in_flight = false;
            return;
        }
        if !active || !running {
            // Held: mark due so the sweep picks it up once re-enabled.
            log.in_flight = false;
            log.next_retry_at = Some(log.next_retry_at.unwrap_or_else(Utc::now));
            debug!(
                subscription_id = %task.subscription_id,
                event_id = %task.event_id,
                attempt = task.attempt,
                "attempt held"
            );
            return;
        }
        let request = build_request(&config, log, task.attempt, &ctx.config.user_agent);
        (config, request)
    };

    let (attempt, outcome) = execute(
        ctx.transport.as_ref(),
        &request,
        &config.security.allowed_ips,
        task.attempt,
        ctx.capture_limits(),
    )
    .await;
    let latency_ms = attempt.latency_ms;
    let now = Utc::now();

    let (log, health, transition) = {
        let mut guard = entry.lock().await;
        let state = &mut *guard;
        let thresholds = state.thresholds(&ctx.config.health);
        let was_active = state.health.is_active();

        let mut result = None;
        if let Some(log) = state.logs.get_mut(&task.event_id) {
            let transition = apply_attempt(log, attempt, &outcome, &state.config.retry, now);
            log.in_flight = false;
            result = Some((log.clone(), transition));
        } else {
            warn!(
                subscription_id = %task.subscription_id,
                event_id = %task.event_id,
                "event log evicted while in flight; outcome counted in health only"
            );
        }

        match &outcome {
            DeliveryOutcome::Delivered => state.health.record_success(latency_ms, now, &thresholds),
            DeliveryOutcome::Failed(_) => state.health.record_failure(now, &thresholds),
        }

        if was_active && !state.health.is_active() {
            warn!(
                subscription_id = %task.subscription_id,
                consecutive_failures = state.health.status.consecutive_failures,
                "subscription auto-disabled"
            );
            metric_inc_subscription("webhook.subscription.auto_disabled", &task.subscription_id);
        }

        let Some((log, transition)) = result else {
            let health = state.health.clone();
            drop(guard);
            ctx.storage.record_status(&task.subscription_id, &health).await;
            return;
        };
        (log, state.health.clone(), transition)
    };

    match &transition {
        Transition::Delivered => {
            info!(
                subscription_id = %task.subscription_id,
                event_id = %task.event_id,
                attempt = task.attempt,
                latency_ms,
                "webhook delivered"
            );
            metric_inc("webhook.delivery.success");
            metric_inc_subscription("webhook.delivery.success.subscription", &task.subscription_id);
        }
        Transition::RetryAt(at) => {
            let error = log.attempts.last().and_then(|a| a.error.clone()).unwrap_or_default();
            warn!(
                subscription_id = %task.subscription_id,
                event_id = %task.event_id,
                attempt = task.attempt,
                error = %error,
                next_retry_at = %at,
                "webhook attempt failed, retry scheduled"
            );
            metric_inc("webhook.delivery.retry_scheduled");

            let delay = (*at - now).to_std().unwrap_or(Duration::ZERO);
            let retry = ScheduledRetry {
                task: Task {
                    attempt: task.attempt + 1,
                    ..task.clone()
                },
                ready_at: Instant::now() + delay + jitter_delay(ctx.config.retry_jitter_ms),
            };
            if ctx.retry_tx.send(retry).await.is_err() {
                debug!(event_id = %task.event_id, "scheduler stopped; retry left to the sweep");
            }
        }
        Transition::Failed => {
            warn!(
                subscription_id = %task.subscription_id,
                event_id = %task.event_id,
                attempts = log.total_attempts,
                "webhook delivery failed permanently"
            );
            metric_inc("webhook.delivery.failure");
            metric_inc_subscription("webhook.delivery.failure.subscription", &task.subscription_id);
        }
        Transition::Cancelled => {
            debug!(
                subscription_id = %task.subscription_id,
                event_id = %task.event_id,
                "attempt finished on a cancelled event"
            );
        }
    }

    ctx.storage.record_event_log(&task.subscription_id, &log).await;
    ctx.storage.record_status(&task.subscription_id, &health).await;
}
