use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::dispatch::Transport;
use crate::error::{EngineError, Rejection};
use crate::health::{Health, HealthThresholds, SubscriptionHealth, SubscriptionStatus};
use crate::log_store::{EventLog, WindowStatistics};
use crate::rate_limit::RateLimiterStats;
use crate::registry::{AdmitMode, AdmitResult, Registry, SubscriptionEntry, SubscriptionState};
use crate::scheduler::{self, scheduler_loop, Task};
use crate::storage::{InMemoryStorage, Storage};
use crate::types::{DomainEvent, EventId, Subscription, SubscriptionId, WorkspaceId};
use crate::worker::{metric_inc, metric_inc_subscription, worker_loop, WorkerContext};

/// Event type used by [`WebhookEngine::send_test_event`].
pub const TEST_EVENT_TYPE: &str = "webhook.test";

/// Retention used by [`WebhookEngine::prune_logs`] when callers have no opinion.
pub const DEFAULT_LOG_RETENTION_DAYS: u32 = 90;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub worker_count: usize,

    /// Capacity of the ready queue between scheduler and workers.
    pub queue_size: usize,

    /// How often pending logs are swept for due retries.
    pub sweep_interval_ms: u64,

    /// Upper bound of random delay added to each scheduled retry.
    pub retry_jitter_ms: u64,

    /// Event logs kept in memory per subscription.
    pub log_capacity: usize,

    /// Never evict pending logs from the in-memory ring.
    pub retain_pending_on_eviction: bool,

    pub max_response_body_bytes: usize,
    pub max_recorded_headers: usize,
    pub user_agent: String,
    pub health: HealthThresholds,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let worker_count = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);

        Self {
            worker_count,
            queue_size: 1_000,
            sweep_interval_ms: 1_000,
            retry_jitter_ms: 0,
            log_capacity: 100,
            retain_pending_on_eviction: false,
            max_response_body_bytes: 1_024,
            max_recorded_headers: 32,
            user_agent: concat!("webhook-engine/", env!("CARGO_PKG_VERSION")).to_string(),
            health: HealthThresholds::default(),
        }
    }
}

/// Result of offering an event to one subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Accepted(EventId),
    Rejected(Rejection),
}

impl Admission {
    pub fn event_id(&self) -> Option<&EventId> {
        match self {
            Admission::Accepted(id) => Some(id),
            Admission::Rejected(_) => None,
        }
    }
}

/// Per-subscription admissions for one published event.
#[derive(Debug, Clone, Default)]
pub struct PublishReport {
    pub accepted: Vec<(SubscriptionId, EventId)>,
    pub rejected: Vec<(SubscriptionId, Rejection)>,
}

/// Roll-up over every subscription of a workspace.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WorkspaceStatistics {
    pub total: usize,
    pub active: usize,
    pub healthy: usize,
    pub failing: usize,
    pub total_events: u64,
    pub total_successful: u64,
    pub total_failed: u64,
    pub average_success_rate: f64,
}

/// In-process webhook delivery engine.
///
/// Owns the subscription registry, a scheduler task and a bounded worker
/// pool. Must be created inside a tokio runtime.
pub struct WebhookEngine {
    ready_tx: Option<mpsc::Sender<Task>>,
    worker_handles: Vec<JoinHandle<()>>,
    scheduler_handle: Option<JoinHandle<()>>,
    shutdown_signal: Arc<Notify>,
    ctx: Arc<WorkerContext>,
}

impl WebhookEngine {
    /// Engine delivering over HTTP with in-memory history.
    #[cfg(feature = "http")]
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        let transport = crate::dispatch::HttpTransport::new(&config.user_agent)?;
        Ok(Self::with_transport(config, Arc::new(transport)))
    }

    pub fn with_transport(config: EngineConfig, transport: Arc<dyn Transport>) -> Self {
        Self::with_storage(config, transport, Arc::new(InMemoryStorage::new()))
    }

    pub fn with_storage(
        config: EngineConfig,
        transport: Arc<dyn Transport>,
        storage: Arc<dyn Storage>,
    ) -> Self {
        let (ready_tx, ready_rx) = mpsc::channel(config.queue_size.max(1));
        let shared_ready_rx = Arc::new(Mutex::new(ready_rx));
        let (retry_tx, retry_rx) = mpsc::channel(config.queue_size.max(1));

        let worker_count = config.worker_count.max(1);
        let ctx = Arc::new(WorkerContext {
            registry: Registry::default(),
            transport,
            storage,
            config,
            retry_tx,
            is_running: AtomicBool::new(true),
        });

        let worker_handles = (0..worker_count)
            .map(|_| tokio::spawn(worker_loop(shared_ready_rx.clone(), ctx.clone())))
            .collect();

        let shutdown_signal = Arc::new(Notify::new());
        let scheduler_handle = tokio::spawn(scheduler_loop(
            ctx.clone(),
            retry_rx,
            ready_tx.clone(),
            shutdown_signal.clone(),
        ));

        info!(workers = worker_count, "webhook engine started");

        Self {
            ready_tx: Some(ready_tx),
            worker_handles,
            scheduler_handle: Some(scheduler_handle),
            shutdown_signal,
            ctx,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.ctx.config
    }

    pub fn is_running(&self) -> bool {
        self.ctx.is_running()
    }

    fn ensure_running(&self) -> Result<(), EngineError> {
        if self.is_running() {
            Ok(())
        } else {
            Err(EngineError::Shutdown)
        }
    }

    // Subscription management

    /// Validate and register a subscription, restoring any stored status
    /// and recent logs. Restored pending logs become due immediately.
    pub async fn register_subscription(&self, subscription: Subscription) -> Result<(), EngineError> {
        self.ensure_running()?;
        subscription.validate()?;

        let id = subscription.id.clone();
        if self.ctx.registry.contains(&id).await {
            return Err(EngineError::DuplicateSubscription(id));
        }

        let mut state = SubscriptionState::new(
            subscription,
            self.ctx.config.log_capacity,
            self.ctx.config.retain_pending_on_eviction,
        );

        let now = Utc::now();
        if let Some(health) = self.ctx.storage.load_status(&id).await {
            state.health = health;
        }
        let mut restored = 0usize;
        let mut evicted = Vec::new();
        for mut log in self.ctx.storage.load_event_logs(&id).await {
            if log.is_pending() {
                log.next_retry_at = Some(log.next_retry_at.unwrap_or(now));
            }
            evicted.extend(state.logs.restore(log));
            restored += 1;
        }
        report_pending_evictions(&id, &evicted);

        let health = state.health.clone();
        self.ctx.registry.insert(id.clone(), state).await?;
        self.ctx.storage.record_status(&id, &health).await;

        info!(subscription_id = %id, restored_logs = restored, "subscription registered");
        Ok(())
    }

    /// Replace a subscription's configuration. Health, window and logs are kept.
    pub async fn update_subscription(&self, subscription: Subscription) -> Result<(), EngineError> {
        subscription.validate()?;
        let id = subscription.id.clone();
        let entry = self.ctx.registry.require(&id).await?;

        let health = {
            let mut state = entry.lock().await;
            state.config = Arc::new(subscription);
            let thresholds = state.thresholds(&self.ctx.config.health);
            state.health.reclassify(Utc::now(), &thresholds);
            state.health.clone()
        };
        self.ctx.storage.record_status(&id, &health).await;

        info!(subscription_id = %id, "subscription updated");
        Ok(())
    }

    /// Drop a subscription and its history. Queued attempts are discarded.
    pub async fn remove_subscription(&self, id: &SubscriptionId) -> Result<(), EngineError> {
        self.ctx
            .registry
            .remove(id)
            .await
            .ok_or_else(|| EngineError::SubscriptionNotFound(id.clone()))?;
        self.ctx.storage.remove_subscription(id).await;

        info!(subscription_id = %id, "subscription removed");
        Ok(())
    }

    pub async fn subscription(&self, id: &SubscriptionId) -> Result<Arc<Subscription>, EngineError> {
        let entry = self.ctx.registry.require(id).await?;
        let config = entry.lock().await.config.clone();
        Ok(config)
    }

    pub async fn subscriptions(&self) -> Vec<Arc<Subscription>> {
        let mut subscriptions = Vec::new();
        for (_, entry) in self.ctx.registry.all().await {
            subscriptions.push(entry.lock().await.config.clone());
        }
        subscriptions
    }

    /// Re-activate a subscription and reset its breaker. Pending logs resume
    /// through the sweep; failed logs stay failed.
    pub async fn enable(&self, id: &SubscriptionId) -> Result<(), EngineError> {
        let entry = self.ctx.registry.require(id).await?;
        let health = {
            let mut state = entry.lock().await;
            state.health.enable(Utc::now());
            state.health.clone()
        };
        self.ctx.storage.record_status(id, &health).await;

        info!(subscription_id = %id, "subscription enabled");
        Ok(())
    }

    /// Deactivate a subscription. Pending logs are held, not dropped.
    pub async fn disable(&self, id: &SubscriptionId, reason: impl Into<String>) -> Result<(), EngineError> {
        let reason = reason.into();
        let entry = self.ctx.registry.require(id).await?;
        let health = {
            let mut state = entry.lock().await;
            state.health.disable(reason.clone(), Utc::now());
            state.health.clone()
        };
        self.ctx.storage.record_status(id, &health).await;

        info!(subscription_id = %id, reason = %reason, "subscription disabled");
        Ok(())
    }

    // Event intake

    /// Offer `event` to every subscription of its workspace.
    pub async fn publish(&self, event: &DomainEvent) -> Result<PublishReport, EngineError> {
        self.ensure_running()?;

        let mut report = PublishReport::default();
        for (id, entry) in self.ctx.registry.for_workspace(&event.workspace_id).await {
            match self.admit(&id, &entry, event, AdmitMode::Event).await? {
                Admission::Accepted(event_id) => report.accepted.push((id, event_id)),
                Admission::Rejected(rejection) => report.rejected.push((id, rejection)),
            }
        }

        debug!(
            event_type = %event.event_type,
            workspace_id = %event.workspace_id,
            accepted = report.accepted.len(),
            rejected = report.rejected.len(),
            "event published"
        );
        Ok(report)
    }

    /// Offer `event` to one subscription.
    pub async fn trigger(&self, id: &SubscriptionId, event: &DomainEvent) -> Result<Admission, EngineError> {
        self.ensure_running()?;
        let entry = self.ctx.registry.require(id).await?;
        let owner = entry.lock().await.config.workspace_id.clone();
        if owner != event.workspace_id {
            metric_inc("webhook.event.workspace_mismatch");
            return Err(EngineError::WorkspaceMismatch(id.clone(), event.workspace_id.clone()));
        }
        self.admit(id, &entry, event, AdmitMode::Event).await
    }

    /// Deliver a synthetic `webhook.test` event, bypassing the event-type
    /// subscription, filters and rate limit.
    pub async fn send_test_event(&self, id: &SubscriptionId) -> Result<Admission, EngineError> {
        self.ensure_running()?;
        let entry = self.ctx.registry.require(id).await?;
        let config = entry.lock().await.config.clone();

        let event = DomainEvent::new(TEST_EVENT_TYPE, config.workspace_id.0.clone()).with_data(
            serde_json::json!({
                "event": TEST_EVENT_TYPE,
                "timestamp": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
                "webhook": {
                    "id": config.id.0,
                    "name": config.name,
                },
            }),
        );
        self.admit(id, &entry, &event, AdmitMode::Test).await
    }

    /// Queue a fresh delivery of a logged event with the identical body.
    pub async fn redeliver(&self, id: &SubscriptionId, event_id: &EventId) -> Result<Admission, EngineError> {
        self.ensure_running()?;
        let entry = self.ctx.registry.require(id).await?;

        let result = {
            let mut state = entry.lock().await;
            let source = state
                .logs
                .get(event_id)
                .ok_or_else(|| EngineError::EventLogNotFound {
                    subscription_id: id.clone(),
                    event_id: event_id.clone(),
                })?;
            if !state.health.is_active() {
                AdmitResult::Rejected(Rejection::Inactive)
            } else {
                let now = Utc::now();
                let log = EventLog::new(
                    source.event_type.clone(),
                    source.payload.clone(),
                    source.body.clone(),
                    now,
                );
                state.accept(log, now)
            }
        };

        let admission = self.finish_admission(id, result).await;
        if let Admission::Accepted(new_id) = &admission {
            info!(subscription_id = %id, event_id = %event_id, redelivery_id = %new_id, "event redelivery queued");
        }
        Ok(admission)
    }

    /// Force a pending log to `cancelled`.
    pub async fn cancel_event(&self, id: &SubscriptionId, event_id: &EventId) -> Result<(), EngineError> {
        let entry = self.ctx.registry.require(id).await?;
        let log = {
            let mut state = entry.lock().await;
            let log = state
                .logs
                .get_mut(event_id)
                .ok_or_else(|| EngineError::EventLogNotFound {
                    subscription_id: id.clone(),
                    event_id: event_id.clone(),
                })?;
            scheduler::cancel(log)?;
            log.clone()
        };
        self.ctx.storage.record_event_log(id, &log).await;

        info!(subscription_id = %id, event_id = %event_id, "event cancelled");
        Ok(())
    }

    async fn admit(
        &self,
        id: &SubscriptionId,
        entry: &SubscriptionEntry,
        event: &DomainEvent,
        mode: AdmitMode,
    ) -> Result<Admission, EngineError> {
        let result = entry.lock().await.admit(event, mode, Utc::now())?;
        Ok(self.finish_admission(id, result).await)
    }

    async fn finish_admission(&self, id: &SubscriptionId, result: AdmitResult) -> Admission {
        match result {
            AdmitResult::Rejected(rejection) => {
                debug!(subscription_id = %id, reason = %rejection, "event rejected");
                if rejection == Rejection::RateLimited {
                    metric_inc_subscription("webhook.event.rate_limited", id);
                }
                metric_inc("webhook.event.rejected");
                Admission::Rejected(rejection)
            }
            AdmitResult::Accepted { log, task, evicted } => {
                report_pending_evictions(id, &evicted);
                self.ctx.storage.record_event_log(id, &log).await;
                metric_inc("webhook.event.accepted");
                self.enqueue(task).await;
                Admission::Accepted(log.event_id)
            }
        }
    }

    async fn enqueue(&self, task: Task) {
        match &self.ready_tx {
            Some(tx) => scheduler::enqueue(&self.ctx, tx, task).await,
            None => {
                if let Some(entry) = self.ctx.registry.get(&task.subscription_id).await {
                    entry.lock().await.release(&task.event_id, Some(Utc::now()));
                }
            }
        }
    }

    // Queries

    /// Aggregates over logs created within the trailing `window`.
    pub async fn statistics(
        &self,
        id: &SubscriptionId,
        window: chrono::Duration,
    ) -> Result<WindowStatistics, EngineError> {
        let entry = self.ctx.registry.require(id).await?;
        let since = Utc::now() - window;
        let stats = entry.lock().await.logs.statistics(since);
        Ok(stats)
    }

    /// Newest `limit` logs, oldest first.
    pub async fn recent_logs(&self, id: &SubscriptionId, limit: usize) -> Result<Vec<EventLog>, EngineError> {
        let entry = self.ctx.registry.require(id).await?;
        let logs = entry.lock().await.logs.recent(limit);
        Ok(logs)
    }

    pub async fn event_log(&self, id: &SubscriptionId, event_id: &EventId) -> Result<EventLog, EngineError> {
        let entry = self.ctx.registry.require(id).await?;
        let state = entry.lock().await;
        state
            .logs
            .get(event_id)
            .cloned()
            .ok_or_else(|| EngineError::EventLogNotFound {
                subscription_id: id.clone(),
                event_id: event_id.clone(),
            })
    }

    pub async fn subscription_health(&self, id: &SubscriptionId) -> Result<SubscriptionHealth, EngineError> {
        let entry = self.ctx.registry.require(id).await?;
        let health = entry.lock().await.health.clone();
        Ok(health)
    }

    /// Window snapshots of every subscription with rate limiting enabled.
    pub async fn rate_limiter_stats(&self) -> HashMap<SubscriptionId, RateLimiterStats> {
        let mut stats = HashMap::new();
        for (id, entry) in self.ctx.registry.all().await {
            let state = entry.lock().await;
            if state.config.rate_limit.enabled {
                stats.insert(id, state.rate_window.snapshot(&state.config.rate_limit));
            }
        }
        stats
    }

    pub async fn workspace_statistics(&self, workspace_id: &WorkspaceId) -> WorkspaceStatistics {
        let mut stats = WorkspaceStatistics::default();
        let mut rate_sum = 0.0;
        for (_, entry) in self.ctx.registry.for_workspace(workspace_id).await {
            let state = entry.lock().await;
            let health = &state.health;
            stats.total += 1;
            if health.is_active() {
                stats.active += 1;
            }
            match health.health() {
                Health::Healthy => stats.healthy += 1,
                Health::Failing => stats.failing += 1,
                Health::Degraded | Health::Disabled => {}
            }
            stats.total_events += health.statistics.total_events;
            stats.total_successful += health.statistics.success_count;
            stats.total_failed += health.statistics.failure_count;
            rate_sum += health.statistics.success_rate;
        }
        if stats.total > 0 {
            stats.average_success_rate = rate_sum / stats.total as f64;
        }
        stats
    }

    /// Active subscriptions currently classified degraded or failing.
    pub async fn unhealthy_subscriptions(&self) -> Vec<(SubscriptionId, SubscriptionStatus)> {
        let mut unhealthy = Vec::new();
        for (id, entry) in self.ctx.registry.all().await {
            let state = entry.lock().await;
            let status = &state.health.status;
            if status.is_active && matches!(status.health, Health::Degraded | Health::Failing) {
                unhealthy.push((id, status.clone()));
            }
        }
        unhealthy
    }

    // Maintenance

    /// Zero statistics and consecutive failures and clear the in-memory ring.
    pub async fn reset_statistics(&self, id: &SubscriptionId) -> Result<(), EngineError> {
        let entry = self.ctx.registry.require(id).await?;
        let health = {
            let mut state = entry.lock().await;
            let thresholds = state.thresholds(&self.ctx.config.health);
            state.health.reset_statistics(Utc::now(), &thresholds);
            state.logs.clear();
            state.health.clone()
        };
        self.ctx.storage.record_status(id, &health).await;

        info!(subscription_id = %id, "statistics reset");
        Ok(())
    }

    /// Drop logs older than `days` from every ring and from durable storage.
    /// Returns how many in-memory logs were removed.
    pub async fn prune_logs(&self, days: u32) -> usize {
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(days));
        let mut removed = 0;
        for (_, entry) in self.ctx.registry.all().await {
            removed += entry.lock().await.logs.prune_before(cutoff);
        }
        let stored = self.ctx.storage.prune_before(cutoff).await;

        info!(days, removed, stored, "old event logs pruned");
        removed
    }

    /// Dispatch every due pending log now instead of waiting for the next
    /// periodic sweep. Returns how many attempts were queued.
    pub async fn sweep_due_retries(&self) -> usize {
        match &self.ready_tx {
            Some(tx) => scheduler::sweep_due(&self.ctx, tx).await,
            None => 0,
        }
    }

    /// Stop intake and the scheduler, give in-flight attempts `grace` to
    /// finish, then abort the rest. Unstarted attempts stay pending.
    pub async fn shutdown(&mut self, grace: Duration) {
        self.ctx.is_running.store(false, Ordering::SeqCst);
        self.shutdown_signal.notify_one();
        if let Some(handle) = self.scheduler_handle.take() {
            let _ = handle.await;
        }
        self.ready_tx.take();

        let deadline = Instant::now() + grace;
        let mut aborted = 0usize;
        for mut handle in self.worker_handles.drain(..) {
            if tokio::time::timeout_at(deadline, &mut handle).await.is_err() {
                handle.abort();
                aborted += 1;
            }
        }

        info!(aborted, "webhook engine stopped");
    }
}

fn report_pending_evictions(id: &SubscriptionId, evicted: &[EventLog]) {
    for old in evicted.iter().filter(|l| l.is_pending()) {
        warn!(
            subscription_id = %id,
            event_id = %old.event_id,
            "pending event log evicted from ring"
        );
        metric_inc_subscription("webhook.log.pending_evicted", id);
    }
}
