use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::Mutex;

use crate::health::SubscriptionHealth;
use crate::log_store::EventLog;
use crate::types::SubscriptionId;

/// Durable history behind the bounded in-memory rings.
///
/// Writes are best-effort: delivery never blocks on, or fails because of,
/// a storage error. Implementations log and move on.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Insert or replace a log, keyed by its event id.
    async fn record_event_log(&self, subscription_id: &SubscriptionId, log: &EventLog);
    async fn record_status(&self, subscription_id: &SubscriptionId, health: &SubscriptionHealth);

    /// Every stored log of a subscription, in creation order.
    async fn load_event_logs(&self, subscription_id: &SubscriptionId) -> Vec<EventLog>;
    async fn load_status(&self, subscription_id: &SubscriptionId) -> Option<SubscriptionHealth>;
    async fn remove_subscription(&self, subscription_id: &SubscriptionId);

    /// Delete logs created before `cutoff`, returning how many went.
    async fn prune_before(&self, cutoff: DateTime<Utc>) -> usize;
}

/// In-memory storage for lightweight deployments.
#[derive(Default)]
pub struct InMemoryStorage {
    logs: Mutex<HashMap<SubscriptionId, Vec<EventLog>>>,
    status: Mutex<HashMap<SubscriptionId, SubscriptionHealth>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn record_event_log(&self, subscription_id: &SubscriptionId, log: &EventLog) {
        let mut guard = self.logs.lock().await;
        let logs = guard.entry(subscription_id.clone()).or_default();
        match logs.iter_mut().find(|l| l.event_id == log.event_id) {
            Some(existing) => *existing = log.clone(),
            None => logs.push(log.clone()),
        }
    }

    async fn record_status(&self, subscription_id: &SubscriptionId, health: &SubscriptionHealth) {
        self.status
            .lock()
            .await
            .insert(subscription_id.clone(), health.clone());
    }

    async fn load_event_logs(&self, subscription_id: &SubscriptionId) -> Vec<EventLog> {
        let mut logs = self
            .logs
            .lock()
            .await
            .get(subscription_id)
            .cloned()
            .unwrap_or_default();
        logs.sort_by_key(|l| l.sequence);
        logs
    }

    async fn load_status(&self, subscription_id: &SubscriptionId) -> Option<SubscriptionHealth> {
        self.status.lock().await.get(subscription_id).cloned()
    }

    async fn remove_subscription(&self, subscription_id: &SubscriptionId) {
        self.logs.lock().await.remove(subscription_id);
        self.status.lock().await.remove(subscription_id);
    }

    async fn prune_before(&self, cutoff: DateTime<Utc>) -> usize {
        let mut guard = self.logs.lock().await;
        let mut removed = 0;
        for logs in guard.values_mut() {
            let before = logs.len();
            logs.retain(|l| l.created_at >= cutoff);
            removed += before - logs.len();
        }
        removed
    }
}
