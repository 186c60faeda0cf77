#[cfg(feature = "redis")]
use async_trait::async_trait;
#[cfg(feature = "redis")]
use chrono::{DateTime, Utc};
#[cfg(feature = "redis")]
use redis::AsyncCommands;
#[cfg(feature = "redis")]
use std::collections::HashMap;
#[cfg(feature = "redis")]
use tracing::warn;

#[cfg(feature = "redis")]
use crate::health::SubscriptionHealth;
#[cfg(feature = "redis")]
use crate::log_store::EventLog;
#[cfg(feature = "redis")]
use crate::storage::Storage;
#[cfg(feature = "redis")]
use crate::types::SubscriptionId;

/// Redis-backed history.
///
/// Layout under `prefix`: one hash of event id to log JSON per subscription,
/// a hash of subscription id to health JSON, and a set of known subscriptions.
#[cfg(feature = "redis")]
pub struct RedisStorage {
    client: redis::Client,
    prefix: String,
}

#[cfg(feature = "redis")]
impl RedisStorage {
    pub fn new(client: redis::Client, prefix: impl Into<String>) -> Self {
        Self {
            client,
            prefix: prefix.into(),
        }
    }

    fn logs_key(&self, subscription_id: &SubscriptionId) -> String {
        format!("{}:logs:{}", self.prefix, subscription_id.0)
    }

    fn status_key(&self) -> String {
        format!("{}:status", self.prefix)
    }

    fn subscriptions_key(&self) -> String {
        format!("{}:subscriptions", self.prefix)
    }

    async fn connection(&self) -> Option<redis::aio::Connection> {
        match self.client.get_tokio_connection().await {
            Ok(conn) => Some(conn),
            Err(err) => {
                warn!(error = %err, "redis connection failed");
                None
            }
        }
    }
}

#[cfg(feature = "redis")]
#[async_trait]
impl Storage for RedisStorage {
    async fn record_event_log(&self, subscription_id: &SubscriptionId, log: &EventLog) {
        let Some(mut conn) = self.connection().await else { return };
        let payload = match serde_json::to_string(log) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(error = %err, event_id = %log.event_id, "event log not serializable");
                return;
            }
        };
        let result: redis::RedisResult<()> = conn
            .hset(self.logs_key(subscription_id), &log.event_id.0, payload)
            .await;
        if let Err(err) = result {
            warn!(error = %err, event_id = %log.event_id, "failed to persist event log");
        }
        let _: redis::RedisResult<()> = conn.sadd(self.subscriptions_key(), &subscription_id.0).await;
    }

    async fn record_status(&self, subscription_id: &SubscriptionId, health: &SubscriptionHealth) {
        let Some(mut conn) = self.connection().await else { return };
        let payload = serde_json::to_string(health).unwrap_or_default();
        let result: redis::RedisResult<()> =
            conn.hset(self.status_key(), &subscription_id.0, payload).await;
        if let Err(err) = result {
            warn!(error = %err, subscription_id = %subscription_id, "failed to persist status");
        }
    }

    async fn load_event_logs(&self, subscription_id: &SubscriptionId) -> Vec<EventLog> {
        let Some(mut conn) = self.connection().await else { return Vec::new() };
        let map: HashMap<String, String> = conn
            .hgetall(self.logs_key(subscription_id))
            .await
            .unwrap_or_default();
        let mut logs: Vec<EventLog> = map
            .into_values()
            .filter_map(|v| serde_json::from_str::<EventLog>(&v).ok())
            .collect();
        logs.sort_by_key(|l| l.sequence);
        logs
    }

    async fn load_status(&self, subscription_id: &SubscriptionId) -> Option<SubscriptionHealth> {
        let mut conn = self.connection().await?;
        let value: Option<String> = conn
            .hget(self.status_key(), &subscription_id.0)
            .await
            .unwrap_or_default();
        value.and_then(|v| serde_json::from_str(&v).ok())
    }

    async fn remove_subscription(&self, subscription_id: &SubscriptionId) {
        let Some(mut conn) = self.connection().await else { return };
        let _: redis::RedisResult<()> = conn.del(self.logs_key(subscription_id)).await;
        let _: redis::RedisResult<()> = conn.hdel(self.status_key(), &subscription_id.0).await;
        let _: redis::RedisResult<()> = conn.srem(self.subscriptions_key(), &subscription_id.0).await;
    }

    async fn prune_before(&self, cutoff: DateTime<Utc>) -> usize {
        let Some(mut conn) = self.connection().await else { return 0 };
        let subscriptions: Vec<String> = conn
            .smembers(self.subscriptions_key())
            .await
            .unwrap_or_default();

        let mut removed = 0;
        for subscription in subscriptions {
            let key = self.logs_key(&SubscriptionId(subscription));
            let map: HashMap<String, String> = conn.hgetall(&key).await.unwrap_or_default();
            let stale: Vec<String> = map
                .into_iter()
                .filter_map(|(event_id, v)| {
                    let log = serde_json::from_str::<EventLog>(&v).ok()?;
                    (log.created_at < cutoff).then_some(event_id)
                })
                .collect();
            if stale.is_empty() {
                continue;
            }
            let result: redis::RedisResult<usize> = conn.hdel(&key, &stale).await;
            removed += result.unwrap_or(0);
        }
        removed
    }
}
