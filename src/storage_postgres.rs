#[cfg(feature = "postgres")]
use async_trait::async_trait;
#[cfg(feature = "postgres")]
use chrono::{DateTime, Utc};
#[cfg(feature = "postgres")]
use tokio_postgres::Client;
#[cfg(feature = "postgres")]
use tracing::warn;

#[cfg(feature = "postgres")]
use crate::health::SubscriptionHealth;
#[cfg(feature = "postgres")]
use crate::log_store::EventLog;
#[cfg(feature = "postgres")]
use crate::storage::Storage;
#[cfg(feature = "postgres")]
use crate::types::SubscriptionId;

#[cfg(feature = "postgres")]
pub struct PostgresStorage {
    client: Client,
}

#[cfg(feature = "postgres")]
impl PostgresStorage {
    pub async fn new(client: Client) -> Result<Self, tokio_postgres::Error> {
        client
            .execute(
                "CREATE TABLE IF NOT EXISTS webhook_event_logs (
                    subscription_id TEXT NOT NULL,
                    event_id TEXT NOT NULL,
                    sequence BIGINT NOT NULL,
                    created_at_ms BIGINT NOT NULL,
                    payload JSONB NOT NULL,
                    PRIMARY KEY (subscription_id, event_id)
                )",
                &[],
            )
            .await?;

        client
            .execute(
                "CREATE TABLE IF NOT EXISTS webhook_subscription_status (
                    subscription_id TEXT PRIMARY KEY,
                    payload JSONB NOT NULL
                )",
                &[],
            )
            .await?;

        Ok(Self { client })
    }
}

#[cfg(feature = "postgres")]
#[async_trait]
impl Storage for PostgresStorage {
    async fn record_event_log(&self, subscription_id: &SubscriptionId, log: &EventLog) {
        let payload = match serde_json::to_value(log) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(error = %err, event_id = %log.event_id, "event log not serializable");
                return;
            }
        };
        let result = self.client.execute(
            "INSERT INTO webhook_event_logs (subscription_id, event_id, sequence, created_at_ms, payload)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (subscription_id, event_id) DO UPDATE SET payload = EXCLUDED.payload",
            &[
                &subscription_id.0,
                &log.event_id.0,
                &(log.sequence as i64),
                &log.created_at.timestamp_millis(),
                &payload,
            ],
        ).await;
        if let Err(err) = result {
            warn!(error = %err, event_id = %log.event_id, "failed to persist event log");
        }
    }

    async fn record_status(&self, subscription_id: &SubscriptionId, health: &SubscriptionHealth) {
        let payload = serde_json::to_value(health).unwrap_or_default();
        let result = self.client.execute(
            "INSERT INTO webhook_subscription_status (subscription_id, payload)
             VALUES ($1, $2)
             ON CONFLICT (subscription_id) DO UPDATE SET payload = EXCLUDED.payload",
            &[&subscription_id.0, &payload],
        ).await;
        if let Err(err) = result {
            warn!(error = %err, subscription_id = %subscription_id, "failed to persist status");
        }
    }

    async fn load_event_logs(&self, subscription_id: &SubscriptionId) -> Vec<EventLog> {
        let rows = self.client
            .query(
                "SELECT payload FROM webhook_event_logs WHERE subscription_id = $1 ORDER BY sequence",
                &[&subscription_id.0],
            )
            .await
            .unwrap_or_default();

        rows.into_iter()
            .filter_map(|row| row.try_get::<_, serde_json::Value>(0).ok())
            .filter_map(|v| serde_json::from_value::<EventLog>(v).ok())
            .collect()
    }

    async fn load_status(&self, subscription_id: &SubscriptionId) -> Option<SubscriptionHealth> {
        let row = self.client
            .query_opt(
                "SELECT payload FROM webhook_subscription_status WHERE subscription_id = $1",
                &[&subscription_id.0],
            )
            .await
            .ok()??;
        let payload: serde_json::Value = row.try_get(0).ok()?;
        serde_json::from_value(payload).ok()
    }

    async fn remove_subscription(&self, subscription_id: &SubscriptionId) {
        let _ = self.client.execute(
            "DELETE FROM webhook_event_logs WHERE subscription_id = $1",
            &[&subscription_id.0],
        ).await;
        let _ = self.client.execute(
            "DELETE FROM webhook_subscription_status WHERE subscription_id = $1",
            &[&subscription_id.0],
        ).await;
    }

    async fn prune_before(&self, cutoff: DateTime<Utc>) -> usize {
        let result = self.client.execute(
            "DELETE FROM webhook_event_logs WHERE created_at_ms < $1",
            &[&cutoff.timestamp_millis()],
        ).await;
        match result {
            Ok(removed) => removed as usize,
            Err(err) => {
                warn!(error = %err, "failed to prune event logs");
                0
            }
        }
    }
}
