use std::time::Duration;

use serde_json::json;
use webhook_engine::{DomainEvent, EngineConfig, Subscription, WebhookEngine};

#[tokio::main]
async fn main() -> Result<(), webhook_engine::EngineError> {
    let mut engine = WebhookEngine::new(EngineConfig::default())?;

    let subscription = Subscription::new("docs", "ws_acme", "https://example.com/webhook", "supersecret")
        .with_name("Document sync")
        .with_events(["document.updated", "document.deleted"])
        .with_rate_limit(100, 60);

    engine.register_subscription(subscription).await?;

    let event = DomainEvent::new("document.updated", "ws_acme")
        .with_document("doc_42")
        .with_data(json!({"id": "doc_42", "title": "Q3 plan"}));

    let report = engine.publish(&event).await?;
    println!("accepted {} / rejected {}", report.accepted.len(), report.rejected.len());

    engine.shutdown(Duration::from_secs(5)).await;
    Ok(())
}
