#![cfg(feature = "http")]

use std::net::IpAddr;
use std::time::Duration;

use serde_json::json;
use webhook_engine::{
    verify_signature, Admission, AttemptOutcome, AuthScheme, DomainEvent, EngineConfig, EventId,
    EventLog, EventLogStatus, FailureReason, RetryPolicy, SecurityOptions, Subscription,
    SubscriptionId, WebhookEngine,
};
use wiremock::matchers::{header, header_exists, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn engine() -> WebhookEngine {
    WebhookEngine::new(EngineConfig {
        worker_count: 2,
        sweep_interval_ms: 50,
        ..Default::default()
    })
    .unwrap()
}

fn subscription(server: &MockServer) -> Subscription {
    Subscription::new("wh_http", "ws_1", format!("{}/hook", server.uri()), "s3cret")
        .with_events(["document.updated"])
}

fn event() -> DomainEvent {
    DomainEvent::new("document.updated", "ws_1").with_data(json!({"title": "Q3 plan"}))
}

async fn deliver(engine: &WebhookEngine, sub: Subscription) -> (SubscriptionId, EventId) {
    let id = sub.id.clone();
    engine.register_subscription(sub).await.unwrap();
    match engine.trigger(&id, &event()).await.unwrap() {
        Admission::Accepted(event_id) => (id, event_id),
        Admission::Rejected(rejection) => panic!("rejected: {}", rejection),
    }
}

async fn wait_terminal(engine: &WebhookEngine, id: &SubscriptionId, event_id: &EventId) -> EventLog {
    for _ in 0..500 {
        let log = engine.event_log(id, event_id).await.unwrap();
        if log.status.is_terminal() && !log.in_flight {
            return log;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("delivery did not finish");
}

#[tokio::test]
async fn test_signed_post_is_delivered() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .and(header("content-type", "application/json"))
        .and(header("x-webhook-event", "document.updated"))
        .and(header("authorization", "Bearer t0ken"))
        .and(header_exists("x-signature"))
        .respond_with(ResponseTemplate::new(202).set_body_string("accepted"))
        .expect(1)
        .mount(&server)
        .await;

    let engine = engine();
    let sub = subscription(&server).with_security(SecurityOptions {
        auth: AuthScheme::Bearer { token: "t0ken".to_string() },
        ..Default::default()
    });
    let (id, event_id) = deliver(&engine, sub).await;

    let log = wait_terminal(&engine, &id, &event_id).await;
    assert_eq!(log.status, EventLogStatus::Delivered);
    let attempt = &log.attempts[0];
    assert_eq!(attempt.status_code, Some(202));
    assert_eq!(attempt.response_body.as_deref(), Some("accepted"));
    assert_eq!(attempt.request_headers.get("Authorization").map(String::as_str), Some("[redacted]"));

    let requests = server.received_requests().await.unwrap();
    let request = &requests[0];
    let signature = request.headers.get("x-signature").unwrap().to_str().unwrap();
    assert!(verify_signature(b"s3cret", &request.body, signature));
    assert_eq!(request.body, log.body.as_bytes());
}

#[tokio::test]
async fn test_server_errors_exhaust_retries() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(503).set_body_string("x".repeat(4_096)))
        .expect(2)
        .mount(&server)
        .await;

    let engine = engine();
    let sub = subscription(&server).with_retry_policy(RetryPolicy::exponential(2, 100, 1.0));
    let (id, event_id) = deliver(&engine, sub).await;

    let log = wait_terminal(&engine, &id, &event_id).await;
    assert_eq!(log.status, EventLogStatus::Failed);
    assert_eq!(log.total_attempts, 2);
    for attempt in &log.attempts {
        assert_eq!(attempt.status_code, Some(503));
        assert_eq!(attempt.failure, Some(FailureReason::ServerError(503)));
        assert!(attempt.response_body.as_ref().unwrap().len() <= 1_024 + 3);
    }
}

#[tokio::test]
async fn test_slow_endpoint_times_out() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
        .mount(&server)
        .await;

    let engine = engine();
    let sub = subscription(&server)
        .with_timeout(Duration::from_millis(1_000))
        .with_retry_policy(RetryPolicy::none());
    let (id, event_id) = deliver(&engine, sub).await;

    let log = wait_terminal(&engine, &id, &event_id).await;
    assert_eq!(log.status, EventLogStatus::Failed);
    assert_eq!(log.attempts[0].outcome, AttemptOutcome::Timeout);
    assert_eq!(log.attempts[0].failure, Some(FailureReason::Timeout));
}

#[tokio::test]
async fn test_ip_allow_list_blocks_before_sending() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let engine = engine();
    let allowed: IpAddr = "10.9.9.9".parse().unwrap();
    let sub = subscription(&server).with_security(SecurityOptions {
        allowed_ips: vec![allowed],
        ..Default::default()
    });
    let (id, event_id) = deliver(&engine, sub).await;

    let log = wait_terminal(&engine, &id, &event_id).await;
    assert_eq!(log.status, EventLogStatus::Failed);
    assert_eq!(log.total_attempts, 1);
    assert_eq!(log.attempts[0].failure, Some(FailureReason::IpNotAllowed));
    assert!(log.attempts[0].status_code.is_none());
}
