//! Outbound request construction and single-attempt execution.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::Utc;
use thiserror::Error;
use tokio::time::Instant;

use crate::error::{DeliveryOutcome, FailureReason};
use crate::log_store::{AttemptOutcome, DeliveryAttempt, EventLog};
use crate::signing::{compute_signature, SIGNATURE_HEADER};
use crate::types::{AuthScheme, HttpMethod, Subscription};

pub const EVENT_HEADER: &str = "X-Webhook-Event";
pub const EVENT_ID_HEADER: &str = "X-Webhook-Id";
pub const ATTEMPT_HEADER: &str = "X-Webhook-Attempt";

const REDACTED: &str = "[redacted]";

/// A fully built, signed webhook request.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub url: String,
    pub method: HttpMethod,
    pub headers: Vec<(String, String)>,
    pub body: String,
    pub timeout: Duration,
    pub verify_tls: bool,
}

#[derive(Debug, Clone, Default)]
pub struct TransportResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("request failed: {0}")]
    Request(String),
}

/// Executes one HTTP exchange.
///
/// The engine owns retries, signing and bookkeeping; a transport only moves
/// bytes and reports what came back.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: &OutboundRequest) -> Result<TransportResponse, TransportError>;

    /// Resolve a host for the IP allow-list check.
    async fn resolve(&self, host: &str, port: u16) -> std::io::Result<Vec<IpAddr>> {
        let addrs = tokio::net::lookup_host((host, port)).await?;
        Ok(addrs.map(|addr| addr.ip()).collect())
    }
}

/// Limits applied when copying request/response metadata into an attempt.
#[derive(Debug, Clone, Copy)]
pub struct CaptureLimits {
    pub max_body_bytes: usize,
    pub max_headers: usize,
}

/// Build the signed request for the next attempt of `log`.
pub fn build_request(
    subscription: &Subscription,
    log: &EventLog,
    attempt_number: u32,
    user_agent: &str,
) -> OutboundRequest {
    let mut headers: Vec<(String, String)> = vec![
        ("Content-Type".to_string(), subscription.content_type.as_str().to_string()),
        ("User-Agent".to_string(), user_agent.to_string()),
    ];
    for (name, value) in &subscription.headers {
        headers.push((name.clone(), value.clone()));
    }
    if let Some(header) = auth_header(&subscription.security.auth) {
        headers.push(header);
    }
    headers.push((EVENT_HEADER.to_string(), log.event_type.clone()));
    headers.push((EVENT_ID_HEADER.to_string(), log.event_id.0.clone()));
    headers.push((ATTEMPT_HEADER.to_string(), attempt_number.to_string()));
    headers.push((
        SIGNATURE_HEADER.to_string(),
        compute_signature(subscription.secret.as_bytes(), log.body.as_bytes()),
    ));

    OutboundRequest {
        url: subscription.url.clone(),
        method: subscription.method,
        headers,
        body: log.body.clone(),
        timeout: subscription.timeout(),
        verify_tls: subscription.security.verify_tls,
    }
}

fn auth_header(auth: &AuthScheme) -> Option<(String, String)> {
    match auth {
        AuthScheme::None => None,
        AuthScheme::Basic { username, password } => Some((
            "Authorization".to_string(),
            format!("Basic {}", BASE64.encode(format!("{}:{}", username, password))),
        )),
        AuthScheme::Bearer { token } => {
            Some(("Authorization".to_string(), format!("Bearer {}", token)))
        }
        AuthScheme::ApiKey { header, key } => Some((header.clone(), key.clone())),
    }
}

/// Resolve the target host and require every address to be allow-listed.
pub async fn check_allowed_ips(
    transport: &dyn Transport,
    url: &str,
    allowed: &[IpAddr],
) -> Result<(), FailureReason> {
    if allowed.is_empty() {
        return Ok(());
    }

    let parsed = url::Url::parse(url).map_err(|_| FailureReason::InvalidRequest)?;
    let host = match parsed.host() {
        Some(url::Host::Ipv4(ip)) => return allow(IpAddr::V4(ip), allowed),
        Some(url::Host::Ipv6(ip)) => return allow(IpAddr::V6(ip), allowed),
        Some(url::Host::Domain(domain)) => domain.to_string(),
        None => return Err(FailureReason::InvalidRequest),
    };
    let port = parsed.port_or_known_default().unwrap_or(443);

    let addrs = transport
        .resolve(&host, port)
        .await
        .map_err(|_| FailureReason::Network)?;
    if addrs.is_empty() {
        return Err(FailureReason::Network);
    }
    for ip in addrs {
        allow(ip, allowed)?;
    }
    Ok(())
}

fn allow(ip: IpAddr, allowed: &[IpAddr]) -> Result<(), FailureReason> {
    if allowed.contains(&ip) {
        Ok(())
    } else {
        Err(FailureReason::IpNotAllowed)
    }
}

/// Perform one attempt and capture it as an immutable [`DeliveryAttempt`].
pub async fn execute(
    transport: &dyn Transport,
    request: &OutboundRequest,
    allowed_ips: &[IpAddr],
    attempt_number: u32,
    limits: CaptureLimits,
) -> (DeliveryAttempt, DeliveryOutcome) {
    let timestamp = Utc::now();
    let started = Instant::now();

    // Host resolution for the allow-list counts against the same timeout.
    let checked_send = async {
        check_allowed_ips(transport, &request.url, allowed_ips).await?;
        match transport.send(request).await {
            Err(TransportError::Timeout) => Err(FailureReason::Timeout),
            Err(TransportError::Connect(_)) => Err(FailureReason::Network),
            Err(TransportError::Request(_)) => Err(FailureReason::Network),
            Ok(response) => Ok(response),
        }
    };
    let result = match tokio::time::timeout(request.timeout, checked_send).await {
        Err(_) => Err(FailureReason::Timeout),
        Ok(result) => result,
    };
    let latency_ms = started.elapsed().as_millis() as u64;

    let mut attempt = DeliveryAttempt {
        attempt_number,
        timestamp,
        outcome: AttemptOutcome::Failed,
        status_code: None,
        latency_ms,
        request_headers: capture_headers(&request.headers, limits, true),
        response_headers: BTreeMap::new(),
        response_body: None,
        error: None,
        failure: None,
    };

    let outcome = match result {
        Ok(response) => {
            attempt.status_code = Some(response.status);
            attempt.response_headers = capture_headers(&response.headers, limits, false);
            attempt.response_body = Some(truncate_string(&response.body, limits.max_body_bytes));
            if (200..300).contains(&response.status) {
                attempt.outcome = AttemptOutcome::Success;
                DeliveryOutcome::Delivered
            } else {
                DeliveryOutcome::Failed(FailureReason::from_status(response.status))
            }
        }
        Err(reason) => {
            if reason == FailureReason::Timeout {
                attempt.outcome = AttemptOutcome::Timeout;
            }
            DeliveryOutcome::Failed(reason)
        }
    };

    if let DeliveryOutcome::Failed(reason) = &outcome {
        attempt.error = Some(reason.to_string());
        attempt.failure = Some(reason.clone());
    }

    (attempt, outcome)
}

fn capture_headers(
    headers: &[(String, String)],
    limits: CaptureLimits,
    redact: bool,
) -> BTreeMap<String, String> {
    headers
        .iter()
        .take(limits.max_headers)
        .map(|(name, value)| {
            let value = if redact && is_sensitive(name) {
                REDACTED.to_string()
            } else {
                truncate_string(value, limits.max_body_bytes)
            };
            (name.clone(), value)
        })
        .collect()
}

fn is_sensitive(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    lower == "authorization"
        || lower == "cookie"
        || lower.contains("api-key")
        || lower.contains("apikey")
        || lower.contains("token")
        || lower.contains("secret")
}

/// Truncate to at most `max_len` bytes on a char boundary.
pub fn truncate_string(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        return s.to_string();
    }
    let keep = max_len.saturating_sub(3);
    let mut end = keep;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}

/// Production transport backed by `reqwest`.
#[cfg(feature = "http")]
pub struct HttpTransport {
    client: reqwest::Client,
    insecure_client: reqwest::Client,
}

#[cfg(feature = "http")]
impl HttpTransport {
    pub fn new(user_agent: &str) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().user_agent(user_agent).build()?;
        let insecure_client = reqwest::Client::builder()
            .user_agent(user_agent)
            .danger_accept_invalid_certs(true)
            .build()?;
        Ok(Self { client, insecure_client })
    }
}

#[cfg(feature = "http")]
#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: &OutboundRequest) -> Result<TransportResponse, TransportError> {
        let client = if request.verify_tls { &self.client } else { &self.insecure_client };
        let method = match request.method {
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Patch => reqwest::Method::PATCH,
        };

        let mut builder = client
            .request(method, &request.url)
            .timeout(request.timeout)
            .body(request.body.clone());
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = builder.send().await.map_err(classify_reqwest_error)?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();
        let body = response.text().await.unwrap_or_default();

        Ok(TransportResponse { status, headers, body })
    }
}

#[cfg(feature = "http")]
fn classify_reqwest_error(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout
    } else if err.is_connect() {
        TransportError::Connect(err.to_string())
    } else {
        TransportError::Request(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signing::verify_signature;
    use crate::types::SecurityOptions;
    use std::sync::Mutex;

    struct Fixed(Result<TransportResponse, TransportError>, Duration);

    #[async_trait]
    impl Transport for Fixed {
        async fn send(&self, _request: &OutboundRequest) -> Result<TransportResponse, TransportError> {
            tokio::time::sleep(self.1).await;
            self.0.clone()
        }
    }

    struct Recording(Mutex<Vec<OutboundRequest>>);

    #[async_trait]
    impl Transport for Recording {
        async fn send(&self, request: &OutboundRequest) -> Result<TransportResponse, TransportError> {
            self.0.lock().unwrap().push(request.clone());
            Ok(TransportResponse { status: 204, ..Default::default() })
        }
    }

    const LIMITS: CaptureLimits = CaptureLimits { max_body_bytes: 16, max_headers: 32 };

    fn subscription() -> Subscription {
        Subscription::new("wh_1", "ws_1", "http://127.0.0.1:9/hook", "s3cret")
            .with_events(["document.updated"])
            .with_header("X-Team", "docs")
            .with_security(SecurityOptions {
                auth: AuthScheme::Bearer { token: "tok".to_string() },
                ..Default::default()
            })
    }

    fn log() -> EventLog {
        EventLog::new(
            "document.updated",
            serde_json::json!({"a": 1}),
            r#"{"a":1}"#.to_string(),
            Utc::now(),
        )
    }

    fn header<'a>(request: &'a OutboundRequest, name: &str) -> Option<&'a str> {
        request
            .headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    #[test]
    fn test_build_request_signs_body() {
        let sub = subscription();
        let log = log();
        let request = build_request(&sub, &log, 2, "webhook-engine/test");

        assert_eq!(request.method, HttpMethod::Post);
        assert_eq!(request.body, log.body);
        assert_eq!(header(&request, "content-type"), Some("application/json"));
        assert_eq!(header(&request, "x-team"), Some("docs"));
        assert_eq!(header(&request, "authorization"), Some("Bearer tok"));
        assert_eq!(header(&request, EVENT_HEADER), Some("document.updated"));
        assert_eq!(header(&request, ATTEMPT_HEADER), Some("2"));
        let signature = header(&request, SIGNATURE_HEADER).unwrap();
        assert!(verify_signature(b"s3cret", log.body.as_bytes(), signature));
    }

    #[test]
    fn test_basic_auth_header() {
        let sub = subscription().with_security(SecurityOptions {
            auth: AuthScheme::Basic {
                username: "Aladdin".to_string(),
                password: "open sesame".to_string(),
            },
            ..Default::default()
        });
        let request = build_request(&sub, &log(), 1, "ua");
        assert_eq!(header(&request, "authorization"), Some("Basic QWxhZGRpbjpvcGVuIHNlc2FtZQ=="));

        let sub = subscription().with_security(SecurityOptions {
            auth: AuthScheme::ApiKey { header: "X-Api-Key".to_string(), key: "k1".to_string() },
            ..Default::default()
        });
        let request = build_request(&sub, &log(), 1, "ua");
        assert_eq!(header(&request, "x-api-key"), Some("k1"));
    }

    #[tokio::test]
    async fn test_execute_success_truncates_response() {
        let transport = Fixed(
            Ok(TransportResponse {
                status: 200,
                headers: vec![("x-request-id".to_string(), "r1".to_string())],
                body: "a response body longer than sixteen bytes".to_string(),
            }),
            Duration::ZERO,
        );
        let request = build_request(&subscription(), &log(), 1, "ua");
        let (attempt, outcome) = execute(&transport, &request, &[], 1, LIMITS).await;

        assert_eq!(outcome, DeliveryOutcome::Delivered);
        assert_eq!(attempt.outcome, AttemptOutcome::Success);
        assert_eq!(attempt.status_code, Some(200));
        assert!(attempt.response_body.as_ref().unwrap().len() <= 16);
        assert_eq!(attempt.request_headers.get("Authorization").map(String::as_str), Some(REDACTED));
        assert!(attempt.failure.is_none());
    }

    #[tokio::test]
    async fn test_execute_classifies_failures() {
        let request = build_request(&subscription(), &log(), 1, "ua");

        let server_error = Fixed(Ok(TransportResponse { status: 503, ..Default::default() }), Duration::ZERO);
        let (attempt, outcome) = execute(&server_error, &request, &[], 1, LIMITS).await;
        assert_eq!(outcome, DeliveryOutcome::Failed(FailureReason::ServerError(503)));
        assert_eq!(attempt.outcome, AttemptOutcome::Failed);

        let refused = Fixed(Err(TransportError::Connect("refused".to_string())), Duration::ZERO);
        let (attempt, outcome) = execute(&refused, &request, &[], 1, LIMITS).await;
        assert_eq!(outcome, DeliveryOutcome::Failed(FailureReason::Network));
        assert!(attempt.status_code.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_enforces_timeout() {
        let slow = Fixed(Ok(TransportResponse { status: 200, ..Default::default() }), Duration::from_secs(120));
        let request = build_request(
            &subscription().with_timeout(Duration::from_secs(1)),
            &log(),
            1,
            "ua",
        );
        let (attempt, outcome) = execute(&slow, &request, &[], 1, LIMITS).await;
        assert_eq!(outcome, DeliveryOutcome::Failed(FailureReason::Timeout));
        assert_eq!(attempt.outcome, AttemptOutcome::Timeout);
    }

    #[tokio::test]
    async fn test_ip_allow_list_blocks_without_sending() {
        let transport = Recording(Mutex::new(Vec::new()));
        let request = build_request(&subscription(), &log(), 1, "ua");

        let denied: Vec<IpAddr> = vec!["10.0.0.1".parse().unwrap()];
        let (attempt, outcome) = execute(&transport, &request, &denied, 1, LIMITS).await;
        assert_eq!(outcome, DeliveryOutcome::Failed(FailureReason::IpNotAllowed));
        assert_eq!(attempt.failure, Some(FailureReason::IpNotAllowed));
        assert!(transport.0.lock().unwrap().is_empty());

        let allowed: Vec<IpAddr> = vec!["127.0.0.1".parse().unwrap()];
        let (_, outcome) = execute(&transport, &request, &allowed, 1, LIMITS).await;
        assert_eq!(outcome, DeliveryOutcome::Delivered);
        assert_eq!(transport.0.lock().unwrap().len(), 1);
    }

    /// Resolver that never answers.
    struct StalledResolver(Recording);

    #[async_trait]
    impl Transport for StalledResolver {
        async fn send(&self, request: &OutboundRequest) -> Result<TransportResponse, TransportError> {
            self.0.send(request).await
        }

        async fn resolve(&self, _host: &str, _port: u16) -> std::io::Result<Vec<IpAddr>> {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_allow_list_resolution_counts_against_timeout() {
        let transport = StalledResolver(Recording(Mutex::new(Vec::new())));
        let sub = Subscription::new("wh_dns", "ws_1", "https://hooks.example.com/in", "s3cret")
            .with_events(["document.updated"])
            .with_timeout(Duration::from_secs(2));
        let request = build_request(&sub, &log(), 1, "ua");
        let allowed: Vec<IpAddr> = vec!["10.0.0.1".parse().unwrap()];

        let started = Instant::now();
        let (attempt, outcome) = execute(&transport, &request, &allowed, 1, LIMITS).await;
        assert_eq!(outcome, DeliveryOutcome::Failed(FailureReason::Timeout));
        assert_eq!(attempt.outcome, AttemptOutcome::Timeout);
        assert!(started.elapsed() < Duration::from_secs(3));
        assert!(transport.0 .0.lock().unwrap().is_empty());
    }

    #[test]
    fn test_truncate_on_char_boundary() {
        assert_eq!(truncate_string("short", 10), "short");
        let truncated = truncate_string("ééééééé", 8);
        assert!(truncated.len() <= 8);
        assert!(truncated.ends_with("..."));
    }
}
