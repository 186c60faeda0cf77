use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::net::IpAddr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, FailureReason};

/// Unique identifier for a subscription.
///
/// This is a strongly-typed wrapper to avoid accidental mixing
/// of subscription IDs with other string identifiers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriptionId(pub String);

/// Identifier of the workspace owning a subscription or raising an event.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkspaceId(pub String);

/// Identifier generated for every accepted (subscription, event) pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId(pub String);

impl EventId {
    /// Generate a fresh 128-bit random id, hex encoded.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }
}

macro_rules! display_id {
    ($($ty:ty),*) => {
        $(
            impl fmt::Display for $ty {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    f.write_str(&self.0)
                }
            }

            impl From<&str> for $ty {
                fn from(value: &str) -> Self {
                    Self(value.to_string())
                }
            }
        )*
    };
}

display_id!(SubscriptionId, WorkspaceId, EventId);

/// Entities a domain event refers to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityRefs {
    pub document_id: Option<String>,
    pub folder_id: Option<String>,
    pub user_id: Option<String>,
}

/// A domain event raised by the CRUD layer.
///
/// The engine never decides which business event happened; it only
/// routes and delivers what collaborators publish.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainEvent {
    pub event_type: String,
    pub workspace_id: WorkspaceId,
    #[serde(default)]
    pub entity_refs: EntityRefs,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub data: serde_json::Value,
    pub occurred_at: DateTime<Utc>,
}

impl DomainEvent {
    pub fn new(event_type: impl Into<String>, workspace_id: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            workspace_id: WorkspaceId(workspace_id.into()),
            entity_refs: EntityRefs::default(),
            tags: Vec::new(),
            data: serde_json::Value::Object(serde_json::Map::new()),
            occurred_at: Utc::now(),
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }

    pub fn with_document(mut self, document_id: impl Into<String>) -> Self {
        self.entity_refs.document_id = Some(document_id.into());
        self
    }

    pub fn with_folder(mut self, folder_id: impl Into<String>) -> Self {
        self.entity_refs.folder_id = Some(folder_id.into());
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.entity_refs.user_id = Some(user_id.into());
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    Post,
    Put,
    Patch,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContentType {
    #[default]
    #[serde(rename = "application/json")]
    Json,
    #[serde(rename = "application/x-www-form-urlencoded")]
    FormUrlEncoded,
}

impl ContentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentType::Json => "application/json",
            ContentType::FormUrlEncoded => "application/x-www-form-urlencoded",
        }
    }
}

/// Failure classes a retry policy may opt into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryCondition {
    Timeout,
    NetworkError,
    /// Any 5xx response.
    ServerError,
    /// HTTP 429.
    TooManyRequests,
}

/// Retry behaviour for failed deliveries.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub enabled: bool,

    /// Total attempts, including the first one.
    pub max_attempts: u32,

    /// Delay before the first retry.
    pub base_delay_ms: u64,

    pub backoff_multiplier: f64,

    /// Optional ceiling applied after the exponential step.
    pub max_delay_ms: Option<u64>,

    /// Failure classes eligible for a retry. Empty means every
    /// transient failure is retried.
    pub retry_on: Vec<RetryCondition>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 3,
            base_delay_ms: 1_000,
            backoff_multiplier: 2.0,
            max_delay_ms: None,
            retry_on: Vec::new(),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            enabled: false,
            max_attempts: 1,
            ..Default::default()
        }
    }

    pub fn exponential(max_attempts: u32, base_delay_ms: u64, backoff_multiplier: f64) -> Self {
        Self {
            max_attempts,
            base_delay_ms,
            backoff_multiplier,
            ..Default::default()
        }
    }

    /// Delay to wait after the `attempts_made`-th failed attempt:
    /// `base × multiplier^(attempts_made - 1)`.
    pub fn delay_after(&self, attempts_made: u32) -> Duration {
        let exponent = attempts_made.saturating_sub(1) as i32;
        let mut delay_ms = self.base_delay_ms as f64 * self.backoff_multiplier.powi(exponent);
        if let Some(max) = self.max_delay_ms {
            delay_ms = delay_ms.min(max as f64);
        }
        if !delay_ms.is_finite() || delay_ms < 0.0 {
            delay_ms = self.max_delay_ms.unwrap_or(u64::MAX) as f64;
        }
        Duration::from_millis(delay_ms.min(u64::MAX as f64) as u64)
    }

    /// Whether a failure after `attempts_made` attempts earns another try.
    pub fn should_retry(&self, attempts_made: u32, reason: &FailureReason) -> bool {
        if !self.enabled || attempts_made >= self.max_attempts || reason.is_permanent() {
            return false;
        }
        if self.retry_on.is_empty() {
            return true;
        }
        reason
            .retry_condition()
            .map(|condition| self.retry_on.contains(&condition))
            .unwrap_or(false)
    }
}

/// Eligibility filters attached to a subscription.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Filters {
    pub document_ids: HashSet<String>,
    pub folder_ids: HashSet<String>,
    pub user_ids: HashSet<String>,
    pub tags: Vec<String>,

    /// Dotted path into the event data mapped to the value it must equal.
    pub conditions: BTreeMap<String, serde_json::Value>,
}

/// Payload rewriting applied before signing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Transform {
    pub enabled: bool,
    pub exclude_fields: Vec<String>,
    pub custom_fields: serde_json::Map<String, serde_json::Value>,
    pub include_metadata: bool,
}

impl Default for Transform {
    fn default() -> Self {
        Self {
            enabled: false,
            exclude_fields: Vec::new(),
            custom_fields: serde_json::Map::new(),
            include_metadata: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitPolicy {
    pub enabled: bool,
    pub max_requests: u32,
    pub window_secs: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthScheme {
    #[default]
    None,
    Basic { username: String, password: String },
    Bearer { token: String },
    ApiKey { header: String, key: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityOptions {
    pub verify_tls: bool,

    /// When non-empty, every address the target host resolves to must be listed.
    pub allowed_ips: Vec<IpAddr>,

    pub auth: AuthScheme,
}

impl Default for SecurityOptions {
    fn default() -> Self {
        Self {
            verify_tls: true,
            allowed_ips: Vec::new(),
            auth: AuthScheme::None,
        }
    }
}

/// A registered outbound endpoint plus its delivery policy.
///
/// A `Subscription` is a configuration value: the engine never mutates it.
/// Health, statistics, the rate-limit window and the log ring live in
/// engine-owned state next to it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub workspace_id: WorkspaceId,
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub method: HttpMethod,
    pub events: BTreeSet<String>,
    pub secret: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub content_type: ContentType,
    pub timeout_ms: u64,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub filters: Filters,
    #[serde(default)]
    pub transform: Transform,
    #[serde(default)]
    pub rate_limit: RateLimitPolicy,
    #[serde(default)]
    pub security: SecurityOptions,

    /// Whether the subscription starts out active.
    pub active: bool,

    /// Overrides the engine-wide auto-disable threshold.
    #[serde(default)]
    pub auto_disable_threshold: Option<u32>,
}

pub const MIN_TIMEOUT_MS: u64 = 1_000;
pub const MAX_TIMEOUT_MS: u64 = 60_000;

impl Subscription {
    /// Create a subscription with default delivery settings.
    ///
    /// Defaults:
    /// - method: POST, content type: application/json
    /// - timeout: 30 seconds
    /// - retry: 3 attempts, 1s base delay, multiplier 2
    pub fn new(
        id: impl Into<String>,
        workspace_id: impl Into<String>,
        url: impl Into<String>,
        secret: impl Into<String>,
    ) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id: SubscriptionId(id),
            workspace_id: WorkspaceId(workspace_id.into()),
            url: url.into(),
            method: HttpMethod::Post,
            events: BTreeSet::new(),
            secret: secret.into(),
            headers: BTreeMap::new(),
            content_type: ContentType::Json,
            timeout_ms: 30_000,
            retry: RetryPolicy::default(),
            filters: Filters::default(),
            transform: Transform::default(),
            rate_limit: RateLimitPolicy::default(),
            security: SecurityOptions::default(),
            active: true,
            auto_disable_threshold: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_events<I, S>(mut self, events: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.events = events.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_method(mut self, method: HttpMethod) -> Self {
        self.method = method;
        self
    }

    pub fn with_content_type(mut self, content_type: ContentType) -> Self {
        self.content_type = content_type;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_filters(mut self, filters: Filters) -> Self {
        self.filters = filters;
        self
    }

    pub fn with_transform(mut self, transform: Transform) -> Self {
        self.transform = transform;
        self
    }

    /// Allow at most `max_requests` accepted events per `window_secs`.
    pub fn with_rate_limit(mut self, max_requests: u32, window_secs: u64) -> Self {
        self.rate_limit = RateLimitPolicy {
            enabled: true,
            max_requests,
            window_secs,
        };
        self
    }

    pub fn with_security(mut self, security: SecurityOptions) -> Self {
        self.security = security;
        self
    }

    pub fn with_auto_disable_threshold(mut self, threshold: u32) -> Self {
        self.auto_disable_threshold = Some(threshold);
        self
    }

    pub fn inactive(mut self) -> Self {
        self.active = false;
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Reject configurations the engine cannot deliver with.
    pub fn validate(&self) -> Result<(), EngineError> {
        let url = url::Url::parse(&self.url)
            .map_err(|e| EngineError::Configuration(format!("invalid url {:?}: {}", self.url, e)))?;
        if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
            return Err(EngineError::Configuration(
                "url must be an absolute http or https url".to_string(),
            ));
        }
        if self.secret.is_empty() {
            return Err(EngineError::Configuration("secret must not be empty".to_string()));
        }
        if self.events.is_empty() {
            return Err(EngineError::Configuration(
                "at least one event type is required".to_string(),
            ));
        }
        if !(MIN_TIMEOUT_MS..=MAX_TIMEOUT_MS).contains(&self.timeout_ms) {
            return Err(EngineError::Configuration(format!(
                "timeout must be between {}ms and {}ms",
                MIN_TIMEOUT_MS, MAX_TIMEOUT_MS
            )));
        }
        if !(1..=10).contains(&self.retry.max_attempts) {
            return Err(EngineError::Configuration(
                "retry max_attempts must be between 1 and 10".to_string(),
            ));
        }
        if self.retry.base_delay_ms < 100 {
            return Err(EngineError::Configuration(
                "retry base_delay_ms must be at least 100".to_string(),
            ));
        }
        if !(self.retry.backoff_multiplier >= 1.0) {
            return Err(EngineError::Configuration(
                "retry backoff_multiplier must be at least 1".to_string(),
            ));
        }
        if self.rate_limit.enabled
            && (self.rate_limit.max_requests == 0 || self.rate_limit.window_secs == 0)
        {
            return Err(EngineError::Configuration(
                "rate limit needs positive max_requests and window_secs".to_string(),
            ));
        }
        if self.auto_disable_threshold == Some(0) {
            return Err(EngineError::Configuration(
                "auto_disable_threshold must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
