//! An in-process webhook event-delivery engine.
//!
//! Domain events are offered to every subscription of their workspace.
//! Each subscription filters and transforms the event, applies its
//! fixed-window rate limit, and gets a signed HTTP delivery with
//! exponential-backoff retries. Consecutive failures trip a per-subscription
//! circuit breaker that disables it until an operator re-enables it.
//!
//! ## Guarantees
//! - Bounded worker pool and ready queue
//! - Per-subscription isolation: one slow subscriber never stalls another
//! - Every attempt is recorded before the event log changes state
//! - At-least-once delivery while the engine runs
//!
//! ## Non-Guarantees
//! - Exactly-once delivery
//! - Ordering between events of one subscription
//! - Distributed coordination between engine instances
//!
//! Durable history is pluggable through [`Storage`]; the default keeps
//! everything in memory.

mod dispatch;
mod engine;
mod error;
mod filter;
mod health;
mod log_store;
mod rate_limit;
mod registry;
mod scheduler;
mod signing;
mod storage;
mod types;
mod worker;

#[cfg(feature = "redis")]
mod storage_redis;

#[cfg(feature = "postgres")]
mod storage_postgres;

pub use dispatch::{
    OutboundRequest,
    Transport,
    TransportError,
    TransportResponse,
    ATTEMPT_HEADER,
    EVENT_HEADER,
    EVENT_ID_HEADER,
};
#[cfg(feature = "http")]
pub use dispatch::HttpTransport;
pub use engine::{
    Admission,
    EngineConfig,
    PublishReport,
    WebhookEngine,
    WorkspaceStatistics,
    DEFAULT_LOG_RETENTION_DAYS,
    TEST_EVENT_TYPE,
};
pub use error::{DeliveryOutcome, EngineError, FailureReason, FilterMiss, Rejection};
pub use filter::{check_eligibility, encode_body, transform_payload};
pub use health::{Health, HealthThresholds, Statistics, SubscriptionHealth, SubscriptionStatus};
pub use log_store::{AttemptOutcome, DeliveryAttempt, EventLog, EventLogStatus, WindowStatistics};
pub use rate_limit::RateLimiterStats;
pub use scheduler::{apply_attempt, cancel, Transition};
pub use signing::{
    compute_signature,
    verify_signature,
    verify_webhook_request,
    VerificationError,
    SIGNATURE_HEADER,
};
pub use storage::{InMemoryStorage, Storage};
pub use types::{
    AuthScheme,
    ContentType,
    DomainEvent,
    EntityRefs,
    EventId,
    Filters,
    HttpMethod,
    RateLimitPolicy,
    RetryCondition,
    RetryPolicy,
    SecurityOptions,
    Subscription,
    SubscriptionId,
    Transform,
    WorkspaceId,
};

#[cfg(feature = "redis")]
pub use storage_redis::RedisStorage;

#[cfg(feature = "postgres")]
pub use storage_postgres::PostgresStorage;
