use std::fmt;

use thiserror::Error;

use crate::types::{EventId, RetryCondition, SubscriptionId, WorkspaceId};

/// Errors returned by engine operations.
///
/// Delivery failures never surface here: they are recorded on the
/// event log and in subscription health instead.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Subscription failed validation at save time.
    #[error("invalid subscription configuration: {0}")]
    Configuration(String),

    #[error("subscription not registered: {0}")]
    SubscriptionNotFound(SubscriptionId),

    #[error("subscription already registered: {0}")]
    DuplicateSubscription(SubscriptionId),

    #[error("event log {event_id} not found for subscription {subscription_id}")]
    EventLogNotFound {
        subscription_id: SubscriptionId,
        event_id: EventId,
    },

    /// Event targeted a subscription owned by another workspace.
    #[error("subscription {0} does not belong to workspace {1}")]
    WorkspaceMismatch(SubscriptionId, WorkspaceId),

    /// Terminal event logs never transition again.
    #[error("event log {0} is already {1}")]
    InvalidTransition(EventId, &'static str),

    #[error("payload error: {0}")]
    Payload(#[from] serde_json::Error),

    #[cfg(feature = "http")]
    #[error("http client error: {0}")]
    Http(#[from] reqwest::Error),

    /// Engine has been shut down.
    #[error("engine is shut down")]
    Shutdown,
}

/// Why an event was turned away before any delivery job existed.
///
/// Rejections are not errors: no log entry is written and nothing is retried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    Inactive,
    NotSubscribed,
    FilteredOut(FilterMiss),
    RateLimited,
}

/// Which filter turned an event away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterMiss {
    Document,
    Folder,
    User,
    Tags,
    Condition,
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::Inactive =>
                write!(f, "subscription is not active"),
            Rejection::NotSubscribed =>
                write!(f, "event type not subscribed"),
            Rejection::FilteredOut(miss) =>
                write!(f, "filtered out by {:?} filter", miss),
            Rejection::RateLimited =>
                write!(f, "rate limit exceeded"),
        }
    }
}

/// Result of a single delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    Failed(FailureReason),
}

/// Reasons why an HTTP delivery attempt failed.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind", content = "status", rename_all = "snake_case")]
pub enum FailureReason {
    Timeout,
    Network,
    TooManyRequests,
    ServerError(u16),
    ClientError(u16),
    /// Target resolved to an address outside the allow-list.
    IpNotAllowed,
    /// Request could not be built or sent for a local reason.
    InvalidRequest,
}

impl FailureReason {
    /// Classify a non-2xx status code.
    pub fn from_status(status: u16) -> Self {
        match status {
            429 => FailureReason::TooManyRequests,
            500..=599 => FailureReason::ServerError(status),
            _ => FailureReason::ClientError(status),
        }
    }

    /// Failures that no amount of retrying can fix.
    pub fn is_permanent(&self) -> bool {
        matches!(self, FailureReason::IpNotAllowed | FailureReason::InvalidRequest)
    }

    pub fn retry_condition(&self) -> Option<RetryCondition> {
        match self {
            FailureReason::Timeout => Some(RetryCondition::Timeout),
            FailureReason::Network => Some(RetryCondition::NetworkError),
            FailureReason::TooManyRequests => Some(RetryCondition::TooManyRequests),
            FailureReason::ServerError(_) => Some(RetryCondition::ServerError),
            FailureReason::ClientError(_)
            | FailureReason::IpNotAllowed
            | FailureReason::InvalidRequest => None,
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Timeout =>
                write!(f, "request timed out"),
            FailureReason::Network =>
                write!(f, "network error"),
            FailureReason::TooManyRequests =>
                write!(f, "remote endpoint is rate limiting (429)"),
            FailureReason::ServerError(status) =>
                write!(f, "remote endpoint returned {}", status),
            FailureReason::ClientError(status) =>
                write!(f, "remote endpoint rejected request with {}", status),
            FailureReason::IpNotAllowed =>
                write!(f, "target address not in allow-list"),
            FailureReason::InvalidRequest =>
                write!(f, "request could not be sent"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert_eq!(FailureReason::from_status(429), FailureReason::TooManyRequests);
        assert_eq!(FailureReason::from_status(503), FailureReason::ServerError(503));
        assert_eq!(FailureReason::from_status(404), FailureReason::ClientError(404));
        assert_eq!(FailureReason::from_status(302), FailureReason::ClientError(302));
    }

    #[test]
    fn test_rate_limit_rejection_message() {
        assert_eq!(Rejection::RateLimited.to_string(), "rate limit exceeded");
    }
}
