use thiserror::Error;

use crate::types::{TriggerType, WebhookConfigId};

/// Rejections raised synchronously at config intake, before anything is stored.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("webhook name is required")]
    MissingName,

    #[error("webhook name must be at most {max} characters (got {len})")]
    NameTooLong { len: usize, max: usize },

    #[error("webhook URL is required")]
    MissingUrl,

    #[error("webhook URL must be at most {max} characters (got {len})")]
    UrlTooLong { len: usize, max: usize },

    #[error("webhook URL is not valid: {0}")]
    InvalidUrl(String),

    #[error("webhook URL scheme must be http or https (got {0})")]
    UnsupportedScheme(String),

    /// SSRF guard refused the destination.
    #[error("webhook URL host {host} is not allowed: {reason}")]
    BlockedHost { host: String, reason: String },

    #[error("webhook URL host {host} could not be resolved: {reason}")]
    UnresolvableHost { host: String, reason: String },

    #[error("invalid trigger type: {0}")]
    UnknownTriggerType(String),

    #[error("invalid match type: {0}")]
    UnknownMatchType(String),

    #[error("trigger of type {0} requires a value")]
    MissingTriggerValue(TriggerType),

    #[error("invalid regex pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },
}

/// Errors returned when dispatching work fails *before* delivery begins.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    /// Delivery queue is full.
    /// Caller must retry or apply backoff.
    #[error("delivery queue at capacity")]
    Backpressure,

    #[error("dispatcher is shut down")]
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("webhook config not found: {0}")]
    NotFound(WebhookConfigId),

    #[error("store backend error: {0}")]
    Backend(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SettingsError {
    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },
}

/// Top-level error of the engine facade.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Settings(#[from] SettingsError),

    #[error("failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),

    /// A synchronous test delivery did not get a 2xx.
    #[error("test delivery failed: {0}")]
    TestDelivery(FailureReason),
}

/// Why a single delivery attempt did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FailureReason {
    #[error("request timed out")]
    Timeout,

    #[error("network error: {0}")]
    Network(String),

    #[error("endpoint returned HTTP {status}")]
    Status { status: u16, excerpt: String },

    /// Destination failed SSRF re-validation. Not retried.
    #[error("destination blocked: {0}")]
    Blocked(String),

    #[error("payload serialization failed: {0}")]
    Serialization(String),
}

impl FailureReason {
    /// Whether another attempt could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, FailureReason::Blocked(_) | FailureReason::Serialization(_))
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            FailureReason::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Outcome of one delivery attempt as reported back to the scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered { status: u16 },
    Failed(FailureReason),
    /// Aborted by shutdown before a response arrived; not logged.
    Cancelled,
}
