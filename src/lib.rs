//! Trigger-matched webhook notifications for chat events.
//!
//! Each inbound event is evaluated against an immutable snapshot of
//! subscriber rules. Every matching subscriber receives one signed JSON
//! notification, delivered by a bounded worker pool with a fixed retry
//! schedule.
//!
//! ## Guarantees
//! - Bounded resource usage and explicit backpressure
//! - At most `max_attempts` HTTP attempts per (config, event)
//! - One delivery log row per attempt
//! - `X-Webhook-Signature: sha256=<hex>` over the exact bytes sent
//! - Destinations vetted against SSRF at intake and, optionally, per attempt
//!
//! ## Non-Guarantees
//! - Exactly-once delivery
//! - Ordering between deliveries
//! - Distributed coordination
//!
//! ```no_run
//! use std::sync::Arc;
//! use webhook_engine::{
//!     EngineSettings, InMemoryStore, InboundEvent, MatchType, TriggerRule, TriggerType,
//!     WebhookConfigDraft, WebhookEngine,
//! };
//!
//! # async fn run() -> Result<(), webhook_engine::EngineError> {
//! let engine = WebhookEngine::start(EngineSettings::from_env()?, Arc::new(InMemoryStore::new())).await?;
//! engine
//!     .create_config(
//!         WebhookConfigDraft::new("alerts", "https://hooks.example.com/in")
//!             .with_secret("s3cret")
//!             .with_trigger(TriggerRule::new(TriggerType::Keyword, "urgent", MatchType::Contains)),
//!     )
//!     .await?;
//!
//! let queued = engine
//!     .handle_event(&InboundEvent::new("msg-1", "123@g.us", "456@s.whatsapp.net", "urgent: call me"))
//!     .await;
//! assert_eq!(queued, 1);
//! engine.shutdown().await;
//! # Ok(())
//! # }
//! ```

mod dispatcher;
mod engine;
mod error;
mod guard;
mod matcher;
mod payload;
mod settings;
mod signing;
mod storage;
mod transport;
mod types;
mod validation;
mod worker;

#[cfg(feature = "sqlite")]
mod storage_sqlite;

pub use dispatcher::{Dispatcher, DispatcherConfig, DEFAULT_BACKOFF, DEFAULT_MAX_ATTEMPTS};
pub use engine::WebhookEngine;
pub use error::{
    DeliveryOutcome, DispatchError, EngineError, FailureReason, SettingsError, StoreError,
    ValidationError,
};
pub use guard::{blocked_reason, HostResolver, SystemResolver, UrlGuard, MAX_URL_LENGTH};
pub use matcher::{ConfigSnapshot, TriggerMatch};
pub use payload::{PayloadEnvelope, EVENT_MESSAGE_RECEIVED, EVENT_TEST};
pub use settings::EngineSettings;
pub use signing::{
    compute_signature, find_signature_header, sign, verify_signature, verify_webhook_request,
    VerificationError, SIGNATURE_HEADER, SIGNATURE_PREFIX,
};
pub use storage::{ConfigStore, InMemoryStore};
pub use transport::{HttpTransport, TransportResponse, WebhookTransport, DEFAULT_USER_AGENT};
pub use types::{
    DeliveryAttempt, DeliveryKey, DlqEntry, EventId, InboundEvent, MatchType, OverflowPolicy,
    PendingRetry, TriggerRule, TriggerType, WebhookConfig, WebhookConfigDraft, WebhookConfigId,
};
pub use validation::{ConfigValidator, MAX_NAME_LENGTH};
pub use worker::{DeliveryJob, DeliveryReport};

#[cfg(feature = "sqlite")]
pub use storage_sqlite::SqliteStore;
