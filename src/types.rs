use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Store-assigned identifier of a webhook subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WebhookConfigId(pub i64);

impl fmt::Display for WebhookConfigId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of an inbound event (the upstream message id).
///
/// This is a strongly-typed wrapper to avoid accidental mixing
/// of event IDs with chat or sender identifiers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId(pub String);

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Event field a trigger inspects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    /// Matches every event.
    All,
    #[serde(rename = "chat_jid")]
    ChatId,
    Sender,
    Keyword,
    MediaType,
}

impl TriggerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerType::All => "all",
            TriggerType::ChatId => "chat_jid",
            TriggerType::Sender => "sender",
            TriggerType::Keyword => "keyword",
            TriggerType::MediaType => "media_type",
        }
    }
}

impl fmt::Display for TriggerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TriggerType {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "all" => Ok(TriggerType::All),
            "chat_jid" => Ok(TriggerType::ChatId),
            "sender" => Ok(TriggerType::Sender),
            "keyword" => Ok(TriggerType::Keyword),
            "media_type" => Ok(TriggerType::MediaType),
            other => Err(ValidationError::UnknownTriggerType(other.to_string())),
        }
    }
}

/// Comparison applied between an event field and a trigger value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchType {
    /// Case-sensitive full equality.
    #[default]
    Exact,
    /// Case-insensitive substring.
    Contains,
    Regex,
}

impl MatchType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchType::Exact => "exact",
            MatchType::Contains => "contains",
            MatchType::Regex => "regex",
        }
    }
}

impl fmt::Display for MatchType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MatchType {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "exact" => Ok(MatchType::Exact),
            "contains" => Ok(MatchType::Contains),
            "regex" => Ok(MatchType::Regex),
            other => Err(ValidationError::UnknownMatchType(other.to_string())),
        }
    }
}

/// One matching condition owned by a webhook config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerRule {
    pub trigger_type: TriggerType,

    /// Comparison value. Ignored for [`TriggerType::All`].
    #[serde(default)]
    pub value: String,

    #[serde(default)]
    pub match_type: MatchType,

    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl TriggerRule {
    pub fn new(trigger_type: TriggerType, value: impl Into<String>, match_type: MatchType) -> Self {
        Self {
            trigger_type,
            value: value.into(),
            match_type,
            enabled: true,
        }
    }

    /// A trigger that fires on every event.
    pub fn all() -> Self {
        Self::new(TriggerType::All, "", MatchType::Exact)
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

fn default_true() -> bool {
    true
}

/// A stored webhook subscription.
///
/// Configs are immutable once loaded into a snapshot; changes go through a
/// full replace followed by a snapshot reload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookConfig {
    pub id: WebhookConfigId,
    pub name: String,
    pub url: String,

    /// Shared HMAC secret. Never serialized into delivery payloads.
    pub secret: Option<String>,

    pub enabled: bool,

    /// Ordered; the matcher evaluates them in this order.
    pub triggers: Vec<TriggerRule>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WebhookConfig {
    /// Secret to sign with, treating an empty string as absent.
    pub fn signing_secret(&self) -> Option<&str> {
        self.secret.as_deref().filter(|s| !s.is_empty())
    }
}

/// Intake shape for creating or replacing a webhook config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookConfigDraft {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub triggers: Vec<TriggerRule>,
}

impl WebhookConfigDraft {
    /// Create an enabled draft with no triggers and no secret.
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            secret: None,
            enabled: true,
            triggers: Vec::new(),
        }
    }

    /// Set a secret for HMAC signing.
    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = Some(secret.into());
        self
    }

    /// Append a trigger, preserving evaluation order.
    pub fn with_trigger(mut self, trigger: TriggerRule) -> Self {
        self.triggers.push(trigger);
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Materialize the draft with store-assigned identity and timestamps.
    pub fn into_config(
        self,
        id: WebhookConfigId,
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
    ) -> WebhookConfig {
        WebhookConfig {
            id,
            name: self.name,
            url: self.url,
            secret: self.secret,
            enabled: self.enabled,
            triggers: self.triggers,
            created_at,
            updated_at,
        }
    }
}

/// A decoded chat message handed over by the event source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundEvent {
    pub event_id: EventId,
    pub chat_id: String,
    pub sender_id: String,
    pub text_content: String,

    /// Empty for plain text messages.
    #[serde(default)]
    pub media_type: String,

    pub is_group: bool,
    pub timestamp: DateTime<Utc>,

    #[serde(default)]
    pub chat_name: Option<String>,
    #[serde(default)]
    pub sender_name: Option<String>,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub is_from_me: bool,
}

impl InboundEvent {
    /// Create a text event received now.
    pub fn new(
        event_id: impl Into<String>,
        chat_id: impl Into<String>,
        sender_id: impl Into<String>,
        text_content: impl Into<String>,
    ) -> Self {
        let chat_id = chat_id.into();
        let is_group = chat_id.ends_with("@g.us");
        Self {
            event_id: EventId(event_id.into()),
            chat_id,
            sender_id: sender_id.into(),
            text_content: text_content.into(),
            media_type: String::new(),
            is_group,
            timestamp: Utc::now(),
            chat_name: None,
            sender_name: None,
            filename: None,
            is_from_me: false,
        }
    }

    pub fn with_media(mut self, media_type: impl Into<String>, filename: Option<String>) -> Self {
        self.media_type = media_type.into();
        self.filename = filename;
        self
    }

    pub fn with_chat_name(mut self, chat_name: impl Into<String>) -> Self {
        self.chat_name = Some(chat_name.into());
        self
    }

    pub fn with_sender_name(mut self, sender_name: impl Into<String>) -> Self {
        self.sender_name = Some(sender_name.into());
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn from_me(mut self) -> Self {
        self.is_from_me = true;
        self
    }
}

/// Identity of one delivery timeline: a config notified about an event.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeliveryKey {
    pub config_id: WebhookConfigId,
    pub event_id: EventId,
}

impl DeliveryKey {
    pub fn new(config_id: WebhookConfigId, event_id: EventId) -> Self {
        Self { config_id, event_id }
    }
}

impl fmt::Display for DeliveryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.config_id, self.event_id)
    }
}

/// One logged HTTP attempt. Append-only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryAttempt {
    pub webhook_config_id: WebhookConfigId,
    pub event_id: EventId,
    pub chat_id: String,
    pub trigger_type: TriggerType,
    pub trigger_value: String,

    /// Exact body bytes sent on the wire, as text.
    pub payload: String,

    /// 1-based.
    pub attempt_number: u32,

    /// `None` when no HTTP response was received.
    pub response_status: Option<u16>,
    pub response_excerpt: String,

    /// Set only on the attempt that received a 2xx.
    pub delivered_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Durable state of a delivery that has not yet succeeded or been exhausted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingRetry {
    pub key: DeliveryKey,
    pub trigger: TriggerRule,
    pub event: InboundEvent,
    pub attempts_made: u32,
    pub next_attempt_at: DateTime<Utc>,
}

/// Dead-letter entry for a delivery that will not be attempted again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DlqEntry {
    pub key: DeliveryKey,
    pub trigger_type: TriggerType,

    /// Last body sent, or empty when no attempt was made.
    pub last_payload: String,
    pub failure: String,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Reject new work when the queue is full.
    #[default]
    DropNewest,
    /// Wait until queue capacity is available.
    Block,
}

impl FromStr for OverflowPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "reject" | "drop_newest" => Ok(OverflowPolicy::DropNewest),
            "block" => Ok(OverflowPolicy::Block),
            other => Err(other.to_string()),
        }
    }
}
