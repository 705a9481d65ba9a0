//! JSON body delivered to subscribers.
//!
//! ```json
//! {
//!   "event_type": "message_received",
//!   "timestamp": "2024-01-15T10:30:00+00:00",
//!   "webhook_config": { "id": 3, "name": "support-alerts" },
//!   "trigger": { "type": "keyword", "value": "urgent", "match_type": "contains" },
//!   "message": { "id": "3EB0...", "chat_jid": "...", "content": "...", ... },
//!   "metadata": { "delivery_attempt": 1, "processing_time_ms": 4 }
//! }
//! ```
//!
//! The envelope is rebuilt for every attempt so `delivery_attempt` and
//! `processing_time_ms` are accurate, and the secret is never included.

use std::time::Instant;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{InboundEvent, TriggerRule, WebhookConfig};

pub const EVENT_MESSAGE_RECEIVED: &str = "message_received";
pub const EVENT_TEST: &str = "test";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadEnvelope {
    pub event_type: String,
    pub timestamp: String,
    pub webhook_config: ConfigInfo,
    pub trigger: TriggerInfo,
    pub message: MessageInfo,
    pub metadata: DeliveryMetadata,
}

/// Config identity only; the secret stays out of the payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigInfo {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerInfo {
    #[serde(rename = "type")]
    pub trigger_type: String,
    pub value: String,
    pub match_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageInfo {
    pub id: String,
    pub chat_jid: String,
    pub chat_name: String,
    pub sender: String,
    pub sender_name: String,
    pub content: String,
    pub timestamp: String,
    pub is_from_me: bool,
    pub media_type: String,
    pub filename: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryMetadata {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub group_info: Option<GroupInfo>,
    pub delivery_attempt: u32,
    pub processing_time_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupInfo {
    pub is_group: bool,
    pub group_name: String,
}

impl PayloadEnvelope {
    /// Envelope for a matched event at the given 1-based attempt.
    ///
    /// `received_at` is when the engine accepted the event; the elapsed
    /// time since then is reported as processing latency.
    pub fn for_match(
        config: &WebhookConfig,
        trigger: &TriggerRule,
        event: &InboundEvent,
        attempt: u32,
        received_at: Instant,
    ) -> Self {
        let chat_name = event.chat_name.clone().unwrap_or_default();
        let sender = event
            .sender_id
            .split_once('@')
            .map_or(event.sender_id.as_str(), |(user, _)| user)
            .to_string();
        let sender_name = event.sender_name.clone().unwrap_or_else(|| sender.clone());
        let timestamp = event.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true);

        let group_info = event.is_group.then(|| GroupInfo {
            is_group: true,
            group_name: chat_name.clone(),
        });

        Self {
            event_type: EVENT_MESSAGE_RECEIVED.to_string(),
            timestamp: timestamp.clone(),
            webhook_config: ConfigInfo {
                id: config.id.0,
                name: config.name.clone(),
            },
            trigger: TriggerInfo {
                trigger_type: trigger.trigger_type.as_str().to_string(),
                value: trigger.value.clone(),
                match_type: trigger.match_type.as_str().to_string(),
            },
            message: MessageInfo {
                id: event.event_id.0.clone(),
                chat_jid: event.chat_id.clone(),
                chat_name,
                sender,
                sender_name,
                content: event.text_content.clone(),
                timestamp,
                is_from_me: event.is_from_me,
                media_type: event.media_type.clone(),
                filename: event.filename.clone().unwrap_or_default(),
            },
            metadata: DeliveryMetadata {
                group_info,
                delivery_attempt: attempt,
                processing_time_ms: u64::try_from(received_at.elapsed().as_millis())
                    .unwrap_or(u64::MAX),
            },
        }
    }

    /// Synthetic envelope used to check a subscriber is reachable.
    pub fn test_event(config: &WebhookConfig) -> Self {
        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        Self {
            event_type: EVENT_TEST.to_string(),
            timestamp: now.clone(),
            webhook_config: ConfigInfo {
                id: config.id.0,
                name: config.name.clone(),
            },
            trigger: TriggerInfo {
                trigger_type: "all".to_string(),
                value: String::new(),
                match_type: "exact".to_string(),
            },
            message: MessageInfo {
                id: "test-message-id".to_string(),
                chat_jid: "test@s.whatsapp.net".to_string(),
                chat_name: "Test Chat".to_string(),
                sender: "test".to_string(),
                sender_name: "Test User".to_string(),
                content: "This is a test message".to_string(),
                timestamp: now,
                is_from_me: false,
                media_type: String::new(),
                filename: String::new(),
            },
            metadata: DeliveryMetadata {
                group_info: None,
                delivery_attempt: 1,
                processing_time_ms: 0,
            },
        }
    }

    /// Serialize to the bytes that will be signed and sent.
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MatchType, TriggerType, WebhookConfigDraft, WebhookConfigId};

    fn config() -> WebhookConfig {
        let now = Utc::now();
        WebhookConfigDraft::new("support-alerts", "https://hooks.example.com/in")
            .with_secret("top-secret-value")
            .into_config(WebhookConfigId(3), now, now)
    }

    #[test]
    fn envelope_carries_match_provenance_and_attempt() {
        let trigger = TriggerRule::new(TriggerType::Keyword, "urgent", MatchType::Contains);
        let event = InboundEvent::new("3EB0A1", "1203630@g.us", "4915112345678@s.whatsapp.net", "urgent!")
            .with_chat_name("Ops")
            .with_media("image", Some("photo.jpg".to_string()));

        let envelope = PayloadEnvelope::for_match(&config(), &trigger, &event, 3, Instant::now());
        let json: serde_json::Value = serde_json::from_slice(&envelope.to_bytes().unwrap()).unwrap();

        assert_eq!(json["event_type"], "message_received");
        assert_eq!(json["webhook_config"]["id"], 3);
        assert_eq!(json["webhook_config"]["name"], "support-alerts");
        assert_eq!(json["trigger"]["type"], "keyword");
        assert_eq!(json["trigger"]["match_type"], "contains");
        assert_eq!(json["message"]["sender"], "4915112345678");
        assert_eq!(json["message"]["sender_name"], "4915112345678");
        assert_eq!(json["message"]["filename"], "photo.jpg");
        assert_eq!(json["metadata"]["delivery_attempt"], 3);
        assert_eq!(json["metadata"]["group_info"]["group_name"], "Ops");
    }

    #[test]
    fn secret_never_serialized() {
        let event = InboundEvent::new("m", "c@s.whatsapp.net", "s@s.whatsapp.net", "hi");
        let bytes = PayloadEnvelope::for_match(&config(), &TriggerRule::all(), &event, 1, Instant::now())
            .to_bytes()
            .unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert!(!text.contains("top-secret-value"));
        assert!(!text.contains("group_info"));

        let test = String::from_utf8(PayloadEnvelope::test_event(&config()).to_bytes().unwrap()).unwrap();
        assert!(!test.contains("top-secret-value"));
        assert!(test.contains("\"event_type\":\"test\""));
    }
}
