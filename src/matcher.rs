//! Trigger evaluation against an immutable config snapshot.
//!
//! A [`ConfigSnapshot`] is compiled once per reload: regexes are built and
//! `contains` needles lowercased up front, so matching an event is a
//! read-only pass with no locking and no pattern compilation.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use regex::Regex;
use tracing::{debug, warn};

use crate::types::{InboundEvent, MatchType, TriggerRule, TriggerType, WebhookConfig};
use crate::validation::compile_pattern;

/// A config whose first matching trigger fired for an event.
#[derive(Debug, Clone)]
pub struct TriggerMatch {
    pub config: Arc<WebhookConfig>,
    pub trigger: TriggerRule,
}

#[derive(Debug)]
struct CompiledTrigger {
    rule: TriggerRule,
    kind: Comparator,
}

#[derive(Debug)]
enum Comparator {
    Always,
    Exact(String),
    /// Needle already lowercased.
    Contains(String),
    Regex(Regex),
    /// Pattern failed to compile; never matches.
    Invalid,
}

#[derive(Debug)]
struct CompiledConfig {
    config: Arc<WebhookConfig>,
    triggers: Vec<CompiledTrigger>,
}

/// Immutable, pre-compiled view of the enabled webhook configs.
#[derive(Debug)]
pub struct ConfigSnapshot {
    configs: Vec<CompiledConfig>,
    loaded_at: DateTime<Utc>,
}

impl Default for ConfigSnapshot {
    fn default() -> Self {
        Self::empty()
    }
}

impl ConfigSnapshot {
    pub fn empty() -> Self {
        Self {
            configs: Vec::new(),
            loaded_at: Utc::now(),
        }
    }

    /// Compile configs in the given order. Disabled configs and disabled
    /// triggers are dropped here rather than checked on every event.
    pub fn compile(configs: Vec<WebhookConfig>) -> Self {
        let configs = configs
            .into_iter()
            .filter(|config| config.enabled)
            .map(|config| {
                let triggers = config
                    .triggers
                    .iter()
                    .filter(|rule| rule.enabled)
                    .map(|rule| compile_trigger(&config, rule))
                    .collect();
                CompiledConfig {
                    config: Arc::new(config),
                    triggers,
                }
            })
            .collect();

        Self {
            configs,
            loaded_at: Utc::now(),
        }
    }

    pub fn len(&self) -> usize {
        self.configs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.configs.is_empty()
    }

    pub fn loaded_at(&self) -> DateTime<Utc> {
        self.loaded_at
    }

    pub fn configs(&self) -> impl Iterator<Item = &Arc<WebhookConfig>> {
        self.configs.iter().map(|c| &c.config)
    }

    /// Evaluate one event. Each config contributes at most one match: the
    /// first of its triggers, in stored order, that fires.
    pub fn match_event(&self, event: &InboundEvent) -> Vec<TriggerMatch> {
        let fields = EventFields::extract(event);
        let mut matches = Vec::new();

        for compiled in &self.configs {
            let hit = compiled
                .triggers
                .iter()
                .find(|trigger| trigger_fires(trigger, &fields, compiled.config.id.0));

            if let Some(trigger) = hit {
                matches.push(TriggerMatch {
                    config: Arc::clone(&compiled.config),
                    trigger: trigger.rule.clone(),
                });
            }
        }

        debug!(
            event_id = %event.event_id,
            matched = matches.len(),
            configs = self.configs.len(),
            "evaluated triggers"
        );
        matches
    }
}

fn compile_trigger(config: &WebhookConfig, rule: &TriggerRule) -> CompiledTrigger {
    let kind = match (rule.trigger_type, rule.match_type) {
        (TriggerType::All, _) => Comparator::Always,
        (_, MatchType::Exact) => Comparator::Exact(rule.value.clone()),
        (_, MatchType::Contains) => Comparator::Contains(rule.value.to_lowercase()),
        (_, MatchType::Regex) => match compile_pattern(&rule.value) {
            Ok(re) => Comparator::Regex(re),
            Err(err) => {
                warn!(
                    config_id = %config.id,
                    trigger_type = %rule.trigger_type,
                    error = %err,
                    "skipping trigger with invalid pattern"
                );
                Comparator::Invalid
            }
        },
    };
    CompiledTrigger {
        rule: rule.clone(),
        kind,
    }
}

/// Comparison fields pulled out of an event once per evaluation.
struct EventFields<'a> {
    chat_id: Field<'a>,
    sender_id: Field<'a>,
    /// User part of the sender id (before `@`).
    sender_user: Field<'a>,
    text: Field<'a>,
    media_type: Field<'a>,
}

struct Field<'a> {
    raw: &'a str,
    lower: String,
}

impl<'a> Field<'a> {
    fn new(raw: &'a str) -> Self {
        Self {
            raw,
            lower: raw.to_lowercase(),
        }
    }
}

impl<'a> EventFields<'a> {
    fn extract(event: &'a InboundEvent) -> Self {
        let sender_user = event
            .sender_id
            .split_once('@')
            .map_or(event.sender_id.as_str(), |(user, _)| user);
        Self {
            chat_id: Field::new(&event.chat_id),
            sender_id: Field::new(&event.sender_id),
            sender_user: Field::new(sender_user),
            text: Field::new(&event.text_content),
            media_type: Field::new(&event.media_type),
        }
    }
}

fn trigger_fires(trigger: &CompiledTrigger, fields: &EventFields<'_>, config_id: i64) -> bool {
    match trigger.rule.trigger_type {
        TriggerType::All => true,
        TriggerType::ChatId => compare(&trigger.kind, &fields.chat_id, config_id),
        TriggerType::Sender => {
            compare(&trigger.kind, &fields.sender_id, config_id)
                || compare(&trigger.kind, &fields.sender_user, config_id)
        }
        TriggerType::Keyword => compare(&trigger.kind, &fields.text, config_id),
        TriggerType::MediaType => compare(&trigger.kind, &fields.media_type, config_id),
    }
}

fn compare(kind: &Comparator, field: &Field<'_>, config_id: i64) -> bool {
    match kind {
        Comparator::Always => true,
        Comparator::Exact(value) => field.raw == value,
        Comparator::Contains(needle) => field.lower.contains(needle.as_str()),
        Comparator::Regex(re) => re.is_match(field.raw),
        Comparator::Invalid => {
            debug!(config_id, "invalid trigger skipped");
            false
        }
    }
}
