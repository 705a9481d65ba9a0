use std::str::FromStr;
use std::time::Duration;

use crate::dispatcher::DispatcherConfig;
use crate::error::SettingsError;
use crate::transport::{DEFAULT_EXCERPT_LIMIT, DEFAULT_REQUEST_TIMEOUT, DEFAULT_USER_AGENT};
use crate::types::OverflowPolicy;

pub const ENV_WORKERS: &str = "WEBHOOK_WORKERS";
pub const ENV_QUEUE_CAPACITY: &str = "WEBHOOK_QUEUE_CAPACITY";
pub const ENV_OVERFLOW_POLICY: &str = "WEBHOOK_OVERFLOW_POLICY";
pub const ENV_MAX_ATTEMPTS: &str = "WEBHOOK_MAX_ATTEMPTS";
pub const ENV_REQUEST_TIMEOUT_SECS: &str = "WEBHOOK_REQUEST_TIMEOUT_SECS";
pub const ENV_USER_AGENT: &str = "WEBHOOK_USER_AGENT";
pub const ENV_ALLOW_PRIVATE_URLS: &str = "WEBHOOK_ALLOW_PRIVATE_URLS";
pub const ENV_REVALIDATE_ON_DELIVERY: &str = "WEBHOOK_REVALIDATE_ON_DELIVERY";
pub const ENV_DLQ_CAPACITY: &str = "WEBHOOK_DLQ_CAPACITY";

/// Runtime settings of a [`WebhookEngine`](crate::engine::WebhookEngine).
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub dispatcher: DispatcherConfig,
    pub request_timeout: Duration,
    pub user_agent: String,
    /// Response bytes kept per logged attempt.
    pub excerpt_limit: usize,
    /// Skip the SSRF guard at intake. Development only.
    pub allow_private_urls: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            dispatcher: DispatcherConfig::default(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            excerpt_limit: DEFAULT_EXCERPT_LIMIT,
            allow_private_urls: false,
        }
    }
}

impl EngineSettings {
    /// Defaults overridden by `WEBHOOK_*` environment variables.
    pub fn from_env() -> Result<Self, SettingsError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each key.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, SettingsError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut settings = Self::default();
        let dispatcher = &mut settings.dispatcher;

        if let Some(workers) = parse::<usize>(&lookup, ENV_WORKERS)? {
            dispatcher.worker_count = positive(ENV_WORKERS, workers)?;
        }
        if let Some(capacity) = parse::<usize>(&lookup, ENV_QUEUE_CAPACITY)? {
            dispatcher.queue_capacity = positive(ENV_QUEUE_CAPACITY, capacity)?;
        }
        if let Some(policy) = parse::<OverflowPolicy>(&lookup, ENV_OVERFLOW_POLICY)? {
            dispatcher.overflow_policy = policy;
        }
        if let Some(attempts) = parse::<u32>(&lookup, ENV_MAX_ATTEMPTS)? {
            dispatcher.max_attempts = positive(ENV_MAX_ATTEMPTS, attempts)?;
        }
        if let Some(flag) = parse_bool(&lookup, ENV_REVALIDATE_ON_DELIVERY)? {
            dispatcher.revalidate_on_delivery = flag;
        }
        if let Some(capacity) = parse::<usize>(&lookup, ENV_DLQ_CAPACITY)? {
            dispatcher.dlq_capacity = capacity;
        }

        if let Some(secs) = parse::<u64>(&lookup, ENV_REQUEST_TIMEOUT_SECS)? {
            settings.request_timeout = Duration::from_secs(positive(ENV_REQUEST_TIMEOUT_SECS, secs)?);
        }
        if let Some(agent) = lookup(ENV_USER_AGENT).filter(|v| !v.trim().is_empty()) {
            settings.user_agent = agent.trim().to_string();
        }
        if let Some(flag) = parse_bool(&lookup, ENV_ALLOW_PRIVATE_URLS)? {
            settings.allow_private_urls = flag;
        }

        Ok(settings)
    }
}

fn invalid(key: &str, value: impl Into<String>) -> SettingsError {
    SettingsError::InvalidValue {
        key: key.to_string(),
        value: value.into(),
    }
}

fn parse<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>, SettingsError> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| invalid(key, raw)),
    }
}

fn parse_bool(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<bool>, SettingsError> {
    let Some(raw) = lookup(key) else {
        return Ok(None);
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(Some(true)),
        "0" | "false" | "no" | "off" => Ok(Some(false)),
        _ => Err(invalid(key, raw)),
    }
}

fn positive<T: PartialEq + Default + ToString>(key: &str, value: T) -> Result<T, SettingsError> {
    if value == T::default() {
        return Err(invalid(key, value.to_string()));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_delivery_contract() {
        let settings = EngineSettings::from_lookup(lookup(&[])).unwrap();
        assert_eq!(settings.dispatcher.max_attempts, 5);
        assert_eq!(settings.dispatcher.queue_capacity, 1_000);
        assert_eq!(settings.request_timeout, Duration::from_secs(30));
        assert_eq!(settings.excerpt_limit, 1024);
        assert!(settings.dispatcher.revalidate_on_delivery);
        assert!(!settings.allow_private_urls);
    }

    #[test]
    fn environment_overrides_apply() {
        let settings = EngineSettings::from_lookup(lookup(&[
            (ENV_WORKERS, "3"),
            (ENV_QUEUE_CAPACITY, " 50 "),
            (ENV_OVERFLOW_POLICY, "block"),
            (ENV_REQUEST_TIMEOUT_SECS, "5"),
            (ENV_USER_AGENT, "bridge/2.0"),
            (ENV_ALLOW_PRIVATE_URLS, "true"),
            (ENV_REVALIDATE_ON_DELIVERY, "off"),
            (ENV_DLQ_CAPACITY, "0"),
        ]))
        .unwrap();

        assert_eq!(settings.dispatcher.worker_count, 3);
        assert_eq!(settings.dispatcher.queue_capacity, 50);
        assert_eq!(settings.dispatcher.overflow_policy, OverflowPolicy::Block);
        assert_eq!(settings.request_timeout, Duration::from_secs(5));
        assert_eq!(settings.user_agent, "bridge/2.0");
        assert!(settings.allow_private_urls);
        assert!(!settings.dispatcher.revalidate_on_delivery);
        assert_eq!(settings.dispatcher.dlq_capacity, 0);
    }

    #[test]
    fn bad_values_name_the_key() {
        let err = EngineSettings::from_lookup(lookup(&[(ENV_WORKERS, "many")])).unwrap_err();
        assert_eq!(
            err,
            SettingsError::InvalidValue {
                key: ENV_WORKERS.to_string(),
                value: "many".to_string()
            }
        );

        assert!(EngineSettings::from_lookup(lookup(&[(ENV_MAX_ATTEMPTS, "0")])).is_err());
        assert!(EngineSettings::from_lookup(lookup(&[(ENV_OVERFLOW_POLICY, "spill")])).is_err());
        assert!(EngineSettings::from_lookup(lookup(&[(ENV_ALLOW_PRIVATE_URLS, "maybe")])).is_err());
    }
}
