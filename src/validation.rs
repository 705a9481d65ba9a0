use regex::Regex;

use crate::error::ValidationError;
use crate::guard::UrlGuard;
use crate::types::{MatchType, TriggerRule, TriggerType, WebhookConfigDraft};

pub const MAX_NAME_LENGTH: usize = 255;

/// Intake-time checks for webhook configs.
///
/// Everything that can make a config unusable is rejected here, so the
/// matcher and the delivery pipeline only ever see well-formed input.
#[derive(Clone)]
pub struct ConfigValidator {
    guard: UrlGuard,
    allow_private_urls: bool,
}

impl ConfigValidator {
    pub fn new(guard: UrlGuard, allow_private_urls: bool) -> Self {
        Self {
            guard,
            allow_private_urls,
        }
    }

    pub fn guard(&self) -> &UrlGuard {
        &self.guard
    }

    pub async fn validate(&self, draft: &WebhookConfigDraft) -> Result<(), ValidationError> {
        validate_name(&draft.name)?;
        self.guard.validate(&draft.url, self.allow_private_urls).await?;
        for trigger in &draft.triggers {
            validate_trigger(trigger)?;
        }
        Ok(())
    }
}

fn validate_name(name: &str) -> Result<(), ValidationError> {
    if name.trim().is_empty() {
        return Err(ValidationError::MissingName);
    }
    let len = name.chars().count();
    if len > MAX_NAME_LENGTH {
        return Err(ValidationError::NameTooLong {
            len,
            max: MAX_NAME_LENGTH,
        });
    }
    Ok(())
}

pub fn validate_trigger(trigger: &TriggerRule) -> Result<(), ValidationError> {
    if trigger.trigger_type == TriggerType::All {
        return Ok(());
    }
    if trigger.value.is_empty() {
        return Err(ValidationError::MissingTriggerValue(trigger.trigger_type));
    }
    if trigger.match_type == MatchType::Regex {
        compile_pattern(&trigger.value)?;
    }
    Ok(())
}

pub fn compile_pattern(pattern: &str) -> Result<Regex, ValidationError> {
    Regex::new(pattern).map_err(|err| ValidationError::InvalidPattern {
        pattern: pattern.to_string(),
        reason: err.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guard::tests::StaticResolver;

    fn validator() -> ConfigValidator {
        let guard = UrlGuard::with_resolver(StaticResolver::with(&[(
            "hooks.example.com",
            "93.184.216.34",
        )]));
        ConfigValidator::new(guard, false)
    }

    fn draft() -> WebhookConfigDraft {
        WebhookConfigDraft::new("alerts", "https://hooks.example.com/in")
    }

    #[tokio::test]
    async fn accepts_well_formed_config() {
        let draft = draft()
            .with_trigger(TriggerRule::all())
            .with_trigger(TriggerRule::new(TriggerType::Keyword, "urgent", MatchType::Contains))
            .with_trigger(TriggerRule::new(TriggerType::Sender, r"^\d+$", MatchType::Regex));
        assert_eq!(validator().validate(&draft).await, Ok(()));
    }

    #[tokio::test]
    async fn rejects_uncompilable_regex() {
        let draft = draft().with_trigger(TriggerRule::new(
            TriggerType::Keyword,
            "(unclosed",
            MatchType::Regex,
        ));
        assert!(matches!(
            validator().validate(&draft).await,
            Err(ValidationError::InvalidPattern { pattern, .. }) if pattern == "(unclosed"
        ));
    }

    #[tokio::test]
    async fn rejects_bad_names() {
        let v = validator();
        let mut d = draft();
        d.name = "  ".to_string();
        assert_eq!(v.validate(&d).await, Err(ValidationError::MissingName));

        d.name = "n".repeat(MAX_NAME_LENGTH + 1);
        assert!(matches!(v.validate(&d).await, Err(ValidationError::NameTooLong { .. })));

        d.name = "n".repeat(MAX_NAME_LENGTH);
        assert_eq!(v.validate(&d).await, Ok(()));
    }

    #[tokio::test]
    async fn requires_value_unless_all() {
        let d = draft().with_trigger(TriggerRule::new(TriggerType::ChatId, "", MatchType::Exact));
        assert_eq!(
            validator().validate(&d).await,
            Err(ValidationError::MissingTriggerValue(TriggerType::ChatId))
        );
    }

    #[tokio::test]
    async fn rejects_ssrf_destination() {
        let mut d = draft();
        d.url = "http://169.254.169.254/hook".to_string();
        assert!(matches!(
            validator().validate(&d).await,
            Err(ValidationError::BlockedHost { .. })
        ));
    }
}
