use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{error, info, warn};

use crate::error::{DeliveryOutcome, FailureReason, ValidationError};
use crate::guard::UrlGuard;
use crate::payload::PayloadEnvelope;
use crate::signing;
use crate::storage::ConfigStore;
use crate::transport::WebhookTransport;
use crate::types::{DeliveryAttempt, DeliveryKey, InboundEvent, TriggerRule, WebhookConfig};

#[cfg(feature = "metrics")]
pub(crate) fn metric_inc(name: &'static str) {
    metrics::increment_counter!(name);
}

#[cfg(not(feature = "metrics"))]
pub(crate) fn metric_inc(_name: &'static str) {}

/// A unit of work consumed by workers: one (config, event) timeline.
#[derive(Debug, Clone)]
pub struct DeliveryJob {
    pub config: WebhookConfig,
    pub trigger: TriggerRule,
    pub event: InboundEvent,

    /// Attempts already made.
    pub attempts_made: u32,

    /// When the engine accepted the event.
    pub received_at: Instant,
}

impl DeliveryJob {
    pub fn new(config: WebhookConfig, trigger: TriggerRule, event: InboundEvent) -> Self {
        Self {
            config,
            trigger,
            event,
            attempts_made: 0,
            received_at: Instant::now(),
        }
    }

    pub fn key(&self) -> DeliveryKey {
        DeliveryKey::new(self.config.id, self.event.event_id.clone())
    }
}

/// Result of a single delivery attempt.
#[derive(Debug, Clone)]
pub struct DeliveryReport {
    /// `attempts_made` already includes the reported attempt.
    pub job: DeliveryJob,
    pub outcome: DeliveryOutcome,
    /// Body sent on this attempt, empty if none was built.
    pub payload: String,
}

/// Shared, read-only context for all workers.
pub struct WorkerContext {
    pub transport: Arc<dyn WebhookTransport>,
    pub store: Arc<dyn ConfigStore>,

    /// Present when every attempt re-checks the destination.
    pub revalidate: Option<UrlGuard>,

    /// Reports from workers to the scheduler.
    pub report_tx: mpsc::UnboundedSender<DeliveryReport>,
}

/// Resolves once shutdown is requested. A dropped sender counts as shutdown.
pub(crate) async fn shutdown_signalled(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stopped| *stopped).await;
}

/// Main worker loop.
///
/// Each worker:
/// - Pulls jobs from the shared bounded queue
/// - Makes exactly one attempt and logs it
/// - Hands the outcome to the scheduler, which owns backoff
/// - Never sleeps through a backoff, so slots stay free for other deliveries
pub async fn worker_loop(
    rx: Arc<Mutex<mpsc::Receiver<DeliveryJob>>>,
    ctx: Arc<WorkerContext>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let job = {
            let mut guard = rx.lock().await;
            tokio::select! {
                job = guard.recv() => job,
                _ = shutdown_signalled(&mut shutdown) => None,
            }
        };

        let Some(job) = job else { break };

        let report = process_job(job, &ctx, &mut shutdown).await;
        if ctx.report_tx.send(report).is_err() {
            break;
        }
    }
}

/// Run one attempt of a job.
async fn process_job(
    mut job: DeliveryJob,
    ctx: &WorkerContext,
    shutdown: &mut watch::Receiver<bool>,
) -> DeliveryReport {
    let attempt = job.attempts_made + 1;

    if let Some(guard) = &ctx.revalidate {
        if let Err(err) = guard.validate(&job.config.url, false).await {
            warn!(
                config_id = %job.config.id,
                url = %job.config.url,
                error = %err,
                "delivery destination failed re-validation"
            );
            // A lookup failure is transient; only a blocked address is final.
            let reason = match err {
                ValidationError::UnresolvableHost { .. } => FailureReason::Network(err.to_string()),
                _ => FailureReason::Blocked(err.to_string()),
            };
            return fail_before_send(ctx, job, attempt, reason).await;
        }
    }

    let envelope = PayloadEnvelope::for_match(
        &job.config,
        &job.trigger,
        &job.event,
        attempt,
        job.received_at,
    );
    let body = match envelope.to_bytes() {
        Ok(body) => body,
        Err(err) => {
            error!(config_id = %job.config.id, error = %err, "failed to serialize webhook payload");
            let reason = FailureReason::Serialization(err.to_string());
            return fail_before_send(ctx, job, attempt, reason).await;
        }
    };

    // Sign the exact bytes handed to the transport.
    let signature = signing::sign(&body, job.config.signing_secret());
    let payload_text = String::from_utf8_lossy(&body).into_owned();

    let result = tokio::select! {
        result = ctx.transport.post(&job.config.url, body, signature.as_deref()) => Some(result),
        _ = shutdown_signalled(shutdown) => None,
    };
    let Some(result) = result else {
        info!(
            config_id = %job.config.id,
            event_id = %job.event.event_id,
            attempt,
            "delivery attempt cancelled by shutdown"
        );
        return DeliveryReport {
            job,
            outcome: DeliveryOutcome::Cancelled,
            payload: payload_text,
        };
    };

    job.attempts_made = attempt;
    let outcome = match result {
        Ok(response) if response.is_success() => {
            metric_inc("webhook.delivery.success");
            info!(
                config_id = %job.config.id,
                url = %job.config.url,
                status = response.status,
                attempt,
                "webhook delivered"
            );
            log_attempt(
                ctx,
                &job,
                attempt,
                payload_text.clone(),
                Some(response.status),
                response.body_excerpt,
                true,
            )
            .await;
            DeliveryOutcome::Delivered {
                status: response.status,
            }
        }
        Ok(response) => {
            metric_inc("webhook.delivery.failure");
            warn!(
                config_id = %job.config.id,
                url = %job.config.url,
                status = response.status,
                attempt,
                "webhook delivery failed"
            );
            let reason = FailureReason::Status {
                status: response.status,
                excerpt: response.body_excerpt.clone(),
            };
            log_attempt(
                ctx,
                &job,
                attempt,
                payload_text.clone(),
                Some(response.status),
                response.body_excerpt,
                false,
            )
            .await;
            DeliveryOutcome::Failed(reason)
        }
        Err(reason) => {
            metric_inc("webhook.delivery.failure");
            warn!(
                config_id = %job.config.id,
                url = %job.config.url,
                error = %reason,
                attempt,
                "webhook delivery failed"
            );
            log_attempt(ctx, &job, attempt, payload_text.clone(), None, reason.to_string(), false).await;
            DeliveryOutcome::Failed(reason)
        }
    };

    DeliveryReport {
        job,
        outcome,
        payload: payload_text,
    }
}

/// Log and report an attempt that ended before any request was sent.
async fn fail_before_send(
    ctx: &WorkerContext,
    mut job: DeliveryJob,
    attempt: u32,
    reason: FailureReason,
) -> DeliveryReport {
    job.attempts_made = attempt;
    log_attempt(ctx, &job, attempt, String::new(), None, reason.to_string(), false).await;
    DeliveryReport {
        job,
        outcome: DeliveryOutcome::Failed(reason),
        payload: String::new(),
    }
}

async fn log_attempt(
    ctx: &WorkerContext,
    job: &DeliveryJob,
    attempt: u32,
    payload: String,
    response_status: Option<u16>,
    response_excerpt: String,
    delivered: bool,
) {
    let now = Utc::now();
    let row = DeliveryAttempt {
        webhook_config_id: job.config.id,
        event_id: job.event.event_id.clone(),
        chat_id: job.event.chat_id.clone(),
        trigger_type: job.trigger.trigger_type,
        trigger_value: job.trigger.value.clone(),
        payload,
        attempt_number: attempt,
        response_status,
        response_excerpt,
        delivered_at: delivered.then_some(now),
        created_at: now,
    };

    if let Err(err) = ctx.store.append_delivery_log(&row).await {
        error!(config_id = %job.config.id, attempt, error = %err, "failed to store delivery log");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryStore;
    use crate::transport::TransportResponse;
    use crate::types::{WebhookConfigDraft, WebhookConfigId};
    use async_trait::async_trait;

    struct Unreachable;

    #[async_trait]
    impl WebhookTransport for Unreachable {
        async fn post(
            &self,
            _url: &str,
            _body: Vec<u8>,
            _signature: Option<&str>,
        ) -> Result<TransportResponse, FailureReason> {
            Err(FailureReason::Network("not used".into()))
        }
    }

    fn job() -> DeliveryJob {
        let now = Utc::now();
        let config = WebhookConfigDraft::new("a", "https://hooks.example.com/in")
            .into_config(WebhookConfigId(7), now, now);
        DeliveryJob::new(config, TriggerRule::all(), InboundEvent::new("m1", "c", "s", "hi"))
    }

    #[tokio::test]
    async fn serialization_failure_is_logged_and_final() {
        let store = Arc::new(InMemoryStore::new());
        let (report_tx, _report_rx) = mpsc::unbounded_channel();
        let ctx = WorkerContext {
            transport: Arc::new(Unreachable),
            store: store.clone(),
            revalidate: None,
            report_tx,
        };

        let reason = FailureReason::Serialization("key must be a string".into());
        let report = fail_before_send(&ctx, job(), 1, reason).await;

        assert_eq!(report.job.attempts_made, 1);
        assert!(matches!(
            report.outcome,
            DeliveryOutcome::Failed(FailureReason::Serialization(_))
        ));

        let logs = store.all_delivery_logs().await;
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].attempt_number, 1);
        assert_eq!(logs[0].response_status, None);
        assert!(logs[0].delivered_at.is_none());
        assert!(logs[0].response_excerpt.contains("serialization"));
    }
}
