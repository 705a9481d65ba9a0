use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::dispatcher::Dispatcher;
use crate::error::{DispatchError, EngineError, FailureReason, StoreError};
use crate::guard::UrlGuard;
use crate::matcher::{ConfigSnapshot, TriggerMatch};
use crate::payload::PayloadEnvelope;
use crate::settings::EngineSettings;
use crate::signing;
use crate::storage::ConfigStore;
use crate::transport::{HttpTransport, WebhookTransport};
use crate::types::{
    DeliveryAttempt, DlqEntry, InboundEvent, WebhookConfig, WebhookConfigDraft, WebhookConfigId,
};
use crate::validation::ConfigValidator;
use crate::worker::DeliveryJob;

/// Entry point tying intake validation, matching and delivery together.
///
/// Matching reads an immutable [`ConfigSnapshot`] through a pointer that is
/// swapped wholesale on every reload; delivery runs on the bounded
/// [`Dispatcher`] and never blocks or fails the caller.
pub struct WebhookEngine {
    store: Arc<dyn ConfigStore>,
    snapshot: RwLock<Arc<ConfigSnapshot>>,
    validator: ConfigValidator,
    dispatcher: Dispatcher,
    transport: Arc<dyn WebhookTransport>,
    settings: EngineSettings,
}

impl WebhookEngine {
    /// Start with the reqwest transport and the system resolver.
    pub async fn start(
        settings: EngineSettings,
        store: Arc<dyn ConfigStore>,
    ) -> Result<Self, EngineError> {
        let transport = HttpTransport::new(
            settings.user_agent.clone(),
            settings.request_timeout,
            settings.excerpt_limit,
        )?;
        Self::with_components(settings, store, Arc::new(transport), UrlGuard::new()).await
    }

    /// Start with caller-supplied transport and guard.
    pub async fn with_components(
        settings: EngineSettings,
        store: Arc<dyn ConfigStore>,
        transport: Arc<dyn WebhookTransport>,
        guard: UrlGuard,
    ) -> Result<Self, EngineError> {
        let mut dispatcher_config = settings.dispatcher.clone();
        if settings.allow_private_urls {
            warn!("webhook URL guard override is ON: private and metadata destinations will be accepted");
            dispatcher_config.revalidate_on_delivery = false;
        }

        let dispatcher = Dispatcher::new(
            dispatcher_config,
            Arc::clone(&store),
            Arc::clone(&transport),
            guard.clone(),
        );

        let engine = Self {
            validator: ConfigValidator::new(guard, settings.allow_private_urls),
            snapshot: RwLock::new(Arc::new(ConfigSnapshot::empty())),
            store,
            dispatcher,
            transport,
            settings,
        };

        engine.reload().await?;
        engine.resume_pending().await?;

        info!(
            configs = engine.snapshot().len(),
            workers = engine.settings.dispatcher.worker_count,
            "webhook engine started"
        );
        Ok(engine)
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Current snapshot. Cheap: clones the pointer, not the configs.
    pub fn snapshot(&self) -> Arc<ConfigSnapshot> {
        self.snapshot.read().clone()
    }

    /// Rebuild the snapshot from the store and swap it in.
    pub async fn reload(&self) -> Result<(), EngineError> {
        let configs = self.store.list_enabled_configs().await?;
        let compiled = Arc::new(ConfigSnapshot::compile(configs));
        debug!(configs = compiled.len(), "config snapshot reloaded");
        *self.snapshot.write() = compiled;
        Ok(())
    }

    pub fn match_event(&self, event: &InboundEvent) -> Vec<TriggerMatch> {
        self.snapshot().match_event(event)
    }

    /// Match an event and queue one delivery per matching config.
    ///
    /// Returns how many deliveries were queued. Rejected deliveries are
    /// dead-lettered and logged; they never surface as errors here.
    pub async fn handle_event(&self, event: &InboundEvent) -> usize {
        let matches = self.match_event(event);
        if matches.is_empty() {
            debug!(event_id = %event.event_id, "no webhook triggers matched");
            return 0;
        }

        let mut queued = 0;
        for TriggerMatch { config, trigger } in matches {
            let trigger_type = trigger.trigger_type;
            let job = DeliveryJob::new(WebhookConfig::clone(&config), trigger, event.clone());
            let key = job.key();

            match self.dispatcher.dispatch(job).await {
                Ok(()) => queued += 1,
                Err(DispatchError::Backpressure) => {
                    warn!(
                        config_id = %config.id,
                        event_id = %event.event_id,
                        "delivery queue full; webhook delivery dropped"
                    );
                    self.dispatcher
                        .dead_letter(key, trigger_type, DispatchError::Backpressure.to_string())
                        .await;
                }
                Err(DispatchError::Shutdown) => {
                    warn!(event_id = %event.event_id, "engine shut down; event not delivered");
                    break;
                }
            }
        }
        queued
    }

    pub async fn create_config(&self, draft: WebhookConfigDraft) -> Result<WebhookConfig, EngineError> {
        self.validator.validate(&draft).await?;
        let config = self.store.insert_config(draft).await?;
        info!(config_id = %config.id, name = %config.name, "webhook config created");
        self.reload().await?;
        Ok(config)
    }

    /// Full replace, triggers included.
    pub async fn update_config(
        &self,
        id: WebhookConfigId,
        draft: WebhookConfigDraft,
    ) -> Result<WebhookConfig, EngineError> {
        self.validator.validate(&draft).await?;
        let config = self.store.replace_config(id, draft).await?;
        info!(config_id = %config.id, "webhook config updated");
        self.reload().await?;
        Ok(config)
    }

    pub async fn delete_config(&self, id: WebhookConfigId) -> Result<(), EngineError> {
        self.store.delete_config(id).await?;
        info!(config_id = %id, "webhook config deleted");
        self.reload().await
    }

    /// Send one signed `test` envelope and wait for the answer.
    ///
    /// Nothing is logged to the store or retried.
    pub async fn test_webhook(&self, id: WebhookConfigId) -> Result<u16, EngineError> {
        let config = self
            .store
            .get_config(id)
            .await?
            .ok_or(StoreError::NotFound(id))?;

        self.validator
            .guard()
            .validate(&config.url, self.settings.allow_private_urls)
            .await?;

        let body = PayloadEnvelope::test_event(&config)
            .to_bytes()
            .map_err(|err| EngineError::TestDelivery(FailureReason::Serialization(err.to_string())))?;
        let signature = signing::sign(&body, config.signing_secret());

        let response = self
            .transport
            .post(&config.url, body, signature.as_deref())
            .await
            .map_err(EngineError::TestDelivery)?;

        if !response.is_success() {
            return Err(EngineError::TestDelivery(FailureReason::Status {
                status: response.status,
                excerpt: response.body_excerpt,
            }));
        }
        info!(config_id = %id, status = response.status, "test webhook delivered");
        Ok(response.status)
    }

    /// Most recent attempts first.
    pub async fn delivery_logs(
        &self,
        id: WebhookConfigId,
        limit: usize,
    ) -> Result<Vec<DeliveryAttempt>, EngineError> {
        Ok(self.store.delivery_logs(id, limit).await?)
    }

    /// Dead letters still held in memory, oldest first.
    pub async fn dead_letters(&self) -> Vec<DlqEntry> {
        self.dispatcher.dlq_snapshot().await
    }

    pub fn is_running(&self) -> bool {
        self.dispatcher.is_running()
    }

    /// Abort in-flight attempts and stop all delivery tasks.
    pub async fn shutdown(&self) {
        info!("webhook engine shutting down");
        self.dispatcher.shutdown().await;
    }

    /// Re-schedule retries persisted by a previous run.
    async fn resume_pending(&self) -> Result<(), EngineError> {
        let pending = self.store.load_pending().await?;
        if pending.is_empty() {
            return Ok(());
        }

        let snapshot = self.snapshot();
        let now = Utc::now();
        let mut resumed = 0usize;

        for retry in pending {
            let config = snapshot.configs().find(|c| c.id == retry.key.config_id);
            let Some(config) = config else {
                debug!(key = %retry.key, "dropping pending delivery for removed or disabled config");
                self.store.clear_pending(&retry.key).await?;
                continue;
            };

            let delay = (retry.next_attempt_at - now).to_std().unwrap_or_default();
            let mut job = DeliveryJob::new(WebhookConfig::clone(config), retry.trigger, retry.event);
            job.attempts_made = retry.attempts_made;

            self.dispatcher.schedule_restored(job, delay)?;
            resumed += 1;
        }

        info!(resumed, "resumed pending webhook deliveries");
        Ok(())
    }
}
