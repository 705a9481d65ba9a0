use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;

use crate::error::StoreError;
use crate::types::{
    DeliveryAttempt, DeliveryKey, DlqEntry, PendingRetry, WebhookConfig, WebhookConfigDraft,
    WebhookConfigId,
};

/// Durable home of webhook configs, delivery logs and retry state.
///
/// The engine validates drafts before calling the write methods; stores
/// persist what they are given.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Enabled configs with their triggers, in stable (id) order.
    async fn list_enabled_configs(&self) -> Result<Vec<WebhookConfig>, StoreError>;
    async fn list_configs(&self) -> Result<Vec<WebhookConfig>, StoreError>;
    async fn get_config(&self, id: WebhookConfigId) -> Result<Option<WebhookConfig>, StoreError>;
    async fn insert_config(&self, draft: WebhookConfigDraft) -> Result<WebhookConfig, StoreError>;

    /// Full replace, triggers included.
    async fn replace_config(
        &self,
        id: WebhookConfigId,
        draft: WebhookConfigDraft,
    ) -> Result<WebhookConfig, StoreError>;

    /// Deletes the config and its triggers.
    async fn delete_config(&self, id: WebhookConfigId) -> Result<(), StoreError>;

    async fn append_delivery_log(&self, attempt: &DeliveryAttempt) -> Result<(), StoreError>;

    /// Most recent first.
    async fn delivery_logs(
        &self,
        id: WebhookConfigId,
        limit: usize,
    ) -> Result<Vec<DeliveryAttempt>, StoreError>;

    /// Insert or overwrite the retry state for `retry.key`.
    async fn record_pending(&self, retry: &PendingRetry) -> Result<(), StoreError>;
    async fn clear_pending(&self, key: &DeliveryKey) -> Result<(), StoreError>;
    async fn load_pending(&self) -> Result<Vec<PendingRetry>, StoreError>;

    async fn record_dead_letter(&self, entry: &DlqEntry) -> Result<(), StoreError>;
}

/// In-memory store for tests and lightweight deployments.
#[derive(Default)]
pub struct InMemoryStore {
    configs: Mutex<ConfigTable>,
    logs: Mutex<Vec<DeliveryAttempt>>,
    pending: Mutex<HashMap<DeliveryKey, PendingRetry>>,
    dlq: Mutex<Vec<DlqEntry>>,
}

#[derive(Default)]
struct ConfigTable {
    next_id: i64,
    rows: Vec<WebhookConfig>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every logged attempt, in write order.
    pub async fn all_delivery_logs(&self) -> Vec<DeliveryAttempt> {
        self.logs.lock().await.clone()
    }

    pub async fn dead_letters(&self) -> Vec<DlqEntry> {
        self.dlq.lock().await.clone()
    }
}

#[async_trait]
impl ConfigStore for InMemoryStore {
    async fn list_enabled_configs(&self) -> Result<Vec<WebhookConfig>, StoreError> {
        let table = self.configs.lock().await;
        Ok(table.rows.iter().filter(|c| c.enabled).cloned().collect())
    }

    async fn list_configs(&self) -> Result<Vec<WebhookConfig>, StoreError> {
        Ok(self.configs.lock().await.rows.clone())
    }

    async fn get_config(&self, id: WebhookConfigId) -> Result<Option<WebhookConfig>, StoreError> {
        let table = self.configs.lock().await;
        Ok(table.rows.iter().find(|c| c.id == id).cloned())
    }

    async fn insert_config(&self, draft: WebhookConfigDraft) -> Result<WebhookConfig, StoreError> {
        let mut table = self.configs.lock().await;
        table.next_id += 1;
        let now = Utc::now();
        let config = draft.into_config(WebhookConfigId(table.next_id), now, now);
        table.rows.push(config.clone());
        Ok(config)
    }

    async fn replace_config(
        &self,
        id: WebhookConfigId,
        draft: WebhookConfigDraft,
    ) -> Result<WebhookConfig, StoreError> {
        let mut table = self.configs.lock().await;
        let row = table
            .rows
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or(StoreError::NotFound(id))?;
        *row = draft.into_config(id, row.created_at, Utc::now());
        Ok(row.clone())
    }

    async fn delete_config(&self, id: WebhookConfigId) -> Result<(), StoreError> {
        let mut table = self.configs.lock().await;
        let before = table.rows.len();
        table.rows.retain(|c| c.id != id);
        if table.rows.len() == before {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    async fn append_delivery_log(&self, attempt: &DeliveryAttempt) -> Result<(), StoreError> {
        self.logs.lock().await.push(attempt.clone());
        Ok(())
    }

    async fn delivery_logs(
        &self,
        id: WebhookConfigId,
        limit: usize,
    ) -> Result<Vec<DeliveryAttempt>, StoreError> {
        let logs = self.logs.lock().await;
        Ok(logs
            .iter()
            .rev()
            .filter(|a| a.webhook_config_id == id)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn record_pending(&self, retry: &PendingRetry) -> Result<(), StoreError> {
        self.pending
            .lock()
            .await
            .insert(retry.key.clone(), retry.clone());
        Ok(())
    }

    async fn clear_pending(&self, key: &DeliveryKey) -> Result<(), StoreError> {
        self.pending.lock().await.remove(key);
        Ok(())
    }

    async fn load_pending(&self) -> Result<Vec<PendingRetry>, StoreError> {
        let mut pending: Vec<_> = self.pending.lock().await.values().cloned().collect();
        pending.sort_by_key(|p| p.next_attempt_at);
        Ok(pending)
    }

    async fn record_dead_letter(&self, entry: &DlqEntry) -> Result<(), StoreError> {
        self.dlq.lock().await.push(entry.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EventId, InboundEvent, TriggerRule};

    #[tokio::test]
    async fn insert_assigns_ids_and_lists_enabled() {
        let store = InMemoryStore::new();
        let a = store
            .insert_config(WebhookConfigDraft::new("a", "https://a.example.com"))
            .await
            .unwrap();
        let b = store
            .insert_config(WebhookConfigDraft::new("b", "https://b.example.com").disabled())
            .await
            .unwrap();
        assert_ne!(a.id, b.id);

        let enabled = store.list_enabled_configs().await.unwrap();
        assert_eq!(enabled.len(), 1);
        assert_eq!(enabled[0].name, "a");
        assert_eq!(store.list_configs().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn replace_keeps_identity_and_creation_time() {
        let store = InMemoryStore::new();
        let original = store
            .insert_config(WebhookConfigDraft::new("a", "https://a.example.com"))
            .await
            .unwrap();
        let replaced = store
            .replace_config(
                original.id,
                WebhookConfigDraft::new("a2", "https://a.example.com").with_trigger(TriggerRule::all()),
            )
            .await
            .unwrap();

        assert_eq!(replaced.id, original.id);
        assert_eq!(replaced.created_at, original.created_at);
        assert_eq!(replaced.triggers.len(), 1);
        assert_eq!(
            store.replace_config(WebhookConfigId(99), WebhookConfigDraft::new("x", "https://x")).await,
            Err(StoreError::NotFound(WebhookConfigId(99)))
        );
    }

    #[tokio::test]
    async fn delete_removes_config() {
        let store = InMemoryStore::new();
        let config = store
            .insert_config(WebhookConfigDraft::new("a", "https://a.example.com"))
            .await
            .unwrap();
        store.delete_config(config.id).await.unwrap();
        assert_eq!(store.get_config(config.id).await.unwrap(), None);
        assert!(store.delete_config(config.id).await.is_err());
    }

    #[tokio::test]
    async fn pending_retries_are_keyed_by_delivery() {
        let store = InMemoryStore::new();
        let key = DeliveryKey::new(WebhookConfigId(1), EventId("m1".into()));
        let mut retry = PendingRetry {
            key: key.clone(),
            trigger: TriggerRule::all(),
            event: InboundEvent::new("m1", "c", "s", "hi"),
            attempts_made: 0,
            next_attempt_at: Utc::now(),
        };
        store.record_pending(&retry).await.unwrap();
        retry.attempts_made = 2;
        store.record_pending(&retry).await.unwrap();

        let pending = store.load_pending().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].attempts_made, 2);

        store.clear_pending(&key).await.unwrap();
        assert!(store.load_pending().await.unwrap().is_empty());
    }
}
