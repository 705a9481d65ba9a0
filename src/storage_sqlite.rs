//! `SQLite`-backed [`ConfigStore`].
//!
//! # Schema
//!
//! ```sql
//! webhook_configs   (id, name, url, secret, enabled, created_at, updated_at)
//! webhook_triggers  (id, webhook_config_id -> webhook_configs ON DELETE CASCADE,
//!                    position, trigger_type, trigger_value, match_type, enabled)
//! webhook_delivery_logs (id, webhook_config_id, event_id, chat_jid, trigger_type,
//!                    trigger_value, payload, attempt_number, response_status,
//!                    response_body, delivered_at, created_at)
//! webhook_pending   (webhook_config_id, event_id, trigger, event, attempts_made,
//!                    next_attempt_at)
//! webhook_dead_letters (id, webhook_config_id, event_id, trigger_type, payload,
//!                    failure, attempts, created_at)
//! ```
//!
//! Timestamps are RFC 3339 text. Pending triggers and events are JSON.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::error::StoreError;
use crate::storage::ConfigStore;
use crate::types::{
    DeliveryAttempt, DeliveryKey, DlqEntry, EventId, PendingRetry, TriggerRule, WebhookConfig,
    WebhookConfigDraft, WebhookConfigId,
};

const SCHEMA: &str = r"
    PRAGMA foreign_keys = ON;

    CREATE TABLE IF NOT EXISTS webhook_configs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        url TEXT NOT NULL,
        secret TEXT,
        enabled INTEGER NOT NULL DEFAULT 1,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS webhook_triggers (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        webhook_config_id INTEGER NOT NULL
            REFERENCES webhook_configs(id) ON DELETE CASCADE,
        position INTEGER NOT NULL,
        trigger_type TEXT NOT NULL,
        trigger_value TEXT NOT NULL DEFAULT '',
        match_type TEXT NOT NULL DEFAULT 'exact',
        enabled INTEGER NOT NULL DEFAULT 1
    );

    CREATE TABLE IF NOT EXISTS webhook_delivery_logs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        webhook_config_id INTEGER NOT NULL,
        event_id TEXT NOT NULL,
        chat_jid TEXT NOT NULL,
        trigger_type TEXT NOT NULL,
        trigger_value TEXT NOT NULL,
        payload TEXT NOT NULL,
        attempt_number INTEGER NOT NULL,
        response_status INTEGER,
        response_body TEXT NOT NULL,
        delivered_at TEXT,
        created_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS webhook_pending (
        webhook_config_id INTEGER NOT NULL,
        event_id TEXT NOT NULL,
        trigger TEXT NOT NULL,
        event TEXT NOT NULL,
        attempts_made INTEGER NOT NULL,
        next_attempt_at TEXT NOT NULL,
        PRIMARY KEY (webhook_config_id, event_id)
    );

    CREATE TABLE IF NOT EXISTS webhook_dead_letters (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        webhook_config_id INTEGER NOT NULL,
        event_id TEXT NOT NULL,
        trigger_type TEXT NOT NULL,
        payload TEXT NOT NULL,
        failure TEXT NOT NULL,
        attempts INTEGER NOT NULL,
        created_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_webhook_triggers_config
        ON webhook_triggers(webhook_config_id);
    CREATE INDEX IF NOT EXISTS idx_webhook_delivery_logs_config
        ON webhook_delivery_logs(webhook_config_id, id);
";

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path).map_err(backend)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000;")
            .map_err(backend)?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory().map_err(backend)?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA).map_err(backend)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn load_configs(conn: &Connection, enabled_only: bool) -> Result<Vec<WebhookConfig>, StoreError> {
        let sql = if enabled_only {
            "SELECT id, name, url, secret, enabled, created_at, updated_at
             FROM webhook_configs WHERE enabled = 1 ORDER BY id"
        } else {
            "SELECT id, name, url, secret, enabled, created_at, updated_at
             FROM webhook_configs ORDER BY id"
        };
        let mut stmt = conn.prepare(sql).map_err(backend)?;
        let rows = stmt
            .query_map([], config_row)
            .map_err(backend)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(backend)?;

        rows.into_iter()
            .map(|mut config| {
                config.triggers = load_triggers(conn, config.id)?;
                Ok(config)
            })
            .collect()
    }

    fn load_config(conn: &Connection, id: WebhookConfigId) -> Result<Option<WebhookConfig>, StoreError> {
        let config = conn
            .query_row(
                "SELECT id, name, url, secret, enabled, created_at, updated_at
                 FROM webhook_configs WHERE id = ?1",
                params![id.0],
                config_row,
            )
            .optional()
            .map_err(backend)?;

        match config {
            Some(mut config) => {
                config.triggers = load_triggers(conn, config.id)?;
                Ok(Some(config))
            }
            None => Ok(None),
        }
    }
}

#[async_trait]
impl ConfigStore for SqliteStore {
    async fn list_enabled_configs(&self) -> Result<Vec<WebhookConfig>, StoreError> {
        Self::load_configs(&self.conn.lock(), true)
    }

    async fn list_configs(&self) -> Result<Vec<WebhookConfig>, StoreError> {
        Self::load_configs(&self.conn.lock(), false)
    }

    async fn get_config(&self, id: WebhookConfigId) -> Result<Option<WebhookConfig>, StoreError> {
        Self::load_config(&self.conn.lock(), id)
    }

    async fn insert_config(&self, draft: WebhookConfigDraft) -> Result<WebhookConfig, StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(backend)?;
        let now = Utc::now();

        tx.execute(
            "INSERT INTO webhook_configs (name, url, secret, enabled, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
            params![draft.name, draft.url, draft.secret, draft.enabled, now.to_rfc3339()],
        )
        .map_err(backend)?;
        let id = WebhookConfigId(tx.last_insert_rowid());
        insert_triggers(&tx, id, &draft.triggers)?;
        tx.commit().map_err(backend)?;

        Ok(draft.into_config(id, now, now))
    }

    async fn replace_config(
        &self,
        id: WebhookConfigId,
        draft: WebhookConfigDraft,
    ) -> Result<WebhookConfig, StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(backend)?;
        let now = Utc::now();

        let created_at: Option<String> = tx
            .query_row(
                "SELECT created_at FROM webhook_configs WHERE id = ?1",
                params![id.0],
                |row| row.get(0),
            )
            .optional()
            .map_err(backend)?;
        let created_at = parse_time(&created_at.ok_or(StoreError::NotFound(id))?)?;

        tx.execute(
            "UPDATE webhook_configs
             SET name = ?1, url = ?2, secret = ?3, enabled = ?4, updated_at = ?5
             WHERE id = ?6",
            params![draft.name, draft.url, draft.secret, draft.enabled, now.to_rfc3339(), id.0],
        )
        .map_err(backend)?;
        tx.execute(
            "DELETE FROM webhook_triggers WHERE webhook_config_id = ?1",
            params![id.0],
        )
        .map_err(backend)?;
        insert_triggers(&tx, id, &draft.triggers)?;
        tx.commit().map_err(backend)?;

        Ok(draft.into_config(id, created_at, now))
    }

    async fn delete_config(&self, id: WebhookConfigId) -> Result<(), StoreError> {
        let deleted = self
            .conn
            .lock()
            .execute("DELETE FROM webhook_configs WHERE id = ?1", params![id.0])
            .map_err(backend)?;
        if deleted == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    async fn append_delivery_log(&self, attempt: &DeliveryAttempt) -> Result<(), StoreError> {
        self.conn
            .lock()
            .execute(
                "INSERT INTO webhook_delivery_logs
                    (webhook_config_id, event_id, chat_jid, trigger_type, trigger_value,
                     payload, attempt_number, response_status, response_body,
                     delivered_at, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    attempt.webhook_config_id.0,
                    attempt.event_id.0,
                    attempt.chat_id,
                    attempt.trigger_type.as_str(),
                    attempt.trigger_value,
                    attempt.payload,
                    attempt.attempt_number,
                    attempt.response_status,
                    attempt.response_excerpt,
                    attempt.delivered_at.map(|t| t.to_rfc3339()),
                    attempt.created_at.to_rfc3339(),
                ],
            )
            .map_err(backend)?;
        Ok(())
    }

    async fn delivery_logs(
        &self,
        id: WebhookConfigId,
        limit: usize,
    ) -> Result<Vec<DeliveryAttempt>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT webhook_config_id, event_id, chat_jid, trigger_type, trigger_value,
                        payload, attempt_number, response_status, response_body,
                        delivered_at, created_at
                 FROM webhook_delivery_logs
                 WHERE webhook_config_id = ?1
                 ORDER BY id DESC
                 LIMIT ?2",
            )
            .map_err(backend)?;

        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt
            .query_map(params![id.0, limit], |row| {
                Ok(LogRow {
                    webhook_config_id: row.get(0)?,
                    event_id: row.get(1)?,
                    chat_id: row.get(2)?,
                    trigger_type: row.get(3)?,
                    trigger_value: row.get(4)?,
                    payload: row.get(5)?,
                    attempt_number: row.get(6)?,
                    response_status: row.get(7)?,
                    response_excerpt: row.get(8)?,
                    delivered_at: row.get(9)?,
                    created_at: row.get(10)?,
                })
            })
            .map_err(backend)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(backend)?;

        rows.into_iter().map(LogRow::into_attempt).collect()
    }

    async fn record_pending(&self, retry: &PendingRetry) -> Result<(), StoreError> {
        let trigger = serde_json::to_string(&retry.trigger).map_err(backend)?;
        let event = serde_json::to_string(&retry.event).map_err(backend)?;
        self.conn
            .lock()
            .execute(
                "INSERT INTO webhook_pending
                    (webhook_config_id, event_id, trigger, event, attempts_made, next_attempt_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT (webhook_config_id, event_id) DO UPDATE SET
                    trigger = excluded.trigger,
                    event = excluded.event,
                    attempts_made = excluded.attempts_made,
                    next_attempt_at = excluded.next_attempt_at",
                params![
                    retry.key.config_id.0,
                    retry.key.event_id.0,
                    trigger,
                    event,
                    retry.attempts_made,
                    retry.next_attempt_at.to_rfc3339(),
                ],
            )
            .map_err(backend)?;
        Ok(())
    }

    async fn clear_pending(&self, key: &DeliveryKey) -> Result<(), StoreError> {
        self.conn
            .lock()
            .execute(
                "DELETE FROM webhook_pending WHERE webhook_config_id = ?1 AND event_id = ?2",
                params![key.config_id.0, key.event_id.0],
            )
            .map_err(backend)?;
        Ok(())
    }

    async fn load_pending(&self) -> Result<Vec<PendingRetry>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT webhook_config_id, event_id, trigger, event, attempts_made, next_attempt_at
                 FROM webhook_pending
                 ORDER BY next_attempt_at",
            )
            .map_err(backend)?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, u32>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })
            .map_err(backend)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(backend)?;

        rows.into_iter()
            .map(|(config_id, event_id, trigger, event, attempts_made, next_at)| {
                Ok(PendingRetry {
                    key: DeliveryKey::new(WebhookConfigId(config_id), EventId(event_id)),
                    trigger: serde_json::from_str(&trigger).map_err(backend)?,
                    event: serde_json::from_str(&event).map_err(backend)?,
                    attempts_made,
                    next_attempt_at: parse_time(&next_at)?,
                })
            })
            .collect()
    }

    async fn record_dead_letter(&self, entry: &DlqEntry) -> Result<(), StoreError> {
        self.conn
            .lock()
            .execute(
                "INSERT INTO webhook_dead_letters
                    (webhook_config_id, event_id, trigger_type, payload, failure, attempts, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    entry.key.config_id.0,
                    entry.key.event_id.0,
                    entry.trigger_type.as_str(),
                    entry.last_payload,
                    entry.failure,
                    entry.attempts,
                    entry.created_at.to_rfc3339(),
                ],
            )
            .map_err(backend)?;
        Ok(())
    }
}

struct LogRow {
    webhook_config_id: i64,
    event_id: String,
    chat_id: String,
    trigger_type: String,
    trigger_value: String,
    payload: String,
    attempt_number: u32,
    response_status: Option<u16>,
    response_excerpt: String,
    delivered_at: Option<String>,
    created_at: String,
}

impl LogRow {
    fn into_attempt(self) -> Result<DeliveryAttempt, StoreError> {
        Ok(DeliveryAttempt {
            webhook_config_id: WebhookConfigId(self.webhook_config_id),
            event_id: EventId(self.event_id),
            chat_id: self.chat_id,
            trigger_type: self.trigger_type.parse().map_err(backend)?,
            trigger_value: self.trigger_value,
            payload: self.payload,
            attempt_number: self.attempt_number,
            response_status: self.response_status,
            response_excerpt: self.response_excerpt,
            delivered_at: self.delivered_at.as_deref().map(parse_time).transpose()?,
            created_at: parse_time(&self.created_at)?,
        })
    }
}

fn backend(err: impl std::fmt::Display) -> StoreError {
    StoreError::Backend(err.to_string())
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(backend)
}

/// Columns: id, name, url, secret, enabled, created_at, updated_at.
fn config_row(row: &Row<'_>) -> rusqlite::Result<WebhookConfig> {
    let timestamp = |idx: usize| -> rusqlite::Result<DateTime<Utc>> {
        let raw: String = row.get(idx)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|err| {
                rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(err))
            })
    };

    Ok(WebhookConfig {
        id: WebhookConfigId(row.get(0)?),
        name: row.get(1)?,
        url: row.get(2)?,
        secret: row.get(3)?,
        enabled: row.get(4)?,
        triggers: Vec::new(),
        created_at: timestamp(5)?,
        updated_at: timestamp(6)?,
    })
}

fn load_triggers(conn: &Connection, id: WebhookConfigId) -> Result<Vec<TriggerRule>, StoreError> {
    let mut stmt = conn
        .prepare(
            "SELECT trigger_type, trigger_value, match_type, enabled
             FROM webhook_triggers
             WHERE webhook_config_id = ?1
             ORDER BY position",
        )
        .map_err(backend)?;
    let rows = stmt
        .query_map(params![id.0], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, bool>(3)?,
            ))
        })
        .map_err(backend)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(backend)?;

    rows.into_iter()
        .map(|(trigger_type, value, match_type, enabled)| {
            Ok(TriggerRule {
                trigger_type: trigger_type.parse().map_err(backend)?,
                value,
                match_type: match_type.parse().map_err(backend)?,
                enabled,
            })
        })
        .collect()
}

fn insert_triggers(
    conn: &Connection,
    id: WebhookConfigId,
    triggers: &[TriggerRule],
) -> Result<(), StoreError> {
    let mut stmt = conn
        .prepare(
            "INSERT INTO webhook_triggers
                (webhook_config_id, position, trigger_type, trigger_value, match_type, enabled)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .map_err(backend)?;
    for (position, trigger) in triggers.iter().enumerate() {
        stmt.execute(params![
            id.0,
            i64::try_from(position).unwrap_or(i64::MAX),
            trigger.trigger_type.as_str(),
            trigger.value,
            trigger.match_type.as_str(),
            trigger.enabled,
        ])
        .map_err(backend)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{InboundEvent, MatchType, TriggerType};

    fn draft() -> WebhookConfigDraft {
        WebhookConfigDraft::new("alerts", "https://hooks.example.com/in")
            .with_secret("s3cret")
            .with_trigger(TriggerRule::new(TriggerType::Keyword, "urgent", MatchType::Contains))
            .with_trigger(TriggerRule::new(TriggerType::Sender, "4915112345678", MatchType::Exact).disabled())
    }

    #[tokio::test]
    async fn configs_round_trip_with_ordered_triggers() {
        let store = SqliteStore::open_in_memory().unwrap();
        let created = store.insert_config(draft()).await.unwrap();

        let loaded = store.get_config(created.id).await.unwrap().unwrap();
        assert_eq!(loaded.name, "alerts");
        assert_eq!(loaded.secret.as_deref(), Some("s3cret"));
        assert_eq!(loaded.triggers, created.triggers);
        assert!(!loaded.triggers[1].enabled);

        store
            .insert_config(WebhookConfigDraft::new("off", "https://b.example.com").disabled())
            .await
            .unwrap();
        assert_eq!(store.list_enabled_configs().await.unwrap().len(), 1);
        assert_eq!(store.list_configs().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn replace_swaps_triggers_and_delete_cascades() {
        let store = SqliteStore::open_in_memory().unwrap();
        let created = store.insert_config(draft()).await.unwrap();

        let replaced = store
            .replace_config(
                created.id,
                WebhookConfigDraft::new("alerts-v2", "https://hooks.example.com/in").with_trigger(TriggerRule::all()),
            )
            .await
            .unwrap();
        assert_eq!(replaced.created_at, created.created_at);
        let loaded = store.get_config(created.id).await.unwrap().unwrap();
        assert_eq!(loaded.triggers, vec![TriggerRule::all()]);

        store.delete_config(created.id).await.unwrap();
        let orphans: i64 = store
            .conn
            .lock()
            .query_row("SELECT COUNT(*) FROM webhook_triggers", [], |row| row.get(0))
            .unwrap();
        assert_eq!(orphans, 0);
        assert_eq!(
            store.delete_config(created.id).await,
            Err(StoreError::NotFound(created.id))
        );
    }

    #[tokio::test]
    async fn logs_newest_first_and_pending_upserts() {
        let store = SqliteStore::open_in_memory().unwrap();
        let config = store.insert_config(draft()).await.unwrap();

        for attempt_number in 1..=3 {
            store
                .append_delivery_log(&DeliveryAttempt {
                    webhook_config_id: config.id,
                    event_id: EventId("m1".into()),
                    chat_id: "c@s.whatsapp.net".into(),
                    trigger_type: TriggerType::Keyword,
                    trigger_value: "urgent".into(),
                    payload: "{}".into(),
                    attempt_number,
                    response_status: (attempt_number == 3).then_some(200),
                    response_excerpt: String::new(),
                    delivered_at: (attempt_number == 3).then(Utc::now),
                    created_at: Utc::now(),
                })
                .await
                .unwrap();
        }
        let logs = store.delivery_logs(config.id, 2).await.unwrap();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].attempt_number, 3);
        assert!(logs[0].delivered_at.is_some());
        assert_eq!(logs[1].response_status, None);

        let key = DeliveryKey::new(config.id, EventId("m1".into()));
        let mut retry = PendingRetry {
            key: key.clone(),
            trigger: TriggerRule::all(),
            event: InboundEvent::new("m1", "c@s.whatsapp.net", "s@s.whatsapp.net", "hi"),
            attempts_made: 1,
            next_attempt_at: Utc::now(),
        };
        store.record_pending(&retry).await.unwrap();
        retry.attempts_made = 2;
        store.record_pending(&retry).await.unwrap();

        let pending = store.load_pending().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].attempts_made, 2);
        assert_eq!(pending[0].event.text_content, "hi");

        store.clear_pending(&key).await.unwrap();
        assert!(store.load_pending().await.unwrap().is_empty());
    }
}
