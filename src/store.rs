//! Gateway Persistence Layer
//!
//! SQLite storage for API clients, access logs and webhook subscriptions.
//! The access log doubles as the authoritative source for daily quotas.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

use crate::access_log::{AccessLogEntry, NewAccessLogEntry};
use crate::credentials::{Capabilities, ClientCredential, ClientUpdate, KeyPair, NewClient};
use crate::error::StoreError;
use crate::webhooks::{clamp_error, DeliveryOutcome, NewWebhook, WebhookSubscription};

/// Durable client credential records
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn find_by_public_key(
        &self,
        public_key: &str,
    ) -> Result<Option<ClientCredential>, StoreError>;

    async fn get_client(&self, id: i64) -> Result<Option<ClientCredential>, StoreError>;

    async fn insert_client(
        &self,
        client: &NewClient,
        keys: &KeyPair,
        created_by: &str,
        now: DateTime<Utc>,
    ) -> Result<ClientCredential, StoreError>;

    async fn update_client(
        &self,
        id: i64,
        update: &ClientUpdate,
        now: DateTime<Utc>,
    ) -> Result<ClientCredential, StoreError>;

    /// Replace public key and secret in one statement
    async fn rotate_keys(
        &self,
        id: i64,
        keys: &KeyPair,
        now: DateTime<Utc>,
    ) -> Result<ClientCredential, StoreError>;

    async fn set_client_active(
        &self,
        id: i64,
        active: bool,
        now: DateTime<Utc>,
    ) -> Result<ClientCredential, StoreError>;

    async fn list_clients(&self) -> Result<Vec<ClientCredential>, StoreError>;
}

/// Append-only access log
#[async_trait]
pub trait AccessLogStore: Send + Sync {
    async fn append(&self, entry: &NewAccessLogEntry) -> Result<i64, StoreError>;

    /// Logged requests for a client on a UTC calendar day, excluding
    /// requests that were themselves rejected by the rate limiter
    async fn count_for_day(&self, client_id: i64, day: NaiveDate) -> Result<u64, StoreError>;

    async fn recent_for_client(
        &self,
        client_id: i64,
        limit: usize,
    ) -> Result<Vec<AccessLogEntry>, StoreError>;
}

/// Webhook subscription records
#[async_trait]
pub trait WebhookStore: Send + Sync {
    async fn insert_webhook(
        &self,
        webhook: &NewWebhook,
        now: DateTime<Utc>,
    ) -> Result<WebhookSubscription, StoreError>;

    async fn get_webhook(&self, id: i64) -> Result<Option<WebhookSubscription>, StoreError>;

    async fn set_webhook_active(
        &self,
        id: i64,
        active: bool,
    ) -> Result<WebhookSubscription, StoreError>;

    async fn list_webhooks(&self, client_id: i64) -> Result<Vec<WebhookSubscription>, StoreError>;

    async fn delete_webhook(&self, id: i64) -> Result<bool, StoreError>;

    async fn record_delivery(
        &self,
        id: i64,
        outcome: &DeliveryOutcome,
        now: DateTime<Utc>,
    ) -> Result<WebhookSubscription, StoreError>;
}

const CLIENT_COLUMNS: &str = "id, name, description, public_key, secret, is_active,
    can_read_patients, can_write_patients, can_read_appointments, can_write_appointments,
    can_read_medical_records, can_write_medical_records, can_read_pharmacy, can_write_pharmacy,
    rate_limit_per_minute, daily_request_limit, created_by, created_at, updated_at";

const LOG_COLUMNS: &str = "id, client_id, endpoint, method, ip_address, user_agent,
    request_body, status_code, response_time_ms, created_at";

const WEBHOOK_COLUMNS: &str = "id, client_id, event, target_url, secret, is_active,
    success_count, failure_count, last_error, last_delivery_at, created_at";

/// SQLite-backed store implementing every gateway persistence trait
pub struct GatewayStore {
    conn: Arc<Mutex<Connection>>,
}

impl GatewayStore {
    /// Create or open the database at `db_path`
    pub fn new(db_path: impl AsRef<Path>) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StoreError::Database(format!("Failed to create data directory: {}", e))
                })?;
            }
        }

        let conn = Connection::open(db_path.as_ref())
            .map_err(|e| StoreError::Database(format!("Failed to open database: {}", e)))?;
        Self::create_tables(&conn)?;

        info!("Opened gateway database: {:?}", db_path.as_ref());

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create an in-memory database (useful for testing)
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(|e| {
            StoreError::Database(format!("Failed to open in-memory database: {}", e))
        })?;
        Self::create_tables(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn create_tables(conn: &Connection) -> Result<(), StoreError> {
        conn.execute("PRAGMA foreign_keys = ON", [])?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS api_clients (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                public_key TEXT NOT NULL UNIQUE,
                secret TEXT NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 1,
                can_read_patients INTEGER NOT NULL DEFAULT 0,
                can_write_patients INTEGER NOT NULL DEFAULT 0,
                can_read_appointments INTEGER NOT NULL DEFAULT 0,
                can_write_appointments INTEGER NOT NULL DEFAULT 0,
                can_read_medical_records INTEGER NOT NULL DEFAULT 0,
                can_write_medical_records INTEGER NOT NULL DEFAULT 0,
                can_read_pharmacy INTEGER NOT NULL DEFAULT 0,
                can_write_pharmacy INTEGER NOT NULL DEFAULT 0,
                rate_limit_per_minute INTEGER NOT NULL,
                daily_request_limit INTEGER NOT NULL,
                created_by TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                CHECK (public_key <> '' AND secret <> '')
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS access_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                client_id INTEGER,
                endpoint TEXT NOT NULL,
                method TEXT NOT NULL,
                ip_address TEXT NOT NULL,
                user_agent TEXT NOT NULL,
                request_body TEXT NOT NULL,
                status_code INTEGER NOT NULL,
                response_time_ms REAL NOT NULL,
                day TEXT NOT NULL,
                created_at INTEGER NOT NULL
            )",
            [],
        )?;

        // Daily quota lookups
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_access_logs_client_day
             ON access_logs(client_id, day)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS webhook_subscriptions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                client_id INTEGER NOT NULL,
                event TEXT NOT NULL,
                target_url TEXT NOT NULL,
                secret TEXT NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 1,
                success_count INTEGER NOT NULL DEFAULT 0,
                failure_count INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                last_delivery_at INTEGER,
                created_at INTEGER NOT NULL,
                UNIQUE (client_id, event, target_url),
                FOREIGN KEY (client_id) REFERENCES api_clients(id) ON DELETE CASCADE
            )",
            [],
        )?;

        Ok(())
    }

    fn load_client(conn: &Connection, id: i64) -> Result<ClientCredential, StoreError> {
        conn.query_row(
            &format!("SELECT {} FROM api_clients WHERE id = ?1", CLIENT_COLUMNS),
            params![id],
            row_to_client,
        )
        .optional()?
        .ok_or_else(|| StoreError::NotFound(format!("client {}", id)))
    }

    fn load_webhook(conn: &Connection, id: i64) -> Result<WebhookSubscription, StoreError> {
        let row = conn
            .query_row(
                &format!(
                    "SELECT {} FROM webhook_subscriptions WHERE id = ?1",
                    WEBHOOK_COLUMNS
                ),
                params![id],
                row_to_webhook_raw,
            )
            .optional()?;
        match row {
            Some(raw) => raw.into_subscription(),
            None => Err(StoreError::NotFound(format!("webhook {}", id))),
        }
    }
}

#[async_trait]
impl CredentialStore for GatewayStore {
    async fn find_by_public_key(
        &self,
        public_key: &str,
    ) -> Result<Option<ClientCredential>, StoreError> {
        let conn = self.conn.lock().await;
        let client = conn
            .query_row(
                &format!(
                    "SELECT {} FROM api_clients WHERE public_key = ?1",
                    CLIENT_COLUMNS
                ),
                params![public_key],
                row_to_client,
            )
            .optional()?;
        Ok(client)
    }

    async fn get_client(&self, id: i64) -> Result<Option<ClientCredential>, StoreError> {
        let conn = self.conn.lock().await;
        match Self::load_client(&conn, id) {
            Ok(client) => Ok(Some(client)),
            Err(StoreError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn insert_client(
        &self,
        client: &NewClient,
        keys: &KeyPair,
        created_by: &str,
        now: DateTime<Utc>,
    ) -> Result<ClientCredential, StoreError> {
        if client.name.trim().is_empty() {
            return Err(StoreError::Invalid("client name must not be empty".to_string()));
        }

        let conn = self.conn.lock().await;
        let caps = &client.capabilities;
        conn.execute(
            "INSERT INTO api_clients (
                name, description, public_key, secret, is_active,
                can_read_patients, can_write_patients, can_read_appointments, can_write_appointments,
                can_read_medical_records, can_write_medical_records, can_read_pharmacy, can_write_pharmacy,
                rate_limit_per_minute, daily_request_limit, created_by, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, 1, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?16)",
            params![
                client.name.trim(),
                client.description,
                keys.public_key,
                keys.secret,
                caps.can_read_patients,
                caps.can_write_patients,
                caps.can_read_appointments,
                caps.can_write_appointments,
                caps.can_read_medical_records,
                caps.can_write_medical_records,
                caps.can_read_pharmacy,
                caps.can_write_pharmacy,
                client.rate_limit_per_minute,
                client.daily_request_limit,
                created_by,
                now.timestamp_millis(),
            ],
        )?;

        let id = conn.last_insert_rowid();
        Self::load_client(&conn, id)
    }

    async fn update_client(
        &self,
        id: i64,
        update: &ClientUpdate,
        now: DateTime<Utc>,
    ) -> Result<ClientCredential, StoreError> {
        let conn = self.conn.lock().await;
        let mut client = Self::load_client(&conn, id)?;

        if let Some(name) = &update.name {
            if name.trim().is_empty() {
                return Err(StoreError::Invalid("client name must not be empty".to_string()));
            }
            client.name = name.trim().to_string();
        }
        if let Some(description) = &update.description {
            client.description = description.clone();
        }
        if let Some(changes) = &update.capabilities {
            changes.apply(&mut client.capabilities);
        }
        if let Some(limit) = update.rate_limit_per_minute {
            client.rate_limit_per_minute = limit;
        }
        if let Some(limit) = update.daily_request_limit {
            client.daily_request_limit = limit;
        }

        let caps = &client.capabilities;
        conn.execute(
            "UPDATE api_clients SET
                name = ?2, description = ?3,
                can_read_patients = ?4, can_write_patients = ?5,
                can_read_appointments = ?6, can_write_appointments = ?7,
                can_read_medical_records = ?8, can_write_medical_records = ?9,
                can_read_pharmacy = ?10, can_write_pharmacy = ?11,
                rate_limit_per_minute = ?12, daily_request_limit = ?13,
                updated_at = ?14
             WHERE id = ?1",
            params![
                id,
                client.name,
                client.description,
                caps.can_read_patients,
                caps.can_write_patients,
                caps.can_read_appointments,
                caps.can_write_appointments,
                caps.can_read_medical_records,
                caps.can_write_medical_records,
                caps.can_read_pharmacy,
                caps.can_write_pharmacy,
                client.rate_limit_per_minute,
                client.daily_request_limit,
                now.timestamp_millis(),
            ],
        )?;

        Self::load_client(&conn, id)
    }

    async fn rotate_keys(
        &self,
        id: i64,
        keys: &KeyPair,
        now: DateTime<Utc>,
    ) -> Result<ClientCredential, StoreError> {
        let conn = self.conn.lock().await;
        let rows = conn.execute(
            "UPDATE api_clients SET public_key = ?2, secret = ?3, updated_at = ?4 WHERE id = ?1",
            params![id, keys.public_key, keys.secret, now.timestamp_millis()],
        )?;
        if rows == 0 {
            return Err(StoreError::NotFound(format!("client {}", id)));
        }
        Self::load_client(&conn, id)
    }

    async fn set_client_active(
        &self,
        id: i64,
        active: bool,
        now: DateTime<Utc>,
    ) -> Result<ClientCredential, StoreError> {
        let conn = self.conn.lock().await;
        let rows = conn.execute(
            "UPDATE api_clients SET is_active = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, active, now.timestamp_millis()],
        )?;
        if rows == 0 {
            return Err(StoreError::NotFound(format!("client {}", id)));
        }
        Self::load_client(&conn, id)
    }

    async fn list_clients(&self) -> Result<Vec<ClientCredential>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM api_clients ORDER BY id",
            CLIENT_COLUMNS
        ))?;
        let clients = stmt
            .query_map([], row_to_client)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(clients)
    }
}

#[async_trait]
impl AccessLogStore for GatewayStore {
    async fn append(&self, entry: &NewAccessLogEntry) -> Result<i64, StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO access_logs (
                client_id, endpoint, method, ip_address, user_agent,
                request_body, status_code, response_time_ms, day, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                entry.client_id,
                entry.endpoint,
                entry.method,
                entry.ip_address,
                entry.user_agent,
                entry.request_body,
                entry.status_code,
                entry.response_time_ms,
                day_key(entry.created_at.date_naive()),
                entry.created_at.timestamp_millis(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    async fn count_for_day(&self, client_id: i64, day: NaiveDate) -> Result<u64, StoreError> {
        let conn = self.conn.lock().await;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM access_logs
             WHERE client_id = ?1 AND day = ?2 AND status_code <> 429",
            params![client_id, day_key(day)],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }

    async fn recent_for_client(
        &self,
        client_id: i64,
        limit: usize,
    ) -> Result<Vec<AccessLogEntry>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM access_logs WHERE client_id = ?1 ORDER BY id DESC LIMIT ?2",
            LOG_COLUMNS
        ))?;
        let entries = stmt
            .query_map(params![client_id, limit as i64], row_to_log)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }
}

#[async_trait]
impl WebhookStore for GatewayStore {
    async fn insert_webhook(
        &self,
        webhook: &NewWebhook,
        now: DateTime<Utc>,
    ) -> Result<WebhookSubscription, StoreError> {
        let conn = self.conn.lock().await;
        Self::load_client(&conn, webhook.client_id)?;

        conn.execute(
            "INSERT INTO webhook_subscriptions (client_id, event, target_url, secret, is_active, created_at)
             VALUES (?1, ?2, ?3, ?4, 1, ?5)",
            params![
                webhook.client_id,
                webhook.event.as_str(),
                webhook.target_url,
                webhook.secret,
                now.timestamp_millis(),
            ],
        )
        .map_err(|e| match StoreError::from(e) {
            StoreError::Conflict(_) => StoreError::Conflict(format!(
                "client {} already subscribes {} to {}",
                webhook.client_id, webhook.target_url, webhook.event
            )),
            other => other,
        })?;

        let id = conn.last_insert_rowid();
        Self::load_webhook(&conn, id)
    }

    async fn get_webhook(&self, id: i64) -> Result<Option<WebhookSubscription>, StoreError> {
        let conn = self.conn.lock().await;
        match Self::load_webhook(&conn, id) {
            Ok(hook) => Ok(Some(hook)),
            Err(StoreError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn set_webhook_active(
        &self,
        id: i64,
        active: bool,
    ) -> Result<WebhookSubscription, StoreError> {
        let conn = self.conn.lock().await;
        let rows = conn.execute(
            "UPDATE webhook_subscriptions SET is_active = ?2 WHERE id = ?1",
            params![id, active],
        )?;
        if rows == 0 {
            return Err(StoreError::NotFound(format!("webhook {}", id)));
        }
        Self::load_webhook(&conn, id)
    }

    async fn list_webhooks(&self, client_id: i64) -> Result<Vec<WebhookSubscription>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM webhook_subscriptions WHERE client_id = ?1 ORDER BY id",
            WEBHOOK_COLUMNS
        ))?;
        let raw = stmt
            .query_map(params![client_id], row_to_webhook_raw)?
            .collect::<Result<Vec<_>, _>>()?;
        raw.into_iter().map(RawWebhook::into_subscription).collect()
    }

    async fn delete_webhook(&self, id: i64) -> Result<bool, StoreError> {
        let conn = self.conn.lock().await;
        let rows = conn.execute(
            "DELETE FROM webhook_subscriptions WHERE id = ?1",
            params![id],
        )?;
        Ok(rows > 0)
    }

    async fn record_delivery(
        &self,
        id: i64,
        outcome: &DeliveryOutcome,
        now: DateTime<Utc>,
    ) -> Result<WebhookSubscription, StoreError> {
        let conn = self.conn.lock().await;
        let rows = match outcome {
            DeliveryOutcome::Success => conn.execute(
                "UPDATE webhook_subscriptions
                 SET success_count = success_count + 1, last_delivery_at = ?2
                 WHERE id = ?1",
                params![id, now.timestamp_millis()],
            )?,
            DeliveryOutcome::Failure(error) => conn.execute(
                "UPDATE webhook_subscriptions
                 SET failure_count = failure_count + 1, last_error = ?2, last_delivery_at = ?3
                 WHERE id = ?1",
                params![id, clamp_error(error), now.timestamp_millis()],
            )?,
        };
        if rows == 0 {
            return Err(StoreError::NotFound(format!("webhook {}", id)));
        }
        Self::load_webhook(&conn, id)
    }
}

/// Calendar-day key used by the access log index
pub fn day_key(day: NaiveDate) -> String {
    day.format("%Y-%m-%d").to_string()
}

fn millis_to_datetime(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .unwrap_or_default()
}

fn row_to_client(row: &Row<'_>) -> rusqlite::Result<ClientCredential> {
    Ok(ClientCredential {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        public_key: row.get(3)?,
        secret: row.get(4)?,
        is_active: row.get(5)?,
        capabilities: Capabilities {
            can_read_patients: row.get(6)?,
            can_write_patients: row.get(7)?,
            can_read_appointments: row.get(8)?,
            can_write_appointments: row.get(9)?,
            can_read_medical_records: row.get(10)?,
            can_write_medical_records: row.get(11)?,
            can_read_pharmacy: row.get(12)?,
            can_write_pharmacy: row.get(13)?,
        },
        rate_limit_per_minute: row.get(14)?,
        daily_request_limit: row.get(15)?,
        created_by: row.get(16)?,
        created_at: millis_to_datetime(row.get(17)?),
        updated_at: millis_to_datetime(row.get(18)?),
    })
}

fn row_to_log(row: &Row<'_>) -> rusqlite::Result<AccessLogEntry> {
    Ok(AccessLogEntry {
        id: row.get(0)?,
        client_id: row.get(1)?,
        endpoint: row.get(2)?,
        method: row.get(3)?,
        ip_address: row.get(4)?,
        user_agent: row.get(5)?,
        request_body: row.get(6)?,
        status_code: row.get(7)?,
        response_time_ms: row.get(8)?,
        created_at: millis_to_datetime(row.get(9)?),
    })
}

/// Webhook row before the event name is parsed
struct RawWebhook {
    id: i64,
    client_id: i64,
    event: String,
    target_url: String,
    secret: String,
    is_active: bool,
    success_count: i64,
    failure_count: i64,
    last_error: Option<String>,
    last_delivery_at: Option<i64>,
    created_at: i64,
}

impl RawWebhook {
    fn into_subscription(self) -> Result<WebhookSubscription, StoreError> {
        Ok(WebhookSubscription {
            id: self.id,
            client_id: self.client_id,
            event: self.event.parse()?,
            target_url: self.target_url,
            secret: self.secret,
            is_active: self.is_active,
            success_count: self.success_count.max(0) as u64,
            failure_count: self.failure_count.max(0) as u64,
            last_error: self.last_error,
            last_delivery_at: self.last_delivery_at.map(millis_to_datetime),
            created_at: millis_to_datetime(self.created_at),
        })
    }
}

fn row_to_webhook_raw(row: &Row<'_>) -> rusqlite::Result<RawWebhook> {
    Ok(RawWebhook {
        id: row.get(0)?,
        client_id: row.get(1)?,
        event: row.get(2)?,
        target_url: row.get(3)?,
        secret: row.get(4)?,
        is_active: row.get(5)?,
        success_count: row.get(6)?,
        failure_count: row.get(7)?,
        last_error: row.get(8)?,
        last_delivery_at: row.get(9)?,
        created_at: row.get(10)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::webhooks::WebhookEvent;
    use chrono::Duration;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 4, 10, 30, 0).unwrap()
    }

    async fn create_client(store: &GatewayStore, name: &str) -> ClientCredential {
        let mut new_client = NewClient::named(name);
        new_client.capabilities.can_read_patients = true;
        store
            .insert_client(&new_client, &KeyPair::generate(), "admin", now())
            .await
            .unwrap()
    }

    fn log_entry(client_id: Option<i64>, status: u16, at: DateTime<Utc>) -> NewAccessLogEntry {
        NewAccessLogEntry {
            client_id,
            endpoint: "/patients/42/".to_string(),
            method: "GET".to_string(),
            ip_address: "10.0.0.1".to_string(),
            user_agent: "partner-sdk/1.0".to_string(),
            request_body: String::new(),
            status_code: status,
            response_time_ms: 3.5,
            created_at: at,
        }
    }

    #[tokio::test]
    async fn test_insert_and_find_client() {
        let store = GatewayStore::in_memory().unwrap();
        let client = create_client(&store, "Radiology partner").await;

        assert!(client.is_active);
        assert!(client.capabilities.can_read_patients);
        assert_eq!(client.created_at, now());

        let found = store
            .find_by_public_key(&client.public_key)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found, client);

        assert!(store.find_by_public_key("nope").await.unwrap().is_none());
        assert!(store.get_client(999).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_empty_name_rejected() {
        let store = GatewayStore::in_memory().unwrap();
        let result = store
            .insert_client(&NewClient::named("  "), &KeyPair::generate(), "admin", now())
            .await;
        assert!(matches!(result, Err(StoreError::Invalid(_))));
    }

    #[tokio::test]
    async fn test_empty_keys_rejected() {
        let store = GatewayStore::in_memory().unwrap();
        let keys = KeyPair {
            public_key: String::new(),
            secret: String::new(),
        };
        let result = store
            .insert_client(&NewClient::named("Pharmacy"), &keys, "admin", now())
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_rotate_keys_replaces_both() {
        let store = GatewayStore::in_memory().unwrap();
        let client = create_client(&store, "Lab").await;

        let new_keys = KeyPair::generate();
        let rotated = store.rotate_keys(client.id, &new_keys, now()).await.unwrap();

        assert_eq!(rotated.public_key, new_keys.public_key);
        assert_eq!(rotated.secret, new_keys.secret);
        assert!(store
            .find_by_public_key(&client.public_key)
            .await
            .unwrap()
            .is_none());
        assert!(matches!(
            store.rotate_keys(999, &KeyPair::generate(), now()).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_update_client() {
        let store = GatewayStore::in_memory().unwrap();
        let client = create_client(&store, "Lab").await;

        let update = ClientUpdate {
            rate_limit_per_minute: Some(5),
            capabilities: Some(Capabilities::read_only().into()),
            ..ClientUpdate::default()
        };
        let later = now() + Duration::minutes(5);
        let updated = store.update_client(client.id, &update, later).await.unwrap();

        assert_eq!(updated.rate_limit_per_minute, 5);
        assert_eq!(updated.daily_request_limit, client.daily_request_limit);
        assert_eq!(updated.capabilities, Capabilities::read_only());
        assert_eq!(updated.updated_at, later);
        assert_eq!(updated.public_key, client.public_key);
    }

    #[tokio::test]
    async fn test_set_active() {
        let store = GatewayStore::in_memory().unwrap();
        let client = create_client(&store, "Lab").await;

        let inactive = store.set_client_active(client.id, false, now()).await.unwrap();
        assert!(!inactive.is_active);

        let clients = store.list_clients().await.unwrap();
        assert_eq!(clients.len(), 1);
        assert!(!clients[0].is_active);
    }

    #[tokio::test]
    async fn test_daily_count_excludes_other_days_clients_and_429() {
        let store = GatewayStore::in_memory().unwrap();
        let a = create_client(&store, "A").await;
        let b = create_client(&store, "B").await;

        store.append(&log_entry(Some(a.id), 200, now())).await.unwrap();
        store.append(&log_entry(Some(a.id), 403, now())).await.unwrap();
        store.append(&log_entry(Some(a.id), 429, now())).await.unwrap();
        store
            .append(&log_entry(Some(a.id), 200, now() - Duration::days(1)))
            .await
            .unwrap();
        store.append(&log_entry(Some(b.id), 200, now())).await.unwrap();
        store.append(&log_entry(None, 401, now())).await.unwrap();

        let today = now().date_naive();
        assert_eq!(store.count_for_day(a.id, today).await.unwrap(), 2);
        assert_eq!(store.count_for_day(b.id, today).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_recent_logs_newest_first() {
        let store = GatewayStore::in_memory().unwrap();
        let a = create_client(&store, "A").await;

        for status in [200u16, 201, 204] {
            store.append(&log_entry(Some(a.id), status, now())).await.unwrap();
        }

        let recent = store.recent_for_client(a.id, 2).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].status_code, 204);
        assert_eq!(recent[1].status_code, 201);
        assert_eq!(recent[0].response_time_ms, 3.5);
    }

    #[tokio::test]
    async fn test_webhook_uniqueness() {
        let store = GatewayStore::in_memory().unwrap();
        let client = create_client(&store, "A").await;

        let hook = NewWebhook::new(
            client.id,
            WebhookEvent::AppointmentCreated,
            "https://partner.example/hooks",
        )
        .unwrap();
        let created = store.insert_webhook(&hook, now()).await.unwrap();
        assert!(created.is_active);
        assert_eq!(created.success_count, 0);

        let duplicate = NewWebhook::new(
            client.id,
            WebhookEvent::AppointmentCreated,
            "https://partner.example/hooks",
        )
        .unwrap();
        assert!(matches!(
            store.insert_webhook(&duplicate, now()).await,
            Err(StoreError::Conflict(_))
        ));

        // Same URL, different event is a separate subscription
        let other_event = NewWebhook::new(
            client.id,
            WebhookEvent::AppointmentCancelled,
            "https://partner.example/hooks",
        )
        .unwrap();
        store.insert_webhook(&other_event, now()).await.unwrap();
        assert_eq!(store.list_webhooks(client.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_webhook_for_unknown_client() {
        let store = GatewayStore::in_memory().unwrap();
        let hook =
            NewWebhook::new(77, WebhookEvent::PatientCreated, "https://x.example/").unwrap();
        assert!(matches!(
            store.insert_webhook(&hook, now()).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_webhook_toggle_and_delivery_counters() {
        let store = GatewayStore::in_memory().unwrap();
        let client = create_client(&store, "A").await;
        let hook = store
            .insert_webhook(
                &NewWebhook::new(client.id, WebhookEvent::LabResultReady, "https://x.example/")
                    .unwrap(),
                now(),
            )
            .await
            .unwrap();

        let toggled = store.set_webhook_active(hook.id, false).await.unwrap();
        assert!(!toggled.is_active);

        store
            .record_delivery(hook.id, &DeliveryOutcome::Success, now())
            .await
            .unwrap();
        let after = store
            .record_delivery(
                hook.id,
                &DeliveryOutcome::Failure("connection refused".to_string()),
                now(),
            )
            .await
            .unwrap();

        assert_eq!(after.success_count, 1);
        assert_eq!(after.failure_count, 1);
        assert_eq!(after.last_error.as_deref(), Some("connection refused"));
        assert_eq!(after.last_delivery_at, Some(now()));

        assert!(store.delete_webhook(hook.id).await.unwrap());
        assert!(!store.delete_webhook(hook.id).await.unwrap());
        assert!(store.get_webhook(hook.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_on_disk_database_persists() {
        let temp_dir = tempfile::tempdir().unwrap();
        let db_path = temp_dir.path().join("nested").join("gateway.db");

        let public_key = {
            let store = GatewayStore::new(&db_path).unwrap();
            create_client(&store, "Persistent").await.public_key
        };

        let reopened = GatewayStore::new(&db_path).unwrap();
        let found = reopened.find_by_public_key(&public_key).await.unwrap();
        assert_eq!(found.map(|c| c.name), Some("Persistent".to_string()));
    }
}
