//! Client and webhook administration
//!
//! Every change to a client's credential state drops the cached copy so
//! the gateway sees it on the next request.

use std::sync::Arc;
use tracing::info;

use crate::access_log::AccessLogEntry;
use crate::clock::Clock;
use crate::credential_cache::CredentialCache;
use crate::credentials::{
    key_prefix, ClientCredential, ClientSummary, ClientUpdate, IssuedCredential, KeyPair,
    NewClient,
};
use crate::error::StoreError;
use crate::store::{AccessLogStore, CredentialStore, GatewayStore, WebhookStore};
use crate::webhooks::{DeliveryOutcome, NewWebhook, WebhookEvent, WebhookSubscription};

pub const DEFAULT_LOG_PAGE: usize = 50;
pub const MAX_LOG_PAGE: usize = 1000;

pub struct ClientAdmin {
    clients: Arc<dyn CredentialStore>,
    logs: Arc<dyn AccessLogStore>,
    webhooks: Arc<dyn WebhookStore>,
    credentials: Arc<CredentialCache>,
    clock: Arc<dyn Clock>,
}

fn check_limits(per_minute: Option<u32>, per_day: Option<u32>) -> Result<(), StoreError> {
    if per_minute == Some(0) {
        return Err(StoreError::Invalid(
            "rate_limit_per_minute must be greater than zero".to_string(),
        ));
    }
    if per_day == Some(0) {
        return Err(StoreError::Invalid(
            "daily_request_limit must be greater than zero".to_string(),
        ));
    }
    Ok(())
}

impl ClientAdmin {
    pub fn new(
        clients: Arc<dyn CredentialStore>,
        logs: Arc<dyn AccessLogStore>,
        webhooks: Arc<dyn WebhookStore>,
        credentials: Arc<CredentialCache>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            clients,
            logs,
            webhooks,
            credentials,
            clock,
        }
    }

    pub fn from_store(
        store: Arc<GatewayStore>,
        credentials: Arc<CredentialCache>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self::new(store.clone(), store.clone(), store, credentials, clock)
    }

    async fn require_client(&self, id: i64) -> Result<ClientCredential, StoreError> {
        self.clients
            .get_client(id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("client {}", id)))
    }

    /// Register a client and issue its key pair
    pub async fn create_client(
        &self,
        client: NewClient,
        created_by: &str,
    ) -> Result<IssuedCredential, StoreError> {
        check_limits(
            Some(client.rate_limit_per_minute),
            Some(client.daily_request_limit),
        )?;

        let keys = KeyPair::generate();
        let created = self
            .clients
            .insert_client(&client, &keys, created_by, self.clock.now())
            .await?;
        // A scan may have cached this key as unknown
        self.credentials.invalidate(&created.public_key).await;

        info!(
            "Created API client {} '{}' (key {}) by {}",
            created.id,
            created.name,
            created.key_prefix(),
            created_by
        );
        Ok(IssuedCredential {
            client: created.summary(),
            secret: created.secret,
        })
    }

    /// Replace both the public key and the secret
    pub async fn rotate_keys(&self, id: i64) -> Result<IssuedCredential, StoreError> {
        let old = self.require_client(id).await?;
        let keys = KeyPair::generate();
        let rotated = self.clients.rotate_keys(id, &keys, self.clock.now()).await?;

        self.credentials.invalidate(&old.public_key).await;
        self.credentials.invalidate(&rotated.public_key).await;

        info!(
            "Rotated keys for client {}: {} -> {}",
            id,
            key_prefix(&old.public_key),
            rotated.key_prefix()
        );
        Ok(IssuedCredential {
            client: rotated.summary(),
            secret: rotated.secret,
        })
    }

    async fn set_active(&self, id: i64, active: bool) -> Result<ClientSummary, StoreError> {
        let client = self
            .clients
            .set_client_active(id, active, self.clock.now())
            .await?;
        self.credentials.invalidate(&client.public_key).await;

        info!(
            "Client {} ({}) {}",
            id,
            client.key_prefix(),
            if active { "activated" } else { "deactivated" }
        );
        Ok(client.summary())
    }

    pub async fn deactivate(&self, id: i64) -> Result<ClientSummary, StoreError> {
        self.set_active(id, false).await
    }

    pub async fn activate(&self, id: i64) -> Result<ClientSummary, StoreError> {
        self.set_active(id, true).await
    }

    pub async fn update_client(
        &self,
        id: i64,
        update: ClientUpdate,
    ) -> Result<ClientSummary, StoreError> {
        check_limits(update.rate_limit_per_minute, update.daily_request_limit)?;

        let client = self
            .clients
            .update_client(id, &update, self.clock.now())
            .await?;
        self.credentials.invalidate(&client.public_key).await;

        info!("Updated client {} ({})", id, client.key_prefix());
        Ok(client.summary())
    }

    pub async fn get_client(&self, id: i64) -> Result<ClientSummary, StoreError> {
        Ok(self.require_client(id).await?.summary())
    }

    pub async fn list_clients(&self) -> Result<Vec<ClientSummary>, StoreError> {
        Ok(self
            .clients
            .list_clients()
            .await?
            .iter()
            .map(ClientSummary::from)
            .collect())
    }

    /// Newest entries first, `limit` clamped to [`MAX_LOG_PAGE`]
    pub async fn recent_access_logs(
        &self,
        id: i64,
        limit: usize,
    ) -> Result<Vec<AccessLogEntry>, StoreError> {
        self.require_client(id).await?;
        self.logs
            .recent_for_client(id, limit.clamp(1, MAX_LOG_PAGE))
            .await
    }

    pub async fn create_webhook(
        &self,
        client_id: i64,
        event: WebhookEvent,
        target_url: &str,
    ) -> Result<WebhookSubscription, StoreError> {
        let webhook = NewWebhook::new(client_id, event, target_url)?;
        let created = self
            .webhooks
            .insert_webhook(&webhook, self.clock.now())
            .await?;

        info!(
            "Client {} subscribed to {} at {}",
            client_id, created.event, created.target_url
        );
        Ok(created)
    }

    pub async fn set_webhook_active(
        &self,
        id: i64,
        active: bool,
    ) -> Result<WebhookSubscription, StoreError> {
        let hook = self.webhooks.set_webhook_active(id, active).await?;
        info!(
            "Webhook {} {}",
            id,
            if active { "enabled" } else { "disabled" }
        );
        Ok(hook)
    }

    /// Flip the active flag
    pub async fn toggle_webhook(&self, id: i64) -> Result<WebhookSubscription, StoreError> {
        let hook = self
            .webhooks
            .get_webhook(id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("webhook {}", id)))?;
        self.set_webhook_active(id, !hook.is_active).await
    }

    pub async fn list_webhooks(
        &self,
        client_id: i64,
    ) -> Result<Vec<WebhookSubscription>, StoreError> {
        self.require_client(client_id).await?;
        self.webhooks.list_webhooks(client_id).await
    }

    pub async fn delete_webhook(&self, id: i64) -> Result<(), StoreError> {
        if !self.webhooks.delete_webhook(id).await? {
            return Err(StoreError::NotFound(format!("webhook {}", id)));
        }
        info!("Deleted webhook {}", id);
        Ok(())
    }

    /// Counter update reported by the delivery mechanism
    pub async fn record_webhook_delivery(
        &self,
        id: i64,
        outcome: DeliveryOutcome,
    ) -> Result<WebhookSubscription, StoreError> {
        self.webhooks
            .record_delivery(id, &outcome, self.clock.now())
            .await
    }
}
