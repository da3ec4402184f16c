use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::events::EventKind;
use crate::store::StoreError;

/// An HTTP endpoint registered to receive event payloads.
#[derive(Debug, Clone, Serialize)]
pub struct Webhook {
    pub id: Uuid,
    pub url: String,
    /// The event kinds this endpoint subscribed to.
    pub events: Vec<EventKind>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    /// Last time a delivery to this endpoint got a 2xx back.
    pub last_delivered_at: Option<DateTime<Utc>>,
}

impl Webhook {
    pub fn new(url: impl Into<String>, events: Vec<EventKind>) -> Self {
        Self {
            id: Uuid::now_v7(),
            url: url.into(),
            events,
            active: true,
            created_at: Utc::now(),
            last_delivered_at: None,
        }
    }

    pub fn subscribes_to(&self, kind: EventKind) -> bool {
        self.events.contains(&kind)
    }
}

/// Storage for webhook registrations.
#[async_trait]
pub trait WebhookStore {
    async fn register(&self, webhook: Webhook) -> Result<Webhook, StoreError>;
    async fn unregister(&self, id: Uuid) -> Result<(), StoreError>;
    async fn all(&self) -> Result<Vec<Webhook>, StoreError>;

    /// Active webhooks subscribed to the given event kind.
    async fn find_active_by_event(&self, kind: EventKind) -> Result<Vec<Webhook>, StoreError>;

    /// Record a successful delivery. Unknown ids are ignored.
    async fn record_delivery(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError>;
}

#[derive(Default)]
pub struct MemoryWebhookStore {
    webhooks: Mutex<HashMap<Uuid, Webhook>>,
}

impl MemoryWebhookStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl WebhookStore for MemoryWebhookStore {
    async fn register(&self, webhook: Webhook) -> Result<Webhook, StoreError> {
        let mut webhooks = self.webhooks.lock().unwrap();
        webhooks.insert(webhook.id, webhook.clone());
        Ok(webhook)
    }

    async fn unregister(&self, id: Uuid) -> Result<(), StoreError> {
        let mut webhooks = self.webhooks.lock().unwrap();
        webhooks.remove(&id);
        Ok(())
    }

    async fn all(&self) -> Result<Vec<Webhook>, StoreError> {
        let webhooks = self.webhooks.lock().unwrap();
        Ok(webhooks.values().cloned().collect())
    }

    async fn find_active_by_event(&self, kind: EventKind) -> Result<Vec<Webhook>, StoreError> {
        let webhooks = self.webhooks.lock().unwrap();
        Ok(webhooks
            .values()
            .filter(|webhook| webhook.active && webhook.subscribes_to(kind))
            .cloned()
            .collect())
    }

    async fn record_delivery(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut webhooks = self.webhooks.lock().unwrap();
        if let Some(webhook) = webhooks.get_mut(&id) {
            webhook.last_delivered_at = Some(at);
        }
        Ok(())
    }
}
