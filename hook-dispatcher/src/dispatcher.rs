use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use metrics::{counter, histogram};
use reqwest::header;
use serde_json::json;
use tracing::{debug, warn};

use tracker_common::events::{Event, EventBus, EventKind};
use tracker_common::webhook::{Webhook, WebhookStore};

use crate::error::DeliveryError;
use crate::retry::RetryPolicy;

/// Default per-request timeout for outbound deliveries.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(3);

/// Best-effort outbound delivery of bus events to registered webhooks.
///
/// Every delivery chain runs on its own spawned task: the publisher only pays
/// for the registration lookup and the spawn, never for endpoint latency or
/// backoff sleeps. Chains still in flight at shutdown are abandoned, bounded
/// by the retry cap and the request timeout. There is no dead-letter queue,
/// exhausted deliveries are dropped with a log line.
#[derive(Clone)]
pub struct WebhookDispatcher {
    webhooks: Arc<dyn WebhookStore + Send + Sync>,
    client: reqwest::Client,
    policy: RetryPolicy,
}

impl WebhookDispatcher {
    pub fn new(
        webhooks: Arc<dyn WebhookStore + Send + Sync>,
        policy: RetryPolicy,
        request_timeout: Duration,
    ) -> Self {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .user_agent("Tracker Webhook Dispatcher")
            .timeout(request_timeout)
            .build()
            .expect("failed to construct reqwest client for webhook delivery");

        Self {
            webhooks,
            client,
            policy,
        }
    }

    /// Registers the dispatcher on the bus for every event kind.
    ///
    /// Filtering on a webhook's subscribed kinds happens at dispatch time,
    /// against the store, so registrations added after startup are picked up
    /// without a rewire.
    pub async fn attach(self: &Arc<Self>, bus: &EventBus) {
        for kind in EventKind::ALL {
            let dispatcher = Arc::clone(self);
            bus.subscribe(
                kind,
                Arc::new(move |event| {
                    let dispatcher = Arc::clone(&dispatcher);
                    Box::pin(async move { dispatcher.dispatch(event).await })
                }),
            )
            .await;
        }
    }

    /// Fans one event out to every active, subscribed webhook. Returns once
    /// the delivery tasks are spawned, not once they complete.
    pub async fn dispatch(&self, event: Event) {
        let webhooks = match self.webhooks.find_active_by_event(event.kind).await {
            Ok(webhooks) => webhooks,
            Err(error) => {
                warn!("failed to look up webhooks for {}: {}", event.kind, error);
                return;
            }
        };
        if webhooks.is_empty() {
            return;
        }

        let body = json!({
            "event": event.kind,
            "timestamp": Utc::now(),
            "data": event.data,
        })
        .to_string();

        for webhook in webhooks {
            let dispatcher = self.clone();
            let kind = event.kind;
            let body = body.clone();
            tokio::spawn(async move {
                dispatcher.deliver(&webhook, kind, body).await;
            });
        }
    }

    /// Runs the full attempt chain against one endpoint. The first 2xx is
    /// recorded on the registration and stops the chain. Terminal failures
    /// stop it early, everything else sleeps the backoff and tries again,
    /// with the sleep running after the final failure as well.
    async fn deliver(&self, webhook: &Webhook, kind: EventKind, body: String) {
        let labels = [("event", kind.to_string())];

        for attempt in 0..=self.policy.retries() {
            let started = tokio::time::Instant::now();
            let result = self.send(&webhook.url, &body).await;
            let elapsed = started.elapsed().as_secs_f64();

            match result {
                Ok(()) => {
                    counter!("webhook_deliveries_completed", &labels).increment(1);
                    histogram!("webhook_delivery_duration_seconds", &labels).record(elapsed);
                    if let Err(error) = self.webhooks.record_delivery(webhook.id, Utc::now()).await
                    {
                        warn!(
                            "failed to record delivery for webhook {}: {}",
                            webhook.id, error
                        );
                    }
                    return;
                }
                Err(error) if !error.retryable() => {
                    counter!("webhook_deliveries_failed", &labels).increment(1);
                    warn!("abandoning delivery to webhook {}: {}", webhook.id, error);
                    return;
                }
                Err(error) => {
                    if attempt < self.policy.retries() {
                        counter!("webhook_deliveries_retried", &labels).increment(1);
                        debug!(
                            "webhook {} attempt {} failed, will retry: {}",
                            webhook.id,
                            attempt + 1,
                            error
                        );
                    } else {
                        counter!("webhook_deliveries_failed", &labels).increment(1);
                        warn!(
                            "webhook {} failed after {} attempts: {}",
                            webhook.id,
                            attempt + 1,
                            error
                        );
                    }
                    tokio::time::sleep(self.policy.backoff(attempt)).await;
                }
            }
        }
    }

    async fn send(&self, url: &str, body: &str) -> Result<(), DeliveryError> {
        let url: reqwest::Url = url.parse().map_err(DeliveryError::ParseUrlError)?;

        let response = self
            .client
            .post(url)
            .body(body.to_owned())
            .send()
            .await
            .map_err(|error| {
                if error.is_timeout() {
                    DeliveryError::Timeout(error)
                } else {
                    DeliveryError::Request(error)
                }
            })?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(DeliveryError::Status(status))
        }
    }
}
