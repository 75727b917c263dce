use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::Sha256;
use tokio::sync::watch;
use uuid::Uuid;

use crate::config::WebhookConfig;
use crate::domain::webhook::{
    CreateWebhookEndpoint, DeliveryStatus, EventEnvelope, UpdateWebhookEndpoint, WebhookDelivery,
    WebhookEndpoint, ENVELOPE_VERSION,
};
use crate::error::{CoreError, Result};
use crate::repo::store::WebhookStore;

type HmacSha256 = Hmac<Sha256>;

const RESPONSE_BODY_LIMIT: usize = 1000;

/// Lowercase hex HMAC-SHA-256 of `payload` under `secret`.
pub fn sign_payload(secret: &str, payload: &str) -> Result<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| CoreError::Validation("webhook secret cannot be used as an HMAC key".to_string()))?;
    mac.update(payload.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Constant-time check of a hex signature, as a receiver would do it.
pub fn verify_signature(secret: &str, payload: &str, signature: &str) -> bool {
    let Ok(expected) = hex::decode(signature) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(payload.as_bytes());
    mac.verify_slice(&expected).is_ok()
}

/// Delay after the `attempt_count`-th failed attempt: 1, 2, 4, 8, 16 ... minutes.
pub fn webhook_retry_delay(attempt_count: i32) -> Duration {
    let exponent = (attempt_count - 1).clamp(0, 20) as u32;
    Duration::minutes(1_i64 << exponent)
}

fn generate_secret() -> String {
    let bytes: [u8; 16] = rand::thread_rng().gen();
    format!("whsec_{}", hex::encode(bytes))
}

fn validate_url(url: &str) -> Result<()> {
    let parsed = reqwest::Url::parse(url)
        .map_err(|e| CoreError::Validation(format!("invalid webhook url {url}: {e}")))?;
    if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
        return Err(CoreError::Validation(format!(
            "webhook url must be an absolute http(s) url, got {url}"
        )));
    }
    Ok(())
}

fn validate_events(events: &[String]) -> Result<()> {
    if events.is_empty() {
        return Err(CoreError::Validation("at least one event type is required".to_string()));
    }
    if events.iter().any(|e| e.trim().is_empty()) {
        return Err(CoreError::Validation("event types must not be blank".to_string()));
    }
    Ok(())
}

#[derive(Clone)]
pub struct WebhookDispatcher {
    store: Arc<dyn WebhookStore>,
    client: reqwest::Client,
    config: WebhookConfig,
}

impl WebhookDispatcher {
    pub fn new(store: Arc<dyn WebhookStore>, config: WebhookConfig) -> Self {
        Self {
            store,
            client: reqwest::Client::new(),
            config,
        }
    }

    pub async fn create_endpoint(&self, req: CreateWebhookEndpoint) -> Result<WebhookEndpoint> {
        if req.merchant_id.trim().is_empty() {
            return Err(CoreError::Validation("merchant id is required".to_string()));
        }
        validate_url(&req.url)?;
        validate_events(&req.events)?;

        let now = Utc::now();
        let endpoint = WebhookEndpoint {
            id: Uuid::new_v4(),
            merchant_id: req.merchant_id,
            url: req.url,
            secret: req
                .secret
                .filter(|s| !s.trim().is_empty())
                .unwrap_or_else(generate_secret),
            events: req.events,
            active: true,
            version: ENVELOPE_VERSION.to_string(),
            description: req.description,
            created_at: now,
            updated_at: now,
        };
        self.store.insert_endpoint(&endpoint).await?;

        tracing::info!(endpoint_id = %endpoint.id, merchant_id = %endpoint.merchant_id, "webhook endpoint created");
        Ok(endpoint)
    }

    pub async fn get_endpoint(&self, id: Uuid) -> Result<WebhookEndpoint> {
        self.store
            .get_endpoint(id)
            .await?
            .ok_or_else(|| CoreError::not_found("webhook endpoint", id))
    }

    pub async fn list_endpoints(&self, merchant_id: &str) -> Result<Vec<WebhookEndpoint>> {
        Ok(self.store.endpoints_for_merchant(merchant_id).await?)
    }

    pub async fn update_endpoint(&self, id: Uuid, update: UpdateWebhookEndpoint) -> Result<WebhookEndpoint> {
        let mut endpoint = self.get_endpoint(id).await?;

        if let Some(url) = update.url {
            validate_url(&url)?;
            endpoint.url = url;
        }
        if let Some(events) = update.events {
            validate_events(&events)?;
            endpoint.events = events;
        }
        if let Some(active) = update.active {
            endpoint.active = active;
        }
        if update.description.is_some() {
            endpoint.description = update.description;
        }
        endpoint.updated_at = Utc::now();

        if !self.store.update_endpoint(&endpoint).await? {
            return Err(CoreError::not_found("webhook endpoint", id));
        }
        Ok(endpoint)
    }

    pub async fn delete_endpoint(&self, id: Uuid) -> Result<()> {
        if !self.store.delete_endpoint(id).await? {
            return Err(CoreError::not_found("webhook endpoint", id));
        }
        tracing::info!(endpoint_id = %id, "webhook endpoint deleted");
        Ok(())
    }

    /// Creates one signed delivery per subscribed active endpoint without
    /// attempting any of them. New rows are leased so the retry scheduler
    /// leaves them to the caller unless the caller never gets to them.
    pub async fn enqueue(
        &self,
        merchant_id: &str,
        event_type: &str,
        data: serde_json::Value,
        event_id: Uuid,
        created_at: DateTime<Utc>,
    ) -> Result<Vec<WebhookDelivery>> {
        let endpoints = self.store.active_endpoints_for_event(merchant_id, event_type).await?;
        if endpoints.is_empty() {
            tracing::debug!(merchant_id, event_type, "no webhook endpoints subscribed");
            return Ok(Vec::new());
        }

        let envelope = EventEnvelope::new(event_id, event_type, created_at, data);
        let payload = serde_json::to_string(&envelope).map_err(anyhow::Error::from)?;

        let now = Utc::now();
        let mut deliveries = Vec::with_capacity(endpoints.len());
        for endpoint in &endpoints {
            deliveries.push(WebhookDelivery {
                id: Uuid::new_v4(),
                endpoint_id: endpoint.id,
                event_id,
                event_type: event_type.to_string(),
                payload: payload.clone(),
                signature: sign_payload(&endpoint.secret, &payload)?,
                status: DeliveryStatus::Pending,
                attempt_count: 0,
                max_attempts: self.config.max_attempts,
                next_attempt_at: Some(now + self.config.lease),
                response_status: None,
                response_body: None,
                failure_reason: None,
                delivered_at: None,
                created_at: now,
                updated_at: now,
            });
        }

        let inserted = self.store.insert_deliveries(&deliveries).await?;
        tracing::info!(
            event_id = %event_id,
            event_type,
            deliveries = inserted.len(),
            "webhook deliveries created"
        );
        Ok(inserted)
    }

    /// Enqueue under a fresh event id and attempt every delivery at once.
    pub async fn trigger(
        &self,
        merchant_id: &str,
        event_type: &str,
        data: serde_json::Value,
    ) -> Result<Vec<WebhookDelivery>> {
        let deliveries = self
            .enqueue(merchant_id, event_type, data, Uuid::new_v4(), Utc::now())
            .await?;
        Ok(self.attempt_all(deliveries).await)
    }

    pub async fn attempt_all(&self, deliveries: Vec<WebhookDelivery>) -> Vec<WebhookDelivery> {
        let results = futures::future::join_all(deliveries.into_iter().map(|d| self.attempt(d))).await;
        results
            .into_iter()
            .filter_map(|r| match r {
                Ok(d) => Some(d),
                Err(err) => {
                    tracing::error!("webhook attempt bookkeeping failed: {}", err);
                    None
                }
            })
            .collect()
    }

    /// One POST to the endpoint, with the outcome recorded on the delivery.
    pub async fn attempt(&self, mut delivery: WebhookDelivery) -> Result<WebhookDelivery> {
        if delivery.status.is_terminal() {
            return Ok(delivery);
        }

        let endpoint = match self.store.get_endpoint(delivery.endpoint_id).await? {
            Some(endpoint) if endpoint.active => endpoint,
            found => {
                let reason = if found.is_some() {
                    "endpoint is inactive"
                } else {
                    "endpoint was deleted"
                };
                delivery.status = DeliveryStatus::Failed;
                delivery.failure_reason = Some(reason.to_string());
                delivery.next_attempt_at = None;
                delivery.updated_at = Utc::now();
                self.store.record_attempt(&delivery).await?;
                tracing::warn!(delivery_id = %delivery.id, reason, "webhook delivery abandoned");
                return Ok(delivery);
            }
        };

        delivery.attempt_count += 1;
        let sent = self
            .client
            .post(&endpoint.url)
            .timeout(self.config.request_timeout)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(reqwest::header::USER_AGENT, self.config.user_agent.as_str())
            .header("X-Webhook-Signature", delivery.signature.as_str())
            .header("X-Webhook-Event-Type", delivery.event_type.as_str())
            .header("X-Webhook-Event-ID", delivery.event_id.to_string())
            .header("X-Webhook-Delivery-ID", delivery.id.to_string())
            .body(delivery.payload.clone())
            .send()
            .await;

        let failure = match sent {
            Ok(resp) => {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                delivery.response_status = Some(i32::from(status.as_u16()));
                delivery.response_body = Some(body.chars().take(RESPONSE_BODY_LIMIT).collect());
                if status.is_success() {
                    None
                } else {
                    Some(format!("HTTP {}", status.as_u16()))
                }
            }
            Err(err) => Some(format!("request failed: {err}")),
        };

        let now = Utc::now();
        delivery.updated_at = now;
        match failure {
            None => {
                delivery.status = DeliveryStatus::Delivered;
                delivery.delivered_at = Some(now);
                delivery.next_attempt_at = None;
                delivery.failure_reason = None;
                tracing::info!(
                    delivery_id = %delivery.id,
                    attempt = delivery.attempt_count,
                    "webhook delivered"
                );
            }
            Some(reason) if delivery.attempt_count >= delivery.max_attempts => {
                delivery.status = DeliveryStatus::Failed;
                delivery.next_attempt_at = None;
                tracing::warn!(
                    delivery_id = %delivery.id,
                    attempts = delivery.attempt_count,
                    reason = %reason,
                    "webhook delivery failed permanently"
                );
                delivery.failure_reason = Some(reason);
            }
            Some(reason) => {
                let next = now + webhook_retry_delay(delivery.attempt_count);
                delivery.status = DeliveryStatus::Retrying;
                delivery.next_attempt_at = Some(next);
                tracing::info!(
                    delivery_id = %delivery.id,
                    attempt = delivery.attempt_count,
                    next_attempt_at = %next,
                    reason = %reason,
                    "webhook delivery scheduled for retry"
                );
                delivery.failure_reason = Some(reason);
            }
        }

        self.store.record_attempt(&delivery).await?;
        Ok(delivery)
    }

    /// Claims due deliveries and attempts them. Returns how many were claimed.
    pub async fn retry_due(&self) -> Result<usize> {
        let claimed = self
            .store
            .claim_due_deliveries(Utc::now(), self.config.lease, self.config.batch_size)
            .await?;
        let count = claimed.len();
        if count > 0 {
            tracing::info!(count, "retrying webhook deliveries");
            self.attempt_all(claimed).await;
        }
        Ok(count)
    }

    pub async fn run_retry_scheduler(&self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.retry_sweep_interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(err) = self.retry_due().await {
                        tracing::error!("webhook retry scheduler error: {}", err);
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        tracing::info!("webhook retry scheduler stopped");
    }

    pub async fn get_delivery(&self, id: Uuid) -> Result<WebhookDelivery> {
        self.store
            .get_delivery(id)
            .await?
            .ok_or_else(|| CoreError::not_found("webhook delivery", id))
    }

    pub async fn deliveries_for_endpoint(&self, endpoint_id: Uuid, limit: i64) -> Result<Vec<WebhookDelivery>> {
        Ok(self.store.deliveries_for_endpoint(endpoint_id, limit).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_each_attempt() {
        let minutes: Vec<i64> = (1..=5).map(|n| webhook_retry_delay(n).num_minutes()).collect();
        assert_eq!(minutes, vec![1, 2, 4, 8, 16]);
    }

    #[test]
    fn signature_is_hex_hmac_and_verifies() {
        let sig = sign_payload("whsec_test", r#"{"id":"1"}"#).unwrap();
        assert_eq!(sig.len(), 64);
        assert!(sig.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert!(verify_signature("whsec_test", r#"{"id":"1"}"#, &sig));
        assert!(!verify_signature("whsec_other", r#"{"id":"1"}"#, &sig));
        assert!(!verify_signature("whsec_test", r#"{"id":"2"}"#, &sig));
    }

    #[test]
    fn generated_secrets_are_prefixed_and_random() {
        let a = generate_secret();
        let b = generate_secret();
        assert!(a.starts_with("whsec_"));
        assert_eq!(a.len(), "whsec_".len() + 32);
        assert_ne!(a, b);
    }

    #[test]
    fn urls_must_be_http() {
        assert!(validate_url("https://merchant.example/hooks").is_ok());
        assert!(validate_url("http://localhost:9000/h").is_ok());
        assert!(validate_url("ftp://merchant.example/hooks").is_err());
        assert!(validate_url("not a url").is_err());
    }
}
