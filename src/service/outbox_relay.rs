use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{watch, Notify};

use crate::config::WorkerConfig;
use crate::domain::outbox::retry_backoff;
use crate::domain::webhook::WebhookDelivery;
use crate::error::Result;
use crate::repo::store::OutboxStore;
use crate::service::webhook_dispatcher::WebhookDispatcher;

const EVENT_LEASE_SECONDS: i64 = 60;

/// Moves committed webhook events from the outbox into deliveries.
#[derive(Clone)]
pub struct OutboxRelay {
    pub outbox: Arc<dyn OutboxStore>,
    pub dispatcher: WebhookDispatcher,
    /// Orchestrators ping this after a commit so events go out without
    /// waiting for the next poll.
    pub wakeup: Arc<Notify>,
    pub poll_interval: Duration,
    pub batch_size: i64,
}

impl OutboxRelay {
    pub fn new(outbox: Arc<dyn OutboxStore>, dispatcher: WebhookDispatcher, workers: &WorkerConfig) -> Self {
        Self {
            outbox,
            dispatcher,
            wakeup: Arc::new(Notify::new()),
            poll_interval: workers.outbox_poll_interval,
            batch_size: workers.batch_size,
        }
    }

    /// Claims due events and turns each into deliveries. Returns the
    /// deliveries created; attempting them is left to the caller.
    pub async fn tick(&self) -> Result<Vec<WebhookDelivery>> {
        let now = Utc::now();
        let batch = self
            .outbox
            .claim_events(now, chrono::Duration::seconds(EVENT_LEASE_SECONDS), self.batch_size)
            .await?;
        if batch.is_empty() {
            return Ok(Vec::new());
        }

        let mut created = Vec::new();
        for event in batch {
            match self
                .dispatcher
                .enqueue(
                    &event.merchant_id,
                    &event.event_type,
                    event.payload.clone(),
                    event.id,
                    event.created_at,
                )
                .await
            {
                Ok(deliveries) => {
                    self.outbox.mark_event_published(event.id).await?;
                    created.extend(deliveries);
                }
                Err(e) => {
                    let attempts = event.attempts + 1;
                    let next_attempt_at = Utc::now() + retry_backoff(attempts);
                    self.outbox.mark_event_retry(event.id, attempts, next_attempt_at).await?;
                    tracing::warn!("enqueue failed for outbox id {}: {}", event.id, e);
                }
            }
        }

        Ok(created)
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.poll_interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = self.wakeup.notified() => {}
                _ = shutdown.changed() => break,
            }

            match self.tick().await {
                Ok(deliveries) if !deliveries.is_empty() => {
                    let dispatcher = self.dispatcher.clone();
                    tokio::spawn(async move {
                        dispatcher.attempt_all(deliveries).await;
                    });
                }
                Ok(_) => {}
                Err(err) => tracing::error!("outbox relay error: {}", err),
            }
        }
        tracing::info!("outbox relay stopped");
    }
}
