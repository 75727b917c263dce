use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use uuid::Uuid;

use crate::config::WorkerConfig;
use crate::domain::outbox::{retry_backoff, PendingLedgerPost};
use crate::error::{CoreError, Result};
use crate::repo::store::OutboxStore;
use crate::service::ledger_service::LedgerService;

const POST_LEASE_SECONDS: i64 = 60;

/// Posts ledger transactions owed by committed payment and refund outcomes.
#[derive(Clone)]
pub struct LedgerReconciler {
    pub outbox: Arc<dyn OutboxStore>,
    pub ledger: LedgerService,
    pub interval: Duration,
    pub batch_size: i64,
}

impl LedgerReconciler {
    pub fn new(outbox: Arc<dyn OutboxStore>, ledger: LedgerService, workers: &WorkerConfig) -> Self {
        Self {
            outbox,
            ledger,
            interval: workers.ledger_reconcile_interval,
            batch_size: workers.batch_size,
        }
    }

    fn lease() -> chrono::Duration {
        chrono::Duration::seconds(POST_LEASE_SECONDS)
    }

    /// Posts one record right away if nobody else holds it. `Ok(false)` means
    /// it was not posted now and stays with the background loop.
    pub async fn post_now(&self, transaction_id: Uuid) -> Result<bool> {
        match self
            .outbox
            .claim_ledger_post(transaction_id, Utc::now(), Self::lease())
            .await?
        {
            Some(post) => self.process(post).await,
            None => Ok(false),
        }
    }

    async fn process(&self, post: PendingLedgerPost) -> Result<bool> {
        let id = post.id();
        match self.ledger.post_transaction(&post.transaction).await {
            Ok(outcome) => {
                self.outbox.mark_ledger_posted(id).await?;
                tracing::debug!(transaction_id = %id, ?outcome, "pending ledger post settled");
                Ok(true)
            }
            Err(err @ (CoreError::Validation(_) | CoreError::LedgerImbalance { .. })) => {
                // Bad data will not get better by retrying.
                self.outbox.mark_ledger_failed(id, &err.to_string()).await?;
                tracing::error!(transaction_id = %id, error = %err, "pending ledger post dead-lettered");
                Ok(false)
            }
            Err(err) => {
                let attempts = post.attempts + 1;
                let next_attempt_at = Utc::now() + retry_backoff(attempts);
                self.outbox
                    .mark_ledger_retry(id, attempts, next_attempt_at, &err.to_string())
                    .await?;
                tracing::warn!(transaction_id = %id, attempts, error = %err, "ledger post failed, will retry");
                Ok(false)
            }
        }
    }

    /// Returns how many records were posted.
    pub async fn tick(&self) -> Result<usize> {
        let batch = self
            .outbox
            .claim_ledger_posts(Utc::now(), Self::lease(), self.batch_size)
            .await?;

        let mut posted = 0;
        for post in batch {
            if self.process(post).await? {
                posted += 1;
            }
        }
        Ok(posted)
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.tick().await {
                        Ok(0) => {}
                        Ok(posted) => tracing::info!(posted, "ledger reconciler posted transactions"),
                        Err(err) => tracing::error!("ledger reconciler error: {}", err),
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        tracing::info!("ledger reconciler stopped");
    }
}
