use std::time::Duration;

use tokio::sync::watch;

use crate::config::WorkerConfig;
use crate::service::payment_service::PaymentService;
use crate::service::refund_service::RefundService;

/// Drives rail status queries for refunds in flight and payments stuck in
/// `processing`.
#[derive(Clone)]
pub struct StatusPoller {
    pub payments: PaymentService,
    pub refunds: RefundService,
    pub interval: Duration,
    pub stale_after: chrono::Duration,
    pub batch_size: i64,
}

impl StatusPoller {
    pub fn new(payments: PaymentService, refunds: RefundService, workers: &WorkerConfig) -> Self {
        Self {
            payments,
            refunds,
            interval: workers.status_poll_interval,
            stale_after: workers.stale_payment_after,
            batch_size: workers.batch_size,
        }
    }

    /// Returns `(refunds settled, payments settled)`.
    pub async fn tick(&self) -> (usize, usize) {
        let refunds = match self.refunds.poll_in_flight_refunds(self.batch_size).await {
            Ok(n) => n,
            Err(err) => {
                tracing::error!("refund status poll error: {}", err);
                0
            }
        };
        let payments = match self
            .payments
            .reconcile_stale_payments(self.stale_after, self.batch_size)
            .await
        {
            Ok(n) => n,
            Err(err) => {
                tracing::error!("stale payment reconcile error: {}", err);
                0
            }
        };
        (refunds, payments)
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let (refunds, payments) = self.tick().await;
                    if refunds + payments > 0 {
                        tracing::info!(refunds, payments, "status poller settled records");
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        tracing::info!("status poller stopped");
    }
}
