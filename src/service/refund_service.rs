use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::config::PaymentConfig;
use crate::domain::outbox::{OutboxEvent, PendingLedgerPost};
use crate::domain::payment::{to_minor_units, validate_amount, Payment, PaymentStatus};
use crate::domain::refund::{generate_refund_reference, CreateRefundRequest, Refund, RefundStatus};
use crate::domain::webhook::event_types;
use crate::error::{CoreError, Result};
use crate::rail::{with_deadline, RailClient, RailRefundRequest, RailResponse, RailStatus};
use crate::repo::store::{BeginRefund, PaymentStore, RefundOutcome, RefundStore};
use crate::service::ledger_reconciler::LedgerReconciler;
use crate::service::ledger_service::LedgerService;
use crate::service::payment_service::to_payload;

#[derive(Clone)]
pub struct RefundService {
    pub store: Arc<dyn RefundStore>,
    pub payments: Arc<dyn PaymentStore>,
    pub rail: Arc<dyn RailClient>,
    pub ledger: LedgerService,
    pub reconciler: LedgerReconciler,
    pub relay_wakeup: Arc<Notify>,
    pub config: PaymentConfig,
}

impl RefundService {
    pub async fn create_refund(&self, req: CreateRefundRequest) -> Result<Refund> {
        validate_amount(req.amount)?;
        let payment = self.load_payment(req.payment_id).await?;

        if payment.status != PaymentStatus::Succeeded {
            return Err(CoreError::StateConflict(format!(
                "payment {} is {} and cannot be refunded",
                payment.id, payment.status
            )));
        }
        if req.amount > payment.amount {
            return Err(CoreError::Validation(format!(
                "refund amount {} exceeds payment amount {}",
                req.amount, payment.amount
            )));
        }

        let now = Utc::now();
        let refund = Refund {
            id: Uuid::new_v4(),
            payment_id: payment.id,
            merchant_id: payment.merchant_id.clone(),
            amount: req.amount,
            currency: payment.currency.clone(),
            reason: req.reason.filter(|r| !r.trim().is_empty()),
            status: RefundStatus::Pending,
            refund_reference: generate_refund_reference(now),
            rail_reference: None,
            failure_code: None,
            failure_message: None,
            processed_at: None,
            created_at: now,
            updated_at: now,
        };
        let amount_minor = to_minor_units(refund.amount)?;

        match self.store.begin_refund(&refund).await? {
            BeginRefund::Started => {}
            BeginRefund::PaymentMissing => return Err(CoreError::not_found("payment", payment.id)),
            BeginRefund::PaymentNotSucceeded(status) => {
                return Err(CoreError::StateConflict(format!(
                    "payment {} is {status} and cannot be refunded",
                    payment.id
                )))
            }
            BeginRefund::CapExceeded { already_reserved } => {
                tracing::info!(
                    payment_id = %payment.id,
                    requested = %refund.amount,
                    already_reserved = %already_reserved,
                    "refund rejected by cap"
                );
                return Err(CoreError::StateConflict(format!(
                    "refund of {} exceeds the remaining refundable amount {} of payment {}",
                    refund.amount,
                    payment.amount - already_reserved,
                    payment.id
                )));
            }
        }

        if !self.store.mark_refund_processing(refund.id).await? {
            // Canceled between insert and here; the rail is never called.
            return self.get_refund(refund.id).await;
        }
        let mut refund = refund;
        refund.status = RefundStatus::Processing;

        let rail_request = RailRefundRequest {
            reference: refund.refund_reference.clone(),
            original_transaction_id: payment.rail_transaction_id.clone(),
            amount_minor,
            currency: refund.currency.clone(),
            reason: refund.reason.clone(),
        };
        let result = with_deadline(self.config.rail_timeout, self.rail.process_refund(rail_request)).await;

        match result {
            Ok(response) if response.status == RailStatus::Pending => {
                tracing::info!(refund_id = %refund.id, "rail reported refund pending");
                Ok(refund)
            }
            Ok(response) => {
                apply_rail_response(&mut refund, &response);
                self.finish(refund, &payment).await
            }
            Err(err) => {
                tracing::error!(
                    refund_id = %refund.id,
                    rail = self.rail.name(),
                    failure_kind = "transport",
                    error = %err,
                    "rail refund call failed"
                );
                mark_failed(&mut refund, "RAIL_TRANSPORT_ERROR", &err.to_string());
                self.finish(refund, &payment).await
            }
        }
    }

    pub async fn cancel_refund(&self, id: Uuid) -> Result<Refund> {
        let mut refund = self.get_refund(id).await?;
        if refund.status != RefundStatus::Pending {
            return Err(CoreError::StateConflict(format!(
                "refund {id} is {} and cannot be canceled",
                refund.status
            )));
        }

        refund.status = RefundStatus::Canceled;
        refund.updated_at = Utc::now();
        let outcome = RefundOutcome {
            event: OutboxEvent::new(&refund.merchant_id, event_types::REFUND_CANCELED, to_payload(&refund)?),
            ledger_post: None,
            refund,
        };
        if !self.store.cancel_refund(&outcome).await? {
            return Err(CoreError::StateConflict(format!("refund {id} is no longer pending")));
        }
        self.relay_wakeup.notify_one();

        tracing::info!(refund_id = %id, "refund canceled");
        Ok(outcome.refund)
    }

    pub async fn get_refund(&self, id: Uuid) -> Result<Refund> {
        self.store
            .get_refund(id)
            .await?
            .ok_or_else(|| CoreError::not_found("refund", id))
    }

    pub async fn list_refunds_for_payment(&self, payment_id: Uuid) -> Result<Vec<Refund>> {
        self.load_payment(payment_id).await?;
        Ok(self.store.refunds_for_payment(payment_id).await?)
    }

    /// Asks the rail about an in-flight refund and applies a terminal answer.
    pub async fn check_refund_status(&self, id: Uuid) -> Result<Refund> {
        let mut refund = self.get_refund(id).await?;
        if !refund.status.is_in_flight() {
            return Ok(refund);
        }

        let response = with_deadline(
            self.config.rail_timeout,
            self.rail.check_status(refund.rail_lookup_reference()),
        )
        .await
        .map_err(|e| CoreError::ExternalService(format!("rail status check failed: {e}")))?;

        match response.status {
            RailStatus::Pending => Ok(refund),
            // A recent pending refund may still be on its way to the rail.
            RailStatus::NotFound
                if refund.status == RefundStatus::Pending
                    && refund.updated_at > Utc::now() - self.config.stale_pending_after =>
            {
                Ok(refund)
            }
            RailStatus::NotFound if refund.status == RefundStatus::Pending => {
                mark_failed(&mut refund, "ABANDONED", "refund never reached the rail");
                let payment = self.load_payment(refund.payment_id).await?;
                self.finish(refund, &payment).await
            }
            RailStatus::NotFound => {
                mark_failed(&mut refund, "RAIL_NOT_FOUND", "rail has no record of this refund");
                let payment = self.load_payment(refund.payment_id).await?;
                self.finish(refund, &payment).await
            }
            RailStatus::Succeeded | RailStatus::Failed => {
                apply_rail_response(&mut refund, &response);
                let payment = self.load_payment(refund.payment_id).await?;
                self.finish(refund, &payment).await
            }
        }
    }

    /// Returns how many refunds reached a terminal state.
    pub async fn poll_in_flight_refunds(&self, limit: i64) -> Result<usize> {
        let in_flight = self.store.in_flight_refunds(limit).await?;

        let mut settled = 0;
        for refund in in_flight {
            match self.check_refund_status(refund.id).await {
                Ok(r) if !r.status.is_in_flight() => settled += 1,
                Ok(_) => {}
                Err(err) => tracing::warn!(refund_id = %refund.id, error = %err, "refund status check failed"),
            }
        }
        Ok(settled)
    }

    async fn load_payment(&self, id: Uuid) -> Result<Payment> {
        self.payments
            .get_payment(id)
            .await?
            .ok_or_else(|| CoreError::not_found("payment", id))
    }

    async fn finish(&self, refund: Refund, payment: &Payment) -> Result<Refund> {
        let succeeded = refund.status == RefundStatus::Succeeded;
        let ledger_post =
            succeeded.then(|| PendingLedgerPost::new(self.ledger.refund_transaction(&refund, payment)));
        let event_type = if succeeded {
            event_types::REFUND_SUCCEEDED
        } else {
            event_types::REFUND_FAILED
        };
        let outcome = RefundOutcome {
            event: OutboxEvent::new(&refund.merchant_id, event_type, to_payload(&refund)?),
            ledger_post,
            refund,
        };

        if !self.store.complete_refund(&outcome).await? {
            tracing::info!(refund_id = %outcome.refund.id, "refund already settled elsewhere");
            return self.get_refund(outcome.refund.id).await;
        }
        self.relay_wakeup.notify_one();

        let refund = outcome.refund;
        tracing::info!(
            refund_id = %refund.id,
            payment_id = %refund.payment_id,
            status = %refund.status,
            failure_code = ?refund.failure_code,
            "refund settled"
        );
        if succeeded {
            if let Err(err) = self.reconciler.post_now(refund.id).await {
                tracing::error!(refund_id = %refund.id, error = %err, "inline ledger post failed, left to reconciler");
            }
        }
        Ok(refund)
    }
}

fn apply_rail_response(refund: &mut Refund, response: &RailResponse) {
    if response.rail_reference.is_some() {
        refund.rail_reference = response.rail_reference.clone();
    }
    if response.success() {
        let now = Utc::now();
        refund.status = RefundStatus::Succeeded;
        refund.failure_code = None;
        refund.failure_message = None;
        refund.processed_at = Some(now);
        refund.updated_at = now;
    } else {
        tracing::warn!(refund_id = %refund.id, failure_kind = "decline", code = ?response.failure_code, "rail declined refund");
        mark_failed(
            refund,
            response.failure_code.as_deref().unwrap_or("RAIL_DECLINED"),
            response.failure_message.as_deref().unwrap_or("refund declined by rail"),
        );
    }
}

fn mark_failed(refund: &mut Refund, code: &str, message: &str) {
    let now = Utc::now();
    refund.status = RefundStatus::Failed;
    refund.failure_code = Some(code.to_string());
    refund.failure_message = Some(message.to_string());
    refund.processed_at = Some(now);
    refund.updated_at = now;
}
