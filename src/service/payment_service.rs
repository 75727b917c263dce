use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::config::PaymentConfig;
use crate::domain::context::build_context;
use crate::domain::intent::{CreatePaymentIntentRequest, IntentStatus, PaymentIntent};
use crate::domain::outbox::{OutboxEvent, PendingLedgerPost};
use crate::domain::payment::{
    to_minor_units, validate_amount, CreatePaymentRequest, Payment, PaymentStatus,
};
use crate::domain::risk::RiskDecision;
use crate::domain::webhook::event_types;
use crate::error::{CoreError, Result};
use crate::rail::{with_deadline, RailClient, RailPaymentRequest, RailResponse, RailStatus};
use crate::repo::store::{BeginPayment, PaymentOutcome, PaymentStore};
use crate::service::ledger_reconciler::LedgerReconciler;
use crate::service::ledger_service::LedgerService;
use crate::service::risk_service::RiskService;

/// Thirty days.
pub const MAX_INTENT_EXPIRY_SECONDS: i64 = 30 * 24 * 60 * 60;

#[derive(Clone)]
pub struct PaymentService {
    pub store: Arc<dyn PaymentStore>,
    pub rail: Arc<dyn RailClient>,
    pub risk: RiskService,
    pub ledger: LedgerService,
    pub reconciler: LedgerReconciler,
    pub relay_wakeup: Arc<Notify>,
    pub config: PaymentConfig,
}

impl PaymentService {
    pub async fn create_payment_intent(&self, req: CreatePaymentIntentRequest) -> Result<PaymentIntent> {
        if req.merchant_id.trim().is_empty() {
            return Err(CoreError::Validation("merchant_id is required".to_string()));
        }
        validate_amount(req.amount)?;

        let currency = match req.currency.as_deref().map(str::trim) {
            Some(c) if !c.is_empty() => c.to_uppercase(),
            _ => self.config.default_currency.clone(),
        };
        let expiry = match req.expires_in_seconds {
            Some(secs) if secs <= 0 => {
                return Err(CoreError::Validation(format!(
                    "expires_in_seconds must be positive, got {secs}"
                )))
            }
            Some(secs) if secs > MAX_INTENT_EXPIRY_SECONDS => {
                return Err(CoreError::Validation(format!(
                    "expires_in_seconds must be at most {MAX_INTENT_EXPIRY_SECONDS}, got {secs}"
                )))
            }
            Some(secs) => chrono::Duration::try_seconds(secs)
                .ok_or_else(|| CoreError::Validation(format!("expires_in_seconds out of range: {secs}")))?,
            None => self.config.intent_expiry,
        };

        let now = Utc::now();
        let expires_at = now
            .checked_add_signed(expiry)
            .ok_or_else(|| CoreError::Validation("intent expiry is out of range".to_string()))?;
        let intent = PaymentIntent {
            id: Uuid::new_v4(),
            merchant_id: req.merchant_id.trim().to_string(),
            amount: req.amount,
            currency,
            payment_method: req.payment_method.unwrap_or_default(),
            customer_id: req.customer_id.filter(|c| !c.trim().is_empty()),
            description: req.description,
            metadata: req.metadata.unwrap_or_else(|| serde_json::json!({})),
            status: IntentStatus::Created,
            expires_at,
            created_at: now,
            updated_at: now,
        };

        let event = OutboxEvent::new(&intent.merchant_id, event_types::PAYMENT_INTENT_CREATED, to_payload(&intent)?);
        self.store.insert_intent(&intent, &event).await?;
        self.relay_wakeup.notify_one();

        tracing::info!(
            intent_id = %intent.id,
            merchant_id = %intent.merchant_id,
            amount = %intent.amount,
            currency = %intent.currency,
            "payment intent created"
        );
        Ok(intent)
    }

    /// Loads an intent, flipping it to `expired` if it is observed past its expiry.
    pub async fn get_payment_intent(&self, id: Uuid) -> Result<PaymentIntent> {
        let mut intent = self
            .store
            .get_intent(id)
            .await?
            .ok_or_else(|| CoreError::not_found("payment intent", id))?;

        if intent.status == IntentStatus::Created && intent.is_expired_at(Utc::now()) {
            if self.store.expire_intent(id).await? {
                tracing::info!(intent_id = %id, "payment intent expired");
            }
            intent = self
                .store
                .get_intent(id)
                .await?
                .ok_or_else(|| CoreError::not_found("payment intent", id))?;
        }
        Ok(intent)
    }

    pub async fn cancel_payment_intent(&self, id: Uuid) -> Result<PaymentIntent> {
        let mut intent = self.get_payment_intent(id).await?;
        if intent.status != IntentStatus::Created {
            return Err(CoreError::StateConflict(format!(
                "payment intent {id} is {} and cannot be canceled",
                intent.status
            )));
        }

        intent.status = IntentStatus::Canceled;
        intent.updated_at = Utc::now();
        let event = OutboxEvent::new(&intent.merchant_id, event_types::PAYMENT_INTENT_CANCELED, to_payload(&intent)?);
        if !self.store.cancel_intent(id, &event).await? {
            return Err(CoreError::StateConflict(format!(
                "payment intent {id} has a payment in flight or is no longer open"
            )));
        }
        self.relay_wakeup.notify_one();

        tracing::info!(intent_id = %id, "payment intent canceled");
        Ok(intent)
    }

    /// Runs one payment attempt against an open intent. Rail declines and
    /// transport failures come back as `Ok` with a `failed` payment.
    pub async fn create_payment(&self, req: CreatePaymentRequest) -> Result<Payment> {
        let intent = self
            .store
            .get_intent(req.intent_id)
            .await?
            .ok_or_else(|| CoreError::not_found("payment intent", req.intent_id))?;

        if intent.status != IntentStatus::Created {
            return Err(CoreError::StateConflict(format!(
                "payment intent {} is {}",
                intent.id, intent.status
            )));
        }
        if intent.is_expired_at(Utc::now()) {
            self.store.expire_intent(intent.id).await?;
            tracing::info!(intent_id = %intent.id, "payment attempted on expired intent");
            return Err(CoreError::StateConflict(format!(
                "payment intent {} has expired",
                intent.id
            )));
        }

        self.validate_identifier("payer", &req.payer_id).await?;
        self.validate_identifier("payee", &req.payee_id).await?;

        let ctx = build_context(&intent, &req);
        let assessment = self.risk.assess(&ctx).await?;
        if assessment.decision == RiskDecision::Block {
            tracing::warn!(
                intent_id = %intent.id,
                assessment_id = %assessment.id,
                score = assessment.risk_score,
                "payment blocked by risk"
            );
            return Err(CoreError::RiskBlocked {
                assessment_id: assessment.id,
                score: assessment.risk_score,
            });
        }

        let now = Utc::now();
        let mut payment = Payment {
            id: Uuid::new_v4(),
            intent_id: intent.id,
            merchant_id: intent.merchant_id.clone(),
            customer_id: intent.customer_id.clone(),
            amount: intent.amount,
            currency: intent.currency.clone(),
            payment_method: intent.payment_method,
            payer_id: req.payer_id.trim().to_string(),
            payee_id: req.payee_id.trim().to_string(),
            status: PaymentStatus::Pending,
            rail_transaction_id: None,
            failure_code: None,
            failure_message: None,
            risk_assessment_id: Some(assessment.id),
            processed_at: None,
            created_at: now,
            updated_at: now,
        };
        let amount_minor = to_minor_units(payment.amount)?;

        match self.store.begin_payment(&payment).await? {
            BeginPayment::Started => {}
            BeginPayment::IntentMissing => return Err(CoreError::not_found("payment intent", intent.id)),
            BeginPayment::IntentNotOpen(status) => {
                return Err(CoreError::StateConflict(format!(
                    "payment intent {} is {status}",
                    intent.id
                )))
            }
            BeginPayment::AlreadyInFlight => {
                return Err(CoreError::StateConflict(format!(
                    "payment intent {} already has a payment in flight or succeeded",
                    intent.id
                )))
            }
        }
        if !self.store.mark_payment_processing(payment.id).await? {
            return Err(CoreError::StateConflict(format!(
                "payment {} left pending before the rail call",
                payment.id
            )));
        }
        payment.status = PaymentStatus::Processing;

        let rail_request = RailPaymentRequest {
            reference: payment.id.to_string(),
            amount_minor,
            currency: payment.currency.clone(),
            payer_id: payment.payer_id.clone(),
            payee_id: payment.payee_id.clone(),
            description: intent.description.clone(),
        };
        let result = with_deadline(self.config.rail_timeout, self.rail.process_payment(rail_request)).await;

        match result {
            Ok(response) if response.status == RailStatus::Pending => {
                tracing::info!(
                    payment_id = %payment.id,
                    rail = self.rail.name(),
                    "rail reported pending, left for reconciliation"
                );
                Ok(payment)
            }
            Ok(response) => {
                apply_rail_response(&mut payment, &response);
                self.finish(payment).await
            }
            Err(err) => {
                tracing::error!(
                    payment_id = %payment.id,
                    rail = self.rail.name(),
                    failure_kind = "transport",
                    error = %err,
                    "rail call failed"
                );
                mark_failed(&mut payment, "RAIL_TRANSPORT_ERROR", &err.to_string());
                self.finish(payment).await
            }
        }
    }

    pub async fn get_payment(&self, id: Uuid) -> Result<Payment> {
        self.store
            .get_payment(id)
            .await?
            .ok_or_else(|| CoreError::not_found("payment", id))
    }

    pub async fn list_payments_for_intent(&self, intent_id: Uuid) -> Result<Vec<Payment>> {
        if self.store.get_intent(intent_id).await?.is_none() {
            return Err(CoreError::not_found("payment intent", intent_id));
        }
        Ok(self.store.payments_for_intent(intent_id).await?)
    }

    /// Settles a payment left in flight by asking the rail what happened.
    /// A `pending` row never reached the rail and is failed outright.
    pub async fn reconcile_payment(&self, id: Uuid) -> Result<Payment> {
        let mut payment = self.get_payment(id).await?;
        match payment.status {
            PaymentStatus::Succeeded | PaymentStatus::Failed => Ok(payment),
            PaymentStatus::Pending => {
                mark_failed(&mut payment, "ABANDONED", "payment never reached the rail");
                self.finish(payment).await
            }
            PaymentStatus::Processing => {
                let response = with_deadline(
                    self.config.rail_timeout,
                    self.rail.check_status(&payment.id.to_string()),
                )
                .await
                .map_err(|e| CoreError::ExternalService(format!("rail status check failed: {e}")))?;

                match response.status {
                    RailStatus::Pending => Ok(payment),
                    RailStatus::NotFound => {
                        mark_failed(&mut payment, "RAIL_NOT_FOUND", "rail has no record of this payment");
                        self.finish(payment).await
                    }
                    RailStatus::Succeeded | RailStatus::Failed => {
                        apply_rail_response(&mut payment, &response);
                        self.finish(payment).await
                    }
                }
            }
        }
    }

    /// Returns how many payments reached a terminal state.
    pub async fn reconcile_stale_payments(&self, stale_after: chrono::Duration, limit: i64) -> Result<usize> {
        let stale = self
            .store
            .stale_in_flight_payments(Utc::now() - stale_after, limit)
            .await?;

        let mut settled = 0;
        for payment in stale {
            match self.reconcile_payment(payment.id).await {
                Ok(p) if p.status.is_terminal() => settled += 1,
                Ok(_) => {}
                Err(err) => tracing::warn!(payment_id = %payment.id, error = %err, "payment reconcile failed"),
            }
        }
        Ok(settled)
    }

    async fn validate_identifier(&self, role: &str, identifier: &str) -> Result<()> {
        let identifier = identifier.trim();
        if identifier.is_empty() {
            return Err(CoreError::Validation(format!("{role} identifier is required")));
        }
        let valid = with_deadline(self.config.rail_timeout, self.rail.validate_identifier(identifier))
            .await
            .map_err(|e| CoreError::ExternalService(format!("identifier validation failed: {e}")))?;
        if !valid {
            return Err(CoreError::Validation(format!(
                "invalid identifier for {role}: {identifier}"
            )));
        }
        Ok(())
    }

    /// Commits the terminal transition with its outbox records, then wakes
    /// the relay and tries the ledger post inline.
    async fn finish(&self, payment: Payment) -> Result<Payment> {
        let succeeded = payment.status == PaymentStatus::Succeeded;
        let ledger_post = succeeded.then(|| PendingLedgerPost::new(self.ledger.payment_transaction(&payment)));
        let event_type = if succeeded {
            event_types::PAYMENT_SUCCEEDED
        } else {
            event_types::PAYMENT_FAILED
        };
        let outcome = PaymentOutcome {
            event: OutboxEvent::new(&payment.merchant_id, event_type, to_payload(&payment)?),
            ledger_post,
            payment,
        };

        if !self.store.complete_payment(&outcome).await? {
            tracing::info!(payment_id = %outcome.payment.id, "payment already settled elsewhere");
            return self.get_payment(outcome.payment.id).await;
        }
        self.relay_wakeup.notify_one();

        let payment = outcome.payment;
        if succeeded {
            tracing::info!(
                payment_id = %payment.id,
                intent_id = %payment.intent_id,
                rail_transaction_id = ?payment.rail_transaction_id,
                "payment succeeded"
            );
            if let Err(err) = self.reconciler.post_now(payment.id).await {
                tracing::error!(payment_id = %payment.id, error = %err, "inline ledger post failed, left to reconciler");
            }
        } else {
            tracing::info!(
                payment_id = %payment.id,
                failure_code = ?payment.failure_code,
                "payment failed"
            );
        }
        Ok(payment)
    }
}

fn apply_rail_response(payment: &mut Payment, response: &RailResponse) {
    if response.success() {
        payment.status = PaymentStatus::Succeeded;
        if response.rail_reference.is_some() {
            payment.rail_transaction_id = response.rail_reference.clone();
        }
        payment.failure_code = None;
        payment.failure_message = None;
        let now = Utc::now();
        payment.processed_at = Some(now);
        payment.updated_at = now;
    } else {
        tracing::warn!(payment_id = %payment.id, failure_kind = "decline", code = ?response.failure_code, "rail declined payment");
        mark_failed(
            payment,
            response.failure_code.as_deref().unwrap_or("RAIL_DECLINED"),
            response.failure_message.as_deref().unwrap_or("payment declined by rail"),
        );
        if response.rail_reference.is_some() {
            payment.rail_transaction_id = response.rail_reference.clone();
        }
    }
}

fn mark_failed(payment: &mut Payment, code: &str, message: &str) {
    let now = Utc::now();
    payment.status = PaymentStatus::Failed;
    payment.failure_code = Some(code.to_string());
    payment.failure_message = Some(message.to_string());
    payment.processed_at = Some(now);
    payment.updated_at = now;
}

pub(crate) fn to_payload<T: serde::Serialize>(value: &T) -> Result<serde_json::Value> {
    Ok(serde_json::to_value(value).map_err(anyhow::Error::from)?)
}
