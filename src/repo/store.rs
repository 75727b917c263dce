//! Storage seams. Postgres repositories and the in-memory store implement
//! these; services only ever see the traits.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::domain::idempotency::IdempotencyBegin;
use crate::domain::intent::{IntentStatus, PaymentIntent};
use crate::domain::ledger::LedgerEntry;
use crate::domain::outbox::{OutboxEvent, PendingLedgerPost};
use crate::domain::payment::{Payment, PaymentStatus};
use crate::domain::refund::Refund;
use crate::domain::risk::RiskAssessment;
use crate::domain::webhook::{WebhookDelivery, WebhookEndpoint};
use crate::risk::types::{MerchantOutcomes, VelocityScope};

#[async_trait::async_trait]
pub trait LedgerStore: Send + Sync {
    /// Writes every entry of one transaction or none of them. Returns `false`
    /// without writing when the transaction id was already posted.
    async fn append_transaction(
        &self,
        transaction_id: Uuid,
        description: &str,
        entries: &[LedgerEntry],
    ) -> Result<bool>;

    async fn entries_for_account(&self, account_id: &str, currency: &str) -> Result<Vec<LedgerEntry>>;

    async fn entries_for_transaction(&self, transaction_id: Uuid) -> Result<Vec<LedgerEntry>>;

    async fn transaction_ids(&self) -> Result<Vec<Uuid>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BeginPayment {
    Started,
    IntentMissing,
    IntentNotOpen(IntentStatus),
    AlreadyInFlight,
}

/// Terminal payment transition plus the records that must commit with it.
#[derive(Debug, Clone)]
pub struct PaymentOutcome {
    pub payment: Payment,
    pub ledger_post: Option<PendingLedgerPost>,
    pub event: OutboxEvent,
}

#[async_trait::async_trait]
pub trait PaymentStore: Send + Sync {
    async fn insert_intent(&self, intent: &PaymentIntent, event: &OutboxEvent) -> Result<()>;

    async fn get_intent(&self, id: Uuid) -> Result<Option<PaymentIntent>>;

    /// created -> expired. `false` when the intent had already left `created`.
    async fn expire_intent(&self, id: Uuid) -> Result<bool>;

    /// created -> canceled, refused while a payment is in flight.
    async fn cancel_intent(&self, id: Uuid, event: &OutboxEvent) -> Result<bool>;

    /// Inserts the payment as `pending` when the intent is still `created` and
    /// no other payment for it is pending, processing or succeeded.
    async fn begin_payment(&self, payment: &Payment) -> Result<BeginPayment>;

    async fn mark_payment_processing(&self, id: Uuid) -> Result<bool>;

    /// `false` (and nothing written) when the payment is already terminal.
    async fn complete_payment(&self, outcome: &PaymentOutcome) -> Result<bool>;

    async fn get_payment(&self, id: Uuid) -> Result<Option<Payment>>;

    async fn payments_for_intent(&self, intent_id: Uuid) -> Result<Vec<Payment>>;

    async fn stale_in_flight_payments(&self, updated_before: DateTime<Utc>, limit: i64) -> Result<Vec<Payment>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BeginRefund {
    Started,
    PaymentMissing,
    PaymentNotSucceeded(PaymentStatus),
    CapExceeded { already_reserved: Decimal },
}

#[derive(Debug, Clone)]
pub struct RefundOutcome {
    pub refund: Refund,
    pub ledger_post: Option<PendingLedgerPost>,
    pub event: OutboxEvent,
}

#[async_trait::async_trait]
pub trait RefundStore: Send + Sync {
    /// Cap check and pending insert as one step: the payment must be
    /// `succeeded` and reserved refunds plus this one must fit its amount.
    async fn begin_refund(&self, refund: &Refund) -> Result<BeginRefund>;

    async fn mark_refund_processing(&self, id: Uuid) -> Result<bool>;

    /// Applies a terminal status from `pending`/`processing`.
    async fn complete_refund(&self, outcome: &RefundOutcome) -> Result<bool>;

    /// pending -> canceled only.
    async fn cancel_refund(&self, outcome: &RefundOutcome) -> Result<bool>;

    async fn get_refund(&self, id: Uuid) -> Result<Option<Refund>>;

    async fn refunds_for_payment(&self, payment_id: Uuid) -> Result<Vec<Refund>>;

    async fn in_flight_refunds(&self, limit: i64) -> Result<Vec<Refund>>;
}

#[async_trait::async_trait]
pub trait RiskStore: Send + Sync {
    async fn insert_assessment(&self, assessment: &RiskAssessment) -> Result<()>;

    async fn get_assessment(&self, id: Uuid) -> Result<Option<RiskAssessment>>;

    async fn assessments_for_intent(&self, intent_id: Uuid) -> Result<Vec<RiskAssessment>>;
}

/// Read-only aggregates over past payments for the risk engine.
#[async_trait::async_trait]
pub trait RiskHistory: Send + Sync {
    async fn payments_since(&self, scope: &VelocityScope, since: DateTime<Utc>) -> Result<i64>;

    async fn merchant_outcomes_since(&self, merchant_id: &str, since: DateTime<Utc>) -> Result<MerchantOutcomes>;
}

#[async_trait::async_trait]
pub trait WebhookStore: Send + Sync {
    async fn insert_endpoint(&self, endpoint: &WebhookEndpoint) -> Result<()>;

    async fn get_endpoint(&self, id: Uuid) -> Result<Option<WebhookEndpoint>>;

    async fn endpoints_for_merchant(&self, merchant_id: &str) -> Result<Vec<WebhookEndpoint>>;

    async fn update_endpoint(&self, endpoint: &WebhookEndpoint) -> Result<bool>;

    async fn delete_endpoint(&self, id: Uuid) -> Result<bool>;

    async fn active_endpoints_for_event(&self, merchant_id: &str, event_type: &str) -> Result<Vec<WebhookEndpoint>>;

    /// Inserts deliveries, skipping any (endpoint, event) pair that already
    /// exists. Returns the rows actually inserted.
    async fn insert_deliveries(&self, deliveries: &[WebhookDelivery]) -> Result<Vec<WebhookDelivery>>;

    /// Claims due `pending`/`retrying` rows and `delivering` rows whose lease
    /// ran out, marking them `delivering` until `now + lease`.
    async fn claim_due_deliveries(&self, now: DateTime<Utc>, lease: Duration, limit: i64) -> Result<Vec<WebhookDelivery>>;

    async fn record_attempt(&self, delivery: &WebhookDelivery) -> Result<()>;

    async fn get_delivery(&self, id: Uuid) -> Result<Option<WebhookDelivery>>;

    async fn deliveries_for_endpoint(&self, endpoint_id: Uuid, limit: i64) -> Result<Vec<WebhookDelivery>>;
}

#[async_trait::async_trait]
pub trait OutboxStore: Send + Sync {
    async fn claim_events(&self, now: DateTime<Utc>, lease: Duration, limit: i64) -> Result<Vec<OutboxEvent>>;

    async fn mark_event_published(&self, id: Uuid) -> Result<()>;

    async fn mark_event_retry(&self, id: Uuid, attempts: i32, next_attempt_at: DateTime<Utc>) -> Result<()>;

    async fn claim_ledger_posts(&self, now: DateTime<Utc>, lease: Duration, limit: i64) -> Result<Vec<PendingLedgerPost>>;

    async fn claim_ledger_post(&self, id: Uuid, now: DateTime<Utc>, lease: Duration) -> Result<Option<PendingLedgerPost>>;

    async fn mark_ledger_posted(&self, id: Uuid) -> Result<()>;

    async fn mark_ledger_retry(&self, id: Uuid, attempts: i32, next_attempt_at: DateTime<Utc>, error: &str) -> Result<()>;

    async fn mark_ledger_failed(&self, id: Uuid, error: &str) -> Result<()>;

    async fn get_ledger_post(&self, id: Uuid) -> Result<Option<PendingLedgerPost>>;
}

#[async_trait::async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Insert-or-fetch. A fresh or expired key is claimed as in flight until
    /// `expires_at`, which callers keep short so an abandoned claim lapses.
    async fn begin(
        &self,
        key: &str,
        request_hash: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<IdempotencyBegin>;

    /// Stores the response on an in-flight key with a matching hash and
    /// moves its expiry to `expires_at`.
    async fn complete(
        &self,
        key: &str,
        request_hash: &str,
        response: &serde_json::Value,
        status_code: u16,
        expires_at: DateTime<Utc>,
    ) -> Result<bool>;

    /// Drops an in-flight marker.
    async fn release(&self, key: &str) -> Result<()>;

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64>;
}
