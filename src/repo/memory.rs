//! In-process implementation of every storage seam. Each trait method takes
//! the single write lock, so multi-record transitions are atomic.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::domain::idempotency::{IdempotencyBegin, IdempotencyRecord, IdempotencyState};
use crate::domain::intent::{IntentStatus, PaymentIntent};
use crate::domain::ledger::LedgerEntry;
use crate::domain::outbox::{LedgerPostStatus, OutboxEvent, OutboxStatus, PendingLedgerPost};
use crate::domain::payment::{Payment, PaymentStatus};
use crate::domain::refund::{Refund, RefundStatus};
use crate::domain::risk::RiskAssessment;
use crate::domain::webhook::{DeliveryStatus, WebhookDelivery, WebhookEndpoint};
use crate::repo::store::{
    BeginPayment, BeginRefund, IdempotencyStore, LedgerStore, OutboxStore, PaymentOutcome,
    PaymentStore, RefundOutcome, RefundStore, RiskHistory, RiskStore, WebhookStore,
};
use crate::risk::types::{MerchantOutcomes, VelocityScope};

#[derive(Default)]
struct MemoryState {
    intents: HashMap<Uuid, PaymentIntent>,
    payments: HashMap<Uuid, Payment>,
    refunds: HashMap<Uuid, Refund>,
    assessments: HashMap<Uuid, RiskAssessment>,
    ledger_transactions: BTreeMap<Uuid, String>,
    ledger_entries: Vec<LedgerEntry>,
    endpoints: HashMap<Uuid, WebhookEndpoint>,
    deliveries: HashMap<Uuid, WebhookDelivery>,
    events: HashMap<Uuid, OutboxEvent>,
    ledger_posts: HashMap<Uuid, PendingLedgerPost>,
    idempotency: HashMap<String, IdempotencyRecord>,
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Outbox events in commit order, for inspection.
    pub async fn outbox_events(&self) -> Vec<OutboxEvent> {
        let state = self.inner.read().await;
        let mut events: Vec<OutboxEvent> = state.events.values().cloned().collect();
        events.sort_by_key(|e| e.created_at);
        events
    }

    pub async fn ledger_entry_count(&self) -> usize {
        self.inner.read().await.ledger_entries.len()
    }
}

fn sorted_by_created<T, F>(mut items: Vec<T>, key: F) -> Vec<T>
where
    F: Fn(&T) -> DateTime<Utc>,
{
    items.sort_by_key(|item| key(item));
    items
}

fn limit_of(limit: i64) -> usize {
    usize::try_from(limit.max(0)).unwrap_or(usize::MAX)
}

#[async_trait::async_trait]
impl LedgerStore for MemoryStore {
    async fn append_transaction(
        &self,
        transaction_id: Uuid,
        description: &str,
        entries: &[LedgerEntry],
    ) -> Result<bool> {
        let mut state = self.inner.write().await;
        if state.ledger_transactions.contains_key(&transaction_id) {
            return Ok(false);
        }
        state
            .ledger_transactions
            .insert(transaction_id, description.to_string());
        state.ledger_entries.extend_from_slice(entries);
        Ok(true)
    }

    async fn entries_for_account(&self, account_id: &str, currency: &str) -> Result<Vec<LedgerEntry>> {
        let state = self.inner.read().await;
        Ok(state
            .ledger_entries
            .iter()
            .filter(|e| e.account_id == account_id && e.currency == currency)
            .cloned()
            .collect())
    }

    async fn entries_for_transaction(&self, transaction_id: Uuid) -> Result<Vec<LedgerEntry>> {
        let state = self.inner.read().await;
        Ok(state
            .ledger_entries
            .iter()
            .filter(|e| e.transaction_id == transaction_id)
            .cloned()
            .collect())
    }

    async fn transaction_ids(&self) -> Result<Vec<Uuid>> {
        let state = self.inner.read().await;
        Ok(state.ledger_transactions.keys().copied().collect())
    }
}

#[async_trait::async_trait]
impl PaymentStore for MemoryStore {
    async fn insert_intent(&self, intent: &PaymentIntent, event: &OutboxEvent) -> Result<()> {
        let mut state = self.inner.write().await;
        if state.intents.contains_key(&intent.id) {
            anyhow::bail!("payment intent {} already exists", intent.id);
        }
        state.intents.insert(intent.id, intent.clone());
        state.events.insert(event.id, event.clone());
        Ok(())
    }

    async fn get_intent(&self, id: Uuid) -> Result<Option<PaymentIntent>> {
        Ok(self.inner.read().await.intents.get(&id).cloned())
    }

    async fn expire_intent(&self, id: Uuid) -> Result<bool> {
        let mut state = self.inner.write().await;
        match state.intents.get_mut(&id) {
            Some(intent) if intent.status == IntentStatus::Created => {
                intent.status = IntentStatus::Expired;
                intent.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn cancel_intent(&self, id: Uuid, event: &OutboxEvent) -> Result<bool> {
        let mut state = self.inner.write().await;
        let in_flight = state
            .payments
            .values()
            .any(|p| p.intent_id == id && !p.status.is_terminal());
        if in_flight {
            return Ok(false);
        }
        match state.intents.get_mut(&id) {
            Some(intent) if intent.status == IntentStatus::Created => {
                intent.status = IntentStatus::Canceled;
                intent.updated_at = Utc::now();
            }
            _ => return Ok(false),
        }
        state.events.insert(event.id, event.clone());
        Ok(true)
    }

    async fn begin_payment(&self, payment: &Payment) -> Result<BeginPayment> {
        let mut state = self.inner.write().await;
        let Some(intent) = state.intents.get(&payment.intent_id) else {
            return Ok(BeginPayment::IntentMissing);
        };
        if intent.status != IntentStatus::Created {
            return Ok(BeginPayment::IntentNotOpen(intent.status));
        }
        let blocked = state
            .payments
            .values()
            .any(|p| p.intent_id == payment.intent_id && p.status != PaymentStatus::Failed);
        if blocked {
            return Ok(BeginPayment::AlreadyInFlight);
        }
        let mut row = payment.clone();
        row.status = PaymentStatus::Pending;
        state.payments.insert(row.id, row);
        Ok(BeginPayment::Started)
    }

    async fn mark_payment_processing(&self, id: Uuid) -> Result<bool> {
        let mut state = self.inner.write().await;
        match state.payments.get_mut(&id) {
            Some(p) if p.status == PaymentStatus::Pending => {
                p.status = PaymentStatus::Processing;
                p.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn complete_payment(&self, outcome: &PaymentOutcome) -> Result<bool> {
        let mut state = self.inner.write().await;
        let payment = &outcome.payment;
        match state.payments.get(&payment.id) {
            Some(existing) if !existing.status.is_terminal() => {}
            _ => return Ok(false),
        }
        state.payments.insert(payment.id, payment.clone());

        if payment.status == PaymentStatus::Succeeded {
            if let Some(intent) = state.intents.get_mut(&payment.intent_id) {
                if matches!(intent.status, IntentStatus::Created | IntentStatus::Expired) {
                    intent.status = IntentStatus::Succeeded;
                    intent.updated_at = Utc::now();
                }
            }
        }
        if let Some(post) = &outcome.ledger_post {
            state.ledger_posts.entry(post.id()).or_insert_with(|| post.clone());
        }
        state.events.insert(outcome.event.id, outcome.event.clone());
        Ok(true)
    }

    async fn get_payment(&self, id: Uuid) -> Result<Option<Payment>> {
        Ok(self.inner.read().await.payments.get(&id).cloned())
    }

    async fn payments_for_intent(&self, intent_id: Uuid) -> Result<Vec<Payment>> {
        let state = self.inner.read().await;
        let payments = state
            .payments
            .values()
            .filter(|p| p.intent_id == intent_id)
            .cloned()
            .collect();
        Ok(sorted_by_created(payments, |p: &Payment| p.created_at))
    }

    async fn stale_in_flight_payments(&self, updated_before: DateTime<Utc>, limit: i64) -> Result<Vec<Payment>> {
        let state = self.inner.read().await;
        let stale = state
            .payments
            .values()
            .filter(|p| !p.status.is_terminal() && p.updated_at < updated_before)
            .cloned()
            .collect();
        Ok(sorted_by_created(stale, |p: &Payment| p.updated_at)
            .into_iter()
            .take(limit_of(limit))
            .collect())
    }
}

#[async_trait::async_trait]
impl RefundStore for MemoryStore {
    async fn begin_refund(&self, refund: &Refund) -> Result<BeginRefund> {
        let mut state = self.inner.write().await;
        let Some(payment) = state.payments.get(&refund.payment_id) else {
            return Ok(BeginRefund::PaymentMissing);
        };
        if payment.status != PaymentStatus::Succeeded {
            return Ok(BeginRefund::PaymentNotSucceeded(payment.status));
        }
        let reserved: Decimal = state
            .refunds
            .values()
            .filter(|r| r.payment_id == refund.payment_id && r.status.counts_toward_cap())
            .map(|r| r.amount)
            .sum();
        if reserved + refund.amount > payment.amount {
            return Ok(BeginRefund::CapExceeded {
                already_reserved: reserved,
            });
        }
        let mut row = refund.clone();
        row.status = RefundStatus::Pending;
        state.refunds.insert(row.id, row);
        Ok(BeginRefund::Started)
    }

    async fn mark_refund_processing(&self, id: Uuid) -> Result<bool> {
        let mut state = self.inner.write().await;
        match state.refunds.get_mut(&id) {
            Some(r) if r.status == RefundStatus::Pending => {
                r.status = RefundStatus::Processing;
                r.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn complete_refund(&self, outcome: &RefundOutcome) -> Result<bool> {
        let mut state = self.inner.write().await;
        match state.refunds.get(&outcome.refund.id) {
            Some(existing) if existing.status.is_in_flight() => {}
            _ => return Ok(false),
        }
        state.refunds.insert(outcome.refund.id, outcome.refund.clone());
        if let Some(post) = &outcome.ledger_post {
            state.ledger_posts.entry(post.id()).or_insert_with(|| post.clone());
        }
        state.events.insert(outcome.event.id, outcome.event.clone());
        Ok(true)
    }

    async fn cancel_refund(&self, outcome: &RefundOutcome) -> Result<bool> {
        let mut state = self.inner.write().await;
        match state.refunds.get(&outcome.refund.id) {
            Some(existing) if existing.status == RefundStatus::Pending => {}
            _ => return Ok(false),
        }
        state.refunds.insert(outcome.refund.id, outcome.refund.clone());
        state.events.insert(outcome.event.id, outcome.event.clone());
        Ok(true)
    }

    async fn get_refund(&self, id: Uuid) -> Result<Option<Refund>> {
        Ok(self.inner.read().await.refunds.get(&id).cloned())
    }

    async fn refunds_for_payment(&self, payment_id: Uuid) -> Result<Vec<Refund>> {
        let state = self.inner.read().await;
        let refunds = state
            .refunds
            .values()
            .filter(|r| r.payment_id == payment_id)
            .cloned()
            .collect();
        Ok(sorted_by_created(refunds, |r: &Refund| r.created_at))
    }

    async fn in_flight_refunds(&self, limit: i64) -> Result<Vec<Refund>> {
        let state = self.inner.read().await;
        let refunds = state
            .refunds
            .values()
            .filter(|r| r.status.is_in_flight())
            .cloned()
            .collect();
        Ok(sorted_by_created(refunds, |r: &Refund| r.created_at)
            .into_iter()
            .take(limit_of(limit))
            .collect())
    }
}

#[async_trait::async_trait]
impl RiskStore for MemoryStore {
    async fn insert_assessment(&self, assessment: &RiskAssessment) -> Result<()> {
        let mut state = self.inner.write().await;
        state.assessments.insert(assessment.id, assessment.clone());
        Ok(())
    }

    async fn get_assessment(&self, id: Uuid) -> Result<Option<RiskAssessment>> {
        Ok(self.inner.read().await.assessments.get(&id).cloned())
    }

    async fn assessments_for_intent(&self, intent_id: Uuid) -> Result<Vec<RiskAssessment>> {
        let state = self.inner.read().await;
        let found = state
            .assessments
            .values()
            .filter(|a| a.intent_id == intent_id)
            .cloned()
            .collect();
        Ok(sorted_by_created(found, |a: &RiskAssessment| a.created_at))
    }
}

#[async_trait::async_trait]
impl RiskHistory for MemoryStore {
    async fn payments_since(&self, scope: &VelocityScope, since: DateTime<Utc>) -> Result<i64> {
        let state = self.inner.read().await;
        let count = state
            .payments
            .values()
            .filter(|p| p.created_at >= since)
            .filter(|p| match scope {
                VelocityScope::Customer(c) => p.customer_id.as_deref() == Some(c.as_str()),
                VelocityScope::Merchant(m) => p.merchant_id == *m,
            })
            .count();
        Ok(count as i64)
    }

    async fn merchant_outcomes_since(&self, merchant_id: &str, since: DateTime<Utc>) -> Result<MerchantOutcomes> {
        let state = self.inner.read().await;
        let mut outcomes = MerchantOutcomes::default();
        for p in state
            .payments
            .values()
            .filter(|p| p.merchant_id == merchant_id && p.created_at >= since)
        {
            outcomes.total += 1;
            if p.status == PaymentStatus::Failed {
                outcomes.failed += 1;
            }
        }
        Ok(outcomes)
    }
}

#[async_trait::async_trait]
impl WebhookStore for MemoryStore {
    async fn insert_endpoint(&self, endpoint: &WebhookEndpoint) -> Result<()> {
        let mut state = self.inner.write().await;
        state.endpoints.insert(endpoint.id, endpoint.clone());
        Ok(())
    }

    async fn get_endpoint(&self, id: Uuid) -> Result<Option<WebhookEndpoint>> {
        Ok(self.inner.read().await.endpoints.get(&id).cloned())
    }

    async fn endpoints_for_merchant(&self, merchant_id: &str) -> Result<Vec<WebhookEndpoint>> {
        let state = self.inner.read().await;
        let found = state
            .endpoints
            .values()
            .filter(|e| e.merchant_id == merchant_id)
            .cloned()
            .collect();
        Ok(sorted_by_created(found, |e: &WebhookEndpoint| e.created_at))
    }

    async fn update_endpoint(&self, endpoint: &WebhookEndpoint) -> Result<bool> {
        let mut state = self.inner.write().await;
        match state.endpoints.get_mut(&endpoint.id) {
            Some(existing) => {
                *existing = endpoint.clone();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete_endpoint(&self, id: Uuid) -> Result<bool> {
        Ok(self.inner.write().await.endpoints.remove(&id).is_some())
    }

    async fn active_endpoints_for_event(&self, merchant_id: &str, event_type: &str) -> Result<Vec<WebhookEndpoint>> {
        let state = self.inner.read().await;
        let found = state
            .endpoints
            .values()
            .filter(|e| e.merchant_id == merchant_id && e.active && e.subscribes_to(event_type))
            .cloned()
            .collect();
        Ok(sorted_by_created(found, |e: &WebhookEndpoint| e.created_at))
    }

    async fn insert_deliveries(&self, deliveries: &[WebhookDelivery]) -> Result<Vec<WebhookDelivery>> {
        let mut state = self.inner.write().await;
        let mut inserted = Vec::with_capacity(deliveries.len());
        for delivery in deliveries {
            let duplicate = state
                .deliveries
                .values()
                .any(|d| d.endpoint_id == delivery.endpoint_id && d.event_id == delivery.event_id);
            if duplicate {
                continue;
            }
            state.deliveries.insert(delivery.id, delivery.clone());
            inserted.push(delivery.clone());
        }
        Ok(inserted)
    }

    async fn claim_due_deliveries(&self, now: DateTime<Utc>, lease: Duration, limit: i64) -> Result<Vec<WebhookDelivery>> {
        let mut state = self.inner.write().await;
        let mut due: Vec<(DateTime<Utc>, Uuid)> = state
            .deliveries
            .values()
            .filter(|d| {
                let elapsed = d.next_attempt_at.map(|t| t <= now).unwrap_or(true);
                match d.status {
                    DeliveryStatus::Pending | DeliveryStatus::Retrying => {
                        elapsed && d.attempt_count < d.max_attempts
                    }
                    DeliveryStatus::Delivering => elapsed,
                    DeliveryStatus::Delivered | DeliveryStatus::Failed => false,
                }
            })
            .map(|d| (d.next_attempt_at.unwrap_or(d.created_at), d.id))
            .collect();
        due.sort();
        due.truncate(limit_of(limit));

        let mut claimed = Vec::with_capacity(due.len());
        for (_, id) in due {
            if let Some(d) = state.deliveries.get_mut(&id) {
                d.status = DeliveryStatus::Delivering;
                d.next_attempt_at = Some(now + lease);
                d.updated_at = now;
                claimed.push(d.clone());
            }
        }
        Ok(claimed)
    }

    async fn record_attempt(&self, delivery: &WebhookDelivery) -> Result<()> {
        let mut state = self.inner.write().await;
        state.deliveries.insert(delivery.id, delivery.clone());
        Ok(())
    }

    async fn get_delivery(&self, id: Uuid) -> Result<Option<WebhookDelivery>> {
        Ok(self.inner.read().await.deliveries.get(&id).cloned())
    }

    async fn deliveries_for_endpoint(&self, endpoint_id: Uuid, limit: i64) -> Result<Vec<WebhookDelivery>> {
        let state = self.inner.read().await;
        let found = state
            .deliveries
            .values()
            .filter(|d| d.endpoint_id == endpoint_id)
            .cloned()
            .collect();
        let mut found = sorted_by_created(found, |d: &WebhookDelivery| d.created_at);
        found.reverse();
        found.truncate(limit_of(limit));
        Ok(found)
    }
}

#[async_trait::async_trait]
impl OutboxStore for MemoryStore {
    async fn claim_events(&self, now: DateTime<Utc>, lease: Duration, limit: i64) -> Result<Vec<OutboxEvent>> {
        let mut state = self.inner.write().await;
        let mut due: Vec<(DateTime<Utc>, Uuid)> = state
            .events
            .values()
            .filter(|e| e.status != OutboxStatus::Published && e.next_attempt_at <= now)
            .map(|e| (e.created_at, e.id))
            .collect();
        due.sort();
        due.truncate(limit_of(limit));

        let mut claimed = Vec::with_capacity(due.len());
        for (_, id) in due {
            if let Some(e) = state.events.get_mut(&id) {
                e.status = OutboxStatus::Processing;
                e.next_attempt_at = now + lease;
                claimed.push(e.clone());
            }
        }
        Ok(claimed)
    }

    async fn mark_event_published(&self, id: Uuid) -> Result<()> {
        let mut state = self.inner.write().await;
        if let Some(e) = state.events.get_mut(&id) {
            e.status = OutboxStatus::Published;
            e.published_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn mark_event_retry(&self, id: Uuid, attempts: i32, next_attempt_at: DateTime<Utc>) -> Result<()> {
        let mut state = self.inner.write().await;
        if let Some(e) = state.events.get_mut(&id) {
            e.status = OutboxStatus::Pending;
            e.attempts = attempts;
            e.next_attempt_at = next_attempt_at;
        }
        Ok(())
    }

    async fn claim_ledger_posts(&self, now: DateTime<Utc>, lease: Duration, limit: i64) -> Result<Vec<PendingLedgerPost>> {
        let mut state = self.inner.write().await;
        let mut due: Vec<(DateTime<Utc>, Uuid)> = state
            .ledger_posts
            .values()
            .filter(|p| {
                matches!(p.status, LedgerPostStatus::Pending | LedgerPostStatus::Processing)
                    && p.next_attempt_at <= now
            })
            .map(|p| (p.created_at, p.id()))
            .collect();
        due.sort();
        due.truncate(limit_of(limit));

        let mut claimed = Vec::with_capacity(due.len());
        for (_, id) in due {
            if let Some(p) = state.ledger_posts.get_mut(&id) {
                p.status = LedgerPostStatus::Processing;
                p.next_attempt_at = now + lease;
                claimed.push(p.clone());
            }
        }
        Ok(claimed)
    }

    async fn claim_ledger_post(&self, id: Uuid, now: DateTime<Utc>, lease: Duration) -> Result<Option<PendingLedgerPost>> {
        let mut state = self.inner.write().await;
        match state.ledger_posts.get_mut(&id) {
            Some(p)
                if matches!(p.status, LedgerPostStatus::Pending | LedgerPostStatus::Processing)
                    && p.next_attempt_at <= now =>
            {
                p.status = LedgerPostStatus::Processing;
                p.next_attempt_at = now + lease;
                Ok(Some(p.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn mark_ledger_posted(&self, id: Uuid) -> Result<()> {
        let mut state = self.inner.write().await;
        if let Some(p) = state.ledger_posts.get_mut(&id) {
            p.status = LedgerPostStatus::Posted;
            p.posted_at = Some(Utc::now());
            p.last_error = None;
        }
        Ok(())
    }

    async fn mark_ledger_retry(&self, id: Uuid, attempts: i32, next_attempt_at: DateTime<Utc>, error: &str) -> Result<()> {
        let mut state = self.inner.write().await;
        if let Some(p) = state.ledger_posts.get_mut(&id) {
            p.status = LedgerPostStatus::Pending;
            p.attempts = attempts;
            p.next_attempt_at = next_attempt_at;
            p.last_error = Some(error.to_string());
        }
        Ok(())
    }

    async fn mark_ledger_failed(&self, id: Uuid, error: &str) -> Result<()> {
        let mut state = self.inner.write().await;
        if let Some(p) = state.ledger_posts.get_mut(&id) {
            p.status = LedgerPostStatus::Failed;
            p.last_error = Some(error.to_string());
        }
        Ok(())
    }

    async fn get_ledger_post(&self, id: Uuid) -> Result<Option<PendingLedgerPost>> {
        Ok(self.inner.read().await.ledger_posts.get(&id).cloned())
    }
}

#[async_trait::async_trait]
impl IdempotencyStore for MemoryStore {
    async fn begin(
        &self,
        key: &str,
        request_hash: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<IdempotencyBegin> {
        let mut state = self.inner.write().await;
        if let Some(existing) = state.idempotency.get(key) {
            if existing.expires_at > now {
                return Ok(IdempotencyBegin::Existing(existing.clone()));
            }
        }
        state.idempotency.insert(
            key.to_string(),
            IdempotencyRecord {
                key: key.to_string(),
                request_hash: request_hash.to_string(),
                state: IdempotencyState::InFlight,
                response_data: None,
                status_code: None,
                expires_at,
                created_at: now,
            },
        );
        Ok(IdempotencyBegin::Claimed)
    }

    async fn complete(
        &self,
        key: &str,
        request_hash: &str,
        response: &serde_json::Value,
        status_code: u16,
        expires_at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut state = self.inner.write().await;
        match state.idempotency.get_mut(key) {
            Some(record)
                if record.state == IdempotencyState::InFlight && record.request_hash == request_hash =>
            {
                record.state = IdempotencyState::Completed;
                record.response_data = Some(response.clone());
                record.status_code = Some(status_code);
                record.expires_at = expires_at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, key: &str) -> Result<()> {
        let mut state = self.inner.write().await;
        if matches!(state.idempotency.get(key), Some(r) if r.state == IdempotencyState::InFlight) {
            state.idempotency.remove(key);
        }
        Ok(())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut state = self.inner.write().await;
        let before = state.idempotency.len();
        state.idempotency.retain(|_, r| r.expires_at > now);
        Ok((before - state.idempotency.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delivery(next_attempt_at: DateTime<Utc>, status: DeliveryStatus, attempts: i32) -> WebhookDelivery {
        WebhookDelivery {
            id: Uuid::new_v4(),
            endpoint_id: Uuid::new_v4(),
            event_id: Uuid::new_v4(),
            event_type: "payment.succeeded".to_string(),
            payload: "{}".to_string(),
            signature: "sig".to_string(),
            status,
            attempt_count: attempts,
            max_attempts: 5,
            next_attempt_at: Some(next_attempt_at),
            response_status: None,
            response_body: None,
            failure_reason: None,
            delivered_at: None,
            created_at: next_attempt_at,
            updated_at: next_attempt_at,
        }
    }

    #[tokio::test]
    async fn claimed_deliveries_are_hidden_until_lease_expires() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let due = delivery(now - Duration::minutes(1), DeliveryStatus::Retrying, 1);
        let later = delivery(now + Duration::minutes(5), DeliveryStatus::Retrying, 1);
        let exhausted = delivery(now - Duration::minutes(1), DeliveryStatus::Retrying, 5);
        store
            .insert_deliveries(&[due.clone(), later, exhausted])
            .await
            .unwrap();

        let first = store.claim_due_deliveries(now, Duration::minutes(2), 10).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].id, due.id);
        assert_eq!(first[0].status, DeliveryStatus::Delivering);

        let second = store.claim_due_deliveries(now, Duration::minutes(2), 10).await.unwrap();
        assert!(second.is_empty());

        let after_lease = store
            .claim_due_deliveries(now + Duration::minutes(3), Duration::minutes(2), 10)
            .await
            .unwrap();
        assert_eq!(after_lease.len(), 1);
        assert_eq!(after_lease[0].id, due.id);
    }

    #[tokio::test]
    async fn duplicate_delivery_for_same_event_is_skipped() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let original = delivery(now, DeliveryStatus::Pending, 0);
        let mut copy = original.clone();
        copy.id = Uuid::new_v4();

        assert_eq!(store.insert_deliveries(&[original]).await.unwrap().len(), 1);
        assert!(store.insert_deliveries(&[copy]).await.unwrap().is_empty());
    }
}
