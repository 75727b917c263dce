#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use payments_core::config::{PaymentConfig, RiskConfig, WorkerConfig};
use payments_core::domain::intent::{CreatePaymentIntentRequest, PaymentIntent};
use payments_core::domain::ledger::FeeSchedule;
use payments_core::domain::payment::{CreatePaymentRequest, Payment};
use payments_core::rail::mock::MockRail;
use payments_core::repo::memory::MemoryStore;
use payments_core::service::ledger_reconciler::LedgerReconciler;
use payments_core::service::ledger_service::LedgerService;
use payments_core::service::payment_service::PaymentService;
use payments_core::service::refund_service::RefundService;
use payments_core::service::risk_service::RiskService;
use rust_decimal::Decimal;
use tokio::sync::Notify;
use uuid::Uuid;

pub const PAYER: &str = "alice@okbank";
pub const PAYEE: &str = "shop@okbank";

pub struct Harness {
    pub store: MemoryStore,
    pub rail: Arc<MockRail>,
    pub ledger: LedgerService,
    pub reconciler: LedgerReconciler,
    pub payments: PaymentService,
    pub refunds: RefundService,
}

pub fn harness(rail: MockRail) -> Harness {
    harness_on(MemoryStore::new(), rail)
}

/// Services over an existing store, so a second rail behavior can act on
/// records the first one created.
pub fn harness_on(store: MemoryStore, rail: MockRail) -> Harness {
    let shared = Arc::new(store.clone());
    let rail = Arc::new(rail);
    let ledger = LedgerService::new(shared.clone(), FeeSchedule::default());
    let risk = RiskService::new(shared.clone(), shared.clone(), RiskConfig::default());
    let reconciler = LedgerReconciler::new(shared.clone(), ledger.clone(), &WorkerConfig::default());
    let wakeup = Arc::new(Notify::new());
    let config = PaymentConfig {
        rail_timeout: Duration::from_secs(2),
        ..PaymentConfig::default()
    };

    let payments = PaymentService {
        store: shared.clone(),
        rail: rail.clone(),
        risk,
        ledger: ledger.clone(),
        reconciler: reconciler.clone(),
        relay_wakeup: wakeup.clone(),
        config: config.clone(),
    };
    let refunds = RefundService {
        store: shared.clone(),
        payments: shared,
        rail: rail.clone(),
        ledger: ledger.clone(),
        reconciler: reconciler.clone(),
        relay_wakeup: wakeup,
        config,
    };

    Harness {
        store,
        rail,
        ledger,
        reconciler,
        payments,
        refunds,
    }
}

pub fn intent_request(amount: Decimal) -> CreatePaymentIntentRequest {
    CreatePaymentIntentRequest {
        merchant_id: "merchant_1".to_string(),
        amount,
        customer_id: Some("cust_1".to_string()),
        ..CreatePaymentIntentRequest::default()
    }
}

pub fn payment_request(intent_id: Uuid) -> CreatePaymentRequest {
    CreatePaymentRequest {
        intent_id,
        payer_id: PAYER.to_string(),
        payee_id: PAYEE.to_string(),
        device_id: Some("device-1".to_string()),
        ip_address: Some("203.0.113.9".to_string()),
        user_agent: Some("integration-test".to_string()),
    }
}

impl Harness {
    pub async fn open_intent(&self, amount: Decimal) -> PaymentIntent {
        self.payments
            .create_payment_intent(intent_request(amount))
            .await
            .unwrap()
    }

    pub async fn paid(&self, amount: Decimal) -> Payment {
        let intent = self.open_intent(amount).await;
        self.payments
            .create_payment(payment_request(intent.id))
            .await
            .unwrap()
    }
}
