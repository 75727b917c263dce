mod common;

use common::{harness, harness_on, PAYER};
use payments_core::domain::ledger::{customer_account, merchant_account};
use payments_core::domain::payment::PaymentStatus;
use payments_core::domain::refund::{CreateRefundRequest, RefundStatus};
use payments_core::error::CoreError;
use payments_core::rail::mock::{MockBehavior, MockRail};
use payments_core::rail::RailStatus;
use rust_decimal_macros::dec;
use uuid::Uuid;

fn refund_of(payment_id: Uuid, amount: rust_decimal::Decimal) -> CreateRefundRequest {
    CreateRefundRequest {
        payment_id,
        amount,
        reason: Some("customer request".to_string()),
    }
}

#[tokio::test]
async fn refund_above_payment_amount_never_reaches_rail() {
    let h = harness(MockRail::new(MockBehavior::AlwaysSuccess));
    let payment = h.paid(dec!(100)).await;

    let err = h
        .refunds
        .create_refund(refund_of(payment.id, dec!(100.01)))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Validation(_)));
    assert_eq!(h.rail.refund_calls(), 0);
    assert!(h.refunds.list_refunds_for_payment(payment.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn cumulative_refunds_are_capped() {
    let h = harness(MockRail::new(MockBehavior::AlwaysSuccess));
    let payment = h.paid(dec!(100)).await;

    let first = h.refunds.create_refund(refund_of(payment.id, dec!(60))).await.unwrap();
    assert_eq!(first.status, RefundStatus::Succeeded);
    assert!(first.refund_reference.starts_with("REF_"));

    let err = h
        .refunds
        .create_refund(refund_of(payment.id, dec!(60)))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::StateConflict(_)));
    assert_eq!(h.rail.refund_calls(), 1);

    // The remainder still fits.
    let second = h.refunds.create_refund(refund_of(payment.id, dec!(40))).await.unwrap();
    assert_eq!(second.status, RefundStatus::Succeeded);
    assert_eq!(h.refunds.list_refunds_for_payment(payment.id).await.unwrap().len(), 2);
}

#[tokio::test]
async fn successful_refund_reverses_ledger_without_returning_fee() {
    let h = harness(MockRail::new(MockBehavior::AlwaysSuccess));
    let payment = h.paid(dec!(100.50)).await;

    let refund = h.refunds.create_refund(refund_of(payment.id, dec!(60))).await.unwrap();

    let entries = h.ledger.get_transaction_entries(refund.id).await.unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(
        h.ledger.get_account_balance(&customer_account(PAYER), "INR").await.unwrap(),
        dec!(40.50)
    );
    assert_eq!(
        h.ledger.get_account_balance(&merchant_account("merchant_1"), "INR").await.unwrap(),
        dec!(-38.49)
    );
    let report = h.ledger.validate_ledger_integrity().await.unwrap();
    assert_eq!(report.transactions_checked, 2);
    assert_eq!(report.entries_checked, 5);

    let types: Vec<String> = h
        .store
        .outbox_events()
        .await
        .into_iter()
        .map(|e| e.event_type)
        .collect();
    assert!(types.contains(&"refund.succeeded".to_string()));
}

#[tokio::test]
async fn failed_payment_cannot_be_refunded() {
    let h = harness(MockRail::new(MockBehavior::AlwaysFailure));
    let payment = h.paid(dec!(25)).await;
    assert_eq!(payment.status, PaymentStatus::Failed);

    let err = h
        .refunds
        .create_refund(refund_of(payment.id, dec!(5)))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::StateConflict(_)));
    assert_eq!(h.rail.refund_calls(), 0);
}

#[tokio::test]
async fn declined_refund_releases_its_reservation() {
    let paid = harness(MockRail::new(MockBehavior::AlwaysSuccess));
    let payment = paid.paid(dec!(100)).await;

    let declining = harness_on(paid.store.clone(), MockRail::new(MockBehavior::AlwaysFailure));
    let refund = declining
        .refunds
        .create_refund(refund_of(payment.id, dec!(100)))
        .await
        .unwrap();
    assert_eq!(refund.status, RefundStatus::Failed);
    assert_eq!(refund.failure_code.as_deref(), Some("MOCK_DECLINED"));

    let retry = paid
        .refunds
        .create_refund(refund_of(payment.id, dec!(100)))
        .await
        .unwrap();
    assert_eq!(retry.status, RefundStatus::Succeeded);
}

#[tokio::test]
async fn pending_refund_is_settled_by_status_polling() {
    let paid = harness(MockRail::new(MockBehavior::AlwaysSuccess));
    let payment = paid.paid(dec!(80)).await;

    let slow = harness_on(paid.store.clone(), MockRail::new(MockBehavior::AlwaysPending));
    let refund = slow
        .refunds
        .create_refund(refund_of(payment.id, dec!(30)))
        .await
        .unwrap();
    assert_eq!(refund.status, RefundStatus::Processing);

    // Rail still working on it.
    assert_eq!(slow.refunds.poll_in_flight_refunds(10).await.unwrap(), 0);
    assert_eq!(slow.rail.status_calls(), 1);

    slow.rail.set_status_outcome(RailStatus::Succeeded);
    assert_eq!(slow.refunds.poll_in_flight_refunds(10).await.unwrap(), 1);

    let refund = slow.refunds.get_refund(refund.id).await.unwrap();
    assert_eq!(refund.status, RefundStatus::Succeeded);
    assert_eq!(slow.ledger.get_transaction_entries(refund.id).await.unwrap().len(), 2);

    // Terminal refunds are not queried again.
    let calls = slow.rail.status_calls();
    slow.refunds.check_refund_status(refund.id).await.unwrap();
    assert_eq!(slow.rail.status_calls(), calls);
}

#[tokio::test]
async fn processing_refund_unknown_to_rail_fails() {
    let paid = harness(MockRail::new(MockBehavior::AlwaysSuccess));
    let payment = paid.paid(dec!(80)).await;

    let slow = harness_on(paid.store.clone(), MockRail::new(MockBehavior::AlwaysPending));
    let refund = slow
        .refunds
        .create_refund(refund_of(payment.id, dec!(30)))
        .await
        .unwrap();

    slow.rail.set_status_outcome(RailStatus::NotFound);
    let refund = slow.refunds.check_refund_status(refund.id).await.unwrap();
    assert_eq!(refund.status, RefundStatus::Failed);
    assert_eq!(refund.failure_code.as_deref(), Some("RAIL_NOT_FOUND"));
}

#[tokio::test]
async fn only_pending_refunds_can_be_canceled() {
    let h = harness(MockRail::new(MockBehavior::AlwaysSuccess));
    let payment = h.paid(dec!(50)).await;
    let refund = h.refunds.create_refund(refund_of(payment.id, dec!(10))).await.unwrap();

    let err = h.refunds.cancel_refund(refund.id).await.unwrap_err();
    assert!(matches!(err, CoreError::StateConflict(_)));

    assert!(matches!(
        h.refunds.cancel_refund(Uuid::new_v4()).await.unwrap_err(),
        CoreError::NotFound { .. }
    ));
}

#[tokio::test]
async fn canceling_a_pending_refund_frees_the_cap() {
    use chrono::Utc;
    use payments_core::domain::refund::{generate_refund_reference, Refund};
    use payments_core::repo::store::{BeginRefund, RefundStore};

    let h = harness(MockRail::new(MockBehavior::AlwaysSuccess));
    let payment = h.paid(dec!(50)).await;

    let now = Utc::now();
    let pending = Refund {
        id: Uuid::new_v4(),
        payment_id: payment.id,
        merchant_id: payment.merchant_id.clone(),
        amount: dec!(50),
        currency: payment.currency.clone(),
        reason: None,
        status: RefundStatus::Pending,
        refund_reference: generate_refund_reference(now),
        rail_reference: None,
        failure_code: None,
        failure_message: None,
        processed_at: None,
        created_at: now,
        updated_at: now,
    };
    assert_eq!(h.store.begin_refund(&pending).await.unwrap(), BeginRefund::Started);

    let err = h
        .refunds
        .create_refund(refund_of(payment.id, dec!(1)))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::StateConflict(_)));

    let canceled = h.refunds.cancel_refund(pending.id).await.unwrap();
    assert_eq!(canceled.status, RefundStatus::Canceled);

    let refund = h.refunds.create_refund(refund_of(payment.id, dec!(50))).await.unwrap();
    assert_eq!(refund.status, RefundStatus::Succeeded);
    assert_eq!(h.rail.refund_calls(), 1);
}

fn pending_refund(payment: &payments_core::domain::payment::Payment, amount: rust_decimal::Decimal, age: chrono::Duration) -> payments_core::domain::refund::Refund {
    use payments_core::domain::refund::{generate_refund_reference, Refund};

    let at = chrono::Utc::now() - age;
    Refund {
        id: Uuid::new_v4(),
        payment_id: payment.id,
        merchant_id: payment.merchant_id.clone(),
        amount,
        currency: payment.currency.clone(),
        reason: None,
        status: RefundStatus::Pending,
        refund_reference: generate_refund_reference(at),
        rail_reference: None,
        failure_code: None,
        failure_message: None,
        processed_at: None,
        created_at: at,
        updated_at: at,
    }
}

#[tokio::test]
async fn stale_pending_refund_unknown_to_rail_is_abandoned() {
    use payments_core::repo::store::{BeginRefund, RefundStore};

    let h = harness(MockRail::new(MockBehavior::AlwaysSuccess));
    let payment = h.paid(dec!(100)).await;

    let stranded = pending_refund(&payment, dec!(100), chrono::Duration::minutes(10));
    assert_eq!(h.store.begin_refund(&stranded).await.unwrap(), BeginRefund::Started);
    h.rail.set_status_outcome(RailStatus::NotFound);

    assert_eq!(h.refunds.poll_in_flight_refunds(10).await.unwrap(), 1);
    let stranded = h.refunds.get_refund(stranded.id).await.unwrap();
    assert_eq!(stranded.status, RefundStatus::Failed);
    assert_eq!(stranded.failure_code.as_deref(), Some("ABANDONED"));
    assert!(matches!(
        h.ledger.get_transaction_entries(stranded.id).await.unwrap_err(),
        CoreError::NotFound { .. }
    ));

    // The cap it held is free again.
    let refund = h.refunds.create_refund(refund_of(payment.id, dec!(100))).await.unwrap();
    assert_eq!(refund.status, RefundStatus::Succeeded);
}

#[tokio::test]
async fn recent_pending_refund_unknown_to_rail_is_left_alone() {
    use payments_core::repo::store::RefundStore;

    let h = harness(MockRail::new(MockBehavior::AlwaysSuccess));
    let payment = h.paid(dec!(100)).await;

    let fresh = pending_refund(&payment, dec!(40), chrono::Duration::seconds(5));
    h.store.begin_refund(&fresh).await.unwrap();
    h.rail.set_status_outcome(RailStatus::NotFound);

    assert_eq!(h.refunds.poll_in_flight_refunds(10).await.unwrap(), 0);
    assert_eq!(
        h.refunds.get_refund(fresh.id).await.unwrap().status,
        RefundStatus::Pending
    );
}
