mod common;

use chrono::Utc;
use common::{harness, harness_on, payment_request, PAYER};
use payments_core::domain::intent::{CreatePaymentIntentRequest, IntentStatus, PaymentIntent};
use payments_core::domain::ledger::{customer_account, merchant_account, PLATFORM_REVENUE_ACCOUNT};
use payments_core::domain::outbox::OutboxEvent;
use payments_core::domain::payment::{PaymentMethod, PaymentStatus};
use payments_core::error::CoreError;
use payments_core::rail::mock::{MockBehavior, MockRail};
use payments_core::rail::RailStatus;
use payments_core::repo::store::{OutboxStore, PaymentStore};
use payments_core::service::payment_service::MAX_INTENT_EXPIRY_SECONDS;
use rust_decimal_macros::dec;
use uuid::Uuid;

#[tokio::test]
async fn intent_gets_defaults_and_fifteen_minute_expiry() {
    let h = harness(MockRail::new(MockBehavior::AlwaysSuccess));
    let before = Utc::now();
    let intent = h.open_intent(dec!(100.50)).await;

    assert_eq!(intent.status, IntentStatus::Created);
    assert_eq!(intent.currency, "INR");
    assert_eq!(intent.payment_method, PaymentMethod::Upi);
    assert_eq!(intent.metadata, serde_json::json!({}));
    let ttl = intent.expires_at - before;
    assert!(ttl >= chrono::Duration::seconds(899) && ttl <= chrono::Duration::seconds(901));

    let events = h.store.outbox_events().await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, "payment_intent.created");
}

#[tokio::test]
async fn intent_rejects_bad_amounts_and_expiry() {
    let h = harness(MockRail::new(MockBehavior::AlwaysSuccess));
    for amount in [dec!(0), dec!(-1), dec!(10.001)] {
        let err = h
            .payments
            .create_payment_intent(common::intent_request(amount))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)), "{amount}: {err}");
    }

    let err = h
        .payments
        .create_payment_intent(CreatePaymentIntentRequest {
            expires_in_seconds: Some(0),
            ..common::intent_request(dec!(10))
        })
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Validation(_)));
}

#[tokio::test]
async fn intent_expiry_is_bounded() {
    let h = harness(MockRail::new(MockBehavior::AlwaysSuccess));
    for secs in [MAX_INTENT_EXPIRY_SECONDS + 1, i64::MAX / 2, i64::MAX] {
        let err = h
            .payments
            .create_payment_intent(CreatePaymentIntentRequest {
                expires_in_seconds: Some(secs),
                ..common::intent_request(dec!(10))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)), "{secs}: {err}");
    }

    let intent = h
        .payments
        .create_payment_intent(CreatePaymentIntentRequest {
            expires_in_seconds: Some(MAX_INTENT_EXPIRY_SECONDS),
            ..common::intent_request(dec!(10))
        })
        .await
        .unwrap();
    assert!(intent.expires_at > Utc::now() + chrono::Duration::days(29));
}

#[tokio::test]
async fn successful_payment_posts_balanced_ledger_and_closes_intent() {
    let h = harness(MockRail::new(MockBehavior::AlwaysSuccess).with_reference("RAIL_123"));
    let intent = h.open_intent(dec!(100.50)).await;

    let payment = h.payments.create_payment(payment_request(intent.id)).await.unwrap();

    assert_eq!(payment.status, PaymentStatus::Succeeded);
    assert_eq!(payment.rail_transaction_id.as_deref(), Some("RAIL_123"));
    assert!(payment.risk_assessment_id.is_some());
    assert_eq!(
        h.payments.get_payment_intent(intent.id).await.unwrap().status,
        IntentStatus::Succeeded
    );

    let entries = h.ledger.get_transaction_entries(payment.id).await.unwrap();
    assert_eq!(entries.len(), 3);
    let debits: rust_decimal::Decimal = entries.iter().map(|e| e.debit).sum();
    let credits: rust_decimal::Decimal = entries.iter().map(|e| e.credit).sum();
    assert_eq!(debits, dec!(100.50));
    assert_eq!(credits, dec!(100.50));

    assert_eq!(
        h.ledger.get_account_balance(&customer_account(PAYER), "INR").await.unwrap(),
        dec!(100.50)
    );
    assert_eq!(
        h.ledger.get_account_balance(&merchant_account("merchant_1"), "INR").await.unwrap(),
        dec!(-98.49)
    );
    assert_eq!(
        h.ledger.get_account_balance(PLATFORM_REVENUE_ACCOUNT, "INR").await.unwrap(),
        dec!(2.01)
    );

    let posted = h.store.get_ledger_post(payment.id).await.unwrap().unwrap();
    assert!(posted.posted_at.is_some());

    let types: Vec<String> = h
        .store
        .outbox_events()
        .await
        .into_iter()
        .map(|e| e.event_type)
        .collect();
    assert!(types.contains(&"payment.succeeded".to_string()));
}

#[tokio::test]
async fn expired_intent_is_flipped_and_no_payment_created() {
    let h = harness(MockRail::new(MockBehavior::AlwaysSuccess));
    let now = Utc::now();
    let intent = PaymentIntent {
        id: Uuid::new_v4(),
        merchant_id: "merchant_1".to_string(),
        amount: dec!(50),
        currency: "INR".to_string(),
        payment_method: PaymentMethod::Upi,
        customer_id: None,
        description: None,
        metadata: serde_json::json!({}),
        status: IntentStatus::Created,
        expires_at: now - chrono::Duration::minutes(1),
        created_at: now - chrono::Duration::minutes(16),
        updated_at: now - chrono::Duration::minutes(16),
    };
    let event = OutboxEvent::new("merchant_1", "payment_intent.created", serde_json::json!({}));
    h.store.insert_intent(&intent, &event).await.unwrap();

    let err = h.payments.create_payment(payment_request(intent.id)).await.unwrap_err();
    assert!(matches!(err, CoreError::StateConflict(_)));
    assert!(err.to_string().contains("expired"));

    assert_eq!(
        h.store.get_intent(intent.id).await.unwrap().unwrap().status,
        IntentStatus::Expired
    );
    assert!(h.payments.list_payments_for_intent(intent.id).await.unwrap().is_empty());
    assert_eq!(h.rail.validate_calls(), 0);
    assert_eq!(h.rail.payment_calls(), 0);
}

#[tokio::test]
async fn invalid_identifier_stops_before_rail_payment() {
    let h = harness(MockRail::new(MockBehavior::AlwaysSuccess));
    let intent = h.open_intent(dec!(75)).await;

    let mut req = payment_request(intent.id);
    req.payer_id = "not-a-vpa".to_string();
    let err = h.payments.create_payment(req).await.unwrap_err();

    assert!(matches!(err, CoreError::Validation(_)));
    assert!(err.to_string().contains("invalid identifier"));
    assert_eq!(h.rail.payment_calls(), 0);
    assert!(h.payments.list_payments_for_intent(intent.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn risk_block_leaves_no_payment_row() {
    let h = harness(MockRail::new(MockBehavior::AlwaysSuccess));
    let intent = h
        .payments
        .create_payment_intent(CreatePaymentIntentRequest {
            customer_id: None,
            ..common::intent_request(dec!(150000))
        })
        .await
        .unwrap();

    let mut req = payment_request(intent.id);
    req.device_id = None;
    req.ip_address = None;
    let err = h.payments.create_payment(req).await.unwrap_err();

    let CoreError::RiskBlocked { assessment_id, score } = err else {
        panic!("expected a risk block, got {err}");
    };
    assert!(score >= 0.8);
    assert_eq!(h.rail.payment_calls(), 0);
    assert!(h.payments.list_payments_for_intent(intent.id).await.unwrap().is_empty());

    let assessment = h.payments.risk.get_assessment(assessment_id).await.unwrap();
    assert!(assessment.triggered_rules.contains(&"HIGH_AMOUNT_TRANSACTION".to_string()));
    assert!(assessment.triggered_rules.contains(&"FIRST_TIME_HIGH_AMOUNT".to_string()));
}

#[tokio::test]
async fn decline_fails_payment_and_keeps_intent_open() {
    let h = harness(MockRail::new(MockBehavior::AlwaysFailure));
    let intent = h.open_intent(dec!(20)).await;

    let payment = h.payments.create_payment(payment_request(intent.id)).await.unwrap();
    assert_eq!(payment.status, PaymentStatus::Failed);
    assert_eq!(payment.failure_code.as_deref(), Some("MOCK_DECLINED"));
    assert_eq!(
        h.payments.get_payment_intent(intent.id).await.unwrap().status,
        IntentStatus::Created
    );
    assert_eq!(h.store.ledger_entry_count().await, 0);

    // A failed attempt does not block the next one.
    let retry = h.payments.create_payment(payment_request(intent.id)).await.unwrap();
    assert_eq!(retry.status, PaymentStatus::Failed);
    assert_eq!(h.payments.list_payments_for_intent(intent.id).await.unwrap().len(), 2);
}

#[tokio::test]
async fn transport_error_is_recorded_as_failure() {
    let h = harness(MockRail::new(MockBehavior::AlwaysTimeout));
    let intent = h.open_intent(dec!(20)).await;

    let payment = h.payments.create_payment(payment_request(intent.id)).await.unwrap();
    assert_eq!(payment.status, PaymentStatus::Failed);
    assert_eq!(payment.failure_code.as_deref(), Some("RAIL_TRANSPORT_ERROR"));
}

#[tokio::test]
async fn second_payment_on_succeeded_intent_is_a_conflict() {
    let h = harness(MockRail::new(MockBehavior::AlwaysSuccess));
    let payment = h.paid(dec!(10)).await;

    let err = h
        .payments
        .create_payment(payment_request(payment.intent_id))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::StateConflict(_)));
    assert_eq!(h.rail.payment_calls(), 1);
}

#[tokio::test]
async fn pending_rail_result_is_settled_by_reconcile() {
    let h = harness(MockRail::new(MockBehavior::AlwaysPending));
    let intent = h.open_intent(dec!(100.50)).await;

    let payment = h.payments.create_payment(payment_request(intent.id)).await.unwrap();
    assert_eq!(payment.status, PaymentStatus::Processing);

    // Still pending at the rail: nothing changes.
    let unchanged = h.payments.reconcile_payment(payment.id).await.unwrap();
    assert_eq!(unchanged.status, PaymentStatus::Processing);

    h.rail.set_status_outcome(RailStatus::Succeeded);
    let settled = h.payments.reconcile_payment(payment.id).await.unwrap();
    assert_eq!(settled.status, PaymentStatus::Succeeded);
    assert_eq!(h.ledger.get_transaction_entries(payment.id).await.unwrap().len(), 3);
    assert_eq!(
        h.payments.get_payment_intent(intent.id).await.unwrap().status,
        IntentStatus::Succeeded
    );
}

#[tokio::test]
async fn stale_payment_unknown_to_rail_is_failed() {
    let h = harness(MockRail::new(MockBehavior::AlwaysPending));
    let intent = h.open_intent(dec!(40)).await;
    let payment = h.payments.create_payment(payment_request(intent.id)).await.unwrap();

    h.rail.set_status_outcome(RailStatus::NotFound);
    let settled = h
        .payments
        .reconcile_stale_payments(chrono::Duration::seconds(-1), 10)
        .await
        .unwrap();
    assert_eq!(settled, 1);

    let payment = h.payments.get_payment(payment.id).await.unwrap();
    assert_eq!(payment.status, PaymentStatus::Failed);
    assert_eq!(payment.failure_code.as_deref(), Some("RAIL_NOT_FOUND"));
}

#[tokio::test]
async fn cancel_intent_only_while_open() {
    let h = harness(MockRail::new(MockBehavior::AlwaysSuccess));
    let intent = h.open_intent(dec!(30)).await;

    let canceled = h.payments.cancel_payment_intent(intent.id).await.unwrap();
    assert_eq!(canceled.status, IntentStatus::Canceled);

    let err = h.payments.cancel_payment_intent(intent.id).await.unwrap_err();
    assert!(matches!(err, CoreError::StateConflict(_)));
    let err = h.payments.create_payment(payment_request(intent.id)).await.unwrap_err();
    assert!(matches!(err, CoreError::StateConflict(_)));

    let paid = h.paid(dec!(30)).await;
    let err = h.payments.cancel_payment_intent(paid.intent_id).await.unwrap_err();
    assert!(matches!(err, CoreError::StateConflict(_)));
}

#[tokio::test]
async fn reconciled_payment_is_posted_exactly_once() {
    let pending = harness(MockRail::new(MockBehavior::AlwaysPending));
    let intent = pending.open_intent(dec!(60)).await;
    let payment = pending.payments.create_payment(payment_request(intent.id)).await.unwrap();

    // Settle the same row through a second set of services; the loop finds nothing left.
    let other = harness_on(pending.store.clone(), MockRail::new(MockBehavior::AlwaysSuccess));
    other.rail.set_status_outcome(RailStatus::Succeeded);
    other.payments.reconcile_payment(payment.id).await.unwrap();

    assert_eq!(other.reconciler.tick().await.unwrap(), 0);
    assert_eq!(
        other.ledger.get_transaction_entries(payment.id).await.unwrap().len(),
        3
    );
    assert!(other.ledger.validate_ledger_integrity().await.is_ok());
}

#[tokio::test]
async fn unknown_ids_are_not_found() {
    let h = harness(MockRail::new(MockBehavior::AlwaysSuccess));
    let missing = Uuid::new_v4();
    assert!(matches!(
        h.payments.get_payment(missing).await.unwrap_err(),
        CoreError::NotFound { .. }
    ));
    assert!(matches!(
        h.payments.get_payment_intent(missing).await.unwrap_err(),
        CoreError::NotFound { .. }
    ));
    assert!(matches!(
        h.payments.create_payment(payment_request(missing)).await.unwrap_err(),
        CoreError::NotFound { .. }
    ));
}
