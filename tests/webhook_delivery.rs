mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use payments_core::config::{WebhookConfig, WorkerConfig};
use payments_core::domain::outbox::OutboxStatus;
use payments_core::domain::webhook::{CreateWebhookEndpoint, DeliveryStatus, UpdateWebhookEndpoint};
use payments_core::error::CoreError;
use payments_core::rail::mock::{MockBehavior, MockRail};
use payments_core::repo::memory::MemoryStore;
use payments_core::service::outbox_relay::OutboxRelay;
use payments_core::service::webhook_dispatcher::{verify_signature, WebhookDispatcher};
use rust_decimal_macros::dec;
use uuid::Uuid;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const SECRET: &str = "whsec_integration";

fn dispatcher(store: &MemoryStore, config: WebhookConfig) -> WebhookDispatcher {
    WebhookDispatcher::new(Arc::new(store.clone()), config)
}

fn test_config() -> WebhookConfig {
    WebhookConfig {
        request_timeout: Duration::from_secs(2),
        max_attempts: 3,
        ..WebhookConfig::default()
    }
}

fn endpoint_request(server: &MockServer, events: &[&str]) -> CreateWebhookEndpoint {
    CreateWebhookEndpoint {
        merchant_id: "merchant_1".to_string(),
        url: format!("{}/hooks", server.uri()),
        events: events.iter().map(|e| e.to_string()).collect(),
        secret: Some(SECRET.to_string()),
        description: None,
    }
}

#[tokio::test]
async fn trigger_delivers_signed_envelope_with_headers() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hooks"))
        .and(header("content-type", "application/json"))
        .and(header("user-agent", "payments-core-webhooks/1.0"))
        .and(header("x-webhook-event-type", "payment.succeeded"))
        .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
        .expect(1)
        .mount(&server)
        .await;

    let store = MemoryStore::new();
    let d = dispatcher(&store, test_config());
    let endpoint = d
        .create_endpoint(endpoint_request(&server, &["payment.succeeded"]))
        .await
        .unwrap();

    let deliveries = d
        .trigger("merchant_1", "payment.succeeded", serde_json::json!({"payment_id": "p1"}))
        .await
        .unwrap();
    assert_eq!(deliveries.len(), 1);
    let delivery = &deliveries[0];
    assert_eq!(delivery.status, DeliveryStatus::Delivered);
    assert_eq!(delivery.attempt_count, 1);
    assert_eq!(delivery.response_status, Some(200));
    assert_eq!(delivery.endpoint_id, endpoint.id);

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1);
    let body = String::from_utf8(requests[0].body.clone()).unwrap();
    let signature = requests[0]
        .headers
        .get("x-webhook-signature")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert!(verify_signature(SECRET, &body, &signature));
    assert_eq!(
        requests[0].headers.get("x-webhook-delivery-id").unwrap().to_str().unwrap(),
        delivery.id.to_string()
    );

    let envelope: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(envelope["type"], "payment.succeeded");
    assert_eq!(envelope["version"], "v1");
    assert_eq!(envelope["data"]["payment_id"], "p1");
    assert_eq!(envelope["id"], delivery.event_id.to_string());

    let stored = d.get_delivery(delivery.id).await.unwrap();
    assert_eq!(stored.status, DeliveryStatus::Delivered);
    assert!(stored.delivered_at.is_some());
}

#[tokio::test]
async fn unsubscribed_events_create_no_deliveries() {
    let server = MockServer::start().await;
    let store = MemoryStore::new();
    let d = dispatcher(&store, test_config());
    d.create_endpoint(endpoint_request(&server, &["refund.succeeded"]))
        .await
        .unwrap();

    let deliveries = d
        .trigger("merchant_1", "payment.failed", serde_json::json!({}))
        .await
        .unwrap();
    assert!(deliveries.is_empty());

    let other_merchant = d
        .trigger("merchant_2", "refund.succeeded", serde_json::json!({}))
        .await
        .unwrap();
    assert!(other_merchant.is_empty());
}

#[tokio::test]
async fn failing_endpoint_retries_then_fails_after_max_attempts() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hooks"))
        .respond_with(ResponseTemplate::new(500).set_body_string("x".repeat(1500)))
        .mount(&server)
        .await;

    let store = MemoryStore::new();
    let d = dispatcher(&store, test_config());
    d.create_endpoint(endpoint_request(&server, &["*"])).await.unwrap();

    let before = Utc::now();
    let first = d
        .trigger("merchant_1", "refund.failed", serde_json::json!({}))
        .await
        .unwrap()
        .remove(0);
    assert_eq!(first.status, DeliveryStatus::Retrying);
    assert_eq!(first.attempt_count, 1);
    assert_eq!(first.response_status, Some(500));
    assert_eq!(first.response_body.as_ref().map(|b| b.len()), Some(1000));
    let next = first.next_attempt_at.unwrap();
    assert!(next >= before + chrono::Duration::minutes(1));
    assert!(next <= Utc::now() + chrono::Duration::minutes(1));

    let second = d.attempt(first).await.unwrap();
    assert_eq!(second.status, DeliveryStatus::Retrying);
    assert!(second.next_attempt_at.unwrap() >= Utc::now() + chrono::Duration::seconds(110));

    let third = d.attempt(second).await.unwrap();
    assert_eq!(third.status, DeliveryStatus::Failed);
    assert_eq!(third.attempt_count, 3);
    assert!(third.next_attempt_at.is_none());

    // Terminal deliveries are left alone.
    let again = d.attempt(third).await.unwrap();
    assert_eq!(again.attempt_count, 3);
    assert_eq!(server.received_requests().await.unwrap().len(), 3);
}

#[tokio::test]
async fn delivery_for_deleted_endpoint_fails_without_a_request() {
    let server = MockServer::start().await;
    let store = MemoryStore::new();
    let d = dispatcher(&store, test_config());
    let endpoint = d.create_endpoint(endpoint_request(&server, &["*"])).await.unwrap();

    let delivery = d
        .enqueue("merchant_1", "payment.failed", serde_json::json!({}), Uuid::new_v4(), Utc::now())
        .await
        .unwrap()
        .remove(0);
    d.delete_endpoint(endpoint.id).await.unwrap();

    let delivery = d.attempt(delivery).await.unwrap();
    assert_eq!(delivery.status, DeliveryStatus::Failed);
    assert_eq!(delivery.attempt_count, 0);
    assert_eq!(delivery.failure_reason.as_deref(), Some("endpoint was deleted"));
    assert!(server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn enqueue_is_unique_per_endpoint_and_event() {
    let server = MockServer::start().await;
    let store = MemoryStore::new();
    let d = dispatcher(&store, test_config());
    d.create_endpoint(endpoint_request(&server, &["*"])).await.unwrap();

    let event_id = Uuid::new_v4();
    let first = d
        .enqueue("merchant_1", "payment.failed", serde_json::json!({}), event_id, Utc::now())
        .await
        .unwrap();
    let second = d
        .enqueue("merchant_1", "payment.failed", serde_json::json!({}), event_id, Utc::now())
        .await
        .unwrap();
    assert_eq!(first.len(), 1);
    assert!(second.is_empty());
}

#[tokio::test]
async fn retry_scheduler_picks_up_unattempted_deliveries() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let store = MemoryStore::new();
    let d = dispatcher(
        &store,
        WebhookConfig {
            lease: chrono::Duration::zero(),
            ..test_config()
        },
    );
    d.create_endpoint(endpoint_request(&server, &["*"])).await.unwrap();
    let delivery = d
        .enqueue("merchant_1", "payment.succeeded", serde_json::json!({}), Uuid::new_v4(), Utc::now())
        .await
        .unwrap()
        .remove(0);

    assert_eq!(d.retry_due().await.unwrap(), 1);
    assert_eq!(
        d.get_delivery(delivery.id).await.unwrap().status,
        DeliveryStatus::Delivered
    );
    assert_eq!(d.retry_due().await.unwrap(), 0);
}

#[tokio::test]
async fn endpoint_crud_validates_input() {
    let store = MemoryStore::new();
    let d = dispatcher(&store, test_config());

    let bad_url = d
        .create_endpoint(CreateWebhookEndpoint {
            merchant_id: "merchant_1".to_string(),
            url: "ftp://merchant.example/hooks".to_string(),
            events: vec!["*".to_string()],
            ..CreateWebhookEndpoint::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(bad_url, CoreError::Validation(_)));

    let no_events = d
        .create_endpoint(CreateWebhookEndpoint {
            merchant_id: "merchant_1".to_string(),
            url: "https://merchant.example/hooks".to_string(),
            ..CreateWebhookEndpoint::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(no_events, CoreError::Validation(_)));

    let endpoint = d
        .create_endpoint(CreateWebhookEndpoint {
            merchant_id: "merchant_1".to_string(),
            url: "https://merchant.example/hooks".to_string(),
            events: vec!["payment.succeeded".to_string()],
            ..CreateWebhookEndpoint::default()
        })
        .await
        .unwrap();
    assert!(endpoint.secret.starts_with("whsec_"));
    assert_eq!(endpoint.secret.len(), "whsec_".len() + 32);
    assert_eq!(endpoint.version, "v1");

    let updated = d
        .update_endpoint(
            endpoint.id,
            UpdateWebhookEndpoint {
                active: Some(false),
                ..UpdateWebhookEndpoint::default()
            },
        )
        .await
        .unwrap();
    assert!(!updated.active);
    assert_eq!(d.list_endpoints("merchant_1").await.unwrap().len(), 1);

    d.delete_endpoint(endpoint.id).await.unwrap();
    assert!(matches!(
        d.get_endpoint(endpoint.id).await.unwrap_err(),
        CoreError::NotFound { .. }
    ));
}

#[tokio::test]
async fn relay_turns_committed_events_into_deliveries() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let h = common::harness(MockRail::new(MockBehavior::AlwaysSuccess));
    let d = dispatcher(&h.store, test_config());
    d.create_endpoint(endpoint_request(&server, &["*"])).await.unwrap();
    h.paid(dec!(100.50)).await;

    let relay = OutboxRelay::new(Arc::new(h.store.clone()), d.clone(), &WorkerConfig::default());
    let created = relay.tick().await.unwrap();
    assert_eq!(created.len(), 2);

    let events = h.store.outbox_events().await;
    assert!(events.iter().all(|e| e.status == OutboxStatus::Published));
    for delivery in &created {
        assert!(events.iter().any(|e| e.id == delivery.event_id));
    }

    let attempted = d.attempt_all(created).await;
    assert!(attempted.iter().all(|x| x.status == DeliveryStatus::Delivered));
    assert!(relay.tick().await.unwrap().is_empty());
}
