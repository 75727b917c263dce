mod common;

use std::fmt::Debug;
use std::sync::{Arc, Mutex};

use common::harness;
use payments_core::domain::payment::PaymentStatus;
use payments_core::rail::mock::{MockBehavior, MockRail};
use rust_decimal_macros::dec;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::Layer;

type Seen = Arc<Mutex<Vec<(Level, String)>>>;

/// Records the level of every event that carries a `failure_kind` field.
struct FailureKinds(Seen);

struct KindField(Option<String>);

impl Visit for KindField {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "failure_kind" {
            self.0 = Some(value.to_string());
        }
    }

    fn record_debug(&mut self, _field: &Field, _value: &dyn Debug) {}
}

impl<S: Subscriber> Layer<S> for FailureKinds {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut kind = KindField(None);
        event.record(&mut kind);
        if let Some(kind) = kind.0 {
            self.0.lock().unwrap().push((*event.metadata().level(), kind));
        }
    }
}

fn capture() -> (Seen, tracing::subscriber::DefaultGuard) {
    let seen = Seen::default();
    let subscriber = tracing_subscriber::registry().with(FailureKinds(seen.clone()));
    (seen, tracing::subscriber::set_default(subscriber))
}

#[tokio::test]
async fn transport_failures_log_at_error() {
    let (seen, _guard) = capture();
    let h = harness(MockRail::new(MockBehavior::AlwaysTimeout));
    let payment = h.paid(dec!(20)).await;
    assert_eq!(payment.status, PaymentStatus::Failed);

    let seen = seen.lock().unwrap();
    assert!(seen.contains(&(Level::ERROR, "transport".to_string())));
    assert!(!seen.iter().any(|(_, kind)| kind == "decline"));
}

#[tokio::test]
async fn declines_log_at_warn() {
    let (seen, _guard) = capture();
    let h = harness(MockRail::new(MockBehavior::AlwaysFailure));
    let payment = h.paid(dec!(20)).await;
    assert_eq!(payment.status, PaymentStatus::Failed);

    let seen = seen.lock().unwrap();
    assert!(seen.contains(&(Level::WARN, "decline".to_string())));
    assert!(!seen.iter().any(|(_, kind)| kind == "transport"));
}
