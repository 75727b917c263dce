use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const WILDCARD_EVENT: &str = "*";
pub const ENVELOPE_VERSION: &str = "v1";

pub mod event_types {
    pub const PAYMENT_INTENT_CREATED: &str = "payment_intent.created";
    pub const PAYMENT_INTENT_CANCELED: &str = "payment_intent.canceled";
    pub const PAYMENT_SUCCEEDED: &str = "payment.succeeded";
    pub const PAYMENT_FAILED: &str = "payment.failed";
    pub const REFUND_SUCCEEDED: &str = "refund.succeeded";
    pub const REFUND_FAILED: &str = "refund.failed";
    pub const REFUND_CANCELED: &str = "refund.canceled";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEndpoint {
    pub id: Uuid,
    pub merchant_id: String,
    pub url: String,
    pub secret: String,
    pub events: Vec<String>,
    pub active: bool,
    pub version: String,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WebhookEndpoint {
    pub fn subscribes_to(&self, event_type: &str) -> bool {
        self.events
            .iter()
            .any(|e| e == event_type || e == WILDCARD_EVENT)
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CreateWebhookEndpoint {
    pub merchant_id: String,
    pub url: String,
    pub events: Vec<String>,
    pub secret: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct UpdateWebhookEndpoint {
    pub url: Option<String>,
    pub events: Option<Vec<String>>,
    pub active: Option<bool>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Delivering,
    Retrying,
    Delivered,
    Failed,
}

string_enum!(DeliveryStatus {
    Pending => "pending",
    Delivering => "delivering",
    Retrying => "retrying",
    Delivered => "delivered",
    Failed => "failed",
});

impl DeliveryStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Delivered | Self::Failed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookDelivery {
    pub id: Uuid,
    pub endpoint_id: Uuid,
    pub event_id: Uuid,
    pub event_type: String,
    /// Exact bytes that were signed and are sent as the request body.
    pub payload: String,
    pub signature: String,
    pub status: DeliveryStatus,
    pub attempt_count: i32,
    pub max_attempts: i32,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub response_status: Option<i32>,
    pub response_body: Option<String>,
    pub failure_reason: Option<String>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub event_type: String,
    pub created_at: String,
    pub data: serde_json::Value,
    pub version: String,
}

impl EventEnvelope {
    pub fn new(
        id: Uuid,
        event_type: &str,
        created_at: DateTime<Utc>,
        data: serde_json::Value,
    ) -> Self {
        Self {
            id,
            event_type: event_type.to_string(),
            created_at: created_at.to_rfc3339_opts(SecondsFormat::Secs, true),
            data,
            version: ENVELOPE_VERSION.to_string(),
        }
    }
}
