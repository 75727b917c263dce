use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::payment::PaymentMethod;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentStatus {
    Created,
    Succeeded,
    Expired,
    Canceled,
}

string_enum!(IntentStatus {
    Created => "created",
    Succeeded => "succeeded",
    Expired => "expired",
    Canceled => "canceled",
});

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentIntent {
    pub id: Uuid,
    pub merchant_id: String,
    pub amount: Decimal,
    pub currency: String,
    pub payment_method: PaymentMethod,
    pub customer_id: Option<String>,
    pub description: Option<String>,
    pub metadata: serde_json::Value,
    pub status: IntentStatus,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PaymentIntent {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CreatePaymentIntentRequest {
    pub merchant_id: String,
    pub amount: Decimal,
    pub currency: Option<String>,
    pub payment_method: Option<PaymentMethod>,
    pub customer_id: Option<String>,
    pub description: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub expires_in_seconds: Option<i64>,
}
