use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefundStatus {
    Pending,
    Processing,
    Succeeded,
    Failed,
    Canceled,
}

string_enum!(RefundStatus {
    Pending => "pending",
    Processing => "processing",
    Succeeded => "succeeded",
    Failed => "failed",
    Canceled => "canceled",
});

impl RefundStatus {
    /// Statuses whose amount is reserved against the payment's refundable total.
    pub fn counts_toward_cap(&self) -> bool {
        matches!(self, Self::Pending | Self::Processing | Self::Succeeded)
    }

    pub fn is_in_flight(&self) -> bool {
        matches!(self, Self::Pending | Self::Processing)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Refund {
    pub id: Uuid,
    pub payment_id: Uuid,
    pub merchant_id: String,
    pub amount: Decimal,
    pub currency: String,
    pub reason: Option<String>,
    pub status: RefundStatus,
    pub refund_reference: String,
    pub rail_reference: Option<String>,
    pub failure_code: Option<String>,
    pub failure_message: Option<String>,
    pub processed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Refund {
    /// Reference the rail knows this refund by.
    pub fn rail_lookup_reference(&self) -> &str {
        self.rail_reference
            .as_deref()
            .unwrap_or(self.refund_reference.as_str())
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CreateRefundRequest {
    pub payment_id: Uuid,
    pub amount: Decimal,
    pub reason: Option<String>,
}

pub fn generate_refund_reference(now: DateTime<Utc>) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("REF_{}_{}", now.timestamp(), &suffix[..8])
}
