use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CoreError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentMethod {
    #[default]
    Upi,
    Card,
    Netbanking,
}

string_enum!(PaymentMethod {
    Upi => "UPI",
    Card => "CARD",
    Netbanking => "NETBANKING",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Processing,
    Succeeded,
    Failed,
}

string_enum!(PaymentStatus {
    Pending => "pending",
    Processing => "processing",
    Succeeded => "succeeded",
    Failed => "failed",
});

impl PaymentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payment {
    pub id: Uuid,
    pub intent_id: Uuid,
    pub merchant_id: String,
    pub customer_id: Option<String>,
    pub amount: Decimal,
    pub currency: String,
    pub payment_method: PaymentMethod,
    pub payer_id: String,
    pub payee_id: String,
    pub status: PaymentStatus,
    pub rail_transaction_id: Option<String>,
    pub failure_code: Option<String>,
    pub failure_message: Option<String>,
    pub risk_assessment_id: Option<Uuid>,
    pub processed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CreatePaymentRequest {
    pub intent_id: Uuid,
    pub payer_id: String,
    pub payee_id: String,
    pub device_id: Option<String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

/// Amounts are positive and carry at most two fractional digits.
pub fn validate_amount(amount: Decimal) -> Result<(), CoreError> {
    if amount <= Decimal::ZERO {
        return Err(CoreError::Validation(format!(
            "amount must be greater than zero, got {amount}"
        )));
    }
    if amount.normalize().scale() > 2 {
        return Err(CoreError::Validation(format!(
            "amount {amount} has more than two decimal places"
        )));
    }
    Ok(())
}

pub fn to_minor_units(amount: Decimal) -> Result<i64, CoreError> {
    (amount * Decimal::ONE_HUNDRED)
        .trunc()
        .to_i64()
        .ok_or_else(|| CoreError::Validation(format!("amount {amount} is out of range")))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub error: ErrorPayload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
    pub details: Option<String>,
}
