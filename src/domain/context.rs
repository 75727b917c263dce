use rust_decimal::Decimal;
use uuid::Uuid;

use crate::domain::intent::PaymentIntent;
use crate::domain::payment::CreatePaymentRequest;

/// Everything the risk engine may look at for one payment attempt.
#[derive(Debug, Clone)]
pub struct RiskContext {
    pub intent_id: Uuid,
    pub merchant_id: String,
    pub customer_id: Option<String>,
    pub amount: Decimal,
    pub currency: String,
    pub device_id: Option<String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

pub fn build_context(intent: &PaymentIntent, req: &CreatePaymentRequest) -> RiskContext {
    RiskContext {
        intent_id: intent.id,
        merchant_id: intent.merchant_id.clone(),
        customer_id: intent.customer_id.clone().filter(|c| !c.trim().is_empty()),
        amount: intent.amount,
        currency: intent.currency.clone(),
        device_id: non_blank(&req.device_id),
        ip_address: non_blank(&req.ip_address),
        user_agent: non_blank(&req.user_agent),
    }
}

fn non_blank(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}
