use std::future::Future;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

pub mod http;
pub mod mock;

#[derive(Debug, Clone, Serialize)]
pub struct RailPaymentRequest {
    /// Our payment id; the rail echoes it back for status lookups.
    pub reference: String,
    pub amount_minor: i64,
    pub currency: String,
    pub payer_id: String,
    pub payee_id: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RailRefundRequest {
    pub reference: String,
    pub original_transaction_id: Option<String>,
    pub amount_minor: i64,
    pub currency: String,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RailStatus {
    Succeeded,
    Failed,
    Pending,
    NotFound,
}

/// Normalized rail outcome. Transport failures never produce one; they surface
/// as `Err` from the client so callers can tell them apart from declines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RailResponse {
    pub status: RailStatus,
    pub rail_reference: Option<String>,
    pub failure_code: Option<String>,
    pub failure_message: Option<String>,
}

impl RailResponse {
    pub fn succeeded(rail_reference: impl Into<String>) -> Self {
        Self {
            status: RailStatus::Succeeded,
            rail_reference: Some(rail_reference.into()),
            failure_code: None,
            failure_message: None,
        }
    }

    pub fn declined(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status: RailStatus::Failed,
            rail_reference: None,
            failure_code: Some(code.into()),
            failure_message: Some(message.into()),
        }
    }

    pub fn with_status(status: RailStatus, rail_reference: Option<String>) -> Self {
        Self {
            status,
            rail_reference,
            failure_code: None,
            failure_message: None,
        }
    }

    pub fn success(&self) -> bool {
        self.status == RailStatus::Succeeded
    }
}

#[async_trait::async_trait]
pub trait RailClient: Send + Sync {
    fn name(&self) -> &'static str;

    async fn validate_identifier(&self, identifier: &str) -> Result<bool>;

    async fn process_payment(&self, request: RailPaymentRequest) -> Result<RailResponse>;

    async fn process_refund(&self, request: RailRefundRequest) -> Result<RailResponse>;

    async fn check_status(&self, reference: &str) -> Result<RailResponse>;
}

/// Bounds a rail call by `deadline`. An elapsed deadline is reported as a
/// transport failure, same as a dropped connection.
pub async fn with_deadline<T, F>(deadline: Duration, call: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(deadline, call).await {
        Ok(result) => result,
        Err(_) => Err(anyhow::anyhow!(
            "rail call exceeded its {} ms deadline",
            deadline.as_millis()
        )),
    }
}

/// Local shape check for a virtual payment address (`handle@provider`).
pub fn has_identifier_shape(identifier: &str) -> bool {
    identifier.len() >= 6
        && identifier
            .split_once('@')
            .map(|(handle, provider)| !handle.is_empty() && !provider.is_empty())
            .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifier_needs_handle_and_provider() {
        assert!(has_identifier_shape("alice@okbank"));
        assert!(!has_identifier_shape("a@b"));
        assert!(!has_identifier_shape("alice.okbank"));
        assert!(!has_identifier_shape("@okbank"));
        assert!(!has_identifier_shape("alice@"));
    }
}
