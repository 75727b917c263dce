use anyhow::{Context, Result};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;

use crate::rail::{RailClient, RailPaymentRequest, RailRefundRequest, RailResponse, RailStatus};

/// JSON-over-HTTP client for the payment rail switch.
pub struct HttpRailClient {
    pub base_url: String,
    pub api_key: String,
    pub timeout_ms: u64,
    pub client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct RailReply {
    status: Option<RailStatus>,
    transaction_id: Option<String>,
    refund_reference: Option<String>,
    error_code: Option<String>,
    error_message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ValidateReply {
    valid: bool,
}

impl HttpRailClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, timeout_ms: u64) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            timeout_ms,
            client: reqwest::Client::new(),
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let req = self
            .client
            .request(method, format!("{}{}", self.base_url, path))
            .timeout(std::time::Duration::from_millis(self.timeout_ms));
        if self.api_key.is_empty() {
            req
        } else {
            req.bearer_auth(&self.api_key)
        }
    }

    async fn send(&self, req: reqwest::RequestBuilder, what: &str) -> Result<RailResponse> {
        let resp = req.send().await.map_err(|e| {
            if e.is_timeout() {
                anyhow::anyhow!("rail {what} timed out: {e}")
            } else {
                anyhow::anyhow!("rail {what} network error: {e}")
            }
        })?;

        let status = resp.status();
        if is_transport_status(status) {
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!(
                "rail {what} returned HTTP {}: {}",
                status.as_u16(),
                body.chars().take(200).collect::<String>()
            );
        }

        if status.is_success() {
            let reply: RailReply = resp
                .json()
                .await
                .with_context(|| format!("rail {what} returned an unreadable body"))?;
            return normalize(reply, what);
        }

        if status == StatusCode::NOT_FOUND {
            return Ok(RailResponse::with_status(RailStatus::NotFound, None));
        }

        // Remaining 4xx answers are business declines.
        let body = resp.text().await.unwrap_or_default();
        let parsed: Option<RailReply> = serde_json::from_str(&body).ok();
        let (code, message) = match parsed {
            Some(RailReply {
                error_code: Some(code),
                error_message,
                ..
            }) => (code, error_message.unwrap_or_default()),
            _ => (
                format!("HTTP_{}", status.as_u16()),
                body.chars().take(200).collect(),
            ),
        };
        Ok(RailResponse::declined(code, message))
    }
}

fn is_transport_status(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
}

/// A 2xx reply without a status is ambiguous and never read as a success.
fn normalize(reply: RailReply, what: &str) -> Result<RailResponse> {
    let Some(status) = reply.status else {
        anyhow::bail!("rail {what} reply carried no status");
    };
    Ok(RailResponse {
        status,
        rail_reference: reply.transaction_id.or(reply.refund_reference),
        failure_code: reply.error_code.or_else(|| {
            (status == RailStatus::Failed).then(|| "RAIL_DECLINED".to_string())
        }),
        failure_message: reply.error_message,
    })
}

#[async_trait::async_trait]
impl RailClient for HttpRailClient {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn validate_identifier(&self, identifier: &str) -> Result<bool> {
        let resp = self
            .request(reqwest::Method::POST, "/v1/identifiers/validate")
            .json(&json!({ "identifier": identifier }))
            .send()
            .await
            .context("rail identifier validation failed")?;

        let status = resp.status();
        if status.is_success() {
            let reply: ValidateReply = resp.json().await?;
            return Ok(reply.valid);
        }
        if is_transport_status(status) {
            anyhow::bail!("rail identifier validation returned HTTP {}", status.as_u16());
        }
        Ok(false)
    }

    async fn process_payment(&self, request: RailPaymentRequest) -> Result<RailResponse> {
        let req = self
            .request(reqwest::Method::POST, "/v1/payments")
            .json(&request);
        self.send(req, "payment").await
    }

    async fn process_refund(&self, request: RailRefundRequest) -> Result<RailResponse> {
        let req = self
            .request(reqwest::Method::POST, "/v1/refunds")
            .json(&request);
        self.send(req, "refund").await
    }

    async fn check_status(&self, reference: &str) -> Result<RailResponse> {
        let req = self.request(
            reqwest::Method::GET,
            &format!("/v1/transactions/{reference}"),
        );
        self.send(req, "status check").await
    }
}
