use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::ledger::LedgerTransaction;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutboxStatus {
    Pending,
    Processing,
    Published,
}

string_enum!(OutboxStatus {
    Pending => "PENDING",
    Processing => "PROCESSING",
    Published => "PUBLISHED",
});

/// A webhook event committed together with the state change it describes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxEvent {
    pub id: Uuid,
    pub merchant_id: String,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub status: OutboxStatus,
    pub attempts: i32,
    pub next_attempt_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
}

impl OutboxEvent {
    pub fn new(merchant_id: &str, event_type: &str, payload: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            merchant_id: merchant_id.to_string(),
            event_type: event_type.to_string(),
            payload,
            status: OutboxStatus::Pending,
            attempts: 0,
            next_attempt_at: now,
            created_at: now,
            published_at: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LedgerPostStatus {
    Pending,
    Processing,
    Posted,
    Failed,
}

string_enum!(LedgerPostStatus {
    Pending => "PENDING",
    Processing => "PROCESSING",
    Posted => "POSTED",
    Failed => "FAILED",
});

/// A ledger transaction owed for a committed payment or refund outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingLedgerPost {
    pub transaction: LedgerTransaction,
    pub status: LedgerPostStatus,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub next_attempt_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub posted_at: Option<DateTime<Utc>>,
}

impl PendingLedgerPost {
    pub fn new(transaction: LedgerTransaction) -> Self {
        let now = Utc::now();
        Self {
            transaction,
            status: LedgerPostStatus::Pending,
            attempts: 0,
            last_error: None,
            next_attempt_at: now,
            created_at: now,
            posted_at: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.transaction.id
    }
}

/// Relay backoff: 2^attempts seconds, capped at five minutes.
pub fn retry_backoff(attempts: i32) -> Duration {
    let secs = i64::min(300, 2_i64.pow(attempts.clamp(0, 9) as u32));
    Duration::seconds(secs)
}
