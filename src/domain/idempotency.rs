use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdempotencyState {
    InFlight,
    Completed,
}

string_enum!(IdempotencyState {
    InFlight => "in_flight",
    Completed => "completed",
});

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub key: String,
    pub request_hash: String,
    pub state: IdempotencyState,
    pub response_data: Option<serde_json::Value>,
    pub status_code: Option<u16>,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Result of an insert-or-fetch on a key.
#[derive(Debug, Clone)]
pub enum IdempotencyBegin {
    Claimed,
    Existing(IdempotencyRecord),
}

pub fn request_hash(body: &[u8]) -> String {
    hex::encode(Sha256::digest(body))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_hex_sha256() {
        assert_eq!(
            request_hash(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_ne!(request_hash(b"{\"a\":1}"), request_hash(b"{\"a\":2}"));
    }
}
