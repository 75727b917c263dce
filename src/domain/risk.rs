use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

string_enum!(RiskLevel {
    Low => "LOW",
    Medium => "MEDIUM",
    High => "HIGH",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskDecision {
    Pass,
    Challenge,
    Block,
}

string_enum!(RiskDecision {
    Pass => "PASS",
    Challenge => "CHALLENGE",
    Block => "BLOCK",
});

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub id: Uuid,
    pub intent_id: Uuid,
    pub risk_score: f64,
    pub risk_level: RiskLevel,
    pub decision: RiskDecision,
    pub factors: BTreeMap<String, f64>,
    pub triggered_rules: Vec<String>,
    pub device_id: Option<String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub created_at: DateTime<Utc>,
}
