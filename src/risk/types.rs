use std::collections::BTreeMap;

use crate::domain::risk::{RiskDecision, RiskLevel};

/// The six independent factor scores, each in [0, 1].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RiskFactors {
    pub amount: f64,
    pub velocity: f64,
    pub device: f64,
    pub ip: f64,
    pub time_of_day: f64,
    pub merchant: f64,
}

impl RiskFactors {
    pub fn mean(&self) -> f64 {
        (self.amount + self.velocity + self.device + self.ip + self.time_of_day + self.merchant) / 6.0
    }

    pub fn to_map(&self) -> BTreeMap<String, f64> {
        BTreeMap::from([
            ("amount_risk".to_string(), self.amount),
            ("velocity_risk".to_string(), self.velocity),
            ("device_risk".to_string(), self.device),
            ("ip_risk".to_string(), self.ip),
            ("time_risk".to_string(), self.time_of_day),
            ("merchant_risk".to_string(), self.merchant),
        ])
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RuleHit {
    pub name: &'static str,
    pub adjustment: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RiskScore {
    pub score: f64,
    pub level: RiskLevel,
    pub decision: RiskDecision,
    pub factors: RiskFactors,
    pub rules: Vec<RuleHit>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VelocityScope {
    Customer(String),
    Merchant(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MerchantOutcomes {
    pub total: i64,
    pub failed: i64,
}
