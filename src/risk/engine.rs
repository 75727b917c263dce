use std::net::IpAddr;

use chrono::{DateTime, Datelike, FixedOffset, Offset, Timelike, Utc, Weekday};
use rust_decimal::Decimal;

use crate::domain::context::RiskContext;
use crate::domain::risk::{RiskDecision, RiskLevel};
use crate::risk::types::{MerchantOutcomes, RiskFactors, RiskScore, RuleHit};

pub const BLOCK_THRESHOLD: f64 = 0.8;
pub const CHALLENGE_THRESHOLD: f64 = 0.5;

/// Used when the velocity query fails or times out.
pub const VELOCITY_FALLBACK: f64 = 0.5;
/// Used when the merchant history query fails or times out.
pub const MERCHANT_FALLBACK: f64 = 0.1;

pub fn clamp01(v: f64) -> f64 {
    if v < 0.0 {
        0.0
    } else if v > 1.0 {
        1.0
    } else {
        v
    }
}

pub fn amount_risk(amount: Decimal) -> f64 {
    if amount > Decimal::from(100_000) {
        0.9
    } else if amount > Decimal::from(50_000) {
        0.7
    } else if amount > Decimal::from(10_000) {
        0.4
    } else if amount > Decimal::from(1_000) {
        0.2
    } else {
        0.1
    }
}

pub fn velocity_risk(payments_last_hour: i64) -> f64 {
    match payments_last_hour {
        n if n > 10 => 1.0,
        n if n > 5 => 0.8,
        n if n > 3 => 0.5,
        n if n > 1 => 0.3,
        _ => 0.1,
    }
}

pub fn device_risk(device_id: Option<&str>) -> f64 {
    match device_id {
        Some(d) if !d.is_empty() => 0.2,
        _ => 0.6,
    }
}

pub fn ip_risk(ip: Option<&str>) -> f64 {
    let Some(raw) = ip.map(str::trim).filter(|s| !s.is_empty()) else {
        return 0.8;
    };
    if raw.eq_ignore_ascii_case("localhost") {
        return 0.9;
    }
    match raw.parse::<IpAddr>() {
        Ok(addr) if addr.is_loopback() || addr.is_unspecified() => 0.9,
        Ok(IpAddr::V4(v4)) if v4.is_private() || v4.is_link_local() => 0.6,
        Ok(IpAddr::V6(v6)) => {
            let first = v6.segments()[0];
            let unique_local = first & 0xfe00 == 0xfc00;
            let link_local = first & 0xffc0 == 0xfe80;
            if unique_local || link_local {
                0.6
            } else {
                0.2
            }
        }
        Ok(_) => 0.2,
        Err(_) => 0.8,
    }
}

pub fn time_of_day_risk(local_hour: u32) -> f64 {
    if local_hour >= 23 || local_hour < 6 {
        0.6
    } else if local_hour < 9 {
        0.3
    } else {
        0.1
    }
}

pub fn merchant_risk(outcomes: &MerchantOutcomes) -> f64 {
    if outcomes.total <= 0 {
        return 0.5;
    }
    let failure_rate = outcomes.failed as f64 / outcomes.total as f64;
    if failure_rate > 0.5 {
        1.0
    } else if failure_rate > 0.3 {
        0.8
    } else if failure_rate > 0.1 {
        0.4
    } else {
        0.1
    }
}

pub fn local_time(now: DateTime<Utc>, tz_offset_minutes: i32) -> DateTime<FixedOffset> {
    let offset = FixedOffset::east_opt(tz_offset_minutes * 60).unwrap_or_else(|| Utc.fix());
    now.with_timezone(&offset)
}

pub fn rule_hits(ctx: &RiskContext, local_now: DateTime<FixedOffset>) -> Vec<RuleHit> {
    let mut hits = Vec::new();
    if ctx.amount > Decimal::from(100_000) {
        hits.push(RuleHit {
            name: "HIGH_AMOUNT_TRANSACTION",
            adjustment: 0.3,
        });
    }
    if matches!(local_now.weekday(), Weekday::Sat | Weekday::Sun) {
        hits.push(RuleHit {
            name: "WEEKEND_TRANSACTION",
            adjustment: 0.1,
        });
    }
    if ctx.customer_id.is_none() && ctx.amount > Decimal::from(10_000) {
        hits.push(RuleHit {
            name: "FIRST_TIME_HIGH_AMOUNT",
            adjustment: 0.2,
        });
    }
    hits
}

pub fn level_for(score: f64) -> RiskLevel {
    if score >= BLOCK_THRESHOLD {
        RiskLevel::High
    } else if score >= CHALLENGE_THRESHOLD {
        RiskLevel::Medium
    } else {
        RiskLevel::Low
    }
}

pub fn decision_for(score: f64) -> RiskDecision {
    if score >= BLOCK_THRESHOLD {
        RiskDecision::Block
    } else if score >= CHALLENGE_THRESHOLD {
        RiskDecision::Challenge
    } else {
        RiskDecision::Pass
    }
}

/// Local factors come from the context; `velocity` and `merchant` are
/// supplied by the caller from history queries.
pub fn score_attempt(
    ctx: &RiskContext,
    velocity: f64,
    merchant: f64,
    local_now: DateTime<FixedOffset>,
) -> RiskScore {
    let factors = RiskFactors {
        amount: amount_risk(ctx.amount),
        velocity: clamp01(velocity),
        device: device_risk(ctx.device_id.as_deref()),
        ip: ip_risk(ctx.ip_address.as_deref()),
        time_of_day: time_of_day_risk(local_now.hour()),
        merchant: clamp01(merchant),
    };
    let rules = rule_hits(ctx, local_now);
    let adjustment: f64 = rules.iter().map(|r| r.adjustment).sum();
    let score = clamp01(factors.mean() + adjustment);

    RiskScore {
        score,
        level: level_for(score),
        decision: decision_for(score),
        factors,
        rules,
    }
}
