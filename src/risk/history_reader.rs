use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::repo::store::RiskHistory;
use crate::risk::engine::{merchant_risk, velocity_risk, MERCHANT_FALLBACK, VELOCITY_FALLBACK};
use crate::risk::types::VelocityScope;

/// Velocity factor over the hour before `now`. Query failures and timeouts
/// fall back to a neutral score rather than failing the payment.
pub async fn read_velocity_risk(
    history: &dyn RiskHistory,
    scope: &VelocityScope,
    now: DateTime<Utc>,
    timeout: Duration,
) -> f64 {
    let since = now - chrono::Duration::hours(1);
    match tokio::time::timeout(timeout, history.payments_since(scope, since)).await {
        Ok(Ok(count)) => velocity_risk(count),
        Ok(Err(err)) => {
            tracing::warn!(?scope, error = %err, "velocity query failed, using fallback");
            VELOCITY_FALLBACK
        }
        Err(_) => {
            tracing::warn!(?scope, "velocity query timed out, using fallback");
            VELOCITY_FALLBACK
        }
    }
}

/// Merchant failure-rate factor over the 24 hours before `now`.
pub async fn read_merchant_risk(
    history: &dyn RiskHistory,
    merchant_id: &str,
    now: DateTime<Utc>,
    timeout: Duration,
) -> f64 {
    let since = now - chrono::Duration::hours(24);
    match tokio::time::timeout(timeout, history.merchant_outcomes_since(merchant_id, since)).await {
        Ok(Ok(outcomes)) => merchant_risk(&outcomes),
        Ok(Err(err)) => {
            tracing::warn!(merchant_id, error = %err, "merchant history query failed, using fallback");
            MERCHANT_FALLBACK
        }
        Err(_) => {
            tracing::warn!(merchant_id, "merchant history query timed out, using fallback");
            MERCHANT_FALLBACK
        }
    }
}
