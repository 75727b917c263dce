use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::config::RiskConfig;
use crate::domain::context::RiskContext;
use crate::domain::risk::RiskAssessment;
use crate::error::{CoreError, Result};
use crate::repo::store::{RiskHistory, RiskStore};
use crate::risk::engine::{local_time, score_attempt};
use crate::risk::history_reader::{read_merchant_risk, read_velocity_risk};
use crate::risk::types::VelocityScope;

#[derive(Clone)]
pub struct RiskService {
    store: Arc<dyn RiskStore>,
    history: Arc<dyn RiskHistory>,
    config: RiskConfig,
}

impl RiskService {
    pub fn new(store: Arc<dyn RiskStore>, history: Arc<dyn RiskHistory>, config: RiskConfig) -> Self {
        Self {
            store,
            history,
            config,
        }
    }

    pub async fn assess(&self, ctx: &RiskContext) -> Result<RiskAssessment> {
        self.assess_at(ctx, Utc::now()).await
    }

    /// Scores one attempt as of `now` and persists the assessment before
    /// returning it.
    pub async fn assess_at(&self, ctx: &RiskContext, now: DateTime<Utc>) -> Result<RiskAssessment> {
        let scope = match &ctx.customer_id {
            Some(customer) => VelocityScope::Customer(customer.clone()),
            None => VelocityScope::Merchant(ctx.merchant_id.clone()),
        };

        let (velocity, merchant) = tokio::join!(
            read_velocity_risk(self.history.as_ref(), &scope, now, self.config.query_timeout),
            read_merchant_risk(self.history.as_ref(), &ctx.merchant_id, now, self.config.query_timeout),
        );

        let scored = score_attempt(ctx, velocity, merchant, local_time(now, self.config.tz_offset_minutes));

        let assessment = RiskAssessment {
            id: Uuid::new_v4(),
            intent_id: ctx.intent_id,
            risk_score: scored.score,
            risk_level: scored.level,
            decision: scored.decision,
            factors: scored.factors.to_map(),
            triggered_rules: scored.rules.iter().map(|r| r.name.to_string()).collect(),
            device_id: ctx.device_id.clone(),
            ip_address: ctx.ip_address.clone(),
            user_agent: ctx.user_agent.clone(),
            created_at: now,
        };
        self.store.insert_assessment(&assessment).await?;

        tracing::info!(
            intent_id = %ctx.intent_id,
            assessment_id = %assessment.id,
            score = assessment.risk_score,
            decision = %assessment.decision,
            rules = ?assessment.triggered_rules,
            "risk assessed"
        );
        Ok(assessment)
    }

    pub async fn get_assessment(&self, id: Uuid) -> Result<RiskAssessment> {
        self.store
            .get_assessment(id)
            .await?
            .ok_or_else(|| CoreError::not_found("risk assessment", id))
    }

    pub async fn assessments_for_intent(&self, intent_id: Uuid) -> Result<Vec<RiskAssessment>> {
        Ok(self.store.assessments_for_intent(intent_id).await?)
    }
}
