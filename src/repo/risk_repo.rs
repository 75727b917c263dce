use anyhow::Result;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::domain::risk::RiskAssessment;
use crate::repo::store::RiskStore;

#[derive(Clone)]
pub struct RiskRepo {
    pub pool: PgPool,
}

const ASSESSMENT_COLUMNS: &str = "id, intent_id, risk_score, risk_level, decision, factors, triggered_rules, \
     device_id, ip_address, user_agent, created_at";

fn assessment_from_row(row: &PgRow) -> Result<RiskAssessment> {
    Ok(RiskAssessment {
        id: row.get("id"),
        intent_id: row.get("intent_id"),
        risk_score: row.get("risk_score"),
        risk_level: row.get::<String, _>("risk_level").parse()?,
        decision: row.get::<String, _>("decision").parse()?,
        factors: serde_json::from_value(row.get("factors"))?,
        triggered_rules: serde_json::from_value(row.get("triggered_rules"))?,
        device_id: row.get("device_id"),
        ip_address: row.get("ip_address"),
        user_agent: row.get("user_agent"),
        created_at: row.get("created_at"),
    })
}

#[async_trait::async_trait]
impl RiskStore for RiskRepo {
    async fn insert_assessment(&self, assessment: &RiskAssessment) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO risk_assessments
                (id, intent_id, risk_score, risk_level, decision, factors, triggered_rules,
                 device_id, ip_address, user_agent, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(assessment.id)
        .bind(assessment.intent_id)
        .bind(assessment.risk_score)
        .bind(assessment.risk_level.as_str())
        .bind(assessment.decision.as_str())
        .bind(serde_json::to_value(&assessment.factors)?)
        .bind(serde_json::to_value(&assessment.triggered_rules)?)
        .bind(&assessment.device_id)
        .bind(&assessment.ip_address)
        .bind(&assessment.user_agent)
        .bind(assessment.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_assessment(&self, id: Uuid) -> Result<Option<RiskAssessment>> {
        let row = sqlx::query(&format!("SELECT {ASSESSMENT_COLUMNS} FROM risk_assessments WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(assessment_from_row).transpose()
    }

    async fn assessments_for_intent(&self, intent_id: Uuid) -> Result<Vec<RiskAssessment>> {
        let rows = sqlx::query(&format!(
            "SELECT {ASSESSMENT_COLUMNS} FROM risk_assessments WHERE intent_id = $1 ORDER BY created_at"
        ))
        .bind(intent_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(assessment_from_row).collect()
    }
}
