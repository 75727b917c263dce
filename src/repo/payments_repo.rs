use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::domain::intent::{IntentStatus, PaymentIntent};
use crate::domain::outbox::OutboxEvent;
use crate::domain::payment::{Payment, PaymentStatus};
use crate::repo::outbox_repo::OutboxRepo;
use crate::repo::store::{BeginPayment, PaymentOutcome, PaymentStore, RiskHistory};
use crate::risk::types::{MerchantOutcomes, VelocityScope};

#[derive(Clone)]
pub struct PaymentsRepo {
    pub pool: PgPool,
}

const INTENT_COLUMNS: &str = "id, merchant_id, amount, currency, payment_method, customer_id, description, \
     metadata, status, expires_at, created_at, updated_at";

const PAYMENT_COLUMNS: &str = "id, intent_id, merchant_id, customer_id, amount, currency, payment_method, \
     payer_id, payee_id, status, rail_transaction_id, failure_code, failure_message, risk_assessment_id, \
     processed_at, created_at, updated_at";

fn intent_from_row(row: &PgRow) -> Result<PaymentIntent> {
    Ok(PaymentIntent {
        id: row.get("id"),
        merchant_id: row.get("merchant_id"),
        amount: row.get("amount"),
        currency: row.get("currency"),
        payment_method: row.get::<String, _>("payment_method").parse()?,
        customer_id: row.get("customer_id"),
        description: row.get("description"),
        metadata: row.get("metadata"),
        status: row.get::<String, _>("status").parse()?,
        expires_at: row.get("expires_at"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

pub(crate) fn payment_from_row(row: &PgRow) -> Result<Payment> {
    Ok(Payment {
        id: row.get("id"),
        intent_id: row.get("intent_id"),
        merchant_id: row.get("merchant_id"),
        customer_id: row.get("customer_id"),
        amount: row.get("amount"),
        currency: row.get("currency"),
        payment_method: row.get::<String, _>("payment_method").parse()?,
        payer_id: row.get("payer_id"),
        payee_id: row.get("payee_id"),
        status: row.get::<String, _>("status").parse()?,
        rail_transaction_id: row.get("rail_transaction_id"),
        failure_code: row.get("failure_code"),
        failure_message: row.get("failure_message"),
        risk_assessment_id: row.get("risk_assessment_id"),
        processed_at: row.get("processed_at"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

#[async_trait::async_trait]
impl PaymentStore for PaymentsRepo {
    async fn insert_intent(&self, intent: &PaymentIntent, event: &OutboxEvent) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO payment_intents
                (id, merchant_id, amount, currency, payment_method, customer_id, description,
                 metadata, status, expires_at, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(intent.id)
        .bind(&intent.merchant_id)
        .bind(intent.amount)
        .bind(&intent.currency)
        .bind(intent.payment_method.as_str())
        .bind(&intent.customer_id)
        .bind(&intent.description)
        .bind(&intent.metadata)
        .bind(intent.status.as_str())
        .bind(intent.expires_at)
        .bind(intent.created_at)
        .bind(intent.updated_at)
        .execute(&mut *tx)
        .await?;

        OutboxRepo::insert_event_tx(&mut tx, event).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn get_intent(&self, id: Uuid) -> Result<Option<PaymentIntent>> {
        let row = sqlx::query(&format!("SELECT {INTENT_COLUMNS} FROM payment_intents WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(intent_from_row).transpose()
    }

    async fn expire_intent(&self, id: Uuid) -> Result<bool> {
        let res = sqlx::query(
            "UPDATE payment_intents SET status = 'expired', updated_at = now() WHERE id = $1 AND status = 'created'",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() == 1)
    }

    async fn cancel_intent(&self, id: Uuid, event: &OutboxEvent) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let res = sqlx::query(
            r#"
            UPDATE payment_intents
            SET status = 'canceled', updated_at = now()
            WHERE id = $1
              AND status = 'created'
              AND NOT EXISTS (
                  SELECT 1 FROM payments
                  WHERE intent_id = $1 AND status IN ('pending', 'processing')
              )
            "#,
        )
        .bind(id)
        .execute(&mut *tx)
        .await?;

        if res.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        OutboxRepo::insert_event_tx(&mut tx, event).await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn begin_payment(&self, payment: &Payment) -> Result<BeginPayment> {
        let mut tx = self.pool.begin().await?;
        let intent = sqlx::query("SELECT status FROM payment_intents WHERE id = $1 FOR UPDATE")
            .bind(payment.intent_id)
            .fetch_optional(&mut *tx)
            .await?;

        let Some(intent) = intent else {
            tx.rollback().await?;
            return Ok(BeginPayment::IntentMissing);
        };
        let status: IntentStatus = intent.get::<String, _>("status").parse()?;
        if status != IntentStatus::Created {
            tx.rollback().await?;
            return Ok(BeginPayment::IntentNotOpen(status));
        }

        // uq_payments_intent_active turns a second live payment into a no-op.
        let inserted = sqlx::query(
            r#"
            INSERT INTO payments
                (id, intent_id, merchant_id, customer_id, amount, currency, payment_method,
                 payer_id, payee_id, status, risk_assessment_id, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, 'pending', $10, $11, $12)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(payment.id)
        .bind(payment.intent_id)
        .bind(&payment.merchant_id)
        .bind(&payment.customer_id)
        .bind(payment.amount)
        .bind(&payment.currency)
        .bind(payment.payment_method.as_str())
        .bind(&payment.payer_id)
        .bind(&payment.payee_id)
        .bind(payment.risk_assessment_id)
        .bind(payment.created_at)
        .bind(payment.updated_at)
        .execute(&mut *tx)
        .await?;

        if inserted.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(BeginPayment::AlreadyInFlight);
        }

        tx.commit().await?;
        Ok(BeginPayment::Started)
    }

    async fn mark_payment_processing(&self, id: Uuid) -> Result<bool> {
        let res = sqlx::query(
            "UPDATE payments SET status = 'processing', updated_at = now() WHERE id = $1 AND status = 'pending'",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() == 1)
    }

    async fn complete_payment(&self, outcome: &PaymentOutcome) -> Result<bool> {
        let payment = &outcome.payment;
        let mut tx = self.pool.begin().await?;

        let res = sqlx::query(
            r#"
            UPDATE payments
            SET status = $2,
                rail_transaction_id = $3,
                failure_code = $4,
                failure_message = $5,
                processed_at = $6,
                updated_at = now()
            WHERE id = $1 AND status IN ('pending', 'processing')
            "#,
        )
        .bind(payment.id)
        .bind(payment.status.as_str())
        .bind(&payment.rail_transaction_id)
        .bind(&payment.failure_code)
        .bind(&payment.failure_message)
        .bind(payment.processed_at)
        .execute(&mut *tx)
        .await?;

        if res.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        if payment.status == PaymentStatus::Succeeded {
            sqlx::query(
                r#"
                UPDATE payment_intents
                SET status = 'succeeded', updated_at = now()
                WHERE id = $1 AND status IN ('created', 'expired')
                "#,
            )
            .bind(payment.intent_id)
            .execute(&mut *tx)
            .await?;
        }

        if let Some(post) = &outcome.ledger_post {
            OutboxRepo::insert_ledger_post_tx(&mut tx, post).await?;
        }
        OutboxRepo::insert_event_tx(&mut tx, &outcome.event).await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn get_payment(&self, id: Uuid) -> Result<Option<Payment>> {
        let row = sqlx::query(&format!("SELECT {PAYMENT_COLUMNS} FROM payments WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(payment_from_row).transpose()
    }

    async fn payments_for_intent(&self, intent_id: Uuid) -> Result<Vec<Payment>> {
        let rows = sqlx::query(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments WHERE intent_id = $1 ORDER BY created_at"
        ))
        .bind(intent_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(payment_from_row).collect()
    }

    async fn stale_in_flight_payments(&self, updated_before: DateTime<Utc>, limit: i64) -> Result<Vec<Payment>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {PAYMENT_COLUMNS} FROM payments
            WHERE status IN ('pending', 'processing') AND updated_at < $1
            ORDER BY updated_at
            LIMIT $2
            "#
        ))
        .bind(updated_before)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(payment_from_row).collect()
    }
}

#[async_trait::async_trait]
impl RiskHistory for PaymentsRepo {
    async fn payments_since(&self, scope: &VelocityScope, since: DateTime<Utc>) -> Result<i64> {
        let (column, value) = match scope {
            VelocityScope::Customer(c) => ("customer_id", c),
            VelocityScope::Merchant(m) => ("merchant_id", m),
        };
        let row = sqlx::query(&format!(
            "SELECT COUNT(*) AS n FROM payments WHERE {column} = $1 AND created_at >= $2"
        ))
        .bind(value)
        .bind(since)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get("n"))
    }

    async fn merchant_outcomes_since(&self, merchant_id: &str, since: DateTime<Utc>) -> Result<MerchantOutcomes> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS total,
                   COUNT(*) FILTER (WHERE status = 'failed') AS failed
            FROM payments
            WHERE merchant_id = $1 AND created_at >= $2
            "#,
        )
        .bind(merchant_id)
        .bind(since)
        .fetch_one(&self.pool)
        .await?;

        Ok(MerchantOutcomes {
            total: row.get("total"),
            failed: row.get("failed"),
        })
    }
}
