use anyhow::Result;
use rust_decimal::Decimal;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::domain::payment::PaymentStatus;
use crate::domain::refund::Refund;
use crate::repo::outbox_repo::OutboxRepo;
use crate::repo::store::{BeginRefund, RefundOutcome, RefundStore};

#[derive(Clone)]
pub struct RefundsRepo {
    pub pool: PgPool,
}

const REFUND_COLUMNS: &str = "id, payment_id, merchant_id, amount, currency, reason, status, refund_reference, \
     rail_reference, failure_code, failure_message, processed_at, created_at, updated_at";

fn refund_from_row(row: &PgRow) -> Result<Refund> {
    Ok(Refund {
        id: row.get("id"),
        payment_id: row.get("payment_id"),
        merchant_id: row.get("merchant_id"),
        amount: row.get("amount"),
        currency: row.get("currency"),
        reason: row.get("reason"),
        status: row.get::<String, _>("status").parse()?,
        refund_reference: row.get("refund_reference"),
        rail_reference: row.get("rail_reference"),
        failure_code: row.get("failure_code"),
        failure_message: row.get("failure_message"),
        processed_at: row.get("processed_at"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

#[async_trait::async_trait]
impl RefundStore for RefundsRepo {
    async fn begin_refund(&self, refund: &Refund) -> Result<BeginRefund> {
        let mut tx = self.pool.begin().await?;

        // Row lock on the payment serializes concurrent refunds against it.
        let payment = sqlx::query("SELECT status, amount FROM payments WHERE id = $1 FOR UPDATE")
            .bind(refund.payment_id)
            .fetch_optional(&mut *tx)
            .await?;

        let Some(payment) = payment else {
            tx.rollback().await?;
            return Ok(BeginRefund::PaymentMissing);
        };
        let status: PaymentStatus = payment.get::<String, _>("status").parse()?;
        if status != PaymentStatus::Succeeded {
            tx.rollback().await?;
            return Ok(BeginRefund::PaymentNotSucceeded(status));
        }
        let payment_amount: Decimal = payment.get("amount");

        let reserved: Decimal = sqlx::query(
            r#"
            SELECT COALESCE(SUM(amount), 0) AS reserved
            FROM refunds
            WHERE payment_id = $1 AND status IN ('pending', 'processing', 'succeeded')
            "#,
        )
        .bind(refund.payment_id)
        .fetch_one(&mut *tx)
        .await?
        .get("reserved");

        if reserved + refund.amount > payment_amount {
            tx.rollback().await?;
            return Ok(BeginRefund::CapExceeded {
                already_reserved: reserved,
            });
        }

        sqlx::query(
            r#"
            INSERT INTO refunds
                (id, payment_id, merchant_id, amount, currency, reason, status,
                 refund_reference, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, 'pending', $7, $8, $9)
            "#,
        )
        .bind(refund.id)
        .bind(refund.payment_id)
        .bind(&refund.merchant_id)
        .bind(refund.amount)
        .bind(&refund.currency)
        .bind(&refund.reason)
        .bind(&refund.refund_reference)
        .bind(refund.created_at)
        .bind(refund.updated_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(BeginRefund::Started)
    }

    async fn mark_refund_processing(&self, id: Uuid) -> Result<bool> {
        let res = sqlx::query(
            "UPDATE refunds SET status = 'processing', updated_at = now() WHERE id = $1 AND status = 'pending'",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() == 1)
    }

    async fn complete_refund(&self, outcome: &RefundOutcome) -> Result<bool> {
        let refund = &outcome.refund;
        let mut tx = self.pool.begin().await?;

        let res = sqlx::query(
            r#"
            UPDATE refunds
            SET status = $2,
                rail_reference = $3,
                failure_code = $4,
                failure_message = $5,
                processed_at = $6,
                updated_at = now()
            WHERE id = $1 AND status IN ('pending', 'processing')
            "#,
        )
        .bind(refund.id)
        .bind(refund.status.as_str())
        .bind(&refund.rail_reference)
        .bind(&refund.failure_code)
        .bind(&refund.failure_message)
        .bind(refund.processed_at)
        .execute(&mut *tx)
        .await?;

        if res.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        if let Some(post) = &outcome.ledger_post {
            OutboxRepo::insert_ledger_post_tx(&mut tx, post).await?;
        }
        OutboxRepo::insert_event_tx(&mut tx, &outcome.event).await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn cancel_refund(&self, outcome: &RefundOutcome) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let res = sqlx::query(
            r#"
            UPDATE refunds
            SET status = 'canceled', failure_message = $2, updated_at = now()
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(outcome.refund.id)
        .bind(&outcome.refund.failure_message)
        .execute(&mut *tx)
        .await?;

        if res.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        OutboxRepo::insert_event_tx(&mut tx, &outcome.event).await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn get_refund(&self, id: Uuid) -> Result<Option<Refund>> {
        let row = sqlx::query(&format!("SELECT {REFUND_COLUMNS} FROM refunds WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(refund_from_row).transpose()
    }

    async fn refunds_for_payment(&self, payment_id: Uuid) -> Result<Vec<Refund>> {
        let rows = sqlx::query(&format!(
            "SELECT {REFUND_COLUMNS} FROM refunds WHERE payment_id = $1 ORDER BY created_at"
        ))
        .bind(payment_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(refund_from_row).collect()
    }

    async fn in_flight_refunds(&self, limit: i64) -> Result<Vec<Refund>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {REFUND_COLUMNS} FROM refunds
            WHERE status IN ('pending', 'processing')
            ORDER BY created_at
            LIMIT $1
            "#
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(refund_from_row).collect()
    }
}
