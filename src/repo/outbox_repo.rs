use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

use crate::domain::outbox::{LedgerPostStatus, OutboxEvent, OutboxStatus, PendingLedgerPost};
use crate::repo::store::OutboxStore;

#[derive(Clone)]
pub struct OutboxRepo {
    pub pool: PgPool,
}

fn event_from_row(row: &PgRow) -> Result<OutboxEvent> {
    Ok(OutboxEvent {
        id: row.get("id"),
        merchant_id: row.get("merchant_id"),
        event_type: row.get("event_type"),
        payload: row.get("payload_json"),
        status: row.get::<String, _>("status").parse()?,
        attempts: row.get("attempts"),
        next_attempt_at: row.get("next_attempt_at"),
        created_at: row.get("created_at"),
        published_at: row.get("published_at"),
    })
}

fn post_from_row(row: &PgRow) -> Result<PendingLedgerPost> {
    Ok(PendingLedgerPost {
        transaction: serde_json::from_value(row.get("transaction_json"))?,
        status: row.get::<String, _>("status").parse()?,
        attempts: row.get("attempts"),
        last_error: row.get("last_error"),
        next_attempt_at: row.get("next_attempt_at"),
        created_at: row.get("created_at"),
        posted_at: row.get("posted_at"),
    })
}

impl OutboxRepo {
    pub async fn insert_event_tx(tx: &mut Transaction<'_, Postgres>, event: &OutboxEvent) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO webhook_event_outbox
                (id, merchant_id, event_type, payload_json, status, attempts, next_attempt_at, created_at)
            VALUES ($1, $2, $3, $4, 'PENDING', 0, $5, $6)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(event.id)
        .bind(&event.merchant_id)
        .bind(&event.event_type)
        .bind(&event.payload)
        .bind(event.next_attempt_at)
        .bind(event.created_at)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    pub async fn insert_ledger_post_tx(
        tx: &mut Transaction<'_, Postgres>,
        post: &PendingLedgerPost,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO ledger_post_outbox
                (transaction_id, transaction_json, status, attempts, next_attempt_at, created_at)
            VALUES ($1, $2, 'PENDING', 0, $3, $4)
            ON CONFLICT (transaction_id) DO NOTHING
            "#,
        )
        .bind(post.id())
        .bind(serde_json::to_value(&post.transaction)?)
        .bind(post.next_attempt_at)
        .bind(post.created_at)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }
}

#[async_trait::async_trait]
impl OutboxStore for OutboxRepo {
    async fn claim_events(&self, now: DateTime<Utc>, lease: Duration, limit: i64) -> Result<Vec<OutboxEvent>> {
        let mut tx = self.pool.begin().await?;
        let rows = sqlx::query(
            r#"
            SELECT id, merchant_id, event_type, payload_json, status, attempts,
                   next_attempt_at, created_at, published_at
            FROM webhook_event_outbox
            WHERE status IN ('PENDING', 'PROCESSING') AND next_attempt_at <= $1
            ORDER BY created_at ASC
            LIMIT $2
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&mut *tx)
        .await?;

        if rows.is_empty() {
            tx.rollback().await?;
            return Ok(Vec::new());
        }

        let ids: Vec<Uuid> = rows.iter().map(|r| r.get("id")).collect();
        let lease_until = now + lease;
        sqlx::query(
            "UPDATE webhook_event_outbox SET status = 'PROCESSING', next_attempt_at = $2 WHERE id = ANY($1)",
        )
        .bind(&ids)
        .bind(lease_until)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        rows.iter()
            .map(|r| {
                let mut event = event_from_row(r)?;
                event.status = OutboxStatus::Processing;
                event.next_attempt_at = lease_until;
                Ok(event)
            })
            .collect()
    }

    async fn mark_event_published(&self, id: Uuid) -> Result<()> {
        sqlx::query(
            "UPDATE webhook_event_outbox SET status = 'PUBLISHED', published_at = now() WHERE id = $1",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_event_retry(&self, id: Uuid, attempts: i32, next_attempt_at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "UPDATE webhook_event_outbox SET status = 'PENDING', attempts = $2, next_attempt_at = $3 WHERE id = $1",
        )
        .bind(id)
        .bind(attempts)
        .bind(next_attempt_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn claim_ledger_posts(&self, now: DateTime<Utc>, lease: Duration, limit: i64) -> Result<Vec<PendingLedgerPost>> {
        let mut tx = self.pool.begin().await?;
        let rows = sqlx::query(
            r#"
            SELECT transaction_id, transaction_json, status, attempts, last_error,
                   next_attempt_at, created_at, posted_at
            FROM ledger_post_outbox
            WHERE status IN ('PENDING', 'PROCESSING') AND next_attempt_at <= $1
            ORDER BY created_at ASC
            LIMIT $2
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&mut *tx)
        .await?;

        if rows.is_empty() {
            tx.rollback().await?;
            return Ok(Vec::new());
        }

        let ids: Vec<Uuid> = rows.iter().map(|r| r.get("transaction_id")).collect();
        let lease_until = now + lease;
        sqlx::query(
            "UPDATE ledger_post_outbox SET status = 'PROCESSING', next_attempt_at = $2 WHERE transaction_id = ANY($1)",
        )
        .bind(&ids)
        .bind(lease_until)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        rows.iter()
            .map(|r| {
                let mut post = post_from_row(r)?;
                post.status = LedgerPostStatus::Processing;
                post.next_attempt_at = lease_until;
                Ok(post)
            })
            .collect()
    }

    async fn claim_ledger_post(&self, id: Uuid, now: DateTime<Utc>, lease: Duration) -> Result<Option<PendingLedgerPost>> {
        let row = sqlx::query(
            r#"
            UPDATE ledger_post_outbox
            SET status = 'PROCESSING', next_attempt_at = $3
            WHERE transaction_id = $1
              AND status IN ('PENDING', 'PROCESSING')
              AND next_attempt_at <= $2
            RETURNING transaction_id, transaction_json, status, attempts, last_error,
                      next_attempt_at, created_at, posted_at
            "#,
        )
        .bind(id)
        .bind(now)
        .bind(now + lease)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(post_from_row).transpose()
    }

    async fn mark_ledger_posted(&self, id: Uuid) -> Result<()> {
        sqlx::query(
            "UPDATE ledger_post_outbox SET status = 'POSTED', posted_at = now(), last_error = NULL WHERE transaction_id = $1",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_ledger_retry(&self, id: Uuid, attempts: i32, next_attempt_at: DateTime<Utc>, error: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE ledger_post_outbox
            SET status = 'PENDING', attempts = $2, next_attempt_at = $3, last_error = $4
            WHERE transaction_id = $1
            "#,
        )
        .bind(id)
        .bind(attempts)
        .bind(next_attempt_at)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_ledger_failed(&self, id: Uuid, error: &str) -> Result<()> {
        sqlx::query("UPDATE ledger_post_outbox SET status = 'FAILED', last_error = $2 WHERE transaction_id = $1")
            .bind(id)
            .bind(error)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_ledger_post(&self, id: Uuid) -> Result<Option<PendingLedgerPost>> {
        let row = sqlx::query(
            r#"
            SELECT transaction_id, transaction_json, status, attempts, last_error,
                   next_attempt_at, created_at, posted_at
            FROM ledger_post_outbox
            WHERE transaction_id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(post_from_row).transpose()
    }
}
