use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

use crate::domain::idempotency::{IdempotencyBegin, IdempotencyRecord};
use crate::repo::store::IdempotencyStore;

#[derive(Clone)]
pub struct IdempotencyRepo {
    pub pool: PgPool,
}

fn record_from_row(row: &PgRow) -> Result<IdempotencyRecord> {
    let status_code: Option<i32> = row.get("status_code");
    Ok(IdempotencyRecord {
        key: row.get("key"),
        request_hash: row.get("request_hash"),
        state: row.get::<String, _>("state").parse()?,
        response_data: row.get("response_data"),
        status_code: status_code.map(u16::try_from).transpose()?,
        expires_at: row.get("expires_at"),
        created_at: row.get("created_at"),
    })
}

#[async_trait::async_trait]
impl IdempotencyStore for IdempotencyRepo {
    async fn begin(
        &self,
        key: &str,
        request_hash: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<IdempotencyBegin> {
        // An expired row is taken over in place; a live one is left untouched.
        let claimed = sqlx::query(
            r#"
            INSERT INTO idempotency_keys (key, request_hash, state, expires_at, created_at)
            VALUES ($1, $2, 'in_flight', $3, $4)
            ON CONFLICT (key) DO UPDATE
            SET request_hash = EXCLUDED.request_hash,
                state = 'in_flight',
                response_data = NULL,
                status_code = NULL,
                expires_at = EXCLUDED.expires_at,
                created_at = EXCLUDED.created_at
            WHERE idempotency_keys.expires_at <= $4
            RETURNING key
            "#,
        )
        .bind(key)
        .bind(request_hash)
        .bind(expires_at)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        if claimed.is_some() {
            return Ok(IdempotencyBegin::Claimed);
        }

        let row = sqlx::query(
            r#"
            SELECT key, request_hash, state, response_data, status_code, expires_at, created_at
            FROM idempotency_keys
            WHERE key = $1
            "#,
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| anyhow!("idempotency key {key} disappeared during claim"))?;

        Ok(IdempotencyBegin::Existing(record_from_row(&row)?))
    }

    async fn complete(
        &self,
        key: &str,
        request_hash: &str,
        response: &serde_json::Value,
        status_code: u16,
        expires_at: DateTime<Utc>,
    ) -> Result<bool> {
        let res = sqlx::query(
            r#"
            UPDATE idempotency_keys
            SET state = 'completed', response_data = $3, status_code = $4, expires_at = $5
            WHERE key = $1 AND request_hash = $2 AND state = 'in_flight'
            "#,
        )
        .bind(key)
        .bind(request_hash)
        .bind(response)
        .bind(i32::from(status_code))
        .bind(expires_at)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() == 1)
    }

    async fn release(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM idempotency_keys WHERE key = $1 AND state = 'in_flight'")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let res = sqlx::query("DELETE FROM idempotency_keys WHERE expires_at <= $1")
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected())
    }
}
