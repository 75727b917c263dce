use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::domain::webhook::{DeliveryStatus, WebhookDelivery, WebhookEndpoint};
use crate::repo::store::WebhookStore;

#[derive(Clone)]
pub struct WebhookRepo {
    pub pool: PgPool,
}

const ENDPOINT_COLUMNS: &str =
    "id, merchant_id, url, secret, events, active, version, description, created_at, updated_at";

const DELIVERY_COLUMNS: &str = "id, endpoint_id, event_id, event_type, payload, signature, status, attempt_count, \
     max_attempts, next_attempt_at, response_status, response_body, failure_reason, delivered_at, \
     created_at, updated_at";

fn endpoint_from_row(row: &PgRow) -> WebhookEndpoint {
    WebhookEndpoint {
        id: row.get("id"),
        merchant_id: row.get("merchant_id"),
        url: row.get("url"),
        secret: row.get("secret"),
        events: row.get("events"),
        active: row.get("active"),
        version: row.get("version"),
        description: row.get("description"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

fn delivery_from_row(row: &PgRow) -> Result<WebhookDelivery> {
    Ok(WebhookDelivery {
        id: row.get("id"),
        endpoint_id: row.get("endpoint_id"),
        event_id: row.get("event_id"),
        event_type: row.get("event_type"),
        payload: row.get("payload"),
        signature: row.get("signature"),
        status: row.get::<String, _>("status").parse()?,
        attempt_count: row.get("attempt_count"),
        max_attempts: row.get("max_attempts"),
        next_attempt_at: row.get("next_attempt_at"),
        response_status: row.get("response_status"),
        response_body: row.get("response_body"),
        failure_reason: row.get("failure_reason"),
        delivered_at: row.get("delivered_at"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

#[async_trait::async_trait]
impl WebhookStore for WebhookRepo {
    async fn insert_endpoint(&self, endpoint: &WebhookEndpoint) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO webhook_endpoints
                (id, merchant_id, url, secret, events, active, version, description, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(endpoint.id)
        .bind(&endpoint.merchant_id)
        .bind(&endpoint.url)
        .bind(&endpoint.secret)
        .bind(&endpoint.events)
        .bind(endpoint.active)
        .bind(&endpoint.version)
        .bind(&endpoint.description)
        .bind(endpoint.created_at)
        .bind(endpoint.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_endpoint(&self, id: Uuid) -> Result<Option<WebhookEndpoint>> {
        let row = sqlx::query(&format!("SELECT {ENDPOINT_COLUMNS} FROM webhook_endpoints WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(endpoint_from_row))
    }

    async fn endpoints_for_merchant(&self, merchant_id: &str) -> Result<Vec<WebhookEndpoint>> {
        let rows = sqlx::query(&format!(
            "SELECT {ENDPOINT_COLUMNS} FROM webhook_endpoints WHERE merchant_id = $1 ORDER BY created_at"
        ))
        .bind(merchant_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(endpoint_from_row).collect())
    }

    async fn update_endpoint(&self, endpoint: &WebhookEndpoint) -> Result<bool> {
        let res = sqlx::query(
            r#"
            UPDATE webhook_endpoints
            SET url = $2, events = $3, active = $4, description = $5, updated_at = $6
            WHERE id = $1
            "#,
        )
        .bind(endpoint.id)
        .bind(&endpoint.url)
        .bind(&endpoint.events)
        .bind(endpoint.active)
        .bind(&endpoint.description)
        .bind(endpoint.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() == 1)
    }

    async fn delete_endpoint(&self, id: Uuid) -> Result<bool> {
        let res = sqlx::query("DELETE FROM webhook_endpoints WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected() == 1)
    }

    async fn active_endpoints_for_event(&self, merchant_id: &str, event_type: &str) -> Result<Vec<WebhookEndpoint>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {ENDPOINT_COLUMNS} FROM webhook_endpoints
            WHERE merchant_id = $1
              AND active
              AND ($2 = ANY(events) OR '*' = ANY(events))
            ORDER BY created_at
            "#
        ))
        .bind(merchant_id)
        .bind(event_type)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(endpoint_from_row).collect())
    }

    async fn insert_deliveries(&self, deliveries: &[WebhookDelivery]) -> Result<Vec<WebhookDelivery>> {
        let mut tx = self.pool.begin().await?;
        let mut inserted = Vec::with_capacity(deliveries.len());

        for delivery in deliveries {
            let res = sqlx::query(
                r#"
                INSERT INTO webhook_deliveries
                    (id, endpoint_id, event_id, event_type, payload, signature, status,
                     attempt_count, max_attempts, next_attempt_at, created_at, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
                ON CONFLICT (endpoint_id, event_id) DO NOTHING
                "#,
            )
            .bind(delivery.id)
            .bind(delivery.endpoint_id)
            .bind(delivery.event_id)
            .bind(&delivery.event_type)
            .bind(&delivery.payload)
            .bind(&delivery.signature)
            .bind(delivery.status.as_str())
            .bind(delivery.attempt_count)
            .bind(delivery.max_attempts)
            .bind(delivery.next_attempt_at)
            .bind(delivery.created_at)
            .bind(delivery.updated_at)
            .execute(&mut *tx)
            .await?;

            if res.rows_affected() == 1 {
                inserted.push(delivery.clone());
            }
        }

        tx.commit().await?;
        Ok(inserted)
    }

    async fn claim_due_deliveries(&self, now: DateTime<Utc>, lease: Duration, limit: i64) -> Result<Vec<WebhookDelivery>> {
        let mut tx = self.pool.begin().await?;
        let rows = sqlx::query(&format!(
            r#"
            SELECT {DELIVERY_COLUMNS} FROM webhook_deliveries
            WHERE (
                    status IN ('pending', 'retrying')
                    AND attempt_count < max_attempts
                    AND (next_attempt_at IS NULL OR next_attempt_at <= $1)
                  )
               OR (status = 'delivering' AND next_attempt_at <= $1)
            ORDER BY COALESCE(next_attempt_at, created_at)
            LIMIT $2
            FOR UPDATE SKIP LOCKED
            "#
        ))
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
            r#"
            UPDATE webhook_deliveries
            SET status = 'delivering', next_attempt_at = $2, updated_at = $3
            WHERE id = ANY($1)
            "#,
        )
        .bind(&ids)
        .bind(lease_until)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        rows.iter()
            .map(|r| {
                let mut delivery = delivery_from_row(r)?;
                delivery.status = DeliveryStatus::Delivering;
                delivery.next_attempt_at = Some(lease_until);
                delivery.updated_at = now;
                Ok(delivery)
            })
            .collect()
    }

    async fn record_attempt(&self, delivery: &WebhookDelivery) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE webhook_deliveries
            SET status = $2,
                attempt_count = $3,
                next_attempt_at = $4,
                response_status = $5,
                response_body = $6,
                failure_reason = $7,
                delivered_at = $8,
                updated_at = $9
            WHERE id = $1
            "#,
        )
        .bind(delivery.id)
        .bind(delivery.status.as_str())
        .bind(delivery.attempt_count)
        .bind(delivery.next_attempt_at)
        .bind(delivery.response_status)
        .bind(&delivery.response_body)
        .bind(&delivery.failure_reason)
        .bind(delivery.delivered_at)
        .bind(delivery.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_delivery(&self, id: Uuid) -> Result<Option<WebhookDelivery>> {
        let row = sqlx::query(&format!("SELECT {DELIVERY_COLUMNS} FROM webhook_deliveries WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(delivery_from_row).transpose()
    }

    async fn deliveries_for_endpoint(&self, endpoint_id: Uuid, limit: i64) -> Result<Vec<WebhookDelivery>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {DELIVERY_COLUMNS} FROM webhook_deliveries
            WHERE endpoint_id = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#
        ))
        .bind(endpoint_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(delivery_from_row).collect()
    }
}
