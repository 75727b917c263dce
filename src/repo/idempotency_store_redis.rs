use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use redis::AsyncCommands;

use crate::domain::idempotency::{IdempotencyBegin, IdempotencyRecord, IdempotencyState};
use crate::repo::store::IdempotencyStore;

/// Idempotency records kept as JSON strings with a PX expiry. Redis drops
/// expired keys itself, so there is nothing to purge.
#[derive(Clone)]
pub struct IdempotencyStoreRedis {
    pub client: redis::Client,
}

impl IdempotencyStoreRedis {
    pub fn new(client: redis::Client) -> Self {
        Self { client }
    }

    fn record_key(key: &str) -> String {
        format!("idempotency:{}", key)
    }

    fn ttl_ms(expires_at: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
        (expires_at - now).num_milliseconds().max(1)
    }

    async fn load(&self, conn: &mut redis::aio::MultiplexedConnection, key: &str) -> Result<Option<IdempotencyRecord>> {
        let payload: Option<String> = conn.get(Self::record_key(key)).await?;
        payload
            .map(|p| serde_json::from_str::<IdempotencyRecord>(&p))
            .transpose()
            .map_err(Into::into)
    }
}

#[async_trait::async_trait]
impl IdempotencyStore for IdempotencyStoreRedis {
    async fn begin(
        &self,
        key: &str,
        request_hash: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<IdempotencyBegin> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let record = IdempotencyRecord {
            key: key.to_string(),
            request_hash: request_hash.to_string(),
            state: IdempotencyState::InFlight,
            response_data: None,
            status_code: None,
            expires_at,
            created_at: now,
        };

        let set: Option<String> = redis::cmd("SET")
            .arg(Self::record_key(key))
            .arg(serde_json::to_string(&record)?)
            .arg("NX")
            .arg("PX")
            .arg(Self::ttl_ms(expires_at, now))
            .query_async(&mut conn)
            .await?;

        if set.is_some() {
            return Ok(IdempotencyBegin::Claimed);
        }

        let existing = self
            .load(&mut conn, key)
            .await?
            .ok_or_else(|| anyhow!("idempotency key {key} expired during claim"))?;
        Ok(IdempotencyBegin::Existing(existing))
    }

    async fn complete(
        &self,
        key: &str,
        request_hash: &str,
        response: &serde_json::Value,
        status_code: u16,
        expires_at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let Some(mut record) = self.load(&mut conn, key).await? else {
            return Ok(false);
        };
        if record.state != IdempotencyState::InFlight || record.request_hash != request_hash {
            return Ok(false);
        }

        record.state = IdempotencyState::Completed;
        record.response_data = Some(response.clone());
        record.status_code = Some(status_code);
        record.expires_at = expires_at;

        let set: Option<String> = redis::cmd("SET")
            .arg(Self::record_key(key))
            .arg(serde_json::to_string(&record)?)
            .arg("XX")
            .arg("PX")
            .arg(Self::ttl_ms(record.expires_at, Utc::now()))
            .query_async(&mut conn)
            .await?;
        Ok(set.is_some())
    }

    async fn release(&self, key: &str) -> Result<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        if let Some(record) = self.load(&mut conn, key).await? {
            if record.state == IdempotencyState::InFlight {
                let _: i64 = conn.del(Self::record_key(key)).await?;
            }
        }
        Ok(())
    }

    async fn purge_expired(&self, _now: DateTime<Utc>) -> Result<u64> {
        Ok(0)
    }
}
