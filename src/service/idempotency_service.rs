use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::watch;

use crate::config::IdempotencyConfig;
use crate::domain::idempotency::{request_hash, IdempotencyBegin, IdempotencyState};
use crate::error::{CoreError, Result};
use crate::repo::store::IdempotencyStore;

#[derive(Debug, Clone, PartialEq)]
pub struct CachedResponse {
    pub status_code: u16,
    pub body: serde_json::Value,
    /// Served from the store rather than produced by this call.
    pub replayed: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum IdempotencyCheck {
    Proceed,
    Replay(CachedResponse),
}

/// Releases an in-flight claim when `execute` is dropped before it settles
/// the key, so a retry is not refused until the lease runs out.
struct ClaimGuard {
    store: Option<Arc<dyn IdempotencyStore>>,
    key: String,
}

impl ClaimGuard {
    fn new(store: Arc<dyn IdempotencyStore>, key: &str) -> Self {
        Self {
            store: Some(store),
            key: key.to_string(),
        }
    }

    fn disarm(mut self) {
        self.store = None;
    }
}

impl Drop for ClaimGuard {
    fn drop(&mut self) {
        let Some(store) = self.store.take() else {
            return;
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let key = std::mem::take(&mut self.key);
        handle.spawn(async move {
            match store.release(&key).await {
                Ok(()) => tracing::info!(idempotency_key = %key, "abandoned idempotency claim released"),
                Err(err) => tracing::warn!(idempotency_key = %key, error = %err, "failed to release idempotency claim"),
            }
        });
    }
}

#[derive(Clone)]
pub struct IdempotencyService {
    store: Arc<dyn IdempotencyStore>,
    config: IdempotencyConfig,
}

impl IdempotencyService {
    pub fn new(store: Arc<dyn IdempotencyStore>, config: IdempotencyConfig) -> Self {
        Self { store, config }
    }

    /// Claims `key` for this request body or reports what happened to it before.
    pub async fn check(&self, key: &str, body: &[u8]) -> Result<IdempotencyCheck> {
        if key.trim().is_empty() {
            return Err(CoreError::Validation("idempotency key must not be empty".to_string()));
        }

        let now = Utc::now();
        if let Err(err) = self.store.purge_expired(now).await {
            tracing::warn!(error = %err, "idempotency purge failed");
        }

        let hash = request_hash(body);
        match self.store.begin(key, &hash, now, now + self.config.in_flight_lease).await? {
            IdempotencyBegin::Claimed => Ok(IdempotencyCheck::Proceed),
            IdempotencyBegin::Existing(record) if record.request_hash != hash => {
                tracing::warn!(idempotency_key = key, "idempotency key reused with a different body");
                Err(CoreError::IdempotencyConflict(key.to_string()))
            }
            IdempotencyBegin::Existing(record) => match record.state {
                IdempotencyState::InFlight => Err(CoreError::IdempotencyInFlight(key.to_string())),
                IdempotencyState::Completed => Ok(IdempotencyCheck::Replay(CachedResponse {
                    status_code: record.status_code.unwrap_or(200),
                    body: record.response_data.unwrap_or(serde_json::Value::Null),
                    replayed: true,
                })),
            },
        }
    }

    pub async fn store(&self, key: &str, body: &[u8], response: &serde_json::Value, status_code: u16) -> Result<()> {
        let hash = request_hash(body);
        if !self.store.complete(key, &hash, response, status_code, Utc::now() + self.config.ttl).await? {
            return Err(CoreError::StateConflict(format!(
                "idempotency key {key} is not in flight for this request"
            )));
        }
        Ok(())
    }

    pub async fn release(&self, key: &str) -> Result<()> {
        Ok(self.store.release(key).await?)
    }

    /// Runs `op` at most once per key and body. Results and client errors
    /// are cached; server errors release the key so the request can be retried.
    pub async fn execute<T, F, Fut>(&self, key: &str, body: &[u8], op: F) -> Result<CachedResponse>
    where
        T: Serialize,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if let IdempotencyCheck::Replay(cached) = self.check(key, body).await? {
            return Ok(cached);
        }
        let guard = ClaimGuard::new(self.store.clone(), key);

        let (status_code, response) = match op().await {
            Ok(value) => match serde_json::to_value(value) {
                Ok(json) => (200, json),
                Err(err) => {
                    self.release(key).await?;
                    return Err(CoreError::Storage(err.into()));
                }
            },
            Err(err) => {
                let json = serde_json::to_value(err.envelope()).map_err(anyhow::Error::from)?;
                (err.status_code().as_u16(), json)
            }
        };

        if status_code >= 500 {
            self.release(key).await?;
        } else {
            self.store(key, body, &response, status_code).await?;
        }
        guard.disarm();

        Ok(CachedResponse {
            status_code,
            body: response,
            replayed: false,
        })
    }

    pub async fn purge_expired(&self) -> Result<u64> {
        Ok(self.store.purge_expired(Utc::now()).await?)
    }

    pub async fn run_sweeper(&self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.sweep_interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.purge_expired().await {
                        Ok(0) => {}
                        Ok(purged) => tracing::info!(purged, "expired idempotency keys purged"),
                        Err(err) => tracing::error!("idempotency sweep error: {}", err),
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        tracing::info!("idempotency sweeper stopped");
    }
}
