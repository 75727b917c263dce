use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;
use sqlx::Row;

use crate::AppState;

async fn redis_ping(client: &redis::Client) -> bool {
    match client.get_multiplexed_async_connection().await {
        Ok(mut conn) => redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await
            .is_ok(),
        Err(_) => false,
    }
}

/// Unpublished webhook events and unposted ledger transactions. `None` when
/// the database cannot answer.
async fn outbox_backlog(state: &AppState) -> Option<(i64, i64)> {
    let row = sqlx::query(
        "SELECT \
           (SELECT COUNT(*) FROM webhook_event_outbox WHERE status <> 'PUBLISHED') AS events, \
           (SELECT COUNT(*) FROM ledger_post_outbox WHERE status IN ('PENDING', 'PROCESSING')) AS posts",
    )
    .fetch_one(&state.pool)
    .await
    .ok()?;
    Some((row.try_get("events").ok()?, row.try_get("posts").ok()?))
}

pub async fn readiness(State(state): State<AppState>) -> impl IntoResponse {
    let backlog = outbox_backlog(&state).await;
    let db_ok = backlog.is_some();

    let redis = match &state.redis_client {
        Some(client) => json!(redis_ping(client).await),
        None => json!("disabled"),
    };
    let redis_ok = redis != json!(false);

    let ready = db_ok && redis_ok;
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let (pending_events, pending_ledger_posts) = backlog.unwrap_or_default();

    (
        status,
        Json(json!({
            "ready": ready,
            "db": db_ok,
            "redis": redis,
            "pending_webhook_events": pending_events,
            "pending_ledger_posts": pending_ledger_posts,
        })),
    )
}

pub async fn liveness() -> impl IntoResponse {
    (StatusCode::OK, Json(json!({ "alive": true })))
}
