use axum::routing::get;
use axum::Router;
use payments_core::config::AppConfig;
use payments_core::rail::http::HttpRailClient;
use payments_core::rail::RailClient;
use payments_core::repo::idempotency_repo::IdempotencyRepo;
use payments_core::repo::idempotency_store_redis::IdempotencyStoreRedis;
use payments_core::repo::ledger_repo::LedgerRepo;
use payments_core::repo::outbox_repo::OutboxRepo;
use payments_core::repo::payments_repo::PaymentsRepo;
use payments_core::repo::refunds_repo::RefundsRepo;
use payments_core::repo::risk_repo::RiskRepo;
use payments_core::repo::store::IdempotencyStore;
use payments_core::repo::webhook_repo::WebhookRepo;
use payments_core::service::idempotency_service::IdempotencyService;
use payments_core::service::ledger_reconciler::LedgerReconciler;
use payments_core::service::ledger_service::LedgerService;
use payments_core::service::outbox_relay::OutboxRelay;
use payments_core::service::payment_service::PaymentService;
use payments_core::service::refund_service::RefundService;
use payments_core::service::risk_service::RiskService;
use payments_core::service::status_poller::StatusPoller;
use payments_core::service::webhook_dispatcher::WebhookDispatcher;
use payments_core::AppState;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = AppConfig::from_env()?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if cfg.log_format == "json" {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&cfg.database_url)
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;

    let redis_client = match &cfg.redis_url {
        Some(url) => Some(redis::Client::open(url.as_str())?),
        None => None,
    };

    let payments_repo = Arc::new(PaymentsRepo { pool: pool.clone() });
    let refunds_repo = Arc::new(RefundsRepo { pool: pool.clone() });
    let ledger_repo = Arc::new(LedgerRepo { pool: pool.clone() });
    let outbox_repo = Arc::new(OutboxRepo { pool: pool.clone() });
    let risk_repo = Arc::new(RiskRepo { pool: pool.clone() });
    let webhook_repo = Arc::new(WebhookRepo { pool: pool.clone() });
    let idempotency_store: Arc<dyn IdempotencyStore> = match &redis_client {
        Some(client) => Arc::new(IdempotencyStoreRedis::new(client.clone())),
        None => Arc::new(IdempotencyRepo { pool: pool.clone() }),
    };

    let rail: Arc<dyn RailClient> = Arc::new(HttpRailClient::new(
        cfg.rail_base_url.clone(),
        cfg.rail_api_key.clone(),
        u64::try_from(cfg.payments.rail_timeout.as_millis()).unwrap_or(u64::MAX),
    ));

    let ledger = LedgerService::new(ledger_repo, cfg.fees.clone());
    let risk = RiskService::new(risk_repo, payments_repo.clone(), cfg.risk.clone());
    let dispatcher = WebhookDispatcher::new(webhook_repo, cfg.webhooks.clone());
    let reconciler = LedgerReconciler::new(outbox_repo.clone(), ledger.clone(), &cfg.workers);
    let relay = OutboxRelay::new(outbox_repo, dispatcher.clone(), &cfg.workers);
    let idempotency = IdempotencyService::new(idempotency_store, cfg.idempotency.clone());

    let payment_service = PaymentService {
        store: payments_repo.clone(),
        rail: rail.clone(),
        risk,
        ledger: ledger.clone(),
        reconciler: reconciler.clone(),
        relay_wakeup: relay.wakeup.clone(),
        config: cfg.payments.clone(),
    };
    let refund_service = RefundService {
        store: refunds_repo,
        payments: payments_repo,
        rail,
        ledger,
        reconciler: reconciler.clone(),
        relay_wakeup: relay.wakeup.clone(),
        config: cfg.payments.clone(),
    };
    let poller = StatusPoller::new(payment_service, refund_service, &cfg.workers);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut workers = Vec::new();
    {
        let rx = shutdown_rx.clone();
        workers.push(tokio::spawn(async move { relay.run(rx).await }));
    }
    {
        let rx = shutdown_rx.clone();
        workers.push(tokio::spawn(async move { reconciler.run(rx).await }));
    }
    {
        let rx = shutdown_rx.clone();
        let dispatcher = dispatcher.clone();
        workers.push(tokio::spawn(async move { dispatcher.run_retry_scheduler(rx).await }));
    }
    {
        let rx = shutdown_rx.clone();
        workers.push(tokio::spawn(async move { poller.run(rx).await }));
    }
    {
        let rx = shutdown_rx.clone();
        workers.push(tokio::spawn(async move { idempotency.run_sweeper(rx).await }));
    }

    let state = AppState {
        pool: pool.clone(),
        redis_client,
    };

    let app = Router::new()
        .route("/ops/readiness", get(payments_core::http::handlers::ops::readiness))
        .route("/ops/liveness", get(payments_core::http::handlers::ops::liveness))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&cfg.bind_addr).await?;
    tracing::info!("listening on {}", cfg.bind_addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let _ = shutdown_tx.send(true);
    for worker in workers {
        if let Err(err) = worker.await {
            tracing::error!("worker task ended abnormally: {}", err);
        }
    }
    pool.close().await;
    tracing::info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to install Ctrl+C handler: {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!("failed to install SIGTERM handler: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received Ctrl+C, shutting down"),
        _ = terminate => tracing::info!("received terminate signal, shutting down"),
    }
}
