use anyhow::Result;
use payments_core::config::AppConfig;
use payments_core::repo::ledger_repo::LedgerRepo;
use payments_core::service::ledger_service::LedgerService;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cfg = AppConfig::from_env()?;
    let pool = PgPoolOptions::new()
        .max_connections(2)
        .connect(&cfg.database_url)
        .await?;

    let ledger = LedgerService::new(Arc::new(LedgerRepo { pool }), cfg.fees);

    match ledger.validate_ledger_integrity().await {
        Ok(report) => {
            println!(
                "ledger ok: {} transactions, {} entries",
                report.transactions_checked, report.entries_checked
            );
            Ok(())
        }
        Err(err) => {
            eprintln!("ledger audit failed: {err}");
            std::process::exit(1);
        }
    }
}
