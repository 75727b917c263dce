use anyhow::Result;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::domain::ledger::LedgerEntry;
use crate::repo::store::LedgerStore;

#[derive(Clone)]
pub struct LedgerRepo {
    pub pool: PgPool,
}

fn entry_from_row(row: &PgRow) -> Result<LedgerEntry> {
    Ok(LedgerEntry {
        id: row.get("id"),
        transaction_id: row.get("transaction_id"),
        account_id: row.get("account_id"),
        account_type: row.get::<String, _>("account_type").parse()?,
        debit: row.get("debit"),
        credit: row.get("credit"),
        currency: row.get("currency"),
        description: row.get("description"),
        reference_type: row.get::<String, _>("reference_type").parse()?,
        reference_id: row.get("reference_id"),
        created_at: row.get("created_at"),
    })
}

const ENTRY_COLUMNS: &str = "id, transaction_id, account_id, account_type, debit, credit, currency, \
     description, reference_type, reference_id, created_at";

#[async_trait::async_trait]
impl LedgerStore for LedgerRepo {
    async fn append_transaction(
        &self,
        transaction_id: Uuid,
        description: &str,
        entries: &[LedgerEntry],
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let header = sqlx::query(
            r#"
            INSERT INTO ledger_transactions (id, description)
            VALUES ($1, $2)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(transaction_id)
        .bind(description)
        .execute(&mut *tx)
        .await?;

        if header.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        for entry in entries {
            sqlx::query(
                r#"
                INSERT INTO ledger_entries
                    (id, transaction_id, account_id, account_type, debit, credit, currency,
                     description, reference_type, reference_id, created_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                "#,
            )
            .bind(entry.id)
            .bind(transaction_id)
            .bind(&entry.account_id)
            .bind(entry.account_type.as_str())
            .bind(entry.debit)
            .bind(entry.credit)
            .bind(&entry.currency)
            .bind(&entry.description)
            .bind(entry.reference_type.as_str())
            .bind(entry.reference_id)
            .bind(entry.created_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(true)
    }

    async fn entries_for_account(&self, account_id: &str, currency: &str) -> Result<Vec<LedgerEntry>> {
        let rows = sqlx::query(&format!(
            "SELECT {ENTRY_COLUMNS} FROM ledger_entries WHERE account_id = $1 AND currency = $2 ORDER BY created_at, id"
        ))
        .bind(account_id)
        .bind(currency)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(entry_from_row).collect()
    }

    async fn entries_for_transaction(&self, transaction_id: Uuid) -> Result<Vec<LedgerEntry>> {
        let rows = sqlx::query(&format!(
            "SELECT {ENTRY_COLUMNS} FROM ledger_entries WHERE transaction_id = $1 ORDER BY created_at, id"
        ))
        .bind(transaction_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(entry_from_row).collect()
    }

    async fn transaction_ids(&self) -> Result<Vec<Uuid>> {
        let rows = sqlx::query("SELECT id FROM ledger_transactions ORDER BY created_at, id")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|r| r.get("id")).collect())
    }
}
