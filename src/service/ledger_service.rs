use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::domain::ledger::{
    find_imbalance, fold_balance, payment_transaction, refund_transaction, FeeSchedule,
    IntegrityReport, LedgerEntry, LedgerTransaction,
};
use crate::domain::payment::Payment;
use crate::domain::refund::Refund;
use crate::error::{CoreError, Result};
use crate::repo::store::LedgerStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostOutcome {
    Posted,
    /// The transaction id had been written before; nothing changed.
    AlreadyPosted,
}

/// The only writer of ledger entries.
#[derive(Clone)]
pub struct LedgerService {
    store: Arc<dyn LedgerStore>,
    fees: FeeSchedule,
}

impl LedgerService {
    pub fn new(store: Arc<dyn LedgerStore>, fees: FeeSchedule) -> Self {
        Self { store, fees }
    }

    pub fn fees(&self) -> &FeeSchedule {
        &self.fees
    }

    pub fn payment_transaction(&self, payment: &Payment) -> LedgerTransaction {
        payment_transaction(payment, &self.fees)
    }

    pub fn refund_transaction(&self, refund: &Refund, payment: &Payment) -> LedgerTransaction {
        refund_transaction(refund, payment)
    }

    /// Structural checks and the per-currency balance check, without touching storage.
    pub fn validate_transaction(tx: &LedgerTransaction) -> Result<()> {
        if tx.entries.len() < 2 {
            return Err(CoreError::Validation(format!(
                "ledger transaction {} needs at least two entries, got {}",
                tx.id,
                tx.entries.len()
            )));
        }

        for (i, entry) in tx.entries.iter().enumerate() {
            if entry.account_id.trim().is_empty() {
                return Err(CoreError::Validation(format!("entry {i} has no account id")));
            }
            if entry.currency.trim().is_empty() {
                return Err(CoreError::Validation(format!("entry {i} has no currency")));
            }
            if entry.debit < Decimal::ZERO || entry.credit < Decimal::ZERO {
                return Err(CoreError::Validation(format!(
                    "entry {i} on {} has a negative side",
                    entry.account_id
                )));
            }
            if entry.debit.is_zero() == entry.credit.is_zero() {
                return Err(CoreError::Validation(format!(
                    "entry {i} on {} must have exactly one of debit or credit set",
                    entry.account_id
                )));
            }
        }

        let lines = tx
            .entries
            .iter()
            .map(|e| (e.currency.as_str(), e.debit, e.credit));
        if let Some((currency, difference)) = find_imbalance(lines) {
            return Err(CoreError::LedgerImbalance {
                transaction_id: tx.id,
                currency,
                difference,
            });
        }

        Ok(())
    }

    pub async fn post_transaction(&self, tx: &LedgerTransaction) -> Result<PostOutcome> {
        if let Err(err) = Self::validate_transaction(tx) {
            if matches!(err, CoreError::LedgerImbalance { .. }) {
                tracing::error!(transaction_id = %tx.id, error = %err, "refusing unbalanced ledger transaction");
            }
            return Err(err);
        }

        let now = Utc::now();
        let entries: Vec<LedgerEntry> = tx
            .entries
            .iter()
            .map(|input| LedgerEntry::from_input(tx.id, input, now))
            .collect();

        let written = self
            .store
            .append_transaction(tx.id, &tx.description, &entries)
            .await?;

        if written {
            tracing::info!(transaction_id = %tx.id, entries = entries.len(), "ledger transaction posted");
            Ok(PostOutcome::Posted)
        } else {
            tracing::debug!(transaction_id = %tx.id, "ledger transaction already posted");
            Ok(PostOutcome::AlreadyPosted)
        }
    }

    pub async fn post_payment_transaction(&self, payment: &Payment) -> Result<PostOutcome> {
        self.post_transaction(&self.payment_transaction(payment)).await
    }

    pub async fn post_refund_transaction(&self, refund: &Refund, payment: &Payment) -> Result<PostOutcome> {
        self.post_transaction(&self.refund_transaction(refund, payment)).await
    }

    /// Normal-balance fold: debit-normal for asset and expense accounts,
    /// credit-normal otherwise. An account with no entries has a zero balance.
    pub async fn get_account_balance(&self, account_id: &str, currency: &str) -> Result<Decimal> {
        let entries = self.store.entries_for_account(account_id, currency).await?;
        let Some(first) = entries.first() else {
            return Ok(Decimal::ZERO);
        };
        Ok(fold_balance(first.account_type, &entries))
    }

    pub async fn get_transaction_entries(&self, transaction_id: Uuid) -> Result<Vec<LedgerEntry>> {
        let entries = self.store.entries_for_transaction(transaction_id).await?;
        if entries.is_empty() {
            return Err(CoreError::not_found("ledger transaction", transaction_id));
        }
        Ok(entries)
    }

    /// Re-verifies every posted transaction. An imbalance means corrupted
    /// data and is reported, never repaired.
    pub async fn validate_ledger_integrity(&self) -> Result<IntegrityReport> {
        let mut report = IntegrityReport::default();

        for transaction_id in self.store.transaction_ids().await? {
            let entries = self.store.entries_for_transaction(transaction_id).await?;
            let lines = entries.iter().map(|e| (e.currency.as_str(), e.debit, e.credit));
            if let Some((currency, difference)) = find_imbalance(lines) {
                tracing::error!(
                    transaction_id = %transaction_id,
                    currency = %currency,
                    difference = %difference,
                    "ledger integrity violation"
                );
                return Err(CoreError::LedgerImbalance {
                    transaction_id,
                    currency,
                    difference,
                });
            }
            report.transactions_checked += 1;
            report.entries_checked += entries.len();
        }

        tracing::info!(
            transactions = report.transactions_checked,
            entries = report.entries_checked,
            "ledger integrity verified"
        );
        Ok(report)
    }
}
