use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::payment::Payment;
use crate::domain::refund::Refund;

pub const PLATFORM_REVENUE_ACCOUNT: &str = "platform:revenue";

pub fn customer_account(payer_id: &str) -> String {
    format!("customer:{payer_id}")
}

pub fn merchant_account(merchant_id: &str) -> String {
    format!("merchant:{merchant_id}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountType {
    Asset,
    Liability,
    Revenue,
    Expense,
    Equity,
}

string_enum!(AccountType {
    Asset => "asset",
    Liability => "liability",
    Revenue => "revenue",
    Expense => "expense",
    Equity => "equity",
});

impl AccountType {
    pub fn is_debit_normal(&self) -> bool {
        matches!(self, Self::Asset | Self::Expense)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceType {
    Payment,
    PaymentFee,
    Refund,
}

string_enum!(ReferenceType {
    Payment => "payment",
    PaymentFee => "payment_fee",
    Refund => "refund",
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntryInput {
    pub account_id: String,
    pub account_type: AccountType,
    pub debit: Decimal,
    pub credit: Decimal,
    pub currency: String,
    pub description: String,
    pub reference_type: ReferenceType,
    pub reference_id: Uuid,
}

impl LedgerEntryInput {
    pub fn debit(
        account_id: impl Into<String>,
        account_type: AccountType,
        amount: Decimal,
        currency: &str,
        reference: (ReferenceType, Uuid),
    ) -> Self {
        Self {
            account_id: account_id.into(),
            account_type,
            debit: amount,
            credit: Decimal::ZERO,
            currency: currency.to_string(),
            description: String::new(),
            reference_type: reference.0,
            reference_id: reference.1,
        }
    }

    pub fn credit(
        account_id: impl Into<String>,
        account_type: AccountType,
        amount: Decimal,
        currency: &str,
        reference: (ReferenceType, Uuid),
    ) -> Self {
        Self {
            debit: Decimal::ZERO,
            credit: amount,
            ..Self::debit(account_id, account_type, Decimal::ZERO, currency, reference)
        }
    }

    pub fn described(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerTransaction {
    pub id: Uuid,
    pub description: String,
    pub entries: Vec<LedgerEntryInput>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: Uuid,
    pub transaction_id: Uuid,
    pub account_id: String,
    pub account_type: AccountType,
    pub debit: Decimal,
    pub credit: Decimal,
    pub currency: String,
    pub description: String,
    pub reference_type: ReferenceType,
    pub reference_id: Uuid,
    pub created_at: DateTime<Utc>,
}

impl LedgerEntry {
    pub fn from_input(transaction_id: Uuid, input: &LedgerEntryInput, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            transaction_id,
            account_id: input.account_id.clone(),
            account_type: input.account_type,
            debit: input.debit,
            credit: input.credit,
            currency: input.currency.clone(),
            description: input.description.clone(),
            reference_type: input.reference_type,
            reference_id: input.reference_id,
            created_at: now,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IntegrityReport {
    pub transactions_checked: usize,
    pub entries_checked: usize,
}

/// Returns the first currency (alphabetically) whose debits and credits differ,
/// with the signed difference debit - credit.
pub fn find_imbalance<'a, I>(lines: I) -> Option<(String, Decimal)>
where
    I: IntoIterator<Item = (&'a str, Decimal, Decimal)>,
{
    let mut per_currency: BTreeMap<&str, Decimal> = BTreeMap::new();
    for (currency, debit, credit) in lines {
        *per_currency.entry(currency).or_insert(Decimal::ZERO) += debit - credit;
    }
    per_currency
        .into_iter()
        .find(|(_, diff)| !diff.is_zero())
        .map(|(currency, diff)| (currency.to_string(), diff))
}

/// Sum of an account's entries in its normal-balance direction.
pub fn fold_balance<'a, I>(account_type: AccountType, entries: I) -> Decimal
where
    I: IntoIterator<Item = &'a LedgerEntry>,
{
    let (debits, credits) = entries
        .into_iter()
        .fold((Decimal::ZERO, Decimal::ZERO), |(d, c), e| (d + e.debit, c + e.credit));
    if account_type.is_debit_normal() {
        debits - credits
    } else {
        credits - debits
    }
}

#[derive(Debug, Clone)]
pub struct FeeSchedule {
    pub default_rate: Decimal,
    pub merchant_rates: HashMap<String, Decimal>,
}

impl Default for FeeSchedule {
    fn default() -> Self {
        Self {
            default_rate: Decimal::new(2, 2),
            merchant_rates: HashMap::new(),
        }
    }
}

impl FeeSchedule {
    pub fn flat(rate: Decimal) -> Self {
        Self {
            default_rate: rate,
            merchant_rates: HashMap::new(),
        }
    }

    pub fn rate_for(&self, merchant_id: &str) -> Decimal {
        self.merchant_rates
            .get(merchant_id)
            .copied()
            .unwrap_or(self.default_rate)
    }

    /// Fee rounded half-to-even to two places, never above the amount.
    pub fn fee_for(&self, merchant_id: &str, amount: Decimal) -> Decimal {
        (amount * self.rate_for(merchant_id)).round_dp(2).clamp(Decimal::ZERO, amount)
    }

    /// Parses `merchant=rate,merchant=rate`.
    pub fn parse_overrides(raw: &str) -> anyhow::Result<HashMap<String, Decimal>> {
        let mut rates = HashMap::new();
        for pair in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (merchant, rate) = pair
                .split_once('=')
                .ok_or_else(|| anyhow::anyhow!("fee override '{pair}' is not merchant=rate"))?;
            let rate: Decimal = rate.trim().parse()?;
            if rate < Decimal::ZERO || rate > Decimal::ONE {
                anyhow::bail!("fee rate {rate} for merchant {merchant} is outside [0, 1]");
            }
            rates.insert(merchant.trim().to_string(), rate);
        }
        Ok(rates)
    }
}

/// Customer debit, merchant credit net of fee, platform revenue credit for the fee.
/// Keyed by the payment id so reposting is a no-op.
pub fn payment_transaction(payment: &Payment, fees: &FeeSchedule) -> LedgerTransaction {
    let fee = fees.fee_for(&payment.merchant_id, payment.amount);
    let net = payment.amount - fee;
    let reference = (ReferenceType::Payment, payment.id);
    let currency = payment.currency.as_str();

    let mut entries = vec![LedgerEntryInput::debit(
        customer_account(&payment.payer_id),
        AccountType::Asset,
        payment.amount,
        currency,
        reference,
    )
    .described("payment from customer")];
    if !net.is_zero() {
        entries.push(
            LedgerEntryInput::credit(
                merchant_account(&payment.merchant_id),
                AccountType::Asset,
                net,
                currency,
                reference,
            )
            .described("payment to merchant"),
        );
    }
    if !fee.is_zero() {
        entries.push(
            LedgerEntryInput::credit(
                PLATFORM_REVENUE_ACCOUNT,
                AccountType::Revenue,
                fee,
                currency,
                (ReferenceType::PaymentFee, payment.id),
            )
            .described("platform fee"),
        );
    }

    LedgerTransaction {
        id: payment.id,
        description: format!("payment {}", payment.id),
        entries,
    }
}

/// Credit the customer and debit the merchant for the refunded amount. The
/// platform fee is not returned.
pub fn refund_transaction(refund: &Refund, payment: &Payment) -> LedgerTransaction {
    let reference = (ReferenceType::Refund, refund.id);
    let currency = refund.currency.as_str();
    LedgerTransaction {
        id: refund.id,
        description: format!("refund {} of payment {}", refund.id, payment.id),
        entries: vec![
            LedgerEntryInput::credit(
                customer_account(&payment.payer_id),
                AccountType::Asset,
                refund.amount,
                currency,
                reference,
            )
            .described("refund to customer"),
            LedgerEntryInput::debit(
                merchant_account(&payment.merchant_id),
                AccountType::Asset,
                refund.amount,
                currency,
                reference,
            )
            .described("refund from merchant"),
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn fee_is_two_percent_by_default() {
        let fees = FeeSchedule::default();
        assert_eq!(fees.fee_for("m1", dec!(100.50)), dec!(2.01));
        assert_eq!(fees.fee_for("m1", dec!(0.10)), dec!(0.00));
    }

    #[test]
    fn merchant_override_wins() {
        let mut fees = FeeSchedule::default();
        fees.merchant_rates = FeeSchedule::parse_overrides("m1=0.015, m2=0").unwrap();
        assert_eq!(fees.fee_for("m1", dec!(200)), dec!(3.00));
        assert_eq!(fees.fee_for("m2", dec!(200)), dec!(0));
        assert_eq!(fees.fee_for("m3", dec!(200)), dec!(4.00));
    }

    #[test]
    fn rejects_malformed_overrides() {
        assert!(FeeSchedule::parse_overrides("m1").is_err());
        assert!(FeeSchedule::parse_overrides("m1=1.5").is_err());
        assert!(FeeSchedule::parse_overrides("").unwrap().is_empty());
    }

    #[test]
    fn imbalance_reports_offending_currency() {
        let lines = vec![
            ("INR", dec!(10), dec!(0)),
            ("INR", dec!(0), dec!(10)),
            ("USD", dec!(5), dec!(0)),
            ("USD", dec!(0), dec!(4)),
        ];
        assert_eq!(find_imbalance(lines), Some(("USD".to_string(), dec!(1))));
        assert_eq!(find_imbalance(vec![("INR", dec!(3), dec!(3))]), None);
    }
}
