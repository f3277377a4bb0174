//! Out-of-pocket vs. cash-balance accounting.
//!
//! Always a fresh replay over the asset's transactions (ascending date, ties
//! by entry order). Nothing here is cached.

use crate::models::{shares_from_db, Transaction, TransactionType};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// How DIVIDEND/SLP payments are booked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum IncomePolicy {
    /// Payments only grow the cash balance
    #[default]
    CashOnly,
    /// Payments pay back out-of-pocket capital first, the rest is cash
    OffsetOutOfPocket,
}

impl IncomePolicy {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().replace(['-', '_'], "").as_str() {
            "cashonly" => Some(Self::CashOnly),
            "offsetoutofpocket" | "offsetoop" => Some(Self::OffsetOutOfPocket),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CashOnly => "cash_only",
            Self::OffsetOutOfPocket => "offset_out_of_pocket",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CashPosition {
    pub out_of_pocket: f64,
    pub cash_balance: f64,
}

impl CashPosition {
    /// Book one transaction.
    pub fn apply(&mut self, txn: &Transaction, policy: IncomePolicy) {
        match txn.txn_type {
            TransactionType::Buy => {
                let investment = txn.investment.unwrap_or(0.0).max(0.0);
                if self.cash_balance >= investment {
                    self.cash_balance -= investment;
                } else {
                    self.out_of_pocket += investment - self.cash_balance;
                    self.cash_balance = 0.0;
                }
            }
            TransactionType::Sell => {
                self.cash_balance += sell_amount(txn);
            }
            TransactionType::Dividend | TransactionType::Slp => {
                let amount = txn.amount.unwrap_or(0.0).max(0.0);
                match policy {
                    IncomePolicy::CashOnly => self.cash_balance += amount,
                    IncomePolicy::OffsetOutOfPocket => {
                        let offset = amount.min(self.out_of_pocket);
                        self.out_of_pocket -= offset;
                        self.cash_balance += amount - offset;
                    }
                }
            }
            TransactionType::Split => {}
        }
    }

    /// `max(0, maxOOP − outOfPocket) + cashBalance`
    pub fn available(&self, max_oop: f64) -> f64 {
        (max_oop - self.out_of_pocket).max(0.0) + self.cash_balance
    }
}

/// Net proceeds of a SELL. Older rows without a stored amount fall back to
/// price × quantity.
fn sell_amount(txn: &Transaction) -> f64 {
    match txn.amount {
        Some(a) => a,
        None => {
            let qty = txn.quantity.map(shares_from_db).unwrap_or(0.0);
            txn.price.unwrap_or(0.0) * qty
        }
    }
}

/// Replay every transaction.
pub fn track_cash(transactions: &[Transaction], policy: IncomePolicy) -> CashPosition {
    track_cash_until(transactions, None, policy)
}

/// Replay transactions dated on or before `until` (all when `None`).
pub fn track_cash_until(
    transactions: &[Transaction],
    until: Option<NaiveDate>,
    policy: IncomePolicy,
) -> CashPosition {
    let mut ordered: Vec<&Transaction> = transactions
        .iter()
        .filter(|t| until.map_or(true, |d| t.date <= d))
        .collect();
    ordered.sort_by_key(|t| (t.date, t.id));

    let mut position = CashPosition::default();
    for txn in ordered {
        position.apply(txn, policy);
    }
    position
}
