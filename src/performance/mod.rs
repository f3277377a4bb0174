//! Position summary: open exposure, realized and unrealized P&L, income.
//!
//! ```text
//! invested       = Σ wallet.investment
//! average cost   = invested / open shares
//! unrealized P&L = open shares × price − invested
//! realized P&L   = Σ SELL (net proceeds − cost basis)
//! income         = Σ DIVIDEND + SLP
//! total P&L      = realized + unrealized + income
//! ```
//!
//! Unrealized figures are only present when a price is known.

use crate::models::{Transaction, TransactionType};
use crate::wallets::Wallet;
use serde::Serialize;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionSummary {
    pub asset_id: i64,
    pub open_wallets: usize,
    pub open_shares: f64,
    pub invested: f64,
    pub average_cost: Option<f64>,
    pub price: Option<f64>,
    pub market_value: Option<f64>,
    pub unrealized_pnl: Option<f64>,
    pub realized_pnl: f64,
    pub income: f64,
    pub total_pnl: f64,
}

fn realized(txn: &Transaction) -> f64 {
    match (txn.realized_pnl, txn.amount, txn.cost_basis) {
        (Some(pnl), _, _) => pnl,
        (None, Some(amount), Some(cost)) => amount - cost,
        _ => {
            log::warn!("SELL {} has no realized P&L recorded", txn.id);
            0.0
        }
    }
}

pub fn summarize_position(
    asset_id: i64,
    wallets: &[Wallet],
    transactions: &[Transaction],
    price: Option<f64>,
) -> PositionSummary {
    let open: Vec<&Wallet> = wallets.iter().filter(|w| w.asset_id == asset_id).collect();
    let open_shares: f64 = open.iter().map(|w| w.shares_f64()).sum();
    let invested: f64 = open.iter().map(|w| w.investment).sum();

    let mut realized_pnl = 0.0;
    let mut income = 0.0;
    for txn in transactions.iter().filter(|t| t.asset_id == asset_id) {
        match txn.txn_type {
            TransactionType::Sell => realized_pnl += realized(txn),
            TransactionType::Dividend | TransactionType::Slp => income += txn.amount.unwrap_or(0.0),
            TransactionType::Buy | TransactionType::Split => {}
        }
    }

    let price = price.filter(|p| p.is_finite() && *p > 0.0);
    let market_value = price.map(|p| open_shares * p);
    let unrealized_pnl = market_value.map(|v| v - invested);

    PositionSummary {
        asset_id,
        open_wallets: open.len(),
        open_shares,
        invested,
        average_cost: if open_shares > 0.0 {
            Some(invested / open_shares)
        } else {
            None
        },
        price,
        market_value,
        unrealized_pnl,
        realized_pnl,
        income,
        total_pnl: realized_pnl + income + unrealized_pnl.unwrap_or(0.0),
    }
}
