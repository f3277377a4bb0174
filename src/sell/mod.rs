//! Sell resolver: takes shares out of one explicitly chosen wallet and works
//! out cost basis, net proceeds and realized P&L.
//!
//! There is no FIFO/LIFO lot selection. The caller names the wallet.

use crate::error::{LedgerError, Result};
use crate::models::shares_from_db;
use crate::wallets::{WalletBook, WalletKey};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SellOutcome {
    pub wallet_id: i64,
    /// Lot key at sell time, needed to recreate the wallet on reversal
    pub key: WalletKey,
    /// × 10^8
    pub quantity: i64,
    pub cost_basis: f64,
    pub gross_proceeds: f64,
    pub commission_paid: f64,
    /// Net of commission, this is what lands in the cash balance
    pub proceeds: f64,
    pub realized_pnl: f64,
    /// × 10^8, zero when the wallet was closed
    pub remaining_shares: i64,
    pub closed: bool,
}

/// Proceeds split into (gross, commission, net).
pub fn sell_proceeds(price: f64, shares: f64, commission: f64) -> (f64, f64, f64) {
    let gross = price * shares;
    let fee = gross * commission / 100.0;
    (gross, fee, gross - fee)
}

/// Debit `quantity` (× 10^8) from `wallet_id` at `price`.
///
/// Rejected with `InsufficientShares` before anything changes when the
/// wallet holds less than requested.
pub fn resolve_sell(
    book: &mut WalletBook,
    wallet_id: i64,
    price: f64,
    quantity: i64,
    commission: f64,
) -> Result<SellOutcome> {
    if !price.is_finite() || price <= 0.0 {
        return Err(LedgerError::validation(format!(
            "SELL needs a positive price, got {}",
            price
        )));
    }
    if quantity <= 0 {
        return Err(LedgerError::validation(format!(
            "SELL needs a positive quantity, got {}",
            shares_from_db(quantity)
        )));
    }

    let before = book.debit(wallet_id, quantity)?;
    let sold = shares_from_db(quantity);
    let cost_basis = before.purchase_price() * sold;
    let (gross_proceeds, commission_paid, proceeds) = sell_proceeds(price, sold, commission);
    let remaining = book.get_by_id(wallet_id).map(|w| w.shares).unwrap_or(0);

    let outcome = SellOutcome {
        wallet_id,
        key: before.key(),
        quantity,
        cost_basis,
        gross_proceeds,
        commission_paid,
        proceeds,
        realized_pnl: proceeds - cost_basis,
        remaining_shares: remaining,
        closed: remaining == 0,
    };

    log::debug!(
        "Sold {:.5} shares from wallet {} at {}: cost {:.2}, proceeds {:.2}, pnl {:.2}{}",
        sold,
        wallet_id,
        price,
        outcome.cost_basis,
        outcome.proceeds,
        outcome.realized_pnl,
        if outcome.closed { " (closed)" } else { "" }
    );
    Ok(outcome)
}
