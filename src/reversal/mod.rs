//! Reversal engine: undoes what a stored BUY or SELL did to the lot store,
//! so an edit can re-apply new values without double counting.
//!
//! Reversing a BUY subtracts each allocation from its wallet. Reversing a
//! SELL re-credits the lot it was taken from, recreating the wallet under
//! its old id if the sell had closed it. Callers `settle()` the book once
//! the whole reverse/re-apply sequence is done.

use crate::allocation::TargetPricing;
use crate::error::{LedgerError, Result};
use crate::models::{round_allocation_shares, Transaction, TransactionAllocation, TransactionType};
use crate::wallets::{WalletBook, WalletKey};

/// Shares one transaction put into (positive) or took out of one lot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LotEffect {
    pub key: WalletKey,
    /// × 10^8
    pub shares: i64,
    /// Wallet id recorded on the transaction, reused if the lot has to be opened
    pub wallet_id: Option<i64>,
}

/// The lots a stored BUY credited. Multi-target BUYs carry allocation rows;
/// single-target BUYs are re-derived from price and investment.
pub fn buy_effects(txn: &Transaction, allocations: &[TransactionAllocation]) -> Result<Vec<LotEffect>> {
    let price = match txn.price {
        Some(p) if p > 0.0 => p,
        _ => {
            return Err(LedgerError::validation(format!(
                "BUY {} has no usable price",
                txn.id
            )))
        }
    };

    if !allocations.is_empty() {
        return Ok(allocations
            .iter()
            .map(|a| LotEffect {
                key: WalletKey::new(txn.asset_id, price, Some(a.profit_target_id)),
                shares: a.shares,
                wallet_id: Some(a.wallet_id).filter(|id| *id > 0),
            })
            .collect());
    }

    let total = txn.purchased_shares().ok_or_else(|| {
        LedgerError::validation(format!("BUY {} has no usable investment", txn.id))
    })?;
    Ok(vec![LotEffect {
        key: WalletKey::new(txn.asset_id, price, txn.profit_target_id),
        shares: round_allocation_shares(total),
        wallet_id: txn.wallet_id,
    }])
}

/// The lot a stored SELL debited.
pub fn sell_effect(txn: &Transaction) -> Result<LotEffect> {
    match (txn.lot_price_key, txn.quantity) {
        (Some(price_key), Some(quantity)) => Ok(LotEffect {
            key: WalletKey {
                asset_id: txn.asset_id,
                price_key,
                profit_target_id: txn.lot_profit_target_id,
            },
            shares: -quantity,
            wallet_id: txn.wallet_id,
        }),
        _ => Err(LedgerError::validation(format!(
            "SELL {} does not record the lot it was taken from",
            txn.id
        ))),
    }
}

/// Subtract a BUY's allocations from the book. Wallets may go transiently
/// negative if their shares were sold since; `settle()` rejects that.
pub fn reverse_buy(book: &mut WalletBook, effects: &[LotEffect], pricing: &TargetPricing) {
    for effect in effects {
        let id = book.apply_delta(
            effect.key,
            -effect.shares,
            pricing.price_for(&effect.key),
            effect.wallet_id,
        );
        log::debug!(
            "Reversed {} shares from wallet {} (price key {})",
            effect.shares,
            id,
            effect.key.price_key
        );
    }
}

/// Give a SELL's shares back to its lot. Returns the wallet id credited.
pub fn reverse_sell(book: &mut WalletBook, txn: &Transaction, pricing: &TargetPricing) -> Result<i64> {
    if txn.txn_type != TransactionType::Sell {
        return Err(LedgerError::validation(format!(
            "transaction {} is a {}, not a SELL",
            txn.id,
            txn.txn_type.as_str()
        )));
    }
    let effect = sell_effect(txn)?;
    let id = book.apply_delta(
        effect.key,
        -effect.shares,
        pricing.price_for(&effect.key),
        effect.wallet_id,
    );
    if Some(id) != txn.wallet_id {
        log::warn!(
            "SELL {} re-credited wallet {} instead of its original wallet {:?}",
            txn.id,
            id,
            txn.wallet_id
        );
    }
    Ok(id)
}
