//! Wallet rebuild from the transaction log.
//!
//! Wallets are a materialized view. [`replay_log`] recomputes them from
//! scratch so the incrementally maintained store can be cross-checked
//! ([`verify_wallets`]) or repaired ([`rebuild_wallets`]).
//!
//! Replay order per asset:
//! 1. By date
//! 2. Same date: SPLIT, then BUY, then DIVIDEND/SLP, then SELL
//! 3. Same type: by transaction id (entry order)

use crate::allocation::TargetPricing;
use crate::db;
use crate::error::{LedgerError, Result};
use crate::models::{shares_from_db, Transaction, TransactionAllocation, TransactionType};
use crate::reversal::{buy_effects, sell_effect};
use crate::wallets::{WalletBook, WalletKey};
use rusqlite::{params, Connection};
use serde::Serialize;
use std::collections::HashMap;

/// Where a SELL landed during replay.
#[derive(Debug, Clone, PartialEq)]
pub struct SellStamp {
    pub wallet_id: i64,
    pub key: WalletKey,
    pub cost_basis: f64,
}

#[derive(Debug, Clone)]
pub struct ReplayOutcome {
    pub book: WalletBook,
    /// (BUY id, profit target) -> wallet credited
    pub buy_wallets: HashMap<(i64, Option<i64>), i64>,
    /// SELL id -> wallet debited
    pub sells: HashMap<i64, SellStamp>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RebuildReport {
    pub asset_id: i64,
    pub wallets: usize,
    pub transactions: usize,
    /// Differences between the stored wallets and the replay
    pub differences: Vec<String>,
}

/// Transactions in wallet replay order.
pub fn replay_order(transactions: &[Transaction]) -> Vec<&Transaction> {
    let mut ordered: Vec<&Transaction> = transactions.iter().collect();
    ordered.sort_by_key(|t| (t.date, t.txn_type.replay_rank(), t.id));
    ordered
}

/// Replay an asset's log into `seed` (an empty book carrying id preferences).
pub fn replay_log(
    asset_id: i64,
    transactions: &[Transaction],
    allocations: &HashMap<i64, Vec<TransactionAllocation>>,
    pricing: &TargetPricing,
    seed: WalletBook,
) -> Result<ReplayOutcome> {
    let mut book = seed;
    let mut buy_wallets = HashMap::new();
    let mut sells = HashMap::new();
    let no_allocations: Vec<TransactionAllocation> = Vec::new();

    for txn in replay_order(transactions) {
        if txn.asset_id != asset_id {
            continue;
        }
        match txn.txn_type {
            TransactionType::Split => {
                let ratio = match txn.split_ratio {
                    Some(r) if r > 0.0 => r,
                    _ => {
                        return Err(LedgerError::validation(format!(
                            "SPLIT {} has no usable ratio",
                            txn.id
                        )))
                    }
                };
                book.apply_split(asset_id, ratio, |k| pricing.price_for(k));
            }
            TransactionType::Buy => {
                let rows = allocations.get(&txn.id).unwrap_or(&no_allocations);
                for effect in buy_effects(txn, rows)? {
                    let wallet_id = book.apply_delta(
                        effect.key,
                        effect.shares,
                        pricing.price_for(&effect.key),
                        effect.wallet_id,
                    );
                    buy_wallets.insert((txn.id, effect.key.profit_target_id), wallet_id);
                }
            }
            TransactionType::Sell => {
                let stamp = replay_sell(&mut book, txn)?;
                sells.insert(txn.id, stamp);
            }
            TransactionType::Dividend | TransactionType::Slp => {}
        }
    }

    book.check_invariants()?;
    Ok(ReplayOutcome {
        book,
        buy_wallets,
        sells,
    })
}

fn replay_sell(book: &mut WalletBook, txn: &Transaction) -> Result<SellStamp> {
    let quantity = match txn.quantity {
        Some(q) if q > 0 => q,
        _ => {
            return Err(LedgerError::validation(format!(
                "SELL {} has no usable quantity",
                txn.id
            )))
        }
    };

    // Wallet ids survive splits and merges, so prefer them over the stored key
    let wallet_id = match txn.wallet_id.and_then(|id| book.get_by_id(id)) {
        Some(w) => w.id,
        None => {
            let effect = sell_effect(txn)?;
            match book.get(&effect.key) {
                Some(w) => w.id,
                None => {
                    return Err(LedgerError::validation(format!(
                        "SELL {} on {} takes {:.5} shares from a lot that holds none at that date",
                        txn.id,
                        txn.date,
                        shares_from_db(quantity)
                    )))
                }
            }
        }
    };

    let before = book.debit(wallet_id, quantity)?;
    Ok(SellStamp {
        wallet_id,
        key: before.key(),
        cost_basis: before.purchase_price() * shares_from_db(quantity),
    })
}

/// Current commission and target percents of an asset.
pub fn load_pricing(conn: &Connection, asset_id: i64) -> Result<TargetPricing> {
    let asset = db::assets::get_asset(conn, asset_id)?;
    let targets = db::assets::list_profit_targets(conn, asset_id)?;
    Ok(TargetPricing::new(asset.commission_rate(), &targets))
}

/// Replay the stored log of one asset without writing anything.
pub fn replay_asset(conn: &Connection, asset_id: i64) -> Result<ReplayOutcome> {
    let pricing = load_pricing(conn, asset_id)?;
    let transactions = db::transactions::list_transactions(conn, asset_id)?;
    let allocations = db::transactions::allocations_by_transaction(conn, asset_id)?;
    let stored = db::wallets::list_wallets(conn, asset_id)?;
    let preferred: HashMap<WalletKey, i64> = stored.iter().map(|w| (w.key(), w.id)).collect();
    let seed = WalletBook::new(db::wallets::next_wallet_id(conn)?).with_preferred_ids(preferred);
    replay_log(asset_id, &transactions, &allocations, &pricing, seed)
}

/// Differences between the stored wallets and a fresh replay (empty when
/// the two agree).
pub fn verify_wallets(conn: &Connection, asset_id: i64) -> Result<Vec<String>> {
    let replayed = replay_asset(conn, asset_id)?;
    let stored = db::wallets::load_book(conn, asset_id)?;
    Ok(stored.diff(&replayed.book))
}

/// Rebuild one asset's wallets from its log, re-stamping the wallet ids
/// recorded on allocations and sells.
pub fn rebuild_wallets(conn: &Connection, asset_id: i64) -> Result<RebuildReport> {
    let outcome = replay_asset(conn, asset_id)?;
    let stored = db::wallets::load_book(conn, asset_id)?;
    let differences = stored.diff(&outcome.book);
    for d in &differences {
        log::warn!("Asset {}: {}", asset_id, d);
    }

    store_replay(conn, asset_id, &outcome)?;

    let transactions = db::transactions::list_transactions(conn, asset_id)?.len();
    log::info!(
        "Rebuilt {} wallets for asset {} from {} transactions",
        outcome.book.len(),
        asset_id,
        transactions
    );
    Ok(RebuildReport {
        asset_id,
        wallets: outcome.book.len(),
        transactions,
        differences,
    })
}

/// Replace the asset's wallets with a fresh replay. Used by mutations that
/// cannot be applied incrementally (splits and anything dated before one).
pub(crate) fn apply_replay(conn: &Connection, asset_id: i64) -> Result<usize> {
    let outcome = replay_asset(conn, asset_id)?;
    store_replay(conn, asset_id, &outcome)?;
    log::debug!("Replayed asset {} into {} wallets", asset_id, outcome.book.len());
    Ok(outcome.book.len())
}

fn store_replay(conn: &Connection, asset_id: i64, outcome: &ReplayOutcome) -> Result<()> {
    db::wallets::save_book(conn, asset_id, &outcome.book)?;
    stamp_transactions(conn, asset_id, outcome)
}

fn stamp_transactions(conn: &Connection, asset_id: i64, outcome: &ReplayOutcome) -> Result<()> {
    let allocations = db::transactions::allocations_by_transaction(conn, asset_id)?;
    for ((txn_id, target), wallet_id) in &outcome.buy_wallets {
        match (allocations.get(txn_id), target) {
            (Some(rows), Some(target_id)) => {
                for row in rows.iter().filter(|r| r.profit_target_id == *target_id) {
                    if row.wallet_id != *wallet_id {
                        db::transactions::set_allocation_wallet(conn, row.id, *wallet_id)?;
                    }
                }
            }
            _ => {
                conn.execute(
                    "UPDATE txn SET wallet_id = ?1 WHERE id = ?2",
                    params![wallet_id, txn_id],
                )?;
            }
        }
    }

    for (txn_id, stamp) in &outcome.sells {
        conn.execute(
            "UPDATE txn SET wallet_id = ?1, lot_price_key = ?2, lot_profit_target_id = ?3,
                 cost_basis = ?4, realized_pnl = amount - ?4
             WHERE id = ?5",
            params![
                stamp.wallet_id,
                stamp.key.price_key,
                stamp.key.profit_target_id,
                stamp.cost_basis,
                txn_id
            ],
        )?;
    }
    Ok(())
}

/// Rebuild every asset, continuing past assets whose log cannot be replayed.
pub fn rebuild_all_wallets(conn: &mut Connection) -> Result<Vec<RebuildReport>> {
    let assets = db::assets::list_assets(conn, true)?;
    let mut reports = Vec::with_capacity(assets.len());
    for asset in assets {
        let tx = conn.transaction()?;
        match rebuild_wallets(&tx, asset.id) {
            Ok(report) => {
                tx.commit()?;
                reports.push(report);
            }
            Err(e) => {
                log::error!("Failed to rebuild wallets for {} ({}): {}", asset.symbol, asset.id, e);
            }
        }
    }
    Ok(reports)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{price_to_db, ProfitTarget, SHARES_SCALE};
    use chrono::NaiveDate;

    fn date(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 4, d).unwrap()
    }

    fn pricing() -> TargetPricing {
        TargetPricing::new(
            0.0,
            &[
                ProfitTarget { id: 1, asset_id: 1, percent: 10.0, default_allocation: None, sort_order: 0 },
                ProfitTarget { id: 2, asset_id: 1, percent: 20.0, default_allocation: None, sort_order: 1 },
            ],
        )
    }

    fn buy(id: i64, day: u32, price: f64, investment: f64, wallet: i64) -> (Transaction, Vec<TransactionAllocation>) {
        let mut txn = Transaction::new(1, TransactionType::Buy, date(day));
        txn.id = id;
        txn.price = Some(price);
        txn.investment = Some(investment);
        let half = crate::models::round_allocation_shares(investment / price / 2.0);
        let rows = vec![
            TransactionAllocation { id: id * 10, transaction_id: id, profit_target_id: 1, wallet_id: wallet, percentage: 50.0, shares: half },
            TransactionAllocation { id: id * 10 + 1, transaction_id: id, profit_target_id: 2, wallet_id: wallet + 1, percentage: 50.0, shares: half },
        ];
        (txn, rows)
    }

    fn sell(id: i64, day: u32, wallet: i64, price_key: f64, target: i64, qty: i64) -> Transaction {
        let mut txn = Transaction::new(1, TransactionType::Sell, date(day));
        txn.id = id;
        txn.price = Some(12.0);
        txn.quantity = Some(qty * SHARES_SCALE);
        txn.wallet_id = Some(wallet);
        txn.lot_price_key = Some(price_to_db(price_key));
        txn.lot_profit_target_id = Some(target);
        txn
    }

    #[test]
    fn test_replay_buy_and_sell() {
        let (b, rows) = buy(1, 1, 10.0, 1000.0, 5);
        let s = sell(2, 2, 5, 10.0, 1, 30);
        let allocations = HashMap::from([(1, rows)]);

        let out = replay_log(1, &[s, b], &allocations, &pricing(), WalletBook::new(1)).unwrap();
        let first = out.book.get_by_id(5).unwrap();
        assert_eq!(first.shares, 20 * SHARES_SCALE);
        assert!((first.investment - 200.0).abs() < 1e-9);
        assert_eq!(out.book.get_by_id(6).unwrap().shares, 50 * SHARES_SCALE);
        assert!((out.sells[&2].cost_basis - 300.0).abs() < 1e-9);
        assert_eq!(out.buy_wallets[&(1, Some(2))], 6);
    }

    #[test]
    fn test_same_day_sell_runs_after_buy() {
        let (b, rows) = buy(9, 1, 10.0, 1000.0, 5);
        // Entered first but must replay after the BUY of the same day
        let s = sell(3, 1, 5, 10.0, 1, 50);
        let allocations = HashMap::from([(9, rows)]);
        let out = replay_log(1, &[s, b], &allocations, &pricing(), WalletBook::new(1)).unwrap();
        assert!(out.book.get_by_id(5).is_none());
        assert_eq!(out.book.len(), 1);
    }

    #[test]
    fn test_sell_before_any_buy_fails() {
        let (b, rows) = buy(1, 5, 10.0, 1000.0, 5);
        let s = sell(2, 2, 5, 10.0, 1, 10);
        let allocations = HashMap::from([(1, rows)]);
        let err = replay_log(1, &[b, s], &allocations, &pricing(), WalletBook::new(1)).unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn test_split_then_sell_by_wallet_id() {
        let (b, rows) = buy(1, 1, 10.0, 1000.0, 5);
        let mut split = Transaction::new(1, TransactionType::Split, date(3));
        split.id = 2;
        split.split_ratio = Some(2.0);
        // Lot key recorded before the split; the wallet id still resolves it
        let s = sell(3, 4, 5, 10.0, 1, 60);
        let allocations = HashMap::from([(1, rows)]);

        let out = replay_log(1, &[b, split, s], &allocations, &pricing(), WalletBook::new(1)).unwrap();
        let w = out.book.get_by_id(5).unwrap();
        assert_eq!(w.shares, 40 * SHARES_SCALE);
        assert!((w.purchase_price() - 5.0).abs() < 1e-9);
        assert!((w.profit_target_price - 5.5).abs() < 1e-9);
        assert_eq!(out.sells[&3].key.price_key, price_to_db(5.0));
        assert!((out.sells[&3].cost_basis - 300.0).abs() < 1e-9);
    }
}
