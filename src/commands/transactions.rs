//! Transaction commands: record, edit and delete BUY / SELL / DIVIDEND /
//! SLP / SPLIT entries and keep the asset's wallets in step.
//!
//! Edits and deletes first reverse what the stored row did, then re-apply
//! the new values against the same book. Anything that touches dates at or
//! before a SPLIT goes through a full replay instead, since incremental
//! deltas cannot be placed before a split.

use crate::allocation::{
    apply_allocations, plan_allocations, requested_percentages, AppliedAllocation, PlannedAllocation,
    TargetPricing,
};
use crate::commands::{require_non_negative, require_positive, verify_after_mutation};
use crate::config::Config;
use crate::db;
use crate::error::{LedgerError, Result};
use crate::models::{
    primary_entry_target, shares_from_db, shares_to_db, Asset, ProfitTarget, Transaction,
    TransactionAllocation, TransactionType,
};
use crate::rebuild;
use crate::reversal::{buy_effects, reverse_buy, reverse_sell};
use crate::sell::{resolve_sell, sell_proceeds, SellOutcome};
use crate::signals::lbd_price;
use crate::wallets::Wallet;
use chrono::NaiveDate;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

const FULL_PERCENT_TOLERANCE: f64 = 1e-9;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTransactionRequest {
    pub asset_id: i64,
    pub txn_type: TransactionType,
    pub date: NaiveDate,
    #[serde(default)]
    pub signal: Option<String>,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub investment: Option<f64>,
    /// SELL quantity in shares
    #[serde(default)]
    pub quantity: Option<f64>,
    #[serde(default)]
    pub amount: Option<f64>,
    #[serde(default)]
    pub split_ratio: Option<f64>,
    /// Wallet a SELL takes its shares from
    #[serde(default)]
    pub wallet_id: Option<i64>,
    /// Profit target id -> percentage for a BUY; target defaults apply when absent
    #[serde(default)]
    pub allocations: Option<HashMap<i64, f64>>,
}

impl CreateTransactionRequest {
    fn blank(asset_id: i64, txn_type: TransactionType, date: NaiveDate) -> Self {
        Self {
            asset_id,
            txn_type,
            date,
            signal: None,
            price: None,
            investment: None,
            quantity: None,
            amount: None,
            split_ratio: None,
            wallet_id: None,
            allocations: None,
        }
    }

    pub fn buy(asset_id: i64, date: NaiveDate, price: f64, investment: f64) -> Self {
        Self {
            price: Some(price),
            investment: Some(investment),
            ..Self::blank(asset_id, TransactionType::Buy, date)
        }
    }

    pub fn sell(asset_id: i64, date: NaiveDate, wallet_id: i64, price: f64, quantity: f64) -> Self {
        Self {
            price: Some(price),
            quantity: Some(quantity),
            wallet_id: Some(wallet_id),
            ..Self::blank(asset_id, TransactionType::Sell, date)
        }
    }

    pub fn dividend(asset_id: i64, date: NaiveDate, amount: f64) -> Self {
        Self {
            amount: Some(amount),
            ..Self::blank(asset_id, TransactionType::Dividend, date)
        }
    }

    pub fn slp(asset_id: i64, date: NaiveDate, amount: f64) -> Self {
        Self {
            amount: Some(amount),
            ..Self::blank(asset_id, TransactionType::Slp, date)
        }
    }

    pub fn split(asset_id: i64, date: NaiveDate, ratio: f64) -> Self {
        Self {
            split_ratio: Some(ratio),
            ..Self::blank(asset_id, TransactionType::Split, date)
        }
    }

    pub fn with_allocations(mut self, allocations: HashMap<i64, f64>) -> Self {
        self.allocations = Some(allocations);
        self
    }

    pub fn with_signal(mut self, signal: &str) -> Self {
        self.signal = Some(signal.to_string());
        self
    }

    /// Only the fields that belong to the type are carried over.
    fn to_transaction(&self) -> Result<Transaction> {
        let mut txn = Transaction::new(self.asset_id, self.txn_type, self.date);
        txn.signal = self.signal.clone();
        match self.txn_type {
            TransactionType::Buy => {
                txn.price = Some(require_positive("price", self.price)?);
                txn.investment = Some(require_positive("investment", self.investment)?);
            }
            TransactionType::Sell => {
                txn.price = Some(require_positive("price", self.price)?);
                txn.quantity = Some(sell_quantity(self.quantity)?);
                txn.wallet_id = Some(
                    self.wallet_id
                        .ok_or_else(|| LedgerError::validation("SELL needs the wallet to sell from"))?,
                );
            }
            TransactionType::Dividend | TransactionType::Slp => {
                txn.amount = Some(require_non_negative("amount", self.amount)?);
            }
            TransactionType::Split => {
                txn.split_ratio = Some(require_positive("splitRatio", self.split_ratio)?);
            }
        }
        Ok(txn)
    }
}

/// Partial edit. Type and asset are fixed once recorded; passing different
/// values is rejected.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UpdateTransactionRequest {
    pub asset_id: Option<i64>,
    pub txn_type: Option<TransactionType>,
    pub date: Option<NaiveDate>,
    pub signal: Option<String>,
    pub price: Option<f64>,
    pub investment: Option<f64>,
    pub quantity: Option<f64>,
    pub amount: Option<f64>,
    pub split_ratio: Option<f64>,
    pub wallet_id: Option<i64>,
    pub allocations: Option<HashMap<i64, f64>>,
}

impl UpdateTransactionRequest {
    fn merge_into(&self, old: &Transaction) -> Result<Transaction> {
        if let Some(t) = self.txn_type {
            if t != old.txn_type {
                return Err(LedgerError::validation(format!(
                    "transaction {} is a {}; delete it and record a {} instead",
                    old.id,
                    old.txn_type.as_str(),
                    t.as_str()
                )));
            }
        }
        if let Some(a) = self.asset_id {
            if a != old.asset_id {
                return Err(LedgerError::validation(format!(
                    "transaction {} cannot be moved to another asset",
                    old.id
                )));
            }
        }

        let mut txn = old.clone();
        if let Some(date) = self.date {
            txn.date = date;
        }
        if self.signal.is_some() {
            txn.signal = self.signal.clone();
        }
        match txn.txn_type {
            TransactionType::Buy => {
                txn.price = Some(require_positive("price", self.price.or(old.price))?);
                txn.investment = Some(require_positive("investment", self.investment.or(old.investment))?);
            }
            TransactionType::Sell => {
                txn.price = Some(require_positive("price", self.price.or(old.price))?);
                if self.quantity.is_some() {
                    txn.quantity = Some(sell_quantity(self.quantity)?);
                }
                if let Some(wallet_id) = self.wallet_id {
                    txn.wallet_id = Some(wallet_id);
                }
            }
            TransactionType::Dividend | TransactionType::Slp => {
                txn.amount = Some(require_non_negative("amount", self.amount.or(old.amount))?);
            }
            TransactionType::Split => {
                txn.split_ratio = Some(require_positive("splitRatio", self.split_ratio.or(old.split_ratio))?);
            }
        }
        Ok(txn)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionResult {
    pub transaction: Transaction,
    pub allocations: Vec<TransactionAllocation>,
}

fn sell_quantity(quantity: Option<f64>) -> Result<i64> {
    let shares = require_positive("quantity", quantity)?;
    let scaled = shares_to_db(shares);
    if scaled <= 0 {
        return Err(LedgerError::validation(format!(
            "quantity {} is below share precision",
            shares
        )));
    }
    Ok(scaled)
}

fn load_result(conn: &Connection, id: i64) -> Result<TransactionResult> {
    Ok(TransactionResult {
        transaction: db::transactions::get_transaction(conn, id)?,
        allocations: db::transactions::list_allocations(conn, id)?,
    })
}

/// Entry-target percent and limit-buy-down price as of BUY time.
fn stamp_entry_snapshot(conn: &Connection, txn: &mut Transaction) -> Result<()> {
    let entry_targets = db::assets::list_entry_targets(conn, txn.asset_id)?;
    txn.entry_target_percent = primary_entry_target(&entry_targets).map(|t| t.percent);
    txn.lbd_price = match (txn.price, txn.entry_target_percent) {
        (Some(price), Some(pct)) => Some(lbd_price(price, pct)),
        _ => None,
    };
    Ok(())
}

/// A BUY that lands 100% on one target is stored on the row itself;
/// anything else gets allocation rows. Returns true for the single case.
pub(crate) fn shape_buy(txn: &mut Transaction, plans: &[PlannedAllocation]) -> bool {
    match plans {
        [only] if (only.percentage - 100.0).abs() < FULL_PERCENT_TOLERANCE => {
            txn.profit_target_id = only.profit_target_id;
            true
        }
        _ => {
            txn.profit_target_id = None;
            txn.wallet_id = None;
            false
        }
    }
}

/// Allocation rows for a multi-target BUY. Missing wallet ids are written as
/// 0 and stamped by the next replay.
pub(crate) fn write_allocations(
    conn: &Connection,
    txn_id: i64,
    plans: &[PlannedAllocation],
    applied: &[AppliedAllocation],
) -> Result<()> {
    for plan in plans {
        let Some(profit_target_id) = plan.profit_target_id else {
            log::warn!("BUY {} has an allocation without a profit target, skipped", txn_id);
            continue;
        };
        let wallet_id = applied
            .iter()
            .find(|a| a.plan.profit_target_id == plan.profit_target_id)
            .map(|a| a.wallet_id)
            .unwrap_or(0);
        db::transactions::insert_allocation(
            conn,
            &TransactionAllocation {
                id: 0,
                transaction_id: txn_id,
                profit_target_id,
                wallet_id,
                percentage: plan.percentage,
                shares: plan.shares,
            },
        )?;
    }
    Ok(())
}

/// The percentages a BUY was recorded with, for edits that keep them.
fn recorded_percentages(
    old: &Transaction,
    rows: &[TransactionAllocation],
    targets: &[ProfitTarget],
) -> HashMap<i64, f64> {
    if !rows.is_empty() {
        return rows
            .iter()
            .filter(|r| targets.iter().any(|t| t.id == r.profit_target_id))
            .map(|r| (r.profit_target_id, r.percentage))
            .collect();
    }
    match old.profit_target_id {
        Some(id) if targets.iter().any(|t| t.id == id) => HashMap::from([(id, 100.0)]),
        _ => requested_percentages(targets, None),
    }
}

fn record_sell_outcome(txn: &mut Transaction, outcome: &SellOutcome) {
    txn.wallet_id = Some(outcome.wallet_id);
    txn.lot_price_key = Some(outcome.key.price_key);
    txn.lot_profit_target_id = outcome.key.profit_target_id;
    txn.cost_basis = Some(outcome.cost_basis);
    txn.amount = Some(outcome.proceeds);
    txn.realized_pnl = Some(outcome.realized_pnl);
}

/// SELL fields for the replay path: net proceeds now, lot key from the
/// wallet as currently stored. Cost basis is stamped by the replay.
fn prepare_replayed_sell(conn: &Connection, asset: &Asset, txn: &mut Transaction) -> Result<()> {
    let wallet_id = txn
        .wallet_id
        .ok_or_else(|| LedgerError::validation("SELL needs the wallet to sell from"))?;
    let wallet = db::wallets::get_wallet(conn, wallet_id)?;
    if wallet.asset_id != asset.id {
        return Err(LedgerError::validation(format!(
            "wallet {} belongs to another asset",
            wallet_id
        )));
    }
    let price = require_positive("price", txn.price)?;
    let quantity = txn
        .quantity
        .ok_or_else(|| LedgerError::validation("quantity is required"))?;
    let (_, _, net) = sell_proceeds(price, shares_from_db(quantity), asset.commission_rate());
    txn.amount = Some(net);
    txn.lot_price_key = Some(wallet.price_key);
    txn.lot_profit_target_id = wallet.profit_target_id;
    Ok(())
}

fn needs_replay(conn: &Connection, txn: &Transaction, since: NaiveDate) -> Result<bool> {
    Ok(txn.txn_type == TransactionType::Split
        || db::transactions::has_split_since(conn, txn.asset_id, since)?)
}

pub fn create_transaction(
    conn: &mut Connection,
    config: &Config,
    data: CreateTransactionRequest,
) -> Result<TransactionResult> {
    let tx = conn.transaction()?;
    let asset = db::assets::get_asset(&tx, data.asset_id)?;
    let mut txn = data.to_transaction()?;
    let replay = needs_replay(&tx, &txn, txn.date)?;

    match txn.txn_type {
        TransactionType::Buy => {
            let targets = db::assets::list_profit_targets(&tx, asset.id)?;
            let pricing = TargetPricing::new(asset.commission_rate(), &targets);
            let requested = requested_percentages(&targets, data.allocations.as_ref());
            let price = require_positive("price", txn.price)?;
            let investment = require_positive("investment", txn.investment)?;
            let plans = plan_allocations(price, investment, &targets, &requested)?;
            stamp_entry_snapshot(&tx, &mut txn)?;
            let single = shape_buy(&mut txn, &plans);

            if replay {
                txn.id = db::transactions::insert_transaction(&tx, &txn)?;
                if !single {
                    write_allocations(&tx, txn.id, &plans, &[])?;
                }
                rebuild::apply_replay(&tx, asset.id)?;
            } else {
                let mut book = db::wallets::load_book(&tx, asset.id)?;
                let applied = apply_allocations(&mut book, asset.id, price, &plans, &pricing);
                book.settle()?;
                db::wallets::save_book(&tx, asset.id, &book)?;
                if single {
                    txn.wallet_id = applied.first().map(|a| a.wallet_id);
                }
                txn.id = db::transactions::insert_transaction(&tx, &txn)?;
                if !single {
                    write_allocations(&tx, txn.id, &plans, &applied)?;
                }
            }
        }
        TransactionType::Sell => {
            if replay {
                prepare_replayed_sell(&tx, &asset, &mut txn)?;
                txn.id = db::transactions::insert_transaction(&tx, &txn)?;
                rebuild::apply_replay(&tx, asset.id)?;
            } else {
                let mut book = db::wallets::load_book(&tx, asset.id)?;
                let outcome = resolve_sell(
                    &mut book,
                    txn.wallet_id.unwrap_or_default(),
                    require_positive("price", txn.price)?,
                    txn.quantity.unwrap_or_default(),
                    asset.commission_rate(),
                )?;
                db::wallets::save_book(&tx, asset.id, &book)?;
                record_sell_outcome(&mut txn, &outcome);
                txn.id = db::transactions::insert_transaction(&tx, &txn)?;
            }
        }
        TransactionType::Dividend | TransactionType::Slp => {
            txn.id = db::transactions::insert_transaction(&tx, &txn)?;
        }
        TransactionType::Split => {
            txn.id = db::transactions::insert_transaction(&tx, &txn)?;
            rebuild::apply_replay(&tx, asset.id)?;
        }
    }

    verify_after_mutation(&tx, config, asset.id)?;
    let result = load_result(&tx, txn.id)?;
    tx.commit()?;

    log::info!(
        "Recorded {} {} for {} on {}",
        txn.txn_type.as_str(),
        txn.id,
        asset.symbol,
        txn.date
    );
    Ok(result)
}

pub fn update_transaction(
    conn: &mut Connection,
    config: &Config,
    id: i64,
    data: UpdateTransactionRequest,
) -> Result<TransactionResult> {
    let tx = conn.transaction()?;
    let old = db::transactions::get_transaction(&tx, id)?;
    let mut txn = data.merge_into(&old)?;
    let asset = db::assets::get_asset(&tx, old.asset_id)?;
    let replay = needs_replay(&tx, &old, old.date.min(txn.date))?;

    match old.txn_type {
        TransactionType::Buy => {
            let targets = db::assets::list_profit_targets(&tx, asset.id)?;
            let pricing = TargetPricing::new(asset.commission_rate(), &targets);
            let old_rows = db::transactions::list_allocations(&tx, id)?;
            let requested = match data.allocations.as_ref() {
                Some(explicit) => requested_percentages(&targets, Some(explicit)),
                None => recorded_percentages(&old, &old_rows, &targets),
            };
            let price = require_positive("price", txn.price)?;
            let investment = require_positive("investment", txn.investment)?;
            let plans = plan_allocations(price, investment, &targets, &requested)?;
            // The entry snapshot stays as recorded; only the price it applies to moves
            txn.lbd_price = txn.entry_target_percent.map(|pct| lbd_price(price, pct));
            let single = shape_buy(&mut txn, &plans);
            db::transactions::delete_allocations(&tx, id)?;

            if replay {
                txn.wallet_id = None;
                db::transactions::update_transaction(&tx, &txn)?;
                if !single {
                    write_allocations(&tx, id, &plans, &[])?;
                }
                rebuild::apply_replay(&tx, asset.id)?;
            } else {
                let mut book = db::wallets::load_book(&tx, asset.id)?;
                reverse_buy(&mut book, &buy_effects(&old, &old_rows)?, &pricing);
                let applied = apply_allocations(&mut book, asset.id, price, &plans, &pricing);
                book.settle()?;
                db::wallets::save_book(&tx, asset.id, &book)?;
                txn.wallet_id = if single {
                    applied.first().map(|a| a.wallet_id)
                } else {
                    None
                };
                db::transactions::update_transaction(&tx, &txn)?;
                if !single {
                    write_allocations(&tx, id, &plans, &applied)?;
                }
            }
        }
        TransactionType::Sell => {
            if replay {
                prepare_replayed_sell(&tx, &asset, &mut txn)?;
                db::transactions::update_transaction(&tx, &txn)?;
                rebuild::apply_replay(&tx, asset.id)?;
            } else {
                let pricing = rebuild::load_pricing(&tx, asset.id)?;
                let mut book = db::wallets::load_book(&tx, asset.id)?;
                reverse_sell(&mut book, &old, &pricing)?;
                let outcome = resolve_sell(
                    &mut book,
                    txn.wallet_id.unwrap_or_default(),
                    require_positive("price", txn.price)?,
                    txn.quantity.unwrap_or_default(),
                    asset.commission_rate(),
                )?;
                book.settle()?;
                db::wallets::save_book(&tx, asset.id, &book)?;
                record_sell_outcome(&mut txn, &outcome);
                db::transactions::update_transaction(&tx, &txn)?;
            }
        }
        TransactionType::Dividend | TransactionType::Slp => {
            db::transactions::update_transaction(&tx, &txn)?;
        }
        TransactionType::Split => {
            db::transactions::update_transaction(&tx, &txn)?;
            rebuild::apply_replay(&tx, asset.id)?;
        }
    }

    verify_after_mutation(&tx, config, asset.id)?;
    let result = load_result(&tx, id)?;
    tx.commit()?;

    log::info!(
        "Updated {} {} for {} ({} -> {})",
        txn.txn_type.as_str(),
        id,
        asset.symbol,
        old.date,
        txn.date
    );
    Ok(result)
}

pub fn delete_transaction(conn: &mut Connection, config: &Config, id: i64) -> Result<()> {
    let tx = conn.transaction()?;
    let old = db::transactions::get_transaction(&tx, id)?;
    let asset_id = old.asset_id;

    if needs_replay(&tx, &old, old.date)? {
        db::transactions::delete_transaction(&tx, id)?;
        rebuild::apply_replay(&tx, asset_id)?;
    } else {
        match old.txn_type {
            TransactionType::Buy => {
                let pricing = rebuild::load_pricing(&tx, asset_id)?;
                let rows = db::transactions::list_allocations(&tx, id)?;
                let mut book = db::wallets::load_book(&tx, asset_id)?;
                reverse_buy(&mut book, &buy_effects(&old, &rows)?, &pricing);
                let closed = book.settle()?;
                db::wallets::save_book(&tx, asset_id, &book)?;
                log::debug!("Deleting BUY {} closed wallets {:?}", id, closed);
            }
            TransactionType::Sell => {
                let pricing = rebuild::load_pricing(&tx, asset_id)?;
                let mut book = db::wallets::load_book(&tx, asset_id)?;
                reverse_sell(&mut book, &old, &pricing)?;
                book.settle()?;
                db::wallets::save_book(&tx, asset_id, &book)?;
            }
            TransactionType::Dividend | TransactionType::Slp | TransactionType::Split => {}
        }
        db::transactions::delete_transaction(&tx, id)?;
    }

    verify_after_mutation(&tx, config, asset_id)?;
    tx.commit()?;
    log::info!("Deleted {} {} of asset {}", old.txn_type.as_str(), id, asset_id);
    Ok(())
}

pub fn get_transaction(conn: &Connection, id: i64) -> Result<TransactionResult> {
    load_result(conn, id)
}

pub fn list_transactions(conn: &Connection, asset_id: i64) -> Result<Vec<Transaction>> {
    db::assets::get_asset(conn, asset_id)?;
    db::transactions::list_transactions(conn, asset_id)
}

pub fn list_allocations(conn: &Connection, transaction_id: i64) -> Result<Vec<TransactionAllocation>> {
    db::transactions::get_transaction(conn, transaction_id)?;
    db::transactions::list_allocations(conn, transaction_id)
}

pub fn list_wallets(conn: &Connection, asset_id: i64) -> Result<Vec<Wallet>> {
    db::assets::get_asset(conn, asset_id)?;
    db::wallets::list_wallets(conn, asset_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_in_memory;
    use crate::models::SHARES_SCALE;

    const EPS: f64 = 1e-6;

    struct Fixture {
        conn: Connection,
        config: Config,
        asset_id: i64,
        t10: i64,
        t20: i64,
    }

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, d).unwrap()
    }

    /// Asset with two profit targets (+10%, +20%) and no commission.
    fn setup() -> Fixture {
        let conn = open_in_memory().unwrap();
        let asset_id = db::assets::insert_asset(&conn, "ACME", "Acme Corp", None, None).unwrap();
        let t10 = db::assets::insert_profit_target(&conn, asset_id, 10.0, None, 0).unwrap();
        let t20 = db::assets::insert_profit_target(&conn, asset_id, 20.0, None, 1).unwrap();
        Fixture {
            conn,
            config: Config::default(),
            asset_id,
            t10,
            t20,
        }
    }

    fn halves(f: &Fixture) -> HashMap<i64, f64> {
        HashMap::from([(f.t10, 50.0), (f.t20, 50.0)])
    }

    fn buy(f: &mut Fixture, d: u32, price: f64, investment: f64) -> TransactionResult {
        let req = CreateTransactionRequest::buy(f.asset_id, day(d), price, investment).with_allocations(halves(f));
        create_transaction(&mut f.conn, &f.config, req).unwrap()
    }

    fn wallet_for(f: &Fixture, target: i64) -> Wallet {
        db::wallets::list_wallets(&f.conn, f.asset_id)
            .unwrap()
            .into_iter()
            .find(|w| w.profit_target_id == Some(target))
            .unwrap()
    }

    fn snapshot(f: &Fixture) -> Vec<(i64, i64, i64)> {
        db::wallets::list_wallets(&f.conn, f.asset_id)
            .unwrap()
            .iter()
            .map(|w| (w.id, w.price_key, w.shares))
            .collect()
    }

    #[test]
    fn test_buy_split_across_targets() {
        let mut f = setup();
        let result = buy(&mut f, 1, 10.0, 1000.0);

        assert_eq!(result.allocations.len(), 2);
        let pct: f64 = result.allocations.iter().map(|a| a.percentage).sum();
        assert!((pct - 100.0).abs() < EPS);
        let shares: i64 = result.allocations.iter().map(|a| a.shares).sum();
        assert_eq!(shares, 100 * SHARES_SCALE);

        let w10 = wallet_for(&f, f.t10);
        let w20 = wallet_for(&f, f.t20);
        assert_eq!(w10.shares, 50 * SHARES_SCALE);
        assert!((w10.investment - 500.0).abs() < EPS);
        assert!((w10.profit_target_price - 11.0).abs() < EPS, "target price {}", w10.profit_target_price);
        assert!((w20.profit_target_price - 12.0).abs() < EPS);
        assert!(result.allocations.iter().any(|a| a.wallet_id == w10.id));
        assert!(result.allocations.iter().any(|a| a.wallet_id == w20.id));
    }

    #[test]
    fn test_partial_sell_records_pnl() {
        let mut f = setup();
        buy(&mut f, 1, 10.0, 1000.0);
        let w10 = wallet_for(&f, f.t10);

        let sell = CreateTransactionRequest::sell(f.asset_id, day(2), w10.id, 12.0, 30.0);
        let result = create_transaction(&mut f.conn, &f.config, sell).unwrap();
        let txn = result.transaction;

        assert!((txn.cost_basis.unwrap() - 300.0).abs() < EPS);
        assert!((txn.amount.unwrap() - 360.0).abs() < EPS);
        assert!((txn.realized_pnl.unwrap() - 60.0).abs() < EPS);
        assert_eq!(txn.wallet_id, Some(w10.id));

        let after = wallet_for(&f, f.t10);
        assert_eq!(after.id, w10.id);
        assert_eq!(after.shares, 20 * SHARES_SCALE);
        assert!((after.investment - 200.0).abs() < EPS);
    }

    #[test]
    fn test_sell_net_of_commission() {
        let mut f = setup();
        let mut asset = db::assets::get_asset(&f.conn, f.asset_id).unwrap();
        asset.commission = Some(1.0);
        db::assets::update_asset(&f.conn, &asset).unwrap();

        buy(&mut f, 1, 10.0, 1000.0);
        let w10 = wallet_for(&f, f.t10);
        let expected_target = 11.0 / 0.99;
        assert!((w10.profit_target_price - expected_target).abs() < EPS);

        let sell = CreateTransactionRequest::sell(f.asset_id, day(2), w10.id, 12.0, 10.0);
        let txn = create_transaction(&mut f.conn, &f.config, sell).unwrap().transaction;
        assert!((txn.amount.unwrap() - 118.8).abs() < EPS, "net {:?}", txn.amount);
        assert!((txn.realized_pnl.unwrap() - 18.8).abs() < EPS);
    }

    #[test]
    fn test_delete_buy_removes_its_wallets() {
        let mut f = setup();
        let result = buy(&mut f, 1, 10.0, 1000.0);
        delete_transaction(&mut f.conn, &f.config, result.transaction.id).unwrap();
        assert!(db::wallets::list_wallets(&f.conn, f.asset_id).unwrap().is_empty());
        assert!(db::transactions::list_allocations(&f.conn, result.transaction.id).unwrap().is_empty());
    }

    #[test]
    fn test_delete_buy_restores_prior_state() {
        let mut f = setup();
        buy(&mut f, 1, 10.0, 1000.0);
        let before = snapshot(&f);
        let second = buy(&mut f, 2, 10.0, 400.0);
        assert_ne!(snapshot(&f), before);

        delete_transaction(&mut f.conn, &f.config, second.transaction.id).unwrap();
        assert_eq!(snapshot(&f), before);
    }

    #[test]
    fn test_delete_sell_reopens_wallet_with_same_id() {
        let mut f = setup();
        buy(&mut f, 1, 10.0, 1000.0);
        let w10 = wallet_for(&f, f.t10);
        let sell = CreateTransactionRequest::sell(f.asset_id, day(2), w10.id, 11.0, 50.0);
        let sold = create_transaction(&mut f.conn, &f.config, sell).unwrap();
        assert!(db::wallets::get_wallet(&f.conn, w10.id).is_err());

        delete_transaction(&mut f.conn, &f.config, sold.transaction.id).unwrap();
        let back = db::wallets::get_wallet(&f.conn, w10.id).unwrap();
        assert_eq!(back.shares, 50 * SHARES_SCALE);
    }

    #[test]
    fn test_delete_sold_buy_is_rejected_without_changes() {
        let mut f = setup();
        let bought = buy(&mut f, 1, 10.0, 1000.0);
        let w10 = wallet_for(&f, f.t10);
        let sell = CreateTransactionRequest::sell(f.asset_id, day(2), w10.id, 12.0, 30.0);
        create_transaction(&mut f.conn, &f.config, sell).unwrap();
        let before = snapshot(&f);

        let err = delete_transaction(&mut f.conn, &f.config, bought.transaction.id).unwrap_err();
        assert!(err.is_validation(), "unexpected error {:?}", err);
        assert_eq!(snapshot(&f), before);
        assert!(db::transactions::get_transaction(&f.conn, bought.transaction.id).is_ok());
    }

    #[test]
    fn test_oversell_is_rejected() {
        let mut f = setup();
        buy(&mut f, 1, 10.0, 1000.0);
        let w10 = wallet_for(&f, f.t10);
        let sell = CreateTransactionRequest::sell(f.asset_id, day(2), w10.id, 12.0, 51.0);
        let err = create_transaction(&mut f.conn, &f.config, sell).unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientShares { .. }));
        assert_eq!(wallet_for(&f, f.t10).shares, 50 * SHARES_SCALE);
        assert_eq!(db::transactions::list_transactions(&f.conn, f.asset_id).unwrap().len(), 1);
    }

    #[test]
    fn test_backdated_sell_is_rejected() {
        let mut f = setup();
        buy(&mut f, 10, 10.0, 1000.0);
        let w10 = wallet_for(&f, f.t10);
        let sell = CreateTransactionRequest::sell(f.asset_id, day(5), w10.id, 12.0, 10.0);
        let err = create_transaction(&mut f.conn, &f.config, sell).unwrap_err();
        assert!(err.is_validation(), "unexpected error {:?}", err);
        assert_eq!(wallet_for(&f, f.t10).shares, 50 * SHARES_SCALE);
    }

    #[test]
    fn test_backdated_sell_rejected_without_verification() {
        let mut f = setup();
        f.config.verify_after_mutation = false;
        buy(&mut f, 10, 10.0, 1000.0);
        let w10 = wallet_for(&f, f.t10);

        let sell = CreateTransactionRequest::sell(f.asset_id, day(5), w10.id, 12.0, 10.0);
        let err = create_transaction(&mut f.conn, &f.config, sell).unwrap_err();
        assert!(err.is_validation(), "unexpected error {:?}", err);
        assert_eq!(wallet_for(&f, f.t10).shares, 50 * SHARES_SCALE);
        assert_eq!(db::transactions::list_transactions(&f.conn, f.asset_id).unwrap().len(), 1);
        assert!(rebuild::verify_wallets(&f.conn, f.asset_id).unwrap().is_empty());
    }

    #[test]
    fn test_tampered_wallet_is_a_consistency_violation() {
        let mut f = setup();
        buy(&mut f, 1, 10.0, 1000.0);
        let w10 = wallet_for(&f, f.t10);
        f.conn
            .execute(
                "UPDATE wallet SET shares = shares + ?1 WHERE id = ?2",
                rusqlite::params![SHARES_SCALE, w10.id],
            )
            .unwrap();

        let dividend = CreateTransactionRequest::dividend(f.asset_id, day(2), 5.0);
        let err = create_transaction(&mut f.conn, &f.config, dividend).unwrap_err();
        assert!(
            matches!(err, LedgerError::ConsistencyViolation(_)),
            "unexpected error {:?}",
            err
        );
        assert!(!err.is_validation());
        assert_eq!(db::transactions::list_transactions(&f.conn, f.asset_id).unwrap().len(), 1);

        // With the comparison off the same mutation goes through
        f.config.verify_after_mutation = false;
        let dividend = CreateTransactionRequest::dividend(f.asset_id, day(2), 5.0);
        create_transaction(&mut f.conn, &f.config, dividend).unwrap();
    }

    #[test]
    fn test_update_buy_keeps_wallet_ids() {
        let mut f = setup();
        let bought = buy(&mut f, 1, 10.0, 1000.0);
        let ids: Vec<i64> = snapshot(&f).iter().map(|s| s.0).collect();

        let update = UpdateTransactionRequest {
            investment: Some(2000.0),
            ..Default::default()
        };
        let result = update_transaction(&mut f.conn, &f.config, bought.transaction.id, update).unwrap();

        let after = snapshot(&f);
        assert_eq!(after.iter().map(|s| s.0).collect::<Vec<_>>(), ids);
        assert!(after.iter().all(|s| s.2 == 100 * SHARES_SCALE));
        let pct: f64 = result.allocations.iter().map(|a| a.percentage).sum();
        assert!((pct - 100.0).abs() < EPS, "kept percentages sum to {}", pct);
    }

    #[test]
    fn test_update_buy_below_sold_shares_is_rejected() {
        let mut f = setup();
        let bought = buy(&mut f, 1, 10.0, 1000.0);
        let w10 = wallet_for(&f, f.t10);
        let sell = CreateTransactionRequest::sell(f.asset_id, day(2), w10.id, 12.0, 40.0);
        create_transaction(&mut f.conn, &f.config, sell).unwrap();

        let update = UpdateTransactionRequest {
            investment: Some(600.0),
            ..Default::default()
        };
        let err = update_transaction(&mut f.conn, &f.config, bought.transaction.id, update).unwrap_err();
        assert!(err.is_validation());
        assert_eq!(wallet_for(&f, f.t10).shares, 10 * SHARES_SCALE);
    }

    #[test]
    fn test_update_sell_quantity() {
        let mut f = setup();
        buy(&mut f, 1, 10.0, 1000.0);
        let w10 = wallet_for(&f, f.t10);
        let sell = CreateTransactionRequest::sell(f.asset_id, day(2), w10.id, 12.0, 30.0);
        let sold = create_transaction(&mut f.conn, &f.config, sell).unwrap();

        let update = UpdateTransactionRequest {
            quantity: Some(10.0),
            ..Default::default()
        };
        let txn = update_transaction(&mut f.conn, &f.config, sold.transaction.id, update)
            .unwrap()
            .transaction;
        assert!((txn.cost_basis.unwrap() - 100.0).abs() < EPS);
        assert!((txn.realized_pnl.unwrap() - 20.0).abs() < EPS);
        assert_eq!(wallet_for(&f, f.t10).shares, 40 * SHARES_SCALE);
    }

    #[test]
    fn test_update_cannot_change_type_or_asset() {
        let mut f = setup();
        let bought = buy(&mut f, 1, 10.0, 1000.0);
        let id = bought.transaction.id;

        let retype = UpdateTransactionRequest {
            txn_type: Some(TransactionType::Sell),
            ..Default::default()
        };
        assert!(update_transaction(&mut f.conn, &f.config, id, retype).unwrap_err().is_validation());

        let move_asset = UpdateTransactionRequest {
            asset_id: Some(f.asset_id + 1),
            ..Default::default()
        };
        assert!(update_transaction(&mut f.conn, &f.config, id, move_asset).unwrap_err().is_validation());
    }

    #[test]
    fn test_single_target_buy_uses_row_fields() {
        let mut f = setup();
        let req = CreateTransactionRequest::buy(f.asset_id, day(1), 20.0, 1000.0)
            .with_allocations(HashMap::from([(f.t20, 100.0)]));
        let result = create_transaction(&mut f.conn, &f.config, req).unwrap();

        assert!(result.allocations.is_empty());
        assert_eq!(result.transaction.profit_target_id, Some(f.t20));
        let w = wallet_for(&f, f.t20);
        assert_eq!(result.transaction.wallet_id, Some(w.id));
        assert_eq!(w.shares, 50 * SHARES_SCALE);
    }

    #[test]
    fn test_asset_without_targets() {
        let mut conn = open_in_memory().unwrap();
        let config = Config::default();
        let asset_id = db::assets::insert_asset(&conn, "BARE", "No targets", None, None).unwrap();
        let req = CreateTransactionRequest::buy(asset_id, day(1), 5.0, 100.0);
        let result = create_transaction(&mut conn, &config, req).unwrap();

        let wallets = db::wallets::list_wallets(&conn, asset_id).unwrap();
        assert_eq!(wallets.len(), 1);
        assert_eq!(wallets[0].profit_target_id, None);
        assert!((wallets[0].profit_target_price - 5.0).abs() < EPS);
        assert_eq!(result.transaction.wallet_id, Some(wallets[0].id));
    }

    #[test]
    fn test_entry_snapshot_recorded_on_buy() {
        let mut f = setup();
        db::assets::insert_entry_target(&f.conn, f.asset_id, 5.0, 0).unwrap();
        let txn = buy(&mut f, 1, 10.0, 1000.0).transaction;
        assert_eq!(txn.entry_target_percent, Some(5.0));
        assert!((txn.lbd_price.unwrap() - 9.5).abs() < EPS);

        // Later target changes leave the recorded snapshot alone
        let targets = db::assets::list_entry_targets(&f.conn, f.asset_id).unwrap();
        let mut changed = targets[0].clone();
        changed.percent = 8.0;
        db::assets::update_entry_target(&f.conn, &changed).unwrap();
        let stored = db::transactions::get_transaction(&f.conn, txn.id).unwrap();
        assert_eq!(stored.entry_target_percent, Some(5.0));
    }

    #[test]
    fn test_split_rescales_wallets_and_later_sell() {
        let mut f = setup();
        buy(&mut f, 1, 10.0, 1000.0);
        let w10 = wallet_for(&f, f.t10);

        let split = CreateTransactionRequest::split(f.asset_id, day(5), 2.0);
        create_transaction(&mut f.conn, &f.config, split).unwrap();

        let after = wallet_for(&f, f.t10);
        assert_eq!(after.id, w10.id);
        assert_eq!(after.shares, 100 * SHARES_SCALE);
        assert!((after.purchase_price() - 5.0).abs() < EPS);
        assert!((after.profit_target_price - 5.5).abs() < EPS);

        let sell = CreateTransactionRequest::sell(f.asset_id, day(6), after.id, 6.0, 40.0);
        let txn = create_transaction(&mut f.conn, &f.config, sell).unwrap().transaction;
        assert!((txn.cost_basis.unwrap() - 200.0).abs() < EPS);
        assert_eq!(wallet_for(&f, f.t10).shares, 60 * SHARES_SCALE);
    }

    #[test]
    fn test_buy_dated_before_split_goes_through_replay() {
        let mut f = setup();
        buy(&mut f, 1, 10.0, 1000.0);
        create_transaction(&mut f.conn, &f.config, CreateTransactionRequest::split(f.asset_id, day(5), 2.0)).unwrap();

        // Same pre-split price merges into the split-adjusted lot
        buy(&mut f, 3, 10.0, 200.0);
        let w10 = wallet_for(&f, f.t10);
        assert_eq!(w10.shares, 120 * SHARES_SCALE);
        assert!((w10.purchase_price() - 5.0).abs() < EPS);
        assert!(rebuild::verify_wallets(&f.conn, f.asset_id).unwrap().is_empty());
    }

    #[test]
    fn test_delete_split_restores_prices() {
        let mut f = setup();
        buy(&mut f, 1, 10.0, 1000.0);
        let split = create_transaction(&mut f.conn, &f.config, CreateTransactionRequest::split(f.asset_id, day(5), 2.0))
            .unwrap();
        delete_transaction(&mut f.conn, &f.config, split.transaction.id).unwrap();

        let w10 = wallet_for(&f, f.t10);
        assert_eq!(w10.shares, 50 * SHARES_SCALE);
        assert!((w10.purchase_price() - 10.0).abs() < EPS);
    }

    #[test]
    fn test_mixed_history_matches_replay() {
        let mut f = setup();
        buy(&mut f, 1, 10.0, 1000.0);
        buy(&mut f, 2, 8.0, 400.0);
        let cheap = db::wallets::list_wallets(&f.conn, f.asset_id)
            .unwrap()
            .into_iter()
            .find(|w| (w.purchase_price() - 8.0).abs() < EPS && w.profit_target_id == Some(f.t10))
            .unwrap();
        create_transaction(
            &mut f.conn,
            &f.config,
            CreateTransactionRequest::sell(f.asset_id, day(3), cheap.id, 9.0, 25.0),
        )
        .unwrap();
        create_transaction(&mut f.conn, &f.config, CreateTransactionRequest::dividend(f.asset_id, day(4), 12.5))
            .unwrap();
        let third = buy(&mut f, 4, 10.0, 300.0);
        update_transaction(
            &mut f.conn,
            &f.config,
            third.transaction.id,
            UpdateTransactionRequest {
                price: Some(9.0),
                ..Default::default()
            },
        )
        .unwrap();

        assert!(rebuild::verify_wallets(&f.conn, f.asset_id).unwrap().is_empty());
        for w in db::wallets::list_wallets(&f.conn, f.asset_id).unwrap() {
            assert!(w.shares > 0);
            assert!(w.is_consistent(), "wallet {} inconsistent", w.id);
        }
        // The 8.0 / +10% lot was sold in full
        assert!(db::wallets::get_wallet(&f.conn, cheap.id).is_err());
    }

    #[test]
    fn test_invalid_requests_rejected() {
        let mut f = setup();
        let zero_price = CreateTransactionRequest::buy(f.asset_id, day(1), 0.0, 100.0);
        assert!(create_transaction(&mut f.conn, &f.config, zero_price).unwrap_err().is_validation());

        let too_much = CreateTransactionRequest::buy(f.asset_id, day(1), 10.0, 100.0)
            .with_allocations(HashMap::from([(f.t10, 70.0), (f.t20, 40.0)]));
        assert!(create_transaction(&mut f.conn, &f.config, too_much).unwrap_err().is_validation());

        let mut no_wallet = CreateTransactionRequest::sell(f.asset_id, day(1), 1, 10.0, 1.0);
        no_wallet.wallet_id = None;
        assert!(create_transaction(&mut f.conn, &f.config, no_wallet).unwrap_err().is_validation());

        let negative = CreateTransactionRequest::dividend(f.asset_id, day(1), -1.0);
        assert!(create_transaction(&mut f.conn, &f.config, negative).unwrap_err().is_validation());

        let missing = CreateTransactionRequest::dividend(9999, day(1), 1.0);
        assert!(matches!(
            create_transaction(&mut f.conn, &f.config, missing).unwrap_err(),
            LedgerError::NotFound { .. }
        ));
        assert!(db::transactions::list_transactions(&f.conn, f.asset_id).unwrap().is_empty());
    }

    #[test]
    fn test_request_deserializes_from_camel_case() {
        let json = r#"{
            "assetId": 1, "txnType": "BUY", "date": "2024-03-01",
            "price": 10.0, "investment": 1000.0, "allocations": { "4": 60.0, "5": 40.0 }
        }"#;
        let req: CreateTransactionRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.txn_type, TransactionType::Buy);
        assert_eq!(req.allocations.unwrap().get(&4), Some(&60.0));
    }
}
