//! Asset, entry/profit target and yearly budget commands.
//!
//! Anything that changes how a profit target price is derived (asset
//! commission, target percent) re-prices the asset's wallets in the same
//! SQLite transaction.

use crate::allocation::{plan_allocations, PlannedAllocation};
use crate::commands::transactions::{shape_buy, write_allocations};
use crate::commands::{require_non_negative, require_positive, verify_after_mutation};
use crate::config::Config;
use crate::db;
use crate::error::{LedgerError, Result};
use crate::models::{Asset, AssetStatus, EntryTarget, ProfitTarget, YearlyBudget};
use crate::rebuild;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// What happens to history when a profit target that is in use is deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TargetDeletePolicy {
    /// Refuse while any wallet, BUY or SELL references the target
    #[default]
    Block,
    /// Move the target's share of each BUY onto the asset's other targets
    Redistribute,
}

impl TargetDeletePolicy {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "block" => Some(Self::Block),
            "redistribute" => Some(Self::Redistribute),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Block => "block",
            Self::Redistribute => "redistribute",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateAssetRequest {
    pub symbol: String,
    pub name: String,
    #[serde(default)]
    pub commission: Option<f64>,
    #[serde(default)]
    pub test_price: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UpdateAssetRequest {
    pub symbol: Option<String>,
    pub name: Option<String>,
    pub commission: Option<f64>,
    pub test_price: Option<f64>,
    /// Drop the manual test price and go back to fetched prices
    pub clear_test_price: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UpdateProfitTargetRequest {
    pub percent: Option<f64>,
    pub default_allocation: Option<f64>,
    pub sort_order: Option<i64>,
}

// Boundary checks

fn check_commission(commission: Option<f64>) -> Result<()> {
    match commission {
        Some(c) if !c.is_finite() || !(0.0..100.0).contains(&c) => Err(LedgerError::validation(format!(
            "commission must be in [0, 100), got {}",
            c
        ))),
        _ => Ok(()),
    }
}

fn check_symbol(conn: &Connection, symbol: &str, own_id: Option<i64>) -> Result<String> {
    let symbol = symbol.trim().to_uppercase();
    if symbol.is_empty() {
        return Err(LedgerError::validation("symbol must not be empty"));
    }
    if let Some(existing) = db::assets::find_asset_by_symbol(conn, &symbol)? {
        if Some(existing.id) != own_id {
            return Err(LedgerError::validation(format!(
                "symbol {} is already used by asset {}",
                symbol, existing.id
            )));
        }
    }
    Ok(symbol)
}

fn check_entry_percent(percent: f64) -> Result<()> {
    if !percent.is_finite() || percent <= 0.0 || percent >= 100.0 {
        return Err(LedgerError::validation(format!(
            "entry target percent must be in (0, 100), got {}",
            percent
        )));
    }
    Ok(())
}

fn check_default_allocation(value: Option<f64>) -> Result<()> {
    match value {
        Some(v) if !v.is_finite() || !(0.0..=100.0).contains(&v) => Err(LedgerError::validation(format!(
            "default allocation must be in [0, 100], got {}",
            v
        ))),
        _ => Ok(()),
    }
}

/// Defaults feed the allocation engine directly, so together they may not
/// exceed 100%.
fn check_default_total(targets: &[ProfitTarget]) -> Result<()> {
    let total: f64 = targets.iter().filter_map(|t| t.default_allocation).sum();
    if total > 100.0 + 1e-9 {
        return Err(LedgerError::validation(format!(
            "default allocations would sum to {:.4}%",
            total
        )));
    }
    Ok(())
}

/// Re-derive every wallet's profit target price from current settings.
fn reprice_wallets(conn: &Connection, asset_id: i64) -> Result<usize> {
    let pricing = rebuild::load_pricing(conn, asset_id)?;
    let mut book = db::wallets::load_book(conn, asset_id)?;
    book.reprice(|key| pricing.price_for(key));
    db::wallets::save_book(conn, asset_id, &book)?;
    Ok(book.len())
}

// Assets

pub fn create_asset(conn: &mut Connection, data: CreateAssetRequest) -> Result<Asset> {
    let tx = conn.transaction()?;
    let symbol = check_symbol(&tx, &data.symbol, None)?;
    check_commission(data.commission)?;
    if data.test_price.is_some() {
        require_positive("testPrice", data.test_price)?;
    }
    let name = if data.name.trim().is_empty() {
        symbol.clone()
    } else {
        data.name.trim().to_string()
    };

    let id = db::assets::insert_asset(&tx, &symbol, &name, data.commission, data.test_price)?;
    let asset = db::assets::get_asset(&tx, id)?;
    tx.commit()?;
    log::info!("Created asset {} ({})", asset.symbol, asset.id);
    Ok(asset)
}

pub fn update_asset(conn: &mut Connection, config: &Config, id: i64, data: UpdateAssetRequest) -> Result<Asset> {
    let tx = conn.transaction()?;
    let mut asset = db::assets::get_asset(&tx, id)?;
    let old_commission = asset.commission_rate();

    if let Some(symbol) = &data.symbol {
        asset.symbol = check_symbol(&tx, symbol, Some(id))?;
    }
    if let Some(name) = &data.name {
        asset.name = name.trim().to_string();
    }
    if data.commission.is_some() {
        check_commission(data.commission)?;
        asset.commission = data.commission;
    }
    if data.clear_test_price {
        asset.test_price = None;
    } else if data.test_price.is_some() {
        asset.test_price = Some(require_positive("testPrice", data.test_price)?);
    }
    db::assets::update_asset(&tx, &asset)?;

    if (asset.commission_rate() - old_commission).abs() > f64::EPSILON {
        let count = reprice_wallets(&tx, id)?;
        log::info!(
            "Commission of {} changed {}% -> {}%, repriced {} wallets",
            asset.symbol,
            old_commission,
            asset.commission_rate(),
            count
        );
    }
    verify_after_mutation(&tx, config, id)?;
    tx.commit()?;
    log::info!("Updated asset {} ({})", asset.symbol, id);
    Ok(asset)
}

pub fn set_asset_status(conn: &mut Connection, id: i64, status: AssetStatus) -> Result<Asset> {
    let tx = conn.transaction()?;
    let mut asset = db::assets::get_asset(&tx, id)?;
    asset.status = status;
    db::assets::update_asset(&tx, &asset)?;
    tx.commit()?;
    log::info!("Asset {} ({}) is now {}", asset.symbol, id, status.as_str());
    Ok(asset)
}

pub fn get_asset(conn: &Connection, id: i64) -> Result<Asset> {
    db::assets::get_asset(conn, id)
}

pub fn list_assets(conn: &Connection, include_inactive: bool) -> Result<Vec<Asset>> {
    db::assets::list_assets(conn, include_inactive)
}

/// Removes the asset with its targets, transactions, wallets and budgets.
pub fn delete_asset(conn: &mut Connection, id: i64) -> Result<()> {
    let tx = conn.transaction()?;
    let asset = db::assets::get_asset(&tx, id)?;
    db::assets::delete_asset(&tx, id)?;
    tx.commit()?;
    log::info!("Deleted asset {} ({})", asset.symbol, id);
    Ok(())
}

// Entry targets

pub fn add_entry_target(
    conn: &mut Connection,
    asset_id: i64,
    percent: f64,
    sort_order: Option<i64>,
) -> Result<EntryTarget> {
    let tx = conn.transaction()?;
    db::assets::get_asset(&tx, asset_id)?;
    check_entry_percent(percent)?;
    let existing = db::assets::list_entry_targets(&tx, asset_id)?;
    let sort_order = sort_order.unwrap_or_else(|| existing.iter().map(|t| t.sort_order + 1).max().unwrap_or(0));
    let id = db::assets::insert_entry_target(&tx, asset_id, percent, sort_order)?;
    let target = db::assets::get_entry_target(&tx, id)?;
    tx.commit()?;
    log::info!("Added entry target {} ({}%) to asset {}", id, percent, asset_id);
    Ok(target)
}

pub fn update_entry_target(
    conn: &mut Connection,
    id: i64,
    percent: Option<f64>,
    sort_order: Option<i64>,
) -> Result<EntryTarget> {
    let tx = conn.transaction()?;
    let mut target = db::assets::get_entry_target(&tx, id)?;
    if let Some(p) = percent {
        check_entry_percent(p)?;
        target.percent = p;
    }
    if let Some(order) = sort_order {
        target.sort_order = order;
    }
    db::assets::update_entry_target(&tx, &target)?;
    tx.commit()?;
    log::info!("Updated entry target {} of asset {}", id, target.asset_id);
    Ok(target)
}

/// Recorded BUYs keep their entry snapshot, so nothing else changes.
pub fn delete_entry_target(conn: &mut Connection, id: i64) -> Result<()> {
    let tx = conn.transaction()?;
    let target = db::assets::get_entry_target(&tx, id)?;
    db::assets::delete_entry_target(&tx, id)?;
    tx.commit()?;
    log::info!("Deleted entry target {} of asset {}", id, target.asset_id);
    Ok(())
}

pub fn list_entry_targets(conn: &Connection, asset_id: i64) -> Result<Vec<EntryTarget>> {
    db::assets::get_asset(conn, asset_id)?;
    db::assets::list_entry_targets(conn, asset_id)
}

// Profit targets

pub fn add_profit_target(
    conn: &mut Connection,
    asset_id: i64,
    percent: f64,
    default_allocation: Option<f64>,
    sort_order: Option<i64>,
) -> Result<ProfitTarget> {
    let tx = conn.transaction()?;
    db::assets::get_asset(&tx, asset_id)?;
    require_positive("profit target percent", Some(percent))?;
    check_default_allocation(default_allocation)?;

    let mut targets = db::assets::list_profit_targets(&tx, asset_id)?;
    let sort_order = sort_order.unwrap_or_else(|| targets.iter().map(|t| t.sort_order + 1).max().unwrap_or(0));
    targets.push(ProfitTarget {
        id: 0,
        asset_id,
        percent,
        default_allocation,
        sort_order,
    });
    check_default_total(&targets)?;

    let id = db::assets::insert_profit_target(&tx, asset_id, percent, default_allocation, sort_order)?;
    let target = db::assets::get_profit_target(&tx, id)?;
    tx.commit()?;
    log::info!("Added profit target {} (+{}%) to asset {}", id, percent, asset_id);
    Ok(target)
}

pub fn update_profit_target(
    conn: &mut Connection,
    config: &Config,
    id: i64,
    data: UpdateProfitTargetRequest,
) -> Result<ProfitTarget> {
    let tx = conn.transaction()?;
    let mut target = db::assets::get_profit_target(&tx, id)?;
    let old_percent = target.percent;

    if let Some(p) = data.percent {
        target.percent = require_positive("profit target percent", Some(p))?;
    }
    if data.default_allocation.is_some() {
        check_default_allocation(data.default_allocation)?;
        target.default_allocation = data.default_allocation;
    }
    if let Some(order) = data.sort_order {
        target.sort_order = order;
    }
    let mut all = db::assets::list_profit_targets(&tx, target.asset_id)?;
    for t in all.iter_mut().filter(|t| t.id == id) {
        *t = target.clone();
    }
    check_default_total(&all)?;
    db::assets::update_profit_target(&tx, &target)?;

    if (target.percent - old_percent).abs() > f64::EPSILON {
        let count = reprice_wallets(&tx, target.asset_id)?;
        log::info!(
            "Profit target {} changed +{}% -> +{}%, repriced {} wallets",
            id,
            old_percent,
            target.percent,
            count
        );
    }
    verify_after_mutation(&tx, config, target.asset_id)?;
    tx.commit()?;
    log::info!("Updated profit target {} of asset {}", id, target.asset_id);
    Ok(target)
}

/// Delete a profit target according to `config.target_delete_policy`.
pub fn delete_profit_target(conn: &mut Connection, config: &Config, id: i64) -> Result<()> {
    let tx = conn.transaction()?;
    let target = db::assets::get_profit_target(&tx, id)?;
    let asset_id = target.asset_id;
    let buys = db::transactions::buys_using_target(&tx, id)?;
    let sells = db::transactions::sells_using_target(&tx, id)?;

    match config.target_delete_policy {
        TargetDeletePolicy::Block => {
            let open_wallets = db::exists(
                &tx,
                "SELECT COUNT(*) FROM wallet WHERE profit_target_id = ?1",
                id,
            )?;
            if open_wallets || !buys.is_empty() || sells > 0 {
                return Err(LedgerError::validation(format!(
                    "profit target {} is used by {} BUYs and {} SELLs; delete those first or use the redistribute policy",
                    id,
                    buys.len(),
                    sells
                )));
            }
            db::assets::delete_profit_target(&tx, id)?;
        }
        TargetDeletePolicy::Redistribute => {
            if sells > 0 {
                return Err(LedgerError::validation(format!(
                    "profit target {} has {} SELLs against its lots and cannot be redistributed",
                    id, sells
                )));
            }
            db::assets::delete_profit_target(&tx, id)?;
            let remaining = db::assets::list_profit_targets(&tx, asset_id)?;
            for buy_id in &buys {
                reallocate_buy(&tx, *buy_id, id, &remaining)?;
            }
            rebuild::apply_replay(&tx, asset_id)?;
            log::info!(
                "Redistributed {} BUYs off profit target {} of asset {}",
                buys.len(),
                id,
                asset_id
            );
        }
    }

    verify_after_mutation(&tx, config, asset_id)?;
    tx.commit()?;
    log::info!("Deleted profit target {} of asset {}", id, asset_id);
    Ok(())
}

/// New percentages for a BUY once `removed` is gone: its share goes to the
/// other targets of the BUY in proportion to what they already had. A BUY
/// that only used `removed` leaves the map empty, which the allocation
/// engine spreads equally.
fn redistributed_percentages(current: &HashMap<i64, f64>, removed: i64) -> HashMap<i64, f64> {
    let freed = current.get(&removed).copied().unwrap_or(0.0);
    let others: HashMap<i64, f64> = current
        .iter()
        .filter(|(id, pct)| **id != removed && **pct > 0.0)
        .map(|(id, pct)| (*id, *pct))
        .collect();
    let kept: f64 = others.values().sum();
    if kept <= 0.0 {
        return HashMap::new();
    }
    others
        .into_iter()
        .map(|(id, pct)| (id, pct + freed * pct / kept))
        .collect()
}

fn reallocate_buy(conn: &Connection, buy_id: i64, removed: i64, remaining: &[ProfitTarget]) -> Result<()> {
    let mut txn = db::transactions::get_transaction(conn, buy_id)?;
    let rows = db::transactions::list_allocations(conn, buy_id)?;
    let current: HashMap<i64, f64> = if rows.is_empty() {
        txn.profit_target_id.map(|t| (t, 100.0)).into_iter().collect()
    } else {
        rows.iter().map(|r| (r.profit_target_id, r.percentage)).collect()
    };
    let requested = redistributed_percentages(&current, removed);

    let price = require_positive("price", txn.price)?;
    let investment = require_positive("investment", txn.investment)?;
    let plans: Vec<PlannedAllocation> = plan_allocations(price, investment, remaining, &requested)?;
    let single = shape_buy(&mut txn, &plans);
    txn.wallet_id = None;

    db::transactions::delete_allocations(conn, buy_id)?;
    db::transactions::update_transaction(conn, &txn)?;
    if !single {
        write_allocations(conn, buy_id, &plans, &[])?;
    }
    log::debug!("BUY {} reallocated to {:?}", buy_id, plans);
    Ok(())
}

pub fn list_profit_targets(conn: &Connection, asset_id: i64) -> Result<Vec<ProfitTarget>> {
    db::assets::get_asset(conn, asset_id)?;
    db::assets::list_profit_targets(conn, asset_id)
}

// Budgets

fn check_year(year: i32) -> Result<()> {
    if !(1900..=9999).contains(&year) {
        return Err(LedgerError::validation(format!(
            "year must be between 1900 and 9999, got {}",
            year
        )));
    }
    Ok(())
}

pub fn set_yearly_budget(conn: &mut Connection, asset_id: i64, year: i32, max_oop: f64) -> Result<YearlyBudget> {
    check_year(year)?;
    let max_oop = require_non_negative("maxOop", Some(max_oop))?;
    let tx = conn.transaction()?;
    db::assets::get_asset(&tx, asset_id)?;
    db::assets::upsert_yearly_budget(&tx, asset_id, year, max_oop)?;
    let budget = db::assets::get_yearly_budget(&tx, asset_id, year)?
        .ok_or_else(|| LedgerError::not_found("YearlyBudget", asset_id))?;
    tx.commit()?;
    log::info!("Budget for asset {} in {} set to {}", asset_id, year, max_oop);
    Ok(budget)
}

pub fn get_yearly_budget(conn: &Connection, asset_id: i64, year: i32) -> Result<Option<YearlyBudget>> {
    check_year(year)?;
    db::assets::get_asset(conn, asset_id)?;
    db::assets::get_yearly_budget(conn, asset_id, year)
}
