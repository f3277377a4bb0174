//! Report commands
//!
//! - Cash report: out-of-pocket, cash balance and what the yearly budget
//!   still allows
//! - Position summary: open exposure and P&L of one asset
//! - Signal scan: entry, dip and profit-target signals for every active asset

use crate::cash::{track_cash_until, IncomePolicy};
use crate::db;
use crate::error::Result;
use crate::performance::{summarize_position, PositionSummary};
use crate::quotes::PriceSnapshot;
use crate::signals::{compute_signals, AssetSignals, SignalInputs};
use chrono::NaiveDate;
use rusqlite::Connection;
use serde::Serialize;
use std::collections::HashMap;

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CashReport {
    pub asset_id: i64,
    /// Replay cut-off year; `None` covers the whole log
    pub year: Option<i32>,
    pub policy: IncomePolicy,
    pub out_of_pocket: f64,
    pub cash_balance: f64,
    /// Budget of `year`, when one is set
    pub max_oop: Option<f64>,
    pub available: Option<f64>,
}

// ============================================================================
// Commands
// ============================================================================

/// Cash position replayed through the end of `year` (the whole log when no
/// year is given), checked against that year's budget.
pub fn cash_report(
    conn: &Connection,
    asset_id: i64,
    year: Option<i32>,
    policy: IncomePolicy,
) -> Result<CashReport> {
    db::assets::get_asset(conn, asset_id)?;
    let transactions = db::transactions::list_transactions(conn, asset_id)?;
    let until = year.and_then(|y| NaiveDate::from_ymd_opt(y, 12, 31));
    let position = track_cash_until(&transactions, until, policy);

    let max_oop = match year {
        Some(y) => db::assets::get_yearly_budget(conn, asset_id, y)?.map(|b| b.max_oop),
        None => None,
    };

    Ok(CashReport {
        asset_id,
        year,
        policy,
        out_of_pocket: position.out_of_pocket,
        cash_balance: position.cash_balance,
        max_oop,
        available: max_oop.map(|m| position.available(m)),
    })
}

/// Position summary at `price`, falling back to the asset's test price.
pub fn position_summary(conn: &Connection, asset_id: i64, price: Option<f64>) -> Result<PositionSummary> {
    let asset = db::assets::get_asset(conn, asset_id)?;
    let wallets = db::wallets::list_wallets(conn, asset_id)?;
    let transactions = db::transactions::list_transactions(conn, asset_id)?;
    Ok(summarize_position(
        asset_id,
        &wallets,
        &transactions,
        price.or(asset.test_price),
    ))
}

/// Signals for every ACTIVE asset. Hidden and archived assets are skipped;
/// an asset without a snapshot still gets its target data.
pub fn scan_signals(
    conn: &Connection,
    snapshots: &HashMap<String, PriceSnapshot>,
    today: NaiveDate,
    dip_lookback_days: u32,
) -> Result<Vec<AssetSignals>> {
    let assets = db::assets::list_assets(conn, false)?;
    let mut signals = Vec::with_capacity(assets.len());

    for asset in &assets {
        let entry_targets = db::assets::list_entry_targets(conn, asset.id)?;
        let wallets = db::wallets::list_wallets(conn, asset.id)?;
        let last_buy = db::transactions::last_buy(conn, asset.id)?;
        let snapshot = snapshots.get(&asset.symbol);
        if snapshot.is_none() && asset.test_price.is_none() {
            log::debug!("No price snapshot for {}", asset.symbol);
        }

        signals.push(compute_signals(&SignalInputs {
            asset,
            entry_targets: &entry_targets,
            wallets: &wallets,
            last_buy: last_buy.as_ref(),
            snapshot,
            today,
            dip_lookback_days,
        }));
    }

    log::info!("Computed signals for {} active assets", signals.len());
    Ok(signals)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::assets::{add_entry_target, add_profit_target, create_asset, set_asset_status, CreateAssetRequest};
    use crate::commands::transactions::{create_transaction, CreateTransactionRequest};
    use crate::config::Config;
    use crate::db::open_in_memory;
    use crate::models::AssetStatus;
    use crate::quotes::DailyClose;

    const EPS: f64 = 1e-6;

    fn day(m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, m, d).unwrap()
    }

    fn new_asset(conn: &mut Connection, symbol: &str, test_price: Option<f64>) -> i64 {
        create_asset(
            conn,
            CreateAssetRequest {
                symbol: symbol.to_string(),
                name: symbol.to_string(),
                commission: None,
                test_price,
            },
        )
        .unwrap()
        .id
    }

    #[test]
    fn test_cash_report_against_budget() {
        let mut conn = open_in_memory().unwrap();
        let config = Config::default();
        let id = new_asset(&mut conn, "CASH", None);
        crate::commands::assets::set_yearly_budget(&mut conn, id, 2024, 1000.0).unwrap();

        create_transaction(&mut conn, &config, CreateTransactionRequest::buy(id, day(1, 10), 10.0, 800.0)).unwrap();
        let wallet = db::wallets::list_wallets(&conn, id).unwrap()[0].clone();
        create_transaction(&mut conn, &config, CreateTransactionRequest::sell(id, day(2, 10), wallet.id, 10.0, 30.0))
            .unwrap();
        create_transaction(&mut conn, &config, CreateTransactionRequest::buy(id, day(3, 10), 10.0, 400.0)).unwrap();

        let report = cash_report(&conn, id, Some(2024), IncomePolicy::CashOnly).unwrap();
        assert!((report.out_of_pocket - 900.0).abs() < EPS, "oop {}", report.out_of_pocket);
        assert!(report.cash_balance.abs() < EPS);
        assert_eq!(report.max_oop, Some(1000.0));
        assert!((report.available.unwrap() - 100.0).abs() < EPS);

        let earlier = cash_report(&conn, id, Some(2023), IncomePolicy::CashOnly).unwrap();
        assert_eq!(earlier.out_of_pocket, 0.0);
        assert!(earlier.available.is_none());
    }

    #[test]
    fn test_cash_report_income_policy() {
        let mut conn = open_in_memory().unwrap();
        let config = Config::default();
        let id = new_asset(&mut conn, "DIV", None);
        create_transaction(&mut conn, &config, CreateTransactionRequest::buy(id, day(1, 10), 10.0, 500.0)).unwrap();
        create_transaction(&mut conn, &config, CreateTransactionRequest::dividend(id, day(2, 1), 20.0)).unwrap();

        let cash_only = cash_report(&conn, id, None, IncomePolicy::CashOnly).unwrap();
        let offset = cash_report(&conn, id, None, IncomePolicy::OffsetOutOfPocket).unwrap();
        assert!((cash_only.out_of_pocket - 500.0).abs() < EPS);
        assert!((cash_only.cash_balance - 20.0).abs() < EPS);
        assert!((offset.out_of_pocket - 480.0).abs() < EPS);
        assert!(offset.cash_balance.abs() < EPS);
    }

    #[test]
    fn test_position_summary_uses_test_price() {
        let mut conn = open_in_memory().unwrap();
        let config = Config::default();
        let id = new_asset(&mut conn, "POS", Some(12.0));
        create_transaction(&mut conn, &config, CreateTransactionRequest::buy(id, day(1, 10), 10.0, 1000.0)).unwrap();

        let summary = position_summary(&conn, id, None).unwrap();
        assert!((summary.open_shares - 100.0).abs() < EPS);
        assert!((summary.unrealized_pnl.unwrap() - 200.0).abs() < EPS);

        let at_nine = position_summary(&conn, id, Some(9.0)).unwrap();
        assert!((at_nine.unrealized_pnl.unwrap() + 100.0).abs() < EPS);
    }

    #[test]
    fn test_scan_signals_skips_inactive_assets() {
        let mut conn = open_in_memory().unwrap();
        let config = Config::default();
        let active = new_asset(&mut conn, "LIVE", None);
        let archived = new_asset(&mut conn, "OLD", None);
        set_asset_status(&mut conn, archived, AssetStatus::Archived).unwrap();
        add_entry_target(&mut conn, active, 5.0, None).unwrap();
        add_profit_target(&mut conn, active, 10.0, None, None).unwrap();
        create_transaction(&mut conn, &config, CreateTransactionRequest::buy(active, day(6, 1), 10.0, 1000.0))
            .unwrap();

        let snapshot = PriceSnapshot {
            symbol: "LIVE".to_string(),
            current_price: Some(9.0),
            closes: (1..=20)
                .map(|d| DailyClose {
                    date: day(6, d),
                    close: 10.0,
                })
                .collect(),
        };
        let snapshots = HashMap::from([("LIVE".to_string(), snapshot)]);
        let signals = scan_signals(&conn, &snapshots, day(6, 21), 5).unwrap();

        assert_eq!(signals.len(), 1);
        let s = &signals[0];
        assert_eq!(s.symbol, "LIVE");
        assert!((s.entry_drop_percent.unwrap() - 10.0).abs() < EPS);
        assert!(s.entry_triggered);
        assert!(!s.dip_hidden);
        assert!((s.dip_percent.unwrap() + 10.0).abs() < EPS, "dip {:?}", s.dip_percent);
        assert!((s.lowest_profit_target_price.unwrap() - 11.0).abs() < EPS);
        assert!(!s.target_hit);
    }
}
