//! Asset, target and budget records.

use crate::error::{LedgerError, Result};
use crate::models::{Asset, AssetStatus, EntryTarget, ProfitTarget, YearlyBudget};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};

const ASSET_COLUMNS: &str = "id, symbol, name, commission, test_price, status";

fn asset_from_row(row: &Row) -> rusqlite::Result<Asset> {
    let status: String = row.get(5)?;
    let status = AssetStatus::from_str(&status).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            5,
            Type::Text,
            format!("unknown asset status '{}'", status).into(),
        )
    })?;
    Ok(Asset {
        id: row.get(0)?,
        symbol: row.get(1)?,
        name: row.get(2)?,
        commission: row.get(3)?,
        test_price: row.get(4)?,
        status,
    })
}

pub fn get_asset(conn: &Connection, id: i64) -> Result<Asset> {
    conn.query_row(
        &format!("SELECT {} FROM asset WHERE id = ?1", ASSET_COLUMNS),
        [id],
        asset_from_row,
    )
    .optional()?
    .ok_or_else(|| LedgerError::not_found("Asset", id))
}

pub fn find_asset_by_symbol(conn: &Connection, symbol: &str) -> Result<Option<Asset>> {
    Ok(conn
        .query_row(
            &format!("SELECT {} FROM asset WHERE symbol = ?1", ASSET_COLUMNS),
            [symbol],
            asset_from_row,
        )
        .optional()?)
}

pub fn list_assets(conn: &Connection, include_inactive: bool) -> Result<Vec<Asset>> {
    let sql = if include_inactive {
        format!("SELECT {} FROM asset ORDER BY symbol", ASSET_COLUMNS)
    } else {
        format!(
            "SELECT {} FROM asset WHERE status = 'ACTIVE' ORDER BY symbol",
            ASSET_COLUMNS
        )
    };
    let mut stmt = conn.prepare(&sql)?;
    let assets = stmt
        .query_map([], asset_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(assets)
}

pub fn insert_asset(
    conn: &Connection,
    symbol: &str,
    name: &str,
    commission: Option<f64>,
    test_price: Option<f64>,
) -> Result<i64> {
    conn.execute(
        "INSERT INTO asset (symbol, name, commission, test_price, status) VALUES (?1, ?2, ?3, ?4, 'ACTIVE')",
        params![symbol, name, commission, test_price],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn update_asset(conn: &Connection, asset: &Asset) -> Result<()> {
    let changed = conn.execute(
        "UPDATE asset SET symbol = ?1, name = ?2, commission = ?3, test_price = ?4, status = ?5 WHERE id = ?6",
        params![
            asset.symbol,
            asset.name,
            asset.commission,
            asset.test_price,
            asset.status.as_str(),
            asset.id
        ],
    )?;
    if changed == 0 {
        return Err(LedgerError::not_found("Asset", asset.id));
    }
    Ok(())
}

pub fn delete_asset(conn: &Connection, id: i64) -> Result<()> {
    if conn.execute("DELETE FROM asset WHERE id = ?1", [id])? == 0 {
        return Err(LedgerError::not_found("Asset", id));
    }
    Ok(())
}

// Entry targets

fn entry_target_from_row(row: &Row) -> rusqlite::Result<EntryTarget> {
    Ok(EntryTarget {
        id: row.get(0)?,
        asset_id: row.get(1)?,
        percent: row.get(2)?,
        sort_order: row.get(3)?,
    })
}

pub fn list_entry_targets(conn: &Connection, asset_id: i64) -> Result<Vec<EntryTarget>> {
    let mut stmt = conn.prepare(
        "SELECT id, asset_id, percent, sort_order FROM entry_target
         WHERE asset_id = ?1 ORDER BY sort_order, id",
    )?;
    let targets = stmt
        .query_map([asset_id], entry_target_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(targets)
}

pub fn get_entry_target(conn: &Connection, id: i64) -> Result<EntryTarget> {
    conn.query_row(
        "SELECT id, asset_id, percent, sort_order FROM entry_target WHERE id = ?1",
        [id],
        entry_target_from_row,
    )
    .optional()?
    .ok_or_else(|| LedgerError::not_found("EntryTarget", id))
}

pub fn insert_entry_target(conn: &Connection, asset_id: i64, percent: f64, sort_order: i64) -> Result<i64> {
    conn.execute(
        "INSERT INTO entry_target (asset_id, percent, sort_order) VALUES (?1, ?2, ?3)",
        params![asset_id, percent, sort_order],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn update_entry_target(conn: &Connection, target: &EntryTarget) -> Result<()> {
    let changed = conn.execute(
        "UPDATE entry_target SET percent = ?1, sort_order = ?2 WHERE id = ?3",
        params![target.percent, target.sort_order, target.id],
    )?;
    if changed == 0 {
        return Err(LedgerError::not_found("EntryTarget", target.id));
    }
    Ok(())
}

pub fn delete_entry_target(conn: &Connection, id: i64) -> Result<()> {
    if conn.execute("DELETE FROM entry_target WHERE id = ?1", [id])? == 0 {
        return Err(LedgerError::not_found("EntryTarget", id));
    }
    Ok(())
}

// Profit targets

fn profit_target_from_row(row: &Row) -> rusqlite::Result<ProfitTarget> {
    Ok(ProfitTarget {
        id: row.get(0)?,
        asset_id: row.get(1)?,
        percent: row.get(2)?,
        default_allocation: row.get(3)?,
        sort_order: row.get(4)?,
    })
}

pub fn list_profit_targets(conn: &Connection, asset_id: i64) -> Result<Vec<ProfitTarget>> {
    let mut stmt = conn.prepare(
        "SELECT id, asset_id, percent, default_allocation, sort_order FROM profit_target
         WHERE asset_id = ?1 ORDER BY sort_order, id",
    )?;
    let targets = stmt
        .query_map([asset_id], profit_target_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(targets)
}

pub fn get_profit_target(conn: &Connection, id: i64) -> Result<ProfitTarget> {
    conn.query_row(
        "SELECT id, asset_id, percent, default_allocation, sort_order FROM profit_target WHERE id = ?1",
        [id],
        profit_target_from_row,
    )
    .optional()?
    .ok_or_else(|| LedgerError::not_found("ProfitTarget", id))
}

pub fn insert_profit_target(
    conn: &Connection,
    asset_id: i64,
    percent: f64,
    default_allocation: Option<f64>,
    sort_order: i64,
) -> Result<i64> {
    conn.execute(
        "INSERT INTO profit_target (asset_id, percent, default_allocation, sort_order) VALUES (?1, ?2, ?3, ?4)",
        params![asset_id, percent, default_allocation, sort_order],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn update_profit_target(conn: &Connection, target: &ProfitTarget) -> Result<()> {
    let changed = conn.execute(
        "UPDATE profit_target SET percent = ?1, default_allocation = ?2, sort_order = ?3 WHERE id = ?4",
        params![target.percent, target.default_allocation, target.sort_order, target.id],
    )?;
    if changed == 0 {
        return Err(LedgerError::not_found("ProfitTarget", target.id));
    }
    Ok(())
}

pub fn delete_profit_target(conn: &Connection, id: i64) -> Result<()> {
    if conn.execute("DELETE FROM profit_target WHERE id = ?1", [id])? == 0 {
        return Err(LedgerError::not_found("ProfitTarget", id));
    }
    Ok(())
}

// Yearly budgets

pub fn upsert_yearly_budget(conn: &Connection, asset_id: i64, year: i32, max_oop: f64) -> Result<i64> {
    conn.execute(
        "INSERT INTO yearly_budget (asset_id, year, max_oop) VALUES (?1, ?2, ?3)
         ON CONFLICT(asset_id, year) DO UPDATE SET max_oop = excluded.max_oop",
        params![asset_id, year, max_oop],
    )?;
    let id = conn.query_row(
        "SELECT id FROM yearly_budget WHERE asset_id = ?1 AND year = ?2",
        params![asset_id, year],
        |row| row.get(0),
    )?;
    Ok(id)
}

pub fn get_yearly_budget(conn: &Connection, asset_id: i64, year: i32) -> Result<Option<YearlyBudget>> {
    Ok(conn
        .query_row(
            "SELECT id, asset_id, year, max_oop FROM yearly_budget WHERE asset_id = ?1 AND year = ?2",
            params![asset_id, year],
            |row| {
                Ok(YearlyBudget {
                    id: row.get(0)?,
                    asset_id: row.get(1)?,
                    year: row.get(2)?,
                    max_oop: row.get(3)?,
                })
            },
        )
        .optional()?)
}
