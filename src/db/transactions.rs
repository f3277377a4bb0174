//! Transaction and allocation records.

use crate::error::{LedgerError, Result};
use crate::models::{Transaction, TransactionAllocation, TransactionType};
use chrono::NaiveDate;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::HashMap;

const TXN_COLUMNS: &str = "id, asset_id, txn_type, date, signal, price, quantity, investment, amount, \
     split_ratio, entry_target_percent, lbd_price, profit_target_id, wallet_id, \
     lot_price_key, lot_profit_target_id, cost_basis, realized_pnl";

fn txn_from_row(row: &Row) -> rusqlite::Result<Transaction> {
    let txn_type: String = row.get(2)?;
    let txn_type = TransactionType::from_str(&txn_type).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            2,
            Type::Text,
            format!("unknown transaction type '{}'", txn_type).into(),
        )
    })?;
    Ok(Transaction {
        id: row.get(0)?,
        asset_id: row.get(1)?,
        txn_type,
        date: row.get(3)?,
        signal: row.get(4)?,
        price: row.get(5)?,
        quantity: row.get(6)?,
        investment: row.get(7)?,
        amount: row.get(8)?,
        split_ratio: row.get(9)?,
        entry_target_percent: row.get(10)?,
        lbd_price: row.get(11)?,
        profit_target_id: row.get(12)?,
        wallet_id: row.get(13)?,
        lot_price_key: row.get(14)?,
        lot_profit_target_id: row.get(15)?,
        cost_basis: row.get(16)?,
        realized_pnl: row.get(17)?,
    })
}

pub fn get_transaction(conn: &Connection, id: i64) -> Result<Transaction> {
    conn.query_row(
        &format!("SELECT {} FROM txn WHERE id = ?1", TXN_COLUMNS),
        [id],
        txn_from_row,
    )
    .optional()?
    .ok_or_else(|| LedgerError::not_found("Transaction", id))
}

/// All transactions of an asset, oldest first (date, then entry order).
pub fn list_transactions(conn: &Connection, asset_id: i64) -> Result<Vec<Transaction>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM txn WHERE asset_id = ?1 ORDER BY date, id",
        TXN_COLUMNS
    ))?;
    let txns = stmt
        .query_map([asset_id], txn_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(txns)
}

pub fn last_buy(conn: &Connection, asset_id: i64) -> Result<Option<Transaction>> {
    Ok(conn
        .query_row(
            &format!(
                "SELECT {} FROM txn WHERE asset_id = ?1 AND txn_type = 'BUY' ORDER BY date DESC, id DESC LIMIT 1",
                TXN_COLUMNS
            ),
            [asset_id],
            txn_from_row,
        )
        .optional()?)
}

/// True if a SPLIT dated on or after `date` exists for the asset.
pub fn has_split_since(conn: &Connection, asset_id: i64, date: NaiveDate) -> Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM txn WHERE asset_id = ?1 AND txn_type = 'SPLIT' AND date >= ?2",
        params![asset_id, date],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

pub fn insert_transaction(conn: &Connection, txn: &Transaction) -> Result<i64> {
    conn.execute(
        "INSERT INTO txn (asset_id, txn_type, date, signal, price, quantity, investment, amount,
             split_ratio, entry_target_percent, lbd_price, profit_target_id, wallet_id,
             lot_price_key, lot_profit_target_id, cost_basis, realized_pnl)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
        params![
            txn.asset_id,
            txn.txn_type.as_str(),
            txn.date,
            txn.signal,
            txn.price,
            txn.quantity,
            txn.investment,
            txn.amount,
            txn.split_ratio,
            txn.entry_target_percent,
            txn.lbd_price,
            txn.profit_target_id,
            txn.wallet_id,
            txn.lot_price_key,
            txn.lot_profit_target_id,
            txn.cost_basis,
            txn.realized_pnl,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn update_transaction(conn: &Connection, txn: &Transaction) -> Result<()> {
    let changed = conn.execute(
        "UPDATE txn SET date = ?1, signal = ?2, price = ?3, quantity = ?4, investment = ?5, amount = ?6,
             split_ratio = ?7, entry_target_percent = ?8, lbd_price = ?9, profit_target_id = ?10,
             wallet_id = ?11, lot_price_key = ?12, lot_profit_target_id = ?13, cost_basis = ?14,
             realized_pnl = ?15
         WHERE id = ?16",
        params![
            txn.date,
            txn.signal,
            txn.price,
            txn.quantity,
            txn.investment,
            txn.amount,
            txn.split_ratio,
            txn.entry_target_percent,
            txn.lbd_price,
            txn.profit_target_id,
            txn.wallet_id,
            txn.lot_price_key,
            txn.lot_profit_target_id,
            txn.cost_basis,
            txn.realized_pnl,
            txn.id,
        ],
    )?;
    if changed == 0 {
        return Err(LedgerError::not_found("Transaction", txn.id));
    }
    Ok(())
}

pub fn delete_transaction(conn: &Connection, id: i64) -> Result<()> {
    if conn.execute("DELETE FROM txn WHERE id = ?1", [id])? == 0 {
        return Err(LedgerError::not_found("Transaction", id));
    }
    Ok(())
}

// Allocations

fn allocation_from_row(row: &Row) -> rusqlite::Result<TransactionAllocation> {
    Ok(TransactionAllocation {
        id: row.get(0)?,
        transaction_id: row.get(1)?,
        profit_target_id: row.get(2)?,
        wallet_id: row.get(3)?,
        percentage: row.get(4)?,
        shares: row.get(5)?,
    })
}

pub fn list_allocations(conn: &Connection, transaction_id: i64) -> Result<Vec<TransactionAllocation>> {
    let mut stmt = conn.prepare(
        "SELECT id, transaction_id, profit_target_id, wallet_id, percentage, shares
         FROM txn_allocation WHERE transaction_id = ?1 ORDER BY id",
    )?;
    let rows = stmt
        .query_map([transaction_id], allocation_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

/// Allocation rows of every BUY of an asset, grouped by transaction id.
pub fn allocations_by_transaction(
    conn: &Connection,
    asset_id: i64,
) -> Result<HashMap<i64, Vec<TransactionAllocation>>> {
    let mut stmt = conn.prepare(
        "SELECT a.id, a.transaction_id, a.profit_target_id, a.wallet_id, a.percentage, a.shares
         FROM txn_allocation a
         JOIN txn t ON t.id = a.transaction_id
         WHERE t.asset_id = ?1
         ORDER BY a.transaction_id, a.id",
    )?;
    let mut grouped: HashMap<i64, Vec<TransactionAllocation>> = HashMap::new();
    for row in stmt.query_map([asset_id], allocation_from_row)? {
        let row = row?;
        grouped.entry(row.transaction_id).or_default().push(row);
    }
    Ok(grouped)
}

pub fn insert_allocation(conn: &Connection, alloc: &TransactionAllocation) -> Result<i64> {
    conn.execute(
        "INSERT INTO txn_allocation (transaction_id, profit_target_id, wallet_id, percentage, shares)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            alloc.transaction_id,
            alloc.profit_target_id,
            alloc.wallet_id,
            alloc.percentage,
            alloc.shares
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn delete_allocations(conn: &Connection, transaction_id: i64) -> Result<usize> {
    Ok(conn.execute(
        "DELETE FROM txn_allocation WHERE transaction_id = ?1",
        [transaction_id],
    )?)
}

pub fn set_allocation_wallet(conn: &Connection, allocation_id: i64, wallet_id: i64) -> Result<()> {
    conn.execute(
        "UPDATE txn_allocation SET wallet_id = ?1 WHERE id = ?2",
        params![wallet_id, allocation_id],
    )?;
    Ok(())
}

/// Ids of BUYs that put shares into a profit target (single-target field or
/// allocation row).
pub fn buys_using_target(conn: &Connection, profit_target_id: i64) -> Result<Vec<i64>> {
    let mut stmt = conn.prepare(
        "SELECT id FROM txn WHERE txn_type = 'BUY' AND profit_target_id = ?1
         UNION
         SELECT transaction_id FROM txn_allocation WHERE profit_target_id = ?1
         ORDER BY 1",
    )?;
    let ids = stmt
        .query_map([profit_target_id], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<i64>>>()?;
    Ok(ids)
}

pub fn sells_using_target(conn: &Connection, profit_target_id: i64) -> Result<usize> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM txn WHERE txn_type = 'SELL' AND lot_profit_target_id = ?1",
        [profit_target_id],
        |row| row.get(0),
    )?;
    Ok(count as usize)
}
