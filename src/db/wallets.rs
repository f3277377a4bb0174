//! Wallet rows: loading an asset's lot store and writing it back.

use crate::error::{LedgerError, Result};
use crate::wallets::{Wallet, WalletBook};
use rusqlite::{params, Connection, OptionalExtension, Row};

fn wallet_from_row(row: &Row) -> rusqlite::Result<Wallet> {
    Ok(Wallet {
        id: row.get(0)?,
        asset_id: row.get(1)?,
        price_key: row.get(2)?,
        profit_target_id: row.get(3)?,
        shares: row.get(4)?,
        investment: row.get(5)?,
        profit_target_price: row.get(6)?,
    })
}

pub fn list_wallets(conn: &Connection, asset_id: i64) -> Result<Vec<Wallet>> {
    let mut stmt = conn.prepare(
        "SELECT id, asset_id, price_key, profit_target_id, shares, investment, profit_target_price
         FROM wallet WHERE asset_id = ?1 ORDER BY price_key, profit_target_id",
    )?;
    let wallets = stmt
        .query_map([asset_id], wallet_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(wallets)
}

pub fn get_wallet(conn: &Connection, id: i64) -> Result<Wallet> {
    conn.query_row(
        "SELECT id, asset_id, price_key, profit_target_id, shares, investment, profit_target_price
         FROM wallet WHERE id = ?1",
        [id],
        wallet_from_row,
    )
    .optional()?
    .ok_or_else(|| LedgerError::not_found("Wallet", id))
}

/// Wallet ids are global, so new ones continue after the highest id ever
/// recorded on a wallet, allocation or sell.
pub fn next_wallet_id(conn: &Connection) -> Result<i64> {
    let max: Option<i64> = conn.query_row(
        "SELECT MAX(id) FROM (
             SELECT MAX(id) AS id FROM wallet
             UNION ALL SELECT MAX(wallet_id) FROM txn_allocation
             UNION ALL SELECT MAX(wallet_id) FROM txn
         )",
        [],
        |row| row.get(0),
    )?;
    Ok(max.unwrap_or(0) + 1)
}

pub fn load_book(conn: &Connection, asset_id: i64) -> Result<WalletBook> {
    let wallets = list_wallets(conn, asset_id)?;
    Ok(WalletBook::from_wallets(wallets, next_wallet_id(conn)?))
}

/// Replace the stored wallets of `asset_id` with the book's.
pub fn save_book(conn: &Connection, asset_id: i64, book: &WalletBook) -> Result<()> {
    conn.execute("DELETE FROM wallet WHERE asset_id = ?1", [asset_id])?;
    let mut stmt = conn.prepare(
        "INSERT INTO wallet (id, asset_id, price_key, profit_target_id, shares, investment, profit_target_price)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
    )?;
    for w in book.for_asset(asset_id) {
        stmt.execute(params![
            w.id,
            w.asset_id,
            w.price_key,
            w.profit_target_id,
            w.shares,
            w.investment,
            w.profit_target_price
        ])?;
    }
    Ok(())
}
