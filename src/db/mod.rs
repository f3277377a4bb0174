//! SQLite persistence: schema and per-record row mapping.
//!
//! The connection is owned by the caller and passed down as `&Connection`
//! (reads) or `&mut Connection` (mutations, which open one SQLite
//! transaction each).

pub mod assets;
pub mod transactions;
pub mod wallets;

use crate::error::Result;
use rusqlite::Connection;
use std::path::Path;

/// Open (or create) the database file and bring the schema up to date.
pub fn init_database(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                log::warn!("Could not create database directory {:?}: {}", parent, e);
            }
        }
    }
    let conn = Connection::open(path)?;

    // WAL for readers alongside the single writer
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
    create_schema(&conn)?;
    log::info!("Database ready at {:?}", path);
    Ok(conn)
}

/// Fresh in-memory database with the full schema (tests, dry runs).
pub fn open_in_memory() -> Result<Connection> {
    let conn = Connection::open_in_memory()?;
    create_schema(&conn)?;
    Ok(conn)
}

pub fn create_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS asset (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            symbol TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL,
            commission REAL,
            test_price REAL,
            status TEXT NOT NULL DEFAULT 'ACTIVE',
            created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        );

        CREATE TABLE IF NOT EXISTS entry_target (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            asset_id INTEGER NOT NULL,
            percent REAL NOT NULL,
            sort_order INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY (asset_id) REFERENCES asset(id) ON DELETE CASCADE
        );
        CREATE INDEX IF NOT EXISTS idx_entry_target_asset ON entry_target(asset_id);

        CREATE TABLE IF NOT EXISTS profit_target (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            asset_id INTEGER NOT NULL,
            percent REAL NOT NULL,
            default_allocation REAL,
            sort_order INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY (asset_id) REFERENCES asset(id) ON DELETE CASCADE
        );
        CREATE INDEX IF NOT EXISTS idx_profit_target_asset ON profit_target(asset_id);

        -- Shares/quantities are INTEGER scaled by 10^8
        CREATE TABLE IF NOT EXISTS txn (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            asset_id INTEGER NOT NULL,
            txn_type TEXT NOT NULL,
            date TEXT NOT NULL,
            signal TEXT,
            price REAL,
            quantity INTEGER,
            investment REAL,
            amount REAL,
            split_ratio REAL,
            entry_target_percent REAL,
            lbd_price REAL,
            profit_target_id INTEGER,
            wallet_id INTEGER,
            lot_price_key INTEGER,
            lot_profit_target_id INTEGER,
            cost_basis REAL,
            realized_pnl REAL,
            FOREIGN KEY (asset_id) REFERENCES asset(id) ON DELETE CASCADE
        );
        CREATE INDEX IF NOT EXISTS idx_txn_asset_date ON txn(asset_id, date);

        CREATE TABLE IF NOT EXISTS txn_allocation (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            transaction_id INTEGER NOT NULL,
            profit_target_id INTEGER NOT NULL,
            wallet_id INTEGER NOT NULL,
            percentage REAL NOT NULL,
            shares INTEGER NOT NULL,
            FOREIGN KEY (transaction_id) REFERENCES txn(id) ON DELETE CASCADE
        );
        CREATE INDEX IF NOT EXISTS idx_txn_allocation_txn ON txn_allocation(transaction_id);
        CREATE INDEX IF NOT EXISTS idx_txn_allocation_target ON txn_allocation(profit_target_id);

        -- Materialized lots; ids are assigned by the lot store, not SQLite
        CREATE TABLE IF NOT EXISTS wallet (
            id INTEGER PRIMARY KEY,
            asset_id INTEGER NOT NULL,
            price_key INTEGER NOT NULL,
            profit_target_id INTEGER,
            shares INTEGER NOT NULL,
            investment REAL NOT NULL,
            profit_target_price REAL NOT NULL,
            FOREIGN KEY (asset_id) REFERENCES asset(id) ON DELETE CASCADE
        );
        CREATE UNIQUE INDEX IF NOT EXISTS idx_wallet_key
            ON wallet(asset_id, price_key, IFNULL(profit_target_id, -1));

        CREATE TABLE IF NOT EXISTS yearly_budget (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            asset_id INTEGER NOT NULL,
            year INTEGER NOT NULL,
            max_oop REAL NOT NULL,
            FOREIGN KEY (asset_id) REFERENCES asset(id) ON DELETE CASCADE,
            UNIQUE(asset_id, year)
        );

        CREATE TABLE IF NOT EXISTS price_snapshot (
            symbol TEXT PRIMARY KEY,
            current_price REAL,
            closes_json TEXT NOT NULL DEFAULT '[]',
            fetched_at TEXT NOT NULL
        );
        "#,
    )?;
    Ok(())
}

/// True if any row matches `sql` with a single id parameter.
pub(crate) fn exists(conn: &Connection, sql: &str, id: i64) -> Result<bool> {
    let count: i64 = conn.query_row(sql, [id], |row| row.get(0))?;
    Ok(count > 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_is_idempotent() {
        let conn = open_in_memory().unwrap();
        create_schema(&conn).unwrap();
        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name IN
                 ('asset','entry_target','profit_target','txn','txn_allocation','wallet','yearly_budget','price_snapshot')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 8);

        // Columns read by the row mappers come straight from the schema
        conn.execute("UPDATE asset SET test_price = NULL", []).unwrap();
        conn.execute("UPDATE txn SET lot_profit_target_id = NULL", []).unwrap();
    }

    #[test]
    fn test_wallet_key_is_unique() {
        let conn = open_in_memory().unwrap();
        conn.execute("INSERT INTO asset (symbol, name) VALUES ('ABC', 'Abc Corp')", [])
            .unwrap();
        let insert = "INSERT INTO wallet (id, asset_id, price_key, profit_target_id, shares, investment, profit_target_price)
                      VALUES (?1, 1, 1000000000, NULL, 1, 1.0, 10.0)";
        conn.execute(insert, [1]).unwrap();
        assert!(conn.execute(insert, [2]).is_err());
    }

    #[test]
    fn test_init_database_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("ledger.db");
        let conn = init_database(&path).unwrap();
        drop(conn);
        assert!(path.exists());
    }
}
