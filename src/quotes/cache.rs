//! TTL cache for price snapshots.
//!
//! Passed explicitly to whoever needs prices. Entries expire after the TTL;
//! `refresh` only goes to the source for symbols that are missing or stale.

use super::{refresh_prices, DailyClose, PriceSnapshot, PriceSource, RefreshOptions, RefreshProgress, RefreshReport};
use crate::error::Result;
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection};
use std::collections::HashMap;
use std::sync::RwLock;

#[derive(Debug, Clone)]
struct CacheEntry {
    snapshot: PriceSnapshot,
    fetched_at: DateTime<Utc>,
}

pub struct PriceCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
    ttl: Duration,
}

impl PriceCache {
    pub fn new(ttl_secs: i64) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl: Duration::seconds(ttl_secs),
        }
    }

    fn is_fresh(&self, entry: &CacheEntry, now: DateTime<Utc>) -> bool {
        now - entry.fetched_at < self.ttl
    }

    /// Cached snapshot if present and not expired.
    pub fn get(&self, symbol: &str) -> Option<PriceSnapshot> {
        let entries = self.entries.read().ok()?;
        let now = Utc::now();
        entries
            .get(symbol)
            .filter(|e| self.is_fresh(e, now))
            .map(|e| e.snapshot.clone())
    }

    /// Fresh snapshots for the given symbols (missing/stale ones left out).
    pub fn snapshots(&self, symbols: &[String]) -> HashMap<String, PriceSnapshot> {
        symbols
            .iter()
            .filter_map(|s| self.get(s).map(|snap| (s.clone(), snap)))
            .collect()
    }

    pub fn insert(&self, snapshot: PriceSnapshot) {
        self.insert_at(snapshot, Utc::now());
    }

    /// Unavailable snapshots are not cached so the next refresh retries them.
    pub fn insert_at(&self, snapshot: PriceSnapshot, fetched_at: DateTime<Utc>) {
        if !snapshot.is_available() {
            return;
        }
        if let Ok(mut entries) = self.entries.write() {
            entries.insert(
                snapshot.symbol.clone(),
                CacheEntry {
                    snapshot,
                    fetched_at,
                },
            );
        }
    }

    pub fn invalidate(&self, symbol: &str) {
        if let Ok(mut entries) = self.entries.write() {
            entries.remove(symbol);
        }
    }

    pub fn invalidate_all(&self) {
        if let Ok(mut entries) = self.entries.write() {
            entries.clear();
        }
    }

    /// Symbols that are missing or past the TTL.
    pub fn stale_symbols(&self, symbols: &[String]) -> Vec<String> {
        symbols
            .iter()
            .filter(|s| self.get(s).is_none())
            .cloned()
            .collect()
    }

    /// Fetch the stale symbols through `source` and cache what came back.
    pub async fn refresh<F>(
        &self,
        source: &dyn PriceSource,
        symbols: &[String],
        options: &RefreshOptions,
        on_progress: F,
    ) -> RefreshReport
    where
        F: FnMut(RefreshProgress),
    {
        let stale = self.stale_symbols(symbols);
        log::debug!(
            "Price cache: {} of {} symbols need a refresh",
            stale.len(),
            symbols.len()
        );
        let report = refresh_prices(source, &stale, options, on_progress).await;
        for snapshot in report.snapshots.values() {
            self.insert(snapshot.clone());
        }
        report
    }

    /// Write every cached entry to the `price_snapshot` table.
    pub fn persist(&self, conn: &Connection) -> Result<usize> {
        let entries: Vec<CacheEntry> = match self.entries.read() {
            Ok(entries) => entries.values().cloned().collect(),
            Err(_) => return Ok(0),
        };
        let mut stmt = conn.prepare(
            "INSERT OR REPLACE INTO price_snapshot (symbol, current_price, closes_json, fetched_at)
             VALUES (?1, ?2, ?3, ?4)",
        )?;
        for entry in &entries {
            let closes = serde_json::to_string(&entry.snapshot.closes).unwrap_or_else(|_| "[]".to_string());
            stmt.execute(params![
                entry.snapshot.symbol,
                entry.snapshot.current_price,
                closes,
                entry.fetched_at.to_rfc3339()
            ])?;
        }
        Ok(entries.len())
    }

    /// Load persisted snapshots that are still within the TTL.
    pub fn restore(&self, conn: &Connection) -> Result<usize> {
        let mut stmt =
            conn.prepare("SELECT symbol, current_price, closes_json, fetched_at FROM price_snapshot")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<f64>>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let now = Utc::now();
        let mut restored = 0;
        for (symbol, current_price, closes_json, fetched_at) in rows {
            let fetched_at = match DateTime::parse_from_rfc3339(&fetched_at) {
                Ok(ts) => ts.with_timezone(&Utc),
                Err(e) => {
                    log::warn!("Skipping cached price for {}: bad timestamp ({})", symbol, e);
                    continue;
                }
            };
            if now - fetched_at >= self.ttl {
                continue;
            }
            let closes: Vec<DailyClose> = match serde_json::from_str(&closes_json) {
                Ok(c) => c,
                Err(e) => {
                    log::warn!("Skipping cached price for {}: bad closes ({})", symbol, e);
                    continue;
                }
            };
            self.insert_at(
                PriceSnapshot {
                    symbol,
                    current_price,
                    closes,
                },
                fetched_at,
            );
            restored += 1;
        }
        Ok(restored)
    }
}
