//! Quote commands: refresh price snapshots for the active assets.
//!
//! Symbols are read before the fetch; the cache is written back to the
//! `price_snapshot` table afterwards.

use crate::config::Config;
use crate::db;
use crate::error::Result;
use crate::quotes::cache::PriceCache;
use crate::quotes::{PriceSnapshot, PriceSource, RefreshOptions, RefreshReport};
use rusqlite::Connection;
use std::collections::HashMap;

/// Symbols of ACTIVE assets that have no manual test price.
pub fn active_symbols(conn: &Connection) -> Result<Vec<String>> {
    Ok(db::assets::list_assets(conn, false)?
        .into_iter()
        .filter(|a| a.test_price.is_none())
        .map(|a| a.symbol)
        .collect())
}

/// Bring the cache up to date for `symbols` and persist what it holds.
pub async fn refresh_symbols(
    conn: &Connection,
    config: &Config,
    cache: &PriceCache,
    source: &dyn PriceSource,
    symbols: &[String],
) -> Result<RefreshReport> {
    let options = RefreshOptions::from(config);
    log::debug!(
        "Refreshing {} symbols from {} (batch {}, concurrency {})",
        symbols.len(),
        source.name(),
        options.batch_size,
        options.concurrency
    );

    let report = cache
        .refresh(source, symbols, &options, |p| {
            log::info!(
                "Price batch {}/{} done ({} available, {} unavailable)",
                p.completed_batches,
                p.total_batches,
                p.available,
                p.unavailable
            );
        })
        .await;

    let stored = cache.persist(conn)?;
    log::debug!("Persisted {} cached snapshots", stored);
    Ok(report)
}

/// Refresh every active asset and return the snapshots usable for signals.
pub async fn refresh_active_prices(
    conn: &Connection,
    config: &Config,
    cache: &PriceCache,
    source: &dyn PriceSource,
) -> Result<HashMap<String, PriceSnapshot>> {
    let restored = cache.restore(conn)?;
    if restored > 0 {
        log::debug!("Restored {} snapshots from the database", restored);
    }
    let symbols = active_symbols(conn)?;
    refresh_symbols(conn, config, cache, source, &symbols).await?;
    Ok(cache.snapshots(&symbols))
}
