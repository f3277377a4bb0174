//! User-facing operations.
//!
//! Every mutation takes `&mut Connection`, runs inside one SQLite
//! transaction and commits only when the whole reversal/allocation/sell
//! sequence (and the optional replay check) succeeded.

pub mod assets;
pub mod quotes;
pub mod reports;
pub mod transactions;

use crate::config::Config;
use crate::error::{LedgerError, Result};
use crate::rebuild;
use rusqlite::Connection;

/// Replay the asset's log after a mutation.
///
/// A log that no longer replays (e.g. a SELL now dated before its BUY) is a
/// rejection of the mutation whatever the configuration says. With
/// `verify_after_mutation` on, the replay is also compared with the stored
/// wallets; a difference is a bug in the incremental path.
pub(crate) fn verify_after_mutation(conn: &Connection, config: &Config, asset_id: i64) -> Result<()> {
    let replayed = match rebuild::replay_asset(conn, asset_id) {
        Ok(outcome) => outcome,
        Err(e) if e.is_validation() => {
            return Err(LedgerError::validation(format!(
                "change would leave the transaction log unreplayable: {}",
                e
            )))
        }
        Err(e) => return Err(e),
    };
    if !config.verify_after_mutation {
        return Ok(());
    }
    let stored = crate::db::wallets::load_book(conn, asset_id)?;
    let differences = stored.diff(&replayed.book);
    if !differences.is_empty() {
        return Err(LedgerError::consistency(format!(
            "asset {} wallets differ from replay: {}",
            asset_id,
            differences.join("; ")
        )));
    }
    Ok(())
}

/// Finite and > 0.
pub(crate) fn require_positive(field: &str, value: Option<f64>) -> Result<f64> {
    match value {
        Some(v) if v.is_finite() && v > 0.0 => Ok(v),
        Some(v) => Err(LedgerError::validation(format!(
            "{} must be positive, got {}",
            field, v
        ))),
        None => Err(LedgerError::validation(format!("{} is required", field))),
    }
}

/// Finite and >= 0.
pub(crate) fn require_non_negative(field: &str, value: Option<f64>) -> Result<f64> {
    match value {
        Some(v) if v.is_finite() && v >= 0.0 => Ok(v),
        Some(v) => Err(LedgerError::validation(format!(
            "{} must not be negative, got {}",
            field, v
        ))),
        None => Err(LedgerError::validation(format!("{} is required", field))),
    }
}
