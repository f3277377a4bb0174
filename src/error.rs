//! Error taxonomy for the lot ledger.
//!
//! Validation errors are raised before any mutation touches the store, so a
//! rejected request never leaves partial state behind.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, LedgerError>;

#[derive(Debug, Error)]
pub enum LedgerError {
    /// Request rejected at the boundary (bad numbers, allocation > 100%, ...)
    #[error("validation failed: {0}")]
    Validation(String),

    /// Sell quantity exceeds what the targeted wallet holds
    #[error("insufficient shares in wallet {wallet_id}: requested {requested}, available {available}")]
    InsufficientShares {
        wallet_id: i64,
        requested: f64,
        available: f64,
    },

    #[error("{entity} with id {id} not found")]
    NotFound { entity: &'static str, id: i64 },

    /// Price snapshot batch failure; recovered per batch, never aborts a refresh
    #[error("price fetch failed for {symbols:?}: {reason}")]
    ExternalFetch { symbols: Vec<String>, reason: String },

    /// Wallet state diverges from what the transaction log replays to
    #[error("consistency violation: {0}")]
    ConsistencyViolation(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
}

impl LedgerError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(entity: &'static str, id: i64) -> Self {
        Self::NotFound { entity, id }
    }

    /// Logs the violation at error level before handing it back.
    pub fn consistency(msg: impl Into<String>) -> Self {
        let msg = msg.into();
        log::error!("CONSISTENCY VIOLATION: {}", msg);
        Self::ConsistencyViolation(msg)
    }

    /// True for the rejection kinds that happen before any mutation.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::Validation(_) | Self::InsufficientShares { .. }
        )
    }
}
