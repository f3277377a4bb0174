//! Domain records: assets, entry/profit targets, transactions, allocations
//! and yearly budgets.
//!
//! Share quantities and wallet price keys are fixed-point integers (× 10^8)
//! so lot keys never depend on floating-point equality. Money amounts are
//! plain `f64`.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Scale for share quantities (10^8)
pub const SHARES_SCALE: i64 = 100_000_000;
/// Scale for wallet price keys (10^8)
pub const PRICE_SCALE: i64 = 100_000_000;
/// Allocated shares are rounded to 5 decimal places
pub const ALLOCATION_DECIMALS: u32 = 5;
/// Share remainders at or below this (1e-6 shares) count as empty
pub const SHARES_EPSILON: i64 = 100;

pub fn shares_to_db(shares: f64) -> i64 {
    (shares * SHARES_SCALE as f64).round() as i64
}

pub fn shares_from_db(value: i64) -> f64 {
    value as f64 / SHARES_SCALE as f64
}

pub fn price_to_db(price: f64) -> i64 {
    (price * PRICE_SCALE as f64).round() as i64
}

pub fn price_from_db(value: i64) -> f64 {
    value as f64 / PRICE_SCALE as f64
}

/// Round a share count to the allocation precision, returning scaled units.
pub fn round_allocation_shares(shares: f64) -> i64 {
    let factor = 10f64.powi(ALLOCATION_DECIMALS as i32);
    let rounded = (shares * factor).round();
    (rounded as i64) * (SHARES_SCALE / factor as i64)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AssetStatus {
    Active,
    Hidden,
    Archived,
}

impl AssetStatus {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "ACTIVE" => Some(Self::Active),
            "HIDDEN" => Some(Self::Hidden),
            "ARCHIVED" => Some(Self::Archived),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::Hidden => "HIDDEN",
            Self::Archived => "ARCHIVED",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Asset {
    pub id: i64,
    pub symbol: String,
    pub name: String,
    /// Commission in percent of the traded value
    pub commission: Option<f64>,
    /// Manual price override used instead of the feed (testing)
    pub test_price: Option<f64>,
    pub status: AssetStatus,
}

impl Asset {
    pub fn commission_rate(&self) -> f64 {
        self.commission.unwrap_or(0.0)
    }

    pub fn is_active(&self) -> bool {
        self.status == AssetStatus::Active
    }
}

/// Pullback-buy trigger: percent below the last buy price
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryTarget {
    pub id: i64,
    pub asset_id: i64,
    pub percent: f64,
    pub sort_order: i64,
}

/// Profit-taking level: percent above the purchase price
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfitTarget {
    pub id: i64,
    pub asset_id: i64,
    pub percent: f64,
    pub default_allocation: Option<f64>,
    pub sort_order: i64,
}

/// The entry target with the lowest sort order drives signal coloring.
pub fn primary_entry_target(targets: &[EntryTarget]) -> Option<&EntryTarget> {
    targets.iter().min_by_key(|t| (t.sort_order, t.id))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionType {
    Buy,
    Sell,
    Dividend,
    Split,
    /// Securities lending payment
    Slp,
}

impl TransactionType {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "BUY" => Some(Self::Buy),
            "SELL" => Some(Self::Sell),
            "DIVIDEND" => Some(Self::Dividend),
            "SPLIT" => Some(Self::Split),
            "SLP" => Some(Self::Slp),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Buy => "BUY",
            Self::Sell => "SELL",
            Self::Dividend => "DIVIDEND",
            Self::Split => "SPLIT",
            Self::Slp => "SLP",
        }
    }

    /// Same-day ordering used when replaying wallets: splits take effect at
    /// the start of the day, sells come last.
    pub fn replay_rank(&self) -> u8 {
        match self {
            Self::Split => 0,
            Self::Buy => 1,
            Self::Dividend | Self::Slp => 2,
            Self::Sell => 3,
        }
    }
}

/// A transaction row. Which optional fields are populated depends on the type:
/// BUY uses price/investment (+ target snapshot), SELL uses price/quantity and
/// records the lot it sold from, DIVIDEND/SLP use amount, SPLIT uses ratio.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub id: i64,
    pub asset_id: i64,
    pub txn_type: TransactionType,
    pub date: NaiveDate,
    pub signal: Option<String>,
    pub price: Option<f64>,
    /// SELL quantity (× 10^8)
    pub quantity: Option<i64>,
    pub investment: Option<f64>,
    /// DIVIDEND/SLP payment, or net SELL proceeds
    pub amount: Option<f64>,
    pub split_ratio: Option<f64>,
    /// Primary entry-target percent active at BUY time
    pub entry_target_percent: Option<f64>,
    /// Limit-buy-down price computed at BUY time
    pub lbd_price: Option<f64>,
    /// Profit target of a single-target BUY (multi-target BUYs use allocation rows)
    pub profit_target_id: Option<i64>,
    /// Wallet a SELL was taken from
    pub wallet_id: Option<i64>,
    /// Lot key at sell time, kept so the sell can be reversed after the wallet closed
    pub lot_price_key: Option<i64>,
    pub lot_profit_target_id: Option<i64>,
    pub cost_basis: Option<f64>,
    pub realized_pnl: Option<f64>,
}

impl Transaction {
    pub fn new(asset_id: i64, txn_type: TransactionType, date: NaiveDate) -> Self {
        Self {
            id: 0,
            asset_id,
            txn_type,
            date,
            signal: None,
            price: None,
            quantity: None,
            investment: None,
            amount: None,
            split_ratio: None,
            entry_target_percent: None,
            lbd_price: None,
            profit_target_id: None,
            wallet_id: None,
            lot_price_key: None,
            lot_profit_target_id: None,
            cost_basis: None,
            realized_pnl: None,
        }
    }

    pub fn quantity_shares(&self) -> Option<f64> {
        self.quantity.map(shares_from_db)
    }

    /// Total shares a BUY purchases (investment / price).
    pub fn purchased_shares(&self) -> Option<f64> {
        match (self.price, self.investment) {
            (Some(p), Some(i)) if p > 0.0 => Some(i / p),
            _ => None,
        }
    }
}

/// Per-target split of a multi-target BUY
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionAllocation {
    pub id: i64,
    pub transaction_id: i64,
    pub profit_target_id: i64,
    pub wallet_id: i64,
    pub percentage: f64,
    /// × 10^8
    pub shares: i64,
}

impl TransactionAllocation {
    pub fn shares_f64(&self) -> f64 {
        shares_from_db(self.shares)
    }
}

/// Per-asset, per-year out-of-pocket cap (reporting only)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct YearlyBudget {
    pub id: i64,
    pub asset_id: i64,
    pub year: i32,
    pub max_oop: f64,
}
