//! Allocation engine: splits one BUY across the asset's profit targets and
//! upserts a wallet per (asset, purchase price, profit target).
//!
//! - Targets the user gave a percentage (> 0) for keep it
//! - The rest share whatever is left of 100% equally
//! - An asset without profit targets gets one implicit 100% target
//! - Shares per target are rounded to 5 decimal places

use crate::error::{LedgerError, Result};
use crate::models::{round_allocation_shares, ProfitTarget};
use crate::wallets::{WalletBook, WalletKey};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

const PERCENT_TOLERANCE: f64 = 1e-9;

/// `purchase × (1 + target%) / (1 − commission%)`: the sell price that still
/// yields the target after commission is deducted from the proceeds.
pub fn profit_target_price(purchase_price: f64, target_percent: f64, commission: f64) -> f64 {
    purchase_price * (1.0 + target_percent / 100.0) / (1.0 - commission / 100.0)
}

/// Current target percents and commission of one asset; derives the profit
/// target price for any wallet key.
#[derive(Debug, Clone, Default)]
pub struct TargetPricing {
    commission: f64,
    target_percents: HashMap<i64, f64>,
}

impl TargetPricing {
    pub fn new(commission: f64, targets: &[ProfitTarget]) -> Self {
        Self {
            commission,
            target_percents: targets.iter().map(|t| (t.id, t.percent)).collect(),
        }
    }

    pub fn commission(&self) -> f64 {
        self.commission
    }

    pub fn target_percent(&self, profit_target_id: Option<i64>) -> f64 {
        match profit_target_id {
            None => 0.0,
            Some(id) => match self.target_percents.get(&id) {
                Some(p) => *p,
                None => {
                    log::warn!("Profit target {} no longer exists, pricing lot at 0%", id);
                    0.0
                }
            },
        }
    }

    pub fn price_for(&self, key: &WalletKey) -> f64 {
        profit_target_price(
            key.purchase_price(),
            self.target_percent(key.profit_target_id),
            self.commission,
        )
    }
}

/// One target's share of a BUY, before it is applied to the lot store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlannedAllocation {
    pub profit_target_id: Option<i64>,
    pub percentage: f64,
    /// × 10^8, rounded to the allocation precision
    pub shares: i64,
}

/// A planned allocation after its wallet was upserted.
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedAllocation {
    pub plan: PlannedAllocation,
    pub key: WalletKey,
    pub wallet_id: i64,
}

/// Percentages to feed the engine: the request's own when it carries any,
/// otherwise each target's default allocation.
pub fn requested_percentages(
    targets: &[ProfitTarget],
    explicit: Option<&HashMap<i64, f64>>,
) -> HashMap<i64, f64> {
    match explicit {
        Some(map) if !map.is_empty() => map.clone(),
        _ => targets
            .iter()
            .filter_map(|t| {
                t.default_allocation
                    .filter(|p| *p > 0.0)
                    .map(|p| (t.id, p))
            })
            .collect(),
    }
}

/// Float sums of equal shares can land an ulp above 100; trim `percentages[absorber]`
/// until the total is within bounds.
fn cap_at_hundred(percentages: &mut [f64], absorber: usize) {
    let total: f64 = percentages.iter().sum();
    if total <= 100.0 {
        return;
    }
    percentages[absorber] = (percentages[absorber] - (total - 100.0)).max(0.0);
    for _ in 0..8 {
        let total: f64 = percentages.iter().sum();
        let value = percentages[absorber];
        if total <= 100.0 || value <= 0.0 {
            break;
        }
        percentages[absorber] = f64::from_bits(value.to_bits() - 1);
    }
}

/// Work out each target's percentage and share count for a BUY.
pub fn plan_allocations(
    price: f64,
    investment: f64,
    targets: &[ProfitTarget],
    requested: &HashMap<i64, f64>,
) -> Result<Vec<PlannedAllocation>> {
    if !price.is_finite() || price <= 0.0 {
        return Err(LedgerError::validation(format!(
            "BUY needs a positive price, got {}",
            price
        )));
    }
    if !investment.is_finite() || investment <= 0.0 {
        return Err(LedgerError::validation(format!(
            "BUY needs a positive investment, got {}",
            investment
        )));
    }
    let total_shares = investment / price;

    for (id, pct) in requested {
        if !targets.iter().any(|t| t.id == *id) {
            return Err(LedgerError::validation(format!(
                "profit target {} is not configured for this asset",
                id
            )));
        }
        if !pct.is_finite() || *pct < 0.0 {
            return Err(LedgerError::validation(format!(
                "allocation for profit target {} must be non-negative, got {}",
                id, pct
            )));
        }
    }

    if targets.is_empty() {
        return Ok(vec![PlannedAllocation {
            profit_target_id: None,
            percentage: 100.0,
            shares: round_allocation_shares(total_shares),
        }]);
    }

    let mut ordered: Vec<&ProfitTarget> = targets.iter().collect();
    ordered.sort_by_key(|t| (t.sort_order, t.id));

    let specified_total: f64 = ordered
        .iter()
        .filter_map(|t| requested.get(&t.id).filter(|p| **p > 0.0))
        .sum();
    if specified_total > 100.0 + PERCENT_TOLERANCE {
        return Err(LedgerError::validation(format!(
            "allocations sum to {:.4}%, more than 100%",
            specified_total
        )));
    }

    let unspecified = ordered
        .iter()
        .filter(|t| requested.get(&t.id).map_or(true, |p| *p <= 0.0))
        .count();
    let remaining = (100.0 - specified_total).max(0.0);
    if unspecified == 0 && remaining > PERCENT_TOLERANCE {
        return Err(LedgerError::validation(format!(
            "allocations cover only {:.4}% and no profit target is left to take the remaining {:.4}%",
            specified_total, remaining
        )));
    }
    let share_of_rest = if unspecified > 0 {
        remaining / unspecified as f64
    } else {
        0.0
    };

    let mut percentages: Vec<f64> = ordered
        .iter()
        .map(|t| match requested.get(&t.id) {
            Some(p) if *p > 0.0 => *p,
            _ => share_of_rest,
        })
        .collect();
    let last_unspecified = ordered
        .iter()
        .rposition(|t| requested.get(&t.id).map_or(true, |p| *p <= 0.0));
    if let Some(last) = last_unspecified {
        percentages[last] = (remaining - share_of_rest * (unspecified - 1) as f64).max(0.0);
        cap_at_hundred(&mut percentages, last);
    }

    let plans: Vec<PlannedAllocation> = ordered
        .iter()
        .zip(percentages)
        .map(|(t, percentage)| PlannedAllocation {
            profit_target_id: Some(t.id),
            percentage,
            shares: round_allocation_shares(percentage / 100.0 * total_shares),
        })
        .filter(|p| p.shares > 0)
        .collect();

    if plans.is_empty() {
        return Err(LedgerError::validation(format!(
            "investment {} at price {} buys no shares at allocation precision",
            investment, price
        )));
    }
    Ok(plans)
}

/// Upsert one wallet per planned allocation.
pub fn apply_allocations(
    book: &mut WalletBook,
    asset_id: i64,
    price: f64,
    plans: &[PlannedAllocation],
    pricing: &TargetPricing,
) -> Vec<AppliedAllocation> {
    plans
        .iter()
        .map(|plan| {
            let key = WalletKey::new(asset_id, price, plan.profit_target_id);
            let wallet_id = book.apply_delta(key, plan.shares, pricing.price_for(&key), None);
            log::debug!(
                "Allocated {} shares of asset {} at {} to target {:?} (wallet {})",
                plan.shares,
                asset_id,
                price,
                plan.profit_target_id,
                wallet_id
            );
            AppliedAllocation {
                plan: plan.clone(),
                key,
                wallet_id,
            }
        })
        .collect()
}
